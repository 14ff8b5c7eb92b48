use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::PgPool;
use study_core::{ConnectionBackend, ConnectionConfig, TenancyError, TenancyResult, TenantAlias};
use tracing::{debug, info};

use crate::error::{catalog_error, connectivity_error};
use crate::pool::{lazy_pool, open_pool, PgPoolSettings};
use crate::sql;

/// Physical pools behind the registry's logical registrations.
///
/// `check` connects once and lets go; `open` installs a lazy pool for each
/// new registration, tagged with its generation; `close` shuts down only
/// the pool of the generation being evicted. DDL that must run outside a
/// tenant database goes through the catalog pool.
pub struct PgBackend {
    catalog: PgPool,
    settings: PgPoolSettings,
    pools: RwLock<HashMap<String, (u64, PgPool)>>,
}

impl PgBackend {
    pub fn new(catalog: PgPool, settings: PgPoolSettings) -> Self {
        Self {
            catalog,
            settings,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Open pool for a registered tenant config.
    pub fn pool_for(&self, config: &ConnectionConfig) -> Option<PgPool> {
        match config.alias {
            None => Some(self.catalog.clone()),
            Some(ref alias) => self
                .pools
                .read()
                .get(alias.as_str())
                .map(|(_, pool)| pool.clone()),
        }
    }

    pub fn open_pools(&self) -> usize {
        self.pools.read().len()
    }

    fn identifier(raw: &str) -> TenancyResult<TenantAlias> {
        TenantAlias::parse(raw)
    }
}

async fn run_statements(pool: &PgPool, statements: &[String], alias: &TenantAlias) -> TenancyResult<()> {
    for statement in statements {
        sqlx::raw_sql(statement)
            .execute(pool)
            .await
            .map_err(|err| connectivity_error(alias.as_str(), err))?;
    }
    Ok(())
}

#[async_trait]
impl ConnectionBackend for PgBackend {
    async fn check(&self, config: &ConnectionConfig) -> TenancyResult<()> {
        let pool = open_pool(config, &self.settings).await?;
        let checked = sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|err| connectivity_error(config.label(), err));
        pool.close().await;
        checked?;

        debug!(alias = config.label(), database = %config.database, "tenant database reachable");
        Ok(())
    }

    fn open(&self, config: &ConnectionConfig, generation: u64) -> TenancyResult<()> {
        let pool = lazy_pool(config, &self.settings);
        let replaced = self
            .pools
            .write()
            .insert(config.label().to_string(), (generation, pool));

        if let Some((stale, pool)) = replaced {
            debug!(alias = config.label(), stale, "replacing tenant pool");
            tokio::spawn(async move { pool.close().await });
        }
        debug!(alias = config.label(), generation, "tenant pool opened");
        Ok(())
    }

    async fn ensure_schema(&self, config: &ConnectionConfig, alias: &TenantAlias) -> TenancyResult<()> {
        let schema = Self::identifier(config.data_schema())?;

        let mut statements = vec![sql::create_schema(&schema)];
        statements.extend(sql::grant_schema(&schema, &config.user));

        match self.pool_for(config) {
            Some(pool) => run_statements(&pool, &statements, alias).await?,
            None => {
                let pool = open_pool(config, &self.settings).await?;
                let result = run_statements(&pool, &statements, alias).await;
                pool.close().await;
                result?;
            }
        }

        info!(alias = %alias, schema = %schema, "tenant schema ensured");
        Ok(())
    }

    async fn database_exists(&self, config: &ConnectionConfig) -> TenancyResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(sql::DATABASE_EXISTS)
            .bind(&config.database)
            .fetch_one(&self.catalog)
            .await
            .map_err(catalog_error)?;
        Ok(exists)
    }

    async fn create_database(&self, config: &ConnectionConfig) -> TenancyResult<()> {
        let database = Self::identifier(&config.database)?;
        let statement = sql::create_database(&database, &config.user);

        sqlx::raw_sql(&statement)
            .execute(&self.catalog)
            .await
            .map_err(|err| TenancyError::connectivity(config.label(), err))?;
        Ok(())
    }

    async fn close(&self, config: &ConnectionConfig, generation: u64) {
        let Some(ref alias) = config.alias else {
            return;
        };
        let pool = {
            let mut pools = self.pools.write();
            let current = pools.get(alias.as_str()).map(|(current, _)| *current);
            if current == Some(generation) {
                pools.remove(alias.as_str())
            } else {
                None
            }
        };
        if let Some((_, pool)) = pool {
            pool.close().await;
            debug!(alias = %alias, "tenant pool closed");
        }
    }
}
