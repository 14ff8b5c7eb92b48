//! Connection registry.
//!
//! A bounded table of live per-tenant connection configurations. At most
//! `max_connections` tenants are registered at once; when full, the least
//! recently used registration with no borrowers is evicted. A registration
//! that is in use is never evicted: the caller gets `Capacity` instead.
//!
//! All mutation goes through one `parking_lot::Mutex`, which is never held
//! across an `.await`. Cold builds (config construction plus connectivity
//! check) run outside the lock. Concurrent callers for the same alias share
//! one `OnceCell`, so a cold build runs once per config TTL window.
//! Physical resources follow registrations, not builds: every new
//! registration gets its own generation, opened through the backend and
//! closed by that generation when evicted.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::ConnectionBackend;
use crate::config::{ConnectionSettings, PoolSettings};
use crate::connection::ConnectionConfig;
use crate::errors::{TenancyError, TenancyResult};
use crate::routing::{Route, RoutingContext};
use crate::tenant::{Tenant, TenantAlias};

type ConfigCell = Arc<OnceCell<Arc<ConnectionConfig>>>;

struct Registration {
    config: Arc<ConnectionConfig>,
    generation: u64,
    usage: u64,
    last_used: Instant,
}

struct CachedConfig {
    cell: ConfigCell,
    created_at: Instant,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<TenantAlias, Registration>,
    config_cache: HashMap<TenantAlias, CachedConfig>,
    errors: HashMap<TenantAlias, u64>,
}

impl RegistryState {
    /// Bump usage of an existing registration.
    fn borrow_existing(&mut self, alias: &TenantAlias) -> Option<Arc<ConnectionConfig>> {
        let entry = self.entries.get_mut(alias)?;
        entry.usage += 1;
        entry.last_used = Instant::now();
        Some(Arc::clone(&entry.config))
    }

    /// Cached build cell for `alias`, replaced once older than `ttl`.
    fn config_cell(&mut self, alias: &TenantAlias, ttl: std::time::Duration) -> ConfigCell {
        let now = Instant::now();
        let fresh = self
            .config_cache
            .get(alias)
            .filter(|cached| now.duration_since(cached.created_at) < ttl)
            .map(|cached| Arc::clone(&cached.cell));

        match fresh {
            Some(cell) => cell,
            None => {
                let cell: ConfigCell = Arc::new(OnceCell::new());
                self.config_cache.insert(
                    alias.clone(),
                    CachedConfig {
                        cell: Arc::clone(&cell),
                        created_at: now,
                    },
                );
                cell
            }
        }
    }

    /// Drop a cell that failed to build, unless it was already replaced.
    fn forget_cell(&mut self, alias: &TenantAlias, cell: &ConfigCell) {
        let same = self
            .config_cache
            .get(alias)
            .map(|cached| Arc::ptr_eq(&cached.cell, cell))
            .unwrap_or(false);
        if same {
            self.config_cache.remove(alias);
        }
    }

    fn least_recently_used_idle(&self) -> Option<TenantAlias> {
        self.entries
            .iter()
            .filter(|(_, reg)| reg.usage == 0)
            .min_by_key(|(_, reg)| reg.last_used)
            .map(|(alias, _)| alias.clone())
    }
}

/// Point-in-time view for health and readiness tooling.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub registered: usize,
    pub max_connections: usize,
    pub per_tenant_usage: BTreeMap<String, u64>,
    pub errors: BTreeMap<String, u64>,
    pub total_errors: u64,
    pub cold_builds: u64,
    pub evictions: u64,
    pub capacity_rejections: u64,
}

pub struct ConnectionRegistry {
    settings: ConnectionSettings,
    pool: PoolSettings,
    backend: Arc<dyn ConnectionBackend>,
    catalog_config: Arc<ConnectionConfig>,
    state: Mutex<RegistryState>,
    generations: AtomicU64,
    cold_builds: AtomicU64,
    evictions: AtomicU64,
    capacity_rejections: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(
        settings: ConnectionSettings,
        pool: PoolSettings,
        backend: Arc<dyn ConnectionBackend>,
    ) -> TenancyResult<Self> {
        let catalog_config = Arc::new(ConnectionConfig::catalog(&settings)?);
        Ok(Self {
            settings,
            pool,
            backend,
            catalog_config,
            state: Mutex::new(RegistryState::default()),
            generations: AtomicU64::new(0),
            cold_builds: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            capacity_rejections: AtomicU64::new(0),
        })
    }

    pub fn max_connections(&self) -> usize {
        self.pool.max_connections
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Register (or borrow) the connection for `alias`.
    ///
    /// Every successful call must be paired with [`ConnectionRegistry::release`];
    /// prefer [`ConnectionRegistry::acquire`], which pairs them for you.
    pub async fn register(&self, alias: &str) -> TenancyResult<()> {
        let alias = TenantAlias::parse(alias)?;
        self.register_alias(&alias, None).await.map(|_| ())
    }

    /// Like [`ConnectionRegistry::register`], using the catalog's database name.
    pub async fn register_tenant(&self, tenant: &Tenant) -> TenancyResult<TenantAlias> {
        let alias = tenant.alias()?;
        self.register_alias(&alias, Some(&tenant.database_name)).await?;
        Ok(alias)
    }

    /// Register and wrap the borrow in a lease that releases on drop.
    pub async fn acquire(self: &Arc<Self>, alias: &str) -> TenancyResult<ConnectionLease> {
        let alias = TenantAlias::parse(alias)?;
        let config = self.register_alias(&alias, None).await?;
        Ok(ConnectionLease::new(Arc::clone(self), alias, config))
    }

    pub async fn acquire_tenant(self: &Arc<Self>, tenant: &Tenant) -> TenancyResult<ConnectionLease> {
        let alias = tenant.alias()?;
        let config = self.register_alias(&alias, Some(&tenant.database_name)).await?;
        Ok(ConnectionLease::new(Arc::clone(self), alias, config))
    }

    async fn register_alias(
        &self,
        alias: &TenantAlias,
        database_hint: Option<&str>,
    ) -> TenancyResult<Arc<ConnectionConfig>> {
        let cell = {
            let mut state = self.state.lock();
            if let Some(config) = state.borrow_existing(alias) {
                return Ok(config);
            }
            state.config_cell(alias, self.pool.config_ttl)
        };

        let built = cell
            .get_or_try_init(|| self.cold_build(alias, database_hint))
            .await
            .map(Arc::clone);

        let config = match built {
            Ok(config) => config,
            Err(err) => {
                let mut state = self.state.lock();
                state.forget_cell(alias, &cell);
                *state.errors.entry(alias.clone()).or_default() += 1;
                drop(state);
                warn!(alias = %alias, %err, "tenant connection build failed");
                return Err(err);
            }
        };

        let evicted = {
            let mut state = self.state.lock();

            // another caller may have finished registering while we built
            if let Some(config) = state.borrow_existing(alias) {
                return Ok(config);
            }

            let victim = if state.entries.len() >= self.pool.max_connections {
                match state.least_recently_used_idle() {
                    Some(victim) => Some(victim),
                    None => {
                        self.capacity_rejections.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            alias = %alias,
                            max = self.pool.max_connections,
                            "connection registry full, every registration in use"
                        );
                        return Err(TenancyError::capacity(self.pool.max_connections));
                    }
                }
            } else {
                None
            };

            // also for configs served from the cache, which skip `check`
            let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
            if let Err(err) = self.backend.open(&config, generation) {
                *state.errors.entry(alias.clone()).or_default() += 1;
                warn!(alias = %alias, %err, "tenant connection open failed");
                return Err(err);
            }

            let evicted = victim.and_then(|victim| state.entries.remove(&victim).map(|reg| (victim, reg)));
            state.entries.insert(
                alias.clone(),
                Registration {
                    config: Arc::clone(&config),
                    generation,
                    usage: 1,
                    last_used: Instant::now(),
                },
            );
            evicted
        };

        if let Some((victim, registration)) = evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            info!(evicted = %victim, for_alias = %alias, "evicted idle tenant connection");
            self.backend
                .close(&registration.config, registration.generation)
                .await;
        }

        debug!(alias = %alias, "tenant connection registered");
        Ok(config)
    }

    async fn cold_build(
        &self,
        alias: &TenantAlias,
        database_hint: Option<&str>,
    ) -> TenancyResult<Arc<ConnectionConfig>> {
        self.cold_builds.fetch_add(1, Ordering::Relaxed);

        let config = ConnectionConfig::for_tenant(&self.settings, alias, database_hint)?;

        match tokio::time::timeout(self.settings.connect_timeout, self.backend.check(&config)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(TenancyError::connectivity(
                    alias.as_str(),
                    "connectivity check timed out",
                ))
            }
        }

        debug!(alias = %alias, database = %config.database, "tenant connection config built");
        Ok(Arc::new(config))
    }

    /// Return one borrow. Never closes the connection.
    pub fn release(&self, alias: &TenantAlias) {
        let mut state = self.state.lock();
        match state.entries.get_mut(alias) {
            Some(entry) if entry.usage > 0 => {
                entry.usage -= 1;
                entry.last_used = Instant::now();
            }
            Some(_) => warn!(alias = %alias, "release without a matching register"),
            None => debug!(alias = %alias, "release of an unregistered alias"),
        }
    }

    /// Connection config for a route; the catalog for `Route::Catalog`.
    pub fn resolve(&self, route: &Route) -> Option<Arc<ConnectionConfig>> {
        match route {
            Route::Catalog => Some(Arc::clone(&self.catalog_config)),
            Route::Tenant(alias) => {
                let mut state = self.state.lock();
                let entry = state.entries.get_mut(alias)?;
                entry.last_used = Instant::now();
                Some(Arc::clone(&entry.config))
            }
        }
    }

    /// What the data-access layer calls before every query.
    pub fn current_connection(&self) -> Option<Arc<ConnectionConfig>> {
        self.resolve(&RoutingContext::current())
    }

    /// Count a failure observed while using a registered connection.
    pub fn record_error(&self, alias: &TenantAlias) {
        *self.state.lock().errors.entry(alias.clone()).or_default() += 1;
    }

    pub fn is_registered(&self, alias: &TenantAlias) -> bool {
        self.state.lock().entries.contains_key(alias)
    }

    pub fn usage(&self, alias: &TenantAlias) -> Option<u64> {
        self.state.lock().entries.get(alias).map(|reg| reg.usage)
    }

    /// Idempotently create the tenant's schema and grants.
    pub async fn ensure_schema(&self, alias: &str) -> TenancyResult<()> {
        let alias = TenantAlias::parse(alias)?;
        let registered = self
            .state
            .lock()
            .entries
            .get(&alias)
            .map(|reg| Arc::clone(&reg.config));

        let config = match registered {
            Some(config) => config,
            None => Arc::new(ConnectionConfig::for_tenant(&self.settings, &alias, None)?),
        };

        self.backend.ensure_schema(&config, &alias).await?;
        debug!(alias = %alias, schema = config.data_schema(), "tenant schema ensured");
        Ok(())
    }

    /// Provisioning entrypoint: create the physical database and its schema.
    ///
    /// The identifier is validated before any connection is attempted.
    /// Safe to call repeatedly.
    pub async fn create_tenant_database(&self, alias: &str) -> TenancyResult<()> {
        let alias = TenantAlias::parse(alias)?;
        let config = ConnectionConfig::for_tenant(&self.settings, &alias, None)?;

        if self.backend.database_exists(&config).await? {
            debug!(alias = %alias, database = %config.database, "tenant database already exists");
        } else {
            self.backend.create_database(&config).await?;
            info!(alias = %alias, database = %config.database, "tenant database created");
        }

        self.backend.ensure_schema(&config, &alias).await?;
        Ok(())
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        let per_tenant_usage = state
            .entries
            .iter()
            .map(|(alias, reg)| (alias.to_string(), reg.usage))
            .collect();
        let errors: BTreeMap<String, u64> = state
            .errors
            .iter()
            .map(|(alias, n)| (alias.to_string(), *n))
            .collect();

        RegistryStats {
            registered: state.entries.len(),
            max_connections: self.pool.max_connections,
            per_tenant_usage,
            total_errors: errors.values().sum(),
            errors,
            cold_builds: self.cold_builds.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            capacity_rejections: self.capacity_rejections.load(Ordering::Relaxed),
        }
    }

    /// Close every registration. Used on process shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<(TenantAlias, Registration)> = {
            let mut state = self.state.lock();
            state.config_cache.clear();
            state.entries.drain().collect()
        };

        for (alias, registration) in drained {
            if registration.usage > 0 {
                warn!(alias = %alias, usage = registration.usage, "closing connection still in use");
            }
            self.backend
                .close(&registration.config, registration.generation)
                .await;
        }
        info!("connection registry shut down");
    }
}

/// One borrow of a registered tenant connection.
///
/// Dropping the lease releases the borrow, so error returns, panics and
/// cancelled requests all give the usage count back.
pub struct ConnectionLease {
    registry: Arc<ConnectionRegistry>,
    alias: TenantAlias,
    config: Arc<ConnectionConfig>,
    released: bool,
}

impl ConnectionLease {
    fn new(registry: Arc<ConnectionRegistry>, alias: TenantAlias, config: Arc<ConnectionConfig>) -> Self {
        Self {
            registry,
            alias,
            config,
            released: false,
        }
    }

    pub fn alias(&self) -> &TenantAlias {
        &self.alias
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.release(&self.alias);
        }
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("alias", &self.alias)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.release_once();
    }
}
