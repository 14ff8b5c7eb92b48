use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use study_core::{
    DatabaseProbe, Membership, SiteScope, TenancyError, TenancyResult, Tenant, TenantCatalog,
    TenantId, TenantStatus,
};
use tracing::{debug, warn};

use crate::error::{catalog_error, is_lock_not_available};
use crate::sql;

type TenantRow = (i64, String, String, String);
type MembershipRow = (i64, i64, String, bool, bool, Option<DateTime<Utc>>);

/// Tenant and membership records in the catalog database.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn membership_sites<'e, E>(executor: E, user_id: i64, tenant_id: TenantId) -> TenancyResult<BTreeSet<String>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let rows: Vec<(String,)> = sqlx::query_as(sql::MEMBERSHIP_SITES)
            .bind(user_id)
            .bind(tenant_id.0)
            .fetch_all(executor)
            .await
            .map_err(catalog_error)?;
        Ok(rows.into_iter().map(|(code,)| code).collect())
    }
}

fn tenant_from_row((id, code, database_name, status): TenantRow) -> Option<Tenant> {
    let Some(status) = TenantStatus::parse(&status) else {
        warn!(tenant_id = id, %status, "unknown tenant status in catalog");
        return None;
    };
    Some(Tenant {
        id: TenantId(id),
        code,
        database_name,
        status,
    })
}

fn membership_from_row(row: MembershipRow, sites: BTreeSet<String>) -> Membership {
    let (user_id, tenant_id, role, all_sites, is_active, expires_at) = row;
    Membership {
        user_id,
        tenant_id: TenantId(tenant_id),
        role,
        site_scope: if all_sites {
            SiteScope::AllSites
        } else {
            SiteScope::Sites(sites)
        },
        is_active,
        expires_at,
    }
}

#[async_trait]
impl TenantCatalog for PgCatalog {
    async fn activatable_tenants(&self) -> TenancyResult<Vec<Tenant>> {
        let rows: Vec<TenantRow> = sqlx::query_as(sql::ACTIVATABLE_TENANTS)
            .fetch_all(&self.pool)
            .await
            .map_err(catalog_error)?;
        Ok(rows.into_iter().filter_map(tenant_from_row).collect())
    }

    async fn tenant(&self, id: TenantId) -> TenancyResult<Option<Tenant>> {
        let row: Option<TenantRow> = sqlx::query_as(sql::TENANT_BY_ID)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(catalog_error)?;
        Ok(row.and_then(tenant_from_row))
    }

    async fn lock_membership(&self, user_id: i64, tenant_id: TenantId) -> TenancyResult<Option<Membership>> {
        let mut tx = self.pool.begin().await.map_err(catalog_error)?;

        let row: Option<MembershipRow> = match sqlx::query_as(sql::MEMBERSHIP_FOR_UPDATE_NOWAIT)
            .bind(user_id)
            .bind(tenant_id.0)
            .fetch_optional(&mut *tx)
            .await
        {
            Ok(row) => row,
            Err(err) if is_lock_not_available(&err) => {
                debug!(user_id, %tenant_id, "membership row locked by another request");
                return Err(TenancyError::race_loss(user_id, tenant_id.0));
            }
            Err(err) => return Err(catalog_error(err)),
        };

        let membership = match row {
            Some(row) => {
                let sites = Self::membership_sites(&mut *tx, user_id, tenant_id).await?;
                Some(membership_from_row(row, sites))
            }
            None => None,
        };

        tx.commit().await.map_err(catalog_error)?;
        Ok(membership)
    }

    async fn find_membership(&self, user_id: i64, tenant_id: TenantId) -> TenancyResult<Option<Membership>> {
        let row: Option<MembershipRow> = sqlx::query_as(sql::MEMBERSHIP)
            .bind(user_id)
            .bind(tenant_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(catalog_error)?;

        match row {
            Some(row) => {
                let sites = Self::membership_sites(&self.pool, user_id, tenant_id).await?;
                Ok(Some(membership_from_row(row, sites)))
            }
            None => Ok(None),
        }
    }

    async fn active_membership_count(&self, user_id: i64) -> TenancyResult<usize> {
        let (count,): (i64,) = sqlx::query_as(sql::ACTIVE_MEMBERSHIP_COUNT)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(catalog_error)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn site_codes(&self, tenant_id: TenantId) -> TenancyResult<BTreeSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(sql::TENANT_SITES)
            .bind(tenant_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(catalog_error)?;
        Ok(rows.into_iter().map(|(code,)| code).collect())
    }
}

/// Batched `pg_database` lookup over the catalog connection.
#[derive(Clone)]
pub struct PgProbe {
    pool: PgPool,
}

impl PgProbe {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabaseProbe for PgProbe {
    async fn existing_databases(&self, names: &[String]) -> TenancyResult<BTreeSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(sql::EXISTING_DATABASES)
            .bind(names)
            .fetch_all(&self.pool)
            .await
            .map_err(catalog_error)?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}
