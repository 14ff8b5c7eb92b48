//! Contracts of the stores the core reads from.
//!
//! Implementations live elsewhere (`study-postgres`, or the in-memory
//! versions in [`crate::memory`]); the core only depends on these traits.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::connection::ConnectionConfig;
use crate::errors::TenancyResult;
use crate::tenant::{Membership, Tenant, TenantAlias, TenantId};

/// Read access to tenant and membership records.
#[async_trait]
pub trait TenantCatalog: Send + Sync {
    /// Every tenant whose status is planning or active. One query.
    async fn activatable_tenants(&self) -> TenancyResult<Vec<Tenant>>;

    async fn tenant(&self, id: TenantId) -> TenancyResult<Option<Tenant>>;

    /// Pessimistic, non-blocking row check.
    ///
    /// Must never wait for another holder: if the row is locked the call
    /// fails fast with `TenancyError::RaceLoss`.
    async fn lock_membership(&self, user_id: i64, tenant_id: TenantId) -> TenancyResult<Option<Membership>>;

    /// Plain read without any locking.
    async fn find_membership(&self, user_id: i64, tenant_id: TenantId) -> TenancyResult<Option<Membership>>;

    /// Number of currently valid memberships of a user across all tenants.
    async fn active_membership_count(&self, user_id: i64) -> TenancyResult<usize>;

    /// All site codes belonging to a tenant.
    async fn site_codes(&self, tenant_id: TenantId) -> TenancyResult<BTreeSet<String>>;
}

/// Answers "which of these databases exist on the server".
#[async_trait]
pub trait DatabaseProbe: Send + Sync {
    /// One batched existence check for all names.
    async fn existing_databases(&self, names: &[String]) -> TenancyResult<BTreeSet<String>>;
}

/// Seam to the physical database server used by the registry.
#[async_trait]
pub trait ConnectionBackend: Send + Sync {
    /// Connectivity check for a freshly built config.
    async fn check(&self, config: &ConnectionConfig) -> TenancyResult<()>;

    /// Make the physical resources of a new registration available.
    ///
    /// Runs under the registry lock on every fresh registration, including
    /// ones served from the config cache, so it must not block. `generation`
    /// identifies the registration and is passed back to [`close`].
    ///
    /// [`close`]: ConnectionBackend::close
    fn open(&self, config: &ConnectionConfig, generation: u64) -> TenancyResult<()>;

    /// Idempotently create the tenant's schema objects and grants.
    async fn ensure_schema(&self, config: &ConnectionConfig, alias: &TenantAlias) -> TenancyResult<()>;

    /// Whether `config.database` exists, asked over the catalog connection.
    async fn database_exists(&self, config: &ConnectionConfig) -> TenancyResult<bool>;

    /// Create `config.database`. Only called after `database_exists` said no.
    async fn create_database(&self, config: &ConnectionConfig) -> TenancyResult<()>;

    /// Release the physical resources of registration `generation`.
    ///
    /// Resources opened by a later registration of the same tenant are
    /// left alone.
    async fn close(&self, config: &ConnectionConfig, generation: u64);
}
