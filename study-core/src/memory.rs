//! In-memory catalog and database server for development and tests.
//!
//! `MemoryCatalog` emulates the row-level lock of the membership check
//! with one `tokio::sync::Mutex` per (user, tenant) pair, taken with
//! `try_lock` so a second checker fails fast exactly like `NOWAIT`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::catalog::{ConnectionBackend, DatabaseProbe, TenantCatalog};
use crate::connection::ConnectionConfig;
use crate::errors::{TenancyError, TenancyResult};
use crate::tenant::{Membership, Tenant, TenantAlias, TenantId, TenantStatus};

type MembershipKey = (i64, TenantId);

#[derive(Default)]
pub struct MemoryCatalog {
    tenants: RwLock<BTreeMap<TenantId, Tenant>>,
    memberships: RwLock<HashMap<MembershipKey, Membership>>,
    sites: RwLock<HashMap<TenantId, BTreeSet<String>>>,
    row_locks: Mutex<HashMap<MembershipKey, Arc<tokio::sync::Mutex<()>>>>,
    lock_hold: RwLock<Duration>,
    unavailable: AtomicBool,
    tenant_queries: AtomicU64,
    locked_reads: AtomicU64,
    plain_reads: AtomicU64,
    race_losses: AtomicU64,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tenant(&self, tenant: Tenant) {
        self.tenants.write().insert(tenant.id, tenant);
    }

    pub fn set_status(&self, id: TenantId, status: TenantStatus) {
        if let Some(tenant) = self.tenants.write().get_mut(&id) {
            tenant.status = status;
        }
    }

    pub fn insert_membership(&self, membership: Membership) {
        self.memberships
            .write()
            .insert((membership.user_id, membership.tenant_id), membership);
    }

    pub fn set_membership_active(&self, user_id: i64, tenant_id: TenantId, active: bool) {
        if let Some(membership) = self.memberships.write().get_mut(&(user_id, tenant_id)) {
            membership.is_active = active;
        }
    }

    pub fn remove_membership(&self, user_id: i64, tenant_id: TenantId) {
        self.memberships.write().remove(&(user_id, tenant_id));
    }

    pub fn add_sites<I, S>(&self, tenant_id: TenantId, codes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sites
            .write()
            .entry(tenant_id)
            .or_default()
            .extend(codes.into_iter().map(Into::into));
    }

    /// How long a locked membership read keeps the row.
    pub fn set_lock_hold(&self, hold: Duration) {
        *self.lock_hold.write() = hold;
    }

    /// Simulate a catalog outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn tenant_queries(&self) -> u64 {
        self.tenant_queries.load(Ordering::SeqCst)
    }

    pub fn locked_reads(&self) -> u64 {
        self.locked_reads.load(Ordering::SeqCst)
    }

    pub fn plain_reads(&self) -> u64 {
        self.plain_reads.load(Ordering::SeqCst)
    }

    pub fn race_losses(&self) -> u64 {
        self.race_losses.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> TenancyResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(TenancyError::catalog("catalog unavailable"))
        } else {
            Ok(())
        }
    }

    fn row_lock(&self, key: MembershipKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.row_locks.lock().entry(key).or_default())
    }
}

#[async_trait]
impl TenantCatalog for MemoryCatalog {
    async fn activatable_tenants(&self) -> TenancyResult<Vec<Tenant>> {
        self.ensure_available()?;
        self.tenant_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .tenants
            .read()
            .values()
            .filter(|t| t.status.is_activatable())
            .cloned()
            .collect())
    }

    async fn tenant(&self, id: TenantId) -> TenancyResult<Option<Tenant>> {
        self.ensure_available()?;
        Ok(self.tenants.read().get(&id).cloned())
    }

    async fn lock_membership(&self, user_id: i64, tenant_id: TenantId) -> TenancyResult<Option<Membership>> {
        self.ensure_available()?;

        let row = self.row_lock((user_id, tenant_id));
        let _held = match row.try_lock_owned() {
            Ok(held) => held,
            Err(_) => {
                self.race_losses.fetch_add(1, Ordering::SeqCst);
                return Err(TenancyError::race_loss(user_id, tenant_id.0));
            }
        };
        self.locked_reads.fetch_add(1, Ordering::SeqCst);

        let hold = *self.lock_hold.read();
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }

        Ok(self.memberships.read().get(&(user_id, tenant_id)).cloned())
    }

    async fn find_membership(&self, user_id: i64, tenant_id: TenantId) -> TenancyResult<Option<Membership>> {
        self.ensure_available()?;
        self.plain_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.memberships.read().get(&(user_id, tenant_id)).cloned())
    }

    async fn active_membership_count(&self, user_id: i64) -> TenancyResult<usize> {
        self.ensure_available()?;
        Ok(self
            .memberships
            .read()
            .values()
            .filter(|m| m.user_id == user_id && m.is_valid())
            .count())
    }

    async fn site_codes(&self, tenant_id: TenantId) -> TenancyResult<BTreeSet<String>> {
        self.ensure_available()?;
        Ok(self.sites.read().get(&tenant_id).cloned().unwrap_or_default())
    }
}

/// A database server: which databases exist, which schemas were created,
/// and which statements were issued.
#[derive(Default)]
pub struct MemoryServer {
    databases: RwLock<BTreeSet<String>>,
    schemas: RwLock<BTreeSet<(String, String)>>,
    unreachable: RwLock<HashSet<String>>,
    check_delay: RwLock<Duration>,
    close_delay: RwLock<Duration>,
    connections: Mutex<HashMap<String, u64>>,
    statements: Mutex<Vec<String>>,
    probed: Mutex<Vec<Vec<String>>>,
    closed: Mutex<Vec<String>>,
    unavailable: AtomicBool,
    checks: AtomicU64,
    opens: AtomicU64,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_databases<I, S>(databases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let server = Self::default();
        server
            .databases
            .write()
            .extend(databases.into_iter().map(Into::into));
        server
    }

    pub fn add_database(&self, name: impl Into<String>) {
        self.databases.write().insert(name.into());
    }

    pub fn drop_database(&self, name: &str) {
        self.databases.write().remove(name);
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.databases.read().contains(name)
    }

    pub fn has_schema(&self, database: &str, schema: &str) -> bool {
        self.schemas
            .read()
            .contains(&(database.to_string(), schema.to_string()))
    }

    /// Connectivity checks against `database` fail until cleared.
    pub fn set_unreachable(&self, database: &str, unreachable: bool) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(database.to_string());
        } else {
            set.remove(database);
        }
    }

    pub fn set_check_delay(&self, delay: Duration) {
        *self.check_delay.write() = delay;
    }

    /// Every close waits this long before releasing anything.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.write() = delay;
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Labels of the connections currently open.
    pub fn open_connections(&self) -> BTreeSet<String> {
        self.connections.lock().keys().cloned().collect()
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    /// Name lists passed to each probe, in call order.
    pub fn probes(&self) -> Vec<Vec<String>> {
        self.probed.lock().clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().clone()
    }

    fn log(&self, statement: String) {
        self.statements.lock().push(statement);
    }
}

#[async_trait]
impl DatabaseProbe for MemoryServer {
    async fn existing_databases(&self, names: &[String]) -> TenancyResult<BTreeSet<String>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TenancyError::catalog("database server unavailable"));
        }
        self.probed.lock().push(names.to_vec());

        let databases = self.databases.read();
        Ok(names
            .iter()
            .filter(|name| databases.contains(*name))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ConnectionBackend for MemoryServer {
    async fn check(&self, config: &ConnectionConfig) -> TenancyResult<()> {
        self.checks.fetch_add(1, Ordering::SeqCst);

        let delay = *self.check_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let reachable = !self.unreachable.read().contains(&config.database)
            && self.databases.read().contains(&config.database);
        if reachable {
            Ok(())
        } else {
            Err(TenancyError::connectivity(
                config.label(),
                format!("database {} is not reachable", config.database),
            ))
        }
    }

    async fn ensure_schema(&self, config: &ConnectionConfig, alias: &TenantAlias) -> TenancyResult<()> {
        if !self.databases.read().contains(&config.database) {
            return Err(TenancyError::connectivity(
                alias.as_str(),
                format!("database {} does not exist", config.database),
            ));
        }

        let schema = config.data_schema().to_string();
        self.log(format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""));
        self.log(format!("GRANT USAGE ON SCHEMA \"{schema}\" TO \"{}\"", config.user));
        self.schemas.write().insert((config.database.clone(), schema));
        Ok(())
    }

    async fn database_exists(&self, config: &ConnectionConfig) -> TenancyResult<bool> {
        Ok(self.databases.read().contains(&config.database))
    }

    async fn create_database(&self, config: &ConnectionConfig) -> TenancyResult<()> {
        self.log(format!("CREATE DATABASE \"{}\"", config.database));
        self.databases.write().insert(config.database.clone());
        Ok(())
    }

    fn open(&self, config: &ConnectionConfig, generation: u64) -> TenancyResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TenancyError::connectivity(config.label(), "database server unavailable"));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.connections
            .lock()
            .insert(config.label().to_string(), generation);
        Ok(())
    }

    async fn close(&self, config: &ConnectionConfig, generation: u64) {
        let delay = *self.close_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut connections = self.connections.lock();
        if connections.get(config.label()) == Some(&generation) {
            connections.remove(config.label());
            self.closed.lock().push(config.label().to_string());
        }
    }
}
