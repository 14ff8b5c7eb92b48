//! Session collaborator.
//!
//! The gate only needs the session's "current tenant" pointer. Whatever
//! manages login sessions implements [`SessionStore`]; the key is read
//! from the session cookie.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use parking_lot::RwLock;
use study_core::{TenancyResult, TenantId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The value of cookie `name`, from any `Cookie` header.
    pub fn from_headers(headers: &HeaderMap, name: &str) -> Option<Self> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, value)| *key == name && !value.is_empty())
            .map(|(_, value)| Self::new(value))
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_tenant_id(&self, session: &SessionKey) -> TenancyResult<Option<TenantId>>;
    async fn set_tenant_id(&self, session: &SessionKey, tenant_id: TenantId) -> TenancyResult<()>;
    async fn clear_tenant_id(&self, session: &SessionKey) -> TenancyResult<()>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    tenants: RwLock<HashMap<SessionKey, TenantId>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous peek, for tests and diagnostics.
    pub fn tenant_of(&self, session: &SessionKey) -> Option<TenantId> {
        self.tenants.read().get(session).copied()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_tenant_id(&self, session: &SessionKey) -> TenancyResult<Option<TenantId>> {
        Ok(self.tenant_of(session))
    }

    async fn set_tenant_id(&self, session: &SessionKey, tenant_id: TenantId) -> TenancyResult<()> {
        self.tenants.write().insert(session.clone(), tenant_id);
        Ok(())
    }

    async fn clear_tenant_id(&self, session: &SessionKey) -> TenancyResult<()> {
        self.tenants.write().remove(session);
        Ok(())
    }
}
