use std::sync::Arc;

use study_core::{
    ConnectionRegistry, MembershipCache, MembershipValidator, RoleCatalog, TenantCatalog,
    TenantDiscovery,
};

use crate::gate::GateSettings;
use crate::session::SessionStore;

/// Everything the gate and the health routes share.
#[derive(Clone)]
pub struct TenancyState {
    pub settings: Arc<GateSettings>,
    pub catalog: Arc<dyn TenantCatalog>,
    pub discovery: Arc<TenantDiscovery>,
    pub registry: Arc<ConnectionRegistry>,
    pub memberships: Arc<MembershipValidator>,
    pub roles: Arc<RoleCatalog>,
    pub sessions: Arc<dyn SessionStore>,
}

impl TenancyState {
    pub fn new(
        settings: GateSettings,
        catalog: Arc<dyn TenantCatalog>,
        discovery: Arc<TenantDiscovery>,
        registry: Arc<ConnectionRegistry>,
        roles: RoleCatalog,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let cache = Arc::new(MembershipCache::new(settings.membership_ttl));
        let memberships = Arc::new(MembershipValidator::new(Arc::clone(&catalog), cache));
        Self {
            settings: Arc::new(settings),
            catalog,
            discovery,
            registry,
            memberships,
            roles: Arc::new(roles),
            sessions,
        }
    }

    pub fn membership_cache(&self) -> &Arc<MembershipCache> {
        self.memberships.cache()
    }
}
