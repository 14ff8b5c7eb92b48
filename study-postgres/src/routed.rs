use std::sync::Arc;

use sqlx::PgPool;
use study_core::{ConnectionRegistry, RoutingContext, TenancyError, TenancyResult};

use crate::backend::PgBackend;

/// Anything that can hand out the registry and the backend holding pools.
pub trait PgState {
    fn registry(&self) -> &Arc<ConnectionRegistry>;
    fn backend(&self) -> &Arc<PgBackend>;
}

/// Pool lookup for the data-access layer.
///
/// Every call reads the current route, so a query issued inside a
/// tenant-scoped request goes to that tenant's database and anything
/// else goes to the catalog.
pub struct RoutedPool {
    registry: Arc<ConnectionRegistry>,
    backend: Arc<PgBackend>,
}

impl RoutedPool {
    pub fn new<T: PgState>(state: &T) -> Self {
        Self {
            registry: state.registry().clone(),
            backend: state.backend().clone(),
        }
    }

    pub fn from_parts(registry: Arc<ConnectionRegistry>, backend: Arc<PgBackend>) -> Self {
        Self { registry, backend }
    }

    pub fn current(&self) -> TenancyResult<PgPool> {
        let route = RoutingContext::current();
        let config = self
            .registry
            .resolve(&route)
            .ok_or_else(|| TenancyError::not_found("registered connection", &route))?;

        self.backend
            .pool_for(&config)
            .ok_or_else(|| TenancyError::not_found("open pool", &route))
    }
}
