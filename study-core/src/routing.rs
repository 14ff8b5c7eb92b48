//! Request-scoped routing context.
//!
//! Names the tenant whose connection the data-access layer must use
//! right now, without threading it through every call. The value lives
//! in a task-local slot that exists only for the duration of
//! [`RoutingContext::scope`], so a worker that serves tenant A and then
//! tenant B never sees A's route while handling B.
//!
//! ```rust
//! use study_core::routing::{Route, RoutingContext};
//! use study_core::tenant::TenantAlias;
//!
//! let alias = TenantAlias::parse("cardio_01").unwrap();
//! RoutingContext::sync_scope(Route::Catalog, || {
//!     let guard = RoutingContext::bind(alias.clone());
//!     assert_eq!(RoutingContext::current(), Route::Tenant(alias));
//!     guard.restore();
//!     assert_eq!(RoutingContext::current(), Route::Catalog);
//! });
//! ```

use std::cell::RefCell;
use std::fmt;
use std::future::Future;

use serde::Serialize;
use tracing::debug;

use crate::tenant::TenantAlias;

tokio::task_local! {
    static CURRENT_ROUTE: RefCell<Route>;
}

/// Which physical connection a query should go to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "alias", rename_all = "snake_case")]
pub enum Route {
    /// The catalog / management database. Default when nothing is bound.
    Catalog,
    Tenant(TenantAlias),
}

impl Route {
    pub fn alias(&self) -> Option<&TenantAlias> {
        match self {
            Route::Catalog => None,
            Route::Tenant(alias) => Some(alias),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Catalog => f.write_str("catalog"),
            Route::Tenant(alias) => write!(f, "tenant:{alias}"),
        }
    }
}

/// Entry points for the ambient route.
pub struct RoutingContext;

impl RoutingContext {
    /// Run `fut` with its own routing slot initialised to `route`.
    ///
    /// The slot disappears with the future, whether it completes,
    /// errors, panics or is dropped mid-flight.
    pub async fn scope<F>(route: Route, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_ROUTE.scope(RefCell::new(route), fut).await
    }

    /// Blocking counterpart of [`RoutingContext::scope`].
    pub fn sync_scope<F, R>(route: Route, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        CURRENT_ROUTE.sync_scope(RefCell::new(route), f)
    }

    /// The route in effect. `Route::Catalog` outside any scope.
    pub fn current() -> Route {
        CURRENT_ROUTE
            .try_with(|slot| slot.borrow().clone())
            .unwrap_or(Route::Catalog)
    }

    pub fn current_alias() -> Option<TenantAlias> {
        Self::current().alias().cloned()
    }

    pub fn is_scoped() -> bool {
        CURRENT_ROUTE.try_with(|_| ()).is_ok()
    }

    /// Point the current slot at `alias` until the guard is dropped.
    pub fn bind(alias: TenantAlias) -> RouteGuard {
        Self::bind_route(Route::Tenant(alias))
    }

    pub fn bind_route(route: Route) -> RouteGuard {
        match CURRENT_ROUTE.try_with(|slot| slot.replace(route.clone())) {
            Ok(previous) => RouteGuard {
                previous: Some(previous),
            },
            Err(_) => {
                debug!(%route, "bind outside a routing scope ignored");
                RouteGuard { previous: None }
            }
        }
    }
}

/// Restores the previous route when dropped.
#[must_use = "the route is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct RouteGuard {
    previous: Option<Route>,
}

impl RouteGuard {
    /// Explicit restore. Dropping the guard has the same effect.
    pub fn restore(mut self) {
        self.restore_previous();
    }

    fn restore_previous(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = CURRENT_ROUTE.try_with(|slot| {
                slot.replace(previous);
            });
        }
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.restore_previous();
    }
}
