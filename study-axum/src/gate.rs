//! Tenant access gate.
//!
//! Runs before every handler. A request either proceeds in the catalog
//! context (public path, anonymous, admin bypass), proceeds bound to one
//! study with its permissions attached, or is redirected / refused.
//!
//! While a request is bound, the gate holds a [`ConnectionLease`] and a
//! routing scope. Both are released when the downstream future finishes,
//! fails, panics or is dropped.
//!
//! [`ConnectionLease`]: study_core::ConnectionLease

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use futures::FutureExt;
use serde::Serialize;
use study_core::membership::DEFAULT_MEMBERSHIP_TTL;
use study_core::{
    ErrorKind, Route, RoutingContext, SiteScope, StudyConfigSnapshot, Tenant, TenantAlias, TenantId,
};
use tracing::{debug, error, info, warn};

use crate::error::GateError;
use crate::session::SessionKey;
use crate::state::TenancyState;

#[derive(Debug, Clone)]
pub struct GateSettings {
    pub public_paths: Vec<String>,
    pub admin_paths: Vec<String>,
    pub select_tenant_url: String,
    pub no_access_url: String,
    pub membership_ttl: Duration,
    pub session_cookie: String,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            public_paths: ["/health", "/static/", "/login", "/logout"]
                .into_iter()
                .map(String::from)
                .collect(),
            admin_paths: vec!["/admin/".to_string()],
            select_tenant_url: "/studies/select/".to_string(),
            no_access_url: "/studies/no-access/".to_string(),
            membership_ttl: DEFAULT_MEMBERSHIP_TTL,
            session_cookie: "sessionid".to_string(),
        }
    }
}

impl GateSettings {
    /// Reads `gate.*` keys; anything missing keeps its default.
    pub fn from_snapshot(snapshot: &StudyConfigSnapshot) -> Self {
        let defaults = Self::default();
        let list_or = |key: &str, fallback: Vec<String>| {
            let list = snapshot.get_list(key);
            if list.is_empty() {
                fallback
            } else {
                list
            }
        };

        Self {
            public_paths: list_or("gate.public_paths", defaults.public_paths),
            admin_paths: list_or("gate.admin_paths", defaults.admin_paths),
            select_tenant_url: snapshot
                .get_string("gate.select_tenant_url")
                .unwrap_or(defaults.select_tenant_url),
            no_access_url: snapshot
                .get_string("gate.no_access_url")
                .unwrap_or(defaults.no_access_url),
            membership_ttl: snapshot
                .get_duration("gate.membership_ttl")
                .unwrap_or(defaults.membership_ttl),
            session_cookie: snapshot
                .get_string("gate.session_cookie")
                .unwrap_or(defaults.session_cookie),
        }
    }

    /// Public prefixes, plus the gate's own redirect targets.
    pub fn is_public(&self, path: &str) -> bool {
        path == self.select_tenant_url
            || path == self.no_access_url
            || self.public_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn is_admin(&self, path: &str) -> bool {
        self.admin_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// The authenticated user, inserted by the authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
    pub is_superuser: bool,
}

impl Principal {
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            is_superuser: false,
        }
    }

    pub fn superuser(user_id: i64) -> Self {
        Self {
            user_id,
            is_superuser: true,
        }
    }
}

/// Attached to requests that proceed bound to a study.
#[derive(Debug, Clone, Serialize)]
pub struct TenantAccess {
    pub tenant: Tenant,
    pub alias: TenantAlias,
    pub role: String,
    pub permissions: BTreeSet<String>,
    pub sites: BTreeSet<String>,
}

impl TenantAccess {
    pub fn has_permission(&self, code: &str) -> bool {
        self.permissions.contains(code)
    }

    pub fn can_access_site(&self, code: &str) -> bool {
        self.sites.contains(code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Public,
    Anonymous,
    AdminBypass,
    SelectTenant,
    NoAccess,
    Revoked,
    Proceed,
}

impl Decision {
    fn as_str(self) -> &'static str {
        match self {
            Decision::Public => "public",
            Decision::Anonymous => "anonymous",
            Decision::AdminBypass => "admin_bypass",
            Decision::SelectTenant => "select_tenant",
            Decision::NoAccess => "no_access",
            Decision::Revoked => "revoked",
            Decision::Proceed => "proceed",
        }
    }
}

/// The gate middleware, for `axum::middleware::from_fn_with_state`.
pub async fn tenant_gate(State(state): State<TenancyState>, req: Request, next: Next) -> Response {
    match gate(&state, req, next).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn gate(state: &TenancyState, req: Request, next: Next) -> Result<Response, GateError> {
    let settings = &state.settings;
    let path = req.uri().path().to_owned();

    if settings.is_public(&path) {
        debug!(%path, decision = Decision::Public.as_str(), "gate");
        return Ok(catalog_scope(req, next).await);
    }

    let Some(principal) = req.extensions().get::<Principal>().copied() else {
        debug!(%path, decision = Decision::Anonymous.as_str(), "gate");
        return Ok(catalog_scope(req, next).await);
    };
    let user_id = principal.user_id;

    if principal.is_superuser && settings.is_admin(&path) {
        debug!(user_id, %path, decision = Decision::AdminBypass.as_str(), "gate");
        return Ok(catalog_scope(req, next).await);
    }

    let session = SessionKey::from_headers(req.headers(), &settings.session_cookie);
    let tenant_id = match &session {
        Some(key) => state.sessions.get_tenant_id(key).await?,
        None => None,
    };

    let Some(tenant_id) = tenant_id else {
        let memberships = state.catalog.active_membership_count(user_id).await?;
        let (decision, target) = if memberships > 0 {
            (Decision::SelectTenant, settings.select_tenant_url.as_str())
        } else {
            (Decision::NoAccess, settings.no_access_url.as_str())
        };
        info!(user_id, memberships, decision = decision.as_str(), "gate");
        return Ok(Redirect::to(target).into_response());
    };

    let Some(tenant) = state.discovery.loadable_tenant(tenant_id).await else {
        warn!(user_id, %tenant_id, decision = Decision::Revoked.as_str(), "session tenant not loadable");
        return revoke(state, session.as_ref()).await;
    };

    let Some(membership) = state.memberships.validate(user_id, tenant_id).await? else {
        warn!(user_id, %tenant_id, decision = Decision::Revoked.as_str(), "no valid membership");
        return revoke(state, session.as_ref()).await;
    };

    let alias = match tenant.alias() {
        Ok(alias) => alias,
        Err(err) => {
            error!(user_id, %tenant_id, %err, decision = Decision::Revoked.as_str(), "tenant code is not a valid identifier");
            return revoke(state, session.as_ref()).await;
        }
    };

    let sites = match &membership.site_scope {
        SiteScope::AllSites => state.catalog.site_codes(tenant_id).await?,
        SiteScope::Sites(codes) => codes.clone(),
    };
    let permissions = state.roles.permission_set(&membership.role);

    let lease = match state.registry.acquire_tenant(&tenant).await {
        Ok(lease) => lease,
        Err(err) if matches!(err.kind(), ErrorKind::Validation | ErrorKind::NotFound) => {
            error!(user_id, %tenant_id, %err, decision = Decision::Revoked.as_str(), "tenant connection cannot be built");
            return revoke(state, session.as_ref()).await;
        }
        Err(err) => return Err(err.into()),
    };

    info!(user_id, %tenant_id, %alias, role = %membership.role, decision = Decision::Proceed.as_str(), "gate");

    let mut req = req;
    req.extensions_mut().insert(TenantAccess {
        tenant,
        alias: alias.clone(),
        role: membership.role,
        permissions,
        sites,
    });

    let outcome = AssertUnwindSafe(RoutingContext::scope(Route::Tenant(alias.clone()), next.run(req)))
        .catch_unwind()
        .await;
    drop(lease);

    match outcome {
        Ok(response) => Ok(response),
        Err(_) => {
            error!(user_id, %tenant_id, %alias, "handler panicked");
            Err(GateError::HandlerPanicked)
        }
    }
}

async fn catalog_scope(req: Request, next: Next) -> Response {
    RoutingContext::scope(Route::Catalog, next.run(req)).await
}

/// Clear the session's tenant pointer and send the user to tenant selection.
async fn revoke(state: &TenancyState, session: Option<&SessionKey>) -> Result<Response, GateError> {
    if let Some(key) = session {
        state.sessions.clear_tenant_id(key).await?;
    }
    Ok(Redirect::to(&state.settings.select_tenant_url).into_response())
}

/// Point the session at `tenant_id`, e.g. from a tenant selection handler.
pub async fn select_tenant(
    state: &TenancyState,
    session: &SessionKey,
    tenant_id: TenantId,
) -> Result<(), GateError> {
    state.sessions.set_tenant_id(session, tenant_id).await?;
    Ok(())
}
