//! Tenant selection endpoints.
//!
//! Both live under the gate's public selection URL, so they run in the
//! catalog context whether or not the session already points at a study.

use axum::{
    extract::{Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use study_axum::{select_tenant, GateError, Principal, SessionKey, TenancyState};
use study_core::TenantId;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SelectParams {
    pub tenant: i64,
}

/// Loadable studies the current user holds a valid membership in.
async fn list_studies(State(state): State<TenancyState>, req: Request) -> Response {
    let Some(principal) = req.extensions().get::<Principal>().copied() else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let snapshot = state.discovery.snapshot().await;
    let mut studies = Vec::new();
    for tenant in snapshot.tenants() {
        match state.memberships.validate(principal.user_id, tenant.id).await {
            Ok(Some(membership)) => studies.push(json!({
                "id": tenant.id,
                "code": tenant.code,
                "status": tenant.status,
                "role": membership.role,
            })),
            Ok(None) => {}
            Err(err) => return GateError::from(err).into_response(),
        }
    }

    Json(json!({ "studies": studies })).into_response()
}

/// Point the session at a study after checking the user may enter it.
async fn choose_study(
    State(state): State<TenancyState>,
    Query(params): Query<SelectParams>,
    req: Request,
) -> Response {
    let Some(principal) = req.extensions().get::<Principal>().copied() else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Some(session) = SessionKey::from_headers(req.headers(), &state.settings.session_cookie) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let tenant_id = TenantId(params.tenant);
    if state.discovery.loadable_tenant(tenant_id).await.is_none() {
        return Redirect::to(&state.settings.select_tenant_url).into_response();
    }
    match state.memberships.validate(principal.user_id, tenant_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Redirect::to(&state.settings.no_access_url).into_response(),
        Err(err) => return GateError::from(err).into_response(),
    }

    if let Err(err) = select_tenant(&state, &session, tenant_id).await {
        return err.into_response();
    }
    info!(user_id = principal.user_id, %tenant_id, "study selected");
    Redirect::to("/").into_response()
}

pub fn selection_router(state: TenancyState) -> Router {
    let path = state.settings.select_tenant_url.clone();
    Router::new()
        .route(&path, get(list_studies).post(choose_study))
        .with_state(state)
}
