use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::state::TenancyState;

pub async fn health() -> &'static str {
    "ok"
}

/// Loadable studies and registry counters, for readiness tooling.
pub async fn tenancy_health(State(state): State<TenancyState>) -> Json<Value> {
    let snapshot = state.discovery.snapshot().await;
    Json(json!({
        "loadable": snapshot.loadable,
        "discovery": {
            "modules": snapshot.modules.len(),
            "catalog": snapshot.catalog.len(),
            "databases": snapshot.databases.len(),
            "built_at": snapshot.built_at,
        },
        "registry": state.registry.stats(),
        "membership_cache": {
            "entries": state.membership_cache().len(),
            "hits": state.membership_cache().hits(),
            "misses": state.membership_cache().misses(),
        },
    }))
}

pub fn health_router(state: TenancyState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/tenancy", get(tenancy_health))
        .with_state(state)
}
