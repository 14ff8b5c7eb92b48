use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use study_axum::{
    GateSettings, MemorySessionStore, Principal, SessionKey, SessionStore, TenancyApp,
    TenancyState, TenantAccess,
};
use study_core::{
    ConnectionRegistry, ConnectionSettings, Membership, MemoryCatalog, MemoryServer, PoolSettings,
    RoleCatalog, RoutingContext, SiteScope, StaticManifest, Tenant, TenantAlias, TenantDiscovery,
    TenantId, TenantStatus,
};
use tower::ServiceExt;

const USER: i64 = 7;
const ALPHA: TenantId = TenantId(1);
const BETA: TenantId = TenantId(2);
const GAMMA: TenantId = TenantId(3);
const DELTA: TenantId = TenantId(4);

struct Harness {
    catalog: Arc<MemoryCatalog>,
    sessions: Arc<MemorySessionStore>,
    registry: Arc<ConnectionRegistry>,
    router: Router,
}

fn tenant(id: TenantId, code: &str, status: TenantStatus) -> Tenant {
    Tenant {
        id,
        code: code.to_string(),
        database_name: format!("study_{code}"),
        status,
    }
}

fn membership(tenant_id: TenantId, role: &str, site_scope: SiteScope) -> Membership {
    Membership {
        user_id: USER,
        tenant_id,
        role: role.to_string(),
        site_scope,
        is_active: true,
        expires_at: None,
    }
}

async fn whoami(req: axum::extract::Request) -> Json<Value> {
    let access = req.extensions().get::<TenantAccess>().cloned();
    Json(json!({
        "route": RoutingContext::current().to_string(),
        "access": access,
    }))
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(3600)).await;
    "late"
}

async fn boom() -> &'static str {
    panic!("handler failed")
}

fn harness_with(max_connections: usize) -> Harness {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_tenant(tenant(ALPHA, "alpha", TenantStatus::Active));
    catalog.insert_tenant(tenant(BETA, "beta", TenantStatus::Archived));
    catalog.insert_tenant(tenant(GAMMA, "gamma", TenantStatus::Planning));
    catalog.insert_tenant(Tenant {
        database_name: "study-delta".to_string(),
        ..tenant(DELTA, "delta", TenantStatus::Active)
    });
    catalog.add_sites(ALPHA, ["S01", "S02"]);

    let server = Arc::new(MemoryServer::with_databases([
        "study_alpha",
        "study_beta",
        "study_gamma",
        "study-delta",
    ]));
    let manifest = Arc::new(StaticManifest::new(["alpha", "beta", "gamma", "delta"]));
    let discovery = Arc::new(TenantDiscovery::new(manifest, catalog.clone(), server.clone()));

    let registry = Arc::new(
        ConnectionRegistry::new(
            ConnectionSettings::default(),
            PoolSettings::default().with_max_connections(max_connections),
            server,
        )
        .unwrap(),
    );

    let sessions = Arc::new(MemorySessionStore::new());
    let state = TenancyState::new(
        GateSettings::default(),
        catalog.clone(),
        discovery,
        registry.clone(),
        RoleCatalog::seeded(),
        sessions.clone(),
    );

    let router = TenancyApp::new(state)
        .use_get("/whoami", whoami)
        .use_get("/slow", slow)
        .use_get("/boom", boom)
        .use_get("/admin/panel", whoami)
        .with_principal(|headers| {
            let user_id = headers.get("x-test-user")?.to_str().ok()?.parse().ok()?;
            Some(Principal {
                user_id,
                is_superuser: headers.contains_key("x-test-superuser"),
            })
        })
        .into_router();

    Harness {
        catalog,
        sessions,
        registry,
        router,
    }
}

fn harness() -> Harness {
    harness_with(4)
}

fn request(path: &str, user: Option<i64>, session: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(user) = user {
        builder = builder.header("x-test-user", user.to_string());
    }
    if let Some(session) = session {
        builder = builder.header(header::COOKIE, format!("sessionid={session}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn location(res: &axum::response::Response) -> &str {
    res.headers()[header::LOCATION].to_str().unwrap()
}

async fn point_session(h: &Harness, session: &str, tenant_id: TenantId) {
    h.sessions
        .set_tenant_id(&SessionKey::new(session), tenant_id)
        .await
        .unwrap();
}

fn alias(raw: &str) -> TenantAlias {
    TenantAlias::parse(raw).unwrap()
}

#[tokio::test]
async fn public_path_skips_the_gate() {
    let h = harness();

    let res = h.router.clone().oneshot(request("/health", None, None)).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn anonymous_request_runs_in_catalog_context() {
    let h = harness();

    let res = h.router.clone().oneshot(request("/whoami", None, None)).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["route"], "catalog");
    assert!(body["access"].is_null());
}

#[tokio::test]
async fn no_session_tenant_with_memberships_redirects_to_selection() {
    let h = harness();
    h.catalog.insert_membership(membership(ALPHA, "investigator", SiteScope::AllSites));

    let res = h.router.clone().oneshot(request("/whoami", Some(USER), None)).await.unwrap();

    assert_eq!(res.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&res), "/studies/select/");
}

#[tokio::test]
async fn no_memberships_redirects_to_no_access() {
    let h = harness();

    let res = h.router.clone().oneshot(request("/whoami", Some(USER), Some("s1"))).await.unwrap();

    assert_eq!(res.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&res), "/studies/no-access/");
}

#[tokio::test]
async fn archived_session_tenant_redirects_and_clears_the_pointer() {
    let h = harness();
    h.catalog.insert_membership(membership(BETA, "investigator", SiteScope::AllSites));
    point_session(&h, "s1", BETA).await;

    let res = h.router.clone().oneshot(request("/whoami", Some(USER), Some("s1"))).await.unwrap();

    assert_eq!(res.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&res), "/studies/select/");
    assert_eq!(h.sessions.tenant_of(&SessionKey::new("s1")), None);
    assert!(!h.registry.is_registered(&alias("beta")));
}

#[tokio::test]
async fn tenant_with_unusable_database_name_redirects_to_selection() {
    let h = harness();
    h.catalog.insert_membership(membership(DELTA, "investigator", SiteScope::AllSites));
    point_session(&h, "s1", DELTA).await;

    let res = h.router.clone().oneshot(request("/whoami", Some(USER), Some("s1"))).await.unwrap();

    assert_eq!(res.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&res), "/studies/select/");
    assert_eq!(h.sessions.tenant_of(&SessionKey::new("s1")), None);
    assert!(!h.registry.is_registered(&alias("delta")));
}

#[tokio::test]
async fn inactive_membership_redirects_and_clears_the_pointer() {
    let h = harness();
    let mut inactive = membership(ALPHA, "investigator", SiteScope::AllSites);
    inactive.is_active = false;
    h.catalog.insert_membership(inactive);
    point_session(&h, "s1", ALPHA).await;

    let res = h.router.clone().oneshot(request("/whoami", Some(USER), Some("s1"))).await.unwrap();

    assert_eq!(res.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&res), "/studies/select/");
    assert_eq!(h.sessions.tenant_of(&SessionKey::new("s1")), None);
}

#[tokio::test]
async fn valid_membership_binds_the_tenant_and_attaches_access() {
    let h = harness();
    h.catalog.insert_membership(membership(ALPHA, "investigator", SiteScope::AllSites));
    point_session(&h, "s1", ALPHA).await;

    let res = h.router.clone().oneshot(request("/whoami", Some(USER), Some("s1"))).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["route"], "tenant:alpha");
    assert_eq!(body["access"]["alias"], "alpha");
    assert_eq!(body["access"]["role"], "investigator");
    assert_eq!(body["access"]["sites"], json!(["S01", "S02"]));
    let permissions = body["access"]["permissions"].as_array().unwrap();
    assert!(permissions.contains(&json!("crf.sign")));

    // released once the response is produced
    assert_eq!(h.registry.usage(&alias("alpha")), Some(0));
    assert_eq!(RoutingContext::current().to_string(), "catalog");
}

#[tokio::test]
async fn restricted_site_scope_is_attached_as_is() {
    let h = harness();
    let sites = ["S02".to_string()].into_iter().collect();
    h.catalog.insert_membership(membership(ALPHA, "site_coordinator", SiteScope::Sites(sites)));
    point_session(&h, "s1", ALPHA).await;

    let res = h.router.clone().oneshot(request("/whoami", Some(USER), Some("s1"))).await.unwrap();

    let body = json_body(res).await;
    assert_eq!(body["access"]["sites"], json!(["S02"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simultaneous_requests_for_one_pair_both_proceed() {
    let h = harness();
    h.catalog.insert_membership(membership(ALPHA, "investigator", SiteScope::AllSites));
    h.catalog.set_lock_hold(Duration::from_millis(100));
    point_session(&h, "s1", ALPHA).await;

    let (first, second) = tokio::join!(
        h.router.clone().oneshot(request("/whoami", Some(USER), Some("s1"))),
        h.router.clone().oneshot(request("/whoami", Some(USER), Some("s1"))),
    );

    assert_eq!(first.unwrap().status(), StatusCode::OK);
    assert_eq!(second.unwrap().status(), StatusCode::OK);
    // the loser never waited: it fell back to a plain read
    assert_eq!(h.catalog.locked_reads(), 1);
    assert_eq!(h.catalog.race_losses(), h.catalog.plain_reads());
}

#[tokio::test]
async fn handler_panic_becomes_unavailable_after_cleanup() {
    let h = harness();
    h.catalog.insert_membership(membership(ALPHA, "investigator", SiteScope::AllSites));
    point_session(&h, "s1", ALPHA).await;

    let res = h.router.clone().oneshot(request("/boom", Some(USER), Some("s1"))).await.unwrap();

    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(res).await;
    assert_eq!(body["code"], 503);
    assert!(!body.to_string().contains("handler failed"));
    assert_eq!(h.registry.usage(&alias("alpha")), Some(0));
}

#[tokio::test]
async fn cancelled_request_releases_its_registration() {
    let h = harness();
    h.catalog.insert_membership(membership(ALPHA, "investigator", SiteScope::AllSites));
    point_session(&h, "s1", ALPHA).await;

    let task = tokio::spawn(h.router.clone().oneshot(request("/slow", Some(USER), Some("s1"))));
    while h.registry.usage(&alias("alpha")) != Some(1) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(h.registry.usage(&alias("alpha")), Some(0));
}

#[tokio::test]
async fn full_registry_answers_with_retryable_unavailable() {
    let h = harness_with(1);
    h.catalog.insert_membership(membership(ALPHA, "investigator", SiteScope::AllSites));
    h.catalog.insert_membership(membership(GAMMA, "monitor", SiteScope::AllSites));
    point_session(&h, "s1", ALPHA).await;
    point_session(&h, "s2", GAMMA).await;

    let busy = tokio::spawn(h.router.clone().oneshot(request("/slow", Some(USER), Some("s1"))));
    while h.registry.usage(&alias("alpha")) != Some(1) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let res = h.router.clone().oneshot(request("/whoami", Some(USER), Some("s2"))).await.unwrap();

    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(res.headers()[header::RETRY_AFTER], HeaderValue::from_static("1"));
    assert_eq!(h.registry.stats().capacity_rejections, 1);

    busy.abort();
}

#[tokio::test]
async fn superuser_on_admin_path_bypasses_tenant_checks() {
    let h = harness();

    let req = Request::builder()
        .uri("/admin/panel")
        .header("x-test-user", "1")
        .header("x-test-superuser", "1")
        .body(Body::empty())
        .unwrap();
    let res = h.router.clone().oneshot(req).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await["route"], "catalog");
}

#[tokio::test]
async fn ordinary_user_on_admin_path_is_gated() {
    let h = harness();

    let res = h.router.clone().oneshot(request("/admin/panel", Some(USER), None)).await.unwrap();

    assert_eq!(res.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let h = harness();

    let res = h.router.clone().oneshot(request("/health", None, None)).await.unwrap();
    assert!(res.headers().get("x-request-id").is_some());

    let provided = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-test-123")
        .body(Body::empty())
        .unwrap();
    let res = h.router.clone().oneshot(provided).await.unwrap();
    assert_eq!(res.headers()["x-request-id"], "req-test-123");
}

#[tokio::test]
async fn tenancy_health_reports_loadable_studies_and_registry() {
    let h = harness();
    h.catalog.insert_membership(membership(ALPHA, "investigator", SiteScope::AllSites));
    point_session(&h, "s1", ALPHA).await;
    h.router.clone().oneshot(request("/whoami", Some(USER), Some("s1"))).await.unwrap();

    let res = h.router.clone().oneshot(request("/health/tenancy", None, None)).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["loadable"], json!(["alpha", "gamma"]));
    assert_eq!(body["registry"]["registered"], 1);
    assert_eq!(body["registry"]["per_tenant_usage"]["alpha"], 0);
}
