use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use study_core::{
    ConnectionRegistry, ConnectionSettings, MemoryServer, PoolSettings, Route, TenancyError,
    TenantAlias,
};

fn alias(raw: &str) -> TenantAlias {
    TenantAlias::parse(raw).unwrap()
}

fn registry(server: &Arc<MemoryServer>, max: usize) -> Arc<ConnectionRegistry> {
    let pool = PoolSettings::default().with_max_connections(max);
    Arc::new(ConnectionRegistry::new(ConnectionSettings::default(), pool, server.clone()).unwrap())
}

fn server_with(databases: &[&str]) -> Arc<MemoryServer> {
    Arc::new(MemoryServer::with_databases(databases.iter().copied()))
}

#[tokio::test]
async fn concurrent_cold_registrations_build_once() {
    let server = server_with(&["study_alpha"]);
    server.set_check_delay(Duration::from_millis(50));
    let registry = registry(&server, 4);

    let results = join_all((0..16).map(|_| registry.register("alpha"))).await;
    assert!(results.iter().all(Result::is_ok));

    assert_eq!(server.checks(), 1);
    assert_eq!(registry.stats().cold_builds, 1);
    assert_eq!(registry.usage(&alias("alpha")), Some(16));
}

#[tokio::test]
async fn full_registry_evicts_least_recently_used_idle_entry() {
    let server = server_with(&["study_alpha", "study_beta", "study_gamma"]);
    let registry = registry(&server, 2);

    registry.register("alpha").await.unwrap();
    registry.register("beta").await.unwrap();
    registry.release(&alias("alpha"));

    registry.register("gamma").await.unwrap();

    assert!(!registry.is_registered(&alias("alpha")));
    assert!(registry.is_registered(&alias("beta")));
    assert!(registry.is_registered(&alias("gamma")));
    assert_eq!(registry.stats().evictions, 1);
    assert_eq!(server.closed(), vec!["alpha".to_string()]);
}

#[tokio::test]
async fn full_registry_in_use_rejects_with_capacity() {
    let server = server_with(&["study_alpha", "study_beta", "study_gamma"]);
    let registry = registry(&server, 2);

    let alpha = registry.acquire("alpha").await.unwrap();
    let _beta = registry.acquire("beta").await.unwrap();

    let err = registry.acquire("gamma").await.unwrap_err();
    assert!(matches!(err, TenancyError::Capacity { max: 2 }));
    assert!(err.is_retryable());
    assert_eq!(registry.stats().capacity_rejections, 1);
    assert_eq!(registry.stats().registered, 2);

    drop(alpha);
    let gamma = registry.acquire("gamma").await.unwrap();
    assert_eq!(gamma.config().database, "study_gamma");
}

#[tokio::test]
async fn failed_build_is_retried_on_next_call() {
    let server = server_with(&[]);
    let registry = registry(&server, 4);

    let err = registry.register("alpha").await.unwrap_err();
    assert!(matches!(err, TenancyError::Connectivity { .. }));
    assert!(!registry.is_registered(&alias("alpha")));

    server.add_database("study_alpha");
    registry.register("alpha").await.unwrap();

    assert_eq!(server.checks(), 2);
    let stats = registry.stats();
    assert_eq!(stats.errors.get("alpha"), Some(&1));
    assert_eq!(stats.per_tenant_usage.get("alpha"), Some(&1));
}

#[tokio::test]
async fn invalid_alias_never_reaches_the_backend() {
    let server = server_with(&["study_alpha"]);
    let registry = registry(&server, 4);

    let err = registry.register("alpha; DROP DATABASE x").await.unwrap_err();
    assert!(matches!(err, TenancyError::Validation { .. }));
    assert_eq!(server.checks(), 0);
    assert_eq!(registry.stats().registered, 0);
}

#[tokio::test]
async fn cancelled_request_releases_its_lease() {
    let server = server_with(&["study_alpha"]);
    let registry = registry(&server, 4);

    let task = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let _lease = registry.acquire("alpha").await.unwrap();
            std::future::pending::<()>().await;
        })
    };

    while registry.usage(&alias("alpha")) != Some(1) {
        tokio::task::yield_now().await;
    }
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert_eq!(registry.usage(&alias("alpha")), Some(0));
}

#[tokio::test]
async fn panicking_handler_releases_its_lease() {
    let server = server_with(&["study_alpha"]);
    let registry = registry(&server, 4);

    let task = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let _lease = registry.acquire("alpha").await.unwrap();
            panic!("handler failed");
        })
    };
    assert!(task.await.unwrap_err().is_panic());

    assert_eq!(registry.usage(&alias("alpha")), Some(0));
}

#[tokio::test]
async fn unmatched_release_does_not_underflow() {
    let server = server_with(&["study_alpha"]);
    let registry = registry(&server, 4);

    registry.register("alpha").await.unwrap();
    registry.release(&alias("alpha"));
    registry.release(&alias("alpha"));
    registry.release(&alias("never_registered"));

    assert_eq!(registry.usage(&alias("alpha")), Some(0));
}

#[tokio::test]
async fn resolve_follows_the_route() {
    let server = server_with(&["study_alpha"]);
    let registry = registry(&server, 4);
    registry.register("alpha").await.unwrap();

    let catalog = registry.resolve(&Route::Catalog).unwrap();
    assert_eq!(catalog.database, "study_catalog");

    let tenant = registry.resolve(&Route::Tenant(alias("alpha"))).unwrap();
    assert_eq!(tenant.database, "study_alpha");
    assert_eq!(tenant.search_path, vec!["data".to_string(), "public".to_string()]);

    assert!(registry.resolve(&Route::Tenant(alias("beta"))).is_none());
}

#[tokio::test(start_paused = true)]
async fn built_configs_are_reused_within_ttl() {
    let server = server_with(&["study_alpha", "study_beta"]);
    let pool = PoolSettings::default()
        .with_max_connections(1)
        .with_config_ttl(Duration::from_secs(60));
    let registry = Arc::new(
        ConnectionRegistry::new(ConnectionSettings::default(), pool, server.clone()).unwrap(),
    );

    registry.register("alpha").await.unwrap();
    registry.release(&alias("alpha"));
    registry.register("beta").await.unwrap();
    registry.release(&alias("beta"));
    assert_eq!(server.checks(), 2);

    // alpha was evicted, but its config is still fresh
    registry.register("alpha").await.unwrap();
    registry.release(&alias("alpha"));
    assert_eq!(server.checks(), 2);
    assert_eq!(server.opens(), 3);

    tokio::time::advance(Duration::from_secs(61)).await;
    registry.register("beta").await.unwrap();
    assert_eq!(server.checks(), 3);
    assert_eq!(registry.stats().evictions, 3);
}

#[tokio::test]
async fn reregistering_from_cached_config_reopens_the_connection() {
    let server = server_with(&["study_alpha", "study_beta"]);
    let registry = registry(&server, 1);

    registry.register("alpha").await.unwrap();
    registry.release(&alias("alpha"));
    registry.register("beta").await.unwrap();
    registry.release(&alias("beta"));
    assert_eq!(server.open_connections(), BTreeSet::from(["beta".to_string()]));

    registry.register("alpha").await.unwrap();

    assert!(registry.is_registered(&alias("alpha")));
    assert_eq!(server.checks(), 2);
    assert_eq!(server.open_connections(), BTreeSet::from(["alpha".to_string()]));
}

#[tokio::test(start_paused = true)]
async fn late_close_of_evicted_entry_keeps_newer_registration_open() {
    let server = server_with(&["study_alpha", "study_beta", "study_gamma"]);
    let registry = registry(&server, 2);

    registry.register("alpha").await.unwrap();
    registry.release(&alias("alpha"));
    tokio::time::advance(Duration::from_millis(1)).await;
    registry.register("beta").await.unwrap();
    registry.release(&alias("beta"));

    server.set_close_delay(Duration::from_millis(100));
    let evicting = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.register("gamma").await })
    };
    while registry.is_registered(&alias("alpha")) {
        tokio::task::yield_now().await;
    }

    // evicts beta; alpha's close from the first eviction is still pending
    registry.register("alpha").await.unwrap();
    evicting.await.unwrap().unwrap();

    assert_eq!(
        server.open_connections(),
        BTreeSet::from(["alpha".to_string(), "gamma".to_string()])
    );
    assert_eq!(server.closed(), vec!["beta".to_string()]);
}

#[tokio::test]
async fn failed_open_keeps_the_idle_entry() {
    let server = server_with(&["study_alpha", "study_beta"]);
    let registry = registry(&server, 1);

    registry.register("alpha").await.unwrap();
    registry.release(&alias("alpha"));
    registry.register("beta").await.unwrap();
    registry.release(&alias("beta"));

    server.set_available(false);
    let err = registry.register("alpha").await.unwrap_err();

    assert!(matches!(err, TenancyError::Connectivity { .. }));
    assert!(registry.is_registered(&alias("beta")));
    assert!(!registry.is_registered(&alias("alpha")));
    assert_eq!(registry.stats().errors.get("alpha"), Some(&1));
}

#[tokio::test]
async fn create_tenant_database_rejects_hostile_identifier_before_connecting() {
    let server = server_with(&[]);
    let registry = registry(&server, 4);

    let err = registry
        .create_tenant_database("1); DROP SCHEMA data;--")
        .await
        .unwrap_err();

    assert!(matches!(err, TenancyError::Validation { .. }));
    assert!(server.statements().is_empty());
    assert_eq!(server.checks(), 0);
}

#[tokio::test]
async fn create_tenant_database_is_idempotent() {
    let server = server_with(&[]);
    let registry = registry(&server, 4);

    registry.create_tenant_database("alpha").await.unwrap();
    registry.create_tenant_database("alpha").await.unwrap();

    let creates = server
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("CREATE DATABASE"))
        .count();
    assert_eq!(creates, 1);
    assert!(server.has_database("study_alpha"));
    assert!(server.has_schema("study_alpha", "data"));
}

#[tokio::test]
async fn shutdown_closes_every_registration() {
    let server = server_with(&["study_alpha", "study_beta"]);
    let registry = registry(&server, 4);
    registry.register("alpha").await.unwrap();
    registry.register("beta").await.unwrap();

    registry.shutdown().await;

    let mut closed = server.closed();
    closed.sort();
    assert_eq!(closed, vec!["alpha".to_string(), "beta".to_string()]);
    assert_eq!(registry.stats().registered, 0);
}
