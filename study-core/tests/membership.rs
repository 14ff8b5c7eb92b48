use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use study_core::{
    Membership, MembershipCache, MembershipValidator, MemoryCatalog, SiteScope, TenancyError,
    TenantId,
};

const USER: i64 = 7;
const STUDY: TenantId = TenantId(1);

fn membership() -> Membership {
    Membership {
        user_id: USER,
        tenant_id: STUDY,
        role: "investigator".into(),
        site_scope: SiteScope::AllSites,
        is_active: true,
        expires_at: None,
    }
}

fn validator(catalog: &Arc<MemoryCatalog>, ttl: Duration) -> MembershipValidator {
    MembershipValidator::new(catalog.clone(), Arc::new(MembershipCache::new(ttl)))
}

#[tokio::test]
async fn concurrent_checks_for_one_pair_all_succeed() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_membership(membership());
    catalog.set_lock_hold(Duration::from_millis(50));
    let validator = validator(&catalog, Duration::from_secs(300));

    let results = join_all((0..8).map(|_| validator.validate(USER, STUDY))).await;

    for result in results {
        assert_eq!(result.unwrap().map(|m| m.role), Some("investigator".to_string()));
    }
    assert_eq!(catalog.locked_reads(), 1);
    assert_eq!(catalog.race_losses(), 7);
    assert_eq!(catalog.plain_reads(), 7);
}

#[tokio::test]
async fn cached_membership_skips_the_catalog() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_membership(membership());
    let validator = validator(&catalog, Duration::from_secs(300));

    validator.validate(USER, STUDY).await.unwrap();
    validator.validate(USER, STUDY).await.unwrap();

    assert_eq!(catalog.locked_reads(), 1);
    assert_eq!(validator.cache().hits(), 1);
}

#[tokio::test(start_paused = true)]
async fn deactivation_is_honoured_once_the_cache_entry_lapses() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_membership(membership());
    let validator = validator(&catalog, Duration::from_secs(60));

    assert!(validator.validate(USER, STUDY).await.unwrap().is_some());

    catalog.set_membership_active(USER, STUDY, false);
    assert!(validator.validate(USER, STUDY).await.unwrap().is_some());

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(validator.validate(USER, STUDY).await.unwrap().is_none());
}

#[tokio::test]
async fn expired_membership_is_denied() {
    let catalog = Arc::new(MemoryCatalog::new());
    let mut expired = membership();
    expired.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
    catalog.insert_membership(expired);
    let validator = validator(&catalog, Duration::from_secs(300));

    assert!(validator.validate(USER, STUDY).await.unwrap().is_none());
    assert!(validator.cache().is_empty());
}

#[tokio::test]
async fn missing_membership_is_denied() {
    let catalog = Arc::new(MemoryCatalog::new());
    let validator = validator(&catalog, Duration::from_secs(300));

    assert!(validator.validate(USER, STUDY).await.unwrap().is_none());
}

#[tokio::test]
async fn catalog_outage_is_an_error_not_a_denial() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_membership(membership());
    catalog.set_available(false);
    let validator = validator(&catalog, Duration::from_secs(300));

    let err = validator.validate(USER, STUDY).await.unwrap_err();
    assert!(matches!(err, TenancyError::Catalog { .. }));
}
