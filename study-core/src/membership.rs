//! Membership validation with a short-lived positive cache.
//!
//! Only valid memberships are cached. Validity is re-evaluated on every
//! read, so a membership that expires while cached is rejected
//! immediately; deactivation is picked up once the entry's TTL lapses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::catalog::TenantCatalog;
use crate::errors::{TenancyError, TenancyResult};
use crate::tenant::{Membership, TenantId};

pub const DEFAULT_MEMBERSHIP_TTL: Duration = Duration::from_secs(300);

struct CachedMembership {
    membership: Membership,
    cached_at: Instant,
}

pub struct MembershipCache {
    ttl: Duration,
    entries: RwLock<HashMap<(i64, TenantId), CachedMembership>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MembershipCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A cached membership that is still fresh and still valid.
    pub fn get(&self, user_id: i64, tenant_id: TenantId) -> Option<Membership> {
        let key = (user_id, tenant_id);
        let stale_since = {
            let entries = self.entries.read();
            match entries.get(&key) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(cached) if cached.cached_at.elapsed() < self.ttl && cached.membership.is_valid() => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(cached.membership.clone());
                }
                Some(cached) => cached.cached_at,
            }
        };

        self.remove_stale(key, stale_since);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Remove the entry cached at `cached_at`; a newer entry for the key stays.
    fn remove_stale(&self, key: (i64, TenantId), cached_at: Instant) {
        let mut entries = self.entries.write();
        if entries.get(&key).map(|cached| cached.cached_at) == Some(cached_at) {
            entries.remove(&key);
        }
    }

    /// Cache a membership. Invalid ones are ignored.
    pub fn insert(&self, membership: Membership) {
        if !membership.is_valid() {
            return;
        }
        let key = (membership.user_id, membership.tenant_id);
        self.entries.write().insert(
            key,
            CachedMembership {
                membership,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, user_id: i64, tenant_id: TenantId) {
        self.entries.write().remove(&(user_id, tenant_id));
    }

    pub fn invalidate_user(&self, user_id: i64) {
        self.entries.write().retain(|(user, _), _| *user != user_id);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for MembershipCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEMBERSHIP_TTL)
    }
}

/// Cache first, then a non-blocking locked read, then a plain read if
/// another request holds the row.
pub struct MembershipValidator {
    catalog: Arc<dyn TenantCatalog>,
    cache: Arc<MembershipCache>,
}

impl MembershipValidator {
    pub fn new(catalog: Arc<dyn TenantCatalog>, cache: Arc<MembershipCache>) -> Self {
        Self { catalog, cache }
    }

    pub fn cache(&self) -> &Arc<MembershipCache> {
        &self.cache
    }

    /// The valid membership of `user_id` in `tenant_id`, if any.
    ///
    /// `Ok(None)` means access is denied. `Err` means the catalog could
    /// not answer.
    pub async fn validate(&self, user_id: i64, tenant_id: TenantId) -> TenancyResult<Option<Membership>> {
        if let Some(membership) = self.cache.get(user_id, tenant_id) {
            return Ok(Some(membership));
        }

        let found = match self.catalog.lock_membership(user_id, tenant_id).await {
            Ok(found) => found,
            Err(TenancyError::RaceLoss { .. }) => {
                debug!(user_id, %tenant_id, "membership row busy, falling back to plain read");
                // the winner may already have populated the cache
                if let Some(membership) = self.cache.get(user_id, tenant_id) {
                    return Ok(Some(membership));
                }
                self.catalog.find_membership(user_id, tenant_id).await?
            }
            Err(err) => {
                warn!(user_id, %tenant_id, %err, "membership check failed");
                return Err(err);
            }
        };

        match found {
            Some(membership) if membership.is_valid() => {
                self.cache.insert(membership.clone());
                Ok(Some(membership))
            }
            _ => {
                self.cache.invalidate(user_id, tenant_id);
                Ok(None)
            }
        }
    }
}
