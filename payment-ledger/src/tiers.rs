//! Subscription tier resolution with a TTL cache
//!
//! Repeated gating reads hit a process-local cache keyed by user id; the
//! locked section is O(1) and the subscription load happens outside the lock.
//! Invalidation is a hard contract: the only subscription mutation path in
//! this core (`PaymentLedger::upsert_subscription`) invalidates internally,
//! so in-process mutators cannot forget to call it.

use crate::types::Tier;
use crate::{Result, Storage};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

struct CacheEntry {
    tier: Tier,
    cached_at: Instant,
}

/// Read-side cache of users' entitlement tiers
pub struct TierResolver {
    storage: Arc<Storage>,
    ttl: Duration,
    cache: Mutex<HashMap<Uuid, CacheEntry>>,
}

impl TierResolver {
    /// Create a resolver over `storage` with a fixed entry TTL
    pub fn new(storage: Arc<Storage>, ttl: Duration) -> Self {
        Self {
            storage,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a user's current tier
    ///
    /// Misses load the subscription row; a lapsed billing period downgrades
    /// to the lowest tier before the cache is populated.
    pub fn resolve(&self, user_id: Uuid) -> Result<Tier> {
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(&user_id) {
                if entry.cached_at.elapsed() < self.ttl {
                    return Ok(entry.tier);
                }
            }
        }

        let tier = match self.storage.get_subscription(user_id)? {
            Some(subscription) => subscription.effective_tier(Utc::now()),
            None => Tier::Free,
        };

        self.cache.lock().insert(
            user_id,
            CacheEntry {
                tier,
                cached_at: Instant::now(),
            },
        );

        tracing::debug!(user_id = %user_id, tier = %tier, "Tier cache populated");

        Ok(tier)
    }

    /// Drop the cached entry for a user
    ///
    /// Must be called by every subscription mutation path.
    pub fn invalidate(&self, user_id: Uuid) {
        self.cache.lock().remove(&user_id);
    }
}
