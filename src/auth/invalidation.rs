//! Invalidation fired by role mutations
//!
//! A role write must not report success while a cached decision for the old
//! role can still be served. Mutating code awaits [`CacheInvalidationHook::invalidate`]
//! before returning.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::PermissionCache;
use crate::observability::metrics::record_cache_invalidation;

#[async_trait]
pub trait CacheInvalidationHook: Send + Sync {
    /// Drop everything cached for `user_id`; returns once the drop is visible
    async fn invalidate(&self, user_id: &str);
}

/// Invalidates a permission cache
pub struct PermissionCacheInvalidator {
    cache: Arc<dyn PermissionCache>,
}

impl PermissionCacheInvalidator {
    pub fn new(cache: Arc<dyn PermissionCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl CacheInvalidationHook for PermissionCacheInvalidator {
    async fn invalidate(&self, user_id: &str) {
        self.cache.invalidate(user_id).await;
        record_cache_invalidation("permission");
        debug!(user_id = %user_id, "Role mutation invalidated permission cache");
    }
}

/// Runs several hooks in order
#[derive(Default)]
pub struct InvalidationChain {
    hooks: Vec<Arc<dyn CacheInvalidationHook>>,
}

impl InvalidationChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hook: Arc<dyn CacheInvalidationHook>) -> Self {
        self.hooks.push(hook);
        self
    }
}

#[async_trait]
impl CacheInvalidationHook for InvalidationChain {
    async fn invalidate(&self, user_id: &str) {
        for hook in &self.hooks {
            hook.invalidate(user_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CacheLookup, CacheConfig, CachedAccess, Decision, InMemoryPermissionCache, PermissionSet};
    use crate::clock::SystemClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHook(AtomicUsize);

    #[async_trait]
    impl CacheInvalidationHook for CountingHook {
        async fn invalidate(&self, _user_id: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_invalidator_clears_user_entries() {
        let cache = Arc::new(InMemoryPermissionCache::new(CacheConfig::default(), Arc::new(SystemClock)));
        let ip = "10.0.0.1".parse().unwrap();
        let access = CachedAccess {
            decision: Decision::Authorized(PermissionSet::all()),
            ip_restricted: false,
        };
        cache.set("alice", ip, access, Duration::from_secs(300)).await;

        let hook = PermissionCacheInvalidator::new(cache.clone());
        hook.invalidate("alice").await;

        assert_eq!(cache.get("alice", ip).await, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn test_chain_runs_every_hook() {
        let first = Arc::new(CountingHook(AtomicUsize::new(0)));
        let second = Arc::new(CountingHook(AtomicUsize::new(0)));
        let chain = InvalidationChain::new().with(first.clone()).with(second.clone());

        chain.invalidate("alice").await;

        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }
}
