//! Short-lived cache of idempotent read responses
//!
//! Unlike the deduplicator, which only merges calls that overlap in time,
//! this cache serves a stored payload to later calls until its TTL runs out.
//! TTLs come from the route's class: near-static reference data is kept for
//! an hour, listings for seconds.
//!
//! Consistency is best effort. Writes purge overlapping routes, and anything
//! missed by a purge is at most one TTL stale. Caller-scoped entries are
//! indexed by user so that a role change drops them immediately.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::RouteKey;
use crate::auth::CacheInvalidationHook;
use crate::clock::{Clock, to_chrono};
use crate::observability::metrics::{record_cache_invalidation, record_response_cache_lookup};
use crate::tasks::BackgroundTask;

/// Freshness class of a route's data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteClass {
    /// Near-static data such as category lists
    Reference,
    /// Frequently changing collections
    Listing,
    Default,
}

/// Caching policy for routes under a prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub prefix: String,
    pub class: RouteClass,
    /// Data differs per caller; the key includes the user id
    #[serde(default)]
    pub caller_scoped: bool,
}

impl RouteRule {
    pub fn new(prefix: impl Into<String>, class: RouteClass) -> Self {
        Self {
            prefix: prefix.into(),
            class,
            caller_scoped: false,
        }
    }

    pub fn caller_scoped(mut self) -> Self {
        self.caller_scoped = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ResponseCacheConfig {
    pub max_entries: usize,
    /// Larger bodies are passed through without being buffered or cached
    pub max_body_bytes: usize,
    pub sweep_interval: Duration,
    pub reference_ttl: Duration,
    pub listing_ttl: Duration,
    pub default_ttl: Duration,
    pub routes: Vec<RouteRule>,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_body_bytes: 1024 * 1024,
            sweep_interval: Duration::from_secs(60),
            reference_ttl: Duration::from_secs(3600),
            listing_ttl: Duration::from_secs(30),
            default_ttl: Duration::from_secs(60),
            routes: Vec::new(),
        }
    }
}

impl ResponseCacheConfig {
    pub fn ttl_for(&self, class: RouteClass) -> Duration {
        match class {
            RouteClass::Reference => self.reference_ttl,
            RouteClass::Listing => self.listing_ttl,
            RouteClass::Default => self.default_ttl,
        }
    }

    /// Most specific rule covering `path`
    pub fn rule_for(&self, path: &str) -> Option<&RouteRule> {
        let candidate = RouteKey::new("GET", path, None);
        self.routes
            .iter()
            .filter(|rule| candidate.route_within(&rule.prefix))
            .max_by_key(|rule| rule.prefix.trim_end_matches('/').len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseLookup<V> {
    Hit { payload: V, age: Duration },
    Miss,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub evictions: u64,
    pub expired: u64,
    pub purged: u64,
    pub stale_fills_dropped: u64,
}

/// Cache epoch observed before a miss is resolved
///
/// Fills that started before a purge or a user invalidation are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseTicket(u64);

struct StoredResponse<V> {
    payload: V,
    stored_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    seq: u64,
}

struct CacheState<V> {
    entries: HashMap<RouteKey, StoredResponse<V>>,
    order: BTreeMap<(DateTime<Utc>, u64), RouteKey>,
    by_user: HashMap<String, HashSet<RouteKey>>,
    next_seq: u64,
    epoch: u64,
    stats: ResponseCacheStats,
}

impl<V> Default for CacheState<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            by_user: HashMap::new(),
            next_seq: 0,
            epoch: 0,
            stats: ResponseCacheStats::default(),
        }
    }
}

impl<V> CacheState<V> {
    fn insert(&mut self, key: RouteKey, entry: StoredResponse<V>) {
        self.order.insert((entry.stored_at, entry.seq), key.clone());
        if let Some(user_id) = key.user_id() {
            self.by_user
                .entry(user_id.to_string())
                .or_default()
                .insert(key.clone());
        }
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &RouteKey) -> Option<StoredResponse<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&(entry.stored_at, entry.seq));
        if let Some(user_id) = key.user_id() {
            if let Some(keys) = self.by_user.get_mut(user_id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_user.remove(user_id);
                }
            }
        }
        Some(entry)
    }
}

pub struct ResponseCache<V> {
    config: ResponseCacheConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<CacheState<V>>,
}

impl<V> ResponseCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: ResponseCacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &ResponseCacheConfig {
        &self.config
    }

    pub async fn get(&self, key: &RouteKey) -> ResponseLookup<V> {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let live = state.entries.get(key).map(|entry| {
            if now >= entry.expires_at {
                None
            } else {
                let age = (now - entry.stored_at).to_std().unwrap_or_default();
                Some((entry.payload.clone(), age))
            }
        });

        let result = match live {
            Some(Some((payload, age))) => {
                state.stats.hits += 1;
                ResponseLookup::Hit { payload, age }
            }
            Some(None) => {
                state.remove(key);
                state.stats.expired += 1;
                state.stats.misses += 1;
                ResponseLookup::Miss
            }
            None => {
                state.stats.misses += 1;
                ResponseLookup::Miss
            }
        };
        drop(state);

        record_response_cache_lookup(matches!(result, ResponseLookup::Hit { .. }));
        result
    }

    pub async fn set(&self, key: RouteKey, payload: V, ttl: Duration) {
        let mut state = self.state.write().await;
        self.store(&mut state, key, payload, ttl);
    }

    pub async fn fill_ticket(&self) -> ResponseTicket {
        ResponseTicket(self.state.read().await.epoch)
    }

    /// Store `payload` unless a purge or invalidation ran since `ticket`
    ///
    /// Returns `false` when the write was discarded.
    pub async fn set_if_current(&self, ticket: ResponseTicket, key: RouteKey, payload: V, ttl: Duration) -> bool {
        let mut state = self.state.write().await;
        if state.epoch != ticket.0 {
            state.stats.stale_fills_dropped += 1;
            debug!(key = %key, "Discarded response that raced an invalidation");
            return false;
        }
        self.store(&mut state, key, payload, ttl);
        true
    }

    fn store(&self, state: &mut CacheState<V>, key: RouteKey, payload: V, ttl: Duration) {
        let now = self.clock.now();

        state.remove(&key);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.insert(
            key,
            StoredResponse {
                payload,
                stored_at: now,
                expires_at: now
                    .checked_add_signed(to_chrono(ttl))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
                seq,
            },
        );

        while state.entries.len() > self.config.max_entries {
            let Some(oldest) = state.order.values().next().cloned() else {
                break;
            };
            state.remove(&oldest);
            state.stats.evictions += 1;
        }
    }

    /// Drop every entry scoped to `user_id`
    pub async fn invalidate_user(&self, user_id: &str) -> usize {
        let mut state = self.state.write().await;
        state.epoch += 1;

        let doomed = state.by_user.remove(user_id).unwrap_or_default();
        for key in &doomed {
            state.remove(key);
        }
        state.stats.purged += doomed.len() as u64;
        doomed.len()
    }

    /// Drop every entry whose route is `prefix` or below it
    pub async fn purge_route(&self, prefix: &str) -> usize {
        let mut state = self.state.write().await;
        state.epoch += 1;
        let doomed: Vec<RouteKey> = state
            .entries
            .keys()
            .filter(|key| key.route_within(prefix))
            .cloned()
            .collect();

        for key in &doomed {
            state.remove(key);
        }
        state.stats.purged += doomed.len() as u64;

        if !doomed.is_empty() {
            debug!(prefix = %prefix, purged = doomed.len(), "Response cache purged");
        }
        doomed.len()
    }

    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let expired: Vec<RouteKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }
        state.stats.expired += expired.len() as u64;
        expired.len()
    }

    pub fn start_sweeper(self: &Arc<Self>) -> BackgroundTask {
        let cache = Arc::clone(self);
        BackgroundTask::spawn("response-cache-sweep", self.config.sweep_interval, move || {
            let cache = Arc::clone(&cache);
            async move {
                cache.sweep_expired().await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    pub async fn stats(&self) -> ResponseCacheStats {
        let state = self.state.read().await;
        ResponseCacheStats {
            entries: state.entries.len() as u64,
            ..state.stats.clone()
        }
    }
}

/// Drops a user's caller-scoped responses when their role changes
pub struct ResponseCacheInvalidator<V> {
    cache: Arc<ResponseCache<V>>,
}

impl<V> ResponseCacheInvalidator<V> {
    pub fn new(cache: Arc<ResponseCache<V>>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl<V> CacheInvalidationHook for ResponseCacheInvalidator<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn invalidate(&self, user_id: &str) {
        let dropped = self.cache.invalidate_user(user_id).await;
        record_cache_invalidation("response");
        debug!(user_id = %user_id, dropped, "Role mutation invalidated cached responses");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration as ChronoDuration;

    fn cache(max_entries: usize) -> (ResponseCache<String>, ManualClock) {
        let clock = ManualClock::default();
        let cache = ResponseCache::new(
            ResponseCacheConfig {
                max_entries,
                ..ResponseCacheConfig::default()
            },
            Arc::new(clock.clone()),
        );
        (cache, clock)
    }

    fn key(path: &str, query: Option<&str>) -> RouteKey {
        RouteKey::new("GET", path, query)
    }

    #[tokio::test]
    async fn test_hit_reports_age_until_ttl() {
        let (cache, clock) = cache(100);
        cache
            .set(key("/images", Some("category=x")), "body".to_string(), Duration::from_secs(30))
            .await;

        clock.advance(ChronoDuration::seconds(12));
        assert_eq!(
            cache.get(&key("/images", Some("category=x"))).await,
            ResponseLookup::Hit {
                payload: "body".to_string(),
                age: Duration::from_secs(12)
            }
        );

        clock.advance(ChronoDuration::seconds(19));
        assert_eq!(cache.get(&key("/images", Some("category=x"))).await, ResponseLookup::Miss);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_scoped_keys_are_separate() {
        let (cache, _) = cache(100);
        let alice = key("/favorites", None).scoped_to("alice");
        let bob = key("/favorites", None).scoped_to("bob");

        cache.set(alice.clone(), "alice's".to_string(), Duration::from_secs(60)).await;

        assert!(matches!(cache.get(&alice).await, ResponseLookup::Hit { .. }));
        assert_eq!(cache.get(&bob).await, ResponseLookup::Miss);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let (cache, clock) = cache(2);
        for path in ["/a", "/b", "/c"] {
            cache.set(key(path, None), path.to_string(), Duration::from_secs(60)).await;
            clock.advance(ChronoDuration::seconds(1));
        }

        assert_eq!(cache.get(&key("/a", None)).await, ResponseLookup::Miss);
        assert!(matches!(cache.get(&key("/c", None)).await, ResponseLookup::Hit { .. }));
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_purge_route_prefix() {
        let (cache, _) = cache(100);
        cache.set(key("/images", Some("page=1")), "p1".to_string(), Duration::from_secs(60)).await;
        cache.set(key("/images/7", None), "img".to_string(), Duration::from_secs(60)).await;
        cache.set(key("/categories", None), "cats".to_string(), Duration::from_secs(60)).await;

        assert_eq!(cache.purge_route("/images").await, 2);
        assert_eq!(cache.len().await, 1);
        assert!(matches!(cache.get(&key("/categories", None)).await, ResponseLookup::Hit { .. }));
    }

    #[tokio::test]
    async fn test_invalidate_user_drops_only_their_entries() {
        let (cache, _) = cache(100);
        let cache = Arc::new(cache);
        let alice = key("/profile", None).scoped_to("alice");
        let alice_images = key("/images", Some("page=2")).scoped_to("alice");
        let bob = key("/profile", None).scoped_to("bob");
        for k in [&alice, &alice_images, &bob] {
            cache.set(k.clone(), "body".to_string(), Duration::from_secs(60)).await;
        }
        cache.set(key("/categories", None), "shared".to_string(), Duration::from_secs(60)).await;

        ResponseCacheInvalidator::new(Arc::clone(&cache)).invalidate("alice").await;

        assert_eq!(cache.get(&alice).await, ResponseLookup::Miss);
        assert_eq!(cache.get(&alice_images).await, ResponseLookup::Miss);
        assert!(matches!(cache.get(&bob).await, ResponseLookup::Hit { .. }));
        assert!(matches!(cache.get(&key("/categories", None)).await, ResponseLookup::Hit { .. }));
        assert_eq!(cache.stats().await.purged, 2);
    }

    #[tokio::test]
    async fn test_fill_racing_invalidation_is_dropped() {
        let (cache, _) = cache(100);
        let alice = key("/profile", None).scoped_to("alice");

        let ticket = cache.fill_ticket().await;
        cache.invalidate_user("alice").await;
        assert!(!cache.set_if_current(ticket, alice.clone(), "old".to_string(), Duration::from_secs(60)).await);
        assert_eq!(cache.get(&alice).await, ResponseLookup::Miss);
        assert_eq!(cache.stats().await.stale_fills_dropped, 1);

        let ticket = cache.fill_ticket().await;
        assert!(cache.set_if_current(ticket, alice.clone(), "new".to_string(), Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_eviction_keeps_user_index_consistent() {
        let (cache, clock) = cache(1);
        cache.set(key("/a", None).scoped_to("alice"), "a".to_string(), Duration::from_secs(60)).await;
        clock.advance(ChronoDuration::seconds(1));
        cache.set(key("/b", None).scoped_to("bob"), "b".to_string(), Duration::from_secs(60)).await;

        assert_eq!(cache.invalidate_user("alice").await, 0);
        assert_eq!(cache.invalidate_user("bob").await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep() {
        let (cache, clock) = cache(100);
        cache.set(key("/short", None), "s".to_string(), Duration::from_secs(5)).await;
        cache.set(key("/long", None), "l".to_string(), Duration::from_secs(500)).await;

        clock.advance(ChronoDuration::seconds(6));
        assert_eq!(cache.sweep_expired().await, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[test]
    fn test_route_rules_pick_most_specific_prefix() {
        let config = ResponseCacheConfig {
            routes: vec![
                RouteRule::new("/images", RouteClass::Listing),
                RouteRule::new("/images/favorites", RouteClass::Default).caller_scoped(),
                RouteRule::new("/categories", RouteClass::Reference),
            ],
            ..ResponseCacheConfig::default()
        };

        assert_eq!(config.rule_for("/images/42").map(|r| r.class), Some(RouteClass::Listing));
        let favorites = config.rule_for("/images/favorites").unwrap();
        assert!(favorites.caller_scoped);
        assert_eq!(config.rule_for("/categories").map(|r| r.class), Some(RouteClass::Reference));
        assert!(config.rule_for("/admin").is_none());

        assert_eq!(config.ttl_for(RouteClass::Reference), Duration::from_secs(3600));
        assert_eq!(config.ttl_for(RouteClass::Listing), Duration::from_secs(30));
        assert_eq!(config.ttl_for(RouteClass::Default), Duration::from_secs(60));
    }
}
