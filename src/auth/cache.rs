//! Cache of resolved authorization decisions
//!
//! This module keeps the outcome of role evaluation close to the request path
//! so that most calls never reach the role store.
//!
//! The cache is designed with security in mind:
//! - A miss never implies access; callers must re-evaluate on miss
//! - Entries expire after a TTL (5 minutes by default)
//! - Invalidation is indexed by user, so revoking a role removes every
//!   cached decision for that user without scanning the whole cache
//! - Fills that raced with an invalidation are dropped rather than stored
//!
//! # Key shape
//!
//! Decisions for roles without an IP allowlist do not depend on the caller's
//! address and are stored once per user. Decisions for IP-restricted roles
//! are stored per `(user, caller IP)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::Decision;
use crate::clock::{Clock, to_chrono};
use crate::observability::metrics::record_permission_cache_lookup;
use crate::tasks::BackgroundTask;

/// What gets cached for a caller: the decision plus whether it depended on IP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CachedAccess {
    pub decision: Decision,
    pub ip_restricted: bool,
}

/// Result of a cache lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(CachedAccess),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

/// Proof that no invalidation happened between taking the ticket and writing
///
/// Taken before the role store is queried on a miss, and checked when the
/// resulting decision is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket(u64);

/// Permission cache interface
///
/// Implementations must be safe under concurrent callers and must never turn
/// an internal problem into a permissive answer: when in doubt, return
/// [`CacheLookup::Miss`].
#[async_trait]
pub trait PermissionCache: Send + Sync {
    /// Look up the cached decision for a caller
    async fn get(&self, user_id: &str, caller_ip: IpAddr) -> CacheLookup;

    /// Store a decision, replacing any existing entry under the same key
    async fn set(&self, user_id: &str, caller_ip: IpAddr, access: CachedAccess, ttl: Duration);

    /// Take a ticket before resolving a miss
    async fn fill_ticket(&self) -> FillTicket;

    /// Store a decision only if no invalidation happened since `ticket`
    ///
    /// Returns `false` when the write was discarded.
    async fn set_if_current(
        &self,
        ticket: FillTicket,
        user_id: &str,
        caller_ip: IpAddr,
        access: CachedAccess,
        ttl: Duration,
    ) -> bool;

    /// Remove every cached decision for a user
    async fn invalidate(&self, user_id: &str);

    /// Number of entries currently held, expired or not
    async fn size(&self) -> usize;

    async fn clear(&self);

    /// TTL used when the caller has no route-specific value
    fn default_ttl(&self) -> Duration;

    async fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Cache statistics for monitoring and debugging
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    /// Hit rate as percentage (0.0 - 100.0)
    pub hit_rate: f64,
    /// Entries removed to respect the capacity bound
    pub evictions: u64,
    /// Entries removed because their TTL passed
    pub expired: u64,
    /// Entries removed by user invalidation
    pub invalidated: u64,
    /// Fills discarded because an invalidation raced them
    pub stale_fills_dropped: u64,
}

impl CacheStats {
    pub fn calculate_hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

/// Configuration for the permission cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of live entries before oldest-first eviction
    pub max_entries: usize,
    pub default_ttl: Duration,
    /// Interval of the background sweep of expired entries
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    access: CachedAccess,
    inserted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.inserted_at, self.seq)
    }
}

/// `None` is the shared entry of an unrestricted role
type Slot = Option<IpAddr>;

#[derive(Debug, Default)]
struct CacheState {
    users: HashMap<String, HashMap<Slot, CacheEntry>>,
    /// Insertion order, oldest first, for capacity eviction
    order: BTreeMap<(DateTime<Utc>, u64), (String, Slot)>,
    len: usize,
    next_seq: u64,
    epoch: u64,
    stats: CacheStats,
}

impl CacheState {
    fn remove_entry(&mut self, user_id: &str, slot: Slot) -> Option<CacheEntry> {
        let bucket = self.users.get_mut(user_id)?;
        let entry = bucket.remove(&slot)?;
        if bucket.is_empty() {
            self.users.remove(user_id);
        }
        self.order.remove(&entry.order_key());
        self.len -= 1;
        Some(entry)
    }

    fn insert(&mut self, user_id: &str, slot: Slot, access: CachedAccess, now: DateTime<Utc>, ttl: Duration) {
        self.remove_entry(user_id, slot);

        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = CacheEntry {
            access,
            inserted_at: now,
            expires_at: now
                .checked_add_signed(to_chrono(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            seq,
        };

        self.order.insert(entry.order_key(), (user_id.to_string(), slot));
        self.users
            .entry(user_id.to_string())
            .or_default()
            .insert(slot, entry);
        self.len += 1;
    }

    fn evict_to(&mut self, capacity: usize) -> u64 {
        let mut evicted = 0;
        while self.len > capacity {
            let Some((_, (user_id, slot))) = self.order.pop_first() else {
                break;
            };
            if let Some(bucket) = self.users.get_mut(&user_id) {
                if bucket.remove(&slot).is_some() {
                    self.len -= 1;
                    evicted += 1;
                }
                if bucket.is_empty() {
                    self.users.remove(&user_id);
                }
            }
        }
        self.stats.evictions += evicted;
        evicted
    }

    /// Find the live entry for a caller, dropping expired entries on the way
    fn lookup(&mut self, user_id: &str, caller_ip: IpAddr, now: DateTime<Utc>) -> Option<CachedAccess> {
        for slot in [None, Some(caller_ip)] {
            let state = self
                .users
                .get(user_id)
                .and_then(|bucket| bucket.get(&slot))
                .map(|entry| (entry.is_expired(now), entry.access));

            match state {
                Some((false, access)) => return Some(access),
                Some((true, _)) => {
                    self.remove_entry(user_id, slot);
                    self.stats.expired += 1;
                }
                None => {}
            }
        }
        None
    }
}

fn slot_for(access: &CachedAccess, caller_ip: IpAddr) -> Slot {
    if access.ip_restricted { Some(caller_ip) } else { None }
}

/// In-memory permission cache
///
/// This implementation provides:
/// - TTL expiry, checked lazily on `get` and by a periodic sweep
/// - Oldest-insertion-first eviction at capacity
/// - Per-user invalidation without scanning other users' entries
/// - An invalidation epoch that rejects fills which raced a revocation
///
/// All operations hold the internal lock only for map updates; nothing
/// awaits an external call while holding it.
pub struct InMemoryPermissionCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<CacheState>,
}

impl InMemoryPermissionCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Remove expired entries; returns how many were dropped
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let expired: Vec<(String, Slot)> = state
            .users
            .iter()
            .flat_map(|(user_id, bucket)| {
                bucket
                    .iter()
                    .filter(|(_, entry)| entry.is_expired(now))
                    .map(|(slot, _)| (user_id.clone(), *slot))
            })
            .collect();

        for (user_id, slot) in &expired {
            state.remove_entry(user_id, *slot);
        }
        state.stats.expired += expired.len() as u64;

        if !expired.is_empty() {
            debug!(removed = expired.len(), remaining = state.len, "Permission cache sweep");
        }
        expired.len()
    }

    /// Start the periodic sweep; stopping the returned task stops sweeping
    pub fn start_sweeper(self: &Arc<Self>) -> BackgroundTask {
        let cache = Arc::clone(self);
        BackgroundTask::spawn("permission-cache-sweep", self.config.sweep_interval, move || {
            let cache = Arc::clone(&cache);
            async move {
                cache.sweep_expired().await;
            }
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

#[async_trait]
impl PermissionCache for InMemoryPermissionCache {
    async fn get(&self, user_id: &str, caller_ip: IpAddr) -> CacheLookup {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let result = match state.lookup(user_id, caller_ip, now) {
            Some(access) => {
                state.stats.hits += 1;
                CacheLookup::Hit(access)
            }
            None => {
                state.stats.misses += 1;
                CacheLookup::Miss
            }
        };
        drop(state);

        record_permission_cache_lookup(result.is_hit());
        result
    }

    async fn set(&self, user_id: &str, caller_ip: IpAddr, access: CachedAccess, ttl: Duration) {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        state.insert(user_id, slot_for(&access, caller_ip), access, now, ttl);
        let evicted = state.evict_to(self.config.max_entries);

        if evicted > 0 {
            debug!(evicted, capacity = self.config.max_entries, "Permission cache at capacity");
        }
    }

    async fn fill_ticket(&self) -> FillTicket {
        FillTicket(self.state.read().await.epoch)
    }

    async fn set_if_current(
        &self,
        ticket: FillTicket,
        user_id: &str,
        caller_ip: IpAddr,
        access: CachedAccess,
        ttl: Duration,
    ) -> bool {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        if state.epoch != ticket.0 {
            state.stats.stale_fills_dropped += 1;
            debug!(user_id = %user_id, "Discarding cache fill that raced an invalidation");
            return false;
        }

        state.insert(user_id, slot_for(&access, caller_ip), access, now, ttl);
        state.evict_to(self.config.max_entries);
        true
    }

    async fn invalidate(&self, user_id: &str) {
        let mut state = self.state.write().await;
        state.epoch += 1;

        let Some(bucket) = state.users.remove(user_id) else {
            return;
        };
        for entry in bucket.values() {
            state.order.remove(&entry.order_key());
        }
        state.len -= bucket.len();
        state.stats.invalidated += bucket.len() as u64;

        info!(user_id = %user_id, removed = bucket.len(), "Permission cache invalidated for user");
    }

    async fn size(&self) -> usize {
        self.state.read().await.len
    }

    async fn clear(&self) {
        let mut state = self.state.write().await;
        state.epoch += 1;
        state.users.clear();
        state.order.clear();
        state.len = 0;
    }

    fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        let mut result = state.stats.clone();
        result.entries = state.len as u64;
        result.hit_rate = CacheStats::calculate_hit_rate(result.hits, result.misses);
        result
    }
}

/// Cache that stores nothing
///
/// Every lookup misses, so every request is evaluated against the role store.
/// Used when caching is disabled by configuration.
pub struct NoopPermissionCache {
    default_ttl: Duration,
}

impl NoopPermissionCache {
    pub fn new() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
        }
    }
}

impl Default for NoopPermissionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionCache for NoopPermissionCache {
    async fn get(&self, user_id: &str, _caller_ip: IpAddr) -> CacheLookup {
        debug!(user_id = %user_id, "Cache miss (caching disabled)");
        CacheLookup::Miss
    }

    async fn set(&self, _user_id: &str, _caller_ip: IpAddr, _access: CachedAccess, _ttl: Duration) {}

    async fn fill_ticket(&self) -> FillTicket {
        FillTicket(0)
    }

    async fn set_if_current(
        &self,
        _ticket: FillTicket,
        _user_id: &str,
        _caller_ip: IpAddr,
        _access: CachedAccess,
        _ttl: Duration,
    ) -> bool {
        false
    }

    async fn invalidate(&self, _user_id: &str) {}

    async fn size(&self) -> usize {
        0
    }

    async fn clear(&self) {}

    fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{DenyReason, Permission, PermissionSet};
    use crate::clock::ManualClock;
    use chrono::Duration as ChronoDuration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn authorized(ip_restricted: bool) -> CachedAccess {
        CachedAccess {
            decision: Decision::Authorized(PermissionSet::default().with(Permission::ViewImages)),
            ip_restricted,
        }
    }

    fn cache_with(max_entries: usize) -> (InMemoryPermissionCache, ManualClock) {
        let clock = ManualClock::default();
        let cache = InMemoryPermissionCache::new(
            CacheConfig {
                max_entries,
                ..CacheConfig::default()
            },
            Arc::new(clock.clone()),
        );
        (cache, clock)
    }

    #[tokio::test]
    async fn test_ttl_boundaries() {
        let (cache, clock) = cache_with(1000);
        let ttl = Duration::from_secs(300);

        cache.set("alice", ip("10.0.0.1"), authorized(false), ttl).await;

        clock.advance(ChronoDuration::seconds(299));
        assert_eq!(cache.get("alice", ip("10.0.0.1")).await, CacheLookup::Hit(authorized(false)));

        clock.advance(ChronoDuration::seconds(2));
        assert_eq!(cache.get("alice", ip("10.0.0.1")).await, CacheLookup::Miss);

        // Lazily removed on the expired lookup
        assert_eq!(cache.size().await, 0);
        assert_eq!(cache.stats().await.expired, 1);
    }

    #[tokio::test]
    async fn test_unrestricted_entry_shared_across_ips() {
        let (cache, _) = cache_with(1000);
        cache.set("alice", ip("10.0.0.1"), authorized(false), Duration::from_secs(60)).await;

        assert!(cache.get("alice", ip("192.168.7.7")).await.is_hit());
        assert!(cache.get("alice", ip("2001:db8::1")).await.is_hit());
        assert_eq!(cache.size().await, 1);
    }

    #[tokio::test]
    async fn test_restricted_entries_are_per_ip() {
        let (cache, _) = cache_with(1000);
        let denied = CachedAccess {
            decision: Decision::Denied(DenyReason::IpRestricted),
            ip_restricted: true,
        };

        cache.set("bob", ip("192.168.1.50"), authorized(true), Duration::from_secs(60)).await;
        cache.set("bob", ip("10.0.0.1"), denied, Duration::from_secs(60)).await;

        assert_eq!(cache.get("bob", ip("192.168.1.50")).await, CacheLookup::Hit(authorized(true)));
        assert_eq!(cache.get("bob", ip("10.0.0.1")).await, CacheLookup::Hit(denied));
        assert_eq!(cache.get("bob", ip("172.16.0.1")).await, CacheLookup::Miss);
        assert_eq!(cache.size().await, 2);
    }

    #[tokio::test]
    async fn test_set_replaces_existing_entry() {
        let (cache, _) = cache_with(1000);
        let denied = CachedAccess {
            decision: Decision::Denied(DenyReason::Inactive),
            ip_restricted: false,
        };

        cache.set("alice", ip("10.0.0.1"), authorized(false), Duration::from_secs(60)).await;
        cache.set("alice", ip("10.0.0.2"), denied, Duration::from_secs(60)).await;

        assert_eq!(cache.size().await, 1);
        assert_eq!(cache.get("alice", ip("10.0.0.1")).await, CacheLookup::Hit(denied));
    }

    #[tokio::test]
    async fn test_invalidate_removes_every_entry_for_user() {
        let (cache, _) = cache_with(1000);
        for caller in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            cache.set("bob", ip(caller), authorized(true), Duration::from_secs(60)).await;
        }
        cache.set("carol", ip("10.0.0.1"), authorized(false), Duration::from_secs(60)).await;

        cache.invalidate("bob").await;

        for caller in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            assert_eq!(cache.get("bob", ip(caller)).await, CacheLookup::Miss);
        }
        assert!(cache.get("carol", ip("10.0.0.1")).await.is_hit());
        assert_eq!(cache.size().await, 1);
        assert_eq!(cache.stats().await.invalidated, 3);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_insertion_first() {
        let (cache, clock) = cache_with(2);

        cache.set("u1", ip("10.0.0.1"), authorized(false), Duration::from_secs(600)).await;
        clock.advance(ChronoDuration::seconds(1));
        cache.set("u2", ip("10.0.0.1"), authorized(false), Duration::from_secs(600)).await;
        clock.advance(ChronoDuration::seconds(1));

        // Reading u1 does not refresh its position
        assert!(cache.get("u1", ip("10.0.0.1")).await.is_hit());

        cache.set("u3", ip("10.0.0.1"), authorized(false), Duration::from_secs(600)).await;

        assert_eq!(cache.get("u1", ip("10.0.0.1")).await, CacheLookup::Miss);
        assert!(cache.get("u2", ip("10.0.0.1")).await.is_hit());
        assert!(cache.get("u3", ip("10.0.0.1")).await.is_hit());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_fill_after_invalidation_is_discarded() {
        let (cache, _) = cache_with(1000);

        let ticket = cache.fill_ticket().await;
        cache.invalidate("alice").await;

        let stored = cache
            .set_if_current(ticket, "alice", ip("10.0.0.1"), authorized(false), Duration::from_secs(60))
            .await;

        assert!(!stored);
        assert_eq!(cache.get("alice", ip("10.0.0.1")).await, CacheLookup::Miss);
        assert_eq!(cache.stats().await.stale_fills_dropped, 1);

        // A ticket taken after the invalidation is honored
        let ticket = cache.fill_ticket().await;
        assert!(
            cache
                .set_if_current(ticket, "alice", ip("10.0.0.1"), authorized(false), Duration::from_secs(60))
                .await
        );
        assert!(cache.get("alice", ip("10.0.0.1")).await.is_hit());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (cache, clock) = cache_with(1000);
        cache.set("short", ip("10.0.0.1"), authorized(false), Duration::from_secs(10)).await;
        cache.set("long", ip("10.0.0.1"), authorized(false), Duration::from_secs(600)).await;

        clock.advance(ChronoDuration::seconds(11));
        assert_eq!(cache.sweep_expired().await, 1);
        assert_eq!(cache.size().await, 1);
        assert!(cache.get("long", ip("10.0.0.1")).await.is_hit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_runs_on_interval() {
        let clock = ManualClock::default();
        let cache = Arc::new(InMemoryPermissionCache::new(
            CacheConfig {
                sweep_interval: Duration::from_secs(300),
                ..CacheConfig::default()
            },
            Arc::new(clock.clone()),
        ));
        cache.set("alice", ip("10.0.0.1"), authorized(false), Duration::from_secs(60)).await;

        let sweeper = cache.start_sweeper();
        clock.advance(ChronoDuration::seconds(61));
        tokio::time::sleep(Duration::from_secs(301)).await;

        assert_eq!(cache.size().await, 0);
        sweeper.stop().await;
    }

    #[tokio::test]
    async fn test_stats_tracking() {
        let (cache, _) = cache_with(1000);
        cache.set("alice", ip("10.0.0.1"), authorized(false), Duration::from_secs(60)).await;

        let _ = cache.get("alice", ip("10.0.0.1")).await;
        let _ = cache.get("nobody", ip("10.0.0.1")).await;

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 50.0);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let (cache, _) = cache_with(1000);
        let cache = Arc::new(cache);
        let mut handles = vec![];

        for i in 0..20 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let user = format!("user{}", i);
                cache.set(&user, ip("10.0.0.1"), authorized(false), Duration::from_secs(300)).await;
                cache.get(&user, ip("10.0.0.1")).await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_hit());
        }
        assert_eq!(cache.size().await, 20);
    }

    #[tokio::test]
    async fn test_noop_cache_always_misses() {
        let cache = NoopPermissionCache::new();
        cache.set("alice", ip("10.0.0.1"), authorized(false), Duration::from_secs(60)).await;
        assert_eq!(cache.get("alice", ip("10.0.0.1")).await, CacheLookup::Miss);
        assert_eq!(cache.size().await, 0);

        let ticket = cache.fill_ticket().await;
        assert!(
            !cache
                .set_if_current(ticket, "alice", ip("10.0.0.1"), authorized(false), Duration::from_secs(60))
                .await
        );
    }

    #[test]
    fn test_cache_stats_calculate_hit_rate() {
        assert_eq!(CacheStats::calculate_hit_rate(0, 0), 0.0);
        assert_eq!(CacheStats::calculate_hit_rate(50, 50), 50.0);
        assert_eq!(CacheStats::calculate_hit_rate(80, 20), 80.0);
    }
}
