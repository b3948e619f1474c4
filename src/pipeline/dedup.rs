//! Single-flight execution of identical concurrent requests
//!
//! The first caller for a key becomes the leader: its `produce` future is
//! spawned as a task and registered in the in-flight table. Callers that
//! arrive while it runs await the same shared result. The task removes its
//! own table entry before the result is delivered, so a call made after
//! resolution always runs `produce` again.
//!
//! Because `produce` runs in its own task, a waiter that goes away (client
//! disconnect) does not cancel the work for the remaining waiters.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, error};

use crate::observability::metrics::record_dedup;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DedupError<E> {
    /// `produce` failed; every waiter sees the same failure
    #[error("{0}")]
    Upstream(E),

    /// `produce` panicked or its task was cancelled
    #[error("in-flight request was aborted")]
    Aborted,
}

type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, DedupError<E>>>>;

type InFlight<K, T, E> = Arc<Mutex<HashMap<K, (u64, SharedResult<T, E>)>>>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupStats {
    /// Calls that executed `produce`
    pub leaders: u64,
    /// Calls that joined an in-flight execution
    pub followers: u64,
    pub in_flight: usize,
}

pub struct RequestDeduplicator<K, T, E> {
    in_flight: InFlight<K, T, E>,
    next_id: AtomicU64,
    leaders: AtomicU64,
    followers: AtomicU64,
}

impl<K, T, E> Default for RequestDeduplicator<K, T, E> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            leaders: AtomicU64::new(0),
            followers: AtomicU64::new(0),
        }
    }
}

impl<K, T, E> RequestDeduplicator<K, T, E>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `produce` once for all concurrent callers with the same key
    pub async fn dedupe<F, Fut>(&self, key: K, produce: F) -> Result<T, DedupError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let shared = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some((_, shared)) => {
                    self.followers.fetch_add(1, Ordering::Relaxed);
                    record_dedup("follower");
                    shared.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let shared = self.start(key.clone(), id, produce);
                    in_flight.insert(key, (id, shared.clone()));
                    self.leaders.fetch_add(1, Ordering::Relaxed);
                    record_dedup("leader");
                    shared
                }
            }
        };

        shared.await
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            leaders: self.leaders.load(Ordering::Relaxed),
            followers: self.followers.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }

    fn start<F, Fut>(&self, key: K, id: u64, produce: F) -> SharedResult<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let table = Arc::clone(&self.in_flight);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = produce().await.map_err(DedupError::Upstream);
            remove_if_owner(&table, &task_key, id);
            result
        });

        let table = Arc::clone(&self.in_flight);
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "In-flight request task failed");
                    remove_if_owner(&table, &key, id);
                    Err(DedupError::Aborted)
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Remove the entry for `key` only if it still belongs to execution `id`
fn remove_if_owner<K: Hash + Eq, V>(table: &Mutex<HashMap<K, (u64, V)>>, key: &K, id: u64) {
    let mut table = table.lock();
    if table.get(key).is_some_and(|(owner, _)| *owner == id) {
        table.remove(key);
        debug!(execution = id, "In-flight record resolved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type Dedup = RequestDeduplicator<String, String, String>;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_run_produce_once() {
        let dedup = Arc::new(Dedup::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let dedup = dedup.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .dedupe("GET /images?category=x".to_string(), move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("payload".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok("payload".to_string()));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight(), 0);

        let stats = dedup.stats();
        assert_eq!(stats.leaders, 1);
        assert_eq!(stats.followers, 4);
    }

    #[tokio::test]
    async fn test_record_gone_after_resolution() {
        let dedup = Dedup::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let runs = runs.clone();
            let result = dedup
                .dedupe("key".to_string(), move || async move {
                    Ok(runs.fetch_add(1, Ordering::SeqCst).to_string())
                })
                .await;
            assert!(result.is_ok());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_shared() {
        let dedup = Arc::new(Dedup::new());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let dedup = dedup.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .dedupe("key".to_string(), || async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err::<String, _>("backend down".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                Err(DedupError::Upstream("backend down".to_string()))
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_waiter_does_not_cancel_work() {
        let dedup = Arc::new(Dedup::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let spawn_call = |dedup: Arc<Dedup>, runs: Arc<AtomicUsize>| {
            tokio::spawn(async move {
                dedup
                    .dedupe("key".to_string(), move || async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok("done".to_string())
                    })
                    .await
            })
        };

        let leader = spawn_call(dedup.clone(), runs.clone());
        let follower = spawn_call(dedup.clone(), runs.clone());
        tokio::task::yield_now().await;

        leader.abort();
        assert_eq!(follower.await.unwrap(), Ok("done".to_string()));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let dedup = Dedup::new();
        let a = dedup.dedupe("a".to_string(), || async { Ok("A".to_string()) });
        let b = dedup.dedupe("b".to_string(), || async { Ok("B".to_string()) });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, Ok("A".to_string()));
        assert_eq!(b, Ok("B".to_string()));
        assert_eq!(dedup.stats().leaders, 2);
    }

    #[tokio::test]
    async fn test_panicking_produce_aborts_and_clears() {
        let dedup = Dedup::new();
        let result = dedup
            .dedupe("key".to_string(), || async {
                if true {
                    panic!("handler bug");
                }
                Ok::<String, String>(String::new())
            })
            .await;

        assert_eq!(result, Err(DedupError::Aborted));
        assert_eq!(dedup.in_flight(), 0);
    }
}
