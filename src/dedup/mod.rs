//! In-flight request deduplication
//!
//! Collapses concurrent identical operations into a single execution.
//! This is not a cache: once the work resolves the entry is dropped and
//! the next call for the same key runs fresh.

use crate::error::ToolError;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const DEFAULT_SHARDS: usize = 16;

type SharedResult = Shared<BoxFuture<'static, Result<Value, ToolError>>>;
type Shard = Mutex<HashMap<String, DedupEntry>>;

/// One outstanding flight and the callers attached to it.
pub struct DedupEntry {
    pub key: String,
    handle: SharedResult,
    waiter_count: Arc<AtomicUsize>,
}

impl DedupEntry {
    pub fn waiter_count(&self) -> usize {
        self.waiter_count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DedupStats {
    /// Distinct executions started.
    pub executions: u64,
    /// Callers that attached to an existing flight.
    pub joins: u64,
    pub in_flight: usize,
}

pub struct RequestDeduplicator {
    shards: Arc<Vec<Shard>>,
    executions: AtomicU64,
    joins: AtomicU64,
}

/// Removes a flight's entry when its task ends, including by panic.
struct FlightGuard {
    shards: Arc<Vec<Shard>>,
    index: usize,
    key: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        lock(&self.shards[self.index]).remove(&self.key);
    }
}

fn lock(shard: &Shard) -> MutexGuard<'_, HashMap<String, DedupEntry>> {
    // A panic while holding the guard cannot leave the map half-updated
    shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RequestDeduplicator {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let shards = (0..count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();

        Self {
            shards: Arc::new(shards),
            executions: AtomicU64::new(0),
            joins: AtomicU64::new(0),
        }
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Run `work` for `key`, or join the flight already running for it.
    pub async fn dedupe<F>(&self, key: &str, work: F) -> Result<Value, ToolError>
    where
        F: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.dedupe_observed(key, work).await.0
    }

    /// Like `dedupe`, also reporting whether this caller joined an existing
    /// flight (`true`) or started the execution (`false`).
    ///
    /// The work runs on its own task, so it completes even if every caller
    /// is cancelled. `work` is dropped unpolled when the caller joins.
    pub async fn dedupe_observed<F>(&self, key: &str, work: F) -> (Result<Value, ToolError>, bool)
    where
        F: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let index = self.shard_index(key);

        let (handle, joined) = {
            let mut map = lock(&self.shards[index]);

            if let Some(entry) = map.get(key) {
                let waiters = entry.waiter_count.fetch_add(1, Ordering::Relaxed) + 1;
                self.joins.fetch_add(1, Ordering::Relaxed);
                debug!(key, waiters, "Joined in-flight request");
                (entry.handle.clone(), true)
            } else {
                let shards = Arc::clone(&self.shards);
                let owned_key = key.to_string();

                // Armed on first poll, never inside `spawn` while this shard
                // is locked. It still cannot remove the entry before the
                // insert below: it needs the same lock.
                let task = tokio::spawn(async move {
                    let _guard = FlightGuard {
                        shards,
                        index,
                        key: owned_key,
                    };
                    work.await
                });

                let handle: SharedResult = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) => Err(ToolError::Internal(format!(
                            "deduplicated work did not complete: {}",
                            e
                        ))),
                    }
                }
                .boxed()
                .shared();

                map.insert(
                    key.to_string(),
                    DedupEntry {
                        key: key.to_string(),
                        handle: handle.clone(),
                        waiter_count: Arc::new(AtomicUsize::new(1)),
                    },
                );
                self.executions.fetch_add(1, Ordering::Relaxed);
                debug!(key, "Started deduplicated execution");
                (handle, false)
            }
        };

        (handle.await, joined)
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.shards.iter().map(|s| lock(s).len()).sum()
    }

    /// Callers attached to `key`'s flight, if one is running.
    pub fn waiters(&self, key: &str) -> Option<usize> {
        lock(&self.shards[self.shard_index(key)])
            .get(key)
            .map(DedupEntry::waiter_count)
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            executions: self.executions.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

impl Default for RequestDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn counted_work(
        counter: Arc<AtomicUsize>,
        result: Result<Value, ToolError>,
    ) -> impl Future<Output = Result<Value, ToolError>> + Send + 'static {
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            result
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let dedup = Arc::new(RequestDeduplicator::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let dedup = Arc::clone(&dedup);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                dedup
                    .dedupe("quote:AAPL", counted_work(counter, Ok(json!({"price": 189.5}))))
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(json!({"price": 189.5})));
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let stats = dedup.stats();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.joins, 9);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_waiters_observe_identical_error() {
        let dedup = Arc::new(RequestDeduplicator::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let err = ToolError::Transport("connection refused".into());

        let a = {
            let dedup = Arc::clone(&dedup);
            let work = counted_work(Arc::clone(&counter), Err(err.clone()));
            tokio::spawn(async move { dedup.dedupe_observed("k", work).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(dedup.waiters("k"), Some(1));

        let (second, joined) = dedup
            .dedupe_observed("k", counted_work(Arc::clone(&counter), Ok(json!(1))))
            .await;
        let (first, first_joined) = a.await.unwrap();

        assert!(joined);
        assert!(!first_joined);
        assert_eq!(first, Err(err.clone()));
        assert_eq!(second, Err(err));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_new_call_after_resolution_runs_fresh() {
        let dedup = RequestDeduplicator::new();
        let counter = Arc::new(AtomicUsize::new(0));

        dedup
            .dedupe("k", counted_work(Arc::clone(&counter), Ok(json!(1))))
            .await
            .unwrap();
        dedup
            .dedupe("k", counted_work(Arc::clone(&counter), Ok(json!(2))))
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_collapse() {
        let dedup = Arc::new(RequestDeduplicator::with_shards(1));
        let counter = Arc::new(AtomicUsize::new(0));

        let a = dedup.dedupe("a", counted_work(Arc::clone(&counter), Ok(json!("a"))));
        let b = dedup.dedupe("b", counted_work(Arc::clone(&counter), Ok(json!("b"))));
        let (a, b) = tokio::join!(a, b);

        assert_eq!(a, Ok(json!("a")));
        assert_eq!(b, Ok(json!("b")));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_work_resolves_waiters_with_internal_error() {
        let dedup = RequestDeduplicator::new();

        let result = dedup
            .dedupe("boom", async {
                let exploded = true;
                if exploded {
                    panic!("tool exploded");
                }
                Ok(json!(null))
            })
            .await;

        assert!(matches!(result, Err(ToolError::Internal(_))));
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_call_after_panic_runs_fresh() {
        let dedup = RequestDeduplicator::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let first = dedup
            .dedupe("boom", async {
                let exploded = true;
                if exploded {
                    panic!("tool exploded");
                }
                Ok(json!(null))
            })
            .await;
        assert!(matches!(first, Err(ToolError::Internal(_))));

        let second = dedup
            .dedupe("boom", counted_work(Arc::clone(&counter), Ok(json!("fresh"))))
            .await;

        assert_eq!(second, Ok(json!("fresh")));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.stats().executions, 2);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_work_survives_caller_cancellation() {
        let dedup = Arc::new(RequestDeduplicator::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let caller = {
            let dedup = Arc::clone(&dedup);
            let counter = Arc::clone(&counter);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                dedup
                    .dedupe("slow", async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("done"))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight(), 0);
    }
}
