use crate::error::FetchError;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

/// Tuning knobs for a [`FetchCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries kept; least-recently-used terminal entries
    /// are evicted beyond this.
    pub capacity: usize,
    /// How long a Failed entry keeps replaying its error before the next
    /// caller triggers a fresh computation.
    pub failure_ttl: Duration,
    /// Upper bound on a single computation; elapsed computations transition
    /// to Failed with a timeout error.
    pub compute_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            failure_ttl: Duration::from_secs(30),
            compute_timeout: Duration::from_secs(120),
        }
    }
}

type Outcome<V> = Result<Arc<V>, FetchError>;

enum EntryState<V> {
    /// A computation is in flight; waiters hold the receiver.
    Pending(watch::Receiver<Option<Outcome<V>>>),
    Ready(Arc<V>),
    Failed { error: FetchError, at: Instant },
}

struct Entry<V> {
    state: EntryState<V>,
    last_used: u64,
}

struct Table<K, V> {
    entries: HashMap<K, Entry<V>>,
    clock: u64,
}

/// Deduplicating memo cache for expensive fetch/compute operations.
///
/// Guarantees at most one in-flight computation per key: concurrent callers
/// for the same key attach as waiters and all observe the identical outcome.
/// Failures are cached too (so a flaky upstream is not hammered on every
/// request) and expire after [`CacheConfig::failure_ttl`] or an explicit
/// [`invalidate`](Self::invalidate).
pub struct FetchCache<K, V> {
    table: Arc<Mutex<Table<K, V>>>,
    config: CacheConfig,
}

impl<K, V> FetchCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                entries: HashMap::new(),
                clock: 0,
            })),
            config,
        }
    }

    /// Return the cached value for `key`, or run `compute` exactly once to
    /// produce it. The computation runs as a detached task bounded by the
    /// configured timeout, so a caller that disconnects does not abandon the
    /// waiters behind it.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> Outcome<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        self.get_or_compute_within(key, self.config.compute_timeout, compute)
            .await
    }

    /// Like [`get_or_compute`](Self::get_or_compute) with a caller-supplied
    /// bound on the computation.
    pub async fn get_or_compute_within<F, Fut>(
        &self,
        key: K,
        timeout: Duration,
        compute: F,
    ) -> Outcome<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        // Single critical section decides between hit, attach-as-waiter, and
        // create-Pending; the check and the insert can never be interleaved.
        let mut rx = {
            let mut table = self.table.lock().await;
            table.clock += 1;
            let now_clock = table.clock;

            let existing = match table.entries.get_mut(&key) {
                Some(entry) => {
                    entry.last_used = now_clock;
                    match &entry.state {
                        EntryState::Ready(value) => return Ok(Arc::clone(value)),
                        EntryState::Failed { error, at } => {
                            if at.elapsed() < self.config.failure_ttl {
                                debug!("Replaying cached failure for {:?}", key);
                                return Err(error.clone());
                            }
                            // Stale failure: recompute below.
                            debug!("Cached failure for {:?} expired, recomputing", key);
                            None
                        }
                        EntryState::Pending(rx) => Some(rx.clone()),
                    }
                }
                None => None,
            };

            match existing {
                Some(rx) => rx,
                None => {
                    let rx = self.spawn_compute(&key, timeout, compute());
                    Self::evict_if_full(&mut table, self.config.capacity);
                    table.entries.insert(
                        key.clone(),
                        Entry {
                            state: EntryState::Pending(rx.clone()),
                            last_used: now_clock,
                        },
                    );
                    rx
                }
            }
        };

        // Wait for the in-flight computation to publish its outcome.
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without publishing. Should not happen since
                // the compute task always publishes, but fail soft.
                return Err(FetchError::ComputeFailed(
                    "computation abandoned".to_string(),
                ));
            }
        }
    }

    fn spawn_compute<Fut>(
        &self,
        key: &K,
        timeout: Duration,
        fut: Fut,
    ) -> watch::Receiver<Option<Outcome<V>>>
    where
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let key = key.clone();
        let table = Arc::clone(&self.table);
        tokio::spawn(async move {
            let outcome: Outcome<V> = match tokio::time::timeout(timeout, fut).await {
                Ok(Ok(value)) => Ok(Arc::new(value)),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(FetchError::Timeout(timeout)),
            };

            match &outcome {
                Ok(_) => info!("Computed value for {:?}", key),
                Err(e) => warn!("Computation for {:?} failed: {}", key, e),
            }

            // Transition the entry to its terminal state, then release all
            // waiters with the identical outcome.
            {
                let mut table = table.lock().await;
                if let Some(entry) = table.entries.get_mut(&key) {
                    if matches!(entry.state, EntryState::Pending(_)) {
                        entry.state = match &outcome {
                            Ok(value) => EntryState::Ready(Arc::clone(value)),
                            Err(error) => EntryState::Failed {
                                error: error.clone(),
                                at: Instant::now(),
                            },
                        };
                    }
                }
            }
            let _ = tx.send(Some(outcome));
        });
        rx
    }

    /// Drop the entry for `key`, forcing the next caller to recompute.
    /// Pending entries are left alone; their in-flight computation will still
    /// publish to its waiters.
    pub async fn invalidate(&self, key: &K) -> bool {
        let mut table = self.table.lock().await;
        match table.entries.get(key) {
            Some(entry) if !matches!(entry.state, EntryState::Pending(_)) => {
                table.entries.remove(key);
                info!("Invalidated cache entry for {:?}", key);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.entries.len()
    }

    // Evict the least-recently-used terminal entry. Pending entries are never
    // evicted: they have attached waiters.
    fn evict_if_full(table: &mut Table<K, V>, capacity: usize) {
        while table.entries.len() >= capacity {
            let victim = table
                .entries
                .iter()
                .filter(|(_, e)| !matches!(e.state, EntryState::Pending(_)))
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    debug!("Evicting cache entry {:?}", key);
                    table.entries.remove(&key);
                }
                None => break, // everything pending, allow temporary overflow
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_cache(capacity: usize) -> FetchCache<String, String> {
        FetchCache::new(CacheConfig {
            capacity,
            failure_ttl: Duration::from_secs(30),
            compute_timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let cache = Arc::new(small_cache(16));
        let calls = Arc::new(AtomicUsize::new(0));
        let (go_tx, go_rx) = watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            let mut go = go_rx.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("key".to_string(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // Hold the computation open until every caller has
                        // had a chance to attach as a waiter.
                        while !*go.borrow() {
                            go.changed().await.map_err(|_| {
                                FetchError::ComputeFailed("test channel".into())
                            })?;
                        }
                        Ok("value".to_string())
                    })
                    .await
            }));
        }

        // Let all callers reach the cache before releasing the computation.
        tokio::task::yield_now().await;
        go_tx.send(true).unwrap();

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(*result, "value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ready_entries_are_not_recomputed() {
        let cache = small_cache(16);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value = cache
                .get_or_compute("key".to_string(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42usize.to_string())
                })
                .await
                .unwrap();
            assert_eq!(*value, "42");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_cached_until_invalidated() {
        let cache = small_cache(16);
        let calls = Arc::new(AtomicUsize::new(0));

        let compute = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(FetchError::ComputeFailed("boom".into()))
            }
        };

        let err = cache
            .get_or_compute("key".to_string(), compute(Arc::clone(&calls)))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ComputeFailed(_)));

        // Second call replays the cached failure without recomputing.
        let err = cache
            .get_or_compute("key".to_string(), compute(Arc::clone(&calls)))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ComputeFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Invalidation forces a fresh computation.
        assert!(cache.invalidate(&"key".to_string()).await);
        let _ = cache
            .get_or_compute("key".to_string(), compute(Arc::clone(&calls)))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_failure_expires_after_ttl() {
        let cache: FetchCache<String, String> = FetchCache::new(CacheConfig {
            capacity: 16,
            failure_ttl: Duration::from_secs(30),
            compute_timeout: Duration::from_secs(5),
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let compute = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(FetchError::ComputeFailed("boom".into()))
            }
        };

        let _ = cache
            .get_or_compute("key".to_string(), compute(Arc::clone(&calls)))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;

        let _ = cache
            .get_or_compute("key".to_string(), compute(Arc::clone(&calls)))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_computation_times_out() {
        let cache: FetchCache<String, String> = FetchCache::new(CacheConfig {
            capacity: 16,
            failure_ttl: Duration::from_secs(30),
            compute_timeout: Duration::from_secs(5),
        });

        let err = cache
            .get_or_compute("key".to_string(), || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("never".to_string())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
    }

    #[tokio::test]
    async fn eviction_keeps_cache_bounded() {
        let cache = small_cache(4);
        for i in 0..10 {
            let _ = cache
                .get_or_compute(format!("key-{}", i), move || async move {
                    Ok(i.to_string())
                })
                .await
                .unwrap();
        }
        assert!(cache.len().await <= 4);
    }

    #[tokio::test]
    async fn invalidate_is_a_noop_for_missing_keys() {
        let cache = small_cache(4);
        assert!(!cache.invalidate(&"missing".to_string()).await);
    }
}
