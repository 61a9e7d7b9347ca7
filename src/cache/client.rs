use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::warn;

use crate::cache::actor::{CacheCommand, CacheKey, CacheShard, FillResult, LookupReply};

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache shard unavailable")]
    ShardClosed,
    #[error("revalidation failed: {0}")]
    Revalidate(String),
}

/// What a read hands back: the value plus how old it is
#[derive(Debug, Clone)]
pub struct CachedValue {
    pub value: Value,
    pub is_stale: bool,
    pub age_seconds: u64,
}

/// Per-namespace TTL policy; each namespace is an independently tuned
/// partition of the key space
#[derive(Debug, Clone, Copy)]
pub struct NamespacePolicy {
    pub ttl: Duration,
    pub stale_window: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub shard_count: usize,
    pub channel_buffer: usize,
    policies: HashMap<String, NamespacePolicy>,
    default_policy: NamespacePolicy,
}

fn env_secs(name: &str, default: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            "market_data".to_string(),
            NamespacePolicy {
                ttl: env_secs("CACHE_MARKET_DATA_TTL_SECS", 900),
                stale_window: env_secs("CACHE_MARKET_DATA_STALE_SECS", 300),
            },
        );
        policies.insert(
            "sentiment".to_string(),
            NamespacePolicy {
                ttl: env_secs("CACHE_SENTIMENT_TTL_SECS", 3600),
                stale_window: env_secs("CACHE_SENTIMENT_STALE_SECS", 1800),
            },
        );
        policies.insert(
            "reports".to_string(),
            NamespacePolicy {
                ttl: env_secs("CACHE_REPORTS_TTL_SECS", 86400),
                stale_window: env_secs("CACHE_REPORTS_STALE_SECS", 0),
            },
        );
        Self {
            shard_count: 8,
            channel_buffer: 256,
            policies,
            default_policy: NamespacePolicy {
                ttl: env_secs("CACHE_DEFAULT_TTL_SECS", 600),
                stale_window: env_secs("CACHE_DEFAULT_STALE_SECS", 120),
            },
        }
    }

    pub fn policy(&self, namespace: &str) -> NamespacePolicy {
        self.policies
            .get(namespace)
            .copied()
            .unwrap_or(self.default_policy)
    }
}

#[derive(Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    revalidations: AtomicU64,
    coalesced: AtomicU64,
}

/// Read-only counters for the status API
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub revalidations: u64,
    pub coalesced: u64,
    pub hit_rate: f64,
    pub entry_count: usize,
}

/// Call-site-facing handle. Routes every operation for a (namespace, key)
/// to the shard that owns it; the shard's command loop is the serialization
/// point, so no lock is held across a provider call.
#[derive(Clone)]
pub struct CacheClient {
    shards: Arc<Vec<mpsc::Sender<CacheCommand>>>,
    metrics: Arc<CacheMetrics>,
    config: Arc<CacheConfig>,
}

impl CacheClient {
    pub fn new(config: CacheConfig) -> Self {
        let shards = (0..config.shard_count)
            .map(|id| CacheShard::spawn(id, config.channel_buffer))
            .collect();
        Self {
            shards: Arc::new(shards),
            metrics: Arc::new(CacheMetrics::default()),
            config: Arc::new(config),
        }
    }

    pub fn policy(&self, namespace: &str) -> NamespacePolicy {
        self.config.policy(namespace)
    }

    fn shard_for(&self, key: &CacheKey) -> &mpsc::Sender<CacheCommand> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    async fn send(&self, key: &CacheKey, cmd: CacheCommand) -> Result<(), CacheError> {
        self.shard_for(key)
            .send(cmd)
            .await
            .map_err(|_| CacheError::ShardClosed)
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedValue>, CacheError> {
        let cache_key = (namespace.to_string(), key.to_string());
        let (tx, rx) = oneshot::channel();
        self.send(&cache_key, CacheCommand::Get { key: cache_key.clone(), reply: tx })
            .await?;
        let found = rx.await.map_err(|_| CacheError::ShardClosed)?;
        match found {
            Some((value, is_stale, age)) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(CachedValue {
                    value,
                    is_stale,
                    age_seconds: age.as_secs(),
                }))
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Unconditional overwrite; stale window comes from the namespace policy
    pub async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let stale_window = self.config.policy(namespace).stale_window;
        self.set_with_windows(namespace, key, value, ttl, stale_window).await
    }

    pub async fn set_with_windows(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Duration,
        stale_window: Duration,
    ) -> Result<(), CacheError> {
        let cache_key = (namespace.to_string(), key.to_string());
        let (tx, rx) = oneshot::channel();
        self.send(
            &cache_key,
            CacheCommand::Set {
                key: cache_key.clone(),
                value,
                ttl,
                stale_window,
                reply: tx,
            },
        )
        .await?;
        rx.await.map_err(|_| CacheError::ShardClosed)
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> Result<bool, CacheError> {
        let cache_key = (namespace.to_string(), key.to_string());
        let (tx, rx) = oneshot::channel();
        self.send(&cache_key, CacheCommand::Delete { key: cache_key.clone(), reply: tx })
            .await?;
        rx.await.map_err(|_| CacheError::ShardClosed)
    }

    pub async fn clear_namespace(&self, namespace: &str) -> Result<usize, CacheError> {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let (tx, rx) = oneshot::channel();
            shard
                .send(CacheCommand::ClearNamespace {
                    namespace: namespace.to_string(),
                    reply: tx,
                })
                .await
                .map_err(|_| CacheError::ShardClosed)?;
            removed += rx.await.map_err(|_| CacheError::ShardClosed)?;
        }
        Ok(removed)
    }

    pub async fn clear_all(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let (tx, rx) = oneshot::channel();
            shard
                .send(CacheCommand::ClearAll { reply: tx })
                .await
                .map_err(|_| CacheError::ShardClosed)?;
            removed += rx.await.map_err(|_| CacheError::ShardClosed)?;
        }
        Ok(removed)
    }

    /// Runs a claimed fill on its own task. The task owns sending `Complete`,
    /// so the claim is released even when the fill panics or the caller that
    /// won it goes away; otherwise every later miss for the key would park
    /// forever. A panic surfaces to waiters as a failed fill.
    fn spawn_fill<F, Fut>(
        &self,
        key: CacheKey,
        ttl: Duration,
        stale_window: Duration,
        revalidate: F,
    ) -> oneshot::Receiver<FillResult>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let client = self.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = match tokio::spawn(revalidate()).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e.to_string()),
                Err(join_err) => Err(format!("fill task aborted: {}", join_err)),
            };
            if let Err(msg) = &result {
                warn!("⚠️ revalidation failed for {}/{}: {}", key.0, key.1, msg);
            }
            let complete = CacheCommand::Complete {
                key: key.clone(),
                result: result.clone(),
                ttl,
                stale_window,
            };
            let _ = client.send(&key, complete).await;
            let _ = tx.send(result);
        });
        rx
    }

    /// Stale-while-revalidate with single-flight coalescing.
    ///
    /// - miss / hard-expired: the first caller computes synchronously; every
    ///   concurrent caller for the same key parks and receives that result
    /// - fresh: served as-is, no computation
    /// - stale (within the window): served immediately with `is_stale`; at
    ///   most one background refresh is started
    pub async fn get_with_stale_revalidate<F, Fut>(
        &self,
        namespace: &str,
        key: &str,
        ttl: Duration,
        stale_window: Duration,
        revalidate: F,
    ) -> Result<CachedValue, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let cache_key = (namespace.to_string(), key.to_string());
        let (tx, rx) = oneshot::channel();
        self.send(&cache_key, CacheCommand::Lookup { key: cache_key.clone(), reply: tx })
            .await?;

        match rx.await.map_err(|_| CacheError::ShardClosed)? {
            LookupReply::Fresh { value, age } => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Ok(CachedValue {
                    value,
                    is_stale: false,
                    age_seconds: age.as_secs(),
                })
            }
            LookupReply::Stale { value, age, claimed } => {
                self.metrics.stale_hits.fetch_add(1, Ordering::Relaxed);
                if claimed {
                    self.metrics.revalidations.fetch_add(1, Ordering::Relaxed);
                    let _ = self.spawn_fill(cache_key, ttl, stale_window, revalidate);
                }
                Ok(CachedValue {
                    value,
                    is_stale: true,
                    age_seconds: age.as_secs(),
                })
            }
            LookupReply::MissClaimed => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                self.metrics.revalidations.fetch_add(1, Ordering::Relaxed);
                let done = self.spawn_fill(cache_key, ttl, stale_window, revalidate);
                match done.await.map_err(|_| CacheError::ShardClosed)? {
                    Ok(value) => Ok(CachedValue {
                        value,
                        is_stale: false,
                        age_seconds: 0,
                    }),
                    Err(msg) => Err(CacheError::Revalidate(msg)),
                }
            }
            LookupReply::MissWait(waiter) => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                self.metrics.coalesced.fetch_add(1, Ordering::Relaxed);
                match waiter.await.map_err(|_| CacheError::ShardClosed)? {
                    Ok(value) => Ok(CachedValue {
                        value,
                        is_stale: false,
                        age_seconds: 0,
                    }),
                    Err(msg) => Err(CacheError::Revalidate(msg)),
                }
            }
        }
    }

    /// Same as get_with_stale_revalidate, with windows from the namespace policy
    pub async fn revalidate_with_policy<F, Fut>(
        &self,
        namespace: &str,
        key: &str,
        revalidate: F,
    ) -> Result<CachedValue, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let policy = self.config.policy(namespace);
        self.get_with_stale_revalidate(namespace, key, policy.ttl, policy.stale_window, revalidate)
            .await
    }

    /// Drops every entry past ttl + stale window. Lookups already evict these
    /// lazily; the sweep reclaims keys that are never read again.
    pub async fn sweep_expired(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let (tx, rx) = oneshot::channel();
            shard
                .send(CacheCommand::SweepExpired { reply: tx })
                .await
                .map_err(|_| CacheError::ShardClosed)?;
            removed += rx.await.map_err(|_| CacheError::ShardClosed)?;
        }
        Ok(removed)
    }

    pub async fn entry_count(&self) -> Result<usize, CacheError> {
        let mut total = 0;
        for shard in self.shards.iter() {
            let (tx, rx) = oneshot::channel();
            shard
                .send(CacheCommand::EntryCount { reply: tx })
                .await
                .map_err(|_| CacheError::ShardClosed)?;
            total += rx.await.map_err(|_| CacheError::ShardClosed)?;
        }
        Ok(total)
    }

    pub async fn metrics(&self) -> Result<CacheMetricsSnapshot, CacheError> {
        let hits = self.metrics.hits.load(Ordering::Relaxed);
        let misses = self.metrics.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        Ok(CacheMetricsSnapshot {
            hits,
            misses,
            stale_hits: self.metrics.stale_hits.load(Ordering::Relaxed),
            revalidations: self.metrics.revalidations.load(Ordering::Relaxed),
            coalesced: self.metrics.coalesced.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            entry_count: self.entry_count().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn test_client() -> CacheClient {
        CacheClient::new(CacheConfig::from_env())
    }

    #[tokio::test]
    async fn test_set_then_get_returns_fresh_value() {
        let cache = test_client();
        cache
            .set("market_data", "2024-03-01:weekly", json!({"quotes": 3}), Duration::from_secs(60))
            .await
            .unwrap();

        let got = cache.get("market_data", "2024-03-01:weekly").await.unwrap().unwrap();
        assert_eq!(got.value, json!({"quotes": 3}));
        assert!(!got.is_stale);
    }

    #[tokio::test]
    async fn test_get_missing_key_returns_none() {
        let cache = test_client();
        assert!(cache.get("market_data", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_and_clear_namespace() {
        let cache = test_client();
        cache.set("a", "k1", json!(1), Duration::from_secs(60)).await.unwrap();
        cache.set("a", "k2", json!(2), Duration::from_secs(60)).await.unwrap();
        cache.set("b", "k1", json!(3), Duration::from_secs(60)).await.unwrap();

        assert!(cache.delete("a", "k1").await.unwrap());
        assert!(!cache.delete("a", "k1").await.unwrap());

        let removed = cache.clear_namespace("a").await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get("b", "k1").await.unwrap().is_some());

        let removed = cache.clear_all().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.entry_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_coalesces_concurrent_misses() {
        let cache = test_client();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_with_stale_revalidate(
                        "sentiment",
                        "2024-03-01:weekly",
                        Duration::from_secs(300),
                        Duration::from_secs(60),
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(json!({"score": 0.42}))
                        },
                    )
                    .await
                    .unwrap()
            }));
        }

        let results = join_all(handles).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap().value, json!({"score": 0.42}));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_fill_propagates_to_all_waiters_and_releases_claim() {
        let cache = test_client();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_with_stale_revalidate(
                        "market_data",
                        "bad-key",
                        Duration::from_secs(300),
                        Duration::from_secs(60),
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Err(anyhow::anyhow!("provider unavailable"))
                        },
                    )
                    .await
            }));
        }

        for result in join_all(handles).await {
            assert!(matches!(result.unwrap(), Err(CacheError::Revalidate(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Claim was released: a later caller retries the fill
        let got = cache
            .get_with_stale_revalidate(
                "market_data",
                "bad-key",
                Duration::from_secs(300),
                Duration::from_secs(60),
                || async { Ok(json!("recovered")) },
            )
            .await
            .unwrap();
        assert_eq!(got.value, json!("recovered"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_fill_releases_claim_for_next_caller() {
        let cache = test_client();

        let first = cache
            .get_with_stale_revalidate(
                "market_data",
                "flaky",
                Duration::from_secs(300),
                Duration::from_secs(60),
                || async { panic!("provider client blew up") },
            )
            .await;
        assert!(matches!(first, Err(CacheError::Revalidate(_))));

        // The claim must not stay stuck: a later caller fills the key
        let got = tokio::time::timeout(
            Duration::from_secs(2),
            cache.get_with_stale_revalidate(
                "market_data",
                "flaky",
                Duration::from_secs(300),
                Duration::from_secs(60),
                || async { Ok(json!("recovered")) },
            ),
        )
        .await
        .expect("second caller must not hang on a dead claim")
        .unwrap();
        assert_eq!(got.value, json!("recovered"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_caller_still_completes_fill_for_waiters() {
        let cache = test_client();

        let c = cache.clone();
        let first = tokio::spawn(async move {
            c.get_with_stale_revalidate(
                "market_data",
                "abandoned",
                Duration::from_secs(300),
                Duration::from_secs(60),
                || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!("filled"))
                },
            )
            .await
        });
        // Let the first caller win the claim, then kill it mid-fill
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();

        let got = tokio::time::timeout(
            Duration::from_secs(2),
            cache.get_with_stale_revalidate(
                "market_data",
                "abandoned",
                Duration::from_secs(300),
                Duration::from_secs(60),
                || async { Ok(json!("other")) },
            ),
        )
        .await
        .expect("waiter must be woken even though the claimer went away")
        .unwrap();
        // The detached fill finished and served everyone
        assert_eq!(got.value, json!("filled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_window_serves_old_value_without_blocking() {
        let cache = test_client();
        cache
            .set_with_windows(
                "market_data",
                "swr",
                json!("v1"),
                Duration::from_secs(100),
                Duration::from_secs(50),
            )
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let got = cache
            .get_with_stale_revalidate(
                "market_data",
                "swr",
                Duration::from_secs(100),
                Duration::from_secs(50),
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("v2"))
                },
            )
            .await
            .unwrap();

        // Old value, served immediately, marked stale
        assert_eq!(got.value, json!("v1"));
        assert!(got.is_stale);
        assert_eq!(got.age_seconds, 120);

        // Let the background refresh land, then confirm the fresh value
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let got = cache.get("market_data", "swr").await.unwrap().unwrap();
        assert_eq!(got.value, json!("v2"));
        assert!(!got.is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_stale_read_does_not_start_second_refresh() {
        let cache = test_client();
        cache
            .set_with_windows(
                "market_data",
                "swr2",
                json!("v1"),
                Duration::from_secs(100),
                Duration::from_secs(50),
            )
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(110)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let counter = calls.clone();
            let got = cache
                .get_with_stale_revalidate(
                    "market_data",
                    "swr2",
                    Duration::from_secs(100),
                    Duration::from_secs(50),
                    move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        // Slow refresh; the second read arrives while it runs
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(json!("v2"))
                    },
                )
                .await
                .unwrap();
            assert_eq!(got.value, json!("v1"));
            assert!(got.is_stale);
        }

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_expired_entry_blocks_for_fresh_value() {
        let cache = test_client();
        cache
            .set_with_windows(
                "market_data",
                "expired",
                json!("v1"),
                Duration::from_secs(100),
                Duration::from_secs(50),
            )
            .await
            .unwrap();

        // Past ttl + stale window: worst-case staleness is bounded
        tokio::time::advance(Duration::from_secs(200)).await;

        assert!(cache.get("market_data", "expired").await.unwrap().is_none());

        let got = cache
            .get_with_stale_revalidate(
                "market_data",
                "expired",
                Duration::from_secs(100),
                Duration::from_secs(50),
                || async { Ok(json!("v2")) },
            )
            .await
            .unwrap();
        assert_eq!(got.value, json!("v2"));
        assert!(!got.is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired_drops_only_dead_entries() {
        let cache = test_client();
        cache
            .set_with_windows("a", "short", json!(1), Duration::from_secs(10), Duration::from_secs(5))
            .await
            .unwrap();
        cache
            .set_with_windows("a", "long", json!(2), Duration::from_secs(500), Duration::from_secs(0))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;

        let removed = cache.sweep_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.entry_count().await.unwrap(), 1);
        assert!(cache.get("a", "long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_metrics_track_hits_and_misses() {
        let cache = test_client();
        cache.set("a", "k", json!(1), Duration::from_secs(60)).await.unwrap();

        cache.get("a", "k").await.unwrap();
        cache.get("a", "missing").await.unwrap();

        let snapshot = cache.metrics().await.unwrap();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.entry_count, 1);
        assert!((snapshot.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
