//! Sequential per-partition fetch loop with caching, pacing and cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use samop_adapters::{AdapterContext, OpportunitySource};
use samop_core::{ErrorKind, PartitionResult, ResolvedParams};
use samop_storage::{PartitionCache, Sleeper};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Uniform `[0, 1)` source for pacing jitter.
#[async_trait]
pub trait RandomSource: Send + Sync {
    async fn next_f64(&self) -> f64;
}

pub struct MutexRng {
    inner: Mutex<rand::rngs::StdRng>,
}

impl MutexRng {
    pub fn new() -> Self {
        let seed = rand::thread_rng().gen::<[u8; 32]>();
        Self {
            inner: Mutex::new(rand::rngs::StdRng::from_seed(seed)),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: Mutex::new(rand::rngs::StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for MutexRng {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RandomSource for MutexRng {
    async fn next_f64(&self) -> f64 {
        let mut g = self.inner.lock().await;
        g.gen::<f64>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_jitter: Duration::from_millis(200),
        }
    }
}

impl PacingConfig {
    /// `unit` is a sample from `[0, 1)`.
    pub fn delay_for(&self, unit: f64) -> Duration {
        let unit = unit.clamp(0.0, 1.0);
        self.base_delay + self.max_jitter.mul_f64(unit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTiming {
    pub partition: String,
    pub duration_ms: u64,
    pub cached: bool,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FetchPerformance {
    pub total_duration_ms: u64,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub partitions: Vec<PartitionTiming>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchBatch {
    pub results: Vec<PartitionResult>,
    pub performance: FetchPerformance,
}

pub struct MultiPartitionFetcher {
    source: Arc<dyn OpportunitySource>,
    cache: PartitionCache,
    sleeper: Arc<dyn Sleeper>,
    rng: Arc<dyn RandomSource>,
    pacing: PacingConfig,
}

impl MultiPartitionFetcher {
    pub fn new(
        source: Arc<dyn OpportunitySource>,
        cache: PartitionCache,
        sleeper: Arc<dyn Sleeper>,
        rng: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            source,
            cache,
            sleeper,
            rng,
            pacing: PacingConfig::default(),
        }
    }

    pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn cache(&self) -> &PartitionCache {
        &self.cache
    }

    /// Query every partition in order. One partition failing never stops the batch;
    /// cancellation turns the remaining partitions into `cancelled` failures.
    pub async fn fetch_all(
        &self,
        ctx: &AdapterContext,
        partitions: &[String],
        params: &ResolvedParams,
        api_key: &str,
        cancel: &CancellationToken,
    ) -> FetchBatch {
        let started = Instant::now();
        let mut batch = FetchBatch::default();

        for (idx, partition) in partitions.iter().enumerate() {
            if cancel.is_cancelled() {
                batch.performance.cancelled = true;
                batch.results.push(cancelled(partition));
                continue;
            }

            if params.clear_cache {
                self.cache.forget(partition, params).await;
            }

            let partition_started = Instant::now();
            let cached_hit = if params.clear_cache {
                None
            } else {
                self.cache.get(partition, params).await
            };

            let result = match cached_hit {
                Some(hit) => {
                    batch.performance.cache_hits += 1;
                    debug!(partition, count = hit.count, "partition served from cache");
                    PartitionResult::Success(hit)
                }
                None => {
                    batch.performance.cache_misses += 1;
                    let fetched = tokio::select! {
                        result = self.source.fetch_partition(ctx, partition, params, api_key) => Some(result),
                        _ = cancel.cancelled() => None,
                    };
                    match fetched {
                        Some(result) => {
                            if let PartitionResult::Success(success) = &result {
                                self.cache.put(partition, params, success).await;
                            }
                            result
                        }
                        None => {
                            batch.performance.cancelled = true;
                            cancelled(partition)
                        }
                    }
                }
            };

            let cached = result.is_cached();
            batch.performance.partitions.push(PartitionTiming {
                partition: partition.clone(),
                duration_ms: if cached {
                    0
                } else {
                    partition_started.elapsed().as_millis() as u64
                },
                cached,
                success: result.is_success(),
            });
            batch.results.push(result);

            if idx + 1 < partitions.len() && !cancel.is_cancelled() {
                let delay = self.pacing.delay_for(self.rng.next_f64().await);
                tokio::select! {
                    _ = self.sleeper.sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }

        batch.performance.total_duration_ms = started.elapsed().as_millis() as u64;
        if batch.performance.cancelled {
            warn!(
                completed = batch.performance.partitions.len(),
                total = partitions.len(),
                "partition batch cancelled"
            );
        } else {
            info!(
                partitions = partitions.len(),
                cache_hits = batch.performance.cache_hits,
                cache_misses = batch.performance.cache_misses,
                duration_ms = batch.performance.total_duration_ms,
                "partition batch complete"
            );
        }
        batch
    }
}

fn cancelled(partition: &str) -> PartitionResult {
    PartitionResult::failure(partition, ErrorKind::Cancelled, "fetch cancelled", None)
}
