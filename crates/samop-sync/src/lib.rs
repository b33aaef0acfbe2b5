//! SAM.gov opportunity pipeline: resolve, fetch, cache, merge, report, persist.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use samop_adapters::{adapter_for_source, SAM_SOURCE_ID};
use samop_storage::{
    FileCacheBackend, HttpClientConfig, HttpFetcher, PartitionCache, StateStore, TokioSleeper,
};
use tracing::info;

pub mod config;
pub mod dedup;
pub mod fetcher;
pub mod perf;
pub mod resolver;
pub mod response;
pub mod scheduler;
pub mod workflow;

pub use config::{SearchDefaults, SyncConfig};
pub use dedup::{DedupConfig, Deduplicator};
pub use fetcher::{
    FetchBatch, FetchPerformance, MultiPartitionFetcher, MutexRng, PacingConfig, PartitionTiming,
    RandomSource,
};
pub use perf::{PerformanceLogger, PerformanceMetrics, PerformanceWarning};
pub use resolver::{ParameterResolver, RawParams, StringOrList, ValidationError};
pub use response::{cache_hit_rate_percent, to_legacy, LegacyContext, ResponseBuilder};
pub use scheduler::{build_scheduler, maybe_build_scheduler};
pub use tokio_util::sync::CancellationToken;
pub use workflow::{ConfigurationError, FilterHook, NoopFilterHook, Workflow, WorkflowStage};

pub const CRATE_NAME: &str = "samop-sync";

/// Wire the production workflow from config: reqwest transport, SAM.gov adapter,
/// file cache when a cache dir is configured, otherwise an in-memory cache.
pub fn build_workflow(config: &SyncConfig) -> Result<Workflow> {
    let defaults = SearchDefaults::load(&config.defaults_path)?;
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?);
    let source = adapter_for_source(SAM_SOURCE_ID, http, &config.search_url)
        .with_context(|| format!("no adapter registered for {SAM_SOURCE_ID}"))?;

    let cache = match &config.cache_dir {
        Some(dir) => {
            info!(cache_dir = %dir.display(), "using file-backed partition cache");
            PartitionCache::new(Arc::new(FileCacheBackend::new(dir.clone())))
        }
        None => PartitionCache::in_memory(),
    };
    let fetcher = MultiPartitionFetcher::new(
        source,
        cache,
        Arc::new(TokioSleeper),
        Arc::new(MutexRng::new()),
    )
    .with_pacing(config.pacing);

    Ok(Workflow::new(
        ParameterResolver::new(defaults),
        fetcher,
        StateStore::new(config.state_dir.clone()),
        config.api_key.clone(),
    ))
}
