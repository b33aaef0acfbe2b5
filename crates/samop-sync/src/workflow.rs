//! Top-level driver: resolve, fetch, merge, filter, limit, report, persist.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use samop_adapters::AdapterContext;
use samop_core::{
    ErrorEntry, ErrorKind, LegacyResponse, MergedResult, Opportunity, PartitionFailure,
    PartitionResult, QueryEcho, ResolvedParams, ResponseMetadata,
};
use samop_storage::{StateStore, SNAPSHOT_KEEP};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedup::Deduplicator;
use crate::fetcher::{FetchPerformance, MultiPartitionFetcher};
use crate::perf::{PerformanceLogger, PerformanceMetrics};
use crate::resolver::{ParameterResolver, RawParams};
use crate::response::{to_legacy, LegacyContext, ResponseBuilder};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Post-merge filter extension point.
pub trait FilterHook: Send + Sync {
    fn apply(&self, items: Vec<Opportunity>, params: &ResolvedParams) -> Result<Vec<Opportunity>>;
}

#[derive(Default)]
pub struct NoopFilterHook;

impl FilterHook for NoopFilterHook {
    fn apply(&self, items: Vec<Opportunity>, _params: &ResolvedParams) -> Result<Vec<Opportunity>> {
        Ok(items)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("SAM_API_KEY is not configured")]
    MissingApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStage {
    Validating,
    Fetching,
    Merging,
    Filtering,
    Limiting,
    FallbackCheck,
    Reporting,
    Persisting,
    Done,
    Failed,
}

impl WorkflowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::Validating => "validating",
            WorkflowStage::Fetching => "fetching",
            WorkflowStage::Merging => "merging",
            WorkflowStage::Filtering => "filtering",
            WorkflowStage::Limiting => "limiting",
            WorkflowStage::FallbackCheck => "fallback_check",
            WorkflowStage::Reporting => "reporting",
            WorkflowStage::Persisting => "persisting",
            WorkflowStage::Done => "done",
            WorkflowStage::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn enter(stage: WorkflowStage) {
    debug!(stage = %stage, "workflow stage");
}

struct PipelineOutcome {
    performance: FetchPerformance,
    merged: MergedResult,
    opportunities: Vec<Opportunity>,
    filtered_out: usize,
    failures: Vec<PartitionFailure>,
}

pub struct Workflow {
    resolver: ParameterResolver,
    fetcher: MultiPartitionFetcher,
    dedup: Deduplicator,
    filter: Box<dyn FilterHook>,
    builder: ResponseBuilder,
    perf: PerformanceLogger,
    state: StateStore,
    api_key: Option<String>,
}

impl Workflow {
    pub fn new(
        resolver: ParameterResolver,
        fetcher: MultiPartitionFetcher,
        state: StateStore,
        api_key: Option<String>,
    ) -> Self {
        Self {
            resolver,
            fetcher,
            dedup: Deduplicator::default(),
            filter: Box::<NoopFilterHook>::default(),
            builder: ResponseBuilder,
            perf: PerformanceLogger,
            state,
            api_key,
        }
    }

    pub fn with_filter(mut self, filter: Box<dyn FilterHook>) -> Self {
        self.filter = filter;
        self
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    pub async fn run(&self, raw: RawParams) -> LegacyResponse {
        self.run_with_cancel(raw, &CancellationToken::new()).await
    }

    /// Never fails: every outcome, including bad input, is a response.
    pub async fn run_with_cancel(&self, raw: RawParams, cancel: &CancellationToken) -> LegacyResponse {
        self.execute(raw, false, cancel).await
    }

    /// Run from a raw JSON invocation body.
    pub async fn run_json(&self, body: serde_json::Value) -> LegacyResponse {
        match RawParams::from_json(body) {
            Ok(raw) => self.run(raw).await,
            Err(err) => {
                warn!(error = %err, "rejected invocation body");
                self.rejection(ErrorKind::Validation, err.to_string())
            }
        }
    }

    /// Failure response for a request turned away before the workflow ran.
    pub fn rejection(&self, kind: ErrorKind, message: impl Into<String>) -> LegacyResponse {
        self.early_failure(Uuid::new_v4(), Utc::now(), kind, message.into())
    }

    fn execute<'a>(
        &'a self,
        raw: RawParams,
        is_fallback: bool,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, LegacyResponse> {
        let run_id = Uuid::new_v4();
        let fetched_at = Utc::now();
        let span = info_span!("sam_workflow", %run_id, is_fallback);
        Box::pin(
            async move {
                enter(WorkflowStage::Validating);
                let Some(api_key) = self.api_key.as_deref() else {
                    let err = ConfigurationError::MissingApiKey;
                    error!(error = %err, "workflow aborted");
                    enter(WorkflowStage::Failed);
                    return self.early_failure(run_id, fetched_at, ErrorKind::Configuration, err.to_string());
                };
                let params = match self.resolver.resolve(&raw) {
                    Ok(params) => params,
                    Err(err) => {
                        warn!(error = %err, "invocation failed validation");
                        enter(WorkflowStage::Failed);
                        return self.early_failure(run_id, fetched_at, ErrorKind::Validation, err.to_string());
                    }
                };
                info!(
                    partitions = params.naics_codes.len(),
                    place = params.place.as_deref().unwrap_or("nationwide"),
                    posted_from = %params.posted_from,
                    posted_to = %params.posted_to,
                    limit = params.limit,
                    "starting sam fetch"
                );

                let outcome = match self.pipeline(run_id, &params, api_key, cancel).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "workflow failed unexpectedly");
                        enter(WorkflowStage::Failed);
                        let response =
                            self.early_failure(run_id, fetched_at, ErrorKind::Unexpected, format!("{err:#}"));
                        self.state.save_legacy(&response).await;
                        return response;
                    }
                };

                enter(WorkflowStage::FallbackCheck);
                if should_fall_back(&outcome, &params, is_fallback) {
                    info!(
                        keywords = ?params.keywords,
                        "keyword search returned nothing; retrying once nationwide with default codes"
                    );
                    let mut response = self.execute(raw.broadened(), true, cancel).await;
                    response.query.fallback_applied = true;
                    return response;
                }

                enter(WorkflowStage::Reporting);
                let response = self.report(run_id, fetched_at, &params, &outcome);

                if outcome.performance.cancelled {
                    // Partial batch; "latest" keeps the last complete run.
                    warn!("run cancelled; skipping state snapshot");
                } else {
                    enter(WorkflowStage::Persisting);
                    self.persist(&params, &response, &outcome.failures).await;
                }

                enter(WorkflowStage::Done);
                info!(
                    status = ?response.status(),
                    returned = response.opportunities.len(),
                    "sam fetch finished"
                );
                response
            }
            .instrument(span),
        )
    }

    async fn pipeline(
        &self,
        run_id: Uuid,
        params: &ResolvedParams,
        api_key: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        enter(WorkflowStage::Fetching);
        let ctx = AdapterContext::new(run_id);
        let batch = self
            .fetcher
            .fetch_all(&ctx, &params.naics_codes, params, api_key, cancel)
            .await;

        enter(WorkflowStage::Merging);
        let mut merged = self.dedup.merge(&batch.results);
        let deduped = std::mem::take(&mut merged.opportunities);

        enter(WorkflowStage::Filtering);
        let after_dedup = deduped.len();
        let mut opportunities = self
            .filter
            .apply(deduped, params)
            .context("applying opportunity filter")?;
        let filtered_out = after_dedup.saturating_sub(opportunities.len());

        enter(WorkflowStage::Limiting);
        // Stable: equal dates keep merge order; undated records sort last.
        opportunities.sort_by(|a, b| b.posted_date.cmp(&a.posted_date));
        opportunities.truncate(params.limit);

        let failures = batch
            .results
            .iter()
            .filter_map(|r| match r {
                PartitionResult::Failure(f) => Some(f.clone()),
                PartitionResult::Success(_) => None,
            })
            .collect();

        Ok(PipelineOutcome {
            performance: batch.performance,
            merged,
            opportunities,
            filtered_out,
            failures,
        })
    }

    fn report(
        &self,
        run_id: Uuid,
        fetched_at: DateTime<Utc>,
        params: &ResolvedParams,
        outcome: &PipelineOutcome,
    ) -> LegacyResponse {
        let merged = &outcome.merged;
        let performance = &outcome.performance;
        let metrics = PerformanceMetrics::from_fetch(
            performance,
            merged.partitions_failed.len(),
            merged.count_before_dedup,
            merged.duplicates_removed,
        );
        self.perf.log(&metrics);

        let metadata = ResponseMetadata {
            total_partitions: params.naics_codes.len(),
            partitions_queried: merged.partitions_queried.len(),
            partitions_succeeded: merged.partitions_succeeded.len(),
            partitions_failed: merged.partitions_failed.len(),
            cache_hits: performance.cache_hits,
            cache_misses: performance.cache_misses,
            total_duration_ms: performance.total_duration_ms,
            count_before_dedup: merged.count_before_dedup,
            count_after_dedup: merged.total_after_dedup,
            duplicates_removed: merged.duplicates_removed,
        };
        let errors = outcome.failures.iter().map(ErrorEntry::from).collect();
        let envelope = self
            .builder
            .build(outcome.opportunities.clone(), metadata, errors);

        to_legacy(
            &envelope,
            LegacyContext {
                run_id,
                fetched_at,
                query: QueryEcho::from(params),
                limit: params.limit,
                filtered_out: outcome.filtered_out,
                failed_partitions: merged.partitions_failed.clone(),
            },
        )
    }

    /// Snapshot writes are best effort and never change the response.
    async fn persist(&self, params: &ResolvedParams, response: &LegacyResponse, failures: &[PartitionFailure]) {
        match self.state.save(params, &response.summary, failures).await {
            Ok(path) => debug!(path = %path.display(), "state snapshot saved"),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to save state snapshot"),
        }
        if let Err(err) = self.state.rotate(SNAPSHOT_KEEP).await {
            warn!(error = %format!("{err:#}"), "failed to rotate state snapshots");
        }
        self.state.save_legacy(response).await;
    }

    fn early_failure(
        &self,
        run_id: Uuid,
        fetched_at: DateTime<Utc>,
        kind: ErrorKind,
        message: String,
    ) -> LegacyResponse {
        let envelope = self.builder.failure(kind, message);
        to_legacy(
            &envelope,
            LegacyContext {
                run_id,
                fetched_at,
                query: QueryEcho::default(),
                limit: 0,
                filtered_out: 0,
                failed_partitions: Vec::new(),
            },
        )
    }
}

fn should_fall_back(outcome: &PipelineOutcome, params: &ResolvedParams, is_fallback: bool) -> bool {
    outcome.opportunities.is_empty()
        && !is_fallback
        && !outcome.performance.cancelled
        && !params.keywords.is_empty()
        && !params.naics_overridden
}
