//! Envelope assembly and conversion into the legacy response shape.

use chrono::{DateTime, Utc};
use samop_core::{
    ErrorEntry, ErrorKind, LegacyPerformance, LegacyResponse, LegacySummary, Opportunity,
    QueryEcho, ResponseEnvelope, ResponseMetadata, ResponseStatus,
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// No failures is success, even with nothing queried.
    pub fn classify(succeeded: usize, failed: usize) -> ResponseStatus {
        match (succeeded, failed) {
            (_, 0) => ResponseStatus::Success,
            (0, _) => ResponseStatus::Failure,
            _ => ResponseStatus::PartialSuccess,
        }
    }

    pub fn build(
        &self,
        opportunities: Vec<Opportunity>,
        metadata: ResponseMetadata,
        errors: Vec<ErrorEntry>,
    ) -> ResponseEnvelope {
        let status = Self::classify(metadata.partitions_succeeded, metadata.partitions_failed);
        let error = match status {
            ResponseStatus::Failure => Some(
                errors
                    .first()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "all partitions failed".to_string()),
            ),
            _ => None,
        };
        ResponseEnvelope {
            status,
            opportunities,
            metadata,
            errors,
            error,
        }
    }

    /// Envelope for a run that ended before or outside the partition loop.
    pub fn failure(&self, kind: ErrorKind, message: impl Into<String>) -> ResponseEnvelope {
        let message = message.into();
        ResponseEnvelope {
            status: ResponseStatus::Failure,
            opportunities: Vec::new(),
            metadata: ResponseMetadata::default(),
            errors: vec![ErrorEntry {
                message: message.clone(),
                partition: None,
                error_type: kind,
                status_code: None,
                details: None,
            }],
            error: Some(message),
        }
    }
}

/// Run facts the envelope does not carry but the legacy shape reports.
#[derive(Debug, Clone)]
pub struct LegacyContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub query: QueryEcho,
    pub limit: usize,
    pub filtered_out: usize,
    pub failed_partitions: Vec<String>,
}

pub fn cache_hit_rate_percent(hits: usize, misses: usize) -> f64 {
    let total = hits + misses;
    if total == 0 {
        return 0.0;
    }
    (hits as f64 / total as f64 * 1000.0).round() / 10.0
}

pub fn to_legacy(envelope: &ResponseEnvelope, ctx: LegacyContext) -> LegacyResponse {
    let meta = &envelope.metadata;
    let summary = LegacySummary {
        total_records: meta.count_before_dedup,
        total_after_dedup: meta.count_after_dedup,
        dedup_before_filters: meta.count_after_dedup,
        filtered_out: ctx.filtered_out,
        duplicates_removed: meta.duplicates_removed,
        returned: envelope.opportunities.len(),
        limit: ctx.limit,
        successful_naics_count: meta.partitions_succeeded,
        failed_naics_count: meta.partitions_failed,
        cache_hit_rate: cache_hit_rate_percent(meta.cache_hits, meta.cache_misses),
        failed_naics: ctx.failed_partitions,
    };
    LegacyResponse {
        run_id: ctx.run_id,
        success: envelope.status != ResponseStatus::Failure,
        partial_success: envelope.status == ResponseStatus::PartialSuccess,
        fetched_at: ctx.fetched_at,
        opportunities: envelope.opportunities.clone(),
        query: ctx.query,
        summary,
        performance: LegacyPerformance {
            total_duration_ms: meta.total_duration_ms,
            cache_hits: meta.cache_hits,
            cache_misses: meta.cache_misses,
        },
        error: envelope.error.clone(),
        errors: envelope.errors.clone(),
    }
}
