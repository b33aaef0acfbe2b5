//! Core domain model for the SAM.gov opportunity pipeline.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "samop-core";

/// One contracting notice, normalized from the external search API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Opportunity {
    pub notice_id: Option<String>,
    pub solicitation_number: Option<String>,
    pub title: Option<String>,
    pub notice_type: Option<String>,
    pub posted_date: Option<NaiveDate>,
    pub response_deadline: Option<NaiveDate>,
    /// NAICS code of the partition that returned this record. A tag, not authoritative.
    pub naics_code: Option<String>,
    pub psc_code: Option<String>,
    pub state_code: Option<String>,
    pub agency_name: Option<String>,
    pub set_aside_type: Option<String>,
    pub url: Option<String>,
    /// Only consulted when two records share a `notice_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

/// Immutable, validated query bundle produced once per workflow invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedParams {
    pub naics_codes: Vec<String>,
    pub psc_codes: Vec<String>,
    pub notice_types: Vec<String>,
    pub notice_type_codes: Vec<String>,
    /// Two-letter state code; `None` means nationwide.
    pub place: Option<String>,
    pub days_back: u32,
    pub posted_from: NaiveDate,
    pub posted_to: NaiveDate,
    pub limit: usize,
    pub keywords: Vec<String>,
    pub clear_cache: bool,
    pub set_aside_codes: Vec<String>,
    pub small_business_only: bool,
    pub naics_overridden: bool,
    pub psc_overridden: bool,
}

/// Failure categories shared by partition results and the response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Configuration,
    RateLimit,
    Authentication,
    NotFound,
    ServerError,
    HttpError,
    Network,
    Data,
    Cancelled,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Authentication => "authentication",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ServerError => "server_error",
            ErrorKind::HttpError => "http_error",
            ErrorKind::Network => "network",
            ErrorKind::Data => "data",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSuccess {
    pub partition: String,
    pub count: usize,
    pub opportunities: Vec<Opportunity>,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFailure {
    pub partition: String,
    pub error: String,
    pub status_code: Option<u16>,
    pub error_type: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
}

/// Outcome of querying a single NAICS partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartitionResult {
    Success(PartitionSuccess),
    Failure(PartitionFailure),
}

impl PartitionResult {
    pub fn success(partition: impl Into<String>, opportunities: Vec<Opportunity>, cached: bool) -> Self {
        PartitionResult::Success(PartitionSuccess {
            partition: partition.into(),
            count: opportunities.len(),
            opportunities,
            cached,
        })
    }

    pub fn failure(
        partition: impl Into<String>,
        error_type: ErrorKind,
        error: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        PartitionResult::Failure(PartitionFailure {
            partition: partition.into(),
            error: error.into(),
            status_code,
            error_type,
            response_body: None,
        })
    }

    pub fn partition(&self) -> &str {
        match self {
            PartitionResult::Success(s) => &s.partition,
            PartitionResult::Failure(f) => &f.partition,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PartitionResult::Success(_))
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, PartitionResult::Success(s) if s.cached)
    }
}

/// All partitions flattened into one deduplicated collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MergedResult {
    pub opportunities: Vec<Opportunity>,
    pub total_count: usize,
    pub count_before_dedup: usize,
    pub total_after_dedup: usize,
    pub duplicates_removed: usize,
    pub partitions_queried: Vec<String>,
    pub partitions_succeeded: Vec<String>,
    pub partitions_failed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    PartialSuccess,
    Failure,
}

/// Error entry as exposed to callers, independent of where the failure came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub message: String,
    pub partition: Option<String>,
    #[serde(rename = "type")]
    pub error_type: ErrorKind,
    pub status_code: Option<u16>,
    pub details: Option<serde_json::Value>,
}

impl From<&PartitionFailure> for ErrorEntry {
    fn from(failure: &PartitionFailure) -> Self {
        let details = failure.response_body.as_deref().map(|body| {
            serde_json::from_str(body).unwrap_or_else(|_| serde_json::Value::String(body.to_string()))
        });
        ErrorEntry {
            message: failure.error.clone(),
            partition: Some(failure.partition.clone()),
            error_type: failure.error_type,
            status_code: failure.status_code,
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResponseMetadata {
    pub total_partitions: usize,
    pub partitions_queried: usize,
    pub partitions_succeeded: usize,
    pub partitions_failed: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub total_duration_ms: u64,
    pub count_before_dedup: usize,
    pub count_after_dedup: usize,
    pub duplicates_removed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: ResponseStatus,
    pub opportunities: Vec<Opportunity>,
    pub metadata: ResponseMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Echo of the query that produced a legacy response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueryEcho {
    pub naics_codes: Vec<String>,
    pub psc_codes: Vec<String>,
    pub notice_types: Vec<String>,
    pub notice_type_codes: Vec<String>,
    pub place: Option<String>,
    pub days_back: Option<u32>,
    pub posted_from: Option<NaiveDate>,
    pub posted_to: Option<NaiveDate>,
    pub limit: Option<usize>,
    pub keywords: Vec<String>,
    pub set_aside_codes: Vec<String>,
    pub small_business_only: bool,
    pub fallback_applied: bool,
}

impl From<&ResolvedParams> for QueryEcho {
    fn from(params: &ResolvedParams) -> Self {
        Self {
            naics_codes: params.naics_codes.clone(),
            psc_codes: params.psc_codes.clone(),
            notice_types: params.notice_types.clone(),
            notice_type_codes: params.notice_type_codes.clone(),
            place: params.place.clone(),
            days_back: Some(params.days_back),
            posted_from: Some(params.posted_from),
            posted_to: Some(params.posted_to),
            limit: Some(params.limit),
            keywords: params.keywords.clone(),
            set_aside_codes: params.set_aside_codes.clone(),
            small_business_only: params.small_business_only,
            fallback_applied: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LegacySummary {
    pub total_records: usize,
    pub total_after_dedup: usize,
    pub dedup_before_filters: usize,
    pub filtered_out: usize,
    pub duplicates_removed: usize,
    pub returned: usize,
    pub limit: usize,
    pub successful_naics_count: usize,
    pub failed_naics_count: usize,
    /// Percentage in `[0, 100]`, one decimal place.
    pub cache_hit_rate: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_naics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LegacyPerformance {
    pub total_duration_ms: u64,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

/// Response shape handed to UI, scheduled jobs and tool callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyResponse {
    pub run_id: Uuid,
    pub success: bool,
    pub partial_success: bool,
    pub fetched_at: DateTime<Utc>,
    pub opportunities: Vec<Opportunity>,
    pub query: QueryEcho,
    pub summary: LegacySummary,
    pub performance: LegacyPerformance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorEntry>,
}

impl LegacyResponse {
    pub fn status(&self) -> ResponseStatus {
        match (self.success, self.partial_success) {
            (false, _) => ResponseStatus::Failure,
            (true, true) => ResponseStatus::PartialSuccess,
            (true, false) => ResponseStatus::Success,
        }
    }
}

/// One rotated state snapshot written after every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub timestamp: DateTime<Utc>,
    pub params: ResolvedParams,
    pub summary: LegacySummary,
    pub failed_partitions: Vec<PartitionFailure>,
}
