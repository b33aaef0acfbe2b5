//! Source adapter contract and the SAM.gov opportunities search adapter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use samop_core::{ErrorKind, Opportunity, PartitionFailure, PartitionResult, ResolvedParams};
use samop_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "samop-adapters";

pub const SAM_SOURCE_ID: &str = "sam-gov";
pub const DEFAULT_SEARCH_URL: &str = "https://api.sam.gov/opportunities/v2/search";
/// Page size requested from the API; its documented maximum.
pub const API_PAGE_LIMIT: usize = 1000;

const API_DATE_FORMAT: &str = "%m/%d/%Y";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed response body: {0}")]
    Data(String),
}

/// One partition query against an external opportunity source.
///
/// Implementations report every failure as a [`PartitionResult::Failure`]; nothing
/// crosses this boundary as an error.
#[async_trait]
pub trait OpportunitySource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_partition(
        &self,
        ctx: &AdapterContext,
        partition: &str,
        params: &ResolvedParams,
        api_key: &str,
    ) -> PartitionResult;
}

#[derive(Debug, Clone)]
pub struct SamGovAdapter {
    http: Arc<HttpFetcher>,
    search_url: String,
}

impl SamGovAdapter {
    pub fn new(http: Arc<HttpFetcher>, search_url: impl Into<String>) -> Self {
        Self {
            http,
            search_url: search_url.into(),
        }
    }
}

#[async_trait]
impl OpportunitySource for SamGovAdapter {
    fn source_id(&self) -> &'static str {
        SAM_SOURCE_ID
    }

    async fn fetch_partition(
        &self,
        ctx: &AdapterContext,
        partition: &str,
        params: &ResolvedParams,
        api_key: &str,
    ) -> PartitionResult {
        let query = build_search_query(partition, params, api_key);
        let resp = match self
            .http
            .fetch_bytes(ctx.run_id, partition, &self.search_url, &query)
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                let failure = failure_from_fetch_error(partition, &err);
                warn!(
                    partition,
                    error_type = %failure.error_type,
                    status_code = failure.status_code,
                    error = %failure.error,
                    "partition fetch failed"
                );
                return PartitionResult::Failure(failure);
            }
        };

        match parse_search_body(partition, &resp.body) {
            Ok(opportunities) => {
                info!(partition, count = opportunities.len(), retries = resp.retries, "partition fetched");
                PartitionResult::success(partition, opportunities, false)
            }
            Err(err) => {
                warn!(partition, error = %err, "partition response rejected");
                PartitionResult::Failure(PartitionFailure {
                    partition: partition.to_string(),
                    error: err.to_string(),
                    status_code: Some(resp.status.as_u16()),
                    error_type: ErrorKind::Data,
                    response_body: Some(String::from_utf8_lossy(&resp.body).chars().take(2_000).collect()),
                })
            }
        }
    }
}

pub fn adapter_for_source(
    source_id: &str,
    http: Arc<HttpFetcher>,
    search_url: &str,
) -> Option<Arc<dyn OpportunitySource>> {
    match source_id {
        SAM_SOURCE_ID => Some(Arc::new(SamGovAdapter::new(http, search_url))),
        _ => None,
    }
}

/// Translate resolved parameters into the search endpoint's query vocabulary.
pub fn build_search_query(
    partition: &str,
    params: &ResolvedParams,
    api_key: &str,
) -> Vec<(String, String)> {
    let mut query = vec![
        ("api_key".to_string(), api_key.to_string()),
        ("postedFrom".to_string(), params.posted_from.format(API_DATE_FORMAT).to_string()),
        ("postedTo".to_string(), params.posted_to.format(API_DATE_FORMAT).to_string()),
        ("naics".to_string(), partition.to_string()),
        ("ptype".to_string(), params.notice_type_codes.join(",")),
        ("limit".to_string(), API_PAGE_LIMIT.to_string()),
    ];
    if let Some(state) = &params.place {
        query.push(("state".to_string(), state.clone()));
    }
    if !params.set_aside_codes.is_empty() {
        query.push(("setAsideCode".to_string(), params.set_aside_codes.join(",")));
    }
    query
}

pub fn categorize_fetch_error(err: &FetchError) -> ErrorKind {
    match err {
        FetchError::RateLimitExhausted { .. } => ErrorKind::RateLimit,
        FetchError::HttpStatus { status, .. } => match *status {
            401 | 403 => ErrorKind::Authentication,
            404 => ErrorKind::NotFound,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::HttpError,
        },
        FetchError::Transport(_) => ErrorKind::Network,
    }
}

fn failure_from_fetch_error(partition: &str, err: &FetchError) -> PartitionFailure {
    let error_type = categorize_fetch_error(err);
    let error = match error_type {
        ErrorKind::Authentication => format!("authentication rejected by SAM.gov: {err}"),
        ErrorKind::NotFound => format!("search endpoint not found: {err}"),
        ErrorKind::ServerError => format!("SAM.gov server error: {err}"),
        ErrorKind::Network => format!("network error: {err}"),
        _ => err.to_string(),
    };
    PartitionFailure {
        partition: partition.to_string(),
        error,
        status_code: err.status_code(),
        error_type,
        response_body: err.body().filter(|b| !b.is_empty()).map(str::to_string),
    }
}

/// Parse a search response body into canonical records tagged with `partition`.
pub fn parse_search_body(partition: &str, body: &[u8]) -> Result<Vec<Opportunity>, AdapterError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| AdapterError::Data(e.to_string()))?;
    let records = value
        .get("opportunitiesData")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::Data("`opportunitiesData` is not an array".to_string()))?;
    Ok(records.iter().map(|raw| map_record(raw, partition)).collect())
}

/// Ordered JSON paths tried for one output field; the first non-empty string wins.
pub type FieldProbes = &'static [&'static [&'static str]];

pub const NOTICE_ID_FIELDS: FieldProbes = &[&["noticeId"]];
pub const SOLICITATION_FIELDS: FieldProbes = &[&["solicitationNumber"]];
pub const TITLE_FIELDS: FieldProbes = &[&["title"]];
pub const NOTICE_TYPE_FIELDS: FieldProbes = &[&["type"], &["baseType"]];
pub const POSTED_DATE_FIELDS: FieldProbes = &[&["postedDate"]];
pub const DEADLINE_FIELDS: FieldProbes =
    &[&["responseDeadLine"], &["reponseDeadLine"], &["responseDeadline"]];
pub const AGENCY_FIELDS: FieldProbes = &[
    &["fullParentPathName"],
    &["department"],
    &["agency"],
    &["organizationName"],
    &["subTier"],
    &["office"],
];
pub const STATE_FIELDS: FieldProbes = &[
    &["placeOfPerformance", "state", "code"],
    &["placeOfPerformance", "state"],
    &["officeAddress", "state"],
];
pub const CLASSIFICATION_FIELDS: FieldProbes = &[
    &["classificationCode"],
    &["pscCode"],
    &["psc"],
    &["productServiceCode"],
];
pub const SET_ASIDE_FIELDS: FieldProbes = &[
    &["typeOfSetAsideDescription"],
    &["typeOfSetAside"],
    &["setAside"],
];
pub const URL_FIELDS: FieldProbes = &[&["uiLink"]];
pub const LAST_MODIFIED_FIELDS: FieldProbes =
    &[&["lastModifiedDate"], &["modifiedDate"], &["updatedDate"]];

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str()
}

pub fn probe_str(raw: &JsonValue, probes: FieldProbes) -> Option<String> {
    probes.iter().find_map(|path| {
        json_str(raw, path)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

pub fn parse_calendar_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    let head = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(head, API_DATE_FORMAT))
        .ok()
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Map one raw API record; missing fields become `None`.
pub fn map_record(raw: &JsonValue, partition: &str) -> Opportunity {
    let notice_id = probe_str(raw, NOTICE_ID_FIELDS);
    let url = probe_str(raw, URL_FIELDS).or_else(|| {
        notice_id
            .as_ref()
            .map(|id| format!("https://sam.gov/opp/{id}/view"))
    });
    Opportunity {
        solicitation_number: probe_str(raw, SOLICITATION_FIELDS),
        title: probe_str(raw, TITLE_FIELDS),
        notice_type: probe_str(raw, NOTICE_TYPE_FIELDS),
        posted_date: probe_str(raw, POSTED_DATE_FIELDS).and_then(|s| parse_calendar_date(&s)),
        response_deadline: probe_str(raw, DEADLINE_FIELDS).and_then(|s| parse_calendar_date(&s)),
        naics_code: Some(partition.to_string()),
        psc_code: probe_str(raw, CLASSIFICATION_FIELDS),
        state_code: probe_str(raw, STATE_FIELDS),
        agency_name: probe_str(raw, AGENCY_FIELDS),
        set_aside_type: probe_str(raw, SET_ASIDE_FIELDS),
        url,
        last_modified: probe_str(raw, LAST_MODIFIED_FIELDS).and_then(|s| parse_timestamp(&s)),
        notice_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use samop_storage::{
        BackoffPolicy, HttpTransport, RawResponse, Sleeper, StatusCode, TransportError,
    };
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn params() -> ResolvedParams {
        ResolvedParams {
            naics_codes: vec!["541511".into()],
            psc_codes: vec![],
            notice_types: vec!["Solicitation".into(), "Presolicitation".into()],
            notice_type_codes: vec!["o".into(), "p".into()],
            place: Some("VA".into()),
            days_back: 30,
            posted_from: NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
            posted_to: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            limit: 50,
            keywords: vec!["cloud".into()],
            clear_cache: false,
            set_aside_codes: vec!["SBA".into(), "8A".into()],
            small_business_only: false,
            naics_overridden: false,
            psc_overridden: false,
        }
    }

    struct FixedTransport {
        status: StatusCode,
        body: Option<&'static str>,
        seen_query: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl HttpTransport for FixedTransport {
        async fn get(&self, url: &str, query: &[(String, String)]) -> Result<RawResponse, TransportError> {
            *self.seen_query.lock().unwrap() = query.to_vec();
            match self.body {
                Some(body) => Ok(RawResponse {
                    status: self.status,
                    final_url: url.to_string(),
                    body: body.as_bytes().to_vec(),
                }),
                None => Err(TransportError::Timeout("30s elapsed".into())),
            }
        }
    }

    struct NoSleep;

    #[async_trait]
    impl Sleeper for NoSleep {
        async fn sleep(&self, _duration: Duration) {}
    }

    fn make_adapter(status: StatusCode, body: Option<&'static str>) -> (SamGovAdapter, Arc<FixedTransport>) {
        let transport = Arc::new(FixedTransport {
            status,
            body,
            seen_query: Mutex::new(vec![]),
        });
        let http = HttpFetcher::with_transport(transport.clone(), Arc::new(NoSleep), BackoffPolicy::default());
        (SamGovAdapter::new(Arc::new(http), DEFAULT_SEARCH_URL), transport)
    }

    #[test]
    fn query_uses_api_vocabulary() {
        let query = build_search_query("541511", &params(), "secret");
        let get = |k: &str| query.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("api_key"), Some("secret"));
        assert_eq!(get("postedFrom"), Some("01/02/2025"));
        assert_eq!(get("postedTo"), Some("02/01/2025"));
        assert_eq!(get("naics"), Some("541511"));
        assert_eq!(get("ptype"), Some("o,p"));
        assert_eq!(get("limit"), Some("1000"));
        assert_eq!(get("state"), Some("VA"));
        assert_eq!(get("setAsideCode"), Some("SBA,8A"));
        assert_eq!(get("keywords"), None);
    }

    #[test]
    fn nationwide_query_omits_state_and_set_aside() {
        let mut p = params();
        p.place = None;
        p.set_aside_codes.clear();
        let query = build_search_query("541511", &p, "k");
        assert!(query.iter().all(|(k, _)| k != "state" && k != "setAsideCode"));
    }

    #[test]
    fn status_categories() {
        let status = |s: u16| FetchError::HttpStatus { status: s, url: String::new(), body: String::new() };
        assert_eq!(categorize_fetch_error(&status(401)), ErrorKind::Authentication);
        assert_eq!(categorize_fetch_error(&status(403)), ErrorKind::Authentication);
        assert_eq!(categorize_fetch_error(&status(404)), ErrorKind::NotFound);
        assert_eq!(categorize_fetch_error(&status(502)), ErrorKind::ServerError);
        assert_eq!(categorize_fetch_error(&status(400)), ErrorKind::HttpError);
        assert_eq!(
            categorize_fetch_error(&FetchError::RateLimitExhausted { retries: 3, body: String::new() }),
            ErrorKind::RateLimit
        );
        assert_eq!(
            categorize_fetch_error(&FetchError::Transport(TransportError::Connect("x".into()))),
            ErrorKind::Network
        );
    }

    #[test]
    fn agency_probe_order() {
        assert_eq!(
            probe_str(&json!({"fullParentPathName": "DOD", "department": "X"}), AGENCY_FIELDS).as_deref(),
            Some("DOD")
        );
        assert_eq!(probe_str(&json!({"department": "DOE"}), AGENCY_FIELDS).as_deref(), Some("DOE"));
        assert_eq!(probe_str(&json!({"agency": "NASA"}), AGENCY_FIELDS).as_deref(), Some("NASA"));
        assert_eq!(
            probe_str(&json!({"organizationName": "GSA"}), AGENCY_FIELDS).as_deref(),
            Some("GSA")
        );
        assert_eq!(probe_str(&json!({"subTier": "USACE"}), AGENCY_FIELDS).as_deref(), Some("USACE"));
        assert_eq!(probe_str(&json!({"office": "W6QK"}), AGENCY_FIELDS).as_deref(), Some("W6QK"));
        assert_eq!(probe_str(&json!({"fullParentPathName": "  "}), AGENCY_FIELDS), None);
    }

    #[test]
    fn state_probe_order() {
        let nested = json!({"placeOfPerformance": {"state": {"code": "AL", "name": "Alabama"}}});
        assert_eq!(probe_str(&nested, STATE_FIELDS).as_deref(), Some("AL"));
        let flat = json!({"placeOfPerformance": {"state": "TN"}});
        assert_eq!(probe_str(&flat, STATE_FIELDS).as_deref(), Some("TN"));
        let office = json!({"officeAddress": {"state": "DC"}});
        assert_eq!(probe_str(&office, STATE_FIELDS).as_deref(), Some("DC"));
        assert_eq!(probe_str(&json!({}), STATE_FIELDS), None);
    }

    #[test]
    fn classification_probe_order() {
        for (field, expected) in [
            ("classificationCode", "D399"),
            ("pscCode", "S201"),
            ("psc", "R408"),
            ("productServiceCode", "J065"),
        ] {
            let raw = json!({ field: expected });
            assert_eq!(probe_str(&raw, CLASSIFICATION_FIELDS).as_deref(), Some(expected));
        }
    }

    #[test]
    fn date_and_timestamp_parsing() {
        assert_eq!(parse_calendar_date("2025-02-14T17:00:00-05:00"), NaiveDate::from_ymd_opt(2025, 2, 14));
        assert_eq!(parse_calendar_date("02/14/2025"), NaiveDate::from_ymd_opt(2025, 2, 14));
        assert_eq!(parse_calendar_date("soon"), None);
        assert!(parse_timestamp("2025-01-11T09:30:00Z").is_some());
        assert!(parse_timestamp("2025-01-11 09:30:00").is_some());
        assert!(parse_timestamp("2025-01-11").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn non_array_body_is_a_data_error() {
        assert!(parse_search_body("541511", br#"{"opportunitiesData": {"a": 1}}"#).is_err());
        assert!(parse_search_body("541511", br#"[]"#).is_err());
        assert!(parse_search_body("541511", b"<html>").is_err());
        assert_eq!(
            parse_search_body("541511", br#"{"opportunitiesData": [], "totalRecords": 0}"#)
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn adapter_maps_success_body() {
        let (adapter, transport) = make_adapter(
            StatusCode::OK,
            Some(r#"{"totalRecords":1,"opportunitiesData":[{"noticeId":"n1","title":"T"}]}"#),
        );
        let result = adapter
            .fetch_partition(&AdapterContext::new(Uuid::nil()), "541511", &params(), "k")
            .await;
        match result {
            PartitionResult::Success(ok) => {
                assert_eq!(ok.count, 1);
                assert!(!ok.cached);
                assert_eq!(ok.opportunities[0].naics_code.as_deref(), Some("541511"));
                assert_eq!(
                    ok.opportunities[0].url.as_deref(),
                    Some("https://sam.gov/opp/n1/view")
                );
            }
            PartitionResult::Failure(f) => panic!("unexpected failure: {f:?}"),
        }
        assert!(transport
            .seen_query
            .lock()
            .unwrap()
            .contains(&("naics".to_string(), "541511".to_string())));
    }

    #[tokio::test]
    async fn adapter_reports_structured_failures() {
        let (adapter, _) = make_adapter(StatusCode::UNAUTHORIZED, Some(r#"{"error":"API_KEY_INVALID"}"#));
        let result = adapter
            .fetch_partition(&AdapterContext::new(Uuid::nil()), "541511", &params(), "bad")
            .await;
        let PartitionResult::Failure(failure) = result else {
            panic!("expected failure");
        };
        assert_eq!(failure.error_type, ErrorKind::Authentication);
        assert_eq!(failure.status_code, Some(401));
        assert_eq!(failure.response_body.as_deref(), Some(r#"{"error":"API_KEY_INVALID"}"#));

        let (adapter, _) = make_adapter(StatusCode::OK, None);
        let result = adapter
            .fetch_partition(&AdapterContext::new(Uuid::nil()), "541511", &params(), "k")
            .await;
        let PartitionResult::Failure(failure) = result else {
            panic!("expected failure");
        };
        assert_eq!(failure.error_type, ErrorKind::Network);
        assert_eq!(failure.status_code, None);

        let (adapter, _) = make_adapter(StatusCode::OK, Some(r#"{"opportunitiesData":"nope"}"#));
        let result = adapter
            .fetch_partition(&AdapterContext::new(Uuid::nil()), "541511", &params(), "k")
            .await;
        let PartitionResult::Failure(failure) = result else {
            panic!("expected failure");
        };
        assert_eq!(failure.error_type, ErrorKind::Data);
        assert_eq!(failure.status_code, Some(200));
    }
}
