//! Caller overrides merged over configured defaults into a validated query bundle.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use samop_core::ResolvedParams;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SearchDefaults;

pub const DAYS_BACK_RANGE: (i64, i64) = (1, 365);
pub const LIMIT_RANGE: (i64, i64) = (1, 1000);

/// Used when no requested notice type maps to an API code.
pub const DEFAULT_NOTICE_CODES: [&str; 3] = ["o", "k", "p"];

/// Human notice-type labels (lowercase) to single-letter API codes.
pub const NOTICE_TYPE_CODES: &[(&str, &str)] = &[
    ("presolicitation", "p"),
    ("solicitation", "o"),
    ("combined synopsis/solicitation", "k"),
    ("sources sought", "r"),
    ("special notice", "s"),
    ("sale of surplus property", "g"),
    ("justification", "u"),
    ("justification and approval", "u"),
    ("intent to bundle", "i"),
    ("award notice", "a"),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

/// Inbound invocation parameters. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawParams {
    pub naics_override: Option<Vec<String>>,
    pub psc_override: Option<Vec<String>>,
    pub notice_type: Option<StringOrList>,
    pub place: Option<String>,
    pub days_back: Option<i64>,
    pub limit: Option<i64>,
    pub keywords: Option<StringOrList>,
    pub small_business_only: Option<bool>,
    #[serde(rename = "clearCache", alias = "clear_cache")]
    pub clear_cache: Option<bool>,
    pub posted_from: Option<String>,
    pub posted_to: Option<String>,
}

impl RawParams {
    /// Decode a JSON invocation; shape errors are validation failures.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ValidationError> {
        serde_json::from_value(value).map_err(|e| ValidationError::new("params", e.to_string()))
    }

    /// Broadened variant used for the one-shot fallback search. An empty place
    /// resolves to nationwide even when the defaults name a state.
    pub fn broadened(&self) -> Self {
        Self {
            place: Some(String::new()),
            naics_override: Some(Vec::new()),
            psc_override: Some(Vec::new()),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParameterResolver {
    defaults: SearchDefaults,
}

impl ParameterResolver {
    pub fn new(defaults: SearchDefaults) -> Self {
        Self { defaults }
    }

    pub fn resolve(&self, raw: &RawParams) -> Result<ResolvedParams, ValidationError> {
        self.resolve_at(raw, Utc::now().date_naive())
    }

    pub fn resolve_at(&self, raw: &RawParams, today: NaiveDate) -> Result<ResolvedParams, ValidationError> {
        let naics_override = normalize_codes(raw.naics_override.as_deref().unwrap_or_default(), false);
        let naics_overridden = !naics_override.is_empty();
        let naics_codes = if naics_overridden {
            naics_override
        } else {
            normalize_codes(&self.defaults.naics_codes, false)
        };
        for code in &naics_codes {
            if !is_naics_code(code) {
                return Err(ValidationError::new(
                    "naics_override",
                    format!("`{code}` is not a 6-digit NAICS code"),
                ));
            }
        }

        let psc_override = normalize_codes(raw.psc_override.as_deref().unwrap_or_default(), true);
        let psc_overridden = !psc_override.is_empty();
        let psc_codes = if psc_overridden {
            psc_override
        } else {
            normalize_codes(&self.defaults.psc_codes, true)
        };

        let place = match raw.place.as_deref().map(str::trim) {
            Some("") => None,
            Some(place) => Some(normalize_place(place)?),
            None => match self.defaults.place.as_deref().map(str::trim) {
                Some("") | None => None,
                Some(place) => Some(normalize_place(place)?),
            },
        };

        let days_back = raw.days_back.unwrap_or(i64::from(self.defaults.days_back));
        check_range("days_back", days_back, DAYS_BACK_RANGE)?;
        let limit = raw.limit.unwrap_or(self.defaults.limit as i64);
        check_range("limit", limit, LIMIT_RANGE)?;

        let (posted_from, posted_to) = resolve_dates(raw, days_back, today)?;

        let notice_types = match &raw.notice_type {
            Some(labels) => list_values(labels),
            None => self.defaults.notice_types.clone(),
        };
        let notice_type_codes = translate_notice_types(&notice_types);

        let keywords = raw.keywords.as_ref().map(list_values).unwrap_or_default();

        let small_business_only = raw.small_business_only.unwrap_or(false);
        let set_aside_codes = if small_business_only {
            vec![self.defaults.small_business_set_aside.clone()]
        } else {
            normalize_codes(&self.defaults.set_aside_codes, true)
        };

        Ok(ResolvedParams {
            naics_codes,
            psc_codes,
            notice_types,
            notice_type_codes,
            place,
            days_back: days_back as u32,
            posted_from,
            posted_to,
            limit: limit as usize,
            keywords,
            clear_cache: raw.clear_cache.unwrap_or(false),
            set_aside_codes,
            small_business_only,
            naics_overridden,
            psc_overridden,
        })
    }
}

fn is_naics_code(code: &str) -> bool {
    code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit())
}

fn normalize_place(place: &str) -> Result<String, ValidationError> {
    let upper = place.to_ascii_uppercase();
    if upper.len() == 2 && upper.bytes().all(|b| b.is_ascii_uppercase()) {
        Ok(upper)
    } else {
        Err(ValidationError::new(
            "place",
            format!("`{place}` is not a 2-letter state code"),
        ))
    }
}

fn check_range(field: &'static str, value: i64, (min, max): (i64, i64)) -> Result<(), ValidationError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::new(
            field,
            format!("{value} is outside [{min}, {max}]"),
        ))
    }
}

/// Trim, drop empties and duplicates, keep first-seen order.
fn normalize_codes(codes: &[String], uppercase: bool) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(codes.len());
    for code in codes {
        let code = code.trim();
        if code.is_empty() {
            continue;
        }
        let code = if uppercase {
            code.to_ascii_uppercase()
        } else {
            code.to_string()
        };
        if !out.contains(&code) {
            out.push(code);
        }
    }
    out
}

fn list_values(input: &StringOrList) -> Vec<String> {
    let items: Vec<&str> = match input {
        StringOrList::One(s) => s.split(',').collect(),
        StringOrList::Many(v) => v.iter().map(String::as_str).collect(),
    };
    items
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_input_date(field: &'static str, text: &str) -> Result<NaiveDate, ValidationError> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%m/%d/%Y")
        .or_else(|_| NaiveDate::parse_from_str(text, "%Y-%m-%d"))
        .map_err(|_| ValidationError::new(field, format!("`{text}` is not a date (MM/DD/YYYY or YYYY-MM-DD)")))
}

fn resolve_dates(
    raw: &RawParams,
    days_back: i64,
    today: NaiveDate,
) -> Result<(NaiveDate, NaiveDate), ValidationError> {
    let explicit_from = raw
        .posted_from
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_input_date("posted_from", s))
        .transpose()?;
    let explicit_to = raw
        .posted_to
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_input_date("posted_to", s))
        .transpose()?;

    let to = explicit_to.unwrap_or(today);
    let from = explicit_from.unwrap_or(to - ChronoDuration::days(days_back));
    if from > to {
        return Err(ValidationError::new(
            "posted_from",
            format!("{from} is after {to}"),
        ));
    }
    Ok((from, to))
}

/// Map labels to API codes; unknown labels are dropped and an empty result
/// falls back to [`DEFAULT_NOTICE_CODES`].
pub fn translate_notice_types(labels: &[String]) -> Vec<String> {
    let mut codes: Vec<String> = Vec::new();
    for label in labels {
        let key = label.trim().to_ascii_lowercase();
        let code = NOTICE_TYPE_CODES
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, code)| *code)
            .or_else(|| {
                NOTICE_TYPE_CODES
                    .iter()
                    .find(|(_, code)| *code == key)
                    .map(|(_, code)| *code)
            });
        if let Some(code) = code {
            if !codes.iter().any(|c| c == code) {
                codes.push(code.to_string());
            }
        }
    }
    if codes.is_empty() {
        DEFAULT_NOTICE_CODES.iter().map(|c| c.to_string()).collect()
    } else {
        codes
    }
}
