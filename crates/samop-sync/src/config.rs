use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use samop_adapters::DEFAULT_SEARCH_URL;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fetcher::PacingConfig;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_key: Option<String>,
    pub search_url: String,
    pub state_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub defaults_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub pacing: PacingConfig,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub log_level: String,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("SAM_API_KEY")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            search_url: std::env::var("SAM_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_SEARCH_URL.to_string()),
            state_dir: std::env::var("SAMOP_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./storage/sam")),
            cache_dir: std::env::var("SAMOP_CACHE_DIR").ok().map(PathBuf::from),
            defaults_path: std::env::var("SAMOP_DEFAULTS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sam_defaults.yaml")),
            user_agent: std::env::var("SAMOP_USER_AGENT")
                .unwrap_or_else(|_| "samop/0.1".to_string()),
            http_timeout_secs: std::env::var("SAMOP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            pacing: pacing_from_env(),
            scheduler_enabled: std::env::var("SAMOP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SAMOP_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6,18 * * *".to_string()),
            log_level: std::env::var("SAMOP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            web_port: std::env::var("SAMOP_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

fn pacing_from_env() -> PacingConfig {
    let defaults = PacingConfig::default();
    let millis = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok());
    PacingConfig {
        base_delay: millis("SAMOP_PACING_BASE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay),
        max_jitter: millis("SAMOP_PACING_JITTER_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_jitter),
    }
}

/// Search scope applied when a caller leaves a parameter unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchDefaults {
    pub naics_codes: Vec<String>,
    pub psc_codes: Vec<String>,
    pub notice_types: Vec<String>,
    pub days_back: u32,
    pub limit: usize,
    pub place: Option<String>,
    pub set_aside_codes: Vec<String>,
    pub small_business_set_aside: String,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            naics_codes: ["541511", "541512", "541519", "541330", "541611", "561210"]
                .into_iter()
                .map(String::from)
                .collect(),
            psc_codes: ["D399", "R425", "R408"].into_iter().map(String::from).collect(),
            notice_types: ["Solicitation", "Combined Synopsis/Solicitation", "Presolicitation"]
                .into_iter()
                .map(String::from)
                .collect(),
            days_back: 30,
            limit: 100,
            place: None,
            set_aside_codes: Vec::new(),
            small_business_set_aside: "SBA".to_string(),
        }
    }
}

impl SearchDefaults {
    /// Load from YAML, falling back to built-in defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "defaults file missing; using built-in defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
