//! Axum JSON surface for triggering SAM.gov fetches and reading the latest result.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use samop_core::{ErrorKind, LegacyResponse};
use samop_storage::StateStore;
use samop_sync::{build_workflow, maybe_build_scheduler, SyncConfig, Workflow};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "samop-web";

#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<Workflow>,
    pub state: StateStore,
}

impl AppState {
    pub fn new(workflow: Arc<Workflow>) -> Self {
        let state = workflow.state_store().clone();
        Self { workflow, state }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/opportunities/fetch", post(fetch_handler))
        .route("/api/opportunities/latest", get(latest_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let workflow = Arc::new(build_workflow(&config)?);

    let scheduler = maybe_build_scheduler(&config, Arc::clone(&workflow)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %config.sync_cron, "sam fetch scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving sam opportunity api");
    axum::serve(listener, app(AppState::new(workflow))).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok", "service": CRATE_NAME})).into_response()
}

/// Always answers with a legacy envelope; the HTTP status mirrors its outcome.
async fn fetch_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        Ok(json!({}))
    } else {
        serde_json::from_slice::<serde_json::Value>(&body)
    };

    let response = match payload {
        Ok(value) => state.workflow.run_json(value).await,
        Err(err) => {
            warn!(error = %err, "fetch request body is not JSON");
            state
                .workflow
                .rejection(ErrorKind::Validation, format!("request body is not valid JSON: {err}"))
        }
    };
    (status_for(&response), Json(response)).into_response()
}

async fn latest_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.state.load_legacy().await {
        Ok(Some(latest)) => Json(latest).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no fetch has completed yet"})),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("{err:#}")})),
        )
            .into_response(),
    }
}

fn status_for(response: &LegacyResponse) -> StatusCode {
    if response.success {
        return StatusCode::OK;
    }
    match response.errors.first().map(|e| e.error_type) {
        Some(ErrorKind::Validation) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(ErrorKind::Configuration) => StatusCode::SERVICE_UNAVAILABLE,
        Some(ErrorKind::Unexpected) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    }
}
