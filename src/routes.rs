//! API route handlers.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::ingest::Pipeline;
use crate::monitor::{self, MonitorEdge};
use crate::scraper::{Organiser, ProgressSender, UrlAnalysis};
use crate::types::{
    AnalyzeRequest, ErrorResponse, HealthResponse, JobsResponse, MonitorResponse, ScrapeAccepted,
    ScrapeRequest,
};

/// Application state shared across handlers.
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub config: AppConfig,
}

/// Error type for API handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "missing or invalid admin key".to_string(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.status.to_string(),
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

/// Admin endpoints require the pre-shared key when one is configured.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.admin_key.as_deref() else {
        return Ok(());
    };
    let provided = headers.get("x-admin-key").and_then(|v| v.to_str().ok());
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Pre-scrape probe of an event URL.
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<UrlAnalysis>, ApiError> {
    let Some(organiser) = Organiser::for_url(&req.url) else {
        return Ok(Json(UrlAnalysis::invalid()));
    };

    let analysis = organiser
        .analyze_url(&state.pipeline.ctx, &req.url)
        .await
        .map_err(|e| ApiError::internal(format!("analysis failed: {}", e)))?;
    Ok(Json(analysis))
}

/// Enqueue a scrape job and run it in the background.
pub async fn scrape(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ScrapeRequest>,
) -> Result<Json<ScrapeAccepted>, ApiError> {
    require_admin(&state, &headers)?;

    if !req.url.starts_with("http://") && !req.url.starts_with("https://") {
        return Err(ApiError::bad_request("url must be http or https"));
    }
    if let Some(hint) = req.organiser.as_deref() {
        if Organiser::parse(hint).is_none() {
            return Err(ApiError::bad_request(format!("unknown organiser {}", hint)));
        }
    }

    let job = state
        .pipeline
        .store
        .create_job(
            req.organiser.as_deref(),
            &req.url,
            state.config.scraper.max_retries,
        )
        .map_err(|e| ApiError::internal(format!("failed to create job: {}", e)))?;

    let pipeline = state.pipeline.clone();
    let spawned = job.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline.run_job(&spawned, &ProgressSender::discard()).await {
            tracing::error!("job {} crashed: {}", spawned.id, e);
        }
    });

    Ok(Json(ScrapeAccepted {
        job_id: job.id,
        status: job.status.as_str().to_string(),
    }))
}

/// Run a monitor pass now. Same effect as the scheduled pass.
pub async fn monitor_pass(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<MonitorResponse>, ApiError> {
    require_admin(&state, &headers)?;

    let fetcher = monitor::probe_fetcher();
    let edges = monitor::run_monitor_pass(&state.pipeline.store, &fetcher)
        .await
        .map_err(|e| ApiError::internal(format!("monitor pass failed: {}", e)))?;

    let edges = edges
        .iter()
        .map(|edge| match edge {
            MonitorEdge::WentUp { name, .. } => format!("up: {}", name),
            MonitorEdge::WentDown { name, .. } => format!("down: {}", name),
        })
        .collect();
    Ok(Json(MonitorResponse { edges }))
}

/// Drain due retry jobs now. Same effect as the scheduled drain.
pub async fn drain(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers)?;
    let processed = crate::queue::drain(&state.pipeline)
        .await
        .map_err(|e| ApiError::internal(format!("drain failed: {}", e)))?;
    Ok(Json(serde_json::json!({ "processed": processed })))
}

/// List recent scrape jobs.
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<JobsResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let jobs = state
        .pipeline
        .store
        .list_jobs(100)
        .map_err(|e| ApiError::internal(format!("failed to list jobs: {}", e)))?;
    Ok(Json(JobsResponse { jobs }))
}

/// Fetch one scrape job.
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;
    let job = state
        .pipeline
        .store
        .get_job(&id)
        .map_err(|e| ApiError::internal(format!("failed to fetch job: {}", e)))?
        .ok_or_else(|| ApiError::not_found(format!("no job {}", id)))?;
    Ok(Json(job).into_response())
}
