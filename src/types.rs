//! Request and response types for the PacePulse API.

use serde::{Deserialize, Serialize};

use crate::storage::models::ScrapeJob;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error payload
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Request to enqueue a scrape
#[derive(Debug, Deserialize)]
pub struct ScrapeRequest {
    pub url: String,
    /// Organiser hint; auto-detected from the URL when absent
    #[serde(default)]
    pub organiser: Option<String>,
}

/// Accepted scrape job
#[derive(Debug, Serialize)]
pub struct ScrapeAccepted {
    pub job_id: String,
    pub status: String,
}

/// Request for a pre-scrape probe
#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub url: String,
}

/// Jobs listing
#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<ScrapeJob>,
}

/// Outcome of a manually triggered monitor pass
#[derive(Debug, Serialize)]
pub struct MonitorResponse {
    pub edges: Vec<String>,
}
