//! Scraper runtime for organiser result pages.
//!
//! Provides the organiser registry, the scrape envelope types, the progress
//! observer channel and the shared scrape context (fetcher, renderer,
//! politeness, cancellation).

pub mod browser;
pub mod checkpoints;
pub mod evochip;
pub mod hopasports;
pub mod politeness;
pub mod validate;

pub use browser::Renderer;
pub use politeness::Politeness;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::fetch::{FetchError, Fetcher};
use crate::storage::models::{CheckpointType, RaceType, ResultStatus};

/// Scrape failures, classified so the coordinator can decide on retries.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("no scraper matches {0}")]
    NoScraper(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("parse failure: {0}")]
    Parse(String),

    #[error("browser failure: {0}")]
    Browser(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag, observed at page boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Return `Err(Cancelled)` once the flag is raised.
    pub fn check(&self) -> Result<(), ScrapeError> {
        if self.is_cancelled() {
            Err(ScrapeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Scraper progress stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Initializing,
    Connecting,
    DetectingPages,
    Scraping,
    Validating,
    Saving,
    Complete,
    Error,
}

impl ProgressStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStage::Complete | ProgressStage::Error)
    }
}

/// One progress token pushed by a running scrape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub stage: ProgressStage,
    pub results_scraped: u32,
    pub total_pages: u32,
    pub current_page: u32,
    pub percent_complete: u8,
    #[serde(default)]
    pub message: Option<String>,
}

impl Progress {
    pub fn stage(stage: ProgressStage) -> Self {
        Self {
            stage,
            results_scraped: 0,
            total_pages: 0,
            current_page: 0,
            percent_complete: 0,
            message: None,
        }
    }
}

/// Non-blocking observer for progress tokens.
///
/// Intermediate updates are dropped when the receiver lags; terminal stages
/// (`complete`, `error`) are always delivered.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<Progress>,
}

impl ProgressSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Progress>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// A sender whose tokens go nowhere (for callers that don't observe).
    pub fn discard() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    /// Push an intermediate token; dropped if the channel is full.
    pub fn update(&self, progress: Progress) {
        if progress.stage.is_terminal() {
            tracing::warn!("terminal progress pushed through update(); use finish()");
        }
        let _ = self.tx.try_send(progress);
    }

    /// Deliver a terminal token, waiting for channel space if needed.
    pub async fn finish(&self, progress: Progress) {
        let _ = self.tx.send(progress).await;
    }
}

/// Event metadata extracted by a scraper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapedEvent {
    pub url: String,
    pub organiser: String,
    pub name: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub distances: Vec<ScrapedDistance>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapedDistance {
    pub name: String,
    pub distance_meters: u32,
    pub race_type: RaceType,
    #[serde(default)]
    pub expected_checkpoints: Vec<String>,
    #[serde(default)]
    pub participant_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapedCheckpoint {
    pub name: String,
    pub checkpoint_type: CheckpointType,
    pub order: u32,
    #[serde(default)]
    pub split_time: Option<String>,
    #[serde(default)]
    pub cumulative_time: Option<String>,
    #[serde(default)]
    pub pace: Option<String>,
    #[serde(default)]
    pub segment_distance_meters: Option<u32>,
}

/// One parsed result row, organiser-agnostic.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScrapedResult {
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub bib: Option<String>,
    pub name: String,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub finish_time: Option<String>,
    #[serde(default)]
    pub gun_time: Option<String>,
    #[serde(default)]
    pub chip_time: Option<String>,
    #[serde(default)]
    pub pace: Option<String>,
    #[serde(default)]
    pub gender_position: Option<u32>,
    #[serde(default)]
    pub category_position: Option<u32>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub club: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub status: Option<ResultStatus>,
    #[serde(default)]
    pub time_behind: Option<String>,
    #[serde(default)]
    pub distance_name: Option<String>,
    #[serde(default)]
    pub checkpoints: Vec<ScrapedCheckpoint>,
    /// Logical field names the source actually provided.
    #[serde(default)]
    pub fields_provided: Vec<String>,
}

impl ScrapedResult {
    /// Fields present in this row; used for provenance when the scraper
    /// did not record source keys itself.
    pub fn populated_fields(&self) -> Vec<String> {
        let mut fields = vec!["name".to_string()];
        let mut push = |cond: bool, name: &str| {
            if cond {
                fields.push(name.to_string());
            }
        };
        push(self.position.is_some(), "position");
        push(self.bib.is_some(), "bib");
        push(self.gender.is_some(), "gender");
        push(self.category.is_some(), "category");
        push(self.finish_time.is_some(), "finish_time");
        push(self.gun_time.is_some(), "gun_time");
        push(self.chip_time.is_some(), "chip_time");
        push(self.pace.is_some(), "pace");
        push(self.gender_position.is_some(), "gender_position");
        push(self.category_position.is_some(), "category_position");
        push(self.country.is_some(), "country");
        push(self.club.is_some(), "club");
        push(self.age.is_some(), "age");
        push(self.time_behind.is_some(), "time_behind");
        push(!self.checkpoints.is_empty(), "checkpoints");
        fields
    }
}

/// Scrape run bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapeMetadata {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub total_pages: u32,
    pub total_results: u32,
    pub used_headless_browser: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Full scrape envelope: event, ordered results, run metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapedResults {
    pub event: ScrapedEvent,
    pub results: Vec<ScrapedResult>,
    pub metadata: ScrapeMetadata,
}

/// Options for one scrape run.
#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    pub allow_headless: bool,
    pub max_pages: Option<u32>,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            allow_headless: true,
            max_pages: None,
        }
    }
}

/// Pre-scrape probe outcome.
#[derive(Debug, Clone, Serialize)]
pub struct UrlAnalysis {
    pub valid: bool,
    pub organiser: Option<String>,
    pub event_name: Option<String>,
    pub event_date: Option<NaiveDate>,
    pub estimated_distances: Vec<String>,
    pub estimated_results: Option<u32>,
    pub requires_headless: bool,
}

impl UrlAnalysis {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            organiser: None,
            event_name: None,
            event_date: None,
            estimated_distances: Vec::new(),
            estimated_results: None,
            requires_headless: false,
        }
    }
}

/// What a scraper declares it can do.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub supports_headless: bool,
    pub supports_pagination: bool,
    pub supports_multiple_distances: bool,
    pub supports_checkpoints: bool,
    /// Expected checkpoint names keyed by distance name.
    pub expected_checkpoints: HashMap<String, Vec<String>>,
}

/// One row of an athlete's result history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AthleteHistoryRow {
    pub event_name: String,
    #[serde(default)]
    pub event_date: Option<NaiveDate>,
    #[serde(default)]
    pub distance_name: Option<String>,
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub finish_time: Option<String>,
}

/// Shared resources handed to every scrape.
pub struct ScrapeContext {
    pub fetcher: Fetcher,
    pub renderer: Renderer,
    pub politeness: Politeness,
    pub cancel: CancelFlag,
}

impl ScrapeContext {
    pub fn new(politeness_delay_ms: u64) -> Self {
        Self {
            fetcher: Fetcher::new(),
            renderer: Renderer::new(),
            politeness: Politeness::new(politeness_delay_ms),
            cancel: CancelFlag::new(),
        }
    }
}

/// The organisers the pipeline can ingest from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Organiser {
    Hopasports,
    EvoChip,
}

/// All registered organisers, in selection order.
pub const ORGANISERS: &[Organiser] = &[Organiser::Hopasports, Organiser::EvoChip];

impl Organiser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Organiser::Hopasports => "hopasports",
            Organiser::EvoChip => "evochip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hopasports" => Some(Organiser::Hopasports),
            "evochip" => Some(Organiser::EvoChip),
            _ => None,
        }
    }

    /// URL-match predicate for this organiser.
    pub fn matches_url(&self, url: &str) -> bool {
        match self {
            Organiser::Hopasports => hopasports::matches_url(url),
            Organiser::EvoChip => evochip::matches_url(url),
        }
    }

    /// Select the organiser whose predicate accepts the URL.
    pub fn for_url(url: &str) -> Option<Organiser> {
        ORGANISERS.iter().copied().find(|o| o.matches_url(url))
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Organiser::Hopasports => hopasports::capabilities(),
            Organiser::EvoChip => evochip::capabilities(),
        }
    }

    /// Lightweight pre-scrape probe.
    pub async fn analyze_url(&self, ctx: &ScrapeContext, url: &str) -> Result<UrlAnalysis, ScrapeError> {
        match self {
            Organiser::Hopasports => hopasports::analyze_url(ctx, url).await,
            Organiser::EvoChip => evochip::analyze_url(ctx, url).await,
        }
    }

    /// Run a full scrape of one event URL.
    pub async fn scrape_event(
        &self,
        ctx: &ScrapeContext,
        url: &str,
        options: &ScrapeOptions,
        progress: &ProgressSender,
    ) -> Result<ScrapedResults, ScrapeError> {
        match self {
            Organiser::Hopasports => hopasports::scrape_event(ctx, url, options, progress).await,
            Organiser::EvoChip => evochip::scrape_event(ctx, url, options, progress).await,
        }
    }

    /// Per-athlete result history, where the organiser exposes one.
    pub async fn scrape_athlete_profile(
        &self,
        ctx: &ScrapeContext,
        url: &str,
    ) -> Result<Vec<AthleteHistoryRow>, ScrapeError> {
        match self {
            Organiser::Hopasports => Err(ScrapeError::Parse(
                "athlete profiles not published by this organiser".to_string(),
            )),
            Organiser::EvoChip => evochip::scrape_athlete_profile(ctx, url).await,
        }
    }
}

/// Parse a positive integer cell; `-` and empty strings are absent.
pub(crate) fn parse_positive(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" {
        return None;
    }
    trimmed.parse::<u32>().ok().filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_organiser_round_trip() {
        for org in ORGANISERS {
            assert_eq!(Organiser::parse(org.as_str()), Some(*org));
        }
    }

    #[test]
    fn test_for_url_selects_by_predicate() {
        assert_eq!(
            Organiser::for_url("https://results.hopasports.com/events/spring-half"),
            Some(Organiser::Hopasports)
        );
        assert_eq!(
            Organiser::for_url("https://live.evochip.net/event/42/results?page=1"),
            Some(Organiser::EvoChip)
        );
        assert_eq!(Organiser::for_url("https://example.com/race"), None);
    }

    #[test]
    fn test_parse_positive() {
        assert_eq!(parse_positive("3"), Some(3));
        assert_eq!(parse_positive(" 12 "), Some(12));
        assert_eq!(parse_positive("-"), None);
        assert_eq!(parse_positive(""), None);
        assert_eq!(parse_positive("0"), None);
        assert_eq!(parse_positive("abc"), None);
    }

    #[test]
    fn test_populated_fields() {
        let result = ScrapedResult {
            position: Some(1),
            bib: Some("42".to_string()),
            name: "Jane Doe".to_string(),
            finish_time: Some("1:32:05".to_string()),
            ..Default::default()
        };
        let fields = result.populated_fields();
        assert!(fields.contains(&"position".to_string()));
        assert!(fields.contains(&"bib".to_string()));
        assert!(fields.contains(&"name".to_string()));
        assert!(fields.contains(&"finish_time".to_string()));
        assert!(!fields.contains(&"country".to_string()));
    }

    #[tokio::test]
    async fn test_progress_drops_intermediate_keeps_terminal() {
        let (sender, mut rx) = ProgressSender::channel(1);

        // Fill the channel, then push more intermediates: they are dropped.
        sender.update(Progress::stage(ProgressStage::Connecting));
        sender.update(Progress::stage(ProgressStage::Scraping));
        sender.update(Progress::stage(ProgressStage::Scraping));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.stage, ProgressStage::Connecting);

        // Terminal delivery waits for space instead of dropping.
        sender.finish(Progress::stage(ProgressStage::Complete)).await;
        let last = rx.recv().await.unwrap();
        assert_eq!(last.stage, ProgressStage::Complete);
    }

    #[test]
    fn test_scraped_results_round_trip() {
        let payload = ScrapedResults {
            event: ScrapedEvent {
                url: "https://results.hopasports.com/events/spring".to_string(),
                organiser: "hopasports".to_string(),
                name: "Spring Races".to_string(),
                date: NaiveDate::from_ymd_opt(2025, 4, 12).unwrap(),
                location: None,
                distances: vec![ScrapedDistance {
                    name: "Half Marathon".to_string(),
                    distance_meters: 21_097,
                    race_type: RaceType::Running,
                    expected_checkpoints: vec!["5km".to_string(), "finish".to_string()],
                    participant_count: Some(2),
                }],
            },
            results: vec![ScrapedResult {
                position: Some(1),
                bib: Some("42".to_string()),
                name: "Jane Doe".to_string(),
                checkpoints: vec![ScrapedCheckpoint {
                    name: "5km".to_string(),
                    checkpoint_type: CheckpointType::Distance,
                    order: 1,
                    split_time: None,
                    cumulative_time: Some("22:10".to_string()),
                    pace: None,
                    segment_distance_meters: Some(5000),
                }],
                ..Default::default()
            }],
            metadata: ScrapeMetadata {
                started_at: Utc::now(),
                completed_at: Utc::now(),
                total_pages: 1,
                total_results: 1,
                used_headless_browser: false,
                errors: vec![],
                warnings: vec![],
            },
        };

        let json = serde_json::to_string(&payload).unwrap();
        let back: ScrapedResults = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
