//! Ingestion coordinator.
//!
//! Drives one scrape job end to end: select the scraper, run it, validate,
//! persist event, distances, results, checkpoints and provenance, then
//! settle the job. Every persistence step is idempotent by the schema's
//! unique constraints, so re-running a URL neither duplicates the event nor
//! its results.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::names::normalize_name;
use crate::notify::{self, Notifier};
use crate::queue;
use crate::scraper::checkpoints::validate_timing;
use crate::scraper::validate::validate_results;
use crate::scraper::{
    Organiser, Progress, ProgressSender, ProgressStage, ScrapeContext, ScrapeError, ScrapeOptions,
    ScrapedResults,
};
use crate::storage::models::{
    Event, EventDistance, RaceResult, ResultSource, ResultStatus, ScrapeJob, TimingCheckpoint,
};
use crate::storage::{new_id, Store};

/// Results are persisted in batches of this size.
const RESULT_BATCH: usize = 500;

/// Shared pipeline wiring for scrape jobs.
pub struct Pipeline {
    pub store: Arc<Store>,
    pub ctx: Arc<ScrapeContext>,
    pub notifier: Arc<Notifier>,
    /// Field-population floor (percent) below which the validator warns.
    pub validation_floor: f64,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        ctx: Arc<ScrapeContext>,
        notifier: Arc<Notifier>,
        validation_floor: f64,
    ) -> Self {
        Self {
            store,
            ctx,
            notifier,
            validation_floor,
        }
    }

    /// Run one job to completion or failure.
    pub async fn run_job(&self, job: &ScrapeJob, progress: &ProgressSender) -> Result<()> {
        self.store.mark_job_running(&job.id)?;

        match self.ingest_event(job, progress).await {
            Ok(results_count) => {
                self.store.mark_job_completed(&job.id, results_count)?;
                let text = if job.retry_count > 0 {
                    notify::scrape_retry_success(job, results_count)
                } else {
                    notify::scrape_complete(job, results_count)
                };
                self.notifier.send_for_job(&self.store, job, text);
                progress.finish(Progress::stage(ProgressStage::Complete)).await;
                Ok(())
            }
            Err(ScrapeError::Cancelled) => {
                // A cancelled job never re-enters the queue
                self.store.mark_job_failed(&job.id, "cancelled", None)?;
                progress.finish(Progress::stage(ProgressStage::Error)).await;
                Ok(())
            }
            Err(e) => {
                queue::handle_failure(&self.store, &self.notifier, job, &e.to_string())?;
                progress.finish(Progress::stage(ProgressStage::Error)).await;
                Ok(())
            }
        }
    }

    /// Scrape and persist one event URL. Returns the persisted result count.
    async fn ingest_event(
        &self,
        job: &ScrapeJob,
        progress: &ProgressSender,
    ) -> Result<u32, ScrapeError> {
        let url = &job.event_url;
        let organiser = job
            .organiser
            .as_deref()
            .and_then(Organiser::parse)
            .or_else(|| Organiser::for_url(url))
            .ok_or_else(|| ScrapeError::NoScraper(url.clone()))?;

        info!("scraping {} via {}", url, organiser.as_str());
        let scraped = organiser
            .scrape_event(&self.ctx, url, &ScrapeOptions::default(), progress)
            .await?;

        let report = validate_results(&scraped, self.validation_floor);
        if report.has_critical_errors() {
            warn!(
                "{}: {} rows with critical validation errors",
                url,
                report.errors.len()
            );
        }
        for warning in &report.warnings {
            warn!("{}: {}", url, warning);
        }

        progress.update(Progress::stage(ProgressStage::Saving));
        let count = self
            .persist(organiser, &scraped, report.completeness_score)
            .map_err(|e| ScrapeError::Persistence(e.to_string()))?;

        Ok(count)
    }

    /// Persist a scraped payload. All inserts are idempotent.
    fn persist(
        &self,
        organiser: Organiser,
        scraped: &ScrapedResults,
        completeness: f64,
    ) -> Result<u32> {
        let store = &self.store;

        let event_id = store.insert_event(&Event {
            id: new_id(),
            url: scraped.event.url.clone(),
            organiser: organiser.as_str().to_string(),
            name: scraped.event.name.clone(),
            event_date: scraped.event.date,
            location: scraped.event.location.clone(),
            metadata: None,
            scraped_at: None,
        })?;

        let mut distance_ids: HashMap<String, String> = HashMap::new();
        for distance in &scraped.event.distances {
            let id = store.insert_distance(&EventDistance {
                id: new_id(),
                event_id: event_id.clone(),
                distance_name: distance.name.clone(),
                distance_meters: distance.distance_meters,
                race_type: distance.race_type,
                expected_checkpoints: distance.expected_checkpoints.clone(),
                participant_count: distance.participant_count,
            })?;
            distance_ids.insert(distance.name.clone(), id);
        }

        let distance_meters: HashMap<&str, u32> = scraped
            .event
            .distances
            .iter()
            .map(|d| (d.name.as_str(), d.distance_meters))
            .collect();

        let confidence = completeness.round().clamp(0.0, 100.0) as u8;
        let scraped_at = Utc::now();
        let mut persisted = 0u32;

        for chunk in scraped.results.chunks(RESULT_BATCH) {
            let rows: Vec<RaceResult> = chunk
                .iter()
                .map(|row| {
                    let meters = row
                        .distance_name
                        .as_deref()
                        .and_then(|n| distance_meters.get(n))
                        .copied();
                    let timing = validate_timing(
                        &row.checkpoints
                            .iter()
                            .map(|cp| TimingCheckpoint {
                                id: String::new(),
                                result_id: String::new(),
                                checkpoint_type: cp.checkpoint_type,
                                checkpoint_name: cp.name.clone(),
                                checkpoint_order: cp.order,
                                split_time: cp.split_time.clone(),
                                cumulative_time: cp.cumulative_time.clone(),
                                pace: cp.pace.clone(),
                                segment_distance_meters: cp.segment_distance_meters,
                            })
                            .collect::<Vec<_>>(),
                        row.finish_time.as_deref(),
                        meters,
                        row.gender.as_deref(),
                    );
                    let validation = if timing.is_clean() {
                        None
                    } else {
                        serde_json::to_string(&timing.warnings).ok()
                    };

                    RaceResult {
                        id: new_id(),
                        event_id: event_id.clone(),
                        distance_id: row
                            .distance_name
                            .as_deref()
                            .and_then(|n| distance_ids.get(n))
                            .cloned(),
                        athlete_id: None,
                        position: row.position,
                        bib: row.bib.clone(),
                        name: row.name.clone(),
                        normalized_name: normalize_name(&row.name),
                        gender: row.gender.clone(),
                        category: row.category.clone(),
                        finish_time: row.finish_time.clone(),
                        gun_time: row.gun_time.clone(),
                        chip_time: row.chip_time.clone(),
                        pace: row.pace.clone(),
                        gender_position: row.gender_position,
                        category_position: row.category_position,
                        country: row.country.clone(),
                        club: row.club.clone(),
                        age: row.age,
                        status: row.status.unwrap_or(ResultStatus::Finished),
                        time_behind: row.time_behind.clone(),
                        validation,
                    }
                })
                .collect();

            let outcomes = store.insert_results(&rows)?;

            for (row, outcome) in chunk.iter().zip(outcomes) {
                // Duplicates resolve to the stored row so later sources
                // still attach
                let result_id = match outcome {
                    Some(id) => {
                        persisted += 1;
                        id
                    }
                    None => {
                        let Some(id) = store.find_result_id(
                            &event_id,
                            row.position,
                            &row.name,
                            row.bib.as_deref(),
                        )?
                        else {
                            continue;
                        };
                        id
                    }
                };

                for cp in &row.checkpoints {
                    store.insert_checkpoint(&TimingCheckpoint {
                        id: new_id(),
                        result_id: result_id.clone(),
                        checkpoint_type: cp.checkpoint_type,
                        checkpoint_name: cp.name.clone(),
                        checkpoint_order: cp.order,
                        split_time: cp.split_time.clone(),
                        cumulative_time: cp.cumulative_time.clone(),
                        pace: cp.pace.clone(),
                        segment_distance_meters: cp.segment_distance_meters,
                    })?;
                }

                let fields_provided = if row.fields_provided.is_empty() {
                    row.populated_fields()
                } else {
                    row.fields_provided.clone()
                };
                store.insert_source(&ResultSource {
                    id: new_id(),
                    result_id,
                    organiser: organiser.as_str().to_string(),
                    source_url: scraped.event.url.clone(),
                    scraped_at,
                    fields_provided,
                    confidence,
                    is_primary: false,
                })?;
            }
        }

        store.set_event_scraped_at(&event_id, scraped_at)?;
        info!(
            "persisted {} new results for {} ({} scraped)",
            persisted,
            scraped.event.url,
            scraped.results.len()
        );
        Ok(scraped.results.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::{
        ScrapeMetadata, ScrapedCheckpoint, ScrapedDistance, ScrapedEvent, ScrapedResult,
    };
    use crate::storage::models::{CheckpointType, RaceType};
    use chrono::NaiveDate;

    fn pipeline() -> Pipeline {
        Pipeline::new(
            Arc::new(Store::in_memory().unwrap()),
            Arc::new(ScrapeContext::new(0)),
            Arc::new(Notifier::disabled()),
            50.0,
        )
    }

    fn two_distance_payload() -> ScrapedResults {
        let row = |pos: u32, name: &str, distance: &str| ScrapedResult {
            position: Some(pos),
            bib: Some(format!("{}", pos)),
            name: name.to_string(),
            finish_time: Some("1:32:05".to_string()),
            distance_name: Some(distance.to_string()),
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
        };

        ScrapedResults {
            event: ScrapedEvent {
                url: "https://results.hopasports.com/events/spring".to_string(),
                organiser: "hopasports".to_string(),
                name: "Spring Races".to_string(),
                date: NaiveDate::from_ymd_opt(2025, 4, 12).unwrap(),
                location: None,
                distances: vec![
                    ScrapedDistance {
                        name: "Half Marathon".to_string(),
                        distance_meters: 21_097,
                        race_type: RaceType::Running,
                        expected_checkpoints: vec!["5km".to_string()],
                        participant_count: Some(2),
                    },
                    ScrapedDistance {
                        name: "10K".to_string(),
                        distance_meters: 10_000,
                        race_type: RaceType::Running,
                        expected_checkpoints: vec!["5km".to_string()],
                        participant_count: Some(1),
                    },
                ],
            },
            results: vec![
                row(1, "Jane Doe", "Half Marathon"),
                row(2, "John Roe", "Half Marathon"),
                row(1, "Ann Poe", "10K"),
            ],
            metadata: ScrapeMetadata {
                started_at: Utc::now(),
                completed_at: Utc::now(),
                total_pages: 2,
                total_results: 3,
                used_headless_browser: false,
                errors: vec![],
                warnings: vec![],
            },
        }
    }

    #[test]
    fn test_persist_two_distance_event() {
        let p = pipeline();
        let payload = two_distance_payload();
        let count = p.persist(Organiser::Hopasports, &payload, 95.0).unwrap();
        assert_eq!(count, 3);

        let event = p
            .store
            .get_event_by_url("https://results.hopasports.com/events/spring")
            .unwrap()
            .unwrap();
        assert!(event.scraped_at.is_some());

        let distances = p.store.get_distances(&event.id).unwrap();
        assert_eq!(distances.len(), 2);
        assert_eq!(distances[0].distance_meters, 21_097);
        assert_eq!(distances[1].distance_meters, 10_000);

        let results = p.store.get_results_for_event(&event.id).unwrap();
        assert_eq!(results.len(), 3);
        let half_id = &distances[0].id;
        assert_eq!(
            results
                .iter()
                .filter(|r| r.distance_id.as_deref() == Some(half_id.as_str()))
                .count(),
            2
        );

        for result in &results {
            let sources = p.store.get_sources(&result.id).unwrap();
            assert_eq!(sources.len(), 1);
            assert_eq!(sources[0].organiser, "hopasports");
            assert_eq!(sources[0].source_url, payload.event.url);
            assert_eq!(sources[0].confidence, 95);
            assert!(sources[0].is_primary);

            let checkpoints = p.store.get_checkpoints(&result.id).unwrap();
            assert_eq!(checkpoints.len(), 1);
            assert_eq!(checkpoints[0].checkpoint_name, "5km");
        }
    }

    #[test]
    fn test_reingest_does_not_duplicate() {
        let p = pipeline();
        let payload = two_distance_payload();

        p.persist(Organiser::Hopasports, &payload, 95.0).unwrap();
        p.persist(Organiser::Hopasports, &payload, 95.0).unwrap();

        let event = p
            .store
            .get_event_by_url(&payload.event.url)
            .unwrap()
            .unwrap();
        let results = p.store.get_results_for_event(&event.id).unwrap();
        assert_eq!(results.len(), 3);

        // The second pass still attaches provenance to the existing rows
        let sources = p.store.get_sources(&results[0].id).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources.iter().filter(|s| s.is_primary).count(), 1);
    }

    #[tokio::test]
    async fn test_run_job_no_scraper_fails_with_retry() {
        let p = pipeline();
        let job = p
            .store
            .create_job(None, "https://unknown.example.com/results", 3)
            .unwrap();

        p.run_job(&job, &ProgressSender::discard()).await.unwrap();

        let stored = p.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(
            stored.status,
            crate::storage::models::JobStatus::Failed
        );
        assert!(stored.error_message.unwrap().contains("no scraper"));
        assert!(stored.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_job_never_requeues() {
        let p = pipeline();
        p.ctx.cancel.cancel();
        let job = p
            .store
            .create_job(Some("hopasports"), "https://results.hopasports.com/e/1", 3)
            .unwrap();

        p.run_job(&job, &ProgressSender::discard()).await.unwrap();

        let stored = p.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, crate::storage::models::JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("cancelled"));
        assert!(stored.next_retry_at.is_none());
    }
}
