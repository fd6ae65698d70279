//! Persistent retry queue for failed scrape jobs.
//!
//! A failed job with retries left is parked as `failed` with a
//! `next_retry_at` in the future; that pair is the queue predicate. The
//! drainer claims due jobs one at a time through a conditional update, so
//! concurrent drainers never pick the same job.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::ingest::Pipeline;
use crate::notify::{self, Notifier};
use crate::scraper::ProgressSender;
use crate::storage::models::ScrapeJob;
use crate::storage::Store;

/// Backoff schedule in wall-clock minutes.
pub const BACKOFF_MINUTES: [i64; 3] = [5, 15, 45];

/// Pause between jobs in one drain pass.
const DRAIN_PAUSE: Duration = Duration::from_secs(2);

/// Next retry instant for a job about to record its failure, or `None`
/// when its retries are exhausted.
pub fn next_retry_at(job: &ScrapeJob, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if job.retry_count >= job.max_retries {
        return None;
    }
    let idx = (job.retry_count as usize).min(BACKOFF_MINUTES.len() - 1);
    Some(now + ChronoDuration::minutes(BACKOFF_MINUTES[idx]))
}

/// Record a job failure: park it for retry or mark it permanently failed.
///
/// Notifications go out on the first failure and on permanent failure;
/// they are fire-and-forget and never change the job outcome.
pub fn handle_failure(
    store: &Store,
    notifier: &Arc<Notifier>,
    job: &ScrapeJob,
    error: &str,
) -> Result<()> {
    let now = Utc::now();
    match next_retry_at(job, now) {
        Some(at) => {
            store.mark_job_failed(&job.id, error, Some(at))?;
            info!(
                "job {} failed (retry {}/{}), next attempt at {}",
                job.short_id(),
                job.retry_count,
                job.max_retries,
                at
            );
            if job.retry_count == 0 {
                notifier.send_for_job(store, job, notify::scrape_failed(job, error));
            }
        }
        None => {
            store.mark_job_failed(&job.id, error, None)?;
            warn!(
                "job {} permanently failed after {} retries",
                job.short_id(),
                job.retry_count
            );
            notifier.send_for_job(store, job, notify::scrape_permanently_failed(job));
        }
    }
    Ok(())
}

/// Drain due jobs sequentially, oldest `next_retry_at` first.
///
/// Each job is claimed through the conditional update before running; a
/// claim that loses the race is skipped. The pass pauses briefly between
/// jobs so retries do not hammer the source.
pub async fn drain(pipeline: &Pipeline) -> Result<u32> {
    let due = pipeline.store.due_jobs(Utc::now())?;
    if due.is_empty() {
        return Ok(0);
    }
    info!("retry drain: {} job(s) due", due.len());

    let mut processed = 0;
    for job in due {
        if !pipeline.store.claim_job(&job.id, Utc::now())? {
            continue;
        }
        // The claim bumped the retry counter; run with fresh state
        let Some(claimed) = pipeline.store.get_job(&job.id)? else {
            continue;
        };

        pipeline.run_job(&claimed, &ProgressSender::discard()).await?;
        processed += 1;

        tokio::time::sleep(DRAIN_PAUSE).await;
    }
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::JobStatus;

    fn job_with_retries(retry_count: u32, max_retries: u32) -> ScrapeJob {
        ScrapeJob {
            id: "6f9619ff-8b86-d011-b42d-00c04fc964ff".to_string(),
            organiser: None,
            event_url: "https://results.hopasports.com/e/1".to_string(),
            status: JobStatus::Running,
            results_count: None,
            error_message: None,
            retry_count,
            max_retries,
            next_retry_at: None,
            notification_sent: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let now = Utc::now();
        let at = |r| next_retry_at(&job_with_retries(r, 3), now);

        assert_eq!(at(0), Some(now + ChronoDuration::minutes(5)));
        assert_eq!(at(1), Some(now + ChronoDuration::minutes(15)));
        assert_eq!(at(2), Some(now + ChronoDuration::minutes(45)));
        assert_eq!(at(3), None);
        assert_eq!(at(7), None);
    }

    #[test]
    fn test_next_retry_strictly_future() {
        let now = Utc::now();
        let at = next_retry_at(&job_with_retries(0, 3), now).unwrap();
        assert!(at > now);
    }

    #[test]
    fn test_handle_failure_parks_then_exhausts() {
        let store = Store::in_memory().unwrap();
        let notifier = Arc::new(Notifier::disabled());
        let created = store
            .create_job(None, "https://results.hopasports.com/e/1", 3)
            .unwrap();

        // First failure: parked with a retry slot
        handle_failure(&store, &notifier, &created, "transport: timed out").unwrap();
        let stored = store.get_job(&created.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.next_retry_at.unwrap() > Utc::now());

        // Exhausted: parked permanently
        let mut exhausted = created.clone();
        exhausted.retry_count = 3;
        handle_failure(&store, &notifier, &exhausted, "still broken").unwrap();
        let stored = store.get_job(&created.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.next_retry_at.is_none());
    }
}
