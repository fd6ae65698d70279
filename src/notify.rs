//! Notification callouts for job and endpoint transitions.
//!
//! Payloads are plain UTF-8 text with stable prefixes. Delivery is
//! fire-and-forget: a send failure is logged and never affects job state.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::storage::models::ScrapeJob;
use crate::storage::Store;

/// Payload for a completed first-attempt scrape.
pub fn scrape_complete(job: &ScrapeJob, results: u32) -> String {
    format!(
        "SCRAPE COMPLETE {} {} {}",
        job.short_id(),
        job.event_url,
        results
    )
}

/// Payload for a failed attempt that will be retried (or reviewed).
pub fn scrape_failed(job: &ScrapeJob, error: &str) -> String {
    format!(
        "SCRAPE FAILED {} {} {} {}",
        job.short_id(),
        job.event_url,
        job.retry_count,
        error
    )
}

/// Payload for a scrape that succeeded after at least one retry.
pub fn scrape_retry_success(job: &ScrapeJob, results: u32) -> String {
    format!(
        "SCRAPE RETRY SUCCESS {} {} {}",
        job.short_id(),
        job.event_url,
        results
    )
}

/// Payload for a job that exhausted its retries.
pub fn scrape_permanently_failed(job: &ScrapeJob) -> String {
    format!(
        "SCRAPE PERMANENTLY FAILED {} {} {}",
        job.short_id(),
        job.event_url,
        job.retry_count
    )
}

/// Payload for an endpoint liveness edge.
pub fn endpoint_edge(name: &str, url: &str, went_up: bool) -> String {
    let token = if went_up { "UP" } else { "DOWN" };
    format!("ENDPOINT {} {} {}", token, name, url)
}

/// Fire-and-forget notification sender.
pub struct Notifier {
    enabled: bool,
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(enabled: bool, webhook_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build notifier client");
        Self {
            enabled,
            webhook_url,
            client,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, None)
    }

    /// Dispatch a payload without waiting for the outcome.
    pub fn send(self: &Arc<Self>, text: String) {
        if !self.enabled {
            debug!("notifier disabled, dropping: {}", text);
            return;
        }
        let Some(url) = self.webhook_url.clone() else {
            debug!("notifier has no webhook target, dropping: {}", text);
            return;
        };

        let client = self.client.clone();
        tokio::spawn(async move {
            let body = serde_json::json!({ "text": text });
            match client.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => warn!("notifier got HTTP {}", response.status()),
                Err(e) => warn!("notifier delivery failed: {}", e),
            }
        });
    }

    /// Send a payload about a job and record the flag on the row.
    /// Persistence errors are logged; the job itself is never touched
    /// beyond the flag.
    pub fn send_for_job(self: &Arc<Self>, store: &Store, job: &ScrapeJob, text: String) {
        self.send(text);
        if let Err(e) = store.set_notification_sent(&job.id) {
            warn!("failed to record notification flag for {}: {}", job.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::JobStatus;
    use chrono::Utc;

    fn job() -> ScrapeJob {
        ScrapeJob {
            id: "6f9619ff-8b86-d011-b42d-00c04fc964ff".to_string(),
            organiser: Some("hopasports".to_string()),
            event_url: "https://results.hopasports.com/events/spring".to_string(),
            status: JobStatus::Failed,
            results_count: None,
            error_message: None,
            retry_count: 2,
            max_retries: 3,
            next_retry_at: None,
            notification_sent: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_payload_prefixes() {
        let j = job();
        assert!(scrape_complete(&j, 500).starts_with("SCRAPE COMPLETE 6f9619ff"));
        assert!(scrape_failed(&j, "timeout").starts_with("SCRAPE FAILED 6f9619ff"));
        assert!(scrape_retry_success(&j, 500).starts_with("SCRAPE RETRY SUCCESS 6f9619ff"));
        assert!(scrape_permanently_failed(&j).starts_with("SCRAPE PERMANENTLY FAILED 6f9619ff"));
    }

    #[test]
    fn test_payload_carries_url_and_counter() {
        let j = job();
        let text = scrape_complete(&j, 1234);
        assert!(text.contains(&j.event_url));
        assert!(text.ends_with("1234"));

        let edge = endpoint_edge("portal", "https://x.test", true);
        assert_eq!(edge, "ENDPOINT UP portal https://x.test");
    }
}
