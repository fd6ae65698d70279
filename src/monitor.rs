//! Endpoint liveness monitoring.
//!
//! Probes each enabled endpoint, persists the outcome (history append plus
//! current-row upsert) and reports edge transitions. An endpoint whose page
//! embeds a race API configuration is additionally checked against the
//! first race's API URL; one with no configuration is up with no results.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::fetch::{FetchError, Fetcher};
use crate::scraper::hopasports::{extract_race_config, race_api_url};
use crate::storage::models::{EndpointProbe, EndpointStatus, MonitoredEndpoint};
use crate::storage::Store;

/// Probe timeout.
pub const PROBE_TIMEOUT_SECS: u64 = 30;

/// Minimum body length for a results payload to count as live.
const MIN_LIVE_BODY_LEN: usize = 100;

/// A status edge observed by a monitor pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEdge {
    WentUp { endpoint_id: String, name: String, url: String },
    WentDown { endpoint_id: String, name: String, url: String },
}

/// Raw outcome of probing one URL, before persistence.
#[derive(Debug)]
struct ProbeOutcome {
    status: EndpointStatus,
    http_code: Option<u16>,
    has_results: bool,
    error_message: Option<String>,
}

/// A results body is live when it is substantive and free of the literal
/// `error` token, or any JSON object.
fn body_is_live(body: &str) -> bool {
    if serde_json::from_str::<serde_json::Value>(body)
        .map(|v| v.is_object())
        .unwrap_or(false)
    {
        return true;
    }
    body.len() > MIN_LIVE_BODY_LEN && !body.contains("error")
}

async fn probe_url(fetcher: &Fetcher, url: &str) -> ProbeOutcome {
    match fetcher.get(url).await {
        Ok(page) => {
            // Follow the embedded configuration to the first race, if any
            let Some(config) = extract_race_config(&page.body) else {
                return ProbeOutcome {
                    status: EndpointStatus::Up,
                    http_code: Some(page.status),
                    has_results: false,
                    error_message: None,
                };
            };

            let api_url = race_api_url(&config, &config.races[0]);
            match fetcher.get(&api_url).await {
                Ok(api_page) if body_is_live(&api_page.body) => ProbeOutcome {
                    status: EndpointStatus::Up,
                    http_code: Some(api_page.status),
                    has_results: true,
                    error_message: None,
                },
                Ok(api_page) => ProbeOutcome {
                    status: EndpointStatus::Down,
                    http_code: Some(api_page.status),
                    has_results: false,
                    error_message: Some("race API returned an empty or error body".to_string()),
                },
                Err(e) => ProbeOutcome {
                    status: EndpointStatus::Down,
                    http_code: e.status(),
                    has_results: false,
                    error_message: Some(e.to_string()),
                },
            }
        }
        Err(e @ FetchError::Status { .. }) => ProbeOutcome {
            status: EndpointStatus::Down,
            http_code: e.status(),
            has_results: false,
            error_message: Some(e.to_string()),
        },
        Err(e) => ProbeOutcome {
            status: EndpointStatus::Down,
            http_code: None,
            has_results: false,
            error_message: Some(e.to_string()),
        },
    }
}

/// Probe one endpoint and persist the outcome. Returns the edge, if the
/// status token flipped between up and down.
pub async fn check_endpoint(
    store: &Store,
    fetcher: &Fetcher,
    endpoint: &MonitoredEndpoint,
) -> anyhow::Result<Option<MonitorEdge>> {
    let started = Instant::now();
    let outcome = probe_url(fetcher, &endpoint.url).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let probe = EndpointProbe {
        endpoint_id: endpoint.id.clone(),
        status: outcome.status,
        http_code: outcome.http_code,
        response_time_ms: Some(elapsed_ms),
        has_results: outcome.has_results,
        error_message: outcome.error_message,
        checked_at: Utc::now(),
    };

    let (prior, current) = store.record_probe(&probe)?;
    debug!(
        "endpoint {} probed: {} ({} ms, failures {})",
        endpoint.name,
        current.status.as_str(),
        elapsed_ms,
        current.consecutive_failures
    );

    let edge = match (prior, current.status) {
        (Some(EndpointStatus::Down), EndpointStatus::Up) => Some(MonitorEdge::WentUp {
            endpoint_id: endpoint.id.clone(),
            name: endpoint.name.clone(),
            url: endpoint.url.clone(),
        }),
        (Some(EndpointStatus::Up), EndpointStatus::Down) => Some(MonitorEdge::WentDown {
            endpoint_id: endpoint.id.clone(),
            name: endpoint.name.clone(),
            url: endpoint.url.clone(),
        }),
        _ => None,
    };

    if let Some(edge) = &edge {
        info!("endpoint edge: {:?}", edge);
    }
    Ok(edge)
}

/// True when the endpoint's interval has elapsed since its last check.
fn is_due(
    endpoint: &MonitoredEndpoint,
    last_checked: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match last_checked {
        None => true,
        Some(last) => {
            last + ChronoDuration::minutes(endpoint.check_interval_minutes as i64) <= now
        }
    }
}

/// Run one monitor pass over all enabled endpoints that are due.
pub async fn run_monitor_pass(store: &Store, fetcher: &Fetcher) -> anyhow::Result<Vec<MonitorEdge>> {
    let now = Utc::now();
    let mut edges = Vec::new();

    for endpoint in store.enabled_endpoints()? {
        let last_checked = store
            .current_status(&endpoint.id)?
            .and_then(|c| c.last_checked);
        if !is_due(&endpoint, last_checked, now) {
            continue;
        }

        match check_endpoint(store, fetcher, &endpoint).await {
            Ok(Some(edge)) => edges.push(edge),
            Ok(None) => {}
            Err(e) => warn!("endpoint {} check failed: {}", endpoint.name, e),
        }
    }

    Ok(edges)
}

/// Fetcher configured for monitor probes.
pub fn probe_fetcher() -> Fetcher {
    Fetcher::with_timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
}
