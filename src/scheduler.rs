//! Periodic drivers for the monitor pass and the retry drain.
//!
//! Each job runs in its own task on a fixed tick and is a singleton: the
//! next tick waits for the previous pass to finish. Both may overlap with
//! scrape ingestion.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

use crate::ingest::Pipeline;
use crate::monitor::{self, MonitorEdge};
use crate::notify;
use crate::queue;

/// Tick for both driver loops.
const TICK: Duration = Duration::from_secs(60);

/// Handles for the background driver tasks.
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start the drivers. The monitor loop runs only when enabled; the
    /// retry drain always runs.
    pub fn start(pipeline: Arc<Pipeline>, monitor_enabled: bool) -> Self {
        let mut handles = Vec::new();

        if monitor_enabled {
            let p = pipeline.clone();
            handles.push(tokio::spawn(async move {
                let fetcher = monitor::probe_fetcher();
                let mut tick = interval(TICK);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    match monitor::run_monitor_pass(&p.store, &fetcher).await {
                        Ok(edges) => notify_edges(&p, &edges),
                        Err(e) => warn!("monitor pass failed: {}", e),
                    }
                }
            }));
        }

        {
            let p = pipeline.clone();
            handles.push(tokio::spawn(async move {
                let mut tick = interval(TICK);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    match queue::drain(&p).await {
                        Ok(0) => {}
                        Ok(n) => info!("retry drain processed {} job(s)", n),
                        Err(e) => warn!("retry drain failed: {}", e),
                    }
                }
            }));
        }

        Self { handles }
    }

    /// Stop the driver tasks.
    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn notify_edges(pipeline: &Pipeline, edges: &[MonitorEdge]) {
    for edge in edges {
        let text = match edge {
            MonitorEdge::WentUp { name, url, .. } => notify::endpoint_edge(name, url, true),
            MonitorEdge::WentDown { name, url, .. } => notify::endpoint_edge(name, url, false),
        };
        pipeline.notifier.send(text);
    }
}
