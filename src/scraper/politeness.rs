//! Request pacing between page fetches of one organiser.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Enforces a minimum gap between successive page requests.
pub struct Politeness {
    state: Arc<Mutex<Option<Instant>>>,
    min_gap: Duration,
}

impl Politeness {
    /// Create a pacer with the given minimum gap in milliseconds.
    pub fn new(min_gap_ms: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
            min_gap: Duration::from_millis(min_gap_ms),
        }
    }

    /// Wait until the next request is allowed, then record it.
    pub async fn pace(&self) {
        let wait = {
            let mut last = self.state.lock().await;
            let now = Instant::now();
            let wait = match *last {
                Some(prev) => {
                    let elapsed = now.duration_since(prev);
                    self.min_gap.checked_sub(elapsed).unwrap_or_default()
                }
                None => Duration::ZERO,
            };
            *last = Some(now + wait);
            wait
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_request_immediate() {
        let pacer = Politeness::new(500);
        let start = Instant::now();
        pacer.pace().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_enforced() {
        let pacer = Politeness::new(500);
        let start = Instant::now();
        pacer.pace().await;
        pacer.pace().await;
        pacer.pace().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }
}
