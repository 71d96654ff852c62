//! Poll scheduling: the single-flight guard and the interval loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
pub use tokio_util::sync::CancellationToken;

use crate::manager::{OutputManager, PollOutcome};

/// Admits at most one poll cycle at a time.
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flight, or `None` if a cycle is already running.
    pub fn try_acquire(&self) -> Option<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { busy: &self.busy })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the flight on drop, including when the cycle's future is dropped.
pub struct FlightGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(
                std::env::var("EASEL_POLL_INTERVAL")
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .filter(|s| *s > 0.0)
                    .map(|s| (s * 1000.0) as u64)
                    .unwrap_or(2000),
            ),
        }
    }
}

/// Poll incomplete outputs every `interval` until `shutdown` fires.
///
/// Failed cycles are logged; the next tick asks for the same ids again.
pub async fn run(manager: Arc<OutputManager>, config: PollerConfig, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(interval_ms = config.interval.as_millis(), "Poller started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match manager.poll_incomplete().await {
            Ok(PollOutcome::Reconciled(report)) => {
                tracing::debug!(
                    requested = report.requested.len(),
                    updated = report.updated,
                    conversion_failures = report.conversion_failures.len(),
                    "Poll cycle complete"
                );
            }
            Ok(PollOutcome::Idle) | Ok(PollOutcome::AlreadyRunning) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Poll cycle failed");
            }
        }
    }

    tracing::info!("Poller stopped");
}
