//! Periodic eviction of idle backends

use crate::activity::ActivityTracker;
use crate::registry::BackendRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Identifiers stopped and forgotten
    pub stopped: Vec<String>,
    /// Identifiers whose stop failed; kept for the next sweep
    pub failed: Vec<String>,
    /// Identifiers that saw activity again before their stop began
    pub skipped: Vec<String>,
}

pub struct Reaper {
    registry: Arc<BackendRegistry>,
    tracker: Arc<ActivityTracker>,
    window: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        registry: Arc<BackendRegistry>,
        tracker: Arc<ActivityTracker>,
        window: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            tracker,
            window,
            interval,
        }
    }

    /// Stop every backend idle for longer than the inactivity window.
    ///
    /// Idleness is checked again under the identifier's lock, and a touch
    /// that lands while the stop runs keeps the identifier tracked.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for identifier in self.tracker.snapshot_stale(self.window) {
            let Some(seen) = self.tracker.last_activity(&identifier) else {
                continue;
            };
            let tracker = &self.tracker;
            let window = self.window;
            let still_idle = || {
                tracker.last_activity(&identifier) == Some(seen)
                    && tracker.idle_for(&identifier).is_some_and(|idle| idle > window)
            };

            info!(
                identifier = %identifier,
                idle_secs = self.tracker.idle_for(&identifier).map(|d| d.as_secs()),
                "Stopping inactive backend"
            );
            match self.registry.stop_if(&identifier, still_idle).await {
                Ok(true) => {
                    if !self.tracker.forget_if_idle_since(&identifier, seen) {
                        debug!(identifier = %identifier, "Backend was used during its stop; still tracked");
                    }
                    report.stopped.push(identifier);
                }
                Ok(false) => {
                    debug!(identifier = %identifier, "Backend became active again; not stopped");
                    report.skipped.push(identifier);
                }
                Err(e) => {
                    // Left in the tracker so the next sweep retries it
                    warn!(identifier = %identifier, error = %e, "Failed to stop inactive backend");
                    report.failed.push(identifier);
                }
            }
        }

        report
    }

    /// Sweep every interval until shutdown is signalled.
    ///
    /// A sweep in progress always completes before shutdown is observed.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            window_secs = self.window.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Reaper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let report = self.sweep().await;
                    debug!(
                        stopped = report.stopped.len(),
                        failed = report.failed.len(),
                        tracked = self.tracker.len(),
                        "Reaper sweep finished"
                    );
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reaper stopped");
    }
}
