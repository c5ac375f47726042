//! Identifier to backend resolution with per-identifier start serialization
//!
//! `resolve` first asks the driver whether a backend is already running. Only
//! when it is not does the caller take that identifier's own lock, query again
//! and start the backend. Distinct identifiers never share a lock, so one slow
//! start does not delay routing for any other identifier.

use crate::artifacts::ArtifactIndex;
use crate::driver::BackendDriver;
use crate::error::ResolveError;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of a successful resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Backend is running on this port
    Ready(u16),
    /// No artifact exists for the identifier
    NotProvisioned,
}

/// Last known state of an identifier's backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state")]
pub enum BackendStatus {
    /// Not running, or never seen
    Unknown,
    /// A start is in flight
    Starting,
    /// Running and reachable on `port`
    Running { port: u16 },
    /// A stop is in flight
    Stopping,
    /// No artifact exists; nothing to start
    Absent,
}

impl BackendStatus {
    pub fn port(&self) -> Option<u16> {
        match self {
            BackendStatus::Running { port } => Some(*port),
            _ => None,
        }
    }
}

/// Serialization point for one identifier
#[derive(Default)]
struct StartSlot {
    /// Failure of the most recent start attempt, if it failed
    last_failure: Mutex<Option<ResolveError>>,
    /// Number of start attempts that have finished
    attempts: AtomicU64,
}

pub struct BackendRegistry {
    driver: Arc<dyn BackendDriver>,
    artifacts: Arc<dyn ArtifactIndex>,
    slots: DashMap<String, Arc<StartSlot>>,
    statuses: DashMap<String, BackendStatus>,
}

impl BackendRegistry {
    pub fn new(driver: Arc<dyn BackendDriver>, artifacts: Arc<dyn ArtifactIndex>) -> Self {
        Self {
            driver,
            artifacts,
            slots: DashMap::new(),
            statuses: DashMap::new(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn BackendDriver> {
        &self.driver
    }

    fn slot(&self, identifier: &str) -> Arc<StartSlot> {
        self.slots
            .entry(identifier.to_string())
            .or_default()
            .clone()
    }

    fn set_status(&self, identifier: &str, status: BackendStatus) {
        match status {
            BackendStatus::Unknown => {
                self.statuses.remove(identifier);
            }
            status => {
                self.statuses.insert(identifier.to_string(), status);
            }
        }
    }

    /// Resolve an identifier to the port of a running backend, starting it if needed
    pub async fn resolve(&self, identifier: &str) -> Result<Resolution, ResolveError> {
        let provisioned = self.artifacts.exists(identifier).await.map_err(|e| {
            ResolveError::Artifact {
                identifier: identifier.to_string(),
                source: Arc::new(e),
            }
        })?;
        if !provisioned {
            // Only identifiers seen before are recorded as absent
            if let Some(mut status) = self.statuses.get_mut(identifier) {
                *status = BackendStatus::Absent;
            }
            return Ok(Resolution::NotProvisioned);
        }

        // A backend being stopped is still up; wait for the stop instead of using it
        if self.status(identifier) != BackendStatus::Stopping {
            if let Some(port) = self.query(identifier).await? {
                debug!(identifier, port, "Found existing backend");
                self.set_status(identifier, BackendStatus::Running { port });
                return Ok(Resolution::Ready(port));
            }
        }

        let slot = self.slot(identifier);
        let seen_attempts = slot.attempts.load(Ordering::SeqCst);
        let mut last_failure = slot.last_failure.lock().await;

        // Another caller may have started it while we waited for the lock
        if let Some(port) = self.query(identifier).await? {
            debug!(identifier, port, "Backend started by a concurrent request");
            self.set_status(identifier, BackendStatus::Running { port });
            return Ok(Resolution::Ready(port));
        }

        // The attempt we waited on failed; report it instead of starting again
        if slot.attempts.load(Ordering::SeqCst) != seen_attempts {
            if let Some(err) = last_failure.as_ref() {
                return Err(err.clone());
            }
        }

        self.set_status(identifier, BackendStatus::Starting);
        info!(identifier, driver = self.driver.name(), "Starting backend");

        let result = match self.driver.start(identifier).await {
            Ok(Some(port)) if port > 0 => Ok(port),
            Ok(_) => Err(ResolveError::Unreachable {
                identifier: identifier.to_string(),
            }),
            Err(e) => Err(ResolveError::Start {
                identifier: identifier.to_string(),
                source: Arc::new(e),
            }),
        };
        *last_failure = result.as_ref().err().cloned();
        slot.attempts.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(port) => {
                info!(identifier, port, "Started backend");
                self.set_status(identifier, BackendStatus::Running { port });
                Ok(Resolution::Ready(port))
            }
            Err(e) => {
                self.set_status(identifier, BackendStatus::Unknown);
                Err(e)
            }
        }
    }

    async fn query(&self, identifier: &str) -> Result<Option<u16>, ResolveError> {
        self.driver
            .query_port(identifier)
            .await
            .map(|port| port.filter(|p| *p > 0))
            .map_err(|e| ResolveError::Query {
                identifier: identifier.to_string(),
                source: Arc::new(e),
            })
    }

    /// Stop the backend for an identifier.
    ///
    /// Holds the identifier's lock so a stop never overlaps a start.
    pub async fn stop(&self, identifier: &str) -> Result<(), ResolveError> {
        self.stop_if(identifier, || true).await.map(|_| ())
    }

    /// Stop the backend only if `still_wanted` holds once the identifier's lock is taken.
    ///
    /// Returns `Ok(false)` without calling the driver when the check fails.
    pub async fn stop_if<F>(&self, identifier: &str, still_wanted: F) -> Result<bool, ResolveError>
    where
        F: FnOnce() -> bool,
    {
        let slot = self.slot(identifier);
        let _guard = slot.last_failure.lock().await;

        if !still_wanted() {
            debug!(identifier, "Stop skipped, backend is wanted again");
            return Ok(false);
        }

        let previous = self.status(identifier);
        self.set_status(identifier, BackendStatus::Stopping);

        match self.driver.stop(identifier).await {
            Ok(()) => {
                info!(identifier, "Stopped backend");
                self.set_status(identifier, BackendStatus::Unknown);
                Ok(true)
            }
            Err(e) => {
                warn!(identifier, error = %e, "Failed to stop backend");
                self.set_status(identifier, previous);
                Err(ResolveError::Stop {
                    identifier: identifier.to_string(),
                    source: Arc::new(e),
                })
            }
        }
    }

    /// Last known status of an identifier
    pub fn status(&self, identifier: &str) -> BackendStatus {
        self.statuses
            .get(identifier)
            .map(|s| *s)
            .unwrap_or(BackendStatus::Unknown)
    }

    /// Last known status of every identifier seen so far, sorted
    pub fn statuses(&self) -> Vec<(String, BackendStatus)> {
        let mut statuses: Vec<(String, BackendStatus)> = self
            .statuses
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }
}
