//! Last-activity bookkeeping per identifier

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Records when each identifier last served a routed client.
///
/// All operations take the lock briefly and never perform I/O while holding it.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the last activity of `identifier` to now
    pub fn touch(&self, identifier: &str) {
        self.touch_at(identifier, Instant::now());
    }

    /// Record activity at `at`. An older instant never replaces a newer one.
    pub fn touch_at(&self, identifier: &str, at: Instant) {
        let mut last_seen = self.last_seen.lock();
        match last_seen.get_mut(identifier) {
            Some(existing) if *existing >= at => {}
            Some(existing) => *existing = at,
            None => {
                last_seen.insert(identifier.to_string(), at);
            }
        }
    }

    /// Identifiers idle for longer than `threshold`, sorted
    pub fn snapshot_stale(&self, threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut stale: Vec<String> = self
            .last_seen
            .lock()
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > threshold)
            .map(|(identifier, _)| identifier.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Remove bookkeeping for `identifier`; returns whether it was tracked
    pub fn forget(&self, identifier: &str) -> bool {
        self.last_seen.lock().remove(identifier).is_some()
    }

    /// Forget `identifier` only if it saw no activity after `seen`.
    ///
    /// Returns false when a newer touch arrived, which keeps the entry.
    pub fn forget_if_idle_since(&self, identifier: &str, seen: Instant) -> bool {
        let mut last_seen = self.last_seen.lock();
        match last_seen.get(identifier) {
            Some(current) if *current <= seen => {
                last_seen.remove(identifier);
                true
            }
            _ => false,
        }
    }

    pub fn last_activity(&self, identifier: &str) -> Option<Instant> {
        self.last_seen.lock().get(identifier).copied()
    }

    pub fn idle_for(&self, identifier: &str) -> Option<Duration> {
        self.last_activity(identifier)
            .map(|seen| Instant::now().saturating_duration_since(seen))
    }

    /// All tracked identifiers with their idle time
    pub fn entries(&self) -> Vec<(String, Duration)> {
        let now = Instant::now();
        let mut entries: Vec<(String, Duration)> = self
            .last_seen
            .lock()
            .iter()
            .map(|(identifier, seen)| (identifier.clone(), now.saturating_duration_since(*seen)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.last_seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.lock().is_empty()
    }
}
