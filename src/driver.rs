//! Backend driver contract
//!
//! A driver owns the mechanics of running one backend instance per identifier.
//! The broker only relies on the operations below; any implementation
//! (container runtime, native process supervisor, VM pool) is substitutable.

use crate::config::{DriverConfig, DriverType};
use crate::docker::DockerDriver;
use crate::error::DriverError;
use crate::process::ProcessDriver;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Start the instance for `identifier` and report its port if it could be found.
    ///
    /// Not assumed to be idempotent; callers must avoid duplicate starts.
    async fn start(&self, identifier: &str) -> Result<Option<u16>, DriverError>;

    /// Port of the running instance, or `None` if it is not running.
    async fn query_port(&self, identifier: &str) -> Result<Option<u16>, DriverError>;

    /// Gracefully stop the running instance.
    async fn stop(&self, identifier: &str) -> Result<(), DriverError>;

    /// Build the installable image for `identifier` (administrative).
    async fn build(&self, identifier: &str) -> Result<(), DriverError>;

    /// Stop the instance and remove its image (administrative).
    async fn remove(&self, identifier: &str) -> Result<(), DriverError>;

    /// Stop every instance owned by this broker, e.g. left over from a previous run.
    async fn clear_instances(&self) -> Result<(), DriverError>;

    fn name(&self) -> &'static str;
}

pub type SharedDriver = Arc<dyn BackendDriver>;

/// Create the driver selected in the configuration
pub async fn from_config(config: &DriverConfig) -> anyhow::Result<SharedDriver> {
    let driver: SharedDriver = match config.driver_type {
        DriverType::Docker => Arc::new(DockerDriver::connect(config.clone()).await?),
        DriverType::Process => Arc::new(ProcessDriver::new(config.clone())),
    };
    Ok(driver)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type StopHook = Arc<dyn Fn(&str) + Send + Sync>;

    /// In-memory driver that records calls
    #[derive(Default)]
    pub struct MockDriver {
        running: Mutex<HashMap<String, u16>>,
        failing_starts: Mutex<HashSet<String>>,
        failing_stops: Mutex<HashSet<String>>,
        portless: Mutex<HashSet<String>>,
        start_delay: Mutex<Duration>,
        stop_delay: Mutex<Duration>,
        on_stop: Mutex<Option<StopHook>>,
        next_port: AtomicUsize,
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
        pub queries: AtomicUsize,
    }

    impl MockDriver {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                next_port: AtomicUsize::new(30000),
                ..Default::default()
            })
        }

        pub fn with_start_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
            *self.start_delay.lock() = delay;
            self
        }

        pub fn with_stop_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
            *self.stop_delay.lock() = delay;
            self
        }

        /// Run `hook` while a stop is in progress, before the instance goes away
        pub fn on_stop(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
            *self.on_stop.lock() = Some(Arc::new(hook));
        }

        pub fn set_running(&self, identifier: &str, port: u16) {
            self.running.lock().insert(identifier.to_string(), port);
        }

        pub fn is_running(&self, identifier: &str) -> bool {
            self.running.lock().contains_key(identifier)
        }

        pub fn fail_starts(&self, identifier: &str) {
            self.failing_starts.lock().insert(identifier.to_string());
        }

        pub fn fail_stops(&self, identifier: &str, fail: bool) {
            let mut failing = self.failing_stops.lock();
            if fail {
                failing.insert(identifier.to_string());
            } else {
                failing.remove(identifier);
            }
        }

        pub fn start_without_port(&self, identifier: &str) {
            self.portless.lock().insert(identifier.to_string());
        }

        pub fn start_count(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        pub fn stop_count(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }

        pub fn query_count(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendDriver for MockDriver {
        async fn start(&self, identifier: &str) -> Result<Option<u16>, DriverError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let delay = *self.start_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.failing_starts.lock().contains(identifier) {
                return Err(DriverError::Other(format!("no image for {}", identifier)));
            }
            if self.portless.lock().contains(identifier) {
                return Ok(None);
            }
            let port = self.next_port.fetch_add(1, Ordering::SeqCst) as u16;
            self.running.lock().insert(identifier.to_string(), port);
            Ok(Some(port))
        }

        async fn query_port(&self, identifier: &str) -> Result<Option<u16>, DriverError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.running.lock().get(identifier).copied())
        }

        async fn stop(&self, identifier: &str) -> Result<(), DriverError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            let delay = *self.stop_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let hook = self.on_stop.lock().clone();
            if let Some(hook) = hook {
                hook(identifier);
            }
            if self.failing_stops.lock().contains(identifier) {
                return Err(DriverError::Other("container did not exit".to_string()));
            }
            self.running.lock().remove(identifier);
            Ok(())
        }

        async fn build(&self, _identifier: &str) -> Result<(), DriverError> {
            Ok(())
        }

        async fn remove(&self, identifier: &str) -> Result<(), DriverError> {
            self.running.lock().remove(identifier);
            Ok(())
        }

        async fn clear_instances(&self) -> Result<(), DriverError> {
            self.running.lock().clear();
            Ok(())
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }
}
