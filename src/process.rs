//! Native process driver: one child process per identifier on a free local port

use crate::config::{DriverConfig, PortProtocol};
use crate::driver::BackendDriver;
use crate::error::DriverError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// A spawned backend and the port it was given
struct RunningProcess {
    child: Child,
    port: u16,
}

pub struct ProcessDriver {
    config: DriverConfig,
    processes: DashMap<String, Mutex<RunningProcess>>,
}

impl ProcessDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            processes: DashMap::new(),
        }
    }

    /// Program and arguments; a bare `command` string is split shell-style
    fn program(&self) -> Result<(String, Vec<String>), DriverError> {
        let command = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| DriverError::Other("process driver requires 'command'".to_string()))?;

        let mut words = shell_words::split(command)
            .map_err(|e| DriverError::Other(format!("invalid command '{}': {}", command, e)))?;
        if words.is_empty() {
            return Err(DriverError::Other("process driver requires 'command'".to_string()));
        }
        let program = words.remove(0);
        words.extend(self.config.args.iter().cloned());
        Ok((program, words))
    }

    /// Stop a child: SIGINT, then SIGKILL after the grace period
    async fn stop_child(
        &self,
        identifier: &str,
        child: &mut Child,
        grace_period: Duration,
    ) -> std::io::Result<()> {
        if let Some(pid) = child.id() {
            info!(identifier, pid, "Sending SIGINT to backend");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(identifier, ?status, "Backend process exited gracefully");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(identifier, error = %e, "Error waiting for backend to exit, sending SIGKILL");
                force_kill(child).await
            }
            Err(_) => {
                warn!(
                    identifier,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                force_kill(child).await
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.processes.len()
    }
}

/// SIGKILL the child and reap it
async fn force_kill(child: &mut Child) -> std::io::Result<()> {
    child.kill().await
}

/// Ask the OS for a port that is currently free
fn free_port(protocol: PortProtocol) -> std::io::Result<u16> {
    match protocol {
        PortProtocol::Tcp => std::net::TcpListener::bind("127.0.0.1:0")?.local_addr().map(|a| a.port()),
        PortProtocol::Udp => std::net::UdpSocket::bind("127.0.0.1:0")?.local_addr().map(|a| a.port()),
    }
}

#[async_trait]
impl BackendDriver for ProcessDriver {
    async fn start(&self, identifier: &str) -> Result<Option<u16>, DriverError> {
        let (program, args) = self.program()?;
        let port = free_port(self.config.protocol)?;

        info!(identifier, command = %program, port, "Starting local backend");

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        if let Some(dir) = self.config.working_dir_for(identifier) {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        cmd.env("PORT", port.to_string());
        cmd.env("BACKEND_ID", identifier);

        let child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        info!(identifier, pid, port, "Backend process spawned");

        self.processes
            .insert(identifier.to_string(), Mutex::new(RunningProcess { child, port }));
        Ok(Some(port))
    }

    async fn query_port(&self, identifier: &str) -> Result<Option<u16>, DriverError> {
        let exited = match self.processes.get(identifier) {
            None => return Ok(None),
            Some(entry) => {
                let mut process = entry.lock();
                match process.child.try_wait()? {
                    None => return Ok(Some(process.port)),
                    Some(status) => status,
                }
            }
        };

        debug!(identifier, status = ?exited, "Backend process has exited");
        self.processes.remove(identifier);
        Ok(None)
    }

    async fn stop(&self, identifier: &str) -> Result<(), DriverError> {
        let Some((_, process)) = self.processes.remove(identifier) else {
            debug!(identifier, "No backend process to stop");
            return Ok(());
        };
        let mut process = process.into_inner();
        if let Err(e) = self
            .stop_child(identifier, &mut process.child, self.config.shutdown_grace_period())
            .await
        {
            warn!(identifier, error = %e, "Failed to kill backend process");
            // Still tracked so a later stop can try again
            self.processes.insert(identifier.to_string(), Mutex::new(process));
            return Err(DriverError::Io(e));
        }
        Ok(())
    }

    async fn build(&self, _identifier: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("build"))
    }

    async fn remove(&self, _identifier: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("remove"))
    }

    async fn clear_instances(&self) -> Result<(), DriverError> {
        let identifiers: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        for identifier in identifiers {
            self.stop(&identifier).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sleep_driver(seconds: &str) -> ProcessDriver {
        let mut config = DriverConfig::process("sleep").with_args(vec![seconds.to_string()]);
        config.shutdown_grace_period_secs = 1;
        ProcessDriver::new(config)
    }

    #[test]
    fn test_program_splits_command() {
        let mut config = DriverConfig::process("java -Xmx1G");
        config.args = vec!["-jar".to_string(), "server.jar".to_string()];
        let driver = ProcessDriver::new(config);

        let (program, args) = driver.program().unwrap();
        assert_eq!(program, "java");
        assert_eq!(args, vec!["-Xmx1G", "-jar", "server.jar"]);
    }

    #[tokio::test]
    async fn test_start_query_and_stop() {
        let driver = sleep_driver("60");

        assert_eq!(driver.query_port("42").await.unwrap(), None);

        let port = driver.start("42").await.unwrap().expect("port assigned");
        assert!(port > 0);
        assert_eq!(driver.query_port("42").await.unwrap(), Some(port));
        assert_eq!(driver.running_count(), 1);

        driver.stop("42").await.unwrap();
        assert_eq!(driver.query_port("42").await.unwrap(), None);
        assert_eq!(driver.running_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_kills_process_ignoring_sigint() {
        let mut config = DriverConfig::process("sh").with_args(vec![
            "-c".to_string(),
            "trap '' INT; exec sleep 60".to_string(),
        ]);
        config.shutdown_grace_period_secs = 1;
        let driver = ProcessDriver::new(config);

        driver.start("42").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        driver.stop("42").await.unwrap();
        assert_eq!(driver.running_count(), 0);
        assert_eq!(driver.query_port("42").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_kill_is_reported() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();

        // Killing a reaped child fails; the error must reach the caller
        assert!(force_kill(&mut child).await.is_err());
    }

    #[tokio::test]
    async fn test_exited_process_is_not_running() {
        let driver = sleep_driver("0");
        driver.start("42").await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(driver.query_port("42").await.unwrap(), None);
        assert_eq!(driver.running_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_command_fails_to_start() {
        let driver = ProcessDriver::new(DriverConfig::process("/nonexistent/backend-binary"));
        assert!(matches!(driver.start("42").await, Err(DriverError::Io(_))));
        assert_eq!(driver.running_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_instances_stops_everything() {
        let driver = sleep_driver("60");
        driver.start("1").await.unwrap();
        driver.start("2").await.unwrap();

        driver.clear_instances().await.unwrap();
        assert_eq!(driver.running_count(), 0);
    }

    #[tokio::test]
    async fn test_build_is_unsupported() {
        let driver = sleep_driver("60");
        assert!(matches!(
            driver.build("42").await,
            Err(DriverError::Unsupported("build"))
        ));
    }
}
