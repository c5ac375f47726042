use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the broker
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and admin settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Address routing table
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Idle backend eviction
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Backend driver selection and settings
    #[serde(default)]
    pub driver: DriverConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port clients connect to (default: 19132)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port for the local admin status API (set to 0 to disable)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Host placed in every redirect sent to clients
    #[serde(default = "default_redirect_host")]
    pub redirect_host: String,
}

impl ServerConfig {
    /// Whether the admin API should be served; port 0 turns it off
    pub fn admin_enabled(&self) -> bool {
        self.admin_port != 0
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
            redirect_host: default_redirect_host(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    /// Domain suffix for dynamic `<digits>.<domain>` addresses
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Hostnames that always redirect to a static port
    #[serde(default)]
    pub fixed: HashMap<String, u16>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            fixed: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaperConfig {
    /// Inactivity window in seconds before a backend is stopped
    #[serde(default = "default_inactivity_window")]
    pub inactivity_window_secs: u64,

    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            inactivity_window_secs: default_inactivity_window(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl ReaperConfig {
    pub fn inactivity_window(&self) -> Duration {
        Duration::from_secs(self.inactivity_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Driver type: Docker containers or local processes
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    /// Docker container managed via Docker API (default)
    #[default]
    Docker,
    /// Local process spawned directly
    Process,
}

impl DriverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverType::Docker => "docker",
            DriverType::Process => "process",
        }
    }
}

/// Transport protocol of the backend's published port
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    #[default]
    Udp,
    Tcp,
}

impl PortProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortProtocol::Udp => "udp",
            PortProtocol::Tcp => "tcp",
        }
    }
}

/// Configuration for the backend driver
///
/// # Security Warning
///
/// For the process driver, `command` and `args` allow arbitrary command execution.
/// Configuration files must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct DriverConfig {
    /// Driver type: "docker" (default) or "process"
    #[serde(default, rename = "type")]
    pub driver_type: DriverType,

    /// Directory holding one artifact entry per identifier
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,

    /// Prefix for artifact entries, images and container names
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Stop instances left over from a previous run at startup
    #[serde(default = "default_true")]
    pub clear_on_startup: bool,

    // === Docker-specific fields ===
    /// Docker host URL (default: DOCKER_HOST or the platform socket)
    pub docker_host: Option<String>,

    /// Container label carrying the identifier
    #[serde(default = "default_label")]
    pub label: String,

    /// Port the backend listens on inside the container
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// Protocol of the container port: "udp" (default) or "tcp"
    #[serde(default)]
    pub protocol: PortProtocol,

    /// Build context passed to `docker build`
    #[serde(default = "default_build_context")]
    pub build_context: String,

    /// Signal sent to stop a container
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    // === Process-specific fields ===
    /// Command to execute to start a backend (process only)
    pub command: Option<String>,

    /// Arguments to pass to the command (process only)
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory; `{id}` is replaced with the identifier
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Grace period in seconds between SIGINT and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_type: DriverType::default(),
            artifact_dir: default_artifact_dir(),
            name_prefix: default_name_prefix(),
            clear_on_startup: true,
            docker_host: None,
            label: default_label(),
            container_port: default_container_port(),
            protocol: PortProtocol::default(),
            build_context: default_build_context(),
            stop_signal: default_stop_signal(),
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl DriverConfig {
    /// Create a process driver config with defaults
    pub fn process(command: &str) -> Self {
        Self {
            driver_type: DriverType::Process,
            command: Some(command.to_string()),
            ..Self::default()
        }
    }

    /// Set arguments for this driver config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the artifact directory (builder pattern)
    pub fn with_artifact_dir(mut self, dir: impl Into<String>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    /// Name of the artifact entry, image and container for an identifier
    pub fn instance_name(&self, identifier: &str) -> String {
        format!("{}{}", self.name_prefix, identifier)
    }

    /// Path of the artifact entry for an identifier
    pub fn artifact_path(&self, identifier: &str) -> PathBuf {
        Path::new(&self.artifact_dir).join(self.instance_name(identifier))
    }

    pub fn working_dir_for(&self, identifier: &str) -> Option<PathBuf> {
        self.working_dir
            .as_ref()
            .map(|dir| PathBuf::from(dir.replace("{id}", identifier)))
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Validate the driver configuration
    pub fn validate(&self) -> Result<(), String> {
        match self.driver_type {
            DriverType::Docker => {
                if self.container_port == 0 {
                    return Err("driver: 'container_port' must be greater than 0".to_string());
                }
                if self.label.is_empty() {
                    return Err("driver: 'label' must not be empty".to_string());
                }
            }
            DriverType::Process => {
                if self.command.as_deref().map_or(true, str::is_empty) {
                    return Err("driver: process driver requires 'command' field".to_string());
                }
            }
        }

        if self.name_prefix.is_empty() {
            return Err("driver: 'name_prefix' must not be empty".to_string());
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    19132
}

fn default_admin_port() -> u16 {
    9999
}

fn default_redirect_host() -> String {
    "localhost".to_string()
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_inactivity_window() -> u64 {
    3600 // 1 hour
}

fn default_sweep_interval() -> u64 {
    300 // 5 minutes
}

fn default_artifact_dir() -> String {
    ".".to_string()
}

fn default_name_prefix() -> String {
    "pr-".to_string()
}

fn default_true() -> bool {
    true
}

fn default_label() -> String {
    "pr".to_string()
}

fn default_container_port() -> u16 {
    19132
}

fn default_build_context() -> String {
    ".".to_string()
}

fn default_stop_signal() -> String {
    "SIGINT".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.routing.domain.trim().is_empty() {
            errors.push("routing: 'domain' must not be empty".to_string());
        }
        if self.server.redirect_host.trim().is_empty() {
            errors.push("server: 'redirect_host' must not be empty".to_string());
        }
        for (hostname, port) in &self.routing.fixed {
            if *port == 0 {
                errors.push(format!(
                    "routing: fixed host '{}' must have a port greater than 0",
                    hostname
                ));
            }
        }
        if self.reaper.inactivity_window_secs == 0 {
            errors.push("reaper: 'inactivity_window_secs' must be greater than 0".to_string());
        }
        if self.reaper.sweep_interval_secs == 0 {
            errors.push("reaper: 'sweep_interval_secs' must be greater than 0".to_string());
        }
        if let Err(e) = self.driver.validate() {
            errors.push(e);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 19132
bind = "127.0.0.1"
admin_port = 9000
redirect_host = "df-mc.dev"

[routing]
domain = "df-mc.dev"

[routing.fixed]
"df-mc.dev" = 19133
"plots.df-mc.dev" = 19134

[reaper]
inactivity_window_secs = 1800
sweep_interval_secs = 60

[driver]
type = "docker"
artifact_dir = "/srv/prs"
container_port = 19132
protocol = "udp"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 19132);
        assert_eq!(config.server.admin_port, 9000);
        assert_eq!(config.server.redirect_host, "df-mc.dev");
        assert_eq!(config.routing.fixed.len(), 2);
        assert_eq!(config.routing.fixed.get("plots.df-mc.dev"), Some(&19134));
        assert_eq!(config.reaper.inactivity_window(), Duration::from_secs(1800));
        assert_eq!(config.reaper.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.driver.driver_type, DriverType::Docker);
        assert_eq!(config.driver.artifact_dir, "/srv/prs");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_admin_port_zero_disables_admin_api() {
        let config: Config = toml::from_str("[server]\nadmin_port = 0\n").unwrap();
        assert!(!config.server.admin_enabled());
        assert!(config.validate().is_ok());

        let config: Config = toml::from_str("").unwrap();
        assert!(config.server.admin_enabled());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 19132);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.admin_port, 9999);
        assert!(config.routing.fixed.is_empty());
        assert_eq!(config.reaper.inactivity_window_secs, 3600);
        assert_eq!(config.reaper.sweep_interval_secs, 300);
        assert_eq!(config.driver.driver_type, DriverType::Docker);
        assert_eq!(config.driver.name_prefix, "pr-");
        assert_eq!(config.driver.label, "pr");
        assert_eq!(config.driver.protocol, PortProtocol::Udp);
        assert_eq!(config.driver.stop_signal, "SIGINT");
        assert!(config.driver.clear_on_startup);
    }

    #[test]
    fn test_process_driver_config() {
        let toml = r#"
[driver]
type = "process"
command = "java"
args = ["-jar", "server.jar"]
working_dir = "/srv/pr-{id}"
shutdown_grace_period_secs = 3

[driver.env]
MODE = "preview"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let driver = &config.driver;

        assert_eq!(driver.driver_type, DriverType::Process);
        assert_eq!(driver.command, Some("java".to_string()));
        assert_eq!(driver.args, vec!["-jar", "server.jar"]);
        assert_eq!(
            driver.working_dir_for("42"),
            Some(PathBuf::from("/srv/pr-42"))
        );
        assert_eq!(driver.shutdown_grace_period(), Duration::from_secs(3));
        assert_eq!(driver.env.get("MODE"), Some(&"preview".to_string()));
    }

    #[test]
    fn test_instance_naming() {
        let driver = DriverConfig::default().with_artifact_dir("/data");

        assert_eq!(driver.instance_name("007"), "pr-007");
        assert_eq!(driver.artifact_path("007"), PathBuf::from("/data/pr-007"));
    }

    #[test]
    fn test_validate_process_requires_command() {
        let toml = r#"
[driver]
type = "process"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("process driver requires 'command' field"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[routing]
domain = ""

[routing.fixed]
"plots.example.com" = 0

[reaper]
sweep_interval_secs = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("'domain' must not be empty"));
        assert!(err.contains("fixed host 'plots.example.com'"));
        assert!(err.contains("'sweep_interval_secs' must be greater than 0"));
    }

    #[test]
    fn test_validate_docker_container_port() {
        let mut config = Config::default();
        config.driver.container_port = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'container_port' must be greater than 0"));
    }

    #[test]
    fn test_driver_config_helpers() {
        let process = DriverConfig::process("sleep").with_args(vec!["60".to_string()]);
        assert_eq!(process.driver_type, DriverType::Process);
        assert_eq!(process.command, Some("sleep".to_string()));
        assert_eq!(process.args, vec!["60"]);
        assert!(process.validate().is_ok());
        assert!(DriverConfig::default().validate().is_ok());
    }
}
