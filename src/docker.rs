//! Docker driver: one labelled container per identifier, published on a random host port

use crate::config::{DriverConfig, PortProtocol};
use crate::driver::BackendDriver;
use crate::error::DriverError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::RemoveImageOptions;
use bollard::models::{HostConfig, Port, PortBinding, PortTypeEnum};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct DockerDriver {
    client: Docker,
    config: DriverConfig,
}

impl DockerDriver {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. `docker_host` from the driver configuration
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(config: DriverConfig) -> anyhow::Result<Self> {
        let client = if let Some(host) = config.docker_host.as_deref() {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                     Ensure Docker is running and accessible.",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client, config })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        let mut tried_paths = Vec::new();

        for (name, path) in &socket_paths {
            if path.is_empty() || path.contains("//") {
                continue; // Skip invalid paths from empty env vars
            }
            if !std::path::Path::new(path).exists() {
                continue;
            }

            debug!(path, name, "Found Docker socket");
            match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                Ok(client) => {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                    tried_paths.push(format!("{} ({}) - socket exists but daemon not responding", path, name));
                }
                Err(e) => {
                    tried_paths.push(format!("{} ({}) - connection failed: {}", path, name, e));
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            let tried_info = if tried_paths.is_empty() {
                "No Docker socket found at common locations".to_string()
            } else {
                format!("Tried:\n  - {}", tried_paths.join("\n  - "))
            };
            anyhow::anyhow!(
                "Cannot connect to Docker daemon. {}\n\n\
                 To fix this:\n\
                 - Start Docker Desktop, Colima, or dockerd\n\
                 - Or set DOCKER_HOST environment variable\n\
                 - Or set driver.docker_host in the configuration\n\n\
                 Underlying error: {}",
                tried_info, e
            )
        })
    }

    /// `label=<label>=<id>` filter selecting this identifier's container
    fn label_filter(&self, identifier: &str) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", self.config.label, identifier)],
        );
        filters
    }

    fn port_key(&self) -> String {
        format!("{}/{}", self.config.container_port, self.config.protocol.as_str())
    }

    /// Remove a leftover container with the same name so the create does not conflict
    async fn remove_stale(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(name, Some(options)).await {
            Ok(_) => debug!(container = name, "Removed stale container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => warn!(container = name, error = %e, "Failed to remove stale container"),
        }
    }

    /// Block until the container exits; missing or already-exited containers count as stopped
    async fn wait_for_exit(&self, name: &str) -> Result<(), DriverError> {
        let mut stream = self
            .client
            .wait_container(name, None::<WaitContainerOptions<String>>);

        while let Some(result) = stream.next().await {
            match result {
                Ok(response) => {
                    debug!(container = name, status_code = response.status_code, "Container exited");
                }
                // Non-zero exit code after the stop signal
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    debug!(container = name, code, "Container exited with error code");
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Arguments for `docker build`
    fn build_args(&self, identifier: &str) -> Vec<String> {
        vec![
            "build".to_string(),
            "--build-arg".to_string(),
            format!("PR={}", identifier),
            "-t".to_string(),
            self.config.instance_name(identifier),
            self.config.build_context.clone(),
        ]
    }
}

/// Host port Docker published for `container_port/protocol`, else the first published port
fn published_port(ports: &[Port], container_port: u16, protocol: PortProtocol) -> Option<u16> {
    let wanted = match protocol {
        PortProtocol::Udp => PortTypeEnum::UDP,
        PortProtocol::Tcp => PortTypeEnum::TCP,
    };
    ports
        .iter()
        .filter(|p| p.private_port == container_port && p.typ.as_ref() == Some(&wanted))
        .find_map(|p| p.public_port)
        .or_else(|| ports.iter().find_map(|p| p.public_port))
}

#[async_trait]
impl BackendDriver for DockerDriver {
    async fn start(&self, identifier: &str) -> Result<Option<u16>, DriverError> {
        let name = self.config.instance_name(identifier);
        let artifact = tokio::fs::canonicalize(self.config.artifact_path(identifier)).await?;

        self.remove_stale(&name).await;

        let port_key = self.port_key();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some("0".to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let mut labels = HashMap::new();
        labels.insert(self.config.label.clone(), identifier.to_string());

        let host_config = HostConfig {
            auto_remove: Some(true),
            binds: Some(vec![format!("{}:/{}", artifact.display(), name)]),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(name.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await?;
        info!(identifier, container_id = %response.id, container = %name, "Created backend container");

        self.client
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await?;
        info!(identifier, container_id = %response.id, "Started backend container");

        self.query_port(identifier).await
    }

    async fn query_port(&self, identifier: &str) -> Result<Option<u16>, DriverError> {
        let options = ListContainersOptions {
            all: false,
            filters: self.label_filter(identifier),
            ..Default::default()
        };
        let containers = self.client.list_containers(Some(options)).await?;

        let port = containers.iter().find_map(|c| {
            c.ports
                .as_deref()
                .and_then(|ports| published_port(ports, self.config.container_port, self.config.protocol))
        });
        debug!(identifier, containers = containers.len(), ?port, "Queried backend container");
        Ok(port)
    }

    async fn stop(&self, identifier: &str) -> Result<(), DriverError> {
        let name = self.config.instance_name(identifier);
        let options = KillContainerOptions {
            signal: self.config.stop_signal.clone(),
        };

        match self.client.kill_container(&name, Some(options)).await {
            Ok(_) => {
                info!(identifier, signal = %self.config.stop_signal, "Signalled backend container");
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(identifier, "Container not found");
                return Ok(());
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                debug!(identifier, "Container not running");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        self.wait_for_exit(&name).await?;
        info!(identifier, "Stopped backend container");
        Ok(())
    }

    async fn build(&self, identifier: &str) -> Result<(), DriverError> {
        let args = self.build_args(identifier);
        info!(identifier, context = %self.config.build_context, "Building backend image");

        let output = Command::new("docker").args(&args).output().await?;
        if !output.status.success() {
            return Err(DriverError::CommandFailed {
                command: format!("docker {}", args.join(" ")),
                status: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        info!(identifier, image = %self.config.instance_name(identifier), "Built backend image");
        Ok(())
    }

    async fn remove(&self, identifier: &str) -> Result<(), DriverError> {
        self.stop(identifier).await?;

        let image = self.config.instance_name(identifier);
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_image(&image, Some(options), None).await {
            Ok(_) => {
                info!(identifier, image, "Removed backend image");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(identifier, image, "Image not found");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_instances(&self) -> Result<(), DriverError> {
        let containers = self
            .client
            .list_containers(None::<ListContainersOptions<String>>)
            .await?;

        for container in containers {
            let owned = container
                .image
                .as_deref()
                .is_some_and(|image| image.starts_with(&self.config.name_prefix));
            let (true, Some(id)) = (owned, container.id) else {
                continue;
            };

            match self.client.kill_container::<String>(&id, None).await {
                Ok(_) => info!(container_id = %id, image = ?container.image, "Killed leftover backend container"),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404 | 409, ..
                }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(private: u16, public: Option<u16>, typ: PortTypeEnum) -> Port {
        Port {
            ip: Some("0.0.0.0".to_string()),
            private_port: private,
            public_port: public,
            typ: Some(typ),
        }
    }

    #[test]
    fn test_published_port_matches_protocol() {
        let ports = vec![
            port(19132, Some(40001), PortTypeEnum::TCP),
            port(19132, Some(40002), PortTypeEnum::UDP),
        ];
        assert_eq!(published_port(&ports, 19132, PortProtocol::Udp), Some(40002));
        assert_eq!(published_port(&ports, 19132, PortProtocol::Tcp), Some(40001));
    }

    #[test]
    fn test_published_port_falls_back_to_first_published() {
        let ports = vec![
            port(19132, None, PortTypeEnum::UDP),
            port(8080, Some(40003), PortTypeEnum::UDP),
        ];
        assert_eq!(published_port(&ports, 19132, PortProtocol::Udp), Some(40003));

        let unpublished = vec![port(19132, None, PortTypeEnum::UDP)];
        assert_eq!(published_port(&unpublished, 19132, PortProtocol::Udp), None);
        assert_eq!(published_port(&[], 19132, PortProtocol::Udp), None);
    }

    #[test]
    fn test_published_port_skips_unpublished_duplicate() {
        let ports = vec![
            port(19132, None, PortTypeEnum::UDP),
            port(19132, Some(40004), PortTypeEnum::UDP),
        ];
        assert_eq!(published_port(&ports, 19132, PortProtocol::Udp), Some(40004));
    }

    fn offline_driver() -> DockerDriver {
        let client = Docker::connect_with_http("http://127.0.0.1:1", 5, bollard::API_DEFAULT_VERSION)
            .unwrap();
        DockerDriver {
            client,
            config: DriverConfig::default(),
        }
    }

    #[test]
    fn test_build_args() {
        let driver = offline_driver();
        assert_eq!(
            driver.build_args("42"),
            vec!["build", "--build-arg", "PR=42", "-t", "pr-42", "."]
        );
    }

    #[test]
    fn test_label_filter_and_port_key() {
        let driver = offline_driver();
        let filters = driver.label_filter("42");
        assert_eq!(filters["label"], vec!["pr=42".to_string()]);
        assert_eq!(driver.port_key(), "19132/udp");
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_host_format() {
        let config = DriverConfig {
            docker_host: Some("ftp://nowhere".to_string()),
            ..DriverConfig::default()
        };
        let err = DockerDriver::connect(config).await.err().unwrap();
        assert!(err.to_string().contains("Invalid docker_host format"));
    }
}
