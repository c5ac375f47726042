//! Lookup of provisioned artifacts per identifier

use crate::config::DriverConfig;
use async_trait::async_trait;
use std::path::PathBuf;

/// Answers whether an identifier has been provisioned.
///
/// Consulted on every resolve; implementations must not cache.
#[async_trait]
pub trait ArtifactIndex: Send + Sync {
    async fn exists(&self, identifier: &str) -> std::io::Result<bool>;
}

/// Artifacts stored as `<dir>/<prefix><identifier>` entries on disk
#[derive(Debug, Clone)]
pub struct DirectoryArtifacts {
    dir: PathBuf,
    prefix: String,
}

impl DirectoryArtifacts {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(&config.artifact_dir, config.name_prefix.clone())
    }

    pub fn path_for(&self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, identifier))
    }
}

#[async_trait]
impl ArtifactIndex for DirectoryArtifacts {
    async fn exists(&self, identifier: &str) -> std::io::Result<bool> {
        match tokio::fs::metadata(self.path_for(identifier)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
