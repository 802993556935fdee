//! Connection registry loaded from a JSON file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use herald_scheduler::{
    Connection, ConnectionError, ConnectionRegistry, MemoryConnectionRegistry, Platform,
};
use thiserror::Error;
use tracing::{info, warn};

/// Errors loading a connections file.
#[derive(Debug, Error)]
pub enum ConnectionsFileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("{platform} connection for {owner_id} needs an endpoint")]
    MissingEndpoint { owner_id: String, platform: Platform },
}

/// Connections read once from a JSON array of [`Connection`]s.
#[derive(Debug, Default)]
pub struct FileConnectionRegistry {
    inner: MemoryConnectionRegistry,
}

impl FileConnectionRegistry {
    /// Load `path`. A missing file yields an empty registry.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConnectionsFileError> {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "connections file not found, no accounts connected");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConnectionsFileError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        let registry = Self::from_json(&content).map_err(|e| match e {
            ConnectionsFileError::Parse { message, .. } => ConnectionsFileError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        info!(path = %path.display(), count = registry.len(), "loaded connections");
        Ok(registry)
    }

    /// Parse a JSON array of connections.
    pub fn from_json(json: &str) -> Result<Self, ConnectionsFileError> {
        let connections: Vec<Connection> =
            serde_json::from_str(json).map_err(|e| ConnectionsFileError::Parse {
                path: PathBuf::new(),
                message: e.to_string(),
            })?;

        let mut inner = MemoryConnectionRegistry::new();
        for connection in connections {
            let self_hosted = matches!(connection.platform, Platform::Wordpress | Platform::Mastodon);
            if self_hosted && connection.endpoint.as_deref().is_none_or(str::is_empty) {
                return Err(ConnectionsFileError::MissingEndpoint {
                    owner_id: connection.owner_id,
                    platform: connection.platform,
                });
            }
            let before = inner.len();
            let (owner_id, platform) = (connection.owner_id.clone(), connection.platform);
            inner.insert(connection);
            if inner.len() == before {
                warn!(%owner_id, %platform, "duplicate connection, keeping the last one");
            }
        }
        Ok(Self { inner })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl ConnectionRegistry for FileConnectionRegistry {
    async fn resolve(
        &self,
        owner_id: &str,
        platform: Platform,
    ) -> Result<Connection, ConnectionError> {
        self.inner.resolve(owner_id, platform).await
    }
}
