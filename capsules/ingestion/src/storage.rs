//! Blob storage holding recipes referenced by `blob://` URIs.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Blob not found: {key}")]
    NotFound { key: String },

    #[error("Invalid blob key '{key}': {message}")]
    InvalidKey { key: String, message: String },

    #[error("Failed to read blob {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the full contents stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// Blob store backed by a local directory; keys are relative paths under it.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let invalid = |message: &str| StorageError::InvalidKey {
            key: key.to_string(),
            message: message.to_string(),
        };

        // `blob:///a/b` and `blob://a/b` both address `a/b`.
        let relative = Path::new(key.trim_start_matches('/'));
        let mut sanitized = PathBuf::new();
        for comp in relative.components() {
            match comp {
                Component::Normal(part) => sanitized.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("key cannot traverse outside the storage root"))
                }
            }
        }

        if sanitized.as_os_str().is_empty() {
            return Err(invalid("key must reference a file"));
        }

        Ok(self.root.join(sanitized))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        debug!(path = %path.display(), "reading blob");

        tokio::fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    key: key.to_string(),
                }
            } else {
                StorageError::Io {
                    key: key.to_string(),
                    source,
                }
            }
        })
    }
}
