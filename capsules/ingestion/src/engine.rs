//! Protocol spoken with the container engine.
//!
//! The orchestrator only needs a handful of primitives: list and pull images,
//! create/start/wait/kill/remove a container, and follow its output. Anything
//! that can provide them (the docker CLI, an HTTP client, a test double)
//! implements [`ContainerEngine`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn container engine '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {}: {stderr}", display_status(.status))]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Unexpected container engine output: {message}")]
    Protocol { message: String },
}

fn display_status(status: &Option<i32>) -> String {
    status.map_or_else(|| "unknown".to_string(), |code| code.to_string())
}

/// A locally available image as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub id: String,
    /// Tags in the order the engine registered them.
    pub repo_tags: Vec<String>,
}

impl ImageSummary {
    pub fn first_tag(&self) -> Option<&str> {
        self.repo_tags.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

/// Everything the engine needs to create one container. Built once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<BindMount>,
    pub network: String,
}

/// Engine-assigned container id, valid for a single run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form, like `docker ps`.
        let short: String = self.0.chars().take(12).collect();
        f.write_str(&short)
    }
}

/// Declared origin of an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Receives container output one line at a time, in delivery order.
pub trait LogSink: Send {
    fn accept(&mut self, line: &str, stream: StreamKind);
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError>;

    /// Blocks until the image is fully pulled.
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, EngineError>;

    async fn start_container(&self, handle: &ContainerHandle) -> Result<(), EngineError>;

    /// Blocks until the container process exits and returns its exit status.
    async fn wait_container(&self, handle: &ContainerHandle) -> Result<i64, EngineError>;

    /// Streams the container output into `sink` until the engine signals
    /// end-of-stream (the container has exited and all output was delivered).
    async fn follow_logs(
        &self,
        handle: &ContainerHandle,
        sink: &mut dyn LogSink,
    ) -> Result<(), EngineError>;

    async fn kill_container(&self, handle: &ContainerHandle) -> Result<(), EngineError>;

    async fn remove_container(&self, handle: &ContainerHandle) -> Result<(), EngineError>;
}
