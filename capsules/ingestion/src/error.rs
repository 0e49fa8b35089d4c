use crate::engine::EngineError;
use crate::storage::StorageError;
use std::fmt;
use thiserror::Error;

/// Step of the container lifecycle an engine failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    ListImages,
    Create,
    Start,
    Wait,
    Logs,
    Kill,
    /// A lifecycle call made from the wrong state.
    Transition,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleStage::ListImages => "list-images",
            LifecycleStage::Create => "create",
            LifecycleStage::Start => "start",
            LifecycleStage::Wait => "wait",
            LifecycleStage::Logs => "logs",
            LifecycleStage::Kill => "kill",
            LifecycleStage::Transition => "transition",
        })
    }
}

/// Fatal conditions that abort an ingestion run.
///
/// A container that exits non-zero is not an error: it produces a failed
/// [`crate::ExecutionOutcome`] instead.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("Invalid recipe reference '{uri}': must be a {expected}:// internal storage URI or an inline mapping")]
    InvalidRecipeReference { uri: String, expected: &'static str },

    #[error("Invalid recipe format: {message}")]
    InvalidRecipeFormat { message: String },

    #[error("Recipe storage unavailable: {source}")]
    StorageUnavailable {
        #[source]
        source: StorageError,
    },

    #[error("Failed to pull image {image}: {source}")]
    ImagePullFailed {
        image: String,
        #[source]
        source: EngineError,
    },

    #[error("Container {stage} failed: {source}")]
    ContainerLifecycle {
        stage: LifecycleStage,
        #[source]
        source: EngineError,
    },

    #[error("Invalid ingestion configuration: {message}")]
    Configuration { message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Ingestion cancelled")]
    Cancelled { exit_code: Option<i64> },
}

impl IngestionError {
    pub(crate) fn lifecycle(stage: LifecycleStage, source: EngineError) -> Self {
        IngestionError::ContainerLifecycle { stage, source }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        IngestionError::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable machine-readable code for the failure.
    pub fn code(&self) -> &'static str {
        match self {
            IngestionError::InvalidRecipeReference { .. } => "INGESTION_INVALID_RECIPE_REFERENCE",
            IngestionError::InvalidRecipeFormat { .. } => "INGESTION_INVALID_RECIPE_FORMAT",
            IngestionError::StorageUnavailable { .. } => "INGESTION_STORAGE_UNAVAILABLE",
            IngestionError::ImagePullFailed { .. } => "INGESTION_IMAGE_PULL_FAILED",
            IngestionError::ContainerLifecycle { .. } => "INGESTION_CONTAINER_LIFECYCLE_ERROR",
            IngestionError::Configuration { .. } => "INGESTION_INVALID_CONFIG",
            IngestionError::Io { .. } => "INGESTION_IO_ERROR",
            IngestionError::Cancelled { .. } => "INGESTION_CANCELLED",
        }
    }

    /// Which part of the run failed, for diagnostics.
    pub fn stage(&self) -> String {
        match self {
            IngestionError::InvalidRecipeReference { .. }
            | IngestionError::InvalidRecipeFormat { .. }
            | IngestionError::StorageUnavailable { .. }
            | IngestionError::Io { .. } => "materialize".to_string(),
            IngestionError::ImagePullFailed { .. } => "pull".to_string(),
            IngestionError::ContainerLifecycle { stage, .. } => stage.to_string(),
            IngestionError::Configuration { .. } => "configure".to_string(),
            IngestionError::Cancelled { .. } => "cancel".to_string(),
        }
    }
}
