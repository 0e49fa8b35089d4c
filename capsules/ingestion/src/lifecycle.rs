//! One container run: `Created -> Started -> Running -> Terminated`.

use crate::engine::{
    ContainerEngine, ContainerHandle, ContainerSpec, EngineError, LogSink,
};
use crate::error::{IngestionError, LifecycleStage};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the materialized recipe is bound inside the container.
pub const RECIPE_MOUNT_PATH: &str = "/recipe.yml";

/// Command run by the ingestion image.
pub fn ingest_command() -> Vec<String> {
    vec![
        "ingest".to_string(),
        "-c".to_string(),
        RECIPE_MOUNT_PATH.to_string(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Started,
    Running,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Created => "created",
            LifecycleState::Started => "started",
            LifecycleState::Running => "running",
            LifecycleState::Terminated => "terminated",
        })
    }
}

pub struct ContainerRun<'a> {
    engine: &'a dyn ContainerEngine,
    handle: ContainerHandle,
    state: LifecycleState,
    exit_code: Option<i64>,
}

impl<'a> ContainerRun<'a> {
    /// Create the container. `spec` is not read again after this call.
    pub async fn create(
        engine: &'a dyn ContainerEngine,
        spec: &ContainerSpec,
    ) -> Result<ContainerRun<'a>, IngestionError> {
        let handle = engine
            .create_container(spec)
            .await
            .map_err(|e| IngestionError::lifecycle(LifecycleStage::Create, e))?;
        debug!(container = %handle, name = %spec.name, "container created");

        Ok(Self {
            engine,
            handle,
            state: LifecycleState::Created,
            exit_code: None,
        })
    }

    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.exit_code
    }

    pub async fn start(&mut self) -> Result<(), IngestionError> {
        self.require(LifecycleState::Created)?;

        info!("Starting container");
        self.engine
            .start_container(&self.handle)
            .await
            .map_err(|e| IngestionError::lifecycle(LifecycleStage::Start, e))?;
        self.state = LifecycleState::Started;
        Ok(())
    }

    /// Wait for the process to exit while streaming its output into `sink`.
    ///
    /// Both the wait and the log stream must finish before this returns. If
    /// `cancel` fires first, the container is killed, both are still drained,
    /// and the run fails with [`IngestionError::Cancelled`].
    pub async fn run_to_exit(
        &mut self,
        sink: &mut dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<i64, IngestionError> {
        self.require(LifecycleState::Started)?;
        self.state = LifecycleState::Running;

        let engine = self.engine;
        let handle = &self.handle;
        let exited = async {
            tokio::join!(engine.wait_container(handle), engine.follow_logs(handle, sink))
        };
        tokio::pin!(exited);

        // A container that has already exited is not reported as cancelled.
        let finished = tokio::select! {
            biased;
            result = &mut exited => Some(result),
            _ = cancel.cancelled() => None,
        };
        let cancelled = finished.is_none();
        let (waited, logs) = match finished {
            Some(result) => result,
            None => {
                warn!(container = %handle, "cancellation requested, killing container");
                engine
                    .kill_container(handle)
                    .await
                    .map_err(|e| IngestionError::lifecycle(LifecycleStage::Kill, e))?;
                exited.await
            }
        };

        let exit_code = waited.map_err(|e| IngestionError::lifecycle(LifecycleStage::Wait, e))?;
        logs.map_err(|e| IngestionError::lifecycle(LifecycleStage::Logs, e))?;

        self.state = LifecycleState::Terminated;
        self.exit_code = Some(exit_code);
        info!(exit_code, "container terminated");

        if cancelled {
            return Err(IngestionError::Cancelled {
                exit_code: Some(exit_code),
            });
        }
        Ok(exit_code)
    }

    /// Best-effort removal; failures are logged, never returned.
    pub async fn teardown(&self) {
        match self.engine.remove_container(&self.handle).await {
            Ok(()) => debug!(container = %self.handle, "container removed"),
            Err(e) => warn!(container = %self.handle, error = %e, "failed to remove container"),
        }
    }

    fn require(&self, required: LifecycleState) -> Result<(), IngestionError> {
        if self.state == required {
            return Ok(());
        }
        Err(IngestionError::lifecycle(
            LifecycleStage::Transition,
            EngineError::Protocol {
                message: format!(
                    "container {} is {}, expected {}",
                    self.handle, self.state, required
                ),
            },
        ))
    }
}
