//! Containerized metadata ingestion.
//!
//! An [`Ingestion`] materializes a recipe, makes sure the ingestion image is
//! available, runs it in a fresh container with the recipe bind-mounted at
//! `/recipe.yml`, classifies everything the container prints and turns the
//! result into an [`ExecutionOutcome`].

pub mod classifier;
pub mod docker;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod outcome;
pub mod pull;
pub mod recipe;
pub mod storage;

pub use classifier::{ClassifiedOutput, LineParser, MarkerLineParser, OutputClassifier};
pub use docker::DockerCli;
pub use engine::{
    BindMount, ContainerEngine, ContainerHandle, ContainerSpec, EngineError, ImageSummary,
    LogSink, StreamKind,
};
pub use error::{IngestionError, LifecycleStage};
pub use lifecycle::{ContainerRun, LifecycleState, RECIPE_MOUNT_PATH};
pub use outcome::{ExecutionOutcome, IngestionOutput, LegacyOutcome};
pub use pull::PullDecision;
pub use recipe::{MaterializedRecipe, RecipeDocument, RecipeRef, RecipeSource};
pub use storage::{BlobStore, FsBlobStore, StorageError};

use config_loader::{
    render_env, EnvFileSecretProvider, OutcomeForm, PullPolicy, SecretProvider, TaskConfig,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Per-task settings an [`Ingestion`] runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionSettings {
    pub image: String,
    pub network: String,
    pub pull_policy: PullPolicy,
    /// May contain `secret://scope/key` placeholders.
    pub env: BTreeMap<String, String>,
    pub outcome: OutcomeForm,
    pub auto_remove: bool,
    pub work_dir: PathBuf,
}

impl IngestionSettings {
    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            image: config.image.clone(),
            network: config.network.clone(),
            pull_policy: config.pull_policy,
            env: config.env.clone(),
            outcome: config.outcome,
            auto_remove: config.auto_remove,
            work_dir: config.work_dir.clone().unwrap_or_else(std::env::temp_dir),
        }
    }
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self::from_config(&TaskConfig::default())
    }
}

/// Runs ingestion recipes in containers.
///
/// Holds no per-run state, so one instance can serve concurrent runs.
pub struct Ingestion {
    settings: IngestionSettings,
    engine: Arc<dyn ContainerEngine>,
    store: Arc<dyn BlobStore>,
    secrets: Arc<dyn SecretProvider>,
    parser: Arc<dyn LineParser>,
}

impl Ingestion {
    pub fn new(
        settings: IngestionSettings,
        engine: Arc<dyn ContainerEngine>,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            settings,
            engine,
            store,
            secrets: Arc::new(EnvFileSecretProvider::new()),
            parser: Arc::new(MarkerLineParser),
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretProvider>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_line_parser(mut self, parser: Arc<dyn LineParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn settings(&self) -> &IngestionSettings {
        &self.settings
    }

    pub async fn run(&self, recipe: &RecipeSource) -> Result<ExecutionOutcome, IngestionError> {
        self.run_with_cancel(recipe, &CancellationToken::new()).await
    }

    /// Run `recipe` to completion.
    ///
    /// A non-zero container exit yields a failed outcome, not an error.
    /// Firing `cancel` kills the container and fails with
    /// [`IngestionError::Cancelled`].
    pub async fn run_with_cancel(
        &self,
        recipe: &RecipeSource,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, IngestionError> {
        let name = container_name();
        self.execute(recipe, &name, cancel).await
    }

    #[instrument(
        name = "ingestion_run",
        skip(self, recipe, name, cancel),
        fields(image = %self.settings.image, container = %name)
    )]
    async fn execute(
        &self,
        recipe: &RecipeSource,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, IngestionError> {
        let started = Instant::now();
        info!(pull_policy = %self.settings.pull_policy, "ingestion started");

        let result = self.execute_inner(recipe, name, cancel).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(outcome) => {
                info!(
                    success = outcome.is_success(),
                    exit_code = ?outcome.exit_code(),
                    elapsed_ms,
                    "ingestion finished"
                );
            }
            Err(e) => {
                error!(code = e.code(), stage = %e.stage(), error = %e, elapsed_ms, "ingestion failed");
            }
        }

        result
    }

    async fn execute_inner(
        &self,
        recipe: &RecipeSource,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, IngestionError> {
        if cancel.is_cancelled() {
            return Err(IngestionError::Cancelled { exit_code: None });
        }

        let materialized =
            recipe::materialize(recipe, self.store.as_ref(), &self.settings.work_dir).await?;

        pull::ensure_image(
            self.engine.as_ref(),
            &self.settings.image,
            self.settings.pull_policy,
        )
        .await?;

        let run = {
            let spec = self.container_spec(name, &materialized)?;
            ContainerRun::create(self.engine.as_ref(), &spec).await?
        };

        let mut classifier = OutputClassifier::new(Arc::clone(&self.parser));
        let exited = Self::drive(run, &mut classifier, cancel, self.settings.auto_remove).await;

        // The recipe file has to outlive the container.
        drop(materialized);

        let exit_code = exited?;
        Ok(ExecutionOutcome::build(
            self.settings.outcome,
            exit_code,
            classifier.finish(),
        ))
    }

    /// Start, wait and tear down; teardown happens whatever the result.
    async fn drive(
        mut run: ContainerRun<'_>,
        classifier: &mut OutputClassifier,
        cancel: &CancellationToken,
        auto_remove: bool,
    ) -> Result<i64, IngestionError> {
        let result = match run.start().await {
            Ok(()) => run.run_to_exit(classifier, cancel).await,
            Err(e) => Err(e),
        };

        if auto_remove {
            run.teardown().await;
        }
        result
    }

    /// Secrets are resolved here, right before create, and nowhere else.
    fn container_spec(
        &self,
        name: &str,
        recipe: &MaterializedRecipe,
    ) -> Result<ContainerSpec, IngestionError> {
        let env = render_env(&self.settings.env, self.secrets.as_ref()).map_err(|e| {
            IngestionError::Configuration {
                message: e.to_string(),
            }
        })?;

        Ok(ContainerSpec {
            name: name.to_string(),
            image: self.settings.image.clone(),
            command: lifecycle::ingest_command(),
            env,
            mounts: vec![BindMount {
                host_path: recipe.path().to_path_buf(),
                container_path: RECIPE_MOUNT_PATH.to_string(),
                read_only: true,
            }],
            network: self.settings.network.clone(),
        })
    }
}

fn container_name() -> String {
    format!("ingestion-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_task_config() {
        let mut config = TaskConfig::default();
        config.pull_policy = PullPolicy::Never;
        config.auto_remove = false;
        config.work_dir = Some(PathBuf::from("/var/lib/ingest"));

        let settings = IngestionSettings::from_config(&config);
        assert_eq!(settings.image, "acryldata/datahub-ingestion:head");
        assert_eq!(settings.network, "datahub_network");
        assert_eq!(settings.pull_policy, PullPolicy::Never);
        assert!(!settings.auto_remove);
        assert_eq!(settings.work_dir, PathBuf::from("/var/lib/ingest"));
    }

    #[test]
    fn work_dir_defaults_to_temp_dir() {
        assert_eq!(IngestionSettings::default().work_dir, std::env::temp_dir());
    }

    #[test]
    fn container_names_are_unique() {
        let a = container_name();
        let b = container_name();
        assert!(a.starts_with("ingestion-"));
        assert_eq!(a.len(), "ingestion-".len() + 36);
        assert_ne!(a, b);
    }
}
