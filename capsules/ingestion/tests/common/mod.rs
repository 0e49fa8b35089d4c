#![allow(dead_code)]

use async_trait::async_trait;
use capsules_ingestion::{
    ContainerEngine, ContainerHandle, ContainerSpec, EngineError, FsBlobStore, ImageSummary,
    Ingestion, IngestionSettings, LogSink, RecipeDocument, StreamKind,
};
use config_loader::{SecretError, SecretProvider};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Records every call and plays back scripted output.
///
/// Each container also prints `::{"outputs":{"container":"<name>"}}::` so
/// concurrent runs can tell their results apart.
#[derive(Default)]
pub struct FakeEngine {
    images: Vec<ImageSummary>,
    lines: Vec<(String, StreamKind)>,
    exit_code: i64,
    fail_start: bool,
    fail_pull: bool,
    block_until_killed: bool,
    killed: Notify,
    calls: Mutex<Vec<String>>,
    created: Mutex<Vec<ContainerSpec>>,
    recipes: Mutex<Vec<String>>,
    names: Mutex<HashMap<String, String>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, tags: &[&str]) -> Self {
        self.images.push(ImageSummary {
            id: format!("sha256:{:064}", self.images.len()),
            repo_tags: tags.iter().map(|t| t.to_string()).collect(),
        });
        self
    }

    pub fn stdout(mut self, line: &str) -> Self {
        self.lines.push((line.to_string(), StreamKind::Stdout));
        self
    }

    pub fn stderr(mut self, line: &str) -> Self {
        self.lines.push((line.to_string(), StreamKind::Stderr));
        self
    }

    pub fn exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_pull(mut self) -> Self {
        self.fail_pull = true;
        self
    }

    /// The container keeps running until it is killed.
    pub fn blocking(mut self) -> Self {
        self.block_until_killed = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.created.lock().unwrap().clone()
    }

    /// Recipe file contents as seen when each container was created.
    pub fn recipes(&self) -> Vec<String> {
        self.recipes.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn name_of(&self, handle: &ContainerHandle) -> String {
        self.names
            .lock()
            .unwrap()
            .get(handle.id())
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        self.record("list_images");
        Ok(self.images.clone())
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.record("pull");
        if self.fail_pull {
            return Err(EngineError::CommandFailed {
                command: format!("docker pull {}", image),
                status: Some(1),
                stderr: "manifest unknown".to_string(),
            });
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, EngineError> {
        self.record("create");
        let recipe = spec
            .mounts
            .first()
            .and_then(|m| fs::read_to_string(&m.host_path).ok())
            .unwrap_or_default();
        self.recipes.lock().unwrap().push(recipe);
        self.created.lock().unwrap().push(spec.clone());

        let id = format!("id-{}", spec.name);
        self.names
            .lock()
            .unwrap()
            .insert(id.clone(), spec.name.clone());
        Ok(ContainerHandle::new(id))
    }

    async fn start_container(&self, _handle: &ContainerHandle) -> Result<(), EngineError> {
        self.record("start");
        if self.fail_start {
            return Err(EngineError::CommandFailed {
                command: "docker start".to_string(),
                status: Some(1),
                stderr: "network datahub_network not found".to_string(),
            });
        }
        Ok(())
    }

    async fn wait_container(&self, _handle: &ContainerHandle) -> Result<i64, EngineError> {
        self.record("wait");
        if self.block_until_killed {
            self.killed.notified().await;
            return Ok(137);
        }
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        Ok(self.exit_code)
    }

    async fn follow_logs(
        &self,
        handle: &ContainerHandle,
        sink: &mut dyn LogSink,
    ) -> Result<(), EngineError> {
        let marker = format!(
            "::{}::",
            json!({"outputs": {"container": self.name_of(handle)}})
        );
        sink.accept(&marker, StreamKind::Stdout);
        for (line, stream) in &self.lines {
            tokio::task::yield_now().await;
            sink.accept(line, *stream);
        }
        Ok(())
    }

    async fn kill_container(&self, _handle: &ContainerHandle) -> Result<(), EngineError> {
        self.record("kill");
        self.killed.notify_one();
        Ok(())
    }

    async fn remove_container(&self, _handle: &ContainerHandle) -> Result<(), EngineError> {
        self.record("remove");
        Ok(())
    }
}

/// In-memory secrets that count lookups.
#[derive(Default)]
pub struct CountingSecrets {
    values: BTreeMap<(String, String), String>,
    lookups: AtomicUsize,
}

impl CountingSecrets {
    pub fn with(mut self, scope: &str, key: &str, value: &str) -> Self {
        self.values
            .insert((scope.to_string(), key.to_string()), value.to_string());
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl SecretProvider for CountingSecrets {
    fn resolve(&self, scope: &str, key: &str) -> Result<String, SecretError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.values
            .get(&(scope.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| SecretError::SecretNotFound {
                scope: scope.to_string(),
                key: key.to_string(),
            })
    }
}

pub fn settings(work_dir: &Path) -> IngestionSettings {
    IngestionSettings {
        work_dir: work_dir.to_path_buf(),
        ..IngestionSettings::default()
    }
}

pub fn ingestion(
    settings: IngestionSettings,
    engine: &Arc<FakeEngine>,
    store_root: &Path,
) -> Ingestion {
    Ingestion::new(
        settings,
        Arc::clone(engine) as Arc<dyn ContainerEngine>,
        Arc::new(FsBlobStore::new(store_root)),
    )
    .with_secrets(Arc::new(CountingSecrets::default()))
}

pub fn mysql_recipe() -> RecipeDocument {
    match json!({
        "source": {
            "type": "mysql",
            "config": {"host_port": "mysql:3306", "database": "dbname"}
        },
        "sink": {
            "type": "datahub-rest",
            "config": {"server": "http://datahub-gms:8080"}
        }
    }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

pub fn entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|it| it.count()).unwrap_or(0)
}
