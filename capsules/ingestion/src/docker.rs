//! [`ContainerEngine`] backed by the `docker` command-line client.

use crate::engine::{
    ContainerEngine, ContainerHandle, ContainerSpec, EngineError, ImageSummary, LogSink,
    StreamKind,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::env;
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Overrides the engine binary (`docker`, `podman`, ...).
pub const RUNTIME_ENV: &str = "INGEST_CONTAINER_RUNTIME";

#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
    host: Option<String>,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_program(detect_runtime_binary())
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            host: None,
        }
    }

    /// Talk to a specific daemon (`--host`), e.g. `tcp://docker:2375`.
    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host.filter(|h| !h.trim().is_empty());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.program);
        if let Some(host) = &self.host {
            command.arg("--host").arg(host);
        }
        command.args(args);
        command.stdin(Stdio::null());
        command.kill_on_drop(true);
        command
    }

    /// Run to completion and return stdout, failing on a non-zero status.
    async fn run<I, S>(&self, args: I) -> Result<String, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = self.command(args);
        let cmdline = command_line_string(&command);
        debug!(command = %cmdline, "running container engine");

        let output = command.output().await.map_err(|source| EngineError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                command: cmdline,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    #[instrument(skip(self))]
    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        let listing = self.run(["image", "ls", "--quiet", "--no-trunc"]).await?;
        let ids = unique_ids(&listing);
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let inspected = self
            .run(["image", "inspect"].into_iter().chain(ids.iter().map(String::as_str)))
            .await?;
        parse_inspect(&inspected)
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.run(["pull", "--quiet", image]).await.map(|_| ())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, EngineError> {
        let stdout = self.run(create_args(spec)).await?;
        let id = stdout.trim();
        if id.is_empty() {
            return Err(EngineError::Protocol {
                message: "create returned no container id".to_string(),
            });
        }
        Ok(ContainerHandle::new(id))
    }

    async fn start_container(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        self.run(["start", handle.id()]).await.map(|_| ())
    }

    async fn wait_container(&self, handle: &ContainerHandle) -> Result<i64, EngineError> {
        let stdout = self.run(["wait", handle.id()]).await?;
        parse_exit_code(&stdout)
    }

    async fn follow_logs(
        &self,
        handle: &ContainerHandle,
        sink: &mut dyn LogSink,
    ) -> Result<(), EngineError> {
        let mut command = self.command(["logs", "--follow", handle.id()]);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let cmdline = command_line_string(&command);

        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(EngineError::Protocol {
                message: "log streams were not captured".to_string(),
            });
        };
        let mut stdout = BufReader::new(stdout);
        let mut stderr = BufReader::new(stderr);
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let (mut out_open, mut err_open) = (true, true);

        while out_open || err_open {
            tokio::select! {
                line = read_line(&mut stdout, &mut out_buf), if out_open => {
                    match line.map_err(log_read_error)? {
                        Some(line) => sink.accept(&line, StreamKind::Stdout),
                        None => out_open = false,
                    }
                }
                line = read_line(&mut stderr, &mut err_buf), if err_open => {
                    match line.map_err(log_read_error)? {
                        Some(line) => sink.accept(&line, StreamKind::Stderr),
                        None => err_open = false,
                    }
                }
            }
        }

        let status = child.wait().await.map_err(|source| EngineError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if !status.success() {
            return Err(EngineError::CommandFailed {
                command: cmdline,
                status: status.code(),
                stderr: "log stream ended with an error".to_string(),
            });
        }
        Ok(())
    }

    async fn kill_container(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        match self.run(["kill", handle.id()]).await {
            // Lost the race with a normal exit; nothing left to kill.
            Err(EngineError::CommandFailed { stderr, .. }) if stderr.contains("is not running") => {
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn remove_container(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        self.run(["rm", "--force", handle.id()]).await.map(|_| ())
    }
}

fn detect_runtime_binary() -> String {
    match env::var(RUNTIME_ENV) {
        Ok(val) if !val.trim().is_empty() => val.trim().to_string(),
        _ => "docker".to_string(),
    }
}

fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--network".to_string(),
        spec.network.clone(),
    ];

    for mount in &spec.mounts {
        let mut value = format!(
            "type=bind,source={},target={}",
            mount.host_path.display(),
            mount.container_path
        );
        if mount.read_only {
            value.push_str(",readonly");
        }
        args.push("--mount".to_string());
        args.push(value);
    }

    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedImage {
    id: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
}

fn parse_inspect(json: &str) -> Result<Vec<ImageSummary>, EngineError> {
    let images: Vec<InspectedImage> =
        serde_json::from_str(json).map_err(|e| EngineError::Protocol {
            message: format!("cannot parse image inspect output: {}", e),
        })?;

    Ok(images
        .into_iter()
        .map(|image| ImageSummary {
            id: image.id,
            repo_tags: image.repo_tags.unwrap_or_default(),
        })
        .collect())
}

/// `image ls` prints one row per tag, so the same id can repeat.
fn unique_ids(listing: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

fn parse_exit_code(stdout: &str) -> Result<i64, EngineError> {
    let text = stdout.trim();
    text.parse().map_err(|_| EngineError::Protocol {
        message: format!("wait returned '{}' instead of an exit status", text),
    })
}

/// Cancel safe: a partially read line stays in `buf` for the next call.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let read = reader.read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }
    let line = decode_line(buf);
    buf.clear();
    Ok(Some(line))
}

fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim_end_matches('\n').trim_end_matches('\r').to_string()
}

fn log_read_error(e: io::Error) -> EngineError {
    EngineError::Protocol {
        message: format!("failed to read container logs: {}", e),
    }
}

fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let escaped = arg.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

fn command_line_string(cmd: &Command) -> String {
    let cmd = cmd.as_std();
    let mut s = String::new();
    s.push_str(&cmd.get_program().to_string_lossy());
    for a in cmd.get_args() {
        s.push(' ');
        let a = a.to_string_lossy();
        if a.is_empty() || a.contains(' ') || a.contains('"') || a.contains('\'') {
            s.push_str(&shell_escape(&a));
        } else {
            s.push_str(&a);
        }
    }
    s
}
