use anyhow::{anyhow, bail, Context, Result};
use capsules_ingestion::recipe;
use capsules_ingestion::{DockerCli, FsBlobStore, Ingestion, IngestionSettings, RecipeSource};
use clap::{Args, Parser, Subcommand};
use config_loader::{ConfigLoader, OutcomeForm, PullPolicy, TaskConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

/// Blob root used when neither the config nor the environment names one.
const DEFAULT_STORAGE_ROOT: &str = ".ingest/blobs";

#[derive(Parser)]
#[command(name = "ingestctl", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an ingestion recipe in a container and print the outcome
    Run(RunArgs),
    /// Print the YAML a recipe file is staged as
    Render {
        /// Path to recipe (YAML or JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Print version and exit
    Version,
}

#[derive(Args)]
struct RunArgs {
    /// Path to recipe (YAML or JSON)
    #[arg(value_name = "FILE", required_unless_present = "recipe_uri")]
    file: Option<PathBuf>,
    /// Stored recipe reference, e.g. blob://recipes/mysql.yml
    #[arg(long, conflicts_with = "file")]
    recipe_uri: Option<String>,
    /// Config file (defaults to INGEST_CONFIG, then .ingest/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    image: Option<String>,
    #[arg(long)]
    network: Option<String>,
    /// ALWAYS, NEVER or IF_NOT_PRESENT
    #[arg(long)]
    pull_policy: Option<PullPolicy>,
    /// Container engine host, e.g. tcp://docker:2375
    #[arg(long)]
    host: Option<String>,
    /// Container environment; values may be secret://scope/key
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    env: Vec<(String, String)>,
    /// Report only {"success": bool}
    #[arg(long)]
    legacy: bool,
    /// Leave the container behind after it exits
    #[arg(long)]
    keep_container: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut TaskConfig) {
        if let Some(image) = &self.image {
            config.image = image.clone();
        }
        if let Some(network) = &self.network {
            config.network = network.clone();
        }
        if let Some(policy) = self.pull_policy {
            config.pull_policy = policy;
        }
        if let Some(host) = &self.host {
            config.host = Some(host.clone());
        }
        for (key, value) in &self.env {
            config.env.insert(key.clone(), value.clone());
        }
        if self.legacy {
            config.outcome = OutcomeForm::Legacy;
        }
        if self.keep_container {
            config.auto_remove = false;
        }
    }

    fn recipe(&self) -> Result<RecipeSource> {
        match (&self.file, &self.recipe_uri) {
            (Some(file), _) => Ok(RecipeSource::Inline(read_recipe(file)?)),
            (None, Some(uri)) => Ok(RecipeSource::reference(uri.clone())),
            (None, None) => bail!("a recipe file or --recipe-uri is required"),
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Run(args) => match run(args).await {
            Ok(true) => {}
            Ok(false) => std::process::exit(1),
            Err(e) => {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        },
        Commands::Render { file } => {
            let document = read_recipe(&file)?;
            print!("{}", recipe::render(&document)?);
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

/// Returns whether the container exited successfully.
async fn run(args: RunArgs) -> Result<bool> {
    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load().context("Failed to load ingestion config")?;
    args.apply(&mut config);
    config.validate().context("Invalid ingestion config")?;

    let recipe = args.recipe()?;

    let storage_root = config
        .storage_root
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));
    let engine = DockerCli::new().with_host(config.host.clone());
    let ingestion = Ingestion::new(
        IngestionSettings::from_config(&config),
        Arc::new(engine),
        Arc::new(FsBlobStore::new(storage_root)),
    );

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling ingestion");
                cancel.cancel();
            }
        })
    };

    let result = ingestion.run_with_cancel(&recipe, &cancel).await;
    interrupt.abort();

    let outcome = result.map_err(|e| anyhow!("[{}] {}", e.code(), e))?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome.is_success())
}

fn read_recipe(path: &Path) -> Result<capsules_ingestion::RecipeDocument> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read recipe file {}", path.display()))?;
    recipe::parse(&bytes).with_context(|| format!("Invalid recipe file {}", path.display()))
}
