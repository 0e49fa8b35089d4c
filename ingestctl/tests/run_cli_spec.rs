use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const RECIPE: &str = r#"
source:
  type: mysql
  config:
    host_port: mysql:3306
    include_tables: [orders, customers]
sink:
  type: datahub-rest
  config:
    server: http://datahub-gms:8080
"#;

/// A command isolated from the caller's config, secrets and work dirs.
fn ingestctl(temp: &Path) -> Result<Command> {
    let config = temp.join("config.yaml");
    fs::write(&config, "")?;

    let mut cmd = Command::cargo_bin("ingestctl")?;
    cmd.current_dir(temp)
        .env("INGEST_CONFIG", &config)
        .env("INGEST_WORK_DIR", temp.join("work"))
        .env("INGEST_STORAGE_ROOT", temp.join("blobs"))
        .env("INGEST_CONTAINER_RUNTIME", temp.join("no-such-docker"))
        .env_remove("CONFIG_SECRETS_FILE")
        .env_remove("INGEST_IMAGE")
        .env_remove("INGEST_NETWORK")
        .env_remove("INGEST_PULL_POLICY")
        .env_remove("INGEST_HOST");
    Ok(cmd)
}

#[test]
fn render_prints_block_yaml() -> Result<()> {
    let temp = TempDir::new()?;
    let recipe = temp.path().join("recipe.yml");
    fs::write(&recipe, RECIPE)?;

    ingestctl(temp.path())?
        .args(["render", &recipe.to_string_lossy()])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("sink:\n"))
        .stdout(predicate::str::contains("- orders\n"))
        .stdout(predicate::str::contains("[").not());

    Ok(())
}

#[test]
fn render_rejects_non_mapping_recipe() -> Result<()> {
    let temp = TempDir::new()?;
    let recipe = temp.path().join("recipe.yml");
    fs::write(&recipe, "- just\n- a list\n")?;

    ingestctl(temp.path())?
        .args(["render", &recipe.to_string_lossy()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("recipe must be a mapping"));

    Ok(())
}

#[test]
fn run_rejects_foreign_recipe_uri_before_touching_docker() -> Result<()> {
    let temp = TempDir::new()?;

    ingestctl(temp.path())?
        .args(["run", "--recipe-uri", "s3://bucket/recipe.yml"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("INGESTION_INVALID_RECIPE_REFERENCE"));

    Ok(())
}

#[test]
fn run_reports_missing_stored_recipe() -> Result<()> {
    let temp = TempDir::new()?;

    ingestctl(temp.path())?
        .args(["run", "--recipe-uri", "blob://recipes/missing.yml"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("INGESTION_STORAGE_UNAVAILABLE"));

    Ok(())
}

#[test]
fn run_fails_on_unknown_secret_without_creating_container() -> Result<()> {
    let temp = TempDir::new()?;
    let recipe = temp.path().join("recipe.yml");
    fs::write(&recipe, RECIPE)?;

    ingestctl(temp.path())?
        .args([
            "run",
            &recipe.to_string_lossy(),
            "--pull-policy",
            "never",
            "--env",
            "DATAHUB_GMS_TOKEN=secret://gms/missing",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Secret not found: gms/missing"));

    Ok(())
}

#[test]
fn run_surfaces_unreachable_engine_as_lifecycle_error() -> Result<()> {
    let temp = TempDir::new()?;
    let recipe = temp.path().join("recipe.yml");
    fs::write(&recipe, RECIPE)?;

    ingestctl(temp.path())?
        .args(["run", &recipe.to_string_lossy()])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("INGESTION_CONTAINER_LIFECYCLE_ERROR"))
        .stderr(predicate::str::contains("list-images"));

    Ok(())
}

#[test]
fn run_rejects_bad_env_flag() -> Result<()> {
    let temp = TempDir::new()?;

    ingestctl(temp.path())?
        .args(["run", "--recipe-uri", "blob://r.yml", "--env", "NOEQUALS"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected KEY=VALUE"));

    Ok(())
}

#[test]
fn run_requires_a_recipe() -> Result<()> {
    let temp = TempDir::new()?;

    ingestctl(temp.path())?.arg("run").assert().failure();

    Ok(())
}

#[test]
fn version_prints_package_version() -> Result<()> {
    let temp = TempDir::new()?;

    ingestctl(temp.path())?
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));

    Ok(())
}
