use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

static SECRET_URI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^secret://([^/]+)/(.+)$").expect("secret uri pattern compiles"));

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Secret not found: {scope}/{key}")]
    SecretNotFound { scope: String, key: String },

    #[error("Failed to read secrets file: {path} - {message}")]
    SecretsFileError { path: String, message: String },

    #[error("Failed to parse secrets file: {message}")]
    SecretsParseError { message: String },
}

pub trait SecretProvider: Send + Sync {
    fn resolve(&self, scope: &str, key: &str) -> Result<String, SecretError>;
}

/// Secrets file contents: scope, then key, then value.
pub type SecretTable = BTreeMap<String, BTreeMap<String, String>>;

/// Secrets file used when `CONFIG_SECRETS_FILE` is unset.
pub const DEFAULT_SECRETS_FILE: &str = ".ingest/secrets.json";

/// Resolves secrets from `SECRET_<SCOPE>_<KEY>` environment variables, then
/// from a JSON file shaped `{ "<scope>": { "<key>": "<value>" } }`.
///
/// The file is read at most once, on the first lookup the environment
/// cannot answer.
pub struct EnvFileSecretProvider {
    file: Option<PathBuf>,
    table: OnceCell<SecretTable>,
}

impl EnvFileSecretProvider {
    pub fn new() -> Self {
        Self {
            file: default_secrets_file(),
            table: OnceCell::new(),
        }
    }

    pub fn with_secrets_file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            file: Some(path.into()),
            table: OnceCell::new(),
        }
    }

    pub fn secrets_file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    fn table(&self) -> &SecretTable {
        self.table.get_or_init(|| match &self.file {
            Some(path) => read_secrets_file(path).unwrap_or_else(|e| {
                warn!(error = %e, "secrets file unusable, falling back to environment only");
                SecretTable::new()
            }),
            None => SecretTable::new(),
        })
    }
}

impl SecretProvider for EnvFileSecretProvider {
    fn resolve(&self, scope: &str, key: &str) -> Result<String, SecretError> {
        let var = env_var_name(scope, key);
        if let Some(value) = env::var_os(&var) {
            debug!(scope, key, var = %var, "secret resolved from environment");
            return Ok(value.to_string_lossy().into_owned());
        }

        match self.table().get(scope).and_then(|entries| entries.get(key)) {
            Some(value) => {
                debug!(scope, key, "secret resolved from secrets file");
                Ok(value.clone())
            }
            None => Err(SecretError::SecretNotFound {
                scope: scope.to_string(),
                key: key.to_string(),
            }),
        }
    }
}

impl Default for EnvFileSecretProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn default_secrets_file() -> Option<PathBuf> {
    match env::var_os("CONFIG_SECRETS_FILE") {
        Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => {
            let fallback = PathBuf::from(DEFAULT_SECRETS_FILE);
            fallback.is_file().then_some(fallback)
        }
    }
}

/// Environment variable consulted for `secret://scope/key`. Characters that
/// cannot appear in a variable name map to `_`.
pub fn env_var_name(scope: &str, key: &str) -> String {
    let sanitize = |part: &str| -> String {
        part.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    };
    format!("SECRET_{}_{}", sanitize(scope), sanitize(key))
}

/// Read a secrets file. Non-string values are skipped with a warning.
pub fn read_secrets_file(path: &Path) -> Result<SecretTable, SecretError> {
    debug!(path = %path.display(), "reading secrets file");
    let content = fs::read_to_string(path).map_err(|e| SecretError::SecretsFileError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let raw: BTreeMap<String, BTreeMap<String, Value>> =
        serde_json::from_str(&content).map_err(|e| SecretError::SecretsParseError {
            message: e.to_string(),
        })?;

    Ok(raw
        .into_iter()
        .map(|(scope, entries)| {
            let entries = entries
                .into_iter()
                .filter_map(|(key, value)| match value {
                    Value::String(secret) => Some((key, secret)),
                    _ => {
                        warn!(scope = %scope, key = %key, "ignoring non-string secret");
                        None
                    }
                })
                .collect();
            (scope, entries)
        })
        .collect())
}

/// Render a container environment map, replacing every `secret://scope/key`
/// value with the resolved secret. Other values are copied verbatim.
pub fn render_env<P: SecretProvider + ?Sized>(
    env: &BTreeMap<String, String>,
    provider: &P,
) -> Result<BTreeMap<String, String>, SecretError> {
    env.iter()
        .map(|(name, value)| {
            let rendered = match SECRET_URI.captures(value) {
                Some(captures) => provider.resolve(&captures[1], &captures[2])?,
                None => value.clone(),
            };
            Ok((name.clone(), rendered))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;
    use tempfile::TempDir;

    struct FixedProvider;

    impl SecretProvider for FixedProvider {
        fn resolve(&self, scope: &str, key: &str) -> Result<String, SecretError> {
            match (scope, key) {
                ("mysql", "password") => Ok("hunter2".to_string()),
                _ => Err(SecretError::SecretNotFound {
                    scope: scope.to_string(),
                    key: key.to_string(),
                }),
            }
        }
    }

    #[test]
    #[serial]
    fn test_env_secret_resolution() {
        env::set_var("SECRET_TEST_PASSWORD", "env_secret_value");

        let provider = EnvFileSecretProvider::new();
        let result = provider.resolve("test", "password");

        assert_eq!(result.unwrap(), "env_secret_value");

        env::remove_var("SECRET_TEST_PASSWORD");
    }

    #[test]
    #[serial]
    fn test_file_secret_resolution() {
        let temp_dir = TempDir::new().unwrap();
        let secrets_file = temp_dir.path().join("secrets.json");
        fs::write(
            &secrets_file,
            json!({"gms": {"token": "file_secret_value", "retries": 3}}).to_string(),
        )
        .unwrap();

        let provider = EnvFileSecretProvider::with_secrets_file(&secrets_file);
        assert_eq!(provider.resolve("gms", "token").unwrap(), "file_secret_value");
        assert!(matches!(
            provider.resolve("gms", "retries"),
            Err(SecretError::SecretNotFound { .. })
        ));
    }

    #[test]
    fn env_var_name_maps_separators_to_underscores() {
        assert_eq!(env_var_name("gms", "token"), "SECRET_GMS_TOKEN");
        assert_eq!(env_var_name("nowhere", "at-all"), "SECRET_NOWHERE_AT_ALL");
        assert_eq!(env_var_name("my.db", "pass word"), "SECRET_MY_DB_PASS_WORD");
    }

    #[test]
    #[serial]
    fn hyphenated_key_resolves_from_environment() {
        env::set_var("SECRET_MYSQL_READ_ONLY_PASSWORD", "from-env");

        let provider = EnvFileSecretProvider::with_secrets_file("/nonexistent/secrets.json");
        let result = provider.resolve("mysql", "read-only-password");

        env::remove_var("SECRET_MYSQL_READ_ONLY_PASSWORD");
        assert_eq!(result.unwrap(), "from-env");
    }

    #[test]
    fn read_secrets_file_keeps_only_strings() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("secrets.json");
        fs::write(
            &path,
            json!({"mysql": {"password": "pw", "port": 3306, "tls": null}}).to_string(),
        )
        .unwrap();

        let table = read_secrets_file(&path).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table["mysql"].len(), 1);
        assert_eq!(table["mysql"]["password"], "pw");
    }

    #[test]
    fn read_secrets_file_reports_parse_and_read_errors() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("secrets.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            read_secrets_file(&path),
            Err(SecretError::SecretsParseError { .. })
        ));
        assert!(matches!(
            read_secrets_file(&temp_dir.path().join("absent.json")),
            Err(SecretError::SecretsFileError { .. })
        ));
    }

    #[test]
    fn render_env_resolves_only_secret_uris() {
        let mut env = BTreeMap::new();
        env.insert("MYSQL_PASSWORD".to_string(), "secret://mysql/password".to_string());
        env.insert("LOG_LEVEL".to_string(), "debug".to_string());
        env.insert("NOT_A_SECRET".to_string(), "secret:/mysql/password".to_string());

        let rendered = render_env(&env, &FixedProvider).unwrap();

        assert_eq!(rendered["MYSQL_PASSWORD"], "hunter2");
        assert_eq!(rendered["LOG_LEVEL"], "debug");
        assert_eq!(rendered["NOT_A_SECRET"], "secret:/mysql/password");
    }

    #[test]
    fn render_env_fails_on_unknown_secret() {
        let mut env = BTreeMap::new();
        env.insert("TOKEN".to_string(), "secret://gms/token".to_string());

        let err = render_env(&env, &FixedProvider).unwrap_err();
        assert_eq!(err.to_string(), "Secret not found: gms/token");
    }
}
