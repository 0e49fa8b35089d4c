//! Recipe materialization.
//!
//! A recipe arrives either inline or as a `blob://` reference. Either way it
//! is staged as a single block-style YAML file that gets bind-mounted into
//! the ingestion container.

use crate::error::IngestionError;
use crate::storage::BlobStore;
use serde_json::Value;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

/// URI scheme of the internal blob storage.
pub const INTERNAL_STORAGE_SCHEME: &str = "blob";

/// A recipe document: string keys, arbitrary nested values.
pub type RecipeDocument = serde_json::Map<String, Value>;

/// A `scheme://key` reference to a stored recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeRef(String);

impl RecipeRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }

    /// Everything after `scheme://`.
    pub fn key(&self) -> &str {
        self.0
            .split_once("://")
            .map(|(_, key)| key)
            .unwrap_or(&self.0)
    }

    fn is_internal(&self) -> bool {
        self.scheme() == Some(INTERNAL_STORAGE_SCHEME)
    }
}

impl fmt::Display for RecipeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecipeSource {
    Inline(RecipeDocument),
    Reference(RecipeRef),
}

impl RecipeSource {
    pub fn reference(uri: impl Into<String>) -> Self {
        RecipeSource::Reference(RecipeRef::new(uri))
    }

    /// Interpret a workflow-supplied value: a string is a reference, a
    /// mapping is an inline document.
    pub fn from_value(value: Value) -> Result<Self, IngestionError> {
        match value {
            Value::String(uri) => Ok(Self::reference(uri)),
            Value::Object(document) => Ok(RecipeSource::Inline(document)),
            other => Err(IngestionError::InvalidRecipeFormat {
                message: format!(
                    "recipe must be a mapping or a storage URI, found {}",
                    value_kind(&other)
                ),
            }),
        }
    }
}

/// The staged recipe file. Dropping it deletes the file.
#[derive(Debug)]
pub struct MaterializedRecipe {
    _file: NamedTempFile,
    path: PathBuf,
    contents: String,
}

impl MaterializedRecipe {
    /// Absolute host path of the staged file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    fn write(work_dir: &Path, contents: String) -> Result<Self, IngestionError> {
        fs::create_dir_all(work_dir).map_err(|e| {
            IngestionError::io(
                format!("Failed to create work directory {}", work_dir.display()),
                e,
            )
        })?;

        let mut file = tempfile::Builder::new()
            .prefix("recipe-")
            .suffix(".yml")
            .tempfile_in(work_dir)
            .map_err(|e| IngestionError::io("Failed to create recipe file", e))?;

        file.write_all(contents.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| IngestionError::io("Failed to write recipe file", e))?;

        // The container user is usually not the host user.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(file.path(), fs::Permissions::from_mode(0o644))
                .map_err(|e| IngestionError::io("Failed to set recipe file permissions", e))?;
        }

        let path = fs::canonicalize(file.path())
            .map_err(|e| IngestionError::io("Failed to canonicalize recipe file path", e))?;

        Ok(Self {
            _file: file,
            path,
            contents,
        })
    }
}

/// Resolve `source` and stage it as a YAML file under `work_dir`.
///
/// A reference with a foreign scheme is rejected before anything is written.
#[instrument(skip_all, fields(work_dir = %work_dir.display()))]
pub async fn materialize(
    source: &RecipeSource,
    store: &dyn BlobStore,
    work_dir: &Path,
) -> Result<MaterializedRecipe, IngestionError> {
    let contents = match source {
        RecipeSource::Inline(document) => render(document)?,
        RecipeSource::Reference(reference) => render(&fetch(reference, store).await?)?,
    };

    let recipe = MaterializedRecipe::write(work_dir, contents)?;
    debug!(path = %recipe.path().display(), "recipe materialized");
    Ok(recipe)
}

async fn fetch(reference: &RecipeRef, store: &dyn BlobStore) -> Result<RecipeDocument, IngestionError> {
    if !reference.is_internal() {
        return Err(IngestionError::InvalidRecipeReference {
            uri: reference.to_string(),
            expected: INTERNAL_STORAGE_SCHEME,
        });
    }

    let bytes = store
        .get(reference.key())
        .await
        .map_err(|source| IngestionError::StorageUnavailable { source })?;
    parse(&bytes)
}

/// Parse YAML (or JSON) bytes into a recipe document.
///
/// Only the top level has to be a mapping. Scalar keys anywhere in the
/// document (`3306:`, `true:`, `null:`) become their string form.
pub fn parse(bytes: &[u8]) -> Result<RecipeDocument, IngestionError> {
    let value: serde_yaml::Value =
        serde_yaml::from_slice(bytes).map_err(|e| invalid(e.to_string()))?;

    match untag(value) {
        serde_yaml::Value::Mapping(mapping) => to_document(mapping),
        other => Err(invalid(format!(
            "recipe must be a mapping, found {}",
            yaml_kind(&other)
        ))),
    }
}

fn to_document(mapping: serde_yaml::Mapping) -> Result<RecipeDocument, IngestionError> {
    mapping
        .into_iter()
        .map(|(key, value)| Ok((key_string(key)?, to_json(value)?)))
        .collect()
}

fn to_json(value: serde_yaml::Value) -> Result<Value, IngestionError> {
    use serde_yaml::Value as Yaml;

    Ok(match value {
        Yaml::Null => Value::Null,
        Yaml::Bool(b) => Value::Bool(b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| invalid(format!("unsupported number {}", n)))?
            }
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Sequence(items) => {
            Value::Array(items.into_iter().map(to_json).collect::<Result<_, _>>()?)
        }
        Yaml::Mapping(mapping) => Value::Object(to_document(mapping)?),
        Yaml::Tagged(tagged) => to_json(tagged.value)?,
    })
}

fn key_string(key: serde_yaml::Value) -> Result<String, IngestionError> {
    use serde_yaml::Value as Yaml;

    match untag(key) {
        Yaml::String(s) => Ok(s),
        Yaml::Number(n) => Ok(n.to_string()),
        Yaml::Bool(b) => Ok(b.to_string()),
        Yaml::Null => Ok("null".to_string()),
        other => Err(invalid(format!(
            "mapping keys must be scalars, found {}",
            yaml_kind(&other)
        ))),
    }
}

/// Drop `!tag` wrappers, keeping the tagged value.
fn untag(value: serde_yaml::Value) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::Tagged(tagged) => untag(tagged.value),
        other => other,
    }
}

fn invalid(message: String) -> IngestionError {
    IngestionError::InvalidRecipeFormat { message }
}

/// Canonical block-style YAML for `document`.
pub fn render(document: &RecipeDocument) -> Result<String, IngestionError> {
    serde_yaml::to_string(document).map_err(|e| IngestionError::InvalidRecipeFormat {
        message: e.to_string(),
    })
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

fn yaml_kind(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "an empty document",
        serde_yaml::Value::Bool(_) => "a boolean",
        serde_yaml::Value::Number(_) => "a number",
        serde_yaml::Value::String(_) => "a string",
        serde_yaml::Value::Sequence(_) => "a sequence",
        serde_yaml::Value::Mapping(_) => "a mapping",
        serde_yaml::Value::Tagged(_) => "a tagged value",
    }
}
