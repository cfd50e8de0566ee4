use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::LibrarianError;
use crate::chunking::ChunkingConfig;
use crate::config::Config;
use crate::database::DatabaseLayout;
use crate::embeddings::DeviceMode;
use crate::index::Metric;
use crate::ingest::extract::DEFAULT_PDF_COMMAND;
use crate::ingest::{CleanupMode, CommandExtractor, OrganizeMode};

/// Every parameter of one database build.
///
/// Unset fields take their defaults from [`Config`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildOptions {
    /// Scan the source directory recursively
    pub recursive: bool,
    pub cleanup: CleanupMode,
    pub organize: OrganizeMode,
    /// Command converting a PDF, with `{input}` and `{output}` placeholders
    pub extraction_command: String,
    /// Replace text files that already exist
    pub overwrite: bool,
    pub conversion_workers: usize,
    /// Add a `relative_path` column to `metadata.csv`
    pub metadata_relative_path: bool,
    pub min_tokens: usize,
    pub overlap: usize,
    pub tokenizer: String,
    pub chunk_workers: usize,
    pub embedding_workers: usize,
    pub device: DeviceMode,
    pub batch_size: usize,
    pub normalize: bool,
    pub metric: Metric,
    pub paths: StagePaths,
}

impl Default for BuildOptions {
    #[inline]
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Locations of intermediate artifacts, relative to the database directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StagePaths {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txt_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_csv: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedded_file: Option<PathBuf>,
}

/// Artifact paths of one build after overrides are applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub documents_dir: PathBuf,
    pub txt_dir: PathBuf,
    pub metadata_csv: PathBuf,
    pub chunks_file: PathBuf,
    pub shard_dir: PathBuf,
    pub embedded_file: PathBuf,
}

impl StagePaths {
    /// Apply the overrides to `layout`. Overrides must stay inside the database
    /// directory so a failed build can remove everything it wrote.
    #[inline]
    pub fn resolve(&self, layout: &DatabaseLayout) -> Result<ResolvedPaths, LibrarianError> {
        Ok(ResolvedPaths {
            documents_dir: layout.documents_dir(),
            txt_dir: pick(layout, self.txt_dir.as_deref(), layout.txt_dir(), "txt_dir")?,
            metadata_csv: pick(
                layout,
                self.metadata_csv.as_deref(),
                layout.metadata_csv(),
                "metadata_csv",
            )?,
            chunks_file: pick(
                layout,
                self.chunks_file.as_deref(),
                layout.chunks_file(),
                "chunks_file",
            )?,
            shard_dir: pick(layout, self.shard_dir.as_deref(), layout.shard_dir(), "shard_dir")?,
            embedded_file: pick(
                layout,
                self.embedded_file.as_deref(),
                layout.embedded_file(),
                "embedded_file",
            )?,
        })
    }
}

fn pick(
    layout: &DatabaseLayout,
    custom: Option<&Path>,
    default: PathBuf,
    field: &str,
) -> Result<PathBuf, LibrarianError> {
    match custom {
        Some(relative) => {
            check_relative(relative, field)?;
            Ok(layout.root().join(relative))
        }
        None => Ok(default),
    }
}

fn check_relative(path: &Path, field: &str) -> Result<(), LibrarianError> {
    let inside = !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if inside {
        Ok(())
    } else {
        Err(LibrarianError::Validation(format!(
            "paths.{} must be a relative path inside the database directory, got '{}'",
            field,
            path.display()
        )))
    }
}

impl BuildOptions {
    /// Options with every field taken from `config`
    #[inline]
    pub fn from_config(config: &Config) -> Self {
        Self {
            recursive: false,
            cleanup: CleanupMode::default(),
            organize: OrganizeMode::default(),
            extraction_command: DEFAULT_PDF_COMMAND.to_string(),
            overwrite: false,
            conversion_workers: config.chunking.workers,
            metadata_relative_path: false,
            min_tokens: config.chunking.min_tokens,
            overlap: config.chunking.overlap,
            tokenizer: config.chunking.tokenizer.clone(),
            chunk_workers: config.chunking.workers,
            embedding_workers: config.embedding.workers,
            device: config.embedding.device,
            batch_size: config.ollama.batch_size as usize,
            normalize: config.embedding.normalize,
            metric: config.index.metric,
            paths: StagePaths::default(),
        }
    }

    /// Options from `config`, with `overrides` (a possibly nested map keyed by
    /// field name) applied on top
    #[inline]
    pub fn resolve(config: &Config, overrides: Map<String, Value>) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::from_config(config))
            .context("Failed to serialize build options")?;
        merge(&mut merged, Value::Object(overrides));

        let options: Self = serde_json::from_value(merged)
            .map_err(|e| LibrarianError::Validation(format!("invalid build options: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    #[inline]
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("min_tokens", self.min_tokens),
            ("conversion_workers", self.conversion_workers),
            ("chunk_workers", self.chunk_workers),
            ("embedding_workers", self.embedding_workers),
            ("batch_size", self.batch_size),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(LibrarianError::Validation(format!(
                    "{} must be greater than 0",
                    field
                ))
                .into());
            }
        }

        if self.tokenizer.trim().is_empty() {
            return Err(LibrarianError::Validation("tokenizer cannot be empty".into()).into());
        }

        CommandExtractor::new(&self.extraction_command)?;
        Ok(())
    }

    #[inline]
    pub fn chunking(&self) -> ChunkingConfig {
        ChunkingConfig {
            min_tokens: self.min_tokens,
            overlap: self.overlap,
        }
    }
}

/// Recursively overlay `patch` onto `base`
fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge(existing, value);
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// Parse a `key=value` override. Dotted keys address nested fields
/// (`paths.chunks_file=...`). Values are read as JSON where possible and as
/// plain strings otherwise.
#[inline]
pub fn parse_assignment(assignment: &str) -> Result<(String, Value), LibrarianError> {
    let (key, raw) = assignment.split_once('=').ok_or_else(|| {
        LibrarianError::Validation(format!("expected KEY=VALUE, got '{}'", assignment))
    })?;
    let key = key.trim();
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(LibrarianError::Validation(format!(
            "invalid option name in '{}'",
            assignment
        )));
    }

    let raw = raw.trim();
    let value: Value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Insert `value` at a dotted `key` path, creating intermediate maps
#[inline]
pub fn insert_dotted(map: &mut Map<String, Value>, key: &str, value: Value) {
    match key.split_once('.') {
        Some((head, rest)) => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(inner) = entry {
                insert_dotted(inner, rest, value);
            }
        }
        None => {
            map.insert(key.to_string(), value);
        }
    }
}

/// Read overrides from a `.json` or `.toml` file
#[inline]
pub fn load_overrides(path: &Path) -> Result<Map<String, Value>> {
    if !path.is_file() {
        return Err(LibrarianError::InputNotFound(path.display().to_string()).into());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read options file: {}", path.display()))?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let value: Value = if is_json {
        serde_json::from_str(&content)
            .map_err(|e| LibrarianError::Validation(format!("{}: {}", path.display(), e)))?
    } else {
        toml::from_str(&content)
            .map_err(|e| LibrarianError::Validation(format!("{}: {}", path.display(), e)))?
    };

    match value {
        Value::Object(map) => Ok(map),
        _ => Err(LibrarianError::Validation(format!(
            "{} must contain a table of options",
            path.display()
        ))
        .into()),
    }
}
