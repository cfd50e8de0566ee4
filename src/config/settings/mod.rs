#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::chunking::DEFAULT_TOKENIZER;
use crate::embeddings::DeviceMode;
use crate::index::Metric;

/// Overrides the database root from the config file
pub const DB_ROOT_ENV: &str = "LIBRARIAN_DB_ROOT";
/// Overrides the query log directory from the config file
pub const LOG_DIR_ENV: &str = "LIBRARIAN_LOG_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub index: IndexSettings,
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub batch_size: u32,
    pub timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "all-minilm:latest".to_string(),
            batch_size: 64,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub rewrite_model: String,
    pub answer_model: String,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_seconds: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            rewrite_model: "gpt-4.1-nano".to_string(),
            answer_model: "o3".to_string(),
            retry_attempts: 3,
            retry_delay_ms: 2000,
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingSettings {
    pub min_tokens: usize,
    pub overlap: usize,
    pub tokenizer: String,
    pub workers: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            min_tokens: 500,
            overlap: 1,
            tokenizer: DEFAULT_TOKENIZER.to_string(),
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub workers: usize,
    pub device: DeviceMode,
    pub normalize: bool,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            device: DeviceMode::Gpu,
            normalize: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexSettings {
    pub metric: Metric,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QuerySettings {
    pub top_k: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self { top_k: 15 }
    }
}

/// Locations of databases and query logs. Unset entries live under the config directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 4096)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid timeout: {0} seconds (must be between 1 and 600)")]
    InvalidTimeout(u64),
    #[error("Invalid retry attempts: {0} (must be between 1 and 10)")]
    InvalidRetryAttempts(u32),
    #[error("Invalid retry delay: {0}ms (must be at most 60000)")]
    InvalidRetryDelay(u64),
    #[error("Invalid minimum chunk tokens: {0} (must be between 1 and 8192)")]
    InvalidMinTokens(usize),
    #[error("Invalid paragraph overlap: {0} (must be at most 64)")]
    InvalidOverlap(usize),
    #[error("Invalid tokenizer: {0} (cannot be empty)")]
    InvalidTokenizer(String),
    #[error("Invalid {0} worker count: {1} (must be between 1 and 256)")]
    InvalidWorkers(&'static str, usize),
    #[error("Invalid top_k: {0} (must be between 1 and 1000)")]
    InvalidTopK(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            ollama: OllamaConfig::default(),
            openai: OpenAiConfig::default(),
            chunking: ChunkingSettings::default(),
            embedding: EmbeddingSettings::default(),
            index: IndexSettings::default(),
            query: QuerySettings::default(),
            paths: PathSettings::default(),
            base_dir: Self::config_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// `~/.librarian`, the default configuration directory
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".librarian"))
            .or({
                #[cfg(windows)]
                {
                    dirs::data_dir().map(|data| data.join("librarian"))
                }
                #[cfg(not(windows))]
                {
                    None
                }
            })
            .ok_or(ConfigError::DirectoryError)
    }

    /// Load the configuration stored in the default directory
    #[inline]
    pub fn load_default() -> Result<Self> {
        let config_dir = Self::config_dir().context("Failed to determine config directory")?;
        Self::load(config_dir)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Get the base directory for the application
    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    #[inline]
    pub fn credentials_path(&self) -> PathBuf {
        self.get_base_dir().join("credentials.toml")
    }

    /// Root directory holding one subdirectory per database
    #[inline]
    pub fn db_root(&self) -> PathBuf {
        env_path(DB_ROOT_ENV)
            .or_else(|| self.paths.db_root.clone())
            .unwrap_or_else(|| self.get_base_dir().join("databases"))
    }

    /// Directory receiving one audit record per answered query
    #[inline]
    pub fn log_dir(&self) -> PathBuf {
        env_path(LOG_DIR_ENV)
            .or_else(|| self.paths.log_dir.clone())
            .unwrap_or_else(|| self.get_base_dir().join("logs"))
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.ollama.ollama_url()
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ollama.validate()?;
        self.openai.validate()?;
        self.chunking.validate()?;
        self.embedding.validate()?;
        self.query.validate()?;
        Ok(())
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn validate_workers(kind: &'static str, workers: usize) -> Result<(), ConfigError> {
    if !(1..=256).contains(&workers) {
        return Err(ConfigError::InvalidWorkers(kind, workers));
    }
    Ok(())
}

fn validate_timeout(seconds: u64) -> Result<(), ConfigError> {
    if !(1..=600).contains(&seconds) {
        return Err(ConfigError::InvalidTimeout(seconds));
    }
    Ok(())
}

impl OllamaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        self.ollama_url()?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 4096 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        validate_timeout(self.timeout_seconds)
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    pub fn set_protocol(&mut self, protocol: String) -> Result<(), ConfigError> {
        if protocol != "http" && protocol != "https" {
            return Err(ConfigError::InvalidProtocol(protocol));
        }
        self.protocol = protocol;
        Ok(())
    }

    pub fn set_host(&mut self, host: String) -> Result<(), ConfigError> {
        let temp_config = OllamaConfig {
            host: host.clone(),
            ..self.clone()
        };
        temp_config.validate()?;
        self.host = host;
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        self.port = port;
        Ok(())
    }

    pub fn set_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.model = model;
        Ok(())
    }

    pub fn set_batch_size(&mut self, batch_size: u32) -> Result<(), ConfigError> {
        if batch_size == 0 || batch_size > 4096 {
            return Err(ConfigError::InvalidBatchSize(batch_size));
        }
        self.batch_size = batch_size;
        Ok(())
    }
}

impl OpenAiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.base_url)
            .map_err(|_| ConfigError::InvalidUrl(self.base_url.clone()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidProtocol(url.scheme().to_string()));
        }

        for model in [&self.rewrite_model, &self.answer_model] {
            if model.trim().is_empty() {
                return Err(ConfigError::InvalidModel(model.clone()));
            }
        }

        if !(1..=10).contains(&self.retry_attempts) {
            return Err(ConfigError::InvalidRetryAttempts(self.retry_attempts));
        }

        if self.retry_delay_ms > 60_000 {
            return Err(ConfigError::InvalidRetryDelay(self.retry_delay_ms));
        }

        validate_timeout(self.timeout_seconds)
    }

    pub fn set_base_url(&mut self, base_url: String) -> Result<(), ConfigError> {
        let temp_config = OpenAiConfig {
            base_url: base_url.clone(),
            ..self.clone()
        };
        temp_config.validate()?;
        self.base_url = base_url;
        Ok(())
    }

    pub fn set_rewrite_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.rewrite_model = model;
        Ok(())
    }

    pub fn set_answer_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.answer_model = model;
        Ok(())
    }
}

impl ChunkingSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=8192).contains(&self.min_tokens) {
            return Err(ConfigError::InvalidMinTokens(self.min_tokens));
        }

        if self.overlap > 64 {
            return Err(ConfigError::InvalidOverlap(self.overlap));
        }

        if self.tokenizer.trim().is_empty() {
            return Err(ConfigError::InvalidTokenizer(self.tokenizer.clone()));
        }

        validate_workers("chunking", self.workers)
    }

    pub fn set_min_tokens(&mut self, min_tokens: usize) -> Result<(), ConfigError> {
        if !(1..=8192).contains(&min_tokens) {
            return Err(ConfigError::InvalidMinTokens(min_tokens));
        }
        self.min_tokens = min_tokens;
        Ok(())
    }

    pub fn set_overlap(&mut self, overlap: usize) -> Result<(), ConfigError> {
        if overlap > 64 {
            return Err(ConfigError::InvalidOverlap(overlap));
        }
        self.overlap = overlap;
        Ok(())
    }

    pub fn set_tokenizer(&mut self, tokenizer: String) -> Result<(), ConfigError> {
        if tokenizer.trim().is_empty() {
            return Err(ConfigError::InvalidTokenizer(tokenizer));
        }
        self.tokenizer = tokenizer;
        Ok(())
    }
}

impl EmbeddingSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_workers("embedding", self.workers)
    }

    pub fn set_workers(&mut self, workers: usize) -> Result<(), ConfigError> {
        validate_workers("embedding", workers)?;
        self.workers = workers;
        Ok(())
    }
}

impl QuerySettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=1000).contains(&self.top_k) {
            return Err(ConfigError::InvalidTopK(self.top_k));
        }
        Ok(())
    }

    pub fn set_top_k(&mut self, top_k: usize) -> Result<(), ConfigError> {
        if !(1..=1000).contains(&top_k) {
            return Err(ConfigError::InvalidTopK(top_k));
        }
        self.top_k = top_k;
        Ok(())
    }
}
