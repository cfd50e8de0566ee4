//! Storage for the chat-completions API key.
//!
//! The `OPENAI_API_KEY` environment variable wins over the stored file.


use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    openai_api_key: Option<String>,
}

/// Where an API key was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Environment,
    File,
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    #[inline]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve the API key, if any is configured
    #[inline]
    pub fn api_key(&self) -> Result<Option<(String, KeySource)>> {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok(Some((key, KeySource::Environment)));
            }
        }

        Ok(self
            .read()?
            .openai_api_key
            .filter(|key| !key.trim().is_empty())
            .map(|key| (key, KeySource::File)))
    }

    #[inline]
    pub fn set_api_key(&self, key: &str) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(crate::LibrarianError::Validation("API key must not be empty".into()).into());
        }

        let mut file = self.read()?;
        file.openai_api_key = Some(key.to_string());
        self.write(&file)?;
        debug!("Stored API key in {}", self.path.display());
        Ok(())
    }

    /// Remove the stored key. Returns whether one was present.
    #[inline]
    pub fn clear_api_key(&self) -> Result<bool> {
        let mut file = self.read()?;
        let had_key = file.openai_api_key.take().is_some();
        if had_key {
            self.write(&file)?;
            debug!("Cleared API key from {}", self.path.display());
        }
        Ok(had_key)
    }

    fn read(&self) -> Result<CredentialsFile> {
        if !self.path.exists() {
            return Ok(CredentialsFile::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read credentials: {}", self.path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse credentials: {}", self.path.display()))
    }

    fn write(&self, file: &CredentialsFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(file).context("Failed to serialize credentials")?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut handle = options
            .open(&self.path)
            .with_context(|| format!("Failed to write credentials: {}", self.path.display()))?;
        handle
            .write_all(content.as_bytes())
            .with_context(|| format!("Failed to write credentials: {}", self.path.display()))?;

        // `mode` only applies on creation; tighten a pre-existing file too
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600)).with_context(
                || format!("Failed to restrict permissions on {}", self.path.display()),
            )?;
        }

        Ok(())
    }
}

/// Show only the edges of a key
#[inline]
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
