//! Probing of the optional components a build or query depends on.

use std::fmt;
use std::io::ErrorKind as IoErrorKind;
use std::process::Command;

use serde::Serialize;
use tracing::debug;

use crate::LibrarianError;
use crate::chunking::load_token_counter;
use crate::config::{Config, CredentialStore, mask_key};
use crate::embeddings::EmbedderFactory;
use crate::ingest::{CommandExtractor, TextExtractor};

/// Outcome of probing one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum Availability {
    Available(String),
    Unavailable(String),
}

impl Availability {
    #[inline]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    /// Turn an unavailable component into a `DependencyUnavailable` error
    #[inline]
    pub fn into_result(self, component: &str) -> anyhow::Result<()> {
        match self {
            Self::Available(_) => Ok(()),
            Self::Unavailable(reason) => Err(LibrarianError::DependencyUnavailable(format!(
                "{}: {}",
                component, reason
            ))
            .into()),
        }
    }

    fn from_result<T>(result: anyhow::Result<T>, detail: impl FnOnce(T) -> String) -> Self {
        match result {
            Ok(value) => Self::Available(detail(value)),
            Err(e) => Self::Unavailable(format!("{:#}", e)),
        }
    }
}

impl fmt::Display for Availability {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available(detail) => write!(f, "✅ {}", detail),
            Self::Unavailable(reason) => write!(f, "❌ {}", reason),
        }
    }
}

/// Check that `program` can be spawned. Its exit status is ignored.
#[inline]
pub fn probe_command(program: &str, args: &[&str]) -> Availability {
    match Command::new(program).args(args).output() {
        Ok(output) => {
            let text = if output.stdout.is_empty() {
                output.stderr
            } else {
                output.stdout
            };
            let first_line = String::from_utf8_lossy(&text)
                .lines()
                .next()
                .unwrap_or(program)
                .trim()
                .to_string();
            Availability::Available(first_line)
        }
        Err(e) if e.kind() == IoErrorKind::NotFound => {
            Availability::Unavailable(format!("{} is not installed", program))
        }
        Err(e) => Availability::Unavailable(format!("{} cannot be run: {}", program, e)),
    }
}

/// Number of GPUs reported by `nvidia-smi --list-gpus`, or 0 when it is unavailable
#[inline]
pub fn count_accelerators() -> usize {
    match Command::new("nvidia-smi").arg("--list-gpus").output() {
        Ok(output) if output.status.success() => {
            let count = String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|line| !line.trim().is_empty())
                .count();
            debug!("Detected {} accelerators", count);
            count
        }
        Ok(output) => {
            debug!("nvidia-smi exited with {}", output.status);
            0
        }
        Err(e) => {
            debug!("nvidia-smi unavailable: {}", e);
            0
        }
    }
}

/// Availability of every optional component
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityReport {
    pub tokenizer: Availability,
    pub embedding_service: Availability,
    pub pdf_extractor: Availability,
    pub api_key: Availability,
    pub accelerators: usize,
}

impl CapabilityReport {
    /// Probe the components configured in `config`
    #[inline]
    pub fn probe(
        config: &Config,
        factory: &dyn EmbedderFactory,
        extraction_command: &str,
    ) -> Self {
        let tokenizer = Availability::from_result(
            load_token_counter(&config.chunking.tokenizer),
            |counter| counter.name().to_string(),
        );

        let embedding_service = Availability::from_result(factory.probe(), |()| {
            format!(
                "{} at {}:{}",
                factory.model_name(),
                config.ollama.host,
                config.ollama.port
            )
        });

        let pdf_extractor = match CommandExtractor::new(extraction_command) {
            Ok(extractor) => Availability::from_result(extractor.probe(), |()| {
                extractor.program().to_string()
            }),
            Err(e) => Availability::Unavailable(format!("{:#}", e)),
        };

        let credentials = CredentialStore::new(config.credentials_path());
        let api_key = match credentials.api_key() {
            Ok(Some((key, source))) => {
                Availability::Available(format!("{} ({:?})", mask_key(&key), source))
            }
            Ok(None) => Availability::Unavailable("no API key configured".to_string()),
            Err(e) => Availability::Unavailable(format!("{:#}", e)),
        };

        Self {
            tokenizer,
            embedding_service,
            pdf_extractor,
            api_key,
            accelerators: factory.accelerator_count(),
        }
    }

    /// Components a build cannot run without
    #[inline]
    pub fn can_build(&self) -> bool {
        self.tokenizer.is_available() && self.embedding_service.is_available()
    }

    /// Components a query cannot run without
    #[inline]
    pub fn can_answer(&self) -> bool {
        self.embedding_service.is_available() && self.api_key.is_available()
    }
}
