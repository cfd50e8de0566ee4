use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LibrarianError>;

#[derive(Error, Debug)]
pub enum LibrarianError {
    #[error("Not found: {0}")]
    InputNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Service error: {0}")]
    TransientService(String),

    #[error("Build failed: {0}")]
    BuildFailure(String),

    #[error("Another database build is already in progress")]
    ConcurrentBuildRejected,

    #[error("No embeddings found in {0}")]
    EmptyEmbeddingSet(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of a [`LibrarianError`], used in structured reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputNotFound,
    Validation,
    DependencyUnavailable,
    TransientService,
    BuildFailure,
    ConcurrentBuildRejected,
    EmptyEmbeddingSet,
    Config,
    Io,
    Other,
}

impl LibrarianError {
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InputNotFound(_) => ErrorKind::InputNotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::DependencyUnavailable(_) => ErrorKind::DependencyUnavailable,
            Self::TransientService(_) => ErrorKind::TransientService,
            Self::BuildFailure(_) => ErrorKind::BuildFailure,
            Self::ConcurrentBuildRejected => ErrorKind::ConcurrentBuildRejected,
            Self::EmptyEmbeddingSet(_) => ErrorKind::EmptyEmbeddingSet,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Classify an error that travelled through `anyhow`, looking through its context chain
    #[inline]
    pub fn classify(error: &anyhow::Error) -> ErrorKind {
        error
            .chain()
            .find_map(|cause| cause.downcast_ref::<LibrarianError>())
            .map_or(ErrorKind::BuildFailure, LibrarianError::kind)
    }
}

pub mod capabilities;
pub mod chunking;
pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod index;
pub mod ingest;
pub mod pipeline;
pub mod records;
pub mod retrieval;
