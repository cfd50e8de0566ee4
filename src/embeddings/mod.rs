// Embedding model seams, the Ollama client and the sharded embedding coordinator

pub mod coordinator;
pub mod ollama;

use std::fmt;
use std::sync::{Arc, RwLock};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use coordinator::{EmbeddingJob, EmbeddingSummary, partition, resolve_worker_count};
pub use ollama::{OllamaClient, OllamaEmbedderFactory};

/// Requested placement of embedding workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    #[default]
    Gpu,
    Cpu,
}

impl fmt::Display for DeviceMode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => f.write_str("gpu"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

/// Device a single embedder instance is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBinding {
    /// Let the model server choose
    Auto,
    Cpu,
    /// Accelerator with the given index
    Accelerator(usize),
}

/// Turns texts into vectors. One instance is owned by one worker.
pub trait Embedder: Send + Sync {
    /// Embed `texts`, returning exactly one vector per input in input order
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Builds embedder instances from a shared model identity
pub trait EmbedderFactory: Send + Sync {
    fn model_name(&self) -> &str;

    /// Number of accelerators workers may bind to
    fn accelerator_count(&self) -> usize;

    /// Check that the model can be served before any work is scheduled
    fn probe(&self) -> Result<()>;

    fn create(&self, binding: DeviceBinding) -> Result<Box<dyn Embedder>>;
}

/// Scale `vector` to unit length in place. The zero vector is left unchanged.
#[inline]
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Shared query-time embedder, created on first use.
///
/// `reset` drops the cached instance so the next call picks up new configuration.
pub struct EmbedderHandle {
    factory: RwLock<Arc<dyn EmbedderFactory>>,
    cached: RwLock<Option<Arc<dyn Embedder>>>,
}

impl EmbedderHandle {
    #[inline]
    pub fn new(factory: Arc<dyn EmbedderFactory>) -> Self {
        Self {
            factory: RwLock::new(factory),
            cached: RwLock::new(None),
        }
    }

    #[inline]
    pub fn get(&self) -> Result<Arc<dyn Embedder>> {
        {
            let cached = self
                .cached
                .read()
                .map_err(|_| anyhow!("Embedder cache lock poisoned"))?;
            if let Some(embedder) = cached.as_ref() {
                return Ok(Arc::clone(embedder));
            }
        }

        let factory = {
            let factory = self
                .factory
                .read()
                .map_err(|_| anyhow!("Embedder factory lock poisoned"))?;
            Arc::clone(&factory)
        };
        debug!("Creating query embedder for {}", factory.model_name());
        let embedder: Arc<dyn Embedder> = Arc::from(factory.create(DeviceBinding::Auto)?);

        let mut cached = self
            .cached
            .write()
            .map_err(|_| anyhow!("Embedder cache lock poisoned"))?;
        Ok(Arc::clone(cached.get_or_insert(embedder)))
    }

    #[inline]
    pub fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = self.get()?;
        let mut vectors = embedder.embed_batch(&[text.to_string()])?;
        if vectors.len() != 1 {
            return Err(anyhow!(
                "Expected one query embedding, got {}",
                vectors.len()
            ));
        }
        Ok(vectors.remove(0))
    }

    #[inline]
    pub fn reset(&self) {
        if let Ok(mut cached) = self.cached.write() {
            *cached = None;
        }
    }

    /// Swap in a new factory and drop the cached embedder
    #[inline]
    pub fn reconfigure(&self, factory: Arc<dyn EmbedderFactory>) {
        if let Ok(mut current) = self.factory.write() {
            *current = factory;
        }
        self.reset();
    }
}
