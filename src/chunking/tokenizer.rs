use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::LibrarianError;

/// Tokenizer identifier that selects [`HeuristicCounter`]
pub const HEURISTIC_TOKENIZER: &str = "heuristic";

/// Hub identifier of the `cl100k_base` vocabulary
pub const DEFAULT_TOKENIZER: &str = "Xenova/gpt-4";

/// Counts tokens in a piece of text.
///
/// Implementations must be deterministic: the same text always yields the same count.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> Result<usize>;

    fn name(&self) -> &str;
}

/// Word and punctuation based estimate, for environments without a vocabulary file
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    #[inline]
    fn count(&self, text: &str) -> Result<usize> {
        Ok(estimate_token_count(text))
    }

    #[inline]
    fn name(&self) -> &str {
        HEURISTIC_TOKENIZER
    }
}

/// Estimate token count using a simple heuristic
#[inline]
pub fn estimate_token_count(text: &str) -> usize {
    // 1 token ≈ 0.75 words for English text, plus a little for punctuation
    let word_count = text.split_whitespace().count();
    let punct_count = text.chars().filter(|c| c.is_ascii_punctuation()).count();

    (punct_count as f64).mul_add(0.1, word_count as f64 / 0.75) as usize
}

/// Exact counts from a HuggingFace `tokenizers` vocabulary
pub struct HfTokenCounter {
    name: String,
    tokenizer: Tokenizer,
}

impl HfTokenCounter {
    #[inline]
    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", path.display(), e))?;
        Ok(Self {
            name: path.display().to_string(),
            tokenizer,
        })
    }

    #[inline]
    pub fn from_pretrained(identifier: &str) -> Result<Self> {
        let tokenizer = Tokenizer::from_pretrained(identifier, None)
            .map_err(|e| anyhow!("Failed to fetch tokenizer '{}': {}", identifier, e))?;
        Ok(Self {
            name: identifier.to_string(),
            tokenizer,
        })
    }
}

impl TokenCounter for HfTokenCounter {
    #[inline]
    fn count(&self, text: &str) -> Result<usize> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Tokenizer '{}' failed to encode text: {}", self.name, e))?;
        Ok(encoding.len())
    }

    #[inline]
    fn name(&self) -> &str {
        &self.name
    }
}

/// Resolve a tokenizer identifier.
///
/// `"heuristic"` selects the estimate, an existing path loads a `tokenizer.json`,
/// anything else is fetched from the HuggingFace hub.
#[inline]
pub fn load_token_counter(identifier: &str) -> Result<Arc<dyn TokenCounter>> {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return Err(LibrarianError::Validation("tokenizer identifier must not be empty".into()).into());
    }

    if identifier.eq_ignore_ascii_case(HEURISTIC_TOKENIZER) {
        debug!("Using heuristic token counter");
        return Ok(Arc::new(HeuristicCounter));
    }

    let path = Path::new(identifier);
    let counter = if path.is_file() {
        HfTokenCounter::from_file(path)
    } else {
        HfTokenCounter::from_pretrained(identifier)
    }
    .map_err(|e| LibrarianError::DependencyUnavailable(format!("{:#}", e)))?;

    info!("Loaded tokenizer {}", counter.name());
    Ok(Arc::new(counter))
}
