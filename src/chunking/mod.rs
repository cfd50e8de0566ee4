
pub mod tokenizer;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::records::{ChunkRecord, DOI_NOT_FOUND, JsonlWriter};

pub use tokenizer::{
    DEFAULT_TOKENIZER, HEURISTIC_TOKENIZER, HeuristicCounter, HfTokenCounter, TokenCounter,
    estimate_token_count, load_token_counter,
};

/// Represents a chunk of document text ready for embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChunk {
    pub text: String,
    /// The index of this chunk within its document
    pub chunk_index: usize,
    /// Token count of the joined text
    pub token_count: usize,
    /// Paragraph range `[start, end)` this chunk was built from
    pub paragraphs: (usize, usize),
}

/// Configuration for paragraph grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// A chunk is closed once its paragraphs sum to at least this many tokens
    pub min_tokens: usize,
    /// Number of trailing paragraphs shared with the next chunk
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            min_tokens: 500,
            overlap: 1,
        }
    }
}

/// Split extracted text into paragraphs.
///
/// Paragraphs are separated by blank lines and their lines are joined with single
/// spaces. Text without any blank line is treated as one paragraph per line.
#[inline]
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let mut blocks: Vec<Vec<&str>> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }

    if blocks.len() == 1 {
        return blocks
            .into_iter()
            .flatten()
            .map(str::to_string)
            .collect();
    }

    blocks
        .into_iter()
        .map(|lines| lines.join(" "))
        .filter(|p| !p.is_empty())
        .collect()
}

/// Group consecutive paragraphs into overlapping chunks of at least `min_tokens`.
///
/// Starting at paragraph `i`, paragraphs are accumulated until their summed counts
/// reach the minimum or the document ends. The joined text is re-encoded for the
/// recorded count, and the window advances by `max(1, consumed - overlap)`.
#[inline]
pub fn group_paragraphs(
    paragraphs: &[String],
    counter: &dyn TokenCounter,
    config: &ChunkingConfig,
) -> Result<Vec<ContentChunk>> {
    // A paragraph can take part in several windows; count each one once.
    let paragraph_tokens = paragraphs
        .iter()
        .map(|p| counter.count(p))
        .collect::<Result<Vec<_>>>()?;

    let mut chunks = Vec::new();
    let mut i = 0;

    while i < paragraphs.len() {
        let mut token_count = 0;
        let mut j = i;
        while j < paragraphs.len() {
            token_count += paragraph_tokens[j];
            j += 1;
            if token_count >= config.min_tokens {
                break;
            }
        }

        let text = paragraphs[i..j].join(" ");
        let token_count = counter.count(&text)?;
        chunks.push(ContentChunk {
            text,
            chunk_index: chunks.len(),
            token_count,
            paragraphs: (i, j),
        });

        let consumed = j - i;
        i += consumed.saturating_sub(config.overlap).max(1);
    }

    Ok(chunks)
}

/// Chunk one extracted text file into records
#[inline]
pub fn chunk_text_file(
    path: &Path,
    doi: &str,
    title: &str,
    counter: &dyn TokenCounter,
    config: &ChunkingConfig,
) -> Result<Vec<ChunkRecord>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let source_file = file_name(path);

    let paragraphs = split_paragraphs(&text);
    let chunks = group_paragraphs(&paragraphs, counter, config)?;

    debug!(
        "Chunked '{}' into {} chunks (avg {} tokens)",
        source_file,
        chunks.len(),
        chunks.iter().map(|c| c.token_count).sum::<usize>() / chunks.len().max(1)
    );

    Ok(chunks
        .into_iter()
        .map(|chunk| {
            ChunkRecord::new(
                source_file.clone(),
                chunk.chunk_index,
                doi,
                title,
                chunk.text,
                chunk.token_count,
            )
        })
        .collect())
}

/// Outcome of chunking a directory of text files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkingSummary {
    pub files: usize,
    pub chunks: usize,
    /// Files that failed to chunk and were skipped
    pub failed: Vec<String>,
}

/// Chunk every `*.txt` file of `txt_dir` into `output`, in sorted filename order.
///
/// Files are processed on up to `workers` blocking tasks. A file that fails is logged
/// and skipped. `doi_map` is keyed by text file name; titles default to the file stem.
#[inline]
pub async fn chunk_directory(
    txt_dir: &Path,
    doi_map: &HashMap<String, String>,
    counter: Arc<dyn TokenCounter>,
    config: ChunkingConfig,
    workers: usize,
    output: &Path,
) -> Result<ChunkingSummary> {
    let files = list_text_files(txt_dir)?;
    let mut writer = JsonlWriter::create(output)?;
    let mut summary = ChunkingSummary::default();

    if files.is_empty() {
        warn!("No text files found to chunk in {}", txt_dir.display());
        writer.finish()?;
        return Ok(summary);
    }

    info!(
        "Chunking {} files with {} workers (min {} tokens, overlap {})",
        files.len(),
        workers.max(1),
        config.min_tokens,
        config.overlap
    );

    let tasks = files.into_iter().map(|path| {
        let name = file_name(&path);
        let doi = doi_map
            .get(&name)
            .cloned()
            .unwrap_or_else(|| DOI_NOT_FOUND.to_string());
        let title = file_stem(&path);
        let counter = Arc::clone(&counter);

        async move {
            let result = tokio::task::spawn_blocking(move || {
                chunk_text_file(&path, &doi, &title, counter.as_ref(), &config)
            })
            .await
            .context("Chunking task panicked")
            .and_then(|r| r);
            (name, result)
        }
    });

    // `buffered` yields in submission order, so output stays in filename order
    let mut results = stream::iter(tasks).buffered(workers.max(1));

    while let Some((name, result)) = results.next().await {
        match result {
            Ok(records) => {
                for record in &records {
                    writer.append(record)?;
                }
                debug!("{} processed with {} chunks", name, records.len());
                summary.files += 1;
                summary.chunks += records.len();
            }
            Err(e) => {
                warn!("Failed to process {}: {:#}", name, e);
                summary.failed.push(name);
            }
        }
    }

    writer.finish()?;
    info!(
        "Chunked {} files into {} chunks ({} failed)",
        summary.files,
        summary.chunks,
        summary.failed.len()
    );

    Ok(summary)
}

/// Sorted `*.txt` files directly inside `dir`
#[inline]
pub fn list_text_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("Failed to read directory {}", dir.display()))?
            .path();
        let is_txt = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"));
        if is_txt && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
