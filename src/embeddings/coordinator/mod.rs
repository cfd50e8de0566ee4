//! Sharded embedding of chunk records.
//!
//! Records are dealt round-robin into one shard per worker. Every worker owns an
//! embedder bound to its device and its own `shard_{rank}.jsonl`. After all workers
//! have joined, shards are concatenated in rank order into the merged output.


use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{DeviceBinding, DeviceMode, EmbedderFactory, l2_normalize};
use crate::records::{ChunkRecord, JsonlWriter, read_jsonl};

/// Parameters of one embedding run
#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    /// Records per embedding call
    pub batch_size: usize,
    /// Requested worker count
    pub workers: usize,
    pub device: DeviceMode,
    pub normalize: bool,
    /// Directory receiving `shard_{rank}.jsonl`
    pub shard_dir: PathBuf,
    /// Merged embedded-chunk file
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingSummary {
    pub records: usize,
    pub workers: usize,
    /// Device mode actually used after fallback
    pub device: DeviceMode,
    /// Vector dimension, `None` when nothing was embedded
    pub dimension: Option<usize>,
}

/// Deal `items` round-robin into `shards` partitions: shard `r` holds items
/// `r, r + shards, r + 2 * shards, ...` in their original relative order.
#[inline]
pub fn partition<T: Clone>(items: &[T], shards: usize) -> Vec<Vec<T>> {
    let shards = shards.max(1);
    (0..shards)
        .map(|rank| items.iter().skip(rank).step_by(shards).cloned().collect())
        .collect()
}

/// Decide the effective device mode and worker count.
///
/// GPU mode without accelerators falls back to CPU. The count never exceeds the
/// number of items or, in GPU mode, the number of accelerators, and is at least 1.
#[inline]
pub fn resolve_worker_count(
    requested: usize,
    device: DeviceMode,
    accelerators: usize,
    items: usize,
) -> (DeviceMode, usize) {
    let (device, limit) = match device {
        DeviceMode::Gpu if accelerators == 0 => {
            warn!("No GPUs detected; falling back to CPU");
            (DeviceMode::Cpu, usize::MAX)
        }
        DeviceMode::Gpu => (DeviceMode::Gpu, accelerators),
        DeviceMode::Cpu => (DeviceMode::Cpu, usize::MAX),
    };

    let workers = requested.min(limit).min(items).max(1);
    (device, workers)
}

/// Embed every record of `input` (a chunk JSONL file) into `job.output`.
///
/// Any worker failure fails the whole run; shard files are left behind for the
/// caller to clean up.
#[inline]
pub async fn embed_chunks(
    input: &Path,
    factory: Arc<dyn EmbedderFactory>,
    job: &EmbeddingJob,
) -> Result<EmbeddingSummary> {
    let records: Vec<ChunkRecord> = read_jsonl(input)?;
    for record in &records {
        record.ensure_supported()?;
    }

    if records.is_empty() {
        warn!("No entries found to embed");
        JsonlWriter::create(&job.output)?.finish()?;
        return Ok(EmbeddingSummary {
            records: 0,
            workers: 0,
            device: job.device,
            dimension: None,
        });
    }

    let (device, workers) = resolve_worker_count(
        job.workers,
        job.device,
        factory.accelerator_count(),
        records.len(),
    );
    info!(
        "Embedding {} chunks with {} {} workers using {}",
        records.len(),
        workers,
        device,
        factory.model_name()
    );

    fs::create_dir_all(&job.shard_dir).with_context(|| {
        format!(
            "Failed to create shard directory: {}",
            job.shard_dir.display()
        )
    })?;

    let progress = if console::user_attended_stderr() {
        MultiProgress::new()
    } else {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    };
    let style = ProgressStyle::with_template("{prefix} [{bar:30}] {pos}/{len} chunks")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");

    let shards = partition(&records, workers);
    let mut tasks = JoinSet::new();

    for (rank, shard) in shards.into_iter().enumerate() {
        let binding = match device {
            DeviceMode::Gpu => DeviceBinding::Accelerator(rank),
            DeviceMode::Cpu => DeviceBinding::Cpu,
        };
        let worker = ShardWorker {
            rank,
            binding,
            batch_size: job.batch_size.max(1),
            normalize: job.normalize,
            path: shard_path(&job.shard_dir, rank),
            bar: progress.add(
                ProgressBar::new(shard.len() as u64)
                    .with_style(style.clone())
                    .with_prefix(format!("worker {}", rank)),
            ),
        };
        let factory = Arc::clone(&factory);
        tasks.spawn_blocking(move || worker.run(factory.as_ref(), shard));
    }

    // Join barrier: every worker must finish before anything is merged
    let mut outcomes = Vec::with_capacity(workers);
    while let Some(joined) = tasks.join_next().await {
        outcomes.push(joined);
    }

    let mut shard_outcomes = Vec::with_capacity(workers);
    for outcome in outcomes {
        shard_outcomes.push(outcome.context("Embedding worker panicked")??);
    }
    shard_outcomes.sort_by_key(|o| o.rank);

    let dimension = consistent_dimension(&shard_outcomes)?;
    let merged = merge_shards(&job.shard_dir, workers, &job.output)?;
    if merged != records.len() {
        bail!(
            "Merged {} embedded records but {} chunks were submitted",
            merged,
            records.len()
        );
    }

    info!(
        "Embeddings written to {} ({} records, dimension {})",
        job.output.display(),
        merged,
        dimension.unwrap_or_default()
    );

    Ok(EmbeddingSummary {
        records: merged,
        workers,
        device,
        dimension,
    })
}

/// `shard_{rank}.jsonl` inside `dir`
#[inline]
pub fn shard_path(dir: &Path, rank: usize) -> PathBuf {
    dir.join(format!("shard_{}.jsonl", rank))
}

/// Concatenate shard files in rank order. Returns the number of records written.
#[inline]
pub fn merge_shards(shard_dir: &Path, shards: usize, output: &Path) -> Result<usize> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let out = File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let mut writer = BufWriter::new(out);
    let mut lines = 0;

    for rank in 0..shards {
        let path = shard_path(shard_dir, rank);
        let content =
            fs::read(&path).with_context(|| format!("Missing shard file {}", path.display()))?;

        lines += content.iter().filter(|&&b| b == b'\n').count();
        writer
            .write_all(&content)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        debug!("Merged shard {} from {}", rank, path.display());
    }

    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", output.display()))?;
    Ok(lines)
}

fn consistent_dimension(outcomes: &[ShardOutcome]) -> Result<Option<usize>> {
    let mut dimension = None;
    for outcome in outcomes {
        match (dimension, outcome.dimension) {
            (None, found) => dimension = found,
            (Some(expected), Some(found)) if expected != found => {
                return Err(anyhow!(
                    "Worker {} produced {}-dimensional vectors, expected {}",
                    outcome.rank,
                    found,
                    expected
                ));
            }
            _ => {}
        }
    }
    Ok(dimension)
}

struct ShardWorker {
    rank: usize,
    binding: DeviceBinding,
    batch_size: usize,
    normalize: bool,
    path: PathBuf,
    bar: ProgressBar,
}

struct ShardOutcome {
    rank: usize,
    dimension: Option<usize>,
}

impl ShardWorker {
    fn run(self, factory: &dyn EmbedderFactory, shard: Vec<ChunkRecord>) -> Result<ShardOutcome> {
        let embedder = factory
            .create(self.binding)
            .with_context(|| format!("Worker {} failed to load the embedding model", self.rank))?;
        let mut writer = JsonlWriter::create(&self.path)?;
        let mut dimension: Option<usize> = None;

        debug!(
            "Worker {} embedding {} chunks on {:?}",
            self.rank,
            shard.len(),
            self.binding
        );

        for batch in shard.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|r| r.text.clone()).collect();
            let vectors = embedder
                .embed_batch(&texts)
                .with_context(|| format!("Worker {} failed to embed a batch", self.rank))?;

            if vectors.len() != batch.len() {
                bail!(
                    "Worker {} received {} vectors for {} texts",
                    self.rank,
                    vectors.len(),
                    batch.len()
                );
            }

            for (record, mut vector) in batch.iter().zip(vectors) {
                let expected = *dimension.get_or_insert(vector.len());
                if vector.len() != expected || expected == 0 {
                    bail!(
                        "Worker {} received a {}-dimensional vector, expected {}",
                        self.rank,
                        vector.len(),
                        expected
                    );
                }
                if self.normalize {
                    l2_normalize(&mut vector);
                }
                writer.append(&record.clone().with_embedding(vector))?;
            }
            writer.flush()?;
            self.bar.inc(batch.len() as u64);
        }

        writer.finish()?;
        self.bar.finish();
        Ok(ShardOutcome {
            rank: self.rank,
            dimension,
        })
    }
}
