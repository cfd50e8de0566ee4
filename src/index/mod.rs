//! Exact nearest-neighbour index over chunk embeddings, and its on-disk artifacts.
//!
//! `vector_index.bin` layout, all little-endian:
//! magic `b"LBVX"`, format version (u32), metric tag (u32), dimension (u32),
//! row count (u64), then `count * dimension` f32 values in row-major order.
//!
//! `vector_metadata.bin` is a bincode-encoded [`MetadataStore`] whose row *i*
//! describes index row *i*.


use std::cmp::Ordering;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::LibrarianError;
use crate::embeddings::l2_normalize;
use crate::records::{ChunkRecord, EmbeddedChunkRecord, RECORD_SCHEMA_VERSION, for_each_jsonl};

pub const INDEX_FILE: &str = "vector_index.bin";
pub const METADATA_FILE: &str = "vector_metadata.bin";

const INDEX_MAGIC: [u8; 4] = *b"LBVX";
const INDEX_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 4 + 8;

/// Identifier reported for result slots beyond the number of indexed rows
pub const MISSING_ID: i64 = -1;

/// Similarity used by an index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Squared Euclidean distance, smaller is closer
    #[default]
    L2,
    /// Inner product over unit vectors, larger is closer
    Cosine,
}

impl Metric {
    const fn tag(self) -> u32 {
        match self {
            Self::L2 => 0,
            Self::Cosine => 1,
        }
    }

    fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Self::L2),
            1 => Ok(Self::Cosine),
            other => bail!("Unknown metric tag {}", other),
        }
    }
}

impl fmt::Display for Metric {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L2 => f.write_str("l2"),
            Self::Cosine => f.write_str("cosine"),
        }
    }
}

/// One result slot of a search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    /// Row number, or [`MISSING_ID`]
    pub id: i64,
    pub score: f32,
}

/// Brute-force index holding every vector in one contiguous buffer
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    metric: Metric,
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    #[inline]
    pub fn new(metric: Metric, dimension: usize) -> Self {
        Self {
            metric,
            dimension,
            data: Vec::new(),
        }
    }

    #[inline]
    pub fn metric(&self) -> Metric {
        self.metric
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append one row. Cosine indexes store the normalized vector.
    #[inline]
    pub fn add(&mut self, vector: &[f32]) -> Result<()> {
        if vector.is_empty() {
            bail!("Cannot index an empty vector");
        }
        if vector.len() != self.dimension {
            bail!(
                "Vector has dimension {}, index expects {}",
                vector.len(),
                self.dimension
            );
        }
        let start = self.data.len();
        self.data.extend_from_slice(vector);
        if self.metric == Metric::Cosine {
            l2_normalize(&mut self.data[start..]);
        }
        Ok(())
    }

    #[inline]
    pub fn row(&self, id: usize) -> Option<&[f32]> {
        let start = id.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Return exactly `k` slots ordered best first.
    /// Slots beyond the row count carry [`MISSING_ID`].
    #[inline]
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(LibrarianError::Validation(format!(
                "query has dimension {}, index expects {}",
                query.len(),
                self.dimension
            ))
            .into());
        }

        let mut query = query.to_vec();
        if self.metric == Metric::Cosine {
            l2_normalize(&mut query);
        }

        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dimension.max(1))
            .enumerate()
            .map(|(id, row)| (id, self.score(&query, row)))
            .collect();

        scored.sort_by(|a, b| self.compare(a.1, b.1).then(a.0.cmp(&b.0)));

        let padding = match self.metric {
            Metric::L2 => f32::MAX,
            Metric::Cosine => -f32::MAX,
        };
        let mut hits: Vec<SearchHit> = scored
            .into_iter()
            .take(k)
            .map(|(id, score)| SearchHit {
                id: id as i64,
                score,
            })
            .collect();
        hits.resize(
            k,
            SearchHit {
                id: MISSING_ID,
                score: padding,
            },
        );
        Ok(hits)
    }

    fn score(&self, query: &[f32], row: &[f32]) -> f32 {
        match self.metric {
            Metric::L2 => query
                .iter()
                .zip(row)
                .map(|(q, r)| (q - r) * (q - r))
                .sum(),
            Metric::Cosine => query.iter().zip(row).map(|(q, r)| q * r).sum(),
        }
    }

    fn compare(&self, a: f32, b: f32) -> Ordering {
        match self.metric {
            Metric::L2 => a.total_cmp(&b),
            Metric::Cosine => b.total_cmp(&a),
        }
    }

    /// Write the index to `path` through a temporary file and rename
    #[inline]
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomically(path, |writer| {
            writer.write_all(&INDEX_MAGIC)?;
            writer.write_all(&INDEX_VERSION.to_le_bytes())?;
            writer.write_all(&self.metric.tag().to_le_bytes())?;
            writer.write_all(&(self.dimension as u32).to_le_bytes())?;
            writer.write_all(&(self.len() as u64).to_le_bytes())?;
            for value in &self.data {
                writer.write_all(&value.to_le_bytes())?;
            }
            Ok(())
        })
    }

    #[inline]
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_LEN];
        reader
            .read_exact(&mut header)
            .with_context(|| format!("Truncated index header in {}", path.display()))?;

        if header[0..4] != INDEX_MAGIC {
            bail!("{} is not a vector index", path.display());
        }
        let version = read_u32(&header[4..8]);
        if version != INDEX_VERSION {
            bail!(
                "{} has index format version {}, expected {}",
                path.display(),
                version,
                INDEX_VERSION
            );
        }
        let metric = Metric::from_tag(read_u32(&header[8..12]))?;
        let dimension = read_u32(&header[12..16]) as usize;
        let count = u64::from_le_bytes([
            header[16], header[17], header[18], header[19], header[20], header[21], header[22],
            header[23],
        ]) as usize;

        let values = count
            .checked_mul(dimension)
            .ok_or_else(|| anyhow!("Index size overflows in {}", path.display()))?;
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if bytes.len() != values * 4 {
            bail!(
                "{} holds {} bytes of vectors, header promises {}",
                path.display(),
                bytes.len(),
                values * 4
            );
        }

        let data = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(Self {
            metric,
            dimension,
            data,
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Row summaries aligned 1:1 with index rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataStore {
    pub schema_version: u16,
    pub rows: Vec<ChunkRecord>,
}

impl MetadataStore {
    #[inline]
    pub fn new(rows: Vec<ChunkRecord>) -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            rows,
        }
    }

    #[inline]
    pub fn get(&self, id: i64) -> Option<&ChunkRecord> {
        usize::try_from(id).ok().and_then(|i| self.rows.get(i))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[inline]
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomically(path, |writer| {
            bincode::serde::encode_into_std_write(self, writer, bincode::config::standard())
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            Ok(())
        })
    }

    #[inline]
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let store: Self =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| anyhow!("Failed to decode {}: {}", path.display(), e))?;

        if store.schema_version > RECORD_SCHEMA_VERSION {
            bail!(
                "{} has metadata schema version {}, newest supported is {}",
                path.display(),
                store.schema_version,
                RECORD_SCHEMA_VERSION
            );
        }
        Ok(store)
    }
}

fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = dir.join(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4()));

    let result = (|| -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        write(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(e).with_context(|| format!("Failed to write {}", path.display()));
    }

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))
}

/// Paths of a built index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexArtifacts {
    pub index: PathBuf,
    pub metadata: PathBuf,
}

impl IndexArtifacts {
    #[inline]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            index: dir.join(INDEX_FILE),
            metadata: dir.join(METADATA_FILE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSummary {
    pub rows: usize,
    pub dimension: usize,
    pub metric: Metric,
}

/// Stack every vector of `embedded`, in file order, into a new index and write
/// both artifacts. Metadata is written first, so an existing index file implies
/// matching metadata.
#[inline]
pub fn build_index(
    embedded: &Path,
    artifacts: &IndexArtifacts,
    metric: Metric,
) -> Result<IndexSummary> {
    let mut index: Option<FlatIndex> = None;
    let mut rows = Vec::new();

    for_each_jsonl(embedded, |record: EmbeddedChunkRecord| {
        record.chunk.ensure_supported()?;
        let index = index.get_or_insert_with(|| FlatIndex::new(metric, record.embedding.len()));
        index
            .add(&record.embedding)
            .with_context(|| {
                format!(
                    "Embedding for {}#{} does not match the index",
                    record.chunk.source_file, record.chunk.chunk_id
                )
            })?;
        rows.push(record.chunk);
        Ok(())
    })?;

    let index = match index {
        Some(index) if !index.is_empty() => index,
        _ => {
            return Err(
                LibrarianError::EmptyEmbeddingSet(embedded.display().to_string()).into(),
            );
        }
    };

    debug!(
        "Stacked {} vectors of dimension {}",
        index.len(),
        index.dimension()
    );

    let metadata = MetadataStore::new(rows);
    metadata.save(&artifacts.metadata)?;
    index.save(&artifacts.index)?;

    info!(
        "Index built and saved to {} ({} rows, {})",
        artifacts.index.display(),
        index.len(),
        metric
    );

    Ok(IndexSummary {
        rows: index.len(),
        dimension: index.dimension(),
        metric,
    })
}
