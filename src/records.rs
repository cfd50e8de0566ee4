//! Record types that flow between pipeline stages, and their JSONL persistence.
//!
//! Every stage boundary is a JSON-lines file: one record per line, written
//! incrementally and read back sequentially in file order.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Schema version written into every record produced by this build of the crate
pub const RECORD_SCHEMA_VERSION: u16 = 1;

/// Identifier used when no document identifier could be extracted
pub const DOI_NOT_FOUND: &str = "not found";

const fn default_schema_version() -> u16 {
    RECORD_SCHEMA_VERSION
}

/// A token-bounded span of one source document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// File name of the extracted text this chunk came from
    pub source_file: String,
    /// 0-based, contiguous sequence number within `source_file`
    pub chunk_id: usize,
    /// Document identifier, or [`DOI_NOT_FOUND`]
    pub doi: String,
    pub title: String,
    pub text: String,
    /// Exact token count of `text`
    pub token_count: usize,
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
}

/// A chunk record together with its embedding vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunkRecord {
    #[serde(flatten)]
    pub chunk: ChunkRecord,
    pub embedding: Vec<f32>,
}

impl ChunkRecord {
    #[inline]
    pub fn new(
        source_file: impl Into<String>,
        chunk_id: usize,
        doi: impl Into<String>,
        title: impl Into<String>,
        text: impl Into<String>,
        token_count: usize,
    ) -> Self {
        Self {
            source_file: source_file.into(),
            chunk_id,
            doi: doi.into(),
            title: title.into(),
            text: text.into(),
            token_count,
            schema_version: RECORD_SCHEMA_VERSION,
        }
    }

    /// Reject records written by a newer, incompatible version of the pipeline
    #[inline]
    pub fn ensure_supported(&self) -> Result<()> {
        if self.schema_version > RECORD_SCHEMA_VERSION {
            bail!(
                "record {}#{} has schema version {}, newest supported is {}",
                self.source_file,
                self.chunk_id,
                self.schema_version,
                RECORD_SCHEMA_VERSION
            );
        }
        Ok(())
    }

    #[inline]
    pub fn with_embedding(self, embedding: Vec<f32>) -> EmbeddedChunkRecord {
        EmbeddedChunkRecord {
            chunk: self,
            embedding,
        }
    }
}

/// Incremental writer for a JSON-lines file
pub struct JsonlWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

impl JsonlWriter {
    /// Create (or truncate) the file at `path`
    #[inline]
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    #[inline]
    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)
            .with_context(|| format!("Failed to serialize record for {}", self.path.display()))?;
        self.writer
            .write_all(b"\n")
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        self.written += 1;
        Ok(())
    }

    /// Push buffered lines to the OS so partial progress is visible on disk
    #[inline]
    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush {}", self.path.display()))
    }

    #[inline]
    pub fn written(&self) -> usize {
        self.written
    }

    #[inline]
    pub fn finish(mut self) -> Result<usize> {
        self.flush()?;
        Ok(self.written)
    }
}

/// Read every record of a JSON-lines file, in file order
#[inline]
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut records = Vec::new();
    for_each_jsonl(path, |record| {
        records.push(record);
        Ok(())
    })?;
    Ok(records)
}

/// Stream the records of a JSON-lines file without holding them all in memory.
/// Blank lines are skipped.
#[inline]
pub fn for_each_jsonl<T, F>(path: &Path, mut f: F) -> Result<usize>
where
    T: DeserializeOwned,
    F: FnMut(T) -> Result<()>,
{
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut count = 0;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).with_context(|| {
            format!("Malformed record at {}:{}", path.display(), line_no + 1)
        })?;
        f(record)?;
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn chunk_record_uses_original_field_names() {
        let record = ChunkRecord::new("paper.txt", 3, "10.1000/xyz", "Paper", "body", 42);
        let value = serde_json::to_value(&record).expect("record should serialize");

        for field in [
            "source_file",
            "chunk_id",
            "doi",
            "title",
            "text",
            "token_count",
        ] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
    }

    #[test]
    fn missing_schema_version_defaults_to_current() {
        let line = r#"{"source_file":"a.txt","chunk_id":0,"doi":"not found","title":"a","text":"t","token_count":1}"#;
        let record: ChunkRecord = serde_json::from_str(line).expect("legacy record should parse");
        assert_eq!(record.schema_version, RECORD_SCHEMA_VERSION);
        assert!(record.ensure_supported().is_ok());
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let mut record = ChunkRecord::new("a.txt", 0, DOI_NOT_FOUND, "a", "t", 1);
        record.schema_version = RECORD_SCHEMA_VERSION + 1;
        assert!(record.ensure_supported().is_err());
    }

    #[test]
    fn embedded_record_flattens_chunk_fields() {
        let record = ChunkRecord::new("a.txt", 1, DOI_NOT_FOUND, "a", "text", 1)
            .with_embedding(vec![0.5, -0.5]);
        let json = serde_json::to_string(&record).expect("record should serialize");

        assert!(json.contains(r#""chunk_id":1"#));
        assert!(json.contains(r#""embedding":[0.5,-0.5]"#));

        let parsed: EmbeddedChunkRecord = serde_json::from_str(&json).expect("should parse back");
        assert_eq!(parsed, record);
    }

    #[test]
    fn jsonl_preserves_order_and_skips_blank_lines() {
        let temp_dir = TempDir::new().expect("should create TempDir");
        let path = temp_dir.path().join("nested").join("records.jsonl");

        let mut writer = JsonlWriter::create(&path).expect("writer should open");
        for i in 0..5 {
            writer
                .append(&ChunkRecord::new("a.txt", i, DOI_NOT_FOUND, "a", "t", i))
                .expect("append should succeed");
        }
        assert_eq!(writer.finish().expect("finish should flush"), 5);

        let mut content = fs::read_to_string(&path).expect("file should exist");
        content.push_str("\n\n");
        fs::write(&path, content).expect("rewrite should succeed");

        let records: Vec<ChunkRecord> = read_jsonl(&path).expect("records should load");
        let ids: Vec<usize> = records.iter().map(|r| r.chunk_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn malformed_line_reports_position() {
        let temp_dir = TempDir::new().expect("should create TempDir");
        let path = temp_dir.path().join("bad.jsonl");
        fs::write(&path, "{\"not\": \"a record\"}\n").expect("write should succeed");

        let error = read_jsonl::<ChunkRecord>(&path).expect_err("should fail to parse");
        assert!(error.to_string().contains("bad.jsonl:1"));
    }
}
