use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::debug;

const MAX_NAME_SUFFIX: u32 = 1000;

/// One answered query, written once and never modified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub timestamp: String,
    pub input_query: String,
    pub rewritten_query: String,
    /// Context lines exactly as sent to the answer model
    pub retrieved_chunks: Vec<String>,
    pub final_answer: String,
    pub citations: BTreeMap<u64, String>,
}

impl QueryLogEntry {
    #[inline]
    pub fn new(
        at: DateTime<Local>,
        input_query: &str,
        rewritten_query: &str,
        retrieved_chunks: Vec<String>,
        final_answer: &str,
        citations: BTreeMap<u64, String>,
    ) -> Self {
        Self {
            timestamp: at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            input_query: input_query.to_string(),
            rewritten_query: rewritten_query.to_string(),
            retrieved_chunks,
            final_answer: final_answer.to_string(),
            citations,
        }
    }
}

/// Write `entry` to a new `log_YYYYmmdd-HHMMSS.jsonl` file in `dir`.
///
/// Existing logs are never overwritten; a name already taken in the same second
/// gets a `-N` suffix.
#[inline]
pub fn write_query_log(dir: &Path, at: DateTime<Local>, entry: &QueryLogEntry) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let mut line = serde_json::to_string(entry).context("Failed to serialize query log")?;
    line.push('\n');

    let stamp = at.format("%Y%m%d-%H%M%S").to_string();
    for suffix in 0..=MAX_NAME_SUFFIX {
        let name = if suffix == 0 {
            format!("log_{}.jsonl", stamp)
        } else {
            format!("log_{}-{}.jsonl", stamp, suffix)
        };
        let path = dir.join(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(line.as_bytes())
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                debug!("Query logged to {}", path.display());
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create {}", path.display()));
            }
        }
    }

    bail!(
        "Too many query logs for {} in {}",
        stamp,
        dir.display()
    )
}
