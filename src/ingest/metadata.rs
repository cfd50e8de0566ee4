use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::LibrarianError;
use crate::chunking::list_text_files;
use crate::records::DOI_NOT_FOUND;

static DOI_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b10\.\d{4,9}/[^\s"<>]+"#).expect("regex is valid")
});

/// One row of `metadata.csv`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Name of the extracted text file
    pub filename: String,
    pub doi: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
}

/// First DOI in `text`, or `"not found"`
#[inline]
pub fn extract_doi(text: &str) -> String {
    match DOI_REGEX.find(text) {
        Ok(Some(m)) => m.as_str().to_string(),
        _ => DOI_NOT_FOUND.to_string(),
    }
}

/// Scan every text file in `txt_dir` for a DOI and write the results to `output`
#[inline]
pub fn write_metadata_csv(
    txt_dir: &Path,
    output: &Path,
    include_relative_path: bool,
) -> Result<Vec<DocumentMetadata>> {
    let mut rows = Vec::new();
    for path in list_text_files(txt_dir)? {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let doi = match fs::read(&path) {
            Ok(bytes) => extract_doi(&String::from_utf8_lossy(&bytes)),
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                DOI_NOT_FOUND.to_string()
            }
        };
        let relative_path = include_relative_path.then(|| {
            path.strip_prefix(txt_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned()
        });
        debug!("{} -> {}", filename, doi);
        rows.push(DocumentMetadata {
            filename,
            doi,
            relative_path,
        });
    }

    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    if include_relative_path {
        writer.write_record(["filename", "doi", "relative_path"])?;
    } else {
        writer.write_record(["filename", "doi"])?;
    }
    for row in &rows {
        match &row.relative_path {
            Some(relative) => writer.write_record([&row.filename, &row.doi, relative])?,
            None => writer.write_record([&row.filename, &row.doi])?,
        }
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let found = rows.iter().filter(|r| r.doi != DOI_NOT_FOUND).count();
    info!(
        "Wrote {} ({} of {} documents have a DOI)",
        output.display(),
        found,
        rows.len()
    );
    Ok(rows)
}

/// Map of text file name to DOI read back from `metadata.csv`
#[inline]
pub fn read_doi_map(path: &Path) -> Result<HashMap<String, String>> {
    if !path.is_file() {
        return Err(LibrarianError::InputNotFound(path.display().to_string()).into());
    }

    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut map = HashMap::new();
    for row in reader.deserialize::<DocumentMetadata>() {
        let row = row.with_context(|| format!("Malformed row in {}", path.display()))?;
        map.insert(row.filename, row.doi);
    }
    Ok(map)
}
