// Source discovery, cleanup and reorganization ahead of text extraction

pub mod extract;
pub mod metadata;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use extract::{CommandExtractor, ExtractionSummary, TextExtractor, extract_all};
pub use metadata::{DocumentMetadata, extract_doi, read_doi_map, write_metadata_csv};

/// File extensions recognised as source documents
pub const SOURCE_EXTENSIONS: [&str; 3] = ["pdf", "txt", "md"];

/// How far to look for macOS metadata files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    #[default]
    Recursive,
    Shallow,
    Off,
}

/// What to do with source documents once a database directory exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrganizeMode {
    #[default]
    Copy,
    Move,
    Skip,
}

/// Kind of a source document, decided by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    PlainText,
}

impl SourceKind {
    #[inline]
    pub fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("pdf") {
            Some(Self::Pdf)
        } else if ext.eq_ignore_ascii_case("txt") || ext.eq_ignore_ascii_case("md") {
            Some(Self::PlainText)
        } else {
            None
        }
    }
}

fn is_macos_metadata(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name == ".DS_Store" || name.starts_with("._"))
}

/// Delete `._*` and `.DS_Store` files below `source`. Returns how many were removed.
#[inline]
pub fn cleanup_metadata_files(source: &Path, mode: CleanupMode) -> Result<usize> {
    if mode == CleanupMode::Off || !source.is_dir() {
        return Ok(0);
    }

    let base = glob::Pattern::escape(&source.to_string_lossy());
    let prefix = if mode == CleanupMode::Recursive {
        format!("{}/**", base)
    } else {
        base
    };

    let mut removed = 0;
    for pattern in [format!("{}/._*", prefix), format!("{}/.DS_Store", prefix)] {
        let paths = glob::glob(&pattern)
            .with_context(|| format!("Invalid cleanup pattern {}", pattern))?;
        for path in paths.flatten() {
            if path.is_file() && is_macos_metadata(&path) {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                debug!("Removed metadata file {}", path.display());
                removed += 1;
            }
        }
    }

    if removed > 0 {
        info!("Removed {} macOS metadata files from {}", removed, source.display());
    }
    Ok(removed)
}

/// Sorted source documents at `source`, which may be a single file or a directory
#[inline]
pub fn discover_sources(source: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    if source.is_file() {
        return Ok(SourceKind::of(source)
            .map(|_| vec![source.to_path_buf()])
            .unwrap_or_default());
    }

    let base = glob::Pattern::escape(&source.to_string_lossy());
    let pattern = if recursive {
        format!("{}/**/*", base)
    } else {
        format!("{}/*", base)
    };

    let mut sources: Vec<PathBuf> = glob::glob(&pattern)
        .with_context(|| format!("Invalid source pattern {}", pattern))?
        .flatten()
        .filter(|path| path.is_file() && !is_macos_metadata(path))
        .filter(|path| SourceKind::of(path).is_some())
        .collect();
    sources.sort();

    debug!("Discovered {} source documents in {}", sources.len(), source.display());
    Ok(sources)
}

/// Place `sources` under `documents_dir`, keeping their layout relative to `source_root`.
/// Returns where each document can be read from afterwards, in input order.
#[inline]
pub fn organize_sources(
    sources: &[PathBuf],
    source_root: &Path,
    documents_dir: &Path,
    mode: OrganizeMode,
) -> Result<Vec<PathBuf>> {
    if mode == OrganizeMode::Skip {
        return Ok(sources.to_vec());
    }

    let mut placed = Vec::with_capacity(sources.len());
    let mut seen = HashSet::new();

    for source in sources {
        let relative = source
            .strip_prefix(source_root)
            .ok()
            .filter(|r| !r.as_os_str().is_empty())
            .map_or_else(
                || PathBuf::from(source.file_name().unwrap_or_default()),
                Path::to_path_buf,
            );
        let target = documents_dir.join(&relative);
        if !seen.insert(target.clone()) {
            warn!("Skipping duplicate document {}", source.display());
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        match mode {
            OrganizeMode::Copy => {
                fs::copy(source, &target).with_context(|| {
                    format!("Failed to copy {} to {}", source.display(), target.display())
                })?;
            }
            OrganizeMode::Move => move_file(source, &target)?,
            OrganizeMode::Skip => {}
        }
        placed.push(target);
    }

    info!(
        "Organized {} documents into {} ({:?})",
        placed.len(),
        documents_dir.display(),
        mode
    );
    Ok(placed)
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Rename fails across filesystems
    fs::copy(from, to)
        .with_context(|| format!("Failed to move {} to {}", from.display(), to.display()))?;
    fs::remove_file(from).with_context(|| format!("Failed to remove {}", from.display()))
}
