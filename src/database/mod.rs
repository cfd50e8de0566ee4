//! Named databases on disk: directory layout, listing and cached loading.


use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::LibrarianError;
use crate::index::{FlatIndex, INDEX_FILE, IndexArtifacts, METADATA_FILE, MetadataStore};

/// Artifact paths of one database directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseLayout {
    root: PathBuf,
}

impl DatabaseLayout {
    #[inline]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Raw source documents
    #[inline]
    pub fn documents_dir(&self) -> PathBuf {
        self.root.join("documents")
    }

    /// Extracted plain text, one file per document
    #[inline]
    pub fn txt_dir(&self) -> PathBuf {
        self.root.join("txt")
    }

    #[inline]
    pub fn metadata_csv(&self) -> PathBuf {
        self.root.join("metadata.csv")
    }

    #[inline]
    pub fn chunks_file(&self) -> PathBuf {
        self.root.join("chunks.jsonl")
    }

    #[inline]
    pub fn shard_dir(&self) -> PathBuf {
        self.root.join("output_shards")
    }

    #[inline]
    pub fn embedded_file(&self) -> PathBuf {
        self.root.join("embedded_chunks.jsonl")
    }

    #[inline]
    pub fn index_file(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    #[inline]
    pub fn metadata_file(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    #[inline]
    pub fn artifacts(&self) -> IndexArtifacts {
        IndexArtifacts::in_dir(&self.root)
    }

    /// A database is queryable once its index artifact exists
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.index_file().is_file()
    }
}

/// Accept `[A-Za-z0-9._-]+`, except `.` and `..`
#[inline]
pub fn validate_name(name: &str) -> Result<(), LibrarianError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if name.is_empty() || !valid_chars || name == "." || name == ".." {
        return Err(LibrarianError::Validation(format!(
            "invalid database name '{}' (use letters, digits, '.', '_' or '-')",
            name
        )));
    }
    Ok(())
}

/// An index and its metadata, loaded for querying
#[derive(Debug)]
pub struct LoadedDatabase {
    pub name: String,
    pub path: PathBuf,
    pub index: FlatIndex,
    pub metadata: MetadataStore,
}

impl LoadedDatabase {
    #[inline]
    pub fn load(name: &str, layout: &DatabaseLayout) -> Result<Self> {
        let index = FlatIndex::load(&layout.index_file())
            .with_context(|| format!("Failed to load index of database '{}'", name))?;
        let metadata = MetadataStore::load(&layout.metadata_file())
            .with_context(|| format!("Failed to load metadata of database '{}'", name))?;

        if index.len() != metadata.len() {
            return Err(anyhow!(
                "Database '{}' is inconsistent: {} index rows but {} metadata rows",
                name,
                index.len(),
                metadata.len()
            ));
        }

        Ok(Self {
            name: name.to_string(),
            path: layout.root().to_path_buf(),
            index,
            metadata,
        })
    }
}

/// All databases under one root directory
#[derive(Debug)]
pub struct Catalog {
    root: PathBuf,
    cache: RwLock<HashMap<String, Arc<LoadedDatabase>>>,
}

impl Catalog {
    #[inline]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn layout(&self, name: &str) -> Result<DatabaseLayout, LibrarianError> {
        validate_name(name)?;
        Ok(DatabaseLayout::new(self.root.join(name)))
    }

    /// Sorted names of databases whose index artifact exists
    #[inline]
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read {}", self.root.display()))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to read {}", self.root.display()))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if validate_name(name).is_ok() && DatabaseLayout::new(&path).is_ready() {
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    /// Load a database for querying, reusing a cached copy while its index exists
    #[inline]
    pub fn load(&self, name: &str) -> Result<Arc<LoadedDatabase>> {
        let layout = self.layout(name)?;

        if !layout.is_ready() {
            self.evict(name);
            return Err(LibrarianError::InputNotFound(format!("database '{}'", name)).into());
        }

        if let Some(cached) = self.cached(name)? {
            return Ok(cached);
        }

        debug!("Loading database '{}' from {}", name, layout.root().display());
        let loaded = Arc::new(LoadedDatabase::load(name, &layout)?);
        info!(
            "Loaded database '{}' ({} chunks, dimension {})",
            name,
            loaded.index.len(),
            loaded.index.dimension()
        );

        let mut cache = self
            .cache
            .write()
            .map_err(|_| anyhow!("Database cache lock poisoned"))?;
        Ok(Arc::clone(
            cache.entry(name.to_string()).or_insert(loaded),
        ))
    }

    /// Drop a cached database so the next load reads it from disk
    #[inline]
    pub fn evict(&self, name: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(name);
        }
    }

    fn cached(&self, name: &str) -> Result<Option<Arc<LoadedDatabase>>> {
        let cache = self
            .cache
            .read()
            .map_err(|_| anyhow!("Database cache lock poisoned"))?;
        Ok(cache.get(name).map(Arc::clone))
    }
}
