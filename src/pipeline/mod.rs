// Orchestrates one database build from source documents to a queryable index

pub mod lock;
pub mod options;

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::chunking::{TokenCounter, chunk_directory, load_token_counter};
use crate::database::{Catalog, DatabaseLayout, validate_name};
use crate::embeddings::{EmbedderFactory, EmbeddingJob, coordinator::embed_chunks};
use crate::index::build_index;
use crate::ingest::{
    CommandExtractor, OrganizeMode, SourceKind, TextExtractor, cleanup_metadata_files,
    discover_sources, extract_all, organize_sources, read_doi_map, write_metadata_csv,
};
use crate::records::DOI_NOT_FOUND;
use crate::{ErrorKind, LibrarianError};

pub use lock::{BuildLock, LOCK_FILE, LockStatus};
pub use options::{
    BuildOptions, ResolvedPaths, StagePaths, insert_dotted, load_overrides, parse_assignment,
};

/// Stage messages of one build, kept for the report
#[derive(Debug, Clone, Default)]
pub struct BuildLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl BuildLog {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(message);
        }
    }

    #[inline]
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseRef {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one build, successful or not
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub success: bool,
    pub logs: Vec<String>,
    /// The new database, present only on success
    pub database: Option<DatabaseRef>,
    pub error: Option<BuildError>,
}

/// Runs database builds against one catalog
pub struct PipelineOrchestrator {
    catalog: Arc<Catalog>,
    factory: Arc<dyn EmbedderFactory>,
    pdf_extractor: Option<Arc<dyn TextExtractor>>,
}

impl PipelineOrchestrator {
    #[inline]
    pub fn new(catalog: Arc<Catalog>, factory: Arc<dyn EmbedderFactory>) -> Self {
        Self {
            catalog,
            factory,
            pdf_extractor: None,
        }
    }

    /// Use `extractor` for PDFs instead of the configured extraction command
    #[inline]
    pub fn with_pdf_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.pdf_extractor = Some(extractor);
        self
    }

    #[inline]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Build database `name` from the documents at `source`.
    ///
    /// Never returns an error; failures are reported in the [`BuildReport`]. A
    /// failed build leaves no database directory behind.
    #[inline]
    pub async fn build(&self, name: &str, source: &Path, options: &BuildOptions) -> BuildReport {
        let log = BuildLog::new();

        match self.run(name, source, options, &log).await {
            Ok(path) => {
                log.record(format!("Database '{}' is ready at {}", name, path.display()));
                BuildReport {
                    success: true,
                    logs: log.entries(),
                    database: Some(DatabaseRef {
                        name: name.to_string(),
                        path,
                    }),
                    error: None,
                }
            }
            Err(e) => {
                let kind = LibrarianError::classify(&e);
                let message = format!("{:#}", e);
                error!("Build of '{}' failed: {}", name, message);
                log.record(format!("Build failed: {}", message));
                BuildReport {
                    success: false,
                    logs: log.entries(),
                    database: None,
                    error: Some(BuildError { kind, message }),
                }
            }
        }
    }

    async fn run(
        &self,
        name: &str,
        source: &Path,
        options: &BuildOptions,
        log: &BuildLog,
    ) -> Result<PathBuf> {
        validate_name(name)?;
        options.validate()?;

        let _lock = BuildLock::acquire(self.catalog.root())?;
        log.record(format!("Building database '{}' from {}", name, source.display()));

        if !source.exists() {
            return Err(LibrarianError::InputNotFound(source.display().to_string()).into());
        }

        let layout = self.catalog.layout(name)?;
        if layout.root().exists() {
            return Err(LibrarianError::Validation(format!(
                "database '{}' already exists at {}",
                name,
                layout.root().display()
            ))
            .into());
        }
        let paths = options.paths.resolve(&layout)?;

        let removed = cleanup_metadata_files(source, options.cleanup)?;
        if removed > 0 {
            log.record(format!("Removed {} macOS metadata files", removed));
        }

        let sources = discover_sources(source, options.recursive)?;
        if sources.is_empty() {
            return Err(LibrarianError::Validation(format!(
                "no PDF, TXT or MD documents found in {}",
                source.display()
            ))
            .into());
        }
        log.record(format!("Found {} source documents", sources.len()));

        let pdf_extractor = self.pdf_extractor(options)?;
        if sources
            .iter()
            .any(|s| SourceKind::of(s) == Some(SourceKind::Pdf))
        {
            pdf_extractor.probe()?;
        }
        let counter = load_token_counter(&options.tokenizer)?;
        self.factory.probe()?;
        log.record(format!(
            "Tokenizer '{}' and embedding model '{}' are available",
            counter.name(),
            self.factory.model_name()
        ));

        fs::create_dir_all(layout.root())
            .with_context(|| format!("Failed to create directory: {}", layout.root().display()))?;

        let stages = Stages {
            layout: &layout,
            paths: &paths,
            source,
            options,
            log,
        };
        match stages.run(&sources, pdf_extractor, counter, &self.factory).await {
            Ok(()) => {
                if options.organize == OrganizeMode::Move {
                    remove_originals(&sources, log);
                }
                self.catalog.evict(name);
                Ok(layout.root().to_path_buf())
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(layout.root()) {
                    warn!(
                        "Failed to remove partial database {}: {}",
                        layout.root().display(),
                        cleanup
                    );
                } else {
                    log.record(format!("Removed partial database {}", layout.root().display()));
                }
                self.catalog.evict(name);
                Err(e)
            }
        }
    }

    fn pdf_extractor(&self, options: &BuildOptions) -> Result<Arc<dyn TextExtractor>> {
        match &self.pdf_extractor {
            Some(extractor) => Ok(Arc::clone(extractor)),
            None => Ok(Arc::new(CommandExtractor::new(&options.extraction_command)?)),
        }
    }
}

fn remove_originals(sources: &[PathBuf], log: &BuildLog) {
    let mut removed = 0;
    for source in sources {
        match fs::remove_file(source) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove moved document {}: {}", source.display(), e),
        }
    }
    log.record(format!("Moved {} documents into the database", removed));
}

/// Stages that run once the database directory exists
struct Stages<'a> {
    layout: &'a DatabaseLayout,
    paths: &'a ResolvedPaths,
    source: &'a Path,
    options: &'a BuildOptions,
    log: &'a BuildLog,
}

impl Stages<'_> {
    async fn run(
        &self,
        sources: &[PathBuf],
        pdf_extractor: Arc<dyn TextExtractor>,
        counter: Arc<dyn TokenCounter>,
        factory: &Arc<dyn EmbedderFactory>,
    ) -> Result<()> {
        let options = self.options;
        let paths = self.paths;

        // Moved documents are copied here and their originals removed only once
        // the build has succeeded
        let organize = match options.organize {
            OrganizeMode::Move => OrganizeMode::Copy,
            mode => mode,
        };
        let documents = organize_sources(sources, self.source, &paths.documents_dir, organize)?;
        self.log.record(format!(
            "Organized {} documents ({:?})",
            documents.len(),
            options.organize
        ));

        let extraction = extract_all(
            &documents,
            &paths.txt_dir,
            pdf_extractor,
            options.overwrite,
            options.conversion_workers,
        )
        .await?;
        self.log.record(format!(
            "Extracted {} text files ({} kept, {} failed)",
            extraction.converted,
            extraction.kept,
            extraction.failed.len()
        ));
        if extraction.produced() == 0 {
            return Err(LibrarianError::BuildFailure(
                "no documents could be converted to text".to_string(),
            )
            .into());
        }

        let rows = write_metadata_csv(
            &paths.txt_dir,
            &paths.metadata_csv,
            options.metadata_relative_path,
        )?;
        self.log.record(format!(
            "Wrote metadata for {} documents to {}",
            rows.len(),
            paths.metadata_csv.display()
        ));

        // Chunks take their DOIs from the persisted table
        let doi_map = read_doi_map(&paths.metadata_csv)?;
        let with_doi = doi_map.values().filter(|doi| *doi != DOI_NOT_FOUND).count();
        self.log.record(format!(
            "Read {} DOI mappings ({} with a DOI) from {}",
            doi_map.len(),
            with_doi,
            paths.metadata_csv.display()
        ));

        let chunking = chunk_directory(
            &paths.txt_dir,
            &doi_map,
            counter,
            options.chunking(),
            options.chunk_workers,
            &paths.chunks_file,
        )
        .await?;
        self.log.record(format!(
            "Chunked {} files into {} chunks ({} failed)",
            chunking.files,
            chunking.chunks,
            chunking.failed.len()
        ));

        let job = EmbeddingJob {
            batch_size: options.batch_size,
            workers: options.embedding_workers,
            device: options.device,
            normalize: options.normalize,
            shard_dir: paths.shard_dir.clone(),
            output: paths.embedded_file.clone(),
        };
        let embedding = embed_chunks(&paths.chunks_file, Arc::clone(factory), &job).await?;
        self.log.record(format!(
            "Embedded {} chunks with {} {} workers",
            embedding.records, embedding.workers, embedding.device
        ));

        let embedded = paths.embedded_file.clone();
        let artifacts = self.layout.artifacts();
        let metric = options.metric;
        let index = tokio::task::spawn_blocking(move || build_index(&embedded, &artifacts, metric))
            .await
            .map_err(|e| anyhow!("Index build task panicked: {}", e))??;
        self.log.record(format!(
            "Built {} index with {} rows of dimension {}",
            index.metric, index.rows, index.dimension
        ));

        Ok(())
    }
}
