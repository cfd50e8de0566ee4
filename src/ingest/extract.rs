use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::SourceKind;
use crate::LibrarianError;

/// Default command converting a PDF into UTF-8 text
pub const DEFAULT_PDF_COMMAND: &str = "pdftotext -enc UTF-8 {input} {output}";

/// Produces a plain-text file from one source document
pub trait TextExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Check the extractor can run at all
    fn probe(&self) -> Result<()>;

    fn extract(&self, input: &Path, output: &Path) -> Result<()>;
}

/// Runs an external program. `{input}` and `{output}` in the template are
/// replaced with the document and destination paths.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    template: String,
    program: String,
    args: Vec<String>,
}

impl CommandExtractor {
    #[inline]
    pub fn new(template: &str) -> Result<Self> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| LibrarianError::Validation("extraction command is empty".into()))?;
        let args: Vec<String> = parts.collect();

        if !args.iter().any(|a| a.contains("{input}")) {
            return Err(LibrarianError::Validation(format!(
                "extraction command '{}' has no {{input}} placeholder",
                template
            ))
            .into());
        }

        Ok(Self {
            template: template.to_string(),
            program,
            args,
        })
    }

    #[inline]
    pub fn program(&self) -> &str {
        &self.program
    }
}

impl TextExtractor for CommandExtractor {
    #[inline]
    fn name(&self) -> &str {
        &self.template
    }

    #[inline]
    fn probe(&self) -> Result<()> {
        crate::capabilities::probe_command(&self.program, &["-v"])
            .into_result(&self.program)
    }

    #[inline]
    fn extract(&self, input: &Path, output: &Path) -> Result<()> {
        let input_str = input.to_string_lossy();
        let output_str = output.to_string_lossy();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{input}", &input_str).replace("{output}", &output_str))
            .collect();

        debug!("Running {} {:?}", self.program, args);
        let result = Command::new(&self.program)
            .args(&args)
            .output()
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !result.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }

        // Commands without an {output} placeholder write text to stdout
        if !self.args.iter().any(|a| a.contains("{output}")) {
            fs::write(output, &result.stdout)
                .with_context(|| format!("Failed to write {}", output.display()))?;
        }

        if !output.is_file() {
            bail!("{} produced no text for {}", self.program, input.display());
        }
        Ok(())
    }
}

/// Plain-text sources are copied verbatim
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughExtractor;

impl TextExtractor for PassthroughExtractor {
    #[inline]
    fn name(&self) -> &str {
        "passthrough"
    }

    #[inline]
    fn probe(&self) -> Result<()> {
        Ok(())
    }

    #[inline]
    fn extract(&self, input: &Path, output: &Path) -> Result<()> {
        fs::copy(input, output).with_context(|| {
            format!("Failed to copy {} to {}", input.display(), output.display())
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub converted: usize,
    /// Existing text files kept because overwriting was disabled
    pub kept: usize,
    /// Documents that failed or collided with an earlier document's text name
    pub failed: Vec<String>,
}

impl ExtractionSummary {
    #[inline]
    pub fn produced(&self) -> usize {
        self.converted + self.kept
    }
}

/// Convert every source into `{stem}.txt` inside `txt_dir`, on up to `workers`
/// blocking tasks. Failures are logged and skipped.
#[inline]
pub async fn extract_all(
    sources: &[PathBuf],
    txt_dir: &Path,
    pdf_extractor: Arc<dyn TextExtractor>,
    overwrite: bool,
    workers: usize,
) -> Result<ExtractionSummary> {
    fs::create_dir_all(txt_dir)
        .with_context(|| format!("Failed to create directory: {}", txt_dir.display()))?;

    let mut summary = ExtractionSummary::default();
    let mut names = HashSet::new();
    let mut jobs = Vec::new();

    for source in sources {
        let Some(kind) = SourceKind::of(source) else {
            continue;
        };
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = format!("{}.txt", stem);
        if !names.insert(file_name.clone()) {
            warn!(
                "Skipping {}: another document already produces {}",
                source.display(),
                file_name
            );
            summary.failed.push(source.display().to_string());
            continue;
        }

        let output = txt_dir.join(&file_name);
        if !overwrite && output.is_file() {
            debug!("Keeping existing {}", output.display());
            summary.kept += 1;
            continue;
        }

        let extractor: Arc<dyn TextExtractor> = match kind {
            SourceKind::Pdf => Arc::clone(&pdf_extractor),
            SourceKind::PlainText => Arc::new(PassthroughExtractor),
        };
        jobs.push((source.clone(), output, extractor));
    }

    info!(
        "Extracting text from {} documents with {} workers",
        jobs.len(),
        workers.max(1)
    );

    let mut results = stream::iter(jobs.into_iter().map(|(input, output, extractor)| async move {
        let name = input.display().to_string();
        let result = tokio::task::spawn_blocking(move || {
            let result = extractor.extract(&input, &output);
            if result.is_err() {
                let _ = fs::remove_file(&output);
            }
            result
        })
        .await
        .map_err(|e| anyhow!("Extraction task panicked: {}", e))
        .and_then(|r| r);
        (name, result)
    }))
    .buffer_unordered(workers.max(1));

    while let Some((name, result)) = results.next().await {
        match result {
            Ok(()) => summary.converted += 1,
            Err(e) => {
                warn!("Failed to convert {}: {:#}", name, e);
                summary.failed.push(name);
            }
        }
    }

    summary.failed.sort();
    info!(
        "Text extraction complete: {} converted, {} kept, {} failed",
        summary.converted,
        summary.kept,
        summary.failed.len()
    );
    Ok(summary)
}
