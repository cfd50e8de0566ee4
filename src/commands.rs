use anyhow::{Context, Result, bail};
use dialoguer::Password;
use serde_json::Map;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::capabilities::CapabilityReport;
use crate::config::{Config, CredentialStore, mask_key};
use crate::database::Catalog;
use crate::embeddings::{EmbedderHandle, OllamaEmbedderFactory};
use crate::pipeline::{
    BuildLock, BuildOptions, BuildReport, LockStatus, PipelineOrchestrator, insert_dotted,
    load_overrides, parse_assignment,
};
use crate::retrieval::{Answer, OpenAiChat, QueryEngine, Retriever, RetrieverSettings};

/// Where a build reads its documents and which option overrides it applies
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub name: String,
    pub source: PathBuf,
    pub recursive: bool,
    /// TOML or JSON file with option overrides
    pub options_file: Option<PathBuf>,
    /// `key=value` overrides, applied after the options file
    pub assignments: Vec<String>,
}

/// Layer the options file and `--set` assignments over the configured defaults
#[inline]
pub fn resolve_build_options(config: &Config, request: &BuildRequest) -> Result<BuildOptions> {
    let mut overrides = match &request.options_file {
        Some(path) => load_overrides(path)?,
        None => Map::new(),
    };

    if request.recursive {
        overrides.insert("recursive".to_string(), serde_json::Value::Bool(true));
    }

    for assignment in &request.assignments {
        let (key, value) = parse_assignment(assignment)?;
        insert_dotted(&mut overrides, &key, value);
    }

    BuildOptions::resolve(config, overrides)
}

/// Build a database from a directory or file of documents
#[inline]
pub async fn build_database(request: &BuildRequest) -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;
    let options = resolve_build_options(&config, request)?;

    info!(
        "Building database '{}' from {}",
        request.name,
        request.source.display()
    );
    println!(
        "🔨 Building database '{}' from {}",
        request.name,
        request.source.display()
    );

    let catalog = Arc::new(Catalog::new(config.db_root()));
    let ollama = config.ollama.clone();
    let factory = tokio::task::spawn_blocking(move || OllamaEmbedderFactory::detect(ollama))
        .await
        .context("Accelerator probe panicked")?;

    let orchestrator = PipelineOrchestrator::new(catalog, Arc::new(factory));
    let report = orchestrator
        .build(&request.name, &request.source, &options)
        .await;

    print_build_report(&report);
    if let Some(error) = &report.error {
        bail!("Build of '{}' failed: {}", request.name, error.message);
    }
    Ok(())
}

fn print_build_report(report: &BuildReport) {
    println!();
    for line in &report.logs {
        println!("   • {}", line);
    }
    println!();

    match (&report.database, &report.error) {
        (Some(database), _) => {
            println!("✅ Database '{}' built successfully", database.name);
            println!("   📁 Location: {}", database.path.display());
            println!();
            println!("💡 Ask it a question with 'librarian ask {} <question>'", database.name);
        }
        (None, Some(error)) => {
            println!("❌ Build failed ({:?}): {}", error.kind, error.message);
        }
        (None, None) => println!("❌ Build failed"),
    }
}

/// Query engine wired to the configured services
#[inline]
pub fn query_engine(config: &Config) -> QueryEngine {
    let catalog = Arc::new(Catalog::new(config.db_root()));
    let factory = OllamaEmbedderFactory::new(config.ollama.clone(), 0);
    let embedder = Arc::new(EmbedderHandle::new(Arc::new(factory)));
    let chat = Arc::new(OpenAiChat::new(
        config.openai.clone(),
        CredentialStore::new(config.credentials_path()),
    ));
    let retriever = Retriever::new(embedder, chat, RetrieverSettings::from_config(config));
    QueryEngine::new(catalog, retriever)
}

/// Answer `query` from database `name` and print the answer with its sources
#[inline]
pub async fn ask(name: String, query: String) -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;
    let engine = query_engine(&config);

    let answer = tokio::task::spawn_blocking(move || engine.ask(&name, &query))
        .await
        .context("Query task panicked")?;

    print_answer(&answer);
    Ok(())
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.text);

    if !answer.citations.is_empty() {
        println!();
        println!("📚 Sources:");
        for (rank, source) in &answer.citations {
            println!("   [{}] {}", rank, source);
        }
    }
}

/// List the databases that are ready to query
#[inline]
pub fn list_databases() -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;
    let catalog = Catalog::new(config.db_root());
    let names = catalog.list().context("Failed to list databases")?;

    if names.is_empty() {
        println!("No databases have been built yet.");
        println!("Use 'librarian build <name> <source>' to build one.");
        return Ok(());
    }

    println!("Databases ({} total):", names.len());
    println!();
    for name in &names {
        println!("📚 {}", name);
        if let Ok(layout) = catalog.layout(name) {
            println!("   Path: {}", layout.root().display());
        }
    }

    Ok(())
}

/// Show which components are available and which databases exist
#[inline]
pub async fn show_status() -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;

    println!("🔍 Librarian Status");
    println!("===================");
    println!();

    let probe_config = config.clone();
    let report = tokio::task::spawn_blocking(move || {
        let factory = OllamaEmbedderFactory::detect(probe_config.ollama.clone());
        let extraction_command = BuildOptions::from_config(&probe_config).extraction_command;
        CapabilityReport::probe(&probe_config, &factory, &extraction_command)
    })
    .await
    .context("Capability probe panicked")?;

    println!("🧩 Components:");
    println!("   Tokenizer: {}", report.tokenizer);
    println!("   Embedding service: {}", report.embedding_service);
    println!("   PDF extraction: {}", report.pdf_extractor);
    println!("   API key: {}", report.api_key);
    if report.accelerators > 0 {
        println!("   🚀 Accelerators: {}", report.accelerators);
    } else {
        println!("   🖥️  Accelerators: none, embedding runs on CPU");
    }
    println!();

    println!("🗄️  Databases:");
    let catalog = Catalog::new(config.db_root());
    match catalog.list() {
        Ok(names) if names.is_empty() => println!("   📭 No databases built yet"),
        Ok(names) => {
            println!("   📊 Ready: {}", names.len());
            for name in &names {
                println!("      • {}", name);
            }
        }
        Err(e) => println!("   ❌ Failed to list databases: {}", e),
    }
    match BuildLock::status(catalog.root()) {
        Ok(LockStatus::Free) => println!("   💤 No build in progress"),
        Ok(LockStatus::Held { holder: Some(holder) }) => {
            println!("   🔨 A build is in progress (pid and start: {})", holder);
        }
        Ok(LockStatus::Held { holder: None }) => println!("   🔨 A build is in progress"),
        Err(e) => println!("   ❌ Failed to check the build lock: {}", e),
    }
    println!();

    println!("💡 Next Steps:");
    if !report.can_build() {
        println!("   • Use 'librarian config' to point at a running Ollama instance");
    }
    if !report.api_key.is_available() {
        println!("   • Use 'librarian key set' to store an OpenAI API key");
    }
    println!("   • Use 'librarian build <name> <source>' to build a database");
    println!("   • Use 'librarian ask <name> <question>' to query it");

    Ok(())
}

fn credential_store() -> Result<CredentialStore> {
    let config = Config::load_default().context("Failed to load configuration")?;
    Ok(CredentialStore::new(config.credentials_path()))
}

/// Store an API key, prompting for it when not given
#[inline]
pub fn key_set(key: Option<String>) -> Result<()> {
    let store = credential_store()?;
    let key = match key {
        Some(key) => key,
        None => Password::new()
            .with_prompt("OpenAI API key")
            .interact()
            .context("Failed to read API key")?,
    };

    store.set_api_key(&key)?;
    println!("✅ API key saved to {}", store.path().display());
    warn_if_environment_overrides();
    Ok(())
}

/// Remove the stored API key
#[inline]
pub fn key_clear() -> Result<()> {
    let store = credential_store()?;
    if store.clear_api_key()? {
        println!("✅ Stored API key removed");
    } else {
        println!("No API key was stored");
    }
    warn_if_environment_overrides();
    Ok(())
}

/// Print the active API key, masked
#[inline]
pub fn key_show() -> Result<()> {
    let store = credential_store()?;
    match store.api_key()? {
        Some((key, source)) => println!("🔑 {} (from {:?})", mask_key(&key), source),
        None => println!("No API key configured. Use 'librarian key set' to add one."),
    }
    Ok(())
}

fn warn_if_environment_overrides() {
    if std::env::var(crate::config::API_KEY_ENV).is_ok_and(|v| !v.trim().is_empty()) {
        warn!("{} is set and takes precedence over the stored key", crate::config::API_KEY_ENV);
        println!(
            "⚠️  {} is set in the environment and overrides the stored key",
            crate::config::API_KEY_ENV
        );
    }
}
