#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Select};

use super::{Config, ConfigError, CredentialStore, OllamaConfig, mask_key};
use crate::embeddings::DeviceMode;
use crate::index::Metric;

#[inline]
pub fn run_interactive_config() -> Result<()> {
    eprintln!("{}", style("🔧 Librarian Configuration Setup").bold().cyan());
    eprintln!();

    let mut config = load_existing_config()?;

    eprintln!("{}", style("Ollama Configuration").bold().yellow());
    eprintln!("Configure the Ollama instance used to embed chunks and queries.");
    eprintln!();

    configure_ollama(&mut config.ollama)?;

    eprintln!();
    eprintln!("{}", style("Pipeline Configuration").bold().yellow());
    configure_pipeline(&mut config)?;

    eprintln!();
    eprintln!("{}", style("Answer Models").bold().yellow());
    configure_openai(&mut config)?;

    eprintln!();
    eprintln!("{}", style("Testing configuration...").yellow());

    if test_ollama_connection(&config.ollama) {
        eprintln!("{}", style("✓ Ollama connection successful!").green());
    } else {
        eprintln!(
            "{}",
            style("⚠ Warning: Could not connect to Ollama").yellow()
        );
        eprintln!("You can continue, but make sure Ollama is running before building.");
    }

    eprintln!();
    if Confirm::new()
        .with_prompt("Save configuration?")
        .default(true)
        .interact()?
    {
        config.save().context("Failed to save configuration")?;
        eprintln!("{}", style("✓ Configuration saved successfully!").green());
        eprintln!(
            "Configuration saved to: {}",
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!("Configuration not saved.");
    }

    Ok(())
}

#[inline]
pub fn show_config() -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;

    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Ollama Settings:").bold().yellow());
    match config.ollama_url() {
        Ok(url) => eprintln!("  URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  URL: {} ({})", style("Invalid").red(), e),
    }
    eprintln!("  Model: {}", style(&config.ollama.model).cyan());
    eprintln!("  Batch Size: {}", style(config.ollama.batch_size).cyan());

    eprintln!();
    eprintln!("{}", style("Answer Models:").bold().yellow());
    eprintln!("  Endpoint: {}", style(&config.openai.base_url).cyan());
    eprintln!("  Rewrite: {}", style(&config.openai.rewrite_model).cyan());
    eprintln!("  Answer: {}", style(&config.openai.answer_model).cyan());
    let credentials = CredentialStore::new(config.credentials_path());
    match credentials.api_key() {
        Ok(Some((key, source))) => eprintln!(
            "  API Key: {} ({:?})",
            style(mask_key(&key)).cyan(),
            source
        ),
        Ok(None) => eprintln!("  API Key: {}", style("not set").red()),
        Err(e) => eprintln!("  API Key: {} ({})", style("unreadable").red(), e),
    }

    eprintln!();
    eprintln!("{}", style("Pipeline:").bold().yellow());
    eprintln!(
        "  Chunking: min {} tokens, overlap {}, tokenizer {}",
        style(config.chunking.min_tokens).cyan(),
        style(config.chunking.overlap).cyan(),
        style(&config.chunking.tokenizer).cyan()
    );
    eprintln!(
        "  Embedding: {} workers on {}, normalize {}",
        style(config.embedding.workers).cyan(),
        style(config.embedding.device).cyan(),
        style(config.embedding.normalize).cyan()
    );
    eprintln!("  Metric: {}", style(config.index.metric).cyan());
    eprintln!("  Top K: {}", style(config.query.top_k).cyan());

    eprintln!();
    eprintln!("Databases: {}", style(config.db_root().display()).dim());
    eprintln!("Query logs: {}", style(config.log_dir().display()).dim());
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );

    Ok(())
}

fn load_existing_config() -> Result<Config> {
    Config::load_default().map_or_else(
        |_| {
            eprintln!(
                "{}",
                style("No existing configuration found. Using defaults.").yellow()
            );
            Ok(Config::default())
        },
        |config| {
            eprintln!("{}", style("Found existing configuration.").green());
            Ok(config)
        },
    )
}

fn configure_ollama(ollama: &mut OllamaConfig) -> Result<()> {
    let protocols = &["http", "https"];
    let default_index = protocols
        .iter()
        .position(|&p| p == ollama.protocol)
        .unwrap_or(0);

    let protocol_index = Select::new()
        .with_prompt("Ollama protocol")
        .default(default_index)
        .items(protocols)
        .interact()?;

    let protocol = protocols[protocol_index].to_string();

    let host: String = Input::new()
        .with_prompt("Ollama host")
        .default(ollama.host.clone())
        .validate_with(|input: &String| -> Result<(), ConfigError> {
            let temp_config = OllamaConfig {
                protocol: protocol.clone(),
                host: input.clone(),
                ..OllamaConfig::default()
            };
            temp_config.validate()
        })
        .interact_text()?;

    let port: u16 = Input::new()
        .with_prompt("Ollama port")
        .default(ollama.port)
        .validate_with(|input: &u16| -> Result<(), &str> {
            if *input == 0 {
                Err("Port must be greater than 0")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let model: String = Input::new()
        .with_prompt("Embedding model")
        .default(ollama.model.clone())
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.trim().is_empty() {
                Err("Model name cannot be empty")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let batch_size: u32 = Input::new()
        .with_prompt("Batch size for embedding generation")
        .default(ollama.batch_size)
        .validate_with(|input: &u32| -> Result<(), &str> {
            if *input == 0 {
                Err("Batch size must be greater than 0")
            } else if *input > 4096 {
                Err("Batch size must be 4096 or less")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    ollama.set_protocol(protocol)?;
    ollama.set_host(host)?;
    ollama.set_port(port)?;
    ollama.set_model(model)?;
    ollama.set_batch_size(batch_size)?;

    Ok(())
}

fn configure_pipeline(config: &mut Config) -> Result<()> {
    let min_tokens: usize = Input::new()
        .with_prompt("Minimum tokens per chunk")
        .default(config.chunking.min_tokens)
        .interact_text()?;
    config.chunking.set_min_tokens(min_tokens)?;

    let overlap: usize = Input::new()
        .with_prompt("Paragraph overlap between chunks")
        .default(config.chunking.overlap)
        .interact_text()?;
    config.chunking.set_overlap(overlap)?;

    let tokenizer: String = Input::new()
        .with_prompt("Tokenizer (hub id, tokenizer.json path, or 'heuristic')")
        .default(config.chunking.tokenizer.clone())
        .interact_text()?;
    config.chunking.set_tokenizer(tokenizer)?;

    let devices = [DeviceMode::Gpu, DeviceMode::Cpu];
    let device_index = Select::new()
        .with_prompt("Embedding device")
        .default(
            devices
                .iter()
                .position(|d| *d == config.embedding.device)
                .unwrap_or(0),
        )
        .items(&devices)
        .interact()?;
    config.embedding.device = devices[device_index];

    let workers: usize = Input::new()
        .with_prompt("Embedding workers")
        .default(config.embedding.workers)
        .interact_text()?;
    config.embedding.set_workers(workers)?;

    let metrics = [Metric::L2, Metric::Cosine];
    let metric_index = Select::new()
        .with_prompt("Similarity metric")
        .default(
            metrics
                .iter()
                .position(|m| *m == config.index.metric)
                .unwrap_or(0),
        )
        .items(&metrics)
        .interact()?;
    config.index.metric = metrics[metric_index];
    config.embedding.normalize = config.index.metric == Metric::Cosine
        || Confirm::new()
            .with_prompt("L2-normalize embeddings?")
            .default(config.embedding.normalize)
            .interact()?;

    let top_k: usize = Input::new()
        .with_prompt("Chunks retrieved per query")
        .default(config.query.top_k)
        .interact_text()?;
    config.query.set_top_k(top_k)?;

    Ok(())
}

fn configure_openai(config: &mut Config) -> Result<()> {
    let base_url: String = Input::new()
        .with_prompt("Chat completions endpoint")
        .default(config.openai.base_url.clone())
        .interact_text()?;
    config.openai.set_base_url(base_url)?;

    let rewrite_model: String = Input::new()
        .with_prompt("Query rewrite model")
        .default(config.openai.rewrite_model.clone())
        .interact_text()?;
    config.openai.set_rewrite_model(rewrite_model)?;

    let answer_model: String = Input::new()
        .with_prompt("Answer model")
        .default(config.openai.answer_model.clone())
        .interact_text()?;
    config.openai.set_answer_model(answer_model)?;

    Ok(())
}

fn test_ollama_connection(ollama: &OllamaConfig) -> bool {
    let url = format!(
        "{}://{}:{}/api/version",
        ollama.protocol, ollama.host, ollama.port
    );

    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(std::time::Duration::from_secs(5)))
        .build()
        .into();

    match agent.get(&url).call() {
        Ok(_) => true,
        Err(ureq::Error::StatusCode(code)) if (400..500).contains(&code) => true,
        Err(_) => false,
    }
}
