use super::*;
use serial_test::serial;
use tempfile::TempDir;

#[test]
fn default_config() {
    let config = Config::default();
    assert_eq!(config.ollama.protocol, "http");
    assert_eq!(config.ollama.host, "localhost");
    assert_eq!(config.ollama.port, 11434);
    assert_eq!(config.ollama.model, "all-minilm:latest");
    assert_eq!(config.openai.rewrite_model, "gpt-4.1-nano");
    assert_eq!(config.openai.answer_model, "o3");
    assert_eq!(config.openai.retry_attempts, 3);
    assert_eq!(config.openai.retry_delay_ms, 2000);
    assert_eq!(config.chunking.min_tokens, 500);
    assert_eq!(config.chunking.overlap, 1);
    assert_eq!(config.embedding.device, DeviceMode::Gpu);
    assert!(!config.embedding.normalize);
    assert_eq!(config.index.metric, Metric::L2);
    assert_eq!(config.query.top_k, 15);
}

#[test]
fn config_validation() {
    let config = Config::default();
    assert!(config.validate().is_ok());

    let mut invalid_config = config.clone();
    invalid_config.ollama.protocol = "ftp".to_string();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.ollama.port = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.ollama.model = String::new();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.ollama.batch_size = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.openai.base_url = "not a url".to_string();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.openai.retry_attempts = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.chunking.min_tokens = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.embedding.workers = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config;
    invalid_config.query.top_k = 0;
    assert!(invalid_config.validate().is_err());
}

#[test]
fn ollama_url_generation() {
    let config = Config::default();
    let url = config
        .ollama_url()
        .expect("should generate ollama_url successfully");
    assert_eq!(url.as_str(), "http://localhost:11434/");
}

#[test]
fn toml_serialization() {
    let config = Config::default();
    let toml_str = toml::to_string(&config).expect("should serialize toml correctly");
    let mut parsed_config: Config = toml::from_str(&toml_str).expect("should parse toml correctly");
    parsed_config.base_dir = config.base_dir.clone();
    assert_eq!(config, parsed_config);
}

#[test]
fn partial_toml_uses_section_defaults() {
    let toml_str = r#"
[embedding]
device = "cpu"

[index]
metric = "cosine"
"#;
    let config: Config = toml::from_str(toml_str).expect("should parse partial toml");

    assert_eq!(config.embedding.device, DeviceMode::Cpu);
    assert_eq!(config.embedding.workers, 4);
    assert_eq!(config.index.metric, Metric::Cosine);
    assert_eq!(config.ollama, OllamaConfig::default());
    assert_eq!(config.query.top_k, 15);
}

#[test]
fn vector_dimension_is_not_a_setting() {
    let toml_str = r#"
[ollama]
model = "nomic-embed-text"
embedding_dimension = 768
"#;
    let config: Config = toml::from_str(toml_str).expect("older config files should still parse");
    assert_eq!(config.ollama.model, "nomic-embed-text");
    assert!(config.ollama.validate().is_ok());

    let written = toml::to_string(&config).expect("should serialize toml correctly");
    assert!(!written.contains("dimension"));
}

#[test]
fn setter_validation() {
    let mut config = OllamaConfig::default();

    assert!(config.set_protocol("https".to_string()).is_ok());
    assert!(config.set_host("example.com".to_string()).is_ok());
    assert!(config.set_port(8080).is_ok());
    assert!(config.set_model("new-model".to_string()).is_ok());
    assert!(config.set_batch_size(128).is_ok());

    assert!(config.set_protocol("ftp".to_string()).is_err());
    assert!(config.set_protocol("HTTP".to_string()).is_err());
    assert!(config.set_port(0).is_err());
    assert!(config.set_model(String::new()).is_err());
    assert!(config.set_batch_size(0).is_err());

    let mut chunking = ChunkingSettings::default();
    assert!(chunking.set_overlap(0).is_ok());
    assert!(chunking.set_overlap(65).is_err());
    assert!(chunking.set_tokenizer("  ".to_string()).is_err());
    assert_eq!(chunking.overlap, 0);
}

#[test]
fn load_missing_config_uses_defaults() {
    let temp_dir = TempDir::new().expect("should create temp dir");

    let config = Config::load(temp_dir.path()).expect("missing file should load defaults");

    assert_eq!(config.get_base_dir(), temp_dir.path());
    assert_eq!(config.ollama, OllamaConfig::default());
    assert_eq!(config.config_file_path(), temp_dir.path().join("config.toml"));
}

#[test]
fn save_then_load() {
    let temp_dir = TempDir::new().expect("should create temp dir");

    let mut config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    config.chunking.min_tokens = 256;
    config.paths.db_root = Some(temp_dir.path().join("dbs"));
    config.save().expect("save should succeed");

    let loaded = Config::load(temp_dir.path()).expect("load should succeed");
    assert_eq!(loaded, config);
}

#[test]
fn load_rejects_invalid_values() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    fs::write(
        temp_dir.path().join("config.toml"),
        "[query]\ntop_k = 0\n",
    )
    .expect("write should succeed");

    assert!(Config::load(temp_dir.path()).is_err());
}

#[test]
#[serial]
fn path_resolution_order() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };

    // SAFETY: serialized with every other test touching these variables
    unsafe {
        std::env::remove_var(DB_ROOT_ENV);
        std::env::remove_var(LOG_DIR_ENV);
    }

    assert_eq!(config.db_root(), temp_dir.path().join("databases"));
    assert_eq!(config.log_dir(), temp_dir.path().join("logs"));

    config.paths.db_root = Some(temp_dir.path().join("configured"));
    assert_eq!(config.db_root(), temp_dir.path().join("configured"));

    let from_env = temp_dir.path().join("from-env");
    // SAFETY: serialized with every other test touching these variables
    unsafe {
        std::env::set_var(DB_ROOT_ENV, &from_env);
        std::env::set_var(LOG_DIR_ENV, &from_env);
    }
    assert_eq!(config.db_root(), from_env);
    assert_eq!(config.log_dir(), from_env);

    // SAFETY: as above
    unsafe {
        std::env::remove_var(DB_ROOT_ENV);
        std::env::remove_var(LOG_DIR_ENV);
    }
}
