use super::load_existing_config as load_existing_config_impl;
use super::test_ollama_connection;
use crate::config::OllamaConfig;

#[test]
fn load_existing_config() {
    let config = load_existing_config_impl().expect("config loaded successfully");
    assert!(!config.ollama.host.is_empty());
    assert!(config.ollama.port > 0);
    assert!(!config.ollama.model.is_empty());
    assert!(config.query.top_k > 0);
}

#[test]
fn unreachable_ollama_reports_failure() {
    let ollama = OllamaConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        ..OllamaConfig::default()
    };
    assert!(!test_ollama_connection(&ollama));
}
