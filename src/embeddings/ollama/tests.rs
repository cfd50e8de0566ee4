use super::*;

#[test]
fn client_configuration() {
    let config = OllamaConfig {
        protocol: "http".to_string(),
        host: "test-host".to_string(),
        port: 1234,
        model: "test-model".to_string(),
        batch_size: 128,
        ..OllamaConfig::default()
    };
    let client = OllamaClient::new(&config).expect("Failed to create client");

    assert_eq!(client.model, "test-model");
    assert_eq!(client.batch_size, 128);
    assert_eq!(client.base_url.host_str(), Some("test-host"));
    assert_eq!(client.base_url.port(), Some(1234));
    assert_eq!(client.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
    assert!(client.options.is_none());
}

#[test]
fn client_builder_methods() {
    let client = OllamaClient::new(&OllamaConfig::default())
        .expect("Failed to create client")
        .with_timeout(Duration::from_secs(60))
        .with_retry_attempts(5)
        .with_backoff(Duration::from_millis(10));

    assert_eq!(client.retry_attempts, 5);
    assert_eq!(client.backoff_ms, 10);
}

#[test]
fn device_binding_sets_request_options() {
    let base = OllamaClient::new(&OllamaConfig::default()).expect("Failed to create client");

    let cpu = base.clone().with_device(DeviceBinding::Cpu);
    let request = BatchEmbedRequest {
        model: cpu.model(),
        inputs: &["a".to_string()],
        options: cpu.options,
    };
    let json = serde_json::to_value(&request).expect("request should serialize");
    assert_eq!(json["options"]["num_gpu"], 0);
    assert!(json["options"].get("main_gpu").is_none());
    assert_eq!(json["input"][0], "a");

    let gpu = base.clone().with_device(DeviceBinding::Accelerator(2));
    assert_eq!(
        gpu.options,
        Some(EmbedOptions {
            num_gpu: None,
            main_gpu: Some(2),
        })
    );

    let auto = base.with_device(DeviceBinding::Auto);
    let request = BatchEmbedRequest {
        model: auto.model(),
        inputs: &[],
        options: auto.options,
    };
    let json = serde_json::to_value(&request).expect("request should serialize");
    assert!(json.get("options").is_none());
}

#[test]
fn empty_batch_makes_no_request() {
    let config = OllamaConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        ..OllamaConfig::default()
    };
    let client = OllamaClient::new(&config).expect("Failed to create client");
    assert!(
        client
            .generate_embeddings_batch(&[])
            .expect("empty input should succeed")
            .is_empty()
    );
}

#[test]
fn unreachable_server_is_transient() {
    let config = OllamaConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        ..OllamaConfig::default()
    };
    let client = OllamaClient::new(&config)
        .expect("Failed to create client")
        .with_retry_attempts(2)
        .with_backoff(Duration::from_millis(1));

    let error = client
        .embed_batch(&["text".to_string()])
        .expect_err("request should fail");
    assert_eq!(
        crate::LibrarianError::classify(&error),
        crate::ErrorKind::TransientService
    );
}

#[test]
fn factory_probe_reports_unavailable_model_server() {
    let config = OllamaConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        ..OllamaConfig::default()
    };
    let factory = OllamaEmbedderFactory::new(config, 2);

    assert_eq!(factory.accelerator_count(), 2);
    assert_eq!(factory.model_name(), "all-minilm:latest");
    let error = factory.probe().expect_err("probe should fail");
    assert_eq!(
        crate::LibrarianError::classify(&error),
        crate::ErrorKind::DependencyUnavailable
    );
}
