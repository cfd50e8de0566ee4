pub mod credentials;
pub mod interactive;
pub mod settings;

pub use credentials::{API_KEY_ENV, CredentialStore, KeySource, mask_key};
pub use interactive::{run_interactive_config, show_config};
pub use settings::{
    ChunkingSettings, Config, ConfigError, DB_ROOT_ENV, EmbeddingSettings, IndexSettings,
    LOG_DIR_ENV, OllamaConfig, OpenAiConfig, PathSettings, QuerySettings,
};
