use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::{ErrorKind, LibrarianError};
use crate::config::{CredentialStore, OpenAiConfig};

/// A chat-completions language model
pub trait ChatService: Send + Sync {
    /// Send `prompt` as a single user message to `model` and return the reply text
    fn complete(&self, model: &str, prompt: &str) -> Result<String>;

    /// Drop any cached client so new credentials or configuration take effect
    fn reset(&self);
}

/// Fixed-delay retry budget for model calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    #[inline]
    pub fn from_config(config: &OpenAiConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Run `call` until it succeeds or the attempts are used up, returning the last error.
    /// Missing dependencies and bad configuration fail on the first attempt.
    #[inline]
    pub fn run<T, F>(&self, label: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match call() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{} failed (attempt {}/{}): {:#}", label, attempt, attempts, e);
                    if !is_retryable(&e) {
                        return Err(e);
                    }
                    last_error = Some(e);
                    if attempt < attempts && !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("{} was never attempted", label)))
    }
}

fn is_retryable(error: &anyhow::Error) -> bool {
    !matches!(
        LibrarianError::classify(error),
        ErrorKind::DependencyUnavailable | ErrorKind::Config | ErrorKind::Validation
    )
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Connection state built from the current API key
struct ChatClient {
    agent: ureq::Agent,
    endpoint: Url,
    authorization: String,
}

/// OpenAI-compatible chat-completions client.
///
/// The HTTP client and API key are loaded on first use and cached until [`ChatService::reset`].
pub struct OpenAiChat {
    config: OpenAiConfig,
    credentials: CredentialStore,
    client: RwLock<Option<Arc<ChatClient>>>,
}

impl OpenAiChat {
    #[inline]
    pub fn new(config: OpenAiConfig, credentials: CredentialStore) -> Self {
        Self {
            config,
            credentials,
            client: RwLock::new(None),
        }
    }

    fn client(&self) -> Result<Arc<ChatClient>> {
        let cached = self
            .client
            .read()
            .map_err(|_| anyhow!("Chat client lock poisoned"))?
            .as_ref()
            .map(Arc::clone);
        if let Some(client) = cached {
            return Ok(client);
        }

        let (api_key, source) = self.credentials.api_key()?.ok_or_else(|| {
            LibrarianError::DependencyUnavailable(
                "no OpenAI API key configured; run `librarian key set` or set OPENAI_API_KEY"
                    .to_string(),
            )
        })?;
        debug!("Creating chat client with API key from {:?}", source);

        let endpoint = Url::parse(&format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        ))
        .map_err(|e| LibrarianError::Config(format!("invalid OpenAI base URL: {}", e)))?;

        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(self.config.timeout_seconds)))
            .build()
            .into();

        let client = Arc::new(ChatClient {
            agent,
            endpoint,
            authorization: format!("Bearer {}", api_key.trim()),
        });

        let mut cached = self
            .client
            .write()
            .map_err(|_| anyhow!("Chat client lock poisoned"))?;
        Ok(Arc::clone(cached.get_or_insert(client)))
    }
}

impl ChatService for OpenAiChat {
    #[inline]
    fn complete(&self, model: &str, prompt: &str) -> Result<String> {
        let client = self.client()?;
        let request = ChatRequest {
            model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let body =
            serde_json::to_string(&request).context("Failed to serialize chat request")?;

        debug!("Sending chat request to {} ({})", client.endpoint, model);
        let response_text = client
            .agent
            .post(client.endpoint.as_str())
            .header("Content-Type", "application/json")
            .header("Authorization", &client.authorization)
            .send(&body)
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .map_err(|e| {
                LibrarianError::TransientService(format!("chat completion with {}: {}", model, e))
            })?;

        let response: ChatResponse =
            serde_json::from_str(&response_text).context("Failed to parse chat response")?;

        response
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| {
                LibrarianError::TransientService(format!("{} returned an empty reply", model))
                    .into()
            })
    }

    #[inline]
    fn reset(&self) {
        if let Ok(mut cached) = self.client.write() {
            *cached = None;
        }
        debug!("Chat client reset");
    }
}
