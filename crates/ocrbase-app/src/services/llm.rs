use bon::Builder;
use serde::Deserialize;
use thiserror::Error;

use super::ocr::is_transient_status;

pub const LLM_API_KEY_ENV: &str = "OCRBASE_LLM_API_KEY";

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlmUsage {
    pub total_tokens: u64,
}

/// One chat completion.
#[derive(Debug, Clone)]
pub struct LlmCompletion {
    pub text: String,
    pub model: String,
    pub usage: LlmUsage,
}

#[derive(Debug, Clone, Builder)]
pub struct LlmConfig {
    #[builder(into)]
    pub base_url: String,
    #[builder(into)]
    pub model: String,
    #[builder(default = 8192)]
    pub max_tokens: u32,
    #[builder(default = 120)]
    pub timeout_secs: u64,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing {LLM_API_KEY_ENV} environment variable")]
    MissingApiKey,
    #[error("llm endpoint returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("llm request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("llm response malformed: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::MissingApiKey => false,
            LlmError::Http { status, .. } => is_transient_status(*status),
            LlmError::Transport(_) => true,
            LlmError::InvalidResponse(_) => true,
        }
    }
}

/// Low-level chat seam the extraction adapter builds on.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<LlmCompletion, LlmError>;
}

#[derive(Debug, Deserialize)]
struct ChatResponseBody {
    choices: Vec<ChatChoice>,
    model: Option<String>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: Option<u64>,
}

/// Chat-completions client for the extraction model.
pub struct HttpLlmClient {
    client: reqwest::Client,
    config: LlmConfig,
    api_key: String,
}

impl HttpLlmClient {
    pub fn from_env(config: LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(LLM_API_KEY_ENV).map_err(|_| LlmError::MissingApiKey)?;
        Ok(Self::new(config, api_key))
    }

    pub fn new(config: LlmConfig, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            config,
            api_key: api_key.into(),
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system: &str, user: &str) -> Result<LlmCompletion, LlmError> {
        let request = serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": 0.0,
            "max_tokens": self.config.max_tokens,
        });

        let endpoint = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        let body: ChatResponseBody = response
            .json()
            .await
            .map_err(|error| LlmError::InvalidResponse(error.to_string()))?;
        let text = body
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| LlmError::InvalidResponse("no completion choices".to_string()))?;

        Ok(LlmCompletion {
            text,
            model: body.model.unwrap_or_else(|| self.config.model.clone()),
            usage: LlmUsage {
                total_tokens: body
                    .usage
                    .and_then(|usage| usage.total_tokens)
                    .unwrap_or(0),
            },
        })
    }
}
