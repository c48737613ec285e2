use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bon::Builder;
use serde::Deserialize;
use thiserror::Error;

pub const OCR_API_KEY_ENV: &str = "OCRBASE_OCR_API_KEY";

/// MIME types the pipeline admits for OCR.
pub const SUPPORTED_MIME_TYPES: [&str; 5] = [
    "application/pdf",
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/tiff",
];

pub fn is_supported_mime(mime: &str) -> bool {
    SUPPORTED_MIME_TYPES.contains(&mime)
}

/// Markdown produced for a whole document.
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    pub markdown: String,
    pub page_count: u32,
    pub token_count: Option<u64>,
}

/// Parameters controlling OCR execution.
#[derive(Debug, Clone, Builder)]
pub struct OcrConfig {
    #[builder(into)]
    pub base_url: String,
    #[builder(into)]
    pub model: String,
    #[builder(default = 8192)]
    pub max_tokens: u32,
    #[builder(default = 120)]
    pub timeout_secs: u64,
}

/// Errors produced by the OCR collaborator.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("missing {OCR_API_KEY_ENV} environment variable")]
    MissingApiKey,
    #[error("ocr endpoint returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("ocr request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("ocr response malformed: {0}")]
    InvalidResponse(String),
}

impl OcrError {
    /// Transient errors are worth re-running; configuration problems are
    /// not. Unknown failures default to retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            OcrError::MissingApiKey => false,
            OcrError::Http { status, .. } => is_transient_status(*status),
            OcrError::Transport(_) => true,
            OcrError::InvalidResponse(_) => true,
        }
    }
}

/// HTTP status codes observed to resolve on retry.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// OCR collaborator: document bytes in, markdown out.
#[async_trait::async_trait]
pub trait OcrEngine: Send + Sync {
    async fn parse(&self, bytes: &[u8], mime: &str) -> Result<OcrOutcome, OcrError>;
}

#[derive(Debug, Deserialize)]
struct OcrResponseBody {
    markdown: String,
    #[serde(rename = "pageCount")]
    page_count: u32,
    usage: Option<OcrUsage>,
}

#[derive(Debug, Deserialize)]
struct OcrUsage {
    #[serde(rename = "totalTokens")]
    total_tokens: u64,
}

/// OCR engine speaking the hosted model endpoint. The document travels as
/// a base64 data URL; the response carries markdown plus page count.
pub struct HttpOcrEngine {
    client: reqwest::Client,
    config: OcrConfig,
    api_key: String,
}

impl HttpOcrEngine {
    pub fn from_env(config: OcrConfig) -> Result<Self, OcrError> {
        let api_key = std::env::var(OCR_API_KEY_ENV).map_err(|_| OcrError::MissingApiKey)?;
        Ok(Self::new(config, api_key))
    }

    pub fn new(config: OcrConfig, api_key: impl Into<String>) -> Self {
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
impl OcrEngine for HttpOcrEngine {
    async fn parse(&self, bytes: &[u8], mime: &str) -> Result<OcrOutcome, OcrError> {
        debug_assert!(!bytes.is_empty());
        let data_url = format!("data:{};base64,{}", mime, BASE64_STANDARD.encode(bytes));
        let request = serde_json::json!({
            "model": self.config.model,
            "input": data_url,
            "maxTokens": self.config.max_tokens,
        });

        let endpoint = format!("{}/v1/ocr", self.config.base_url.trim_end_matches('/'));
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
            return Err(OcrError::Http {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        let body: OcrResponseBody = response
            .json()
            .await
            .map_err(|error| OcrError::InvalidResponse(error.to_string()))?;
        if body.markdown.trim().is_empty() {
            return Err(OcrError::InvalidResponse("empty markdown".to_string()));
        }
        Ok(OcrOutcome {
            markdown: body.markdown,
            page_count: body.page_count.max(1),
            token_count: body.usage.map(|usage| usage.total_tokens),
        })
    }
}

fn truncate(raw: &str, limit: usize) -> String {
    if raw.len() <= limit {
        raw.to_string()
    } else {
        let mut end = limit;
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        raw[..end].to_string()
    }
}
