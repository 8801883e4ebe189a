//! Provider adapters: one per AI provider family.
//!
//! Each adapter turns (prompt, images, trimmed history) into a single text reply using exactly
//! one credential. Adapters never touch history; the relay owns it. Errors distinguish
//! rate limiting (retry with another key) from everything else (abort the request).

mod anthropic;
mod gemini;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Concise-answer instruction sent with every provider request.
pub const SYSTEM_INSTRUCTION: &str =
    "You are a helpful assistant. Give concise, direct answers and use the conversation context.";

/// Provider family; one adapter and one key pool per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    Gemini,
    Anthropic,
    OpenAi,
}

impl ProviderFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderFamily::Gemini => "gemini",
            ProviderFamily::Anthropic => "anthropic",
            ProviderFamily::OpenAi => "openai",
        }
    }
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speaker of one history turn as providers see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: HistoryRole,
    pub text: String,
}

impl HistoryTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::Model,
            text: text.into(),
        }
    }
}

/// Image attached to the current prompt: base64 or a data URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub data: String,
    pub mime_type: String,
}

impl ImageInput {
    /// Raw base64 payload (data-URI prefix removed) and its mime type. A mime type embedded in
    /// the data URI wins over the declared one.
    pub fn base64_parts(&self) -> (&str, &str) {
        match split_data_uri(&self.data) {
            Some((mime, b64)) => (b64, mime),
            None => (self.data.as_str(), self.mime_type.as_str()),
        }
    }

    /// The image as a data URI (as-is when it already is one).
    pub fn data_uri(&self) -> String {
        if split_data_uri(&self.data).is_some() {
            self.data.clone()
        } else {
            format!("data:{};base64,{}", self.mime_type, self.data)
        }
    }
}

/// `data:<mime>;base64,<payload>` -> (mime, payload).
fn split_data_uri(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    Some((mime, payload))
}

/// Model selection and generation limits for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Everything an adapter needs for one call, borrowed from the caller.
#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    pub prompt: &'a str,
    pub images: &'a [ImageInput],
    pub history: &'a [HistoryTurn],
    pub model: &'a ModelSpec,
}

impl GenerateRequest<'_> {
    /// A request needs text, at least one image, or both.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.prompt.trim().is_empty() && self.images.is_empty() {
            return Err(ProviderError::InvalidInput(
                "prompt may be empty only when an image is attached".to_string(),
            ));
        }
        Ok(())
    }

    /// Output budget for this prompt, capped by the model's maximum.
    pub fn max_tokens(&self) -> u32 {
        estimate_max_tokens(self.prompt).min(self.model.max_tokens)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ProviderError {
    /// True when another credential may succeed (HTTP 429 / quota exhaustion).
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::RateLimited(_))
    }
}

/// True when an error message looks like a quota or rate-limit rejection.
pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("quota")
        || lower.contains("rate limit")
        || lower.contains("429")
        || message.contains("RESOURCE_EXHAUSTED")
}

/// Map a non-success HTTP response to a provider error.
pub(crate) fn classify_http_error(status: reqwest::StatusCode, body: String) -> ProviderError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || is_rate_limit_message(&body) {
        ProviderError::RateLimited(format!("{} {}", status, body))
    } else {
        ProviderError::Api {
            status: status.as_u16(),
            body,
        }
    }
}

/// Read the body of a failed response and classify it.
pub(crate) async fn error_from_response(res: reqwest::Response) -> ProviderError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    classify_http_error(status, body)
}

/// Cheap output budget: longer prompts get more room, code-like prompts the most.
pub fn estimate_max_tokens(prompt: &str) -> u32 {
    let len = prompt.chars().count();
    let base = if len < 100 {
        1024
    } else if len < 300 {
        1536
    } else if len < 600 {
        2048
    } else {
        3072
    };
    if looks_like_code(prompt) {
        base.max(4096)
    } else {
        base
    }
}

fn looks_like_code(prompt: &str) -> bool {
    const MARKERS: [&str; 8] = ["```", "fn ", "def ", "class ", "function ", "#include", "=>", "};"];
    MARKERS.iter().any(|m| prompt.contains(m))
}

/// One provider family's request formatting and transport.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn family(&self) -> ProviderFamily;

    /// Send one request with the given credential and return the reply text untouched.
    async fn generate(
        &self,
        request: &GenerateRequest<'_>,
        api_key: &str,
    ) -> Result<String, ProviderError>;
}
