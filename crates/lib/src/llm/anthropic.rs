//! Anthropic Messages API client: message array with base64 image blocks.

use super::{
    error_from_response, GenerateRequest, HistoryRole, ProviderAdapter, ProviderError,
    ProviderFamily, SYSTEM_INSTRUCTION,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

fn build_request(request: &GenerateRequest<'_>) -> MessagesRequest {
    let mut messages: Vec<Message> = request
        .history
        .iter()
        .map(|turn| Message {
            role: match turn.role {
                HistoryRole::User => "user",
                HistoryRole::Model => "assistant",
            }
            .to_string(),
            content: vec![ContentBlock::Text {
                text: turn.text.clone(),
            }],
        })
        .collect();

    let mut content: Vec<ContentBlock> = request
        .images
        .iter()
        .map(|image| {
            let (data, media_type) = image.base64_parts();
            ContentBlock::Image {
                source: ImageSource {
                    typ: "base64".to_string(),
                    media_type: media_type.to_string(),
                    data: data.to_string(),
                },
            }
        })
        .collect();
    if !request.prompt.trim().is_empty() {
        content.push(ContentBlock::Text {
            text: request.prompt.to_string(),
        });
    }
    messages.push(Message {
        role: "user".to_string(),
        content,
    });

    MessagesRequest {
        model: request.model.model.clone(),
        max_tokens: request.max_tokens(),
        temperature: request.model.temperature,
        system: SYSTEM_INSTRUCTION.to_string(),
        messages,
    }
}

fn extract_text(response: MessagesResponse) -> Result<String, ProviderError> {
    let texts: Vec<String> = response
        .content
        .into_iter()
        .filter(|b| b.typ == "text")
        .filter_map(|b| b.text)
        .collect();
    if texts.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "anthropic response has no text block".to_string(),
        ));
    }
    Ok(texts.concat())
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    /// POST /messages
    async fn generate(
        &self,
        request: &GenerateRequest<'_>,
        api_key: &str,
    ) -> Result<String, ProviderError> {
        request.validate()?;
        let url = format!("{}/messages", self.base_url);
        let body = build_request(request);
        let res = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(error_from_response(res).await);
        }
        let data: MessagesResponse = res.json().await?;
        extract_text(data)
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    typ: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    typ: String,
    #[serde(default)]
    text: Option<String>,
}
