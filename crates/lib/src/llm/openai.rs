//! OpenAI chat completions client: message array with image URL parts.

use super::{
    error_from_response, GenerateRequest, HistoryRole, ProviderAdapter, ProviderError,
    ProviderFamily, SYSTEM_INSTRUCTION,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiAdapter {
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

fn build_request(request: &GenerateRequest<'_>) -> ChatRequest {
    let mut messages = vec![ChatMessage {
        role: "system".to_string(),
        content: MessageContent::Text(SYSTEM_INSTRUCTION.to_string()),
    }];
    messages.extend(request.history.iter().map(|turn| ChatMessage {
        role: match turn.role {
            HistoryRole::User => "user",
            HistoryRole::Model => "assistant",
        }
        .to_string(),
        content: MessageContent::Text(turn.text.clone()),
    }));

    let mut parts: Vec<ContentPart> = request
        .images
        .iter()
        .map(|image| ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: image.data_uri(),
            },
        })
        .collect();
    if !request.prompt.trim().is_empty() {
        parts.push(ContentPart::Text {
            text: request.prompt.to_string(),
        });
    }
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: MessageContent::Parts(parts),
    });

    ChatRequest {
        model: request.model.model.clone(),
        max_tokens: request.max_tokens(),
        temperature: request.model.temperature,
        messages,
    }
}

fn extract_text(response: ChatResponse) -> Result<String, ProviderError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ProviderError::InvalidResponse("openai response has no content".to_string()))
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAi
    }

    /// POST /chat/completions
    async fn generate(
        &self,
        request: &GenerateRequest<'_>,
        api_key: &str,
    ) -> Result<String, ProviderError> {
        request.validate()?;
        let url = format!("{}/chat/completions", self.base_url);
        let body = build_request(request);
        let res = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(error_from_response(res).await);
        }
        let data: ChatResponse = res.json().await?;
        extract_text(data)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{HistoryTurn, ImageInput, ModelSpec};

    #[test]
    fn images_are_sent_as_data_urls() {
        let model = ModelSpec {
            model: "gpt-4o".into(),
            max_tokens: 2048,
            temperature: 0.7,
        };
        let history = [HistoryTurn::user("q"), HistoryTurn::model("a")];
        let images = [ImageInput {
            data: "QUJD".into(),
            mime_type: "image/png".into(),
        }];
        let req = GenerateRequest {
            prompt: "and this?",
            images: &images,
            history: &history,
            model: &model,
        };
        let json = serde_json::to_value(build_request(&req)).unwrap();
        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["content"], "a");
        let parts = messages[3]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "image_url");
        assert_eq!(parts[0]["image_url"]["url"], "data:image/png;base64,QUJD");
        assert_eq!(parts[1]["text"], "and this?");
    }

    #[test]
    fn missing_choice_is_an_error() {
        let res: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(extract_text(res).is_err());
        let res: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"ok"}}]}"#).unwrap();
        assert_eq!(extract_text(res).unwrap(), "ok");
    }
}
