//! Gemini `generateContent` client: turn-based contents with inline image parts.

use super::{
    error_from_response, GenerateRequest, HistoryRole, ProviderAdapter, ProviderError,
    ProviderFamily, SYSTEM_INSTRUCTION,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const TOP_P: f32 = 0.9;

#[derive(Clone)]
pub struct GeminiAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl GeminiAdapter {
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

fn build_request(request: &GenerateRequest<'_>) -> GenerateContentRequest {
    let mut contents: Vec<Content> = request
        .history
        .iter()
        .map(|turn| Content {
            role: match turn.role {
                HistoryRole::User => "user",
                HistoryRole::Model => "model",
            }
            .to_string(),
            parts: vec![Part::Text {
                text: turn.text.clone(),
            }],
        })
        .collect();

    let mut parts = Vec::new();
    if !request.prompt.trim().is_empty() {
        parts.push(Part::Text {
            text: request.prompt.to_string(),
        });
    }
    for image in request.images {
        let (data, mime_type) = image.base64_parts();
        parts.push(Part::InlineData {
            inline_data: InlineData {
                mime_type: mime_type.to_string(),
                data: data.to_string(),
            },
        });
    }
    contents.push(Content {
        role: "user".to_string(),
        parts,
    });

    GenerateContentRequest {
        contents,
        system_instruction: SystemInstruction {
            parts: vec![Part::Text {
                text: SYSTEM_INSTRUCTION.to_string(),
            }],
        },
        generation_config: GenerationConfig {
            max_output_tokens: request.max_tokens(),
            temperature: request.model.temperature,
            top_p: TOP_P,
        },
    }
}

fn extract_text(response: GenerateContentResponse) -> Result<String, ProviderError> {
    let candidate = response.candidates.into_iter().next().ok_or_else(|| {
        let reason = response
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .unwrap_or_else(|| "no candidates".to_string());
        ProviderError::InvalidResponse(format!("gemini returned no candidates ({})", reason))
    })?;
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    Ok(text)
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Gemini
    }

    /// POST /models/{model}:generateContent
    async fn generate(
        &self,
        request: &GenerateRequest<'_>,
        api_key: &str,
    ) -> Result<String, ProviderError> {
        request.validate()?;
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, request.model.model
        );
        let body = build_request(request);
        let res = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(error_from_response(res).await);
        }
        let data: GenerateContentResponse = res.json().await?;
        extract_text(data)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    system_instruction: SystemInstruction,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}
