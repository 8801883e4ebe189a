//! Response dispatch: provider key -> family adapter + key pool, with bounded failover.
//!
//! A request tries every available key of its family at most once. Rate-limited keys are
//! blocked and the next key is tried; any other failure aborts the request. When every key is
//! exhausted the caller gets [`EXHAUSTED_REPLY`] as a normal reply instead of an error.

use crate::config::Config;
use crate::keypool::{KeyPool, KeyStatus};
use crate::llm::{
    AnthropicAdapter, GeminiAdapter, GenerateRequest, HistoryTurn, ImageInput, ModelSpec,
    OpenAiAdapter, ProviderAdapter, ProviderError, ProviderFamily,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Provider key used when the client sends none or an unknown one.
pub const DEFAULT_PROVIDER_KEY: &str = "gemini-25-flash";

/// Reply sent in place of an answer when every key of a family is rate limited.
pub const EXHAUSTED_REPLY: &str =
    "⚠️ The AI provider is temporarily unavailable (all API keys are rate limited). Please try again in a minute.";

const CLAUDE_MODEL: &str = "claude-sonnet-4-20250514";
const OPENAI_MODEL: &str = "gpt-4o";
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// A selectable Gemini model.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiVariant {
    pub key: &'static str,
    pub model: &'static str,
    pub display_name: &'static str,
    pub max_tokens: u32,
}

pub static GEMINI_VARIANTS: [GeminiVariant; 3] = [
    GeminiVariant {
        key: "gemini-3-flash-preview",
        model: "gemini-3-flash-preview",
        display_name: "Gemini 3 Flash Preview",
        max_tokens: 8192,
    },
    GeminiVariant {
        key: "gemini-25-flash",
        model: "gemini-2.5-flash",
        display_name: "Gemini 2.5 Flash",
        max_tokens: 8192,
    },
    GeminiVariant {
        key: "gemini-25-flash-lite",
        model: "gemini-2.5-flash-lite",
        display_name: "Gemini 2.5 Flash Lite",
        max_tokens: 4096,
    },
];

fn default_gemini_variant() -> &'static GeminiVariant {
    &GEMINI_VARIANTS[1]
}

/// Family and model for a provider key.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProvider {
    pub family: ProviderFamily,
    pub model: ModelSpec,
}

/// Canonical provider tag for a client-supplied key: blank -> default, display names
/// ("Claude", "ChatGPT") -> lowercase keys, everything else unchanged.
pub fn normalize_provider_key(raw: Option<&str>) -> String {
    let key = raw.map(str::trim).unwrap_or("");
    if key.is_empty() {
        return DEFAULT_PROVIDER_KEY.to_string();
    }
    if key.eq_ignore_ascii_case("claude") {
        "claude".to_string()
    } else if key.eq_ignore_ascii_case("chatgpt") {
        "chatgpt".to_string()
    } else {
        key.to_string()
    }
}

/// Prefix-match a provider key to a family; unknown keys use the default Gemini variant.
pub fn resolve_provider(key: &str) -> ResolvedProvider {
    let key = key.trim();
    let gemini = |v: &GeminiVariant| ResolvedProvider {
        family: ProviderFamily::Gemini,
        model: ModelSpec {
            model: v.model.to_string(),
            max_tokens: v.max_tokens,
            temperature: DEFAULT_TEMPERATURE,
        },
    };
    if key.starts_with("gemini-") {
        let variant = GEMINI_VARIANTS
            .iter()
            .find(|v| v.key == key)
            .unwrap_or_else(default_gemini_variant);
        return gemini(variant);
    }
    match key.to_lowercase().as_str() {
        "claude" => ResolvedProvider {
            family: ProviderFamily::Anthropic,
            model: ModelSpec {
                model: CLAUDE_MODEL.to_string(),
                max_tokens: 2048,
                temperature: DEFAULT_TEMPERATURE,
            },
        },
        "chatgpt" => ResolvedProvider {
            family: ProviderFamily::OpenAi,
            model: ModelSpec {
                model: OPENAI_MODEL.to_string(),
                max_tokens: 2048,
                temperature: DEFAULT_TEMPERATURE,
            },
        },
        _ => gemini(default_gemini_variant()),
    }
}

/// Provider keys understood by the dispatcher (GET /api/models).
pub fn available_models() -> serde_json::Value {
    serde_json::json!({
        "gemini": GEMINI_VARIANTS
            .iter()
            .map(|v| serde_json::json!({ "key": v.key, "name": v.display_name, "model": v.model }))
            .collect::<Vec<_>>(),
        "claude": [{ "key": "claude", "name": "Claude Sonnet 4", "model": CLAUDE_MODEL }],
        "chatgpt": [{ "key": "chatgpt", "name": "ChatGPT", "model": OPENAI_MODEL }],
    })
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no credentials configured for {0}")]
    NotConfigured(ProviderFamily),
    #[error("{family} provider error: {source}")]
    Provider {
        family: ProviderFamily,
        #[source]
        source: ProviderError,
    },
    #[error("{family} provider call timed out after {secs}s")]
    Timeout { family: ProviderFamily, secs: u64 },
}

struct Route {
    adapter: Arc<dyn ProviderAdapter>,
    pool: Arc<KeyPool>,
}

/// Registry of family -> (adapter, key pool), built once at startup.
pub struct ResponseDispatcher {
    routes: HashMap<ProviderFamily, Route>,
    call_timeout: Duration,
}

impl ResponseDispatcher {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            routes: HashMap::new(),
            call_timeout,
        }
    }

    /// Register (or replace) the adapter and pool for the adapter's family.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>, pool: Arc<KeyPool>) {
        let family = adapter.family();
        log::info!("dispatcher: {} registered with {} key(s)", family, pool.len());
        self.routes.insert(family, Route { adapter, pool });
    }

    /// Build from config: every family with at least one key gets its HTTP adapter.
    pub fn from_config(config: &Config) -> Self {
        let mut dispatcher =
            Self::new(Duration::from_secs(config.relay.provider_timeout_secs.max(1)));
        let block = chrono::Duration::seconds(config.key_pool.block_seconds as i64);
        let families: [(ProviderFamily, &crate::config::ProviderCredentials); 3] = [
            (ProviderFamily::Gemini, &config.providers.gemini),
            (ProviderFamily::Anthropic, &config.providers.anthropic),
            (ProviderFamily::OpenAi, &config.providers.openai),
        ];
        for (family, creds) in families {
            let pool = match KeyPool::with_policy(
                family.as_str(),
                creds.api_keys.clone(),
                config.key_pool.max_consecutive_errors,
                block,
            ) {
                Ok(p) => Arc::new(p),
                Err(e) => {
                    log::info!("dispatcher: {} disabled: {}", family, e);
                    continue;
                }
            };
            let adapter: Arc<dyn ProviderAdapter> = match family {
                ProviderFamily::Gemini => Arc::new(GeminiAdapter::new(creds.base_url.clone())),
                ProviderFamily::Anthropic => {
                    Arc::new(AnthropicAdapter::new(creds.base_url.clone()))
                }
                ProviderFamily::OpenAi => Arc::new(OpenAiAdapter::new(creds.base_url.clone())),
            };
            dispatcher.register(adapter, pool);
        }
        dispatcher
    }

    pub fn families(&self) -> Vec<ProviderFamily> {
        let mut f: Vec<_> = self.routes.keys().copied().collect();
        f.sort_by_key(|f| f.as_str());
        f
    }

    /// Generate a reply for `provider_key`. Returns [`EXHAUSTED_REPLY`] when every key of the
    /// family is rate limited or blocked.
    pub async fn respond(
        &self,
        prompt: &str,
        images: &[ImageInput],
        history: &[HistoryTurn],
        provider_key: &str,
    ) -> Result<String, DispatchError> {
        let resolved = resolve_provider(provider_key);
        let family = resolved.family;
        let route = self
            .routes
            .get(&family)
            .ok_or(DispatchError::NotConfigured(family))?;
        let request = GenerateRequest {
            prompt,
            images,
            history,
            model: &resolved.model,
        };
        request
            .validate()
            .map_err(|source| DispatchError::Provider { family, source })?;

        log::info!("dispatch: {} via {} ({})", provider_key, family, resolved.model.model);
        for _ in 0..route.pool.len() {
            let Some(lease) = route.pool.next_available() else {
                break;
            };
            let call = route.adapter.generate(&request, &lease.credential);
            match tokio::time::timeout(self.call_timeout, call).await {
                Ok(Ok(text)) => {
                    route.pool.mark_success(lease.index);
                    return Ok(text);
                }
                Ok(Err(e)) if e.is_rate_limited() => {
                    log::warn!("dispatch: {} key {} rate limited: {}", family, lease.index + 1, e);
                    route.pool.mark_failed(lease.index, true);
                    route.pool.rotate();
                }
                Ok(Err(e)) => {
                    log::warn!("dispatch: {} key {} failed: {}", family, lease.index + 1, e);
                    route.pool.mark_failed(lease.index, false);
                    route.pool.rotate();
                    return Err(DispatchError::Provider { family, source: e });
                }
                Err(_) => {
                    log::warn!("dispatch: {} key {} timed out", family, lease.index + 1);
                    route.pool.mark_failed(lease.index, false);
                    route.pool.rotate();
                    return Err(DispatchError::Timeout {
                        family,
                        secs: self.call_timeout.as_secs(),
                    });
                }
            }
        }
        log::warn!("dispatch: all {} keys exhausted", family);
        Ok(EXHAUSTED_REPLY.to_string())
    }

    /// Per-key status across all families.
    pub fn key_status(&self) -> Vec<KeyStatus> {
        self.families()
            .into_iter()
            .filter_map(|f| self.routes.get(&f))
            .flat_map(|r| r.pool.status())
            .collect()
    }

    pub fn unblock_all(&self) {
        for route in self.routes.values() {
            route.pool.unblock_all();
        }
    }
}
