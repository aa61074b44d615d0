//! The provider boundary.
//!
//! Stages talk to language models only through [`CompletionProvider`]. The
//! production implementation, [`LlmCompletionProvider`], wraps an
//! `edgequake_llm::LLMProvider`; tests substitute scripted fakes.
//!
//! Everything that crosses this boundary is typed: a failed call is always a
//! [`ProviderError`] with a kind the retry driver can act on, and an empty
//! answer is a [`ProviderError::MalformedResponse`], never an empty string.

use crate::config::{ProviderRole, ProviderSettings};
use crate::error::{PipelineError, ProviderError};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// One request to a model: a system prompt, user text and optional images.
#[derive(Clone)]
pub struct Request {
    pub system: String,
    pub user: String,
    pub images: Vec<ImageData>,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Request {
    pub fn text(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            images: Vec::new(),
            temperature: 0.1,
            max_tokens: 4096,
        }
    }

    pub fn with_image(mut self, image: ImageData) -> Self {
        self.images.push(image);
        self
    }

    /// Apply the temperature and token budget of a role.
    pub fn with_settings(mut self, settings: &ProviderSettings) -> Self {
        self.temperature = settings.temperature;
        self.max_tokens = settings.max_tokens;
        self
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Image payloads are megabytes of base64; log their count only.
        f.debug_struct("Request")
            .field("system_len", &self.system.len())
            .field("user_len", &self.user.len())
            .field("images", &self.images.len())
            .finish()
    }
}

/// A successful model answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// A model endpoint the pipeline can call.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Name used in logs, errors and the run report.
    fn name(&self) -> &str;

    async fn complete(&self, request: &Request) -> Result<Completion, ProviderError>;
}

/// [`CompletionProvider`] backed by an edgequake-llm provider.
pub struct LlmCompletionProvider {
    name: String,
    inner: Arc<dyn LLMProvider>,
}

impl LlmCompletionProvider {
    pub fn new(name: impl Into<String>, inner: Arc<dyn LLMProvider>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

#[async_trait]
impl CompletionProvider for LlmCompletionProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &Request) -> Result<Completion, ProviderError> {
        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(ChatMessage::system(request.system.as_str()));
        }
        if request.images.is_empty() {
            messages.push(ChatMessage::user(request.user.as_str()));
        } else {
            messages.push(ChatMessage::user_with_images(
                request.user.as_str(),
                request.images.clone(),
            ));
        }

        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let response = self
            .inner
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| classify_error(&self.name, &e.to_string()))?;

        debug!(
            provider = %self.name,
            input_tokens = response.prompt_tokens,
            output_tokens = response.completion_tokens,
            "completion received"
        );

        if response.content.trim().is_empty() {
            return Err(ProviderError::MalformedResponse {
                provider: self.name.clone(),
                detail: "empty response".into(),
            });
        }

        Ok(Completion {
            content: response.content,
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
        })
    }
}

/// An HTTP status as edgequake-llm prints it: `API error (400)`,
/// `HTTP 401`, `status: 503` or a leading `429 Too Many Requests`. Bare
/// numbers elsewhere in the text (token counts, byte sizes) never match.
static RE_STATUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\(|\b(?:http(?:/\d(?:\.\d)?)?|status|code|error)\b[\s:=]*)([1-5]\d{2})\b")
        .unwrap()
});

fn status_code(lower: &str) -> Option<u16> {
    RE_STATUS
        .captures(lower)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Map a provider error message to a [`ProviderError`] kind.
///
/// edgequake-llm surfaces HTTP failures as messages that carry the status code
/// or the provider's error text. A recognised status code decides the kind;
/// otherwise classification works on keywords in the lowercased message.
pub fn classify_error(provider: &str, message: &str) -> ProviderError {
    let lower = message.to_lowercase();
    let provider = provider.to_string();
    let detail = message.to_string();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    match status_code(&lower) {
        Some(401 | 403) => return ProviderError::Authentication { provider, detail },
        Some(429) => {
            return ProviderError::RateLimited {
                provider,
                retry_after_secs: parse_retry_after(&lower),
            }
        }
        Some(408) => return ProviderError::Timeout { provider, secs: 0 },
        Some(500..=599) => return ProviderError::Transient { provider, detail },
        _ => {}
    }

    if has(&[
        "unauthorized",
        "forbidden",
        "invalid api key",
        "invalid_api_key",
        "incorrect api key",
        "authentication",
        "permission denied",
    ]) {
        ProviderError::Authentication { provider, detail }
    } else if has(&["rate limit", "rate_limit", "too many requests", "quota"]) {
        ProviderError::RateLimited {
            provider,
            retry_after_secs: parse_retry_after(&lower),
        }
    } else if has(&["timed out", "timeout", "deadline exceeded"]) {
        ProviderError::Timeout { provider, secs: 0 }
    } else if has(&[
        "overloaded",
        "internal server error",
        "bad gateway",
        "service unavailable",
        "connection",
        "network",
        "reset by peer",
        "broken pipe",
    ]) {
        ProviderError::Transient { provider, detail }
    } else if has(&["invalid json", "failed to parse", "deserializ", "unexpected response"]) {
        ProviderError::MalformedResponse { provider, detail }
    } else {
        ProviderError::Rejected { provider, detail }
    }
}

/// Extract "retry after N" seconds from a rate-limit message, when present.
fn parse_retry_after(lower: &str) -> Option<u64> {
    let idx = lower.find("retry after").or_else(|| lower.find("retry-after"))?;
    lower[idx + "retry after".len()..]
        .trim_start_matches([' ', ':'])
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|n| n.parse().ok())
}

fn create_llm_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the provider for one role, from most-specific to least-specific:
///
/// 1. a pre-built provider in the settings;
/// 2. a named edgequake-llm provider with the role's model;
/// 3. OpenAI when `OPENAI_API_KEY` is set;
/// 4. whatever `ProviderFactory::from_env` detects.
pub fn resolve_provider(
    role: ProviderRole,
    settings: &ProviderSettings,
) -> Result<Arc<dyn CompletionProvider>, PipelineError> {
    if let Some(ref provider) = settings.provider {
        return Ok(Arc::clone(provider));
    }

    let model = settings.model_or_default(role);
    let label = |backend: &str| format!("{role}:{backend}/{model}");

    if let Some(ref name) = settings.provider_name {
        let inner = create_llm_provider(name, model)?;
        return Ok(Arc::new(LlmCompletionProvider::new(label(name), inner)));
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let inner = create_llm_provider("openai", model)?;
            return Ok(Arc::new(LlmCompletionProvider::new(label("openai"), inner)));
        }
    }

    let (inner, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or HANDBOOKS_PROVIDER.\n\
                Error: {}",
                e
            ),
        })?;
    Ok(Arc::new(LlmCompletionProvider::new(
        format!("{role}:auto"),
        inner,
    )))
}
