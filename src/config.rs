//! Configuration types for a pipeline run.
//!
//! Every knob lives in [`PipelineConfig`], built through
//! [`PipelineConfigBuilder`]. External calls are configured per
//! [`ProviderRole`]: each role (OCR, formatting, translation, analysis) has its
//! own model, token budget and [`ProviderLimits`], because each one talks to a
//! provider with its own quota and latency profile.

use crate::error::PipelineError;
use crate::provider::CompletionProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The four kinds of external call the pipeline makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    /// Vision model reading raw text off a page image.
    Ocr,
    /// LLM turning OCR text (plus the page image) into markdown.
    Format,
    /// LLM translating the whole transcript.
    Translate,
    /// LLM classifying the document and extracting filing metadata.
    Analyze,
}

impl ProviderRole {
    pub const ALL: [ProviderRole; 4] = [
        ProviderRole::Ocr,
        ProviderRole::Format,
        ProviderRole::Translate,
        ProviderRole::Analyze,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderRole::Ocr => "ocr",
            ProviderRole::Format => "format",
            ProviderRole::Translate => "translate",
            ProviderRole::Analyze => "analyze",
        }
    }
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota and retry policy for one provider role.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProviderLimits {
    /// Maximum simultaneous in-flight requests.
    pub max_in_flight: usize,

    /// Minimum spacing between request starts, in milliseconds. 0 disables pacing.
    pub min_interval_ms: u64,

    /// Retries after the first attempt on a retryable failure.
    pub max_retries: u32,

    /// Initial backoff in milliseconds; doubles after each retry.
    pub retry_backoff_ms: u64,

    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

impl ProviderLimits {
    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            min_interval_ms: 200,
            max_retries: 3,
            retry_backoff_ms: 500,
            timeout_secs: 60,
        }
    }
}

/// Model and limits for one provider role.
#[derive(Clone)]
pub struct ProviderSettings {
    /// edgequake-llm provider name (e.g. "openai", "anthropic", "gemini").
    /// If None, the provider is auto-detected from the environment.
    pub provider_name: Option<String>,

    /// Model identifier. If None, the role's default model is used.
    pub model: Option<String>,

    /// Pre-constructed provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn CompletionProvider>>,

    pub temperature: f32,

    pub max_tokens: usize,

    pub limits: ProviderLimits,
}

impl ProviderSettings {
    fn for_role(role: ProviderRole) -> Self {
        let (temperature, max_tokens, limits) = match role {
            ProviderRole::Ocr | ProviderRole::Format => (0.1, 4096, ProviderLimits::default()),
            // One call per document; long transcripts need a long budget.
            ProviderRole::Translate => (
                0.2,
                16384,
                ProviderLimits {
                    max_in_flight: 2,
                    timeout_secs: 300,
                    ..ProviderLimits::default()
                },
            ),
            ProviderRole::Analyze => (
                0.0,
                2048,
                ProviderLimits {
                    max_in_flight: 2,
                    timeout_secs: 120,
                    ..ProviderLimits::default()
                },
            ),
        };
        Self {
            provider_name: None,
            model: None,
            provider: None,
            temperature,
            max_tokens,
            limits,
        }
    }

    /// Model to request, falling back to the role default.
    pub fn model_or_default(&self, role: ProviderRole) -> &str {
        self.model.as_deref().unwrap_or(match role {
            ProviderRole::Ocr => DEFAULT_OCR_MODEL,
            _ => DEFAULT_TEXT_MODEL,
        })
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn CompletionProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("limits", &self.limits)
            .finish()
    }
}

/// Default vision model for the OCR role.
pub const DEFAULT_OCR_MODEL: &str = "gpt-4o-mini";

/// Default model for formatting, translation and analysis.
pub const DEFAULT_TEXT_MODEL: &str = "gpt-4o";

/// Configuration for a pipeline run.
///
/// # Example
/// ```rust
/// use handbook_pipeline::{PipelineConfig, ProviderRole};
///
/// let config = PipelineConfig::builder()
///     .dpi(200)
///     .document_concurrency(2)
///     .model(ProviderRole::Translate, "gpt-4.1")
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 200);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Rendering DPI for page images. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Cap on either rendered dimension in pixels, applied after DPI scaling.
    /// Default: 2500.
    pub max_rendered_pixels: u32,

    /// Size of the CPU pool for rasterisation. Default: available cores.
    pub render_workers: usize,

    /// Documents processed concurrently. Default: 4.
    pub document_concurrency: usize,

    /// Language the handbooks are written in. Default: "Japanese".
    pub source_language: String,

    /// Language of the translated variant. Default: "Simplified Chinese".
    pub target_language: String,

    /// Minimum classifier confidence for a valid verdict. Default: 0.7.
    pub confidence_threshold: f32,

    /// Character budget per text (transcript, translation) sent to analysis.
    /// Default: 60 000.
    pub analysis_char_budget: usize,

    /// Separator between pages in the assembled transcript.
    pub page_separator: PageSeparator,

    /// Copy the source PDF into the output tree instead of moving it.
    pub copy_source: bool,

    pub ocr: ProviderSettings,
    pub format: ProviderSettings,
    pub translate: ProviderSettings,
    pub analyze: ProviderSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dpi: 150,
            max_rendered_pixels: 2500,
            render_workers: default_render_workers(),
            document_concurrency: 4,
            source_language: "Japanese".to_string(),
            target_language: "Simplified Chinese".to_string(),
            confidence_threshold: 0.7,
            analysis_char_budget: 60_000,
            page_separator: PageSeparator::default(),
            copy_source: false,
            ocr: ProviderSettings::for_role(ProviderRole::Ocr),
            format: ProviderSettings::for_role(ProviderRole::Format),
            translate: ProviderSettings::for_role(ProviderRole::Translate),
            analyze: ProviderSettings::for_role(ProviderRole::Analyze),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("render_workers", &self.render_workers)
            .field("document_concurrency", &self.document_concurrency)
            .field("source_language", &self.source_language)
            .field("target_language", &self.target_language)
            .field("confidence_threshold", &self.confidence_threshold)
            .field("page_separator", &self.page_separator)
            .field("copy_source", &self.copy_source)
            .field("ocr", &self.ocr)
            .field("format", &self.format)
            .field("translate", &self.translate)
            .field("analyze", &self.analyze)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn settings(&self, role: ProviderRole) -> &ProviderSettings {
        match role {
            ProviderRole::Ocr => &self.ocr,
            ProviderRole::Format => &self.format,
            ProviderRole::Translate => &self.translate,
            ProviderRole::Analyze => &self.analyze,
        }
    }

    fn settings_mut(&mut self, role: ProviderRole) -> &mut ProviderSettings {
        match role {
            ProviderRole::Ocr => &mut self.ocr,
            ProviderRole::Format => &mut self.format,
            ProviderRole::Translate => &mut self.translate,
            ProviderRole::Analyze => &mut self.analyze,
        }
    }
}

fn default_render_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn render_workers(mut self, n: usize) -> Self {
        self.config.render_workers = n.max(1);
        self
    }

    pub fn document_concurrency(mut self, n: usize) -> Self {
        self.config.document_concurrency = n.max(1);
        self
    }

    pub fn source_language(mut self, lang: impl Into<String>) -> Self {
        self.config.source_language = lang.into();
        self
    }

    pub fn target_language(mut self, lang: impl Into<String>) -> Self {
        self.config.target_language = lang.into();
        self
    }

    pub fn confidence_threshold(mut self, t: f32) -> Self {
        self.config.confidence_threshold = t.clamp(0.0, 1.0);
        self
    }

    pub fn analysis_char_budget(mut self, chars: usize) -> Self {
        self.config.analysis_char_budget = chars.max(1000);
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn copy_source(mut self, v: bool) -> Self {
        self.config.copy_source = v;
        self
    }

    /// Use the same edgequake-llm provider name for every role.
    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        for role in ProviderRole::ALL {
            self.config.settings_mut(role).provider_name = Some(name.clone());
        }
        self
    }

    pub fn model(mut self, role: ProviderRole, model: impl Into<String>) -> Self {
        self.config.settings_mut(role).model = Some(model.into());
        self
    }

    /// Inject a pre-built provider for one role.
    pub fn provider(mut self, role: ProviderRole, provider: Arc<dyn CompletionProvider>) -> Self {
        self.config.settings_mut(role).provider = Some(provider);
        self
    }

    /// Inject the same pre-built provider for every role.
    pub fn provider_for_all(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        for role in ProviderRole::ALL {
            self.config.settings_mut(role).provider = Some(Arc::clone(&provider));
        }
        self
    }

    pub fn max_tokens(mut self, role: ProviderRole, n: usize) -> Self {
        self.config.settings_mut(role).max_tokens = n.max(1);
        self
    }

    pub fn temperature(mut self, role: ProviderRole, t: f32) -> Self {
        self.config.settings_mut(role).temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn limits(mut self, role: ProviderRole, limits: ProviderLimits) -> Self {
        self.config.settings_mut(role).limits = limits;
        self
    }

    pub fn max_in_flight(mut self, role: ProviderRole, n: usize) -> Self {
        self.config.settings_mut(role).limits.max_in_flight = n.max(1);
        self
    }

    pub fn min_interval_ms(mut self, role: ProviderRole, ms: u64) -> Self {
        self.config.settings_mut(role).limits.min_interval_ms = ms;
        self
    }

    /// Retry ceiling for every role.
    pub fn max_retries(mut self, n: u32) -> Self {
        for role in ProviderRole::ALL {
            self.config.settings_mut(role).limits.max_retries = n;
        }
        self
    }

    /// Backoff base for every role.
    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        for role in ProviderRole::ALL {
            self.config.settings_mut(role).limits.retry_backoff_ms = ms;
        }
        self
    }

    /// Retry ceiling for one role, overriding [`PipelineConfigBuilder::max_retries`]
    /// when called after it.
    pub fn role_max_retries(mut self, role: ProviderRole, n: u32) -> Self {
        self.config.settings_mut(role).limits.max_retries = n;
        self
    }

    /// Backoff base for one role.
    pub fn role_retry_backoff_ms(mut self, role: ProviderRole, ms: u64) -> Self {
        self.config.settings_mut(role).limits.retry_backoff_ms = ms;
        self
    }

    /// Per-call timeout for the per-page roles (OCR and formatting).
    /// Translation and analysis keep their longer defaults unless set via
    /// [`PipelineConfigBuilder::limits`].
    pub fn page_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ocr.limits.timeout_secs = secs;
        self.config.format.limits.timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(PipelineError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.document_concurrency == 0 || c.render_workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "Document concurrency and render workers must be ≥ 1".into(),
            ));
        }
        for role in ProviderRole::ALL {
            let limits = &c.settings(role).limits;
            if limits.max_in_flight == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{role}: max in-flight requests must be ≥ 1"
                )));
            }
            if limits.timeout_secs == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{role}: timeout must be ≥ 1s"
                )));
            }
        }
        if c.source_language.trim().is_empty() || c.target_language.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Source and target language must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How to separate pages in the assembled transcript.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum PageSeparator {
    /// No separator; pages joined with "\n\n". (default)
    #[default]
    None,
    /// Horizontal rule: "\n\n---\n\n"
    HorizontalRule,
    /// HTML comment with page number: "<!-- page N -->"
    Comment,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator placed before the given page (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {} -->\n\n", page_num),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_role() {
        let c = PipelineConfig::default();
        assert_eq!(c.dpi, 150);
        assert_eq!(c.translate.limits.max_in_flight, 2);
        assert_eq!(c.translate.limits.timeout_secs, 300);
        assert_eq!(c.analyze.temperature, 0.0);
        assert_eq!(c.ocr.model_or_default(ProviderRole::Ocr), DEFAULT_OCR_MODEL);
        assert_eq!(
            c.format.model_or_default(ProviderRole::Format),
            DEFAULT_TEXT_MODEL
        );
    }

    #[test]
    fn builder_clamps_and_applies_per_role() {
        let c = PipelineConfig::builder()
            .dpi(1000)
            .max_in_flight(ProviderRole::Ocr, 0)
            .model(ProviderRole::Analyze, "claude-sonnet-4-20250514")
            .max_retries(5)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 400);
        assert_eq!(c.ocr.limits.max_in_flight, 1);
        assert_eq!(c.analyze.model.as_deref(), Some("claude-sonnet-4-20250514"));
        for role in ProviderRole::ALL {
            assert_eq!(c.settings(role).limits.max_attempts(), 6);
        }
    }

    #[test]
    fn retry_policy_per_role() {
        let c = PipelineConfig::builder()
            .max_retries(2)
            .retry_backoff_ms(100)
            .role_max_retries(ProviderRole::Translate, 6)
            .role_retry_backoff_ms(ProviderRole::Ocr, 2000)
            .build()
            .unwrap();
        assert_eq!(c.translate.limits.max_retries, 6);
        assert_eq!(c.ocr.limits.max_retries, 2);
        assert_eq!(c.ocr.limits.retry_backoff_ms, 2000);
        assert_eq!(c.analyze.limits.retry_backoff_ms, 100);
    }

    #[test]
    fn build_rejects_empty_language() {
        let err = PipelineConfig::builder()
            .target_language("  ")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("language"));
    }

    #[test]
    fn build_rejects_zero_timeout() {
        let err = PipelineConfig::builder()
            .limits(
                ProviderRole::Translate,
                ProviderLimits {
                    timeout_secs: 0,
                    ..ProviderLimits::default()
                },
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("translate"));
    }

    #[test]
    fn separator_render() {
        assert_eq!(PageSeparator::None.render(2), "\n\n");
        assert_eq!(PageSeparator::Comment.render(3), "\n\n<!-- page 3 -->\n\n");
        assert_eq!(
            PageSeparator::Custom("***".into()).render(1),
            "\n\n***\n\n"
        );
    }
}
