//! Error types for the handbook pipeline.
//!
//! The split mirrors the two ways a run can go wrong:
//!
//! * [`PipelineError`] — **Fatal**: the run cannot continue at all (input
//!   directory missing, provider not configured, credentials rejected, PDFium
//!   unavailable). Returned as `Err(PipelineError)` from [`crate::run::Pipeline::run`].
//!
//! * Unit-level errors — [`ProviderError`] for one external call,
//!   [`RenderError`] for one PDF, [`OrganizeError`] for one placement. These
//!   are contained by the stage that produced them, degraded into a visible
//!   outcome (placeholder page, missing translation, held document) and
//!   counted in the [`crate::report::RunReport`].
//!
//! The only unit-level error that escalates is
//! [`ProviderError::Authentication`]: retrying cannot fix bad credentials, and
//! carrying on would spend quota on guaranteed failures.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input directory does not exist.
    #[error("Input directory not found: '{path}'")]
    InputDirNotFound { path: PathBuf },

    /// Input directory exists but could not be listed.
    #[error("Failed to read input directory '{path}': {source}")]
    InputDirUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Provider errors ───────────────────────────────────────────────────
    /// The configured provider could not be built (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// A provider rejected our credentials. The run is aborted.
    #[error("Authentication error from provider '{provider}': {detail}\nCheck the API key; the run was aborted.")]
    Authentication { provider: String, detail: String },

    /// The run was cancelled from outside (e.g. Ctrl-C).
    #[error("Run interrupted; documents not yet finished were left in place")]
    Interrupted,

    // ── Output errors ─────────────────────────────────────────────────────
    /// The run output root could not be created.
    #[error("Failed to create output directory '{path}': {source}")]
    OutputRootFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `--resume` named a run root that does not exist.
    #[error("Run root to resume not found: '{path}'")]
    ResumeRootNotFound { path: PathBuf },

    /// The placement journal of a resumed run root could not be read.
    #[error("Failed to resume '{path}': {source}")]
    ResumeFailed {
        path: PathBuf,
        #[source]
        source: OrganizeError,
    },

    /// The final report could not be written.
    #[error("Failed to write report '{path}': {source}")]
    ReportWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDFium is normally downloaded automatically on first run.\n\
If the auto-download failed, you can:\n\
  • Check your internet connection and try again.\n\
  • Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single external provider call.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProviderError {
    /// 5xx, connection reset, overloaded backend.
    #[error("{provider}: transient failure: {detail}")]
    Transient { provider: String, detail: String },

    /// HTTP 429.
    #[error("{provider}: rate limit exceeded")]
    RateLimited {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    /// The per-call timeout elapsed.
    #[error("{provider}: call timed out after {secs}s")]
    Timeout { provider: String, secs: u64 },

    /// 401/403 or an invalid/expired API key.
    #[error("{provider}: authentication failed: {detail}")]
    Authentication { provider: String, detail: String },

    /// The response did not match the expected schema.
    #[error("{provider}: malformed response: {detail}")]
    MalformedResponse { provider: String, detail: String },

    /// The provider refused the request for a reason retries will not fix
    /// (bad request, content filter, context too long).
    #[error("{provider}: request rejected: {detail}")]
    Rejected { provider: String, detail: String },
}

impl ProviderError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient { .. }
                | ProviderError::RateLimited { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::MalformedResponse { .. }
        )
    }

    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::Authentication { .. })
    }

    /// Short, stable label used as the failure kind in the run report.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transient { .. } => "transient",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::Authentication { .. } => "authentication",
            ProviderError::MalformedResponse { .. } => "malformed_response",
            ProviderError::Rejected { .. } => "rejected",
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            ProviderError::Transient { provider, .. }
            | ProviderError::RateLimited { provider, .. }
            | ProviderError::Timeout { provider, .. }
            | ProviderError::Authentication { provider, .. }
            | ProviderError::MalformedResponse { provider, .. }
            | ProviderError::Rejected { provider, .. } => provider,
        }
    }
}

impl From<ProviderError> for PipelineError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Authentication { provider, detail } => {
                PipelineError::Authentication { provider, detail }
            }
            other => PipelineError::Internal(format!("unexpected escalation: {other}")),
        }
    }
}

/// Rasterisation failure for one PDF.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// The file does not start with the `%PDF` magic bytes.
    #[error("File is not a valid PDF: '{path}' (first bytes: {magic:?})")]
    NotAPdf { path: PathBuf, magic: Vec<u8> },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    /// PDF requires a password; handbooks are never expected to be encrypted.
    #[error("PDF '{path}' is encrypted and requires a password")]
    PasswordRequired { path: PathBuf },

    /// One page could not be rendered or saved.
    #[error("Rasterisation failed for page {page}: {detail}")]
    Page { page: usize, detail: String },

    /// The rendering engine itself is unavailable. Fatal for the run.
    #[error("PDF engine unavailable: {0}")]
    Engine(String),
}

impl RenderError {
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::NotAPdf { .. } => "not_a_pdf",
            RenderError::Corrupt { .. } => "corrupt",
            RenderError::PasswordRequired { .. } => "encrypted",
            RenderError::Page { .. } => "page",
            RenderError::Engine(_) => "engine",
        }
    }
}

/// Failure while placing a document's outputs.
#[derive(Debug, Error)]
pub enum OrganizeError {
    #[error("Failed to create folder '{path}': {source}")]
    CreateFolder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move '{from}' to '{to}': {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Organize was asked to file a document without usable metadata.
    #[error("Document '{path}' has no filing metadata")]
    MissingMetadata { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_is_fatal_and_not_retryable() {
        let e = ProviderError::Authentication {
            provider: "ocr".into(),
            detail: "invalid key".into(),
        };
        assert!(e.is_fatal());
        assert!(!e.is_retryable());
        assert_eq!(e.kind(), "authentication");
    }

    #[test]
    fn transient_family_is_retryable() {
        let cases = [
            ProviderError::Transient {
                provider: "p".into(),
                detail: "502".into(),
            },
            ProviderError::RateLimited {
                provider: "p".into(),
                retry_after_secs: Some(3),
            },
            ProviderError::Timeout {
                provider: "p".into(),
                secs: 60,
            },
            ProviderError::MalformedResponse {
                provider: "p".into(),
                detail: "no json".into(),
            },
        ];
        for e in cases {
            assert!(e.is_retryable(), "{e} should be retryable");
            assert!(!e.is_fatal());
        }
    }

    #[test]
    fn rejected_is_neither_retryable_nor_fatal() {
        let e = ProviderError::Rejected {
            provider: "translate".into(),
            detail: "context length exceeded".into(),
        };
        assert!(!e.is_retryable());
        assert!(!e.is_fatal());
        assert_eq!(e.provider(), "translate");
    }

    #[test]
    fn auth_escalates_to_pipeline_error() {
        let e: PipelineError = ProviderError::Authentication {
            provider: "anthropic".into(),
            detail: "expired".into(),
        }
        .into();
        let msg = e.to_string();
        assert!(msg.contains("anthropic"), "got: {msg}");
        assert!(msg.contains("expired"), "got: {msg}");
    }

    #[test]
    fn timeout_display() {
        let e = ProviderError::Timeout {
            provider: "format".into(),
            secs: 60,
        };
        assert!(e.to_string().contains("60s"));
    }
}
