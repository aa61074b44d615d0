//! # handbook-pipeline
//!
//! Turn a directory of scanned university admission handbooks into an
//! organised, searchable archive.
//!
//! Handbooks collected from university websites are image-only PDFs in the
//! source language, mixed in with flyers, brochures and other noise. For
//! every PDF this crate:
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Render     rasterise pages via pdfium (CPU pool, spawn_blocking)
//!  ├─ 2. OCR        page image → raw text         (vision model)
//!  ├─ 3. Format     raw text + image → Markdown   (vision model)
//!  ├─ 4. Translate  whole transcript → target language
//!  ├─ 5. Analyze    is it a handbook? university, earliest deadline
//!  └─ 6. Organize   <university>_<YYYYMMDD>/ or _unfiled/ or nothing
//! ```
//!
//! and finishes with a run report (`run_report.txt`, `run_report.json`) and
//! an `index.json` of every filed handbook.
//!
//! Each provider role (OCR, format, translate, analyze) sits behind its own
//! gate that caps requests in flight and spaces them out. Transient failures
//! are retried with exponential backoff; a rejected credential aborts the
//! whole run, but the report of what was done so far is still written.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use handbook_pipeline::{Pipeline, PipelineConfig, Reporter};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Providers auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = PipelineConfig::builder()
//!         .source_language("Japanese")
//!         .target_language("Simplified Chinese")
//!         .build()?;
//!     let pipeline = Pipeline::with_pdfium(config)?;
//!     let reporter = Reporter::new();
//!     let root = pipeline
//!         .run(Path::new("downloads"), Path::new("."), &reporter)
//!         .await?;
//!     println!("{}", reporter.snapshot().render());
//!     println!("output: {}", root.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature   | Default | Description |
//! |-----------|---------|-------------|
//! | `cli`     | on      | Enables the `handbooks` binary (clap + anyhow + tracing-subscriber) |
//! | `bundled` | off     | Embed the pdfium library in the binary |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod limiter;
pub mod organize;
pub mod pipeline;
pub mod prompts;
pub mod provider;
pub mod report;
pub mod run;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    PageSeparator, PipelineConfig, PipelineConfigBuilder, ProviderLimits, ProviderRole,
    ProviderSettings,
};
pub use document::{Document, DocumentStatus, HandbookMetadata, Verdict};
pub use error::{OrganizeError, PipelineError, ProviderError, RenderError};
pub use limiter::{Gates, ProviderGate};
pub use organize::{Organizer, Placement, PlacementRecord};
pub use pipeline::render::{PdfiumRasterizer, Rasterizer};
pub use provider::{Completion, CompletionProvider, LlmCompletionProvider, Request};
pub use report::{IndexEntry, ReportEvent, Reporter, RunReport};
pub use run::Pipeline;
