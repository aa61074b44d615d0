//! Per-document stages.
//!
//! Each submodule implements one step; [`crate::run`] strings them together.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ transcribe ──▶ translate ──▶ analyze
//! (dir)    (pdfium)   (base64)   (OCR+format)   (1 call)      (JSON verdict)
//!                                      │
//!                                 postprocess
//! ```
//!
//! 1. [`input`]  — snapshot the input directory; check `%PDF` magic
//! 2. [`render`] — rasterise every page to a scratch PNG; runs in
//!    `spawn_blocking` under the CPU pool because pdfium is not async-safe
//! 3. [`encode`] — base64-wrap a page image for the multimodal request
//! 4. [`transcribe`] — OCR then format each page concurrently, reassemble in
//!    page order, placeholders for pages that never came back
//! 5. [`translate`] — whole-document translation with line-drift check
//! 6. [`analyze`] — classification and metadata extraction, decision policy
//!
//! [`llm`] is the shared call path (gate, timeout, retry, abort) and
//! [`postprocess`] the deterministic cleanup applied to every model answer.

pub mod analyze;
pub mod encode;
pub mod input;
pub mod llm;
pub mod postprocess;
pub mod render;
pub mod transcribe;
pub mod translate;
