//! Transcription: page images → markdown fragments → document transcript.
//!
//! Each page takes two provider calls:
//!
//! 1. **OCR** — the vision model reads the raw text off the image;
//! 2. **Format** — a second model receives the OCR text plus the image and
//!    returns structured markdown.
//!
//! Either model may answer `EMPTY_PAGE`; such a page contributes nothing and
//! is not a failure. A page whose calls exhaust their retries gets a visible
//! placeholder comment instead of text, so a reader of the transcript can see
//! exactly where content is missing.
//!
//! Pages of one document are transcribed concurrently (bounded by the role
//! gates) and re-sorted by page index before assembly, so the transcript
//! order never depends on completion order.

use crate::config::PageSeparator;
use crate::document::{Document, Page};
use crate::pipeline::encode::encode_page_file;
use crate::pipeline::llm::{CallError, RoleClient};
use crate::pipeline::postprocess::{clean_markdown, is_empty_page};
use crate::prompts::{format_user_message, FORMAT_SYSTEM_PROMPT, OCR_SYSTEM_PROMPT};
use crate::provider::Request;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Per-document transcription counters, folded into the run report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptionStats {
    pub transcribed: usize,
    pub empty: usize,
    pub placeholders: usize,
    pub retries: u32,
    /// One `(role, kind)` entry per placeholder page.
    pub failures: Vec<(&'static str, String)>,
}

#[derive(Debug)]
enum PageOutcome {
    Text(String),
    Empty,
    Failed { role: &'static str, kind: String, attempts: u32 },
    /// The rendered image never reached a model.
    Unrendered { kind: &'static str },
}

/// Placeholder written in place of a page that could not be transcribed.
pub fn placeholder(page_num: usize, attempts: u32) -> String {
    format!("<!-- page {page_num}: transcription failed after {attempts} attempts -->")
}

/// Placeholder for a page whose image was lost before any model call.
pub fn unrendered_placeholder(page_num: usize) -> String {
    format!("<!-- page {page_num}: page image unavailable, not transcribed -->")
}

/// Transcribe every page of `doc` and assemble `doc.transcript`.
///
/// Returns `Err` only for [`CallError::Fatal`] or [`CallError::Cancelled`];
/// exhausted retries degrade to placeholders.
pub async fn transcribe_document(
    doc: &mut Document,
    ocr: &RoleClient,
    format: &RoleClient,
    separator: &PageSeparator,
) -> Result<TranscriptionStats, CallError> {
    let name = doc.name();
    let fan_out = ocr
        .settings()
        .limits
        .max_in_flight
        .max(format.settings().limits.max_in_flight);

    let jobs: Vec<(usize, Option<PathBuf>)> = doc
        .pages
        .iter_mut()
        .map(|p| (p.index, p.image.take()))
        .collect();

    let mut results: Vec<(usize, Result<(PageOutcome, u32), CallError>)> =
        stream::iter(jobs.into_iter().map(|(index, image)| {
            let name = name.as_str();
            async move {
                let outcome = transcribe_page(name, index, image.as_ref(), ocr, format).await;
                if let Some(path) = image {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        debug!("could not delete {}: {}", path.display(), e);
                    }
                }
                (index, outcome)
            }
        }))
        .buffer_unordered(fan_out.max(1))
        .collect()
        .await;

    // A fatal error outranks the cancellations it caused on sibling pages.
    if let Some(i) = results
        .iter()
        .position(|(_, r)| matches!(r, Err(CallError::Fatal(_))))
    {
        if let (_, Err(e)) = results.swap_remove(i) {
            return Err(e);
        }
    }
    results.sort_by_key(|(index, _)| *index);

    let mut stats = TranscriptionStats::default();
    for (index, result) in results {
        let (outcome, retries) = result?;
        stats.retries += retries;
        let fragment = match outcome {
            PageOutcome::Text(md) => {
                stats.transcribed += 1;
                md
            }
            PageOutcome::Empty => {
                stats.empty += 1;
                String::new()
            }
            PageOutcome::Failed {
                role,
                kind,
                attempts,
            } => {
                warn!(document = %name, page = index + 1, "placeholder after {attempts} attempts ({role}/{kind})");
                stats.placeholders += 1;
                stats.failures.push((role, kind));
                placeholder(index + 1, attempts)
            }
            PageOutcome::Unrendered { kind } => {
                warn!(document = %name, page = index + 1, "placeholder: page image {kind}");
                stats.placeholders += 1;
                stats.failures.push(("render", kind.to_string()));
                unrendered_placeholder(index + 1)
            }
        };
        if let Some(page) = doc.pages.iter_mut().find(|p| p.index == index) {
            page.fragment = Some(fragment);
        }
    }

    doc.failed_pages = stats.placeholders;
    doc.empty_pages = stats.empty;
    doc.transcript = Some(assemble(&doc.pages, separator));
    Ok(stats)
}

/// OCR then format one page. The `u32` is the number of retries spent.
async fn transcribe_page(
    name: &str,
    index: usize,
    image: Option<&PathBuf>,
    ocr: &RoleClient,
    format: &RoleClient,
) -> Result<(PageOutcome, u32), CallError> {
    let page_num = index + 1;
    let unit = format!("{name} p{page_num}");

    let image_data = match image {
        Some(path) => match encode_page_file(path).await {
            Ok(data) => data,
            Err(e) => {
                warn!(document = %name, page = page_num, "page image unreadable: {e}");
                return Ok((
                    PageOutcome::Unrendered {
                        kind: "image_unreadable",
                    },
                    0,
                ));
            }
        },
        None => {
            return Ok((
                PageOutcome::Unrendered {
                    kind: "image_missing",
                },
                0,
            ))
        }
    };

    let ocr_request = Request::text(OCR_SYSTEM_PROMPT, format!("Page {page_num}."))
        .with_image(image_data.clone());
    let ocr_text = match ocr.call(ocr_request, &unit, accept_text).await {
        Ok(called) => called,
        Err(CallError::Failed { error, attempts }) => {
            return Ok((
                PageOutcome::Failed {
                    role: "ocr",
                    kind: error.kind().to_string(),
                    attempts,
                },
                attempts.saturating_sub(1),
            ))
        }
        Err(abort) => return Err(abort),
    };
    let mut retries = ocr_text.retries();

    if is_empty_page(&ocr_text.value) {
        debug!(document = %name, page = page_num, "blank page (ocr)");
        return Ok((PageOutcome::Empty, retries));
    }

    let format_request =
        Request::text(FORMAT_SYSTEM_PROMPT, format_user_message(page_num, &ocr_text.value))
            .with_image(image_data);
    let formatted = match format.call(format_request, &unit, accept_text).await {
        Ok(called) => called,
        Err(CallError::Failed { error, attempts }) => {
            retries += attempts.saturating_sub(1);
            return Ok((
                PageOutcome::Failed {
                    role: "format",
                    kind: error.kind().to_string(),
                    attempts,
                },
                retries,
            ));
        }
        Err(abort) => return Err(abort),
    };
    retries += formatted.retries();

    if is_empty_page(&formatted.value) {
        debug!(document = %name, page = page_num, "blank page (format)");
        return Ok((PageOutcome::Empty, retries));
    }

    Ok((PageOutcome::Text(clean_markdown(&formatted.value)), retries))
}

fn accept_text(s: &str) -> Result<String, String> {
    Ok(s.to_string())
}

/// Join page fragments in page-index order. Blank pages are skipped; the
/// separator before a page carries that page's number.
pub fn assemble(pages: &[Page], separator: &PageSeparator) -> String {
    let mut ordered: Vec<&Page> = pages.iter().collect();
    ordered.sort_by_key(|p| p.index);

    let mut out = String::new();
    for page in ordered {
        let fragment = page.fragment.as_deref().unwrap_or("").trim();
        if fragment.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str(&separator.render(page.index + 1));
        }
        out.push_str(fragment);
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out
}
