//! Translation: one call per document, whole transcript at once.
//!
//! Translating the whole document keeps terminology consistent across pages
//! (department and exam names recur throughout a handbook). A failed
//! translation never blocks the document: it proceeds to analysis without
//! one, and the absence shows up in the report.

use crate::pipeline::llm::{CallError, RoleClient};
use crate::pipeline::postprocess::clean_markdown;
use crate::prompts::translation_system_prompt;
use crate::provider::Request;
use tracing::warn;

/// Drift above this percentage of non-blank lines is reported.
pub const DRIFT_THRESHOLD_PERCENT: f64 = 15.0;

/// Result of the translation stage for one document.
#[derive(Debug, Clone)]
pub struct Translation {
    pub text: String,
    pub retries: u32,
    /// Line-count drift in percent when above [`DRIFT_THRESHOLD_PERCENT`].
    pub drift: Option<f64>,
    /// A second translation was requested because the first one drifted.
    pub retranslated: bool,
}

#[derive(Debug, Clone)]
pub enum TranslationOutcome {
    Translated(Translation),
    /// Retries exhausted or request rejected; `kind` names the failure.
    Unavailable { kind: String, retries: u32 },
}

/// Translate `transcript`. Returns `Err` only when the run is aborting.
///
/// A translation whose line count drifts past [`DRIFT_THRESHOLD_PERCENT`]
/// usually lost or merged whole sections, so the document is translated once
/// more and the answer with the smaller drift is kept.
pub async fn translate_transcript(
    document: &str,
    transcript: &str,
    client: &RoleClient,
    source_language: &str,
    target_language: &str,
) -> Result<TranslationOutcome, CallError> {
    let prompt = translation_system_prompt(source_language, target_language);

    let first = match client
        .call(Request::text(prompt.as_str(), transcript), document, accept_translation)
        .await
    {
        Ok(called) => measured(transcript, &called.value, called.retries()),
        Err(CallError::Failed { error, attempts }) => {
            warn!(document, "translation unavailable after {attempts} attempt(s): {error}");
            return Ok(TranslationOutcome::Unavailable {
                kind: error.kind().to_string(),
                retries: attempts.saturating_sub(1),
            });
        }
        Err(abort) => return Err(abort),
    };
    let Some(first_drift) = first.drift else {
        return Ok(TranslationOutcome::Translated(first));
    };

    warn!(
        document,
        "translation line count differs from transcript by {:.1}%; translating again", first_drift
    );
    let mut best = match client
        .call(Request::text(prompt.as_str(), transcript), document, accept_translation)
        .await
    {
        Ok(called) => {
            let second = measured(transcript, &called.value, called.retries());
            let retries = first.retries + second.retries;
            let mut best = if second.drift.unwrap_or(0.0) < first_drift {
                second
            } else {
                first
            };
            best.retries = retries;
            best
        }
        Err(CallError::Failed { error, attempts }) => {
            warn!(document, "second translation failed ({error}); keeping the first");
            Translation {
                retries: first.retries + attempts.saturating_sub(1),
                ..first
            }
        }
        Err(abort) => return Err(abort),
    };
    best.retranslated = true;
    if let Some(drift) = best.drift {
        warn!(document, "translation still drifts by {:.1}%; keeping it", drift);
    }
    Ok(TranslationOutcome::Translated(best))
}

fn measured(transcript: &str, raw: &str, retries: u32) -> Translation {
    let text = clean_markdown(raw);
    let drift = line_drift_percent(transcript, &text);
    Translation {
        text,
        retries,
        drift: (drift > DRIFT_THRESHOLD_PERCENT).then_some(drift),
        retranslated: false,
    }
}

fn accept_translation(s: &str) -> Result<String, String> {
    if s.trim().is_empty() {
        Err("empty translation".into())
    } else {
        Ok(s.to_string())
    }
}

fn non_blank_lines(s: &str) -> usize {
    s.lines().filter(|l| !l.trim().is_empty()).count()
}

/// `|a − b| / max(a+1, b+1) × 100` over non-blank line counts.
pub fn line_drift_percent(original: &str, translated: &str) -> f64 {
    let a = non_blank_lines(original) as f64;
    let b = non_blank_lines(translated) as f64;
    (a - b).abs() / (a + 1.0).max(b + 1.0) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_ignores_blank_lines() {
        let original = "a\n\nb\n\nc\n";
        let translated = "一\n二\n三\n";
        assert_eq!(line_drift_percent(original, translated), 0.0);
    }

    #[test]
    fn drift_above_threshold() {
        let original = (0..20).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let translated = (0..10).map(|i| format!("行 {i}")).collect::<Vec<_>>().join("\n");
        // |20 - 10| / 21 * 100
        let d = line_drift_percent(&original, &translated);
        assert!((d - 47.619).abs() < 0.01, "{d}");
        assert!(d > DRIFT_THRESHOLD_PERCENT);
    }

    #[test]
    fn drift_is_only_kept_above_threshold() {
        let original = "a\nb\nc\nd\ne\nf\ng\n";
        assert!(measured(original, "一\n二\n三\n四\n五\n六\n七\n", 0).drift.is_none());
        let short = measured(original, "一\n二\n", 1);
        assert!(short.drift.unwrap() > DRIFT_THRESHOLD_PERCENT);
        assert_eq!(short.retries, 1);
        assert!(!short.retranslated);
    }

    #[test]
    fn empty_translation_is_rejected() {
        assert!(accept_translation("  \n").is_err());
        assert_eq!(accept_translation("译文").unwrap(), "译文");
    }
}
