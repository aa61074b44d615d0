//! Analysis: is this an admission handbook, and how is it filed?
//!
//! The model answers with one JSON object (see
//! [`crate::prompts::ANALYSIS_SYSTEM_PROMPT`]). The answer is validated here,
//! at the boundary: a response without a parsable object, with a missing
//! field, or with a confidence outside `0..=1` is a malformed response and is
//! retried like a transient error.
//!
//! Decision policy:
//!
//! | model says | confidence | metadata | outcome |
//! |---|---|---|---|
//! | not a handbook | any | – | invalid |
//! | handbook | below threshold | – | invalid (ambiguity logged) |
//! | handbook | ≥ threshold | name + deadline | valid |
//! | handbook | ≥ threshold | incomplete | held |
//! | call failed | – | – | held |

use crate::document::HandbookMetadata;
use crate::pipeline::llm::{CallError, RoleClient};
use crate::prompts::{analysis_user_message, ANALYSIS_SYSTEM_PROMPT};
use crate::provider::Request;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

/// The JSON object the analysis model must return.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalysisResponse {
    pub is_handbook: bool,
    pub confidence: f32,
    #[serde(default)]
    pub university: Option<String>,
    #[serde(default)]
    pub deadlines: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// What the analysis decided for one document.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Valid(HandbookMetadata),
    Invalid { reason: String },
    /// Valid but not fileable: metadata incomplete, or the analysis call
    /// itself failed. Goes to the holding area and counts as a valid handbook.
    Unfiled { kind: String },
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub outcome: AnalysisOutcome,
    pub retries: u32,
    /// Human-readable notes for every ambiguity resolved by policy.
    pub ambiguities: Vec<String>,
}

/// Classify a document and extract its filing metadata.
///
/// Returns `Err` only when the run is aborting.
pub async fn analyze_document(
    document: &str,
    transcript: &str,
    translation: Option<&str>,
    client: &RoleClient,
    confidence_threshold: f32,
    char_budget: usize,
) -> Result<Analysis, CallError> {
    let user = analysis_user_message(
        truncate_chars(transcript, char_budget),
        translation.map(|t| truncate_chars(t, char_budget)),
    );
    let request = Request::text(ANALYSIS_SYSTEM_PROMPT, user);

    match client.call(request, document, parse_response).await {
        Ok(called) => {
            let (outcome, ambiguities) = decide(document, &called.value, confidence_threshold);
            Ok(Analysis {
                outcome,
                retries: called.retries(),
                ambiguities,
            })
        }
        Err(CallError::Failed { error, attempts }) => {
            warn!(document, "analysis failed after {attempts} attempt(s): {error}; holding");
            Ok(Analysis {
                outcome: AnalysisOutcome::Unfiled {
                    kind: error.kind().to_string(),
                },
                retries: attempts.saturating_sub(1),
                ambiguities: Vec::new(),
            })
        }
        Err(abort) => Err(abort),
    }
}

/// Apply the decision policy to a validated response.
pub fn decide(
    document: &str,
    response: &AnalysisResponse,
    confidence_threshold: f32,
) -> (AnalysisOutcome, Vec<String>) {
    let mut ambiguities = Vec::new();

    if !response.is_handbook {
        debug!(document, confidence = response.confidence, "not a handbook");
        return (
            AnalysisOutcome::Invalid {
                reason: "not an admission handbook".into(),
            },
            ambiguities,
        );
    }

    if response.confidence < confidence_threshold {
        let note = format!(
            "classified as handbook with low confidence {:.2} (< {:.2}); treated as invalid",
            response.confidence, confidence_threshold
        );
        warn!(document, "{note}");
        ambiguities.push(note);
        return (
            AnalysisOutcome::Invalid {
                reason: "low confidence".into(),
            },
            ambiguities,
        );
    }

    let university = response
        .university
        .as_deref()
        .map(normalize_name)
        .filter(|u| !u.is_empty());

    let mut dates: Vec<NaiveDate> = Vec::new();
    for raw in &response.deadlines {
        match parse_deadline(raw) {
            Some(d) => dates.push(d),
            None => debug!(document, "ignoring unparsable deadline {raw:?}"),
        }
    }
    dates.sort();
    dates.dedup();

    if dates.len() > 1 {
        let listed = dates
            .iter()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let note = format!("multiple deadlines ({listed}); using earliest {}", dates[0]);
        warn!(document, "{note}");
        ambiguities.push(note);
    }

    match (university, dates.first()) {
        (Some(university), Some(&deadline)) => (
            AnalysisOutcome::Valid(HandbookMetadata {
                university,
                deadline,
                address: clean_optional(response.address.as_deref()),
                summary: clean_optional(response.summary.as_deref()),
            }),
            ambiguities,
        ),
        (university, deadline) => {
            let missing = match (university.is_none(), deadline.is_none()) {
                (true, true) => "university and deadline",
                (true, false) => "university",
                _ => "deadline",
            };
            warn!(document, "handbook without {missing}; holding");
            (
                AnalysisOutcome::Unfiled {
                    kind: "missing_metadata".into(),
                },
                ambiguities,
            )
        }
    }
}

/// Parse and validate a raw model answer.
pub fn parse_response(raw: &str) -> Result<AnalysisResponse, String> {
    let json = extract_json_object(raw).ok_or_else(|| "no JSON object in response".to_string())?;
    let response: AnalysisResponse =
        serde_json::from_str(json).map_err(|e| format!("schema violation: {e}"))?;
    if !(0.0..=1.0).contains(&response.confidence) || response.confidence.is_nan() {
        return Err(format!("confidence out of range: {}", response.confidence));
    }
    Ok(response)
}

/// The span from the first `{` to the last `}`; models like to wrap JSON in
/// prose or fences.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Deadline the original tooling used to mean "unknown".
const UNKNOWN_DEADLINE: (i32, u32, u32) = (2099, 1, 1);

static RE_KANJI_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})\s*年\s*(\d{1,2})\s*月\s*(\d{1,2})\s*日").unwrap());

/// Parse one deadline string. Accepts `YYYY-MM-DD`, `YYYY/MM/DD`,
/// `YYYY.MM.DD`, `YYYYMMDD` and `YYYY年M月D日`.
pub fn parse_deadline(raw: &str) -> Option<NaiveDate> {
    let s: String = raw.nfkc().collect();
    let s = s.trim();

    let date = ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%Y%m%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .or_else(|| {
            let caps = RE_KANJI_DATE.captures(s)?;
            NaiveDate::from_ymd_opt(
                caps[1].parse().ok()?,
                caps[2].parse().ok()?,
                caps[3].parse().ok()?,
            )
        })?;

    let (y, m, d) = UNKNOWN_DEADLINE;
    if NaiveDate::from_ymd_opt(y, m, d) == Some(date) {
        return None;
    }
    Some(date)
}

/// NFKC-normalise, collapse internal whitespace runs, trim.
pub fn normalize_name(raw: &str) -> String {
    let nfkc: String = raw.nfkc().collect();
    nfkc.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_optional(raw: Option<&str>) -> Option<String> {
    raw.map(normalize_name).filter(|s| !s.is_empty())
}

/// At most `budget` characters of `s`, cut on a char boundary.
pub fn truncate_chars(s: &str, budget: usize) -> &str {
    match s.char_indices().nth(budget) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(is_handbook: bool, confidence: f32, deadlines: &[&str]) -> AnalysisResponse {
        AnalysisResponse {
            is_handbook,
            confidence,
            university: Some("Ｕｎｉｖｅｒｓｉｔｙ  A ".into()),
            deadlines: deadlines.iter().map(|s| s.to_string()).collect(),
            address: None,
            summary: Some("Spring intake.".into()),
        }
    }

    #[test]
    fn extracts_json_from_prose() {
        let raw = "Sure! ```json\n{\"is_handbook\": true, \"confidence\": 0.9, \"deadlines\": [\"2025-03-01\"], \"university\": \"X\"}\n```";
        let r = parse_response(raw).unwrap();
        assert!(r.is_handbook);
        assert_eq!(r.deadlines, ["2025-03-01"]);
    }

    #[test]
    fn schema_violations_are_rejected() {
        assert!(parse_response("no json here").is_err());
        assert!(parse_response("{\"confidence\": 0.9}").is_err());
        assert!(parse_response("{\"is_handbook\": true, \"confidence\": 1.5}").is_err());
        assert!(parse_response("{\"is_handbook\": \"yes\", \"confidence\": 0.5}").is_err());
    }

    #[test]
    fn deadline_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 1);
        for raw in ["2025-03-01", "2025/03/01", "2025.03.01", "20250301", "2025年3月1日", "２０２５-０３-０１"] {
            assert_eq!(parse_deadline(raw), expected, "{raw}");
        }
        assert_eq!(parse_deadline("2099/01/01"), None);
        assert_eq!(parse_deadline("early March"), None);
        assert_eq!(parse_deadline("2025-02-30"), None);
    }

    #[test]
    fn valid_handbook_is_normalised() {
        let (outcome, ambiguities) = decide("a.pdf", &response(true, 0.95, &["2025-03-01"]), 0.7);
        assert!(ambiguities.is_empty());
        match outcome {
            AnalysisOutcome::Valid(meta) => {
                assert_eq!(meta.university, "University A");
                assert_eq!(meta.deadline, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
                assert_eq!(meta.summary.as_deref(), Some("Spring intake."));
            }
            other => panic!("expected valid, got {other:?}"),
        }
    }

    #[test]
    fn deadline_range_uses_earliest_and_notes_ambiguity() {
        let (outcome, ambiguities) = decide(
            "a.pdf",
            &response(true, 0.9, &["2025-03-10", "2025/02/20", "2025-03-01"]),
            0.7,
        );
        assert_eq!(ambiguities.len(), 1);
        assert!(ambiguities[0].contains("earliest 2025-02-20"), "{}", ambiguities[0]);
        match outcome {
            AnalysisOutcome::Valid(meta) => {
                assert_eq!(meta.deadline, NaiveDate::from_ymd_opt(2025, 2, 20).unwrap())
            }
            other => panic!("expected valid, got {other:?}"),
        }
    }

    #[test]
    fn low_confidence_is_invalid() {
        let (outcome, ambiguities) = decide("a.pdf", &response(true, 0.5, &["2025-03-01"]), 0.7);
        assert!(matches!(outcome, AnalysisOutcome::Invalid { .. }));
        assert_eq!(ambiguities.len(), 1);
    }

    #[test]
    fn not_a_handbook_is_invalid() {
        let (outcome, _) = decide("flyer.pdf", &response(false, 0.99, &[]), 0.7);
        assert!(matches!(outcome, AnalysisOutcome::Invalid { .. }));
    }

    #[test]
    fn handbook_without_deadline_is_held() {
        let (outcome, _) = decide("a.pdf", &response(true, 0.9, &["2099-01-01"]), 0.7);
        assert_eq!(
            outcome,
            AnalysisOutcome::Unfiled {
                kind: "missing_metadata".into()
            }
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("募集要項", 2), "募集");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
