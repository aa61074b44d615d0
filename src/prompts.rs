//! Prompts for the four provider roles.
//!
//! Every prompt lives here so a wording change touches exactly one place and
//! unit tests can inspect prompts without a provider.
//!
//! Both transcription prompts allow the model to answer [`EMPTY_PAGE`] for
//! blank or meaningless pages; [`crate::pipeline::postprocess::is_empty_page`]
//! recognises that marker.

/// Marker a transcription model returns for a page with no meaningful content.
pub const EMPTY_PAGE: &str = "EMPTY_PAGE";

/// System prompt for the OCR call: read raw text off one page image.
pub const OCR_SYSTEM_PROMPT: &str = r#"You are a meticulous OCR engine for scanned university admission documents.

Read ALL text on the page image and output it as plain text.

Rules:
- Preserve the reading order a human would follow (columns top to bottom, left to right).
- Keep the original language and script. Do NOT translate.
- Keep numbers, dates, fees and codes exactly as printed.
- Keep table cells on one line per row, separated by " | ".
- Ignore page numbers, decorative borders and watermarks.
- If the page is blank or carries no meaningful text, output exactly: EMPTY_PAGE
- Output the text only. No commentary."#;

/// System prompt for the formatting call: OCR text + page image → markdown.
pub const FORMAT_SYSTEM_PROMPT: &str = r#"You are an expert document formatter. You receive the OCR text of one page of a university admission handbook together with the page image. Produce clean, well-structured Markdown.

Follow these rules precisely:

1. TEXT PRESERVATION
   - Use the OCR text as the source of truth for content; use the image for layout.
   - Correct obvious OCR errors only if the image makes the correct reading certain.
   - Keep the original language. Do NOT translate.

2. STRUCTURE
   - Use ## for major sections, ### for subsections.
   - Use - for unordered lists and 1. 2. 3. for ordered lists.
   - Tables in GFM pipe format; use HTML table markup if the table is too complex.

3. TABLE OF CONTENTS
   - Render entries as "Title...... page" with at most six leader dots.

4. OUTPUT FORMAT
   - Output ONLY the Markdown content.
   - Do NOT wrap in ```markdown fences.
   - Do NOT add commentary or explanations.
   - If the page carries no meaningful content, output exactly: EMPTY_PAGE"#;

/// Build the user text for the formatting call.
pub fn format_user_message(page_num: usize, ocr_text: &str) -> String {
    format!(
        "OCR text of page {}:\n\n\"\"\"\n{}\n\"\"\"",
        page_num,
        ocr_text.trim()
    )
}

/// Build the translation system prompt for a language pair.
pub fn translation_system_prompt(source: &str, target: &str) -> String {
    format!(
        r#"You are a professional translator specialising in university admission documents.

Translate the following Markdown document from {source} into {target}.

Rules:
- Preserve the Markdown structure exactly: headings, lists, tables, line breaks.
- Translate every line; keep one output line per input line wherever possible.
- Use consistent terminology for departments, exam names and procedures throughout.
- Keep proper nouns recognisable: give the original name in parentheses on first use.
- Keep numbers, dates, fees and codes unchanged.
- Output ONLY the translated Markdown. Do NOT wrap in code fences."#
    )
}

/// System prompt for the analysis call. The response must be one JSON object.
pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You classify documents collected from university websites.

Decide whether the document is a university ADMISSION HANDBOOK (an application guide / 募集要項 describing eligibility, application procedure, examination schedule and application deadlines). Flyers, news, brochures without an application procedure, forms alone and unrelated documents are NOT handbooks.

If it is a handbook, extract:
- the official university name, as printed, in its original language;
- every application deadline date mentioned (the last day applications are accepted);
- the postal address for applications, if printed;
- a one-paragraph summary in English.

Respond with ONE JSON object and nothing else:
{
  "is_handbook": true | false,
  "confidence": number between 0 and 1,
  "university": string or null,
  "deadlines": ["YYYY-MM-DD", ...],
  "address": string or null,
  "summary": string or null
}

Use an empty list when no deadline is stated. Never invent dates."#;

/// Build the analysis user message from the (possibly truncated) texts.
pub fn analysis_user_message(transcript: &str, translation: Option<&str>) -> String {
    let mut msg = format!("DOCUMENT (original):\n\"\"\"\n{}\n\"\"\"", transcript);
    if let Some(t) = translation {
        msg.push_str(&format!("\n\nDOCUMENT (translation):\n\"\"\"\n{}\n\"\"\"", t));
    }
    msg
}
