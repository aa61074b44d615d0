//! Post-processing: deterministic cleanup of model-generated Markdown.
//!
//! Even well-prompted models wrap output in ```` ```markdown ```` fences, emit
//! `\r\n`, pad table-of-contents entries with forty leader dots or leave
//! zero-width characters behind. These rules fix such quirks without touching
//! content, so the prompts can stay focused on what to extract.
//!
//! Rules run in order: fences are stripped before line endings are
//! normalised, and the final-newline pass runs last.

use crate::prompts::EMPTY_PAGE;
use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to one page of model output.
///
/// 1. Strip outer markdown fences
/// 2. Normalise line endings (CRLF → LF)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 3+ consecutive blank lines down to 2
/// 5. Shorten table-of-contents leaders to six dots
/// 6. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 7. Ensure the text ends with exactly one newline
pub fn clean_markdown(input: &str) -> String {
    let s = strip_markdown_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = shorten_toc_leaders(&s);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

/// True when the model reported the page as blank.
///
/// The marker must be the whole answer (modulo fences, whitespace and
/// trailing punctuation); a page that merely mentions it is not empty.
pub fn is_empty_page(output: &str) -> bool {
    let s = strip_markdown_fences(output);
    let s = remove_invisible_chars(&s);
    let s = s.trim().trim_matches(|c: char| c == '`' || c == '.' || c == '"' || c == '「' || c == '」');
    s.eq_ignore_ascii_case(EMPTY_PAGE) || s.trim().is_empty()
}

// ── Rule 1: Strip outer markdown fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```(?:markdown|md|text)?[ \t]*\r?\n(.*?)\r?\n?```\s*$").unwrap()
});

fn strip_markdown_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule 5: Shorten table-of-contents leaders ────────────────────────────────
//
// "第1章 出願資格 ................................ 3" → "第1章 出願資格......3"
// Only leaders between text and a trailing page number are touched, so
// horizontal rules and table separator rows survive.

static RE_TOC_LEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)(\S)[ \t]*(?:[.．]{6,}|[・…‥]{3,}|-{6,})[ \t]*(\d+)$").unwrap()
});

fn shorten_toc_leaders(input: &str) -> String {
    RE_TOC_LEADER
        .replace_all(input, "${1}......${2}")
        .to_string()
}

// ── Rule 6: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 7: Ensure text ends with a single newline ───────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences_and_crlf() {
        let raw = "```markdown\r\n# 募集要項\r\n\r\n本文\r\n```";
        assert_eq!(clean_markdown(raw), "# 募集要項\n\n本文\n");
    }

    #[test]
    fn leaves_inner_code_blocks() {
        let raw = "text\n\n```\ncode\n```\n\nmore";
        assert_eq!(clean_markdown(raw), "text\n\n```\ncode\n```\n\nmore\n");
    }

    #[test]
    fn collapses_blank_runs() {
        assert_eq!(clean_markdown("a\n\n\n\n\n\nb"), "a\n\n\nb\n");
    }

    #[test]
    fn shortens_toc_leaders() {
        let raw = "第1章 出願資格 ................................ 3\n\
                   第2章 選抜方法・・・・・・・・・12\n\
                   ---\n\
                   | --- | --- |";
        let out = clean_markdown(raw);
        assert!(out.contains("第1章 出願資格......3"), "{out}");
        assert!(out.contains("第2章 選抜方法......12"), "{out}");
        assert!(out.contains("\n---\n"), "{out}");
        assert!(out.contains("| --- | --- |"), "{out}");
    }

    #[test]
    fn removes_invisible_chars() {
        assert_eq!(clean_markdown("\u{FEFF}東京\u{200B}大学"), "東京大学\n");
    }

    #[test]
    fn empty_page_detection() {
        assert!(is_empty_page("EMPTY_PAGE"));
        assert!(is_empty_page("  EMPTY_PAGE.\n"));
        assert!(is_empty_page("```\nEMPTY_PAGE\n```"));
        assert!(is_empty_page("   "));
        assert!(!is_empty_page("This page is not EMPTY_PAGE, it has text."));
    }
}
