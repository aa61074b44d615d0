//! The unit of work: one source PDF and everything derived from it.
//!
//! A [`Document`] is owned by the task processing it and handed from stage to
//! stage by `&mut`; no two stages ever see it at the same time.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lifecycle of a document. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Rasterized,
    Transcribed,
    Translated,
    Analyzed,
    /// Filed under `<university>_<deadline>/`.
    Organized,
    /// Valid or unclassifiable; kept in the holding area for a human.
    Held,
    Failed,
    /// Invalid or blank; nothing written.
    Discarded,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Organized
                | DocumentStatus::Held
                | DocumentStatus::Failed
                | DocumentStatus::Discarded
        )
    }
}

/// Outcome of the validity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    #[default]
    Unknown,
    Valid,
    Invalid,
}

/// Metadata a valid handbook is filed by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandbookMetadata {
    /// NFKC-normalised university name.
    pub university: String,
    pub deadline: NaiveDate,
    pub address: Option<String>,
    pub summary: Option<String>,
}

/// One rendered page.
#[derive(Debug, Clone)]
pub struct Page {
    /// 0-based page index.
    pub index: usize,
    /// Rendered image on disk; `None` once transcription consumed it.
    pub image: Option<PathBuf>,
    /// Cleaned markdown (empty for blank pages); placeholder when failed.
    pub fragment: Option<String>,
}

impl Page {
    pub fn new(index: usize, image: PathBuf) -> Self {
        Self {
            index,
            image: Some(image),
            fragment: None,
        }
    }
}

#[derive(Debug)]
pub struct Document {
    /// Position in the sorted work list.
    pub seq: usize,
    pub source: PathBuf,
    pub pages: Vec<Page>,
    pub transcript: Option<String>,
    pub translation: Option<String>,
    pub verdict: Verdict,
    pub metadata: Option<HandbookMetadata>,
    /// Pages that ended with a placeholder.
    pub failed_pages: usize,
    /// Pages the model reported as blank.
    pub empty_pages: usize,
    status: DocumentStatus,
}

impl Document {
    pub fn new(seq: usize, source: PathBuf) -> Self {
        Self {
            seq,
            source,
            pages: Vec::new(),
            transcript: None,
            translation: None,
            verdict: Verdict::Unknown,
            metadata: None,
            failed_pages: 0,
            empty_pages: 0,
            status: DocumentStatus::Pending,
        }
    }

    pub fn status(&self) -> DocumentStatus {
        self.status
    }

    /// Advance the lifecycle. Going backwards or leaving a terminal state is a
    /// programming error.
    pub fn set_status(&mut self, next: DocumentStatus) {
        debug_assert!(
            !self.status.is_terminal(),
            "{} already settled as {:?}",
            self.source.display(),
            self.status
        );
        debug_assert!(next > self.status, "{:?} -> {:?}", self.status, next);
        self.status = next;
    }

    /// File name for logging.
    pub fn name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source.display().to_string())
    }

    /// File stem used for holding-area names.
    pub fn stem(&self) -> String {
        file_stem(&self.source)
    }

    /// True when some but not all pages failed.
    pub fn is_partial(&self) -> bool {
        self.failed_pages > 0 && self.failed_pages < self.pages.len()
    }
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_forward() {
        let mut doc = Document::new(0, PathBuf::from("/in/a.pdf"));
        assert_eq!(doc.status(), DocumentStatus::Pending);
        doc.set_status(DocumentStatus::Rasterized);
        doc.set_status(DocumentStatus::Transcribed);
        doc.set_status(DocumentStatus::Analyzed);
        doc.set_status(DocumentStatus::Organized);
        assert!(doc.status().is_terminal());
        assert_eq!(doc.name(), "a.pdf");
        assert_eq!(doc.stem(), "a");
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn settled_document_cannot_move() {
        let mut doc = Document::new(0, PathBuf::from("a.pdf"));
        doc.set_status(DocumentStatus::Discarded);
        doc.set_status(DocumentStatus::Organized);
    }

    #[test]
    fn partial_needs_some_success() {
        let mut doc = Document::new(0, PathBuf::from("a.pdf"));
        doc.pages = (0..3).map(|i| Page::new(i, PathBuf::from("p.png"))).collect();
        doc.failed_pages = 1;
        assert!(doc.is_partial());
        doc.failed_pages = 3;
        assert!(!doc.is_partial());
    }
}
