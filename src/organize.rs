//! Placing finished documents into the output tree.
//!
//! ```text
//! <output_root>/
//!   <university>_<YYYYMMDD>/            filed handbook
//!     <university>_<YYYYMMDD>.pdf
//!     <university>_<YYYYMMDD>.md
//!     <university>_<YYYYMMDD>_translated.md
//!   <university>_<YYYYMMDD>_2/          second document with the same key
//!   _unfiled/<pdf stem>/                valid but not fileable
//!   placements.jsonl                    one line per placement
//! ```
//!
//! The output tree is the only resource several documents mutate. Folder
//! names are handed out by a claim table under a mutex: the first document to
//! claim a key keeps it, later distinct documents get `_2`, `_3`, … and the
//! same document always gets its own folder back, which makes placement
//! idempotent.
//!
//! Every placement is appended to the journal. [`Organizer::resume`] reads it
//! back so a second run over the same root keeps earlier folders claimed and
//! can skip the documents behind them.

use crate::document::{Document, HandbookMetadata};
use crate::error::OrganizeError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Name of the holding area under the output root.
pub const HOLDING_DIR: &str = "_unfiled";

/// Placement journal under the output root.
pub const JOURNAL_FILE: &str = "placements.jsonl";

/// One line of the placement journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    /// Source path as it was in the input directory.
    pub source: PathBuf,
    /// Folder relative to the output root.
    pub folder: PathBuf,
    pub files: Vec<String>,
    /// `None` for held documents.
    pub metadata: Option<HandbookMetadata>,
}

impl PlacementRecord {
    pub fn is_held(&self) -> bool {
        self.folder.starts_with(HOLDING_DIR)
    }
}

/// Where a document's outputs ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    /// Folder path relative to the output root.
    pub folder: PathBuf,
    /// File names inside the folder, sorted.
    pub files: Vec<String>,
}

#[derive(Debug)]
pub struct Organizer {
    root: PathBuf,
    copy_source: bool,
    claims: Mutex<HashMap<PathBuf, PathBuf>>,
    journal_lock: tokio::sync::Mutex<()>,
}

impl Organizer {
    pub fn new(root: impl Into<PathBuf>, copy_source: bool) -> Self {
        Self {
            root: root.into(),
            copy_source,
            claims: Mutex::new(HashMap::new()),
            journal_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Reopen an existing root. Folders named in its journal stay claimed by
    /// their sources; the records are returned, latest per source.
    pub async fn resume(
        root: impl Into<PathBuf>,
        copy_source: bool,
    ) -> Result<(Self, Vec<PlacementRecord>), OrganizeError> {
        let organizer = Self::new(root, copy_source);
        let path = organizer.root.join(JOURNAL_FILE);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(OrganizeError::Read { path, source }),
        };

        let mut records: Vec<PlacementRecord> = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PlacementRecord>(line) {
                Ok(record) => {
                    records.retain(|r| r.source != record.source);
                    records.push(record);
                }
                // A run killed mid-write leaves a torn last line.
                Err(e) => warn!("{}:{}: skipping unreadable record: {e}", path.display(), n + 1),
            }
        }

        {
            let mut claims = organizer
                .claims
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for record in &records {
                claims.insert(record.folder.clone(), record.source.clone());
            }
        }
        debug!("resuming {} with {} placement(s)", organizer.root.display(), records.len());
        Ok((organizer, records))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File a valid handbook under `<university>_<YYYYMMDD>`.
    pub async fn file(&self, doc: &Document) -> Result<Placement, OrganizeError> {
        let meta = doc
            .metadata
            .as_ref()
            .ok_or_else(|| OrganizeError::MissingMetadata {
                path: doc.source.clone(),
            })?;
        let rel = self.claim(PathBuf::from(folder_key(meta)), &doc.source);
        let placement = self.place(doc, rel).await?;
        self.journal(doc, &placement, Some(meta.clone())).await;
        info!(
            document = %doc.name(),
            folder = %placement.folder.display(),
            "filed handbook"
        );
        Ok(placement)
    }

    /// Keep a document in `_unfiled/<stem>` for a human to look at.
    pub async fn hold(&self, doc: &Document) -> Result<Placement, OrganizeError> {
        let rel = self.claim(
            Path::new(HOLDING_DIR).join(sanitize_component(&doc.stem())),
            &doc.source,
        );
        let placement = self.place(doc, rel).await?;
        self.journal(doc, &placement, None).await;
        info!(
            document = %doc.name(),
            folder = %placement.folder.display(),
            "held for review"
        );
        Ok(placement)
    }

    /// Append a placement to the journal. The files are already in place, so
    /// a journal failure is logged, not returned.
    async fn journal(
        &self,
        doc: &Document,
        placement: &Placement,
        metadata: Option<HandbookMetadata>,
    ) {
        let record = PlacementRecord {
            source: doc.source.clone(),
            folder: placement.folder.clone(),
            files: placement.files.clone(),
            metadata,
        };
        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!("cannot serialise placement of {}: {e}", doc.name());
                return;
            }
        };
        line.push('\n');

        let path = self.root.join(JOURNAL_FILE);
        let _guard = self.journal_lock.lock().await;
        let appended = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = appended {
            warn!("cannot append to {}: {e}", path.display());
        }
    }

    /// Resolve `base` to a folder unique to `source` within this run.
    fn claim(&self, base: PathBuf, source: &Path) -> PathBuf {
        let mut claims = self
            .claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut n = 1;
        loop {
            let candidate = if n == 1 {
                base.clone()
            } else {
                let mut name = base.as_os_str().to_owned();
                name.push(format!("_{n}"));
                PathBuf::from(name)
            };
            match claims.get(&candidate) {
                None => {
                    claims.insert(candidate.clone(), source.to_path_buf());
                    return candidate;
                }
                Some(owner) if owner == source => return candidate,
                Some(_) => n += 1,
            }
        }
    }

    async fn place(&self, doc: &Document, rel: PathBuf) -> Result<Placement, OrganizeError> {
        let folder = self.root.join(&rel);
        tokio::fs::create_dir_all(&folder)
            .await
            .map_err(|source| OrganizeError::CreateFolder {
                path: folder.clone(),
                source,
            })?;

        let base = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| doc.stem());
        let mut files = Vec::with_capacity(3);

        if let Some(transcript) = &doc.transcript {
            let name = format!("{base}.md");
            write_atomic(&folder.join(&name), transcript).await?;
            files.push(name);
        }
        if let Some(translation) = &doc.translation {
            let name = format!("{base}_translated.md");
            write_atomic(&folder.join(&name), translation).await?;
            files.push(name);
        }

        let name = format!("{base}.pdf");
        place_source(&doc.source, &folder.join(&name), self.copy_source).await?;
        files.push(name);

        files.sort();
        Ok(Placement { folder: rel, files })
    }
}

/// `<sanitized university>_<YYYYMMDD>`.
pub fn folder_key(meta: &HandbookMetadata) -> String {
    deadline_key(&meta.university, meta.deadline)
}

fn deadline_key(university: &str, deadline: NaiveDate) -> String {
    format!(
        "{}_{}",
        sanitize_component(university),
        deadline.format("%Y%m%d")
    )
}

/// Filesystem-safe name component.
///
/// Whitespace is removed, alphanumerics of any script and `-` are kept,
/// everything else becomes `-`; runs of `-` collapse and are trimmed from the
/// ends. An empty result becomes `unknown`.
pub fn sanitize_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().filter(|c| !c.is_whitespace()) {
        let c = if c.is_alphanumeric() { c } else { '-' };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Write to a temp file next to `path`, then rename over it.
async fn write_atomic(path: &Path, contents: &str) -> Result<(), OrganizeError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|source| OrganizeError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| OrganizeError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Move (or copy) the source PDF to `dest`.
///
/// A rename that fails (e.g. across filesystems) falls back to copy + remove.
/// If the source is already gone and `dest` exists, an earlier placement of
/// the same document moved it there and nothing is left to do.
async fn place_source(src: &Path, dest: &Path, copy: bool) -> Result<(), OrganizeError> {
    let move_err = |source| OrganizeError::Move {
        from: src.to_path_buf(),
        to: dest.to_path_buf(),
        source,
    };

    if !tokio::fs::try_exists(src).await.unwrap_or(false)
        && tokio::fs::try_exists(dest).await.unwrap_or(false)
    {
        debug!("{} already placed", dest.display());
        return Ok(());
    }

    if copy {
        tokio::fs::copy(src, dest).await.map_err(move_err)?;
        return Ok(());
    }

    if let Err(e) = tokio::fs::rename(src, dest).await {
        debug!("rename {} failed ({e}); copying", src.display());
        tokio::fs::copy(src, dest).await.map_err(move_err)?;
        tokio::fs::remove_file(src).await.map_err(move_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(university: &str, y: i32, m: u32, d: u32) -> HandbookMetadata {
        HandbookMetadata {
            university: university.into(),
            deadline: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            address: None,
            summary: None,
        }
    }

    fn doc(dir: &Path, name: &str, meta: Option<HandbookMetadata>) -> Document {
        let source = dir.join(name);
        std::fs::write(&source, b"%PDF-1.4 test").unwrap();
        let mut d = Document::new(0, source);
        d.transcript = Some("# 募集要項\n".into());
        d.translation = Some("# 招生简章\n".into());
        d.metadata = meta;
        d
    }

    fn dir_count(path: &Path) -> usize {
        std::fs::read_dir(path).unwrap().count()
    }

    #[test]
    fn sanitize_rules() {
        assert_eq!(sanitize_component("University A"), "UniversityA");
        assert_eq!(sanitize_component("東京 大学"), "東京大学");
        assert_eq!(sanitize_component("A/B: C?"), "A-B-C");
        assert_eq!(sanitize_component("..//.."), "unknown");
        assert_eq!(sanitize_component("Keio-Gijuku"), "Keio-Gijuku");
        assert_eq!(
            folder_key(&meta("University A", 2025, 3, 1)),
            "UniversityA_20250301"
        );
    }

    #[tokio::test]
    async fn filing_is_idempotent() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let organizer = Organizer::new(out.path(), false);
        let d = doc(input.path(), "a.pdf", Some(meta("University A", 2025, 3, 1)));

        let first = organizer.file(&d).await.unwrap();
        assert_eq!(first.folder, PathBuf::from("UniversityA_20250301"));
        assert_eq!(
            first.files,
            [
                "UniversityA_20250301.md",
                "UniversityA_20250301.pdf",
                "UniversityA_20250301_translated.md"
            ]
        );
        assert!(!d.source.exists(), "source should have been moved");

        let second = organizer.file(&d).await.unwrap();
        assert_eq!(first, second);
        // The folder and the journal.
        assert_eq!(dir_count(out.path()), 2);
        assert_eq!(dir_count(&out.path().join("UniversityA_20250301")), 3);
    }

    #[tokio::test]
    async fn collisions_get_sequence_suffix() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let organizer = Organizer::new(out.path(), true);
        let m = meta("University A", 2025, 3, 1);
        let a = doc(input.path(), "a.pdf", Some(m.clone()));
        let b = doc(input.path(), "b.pdf", Some(m.clone()));
        let c = doc(input.path(), "c.pdf", Some(m));

        assert_eq!(organizer.file(&a).await.unwrap().folder, PathBuf::from("UniversityA_20250301"));
        let pb = organizer.file(&b).await.unwrap();
        assert_eq!(pb.folder, PathBuf::from("UniversityA_20250301_2"));
        assert!(pb.files.contains(&"UniversityA_20250301_2.pdf".to_string()));
        assert_eq!(organizer.file(&c).await.unwrap().folder, PathBuf::from("UniversityA_20250301_3"));
        // Re-filing the second document lands in its own folder again.
        assert_eq!(organizer.file(&b).await.unwrap().folder, PathBuf::from("UniversityA_20250301_2"));
        assert!(a.source.exists(), "copy_source keeps the input");
        assert_eq!(dir_count(out.path()), 4);
    }

    #[tokio::test]
    async fn hold_without_translation() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let organizer = Organizer::new(out.path(), false);
        let mut d = doc(input.path(), "scan 01.pdf", None);
        d.translation = None;

        let p = organizer.hold(&d).await.unwrap();
        assert_eq!(p.folder, Path::new(HOLDING_DIR).join("scan01"));
        assert_eq!(p.files, ["scan01.md", "scan01.pdf"]);
        assert!(out.path().join(HOLDING_DIR).join("scan01").join("scan01.pdf").exists());
    }

    #[tokio::test]
    async fn resume_keeps_earlier_folders_claimed() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let m = meta("University A", 2025, 3, 1);
        let a = doc(input.path(), "a.pdf", Some(m.clone()));
        let held = doc(input.path(), "scan.pdf", None);
        {
            let first = Organizer::new(out.path(), true);
            first.file(&a).await.unwrap();
            first.hold(&held).await.unwrap();
            first.file(&a).await.unwrap();
        }

        let (organizer, records) = Organizer::resume(out.path(), true).await.unwrap();
        assert_eq!(records.len(), 2, "re-filing a source keeps one record");
        let filed = records.iter().find(|r| !r.is_held()).unwrap();
        assert_eq!(filed.source, a.source);
        assert_eq!(filed.metadata.as_ref(), Some(&m));
        assert!(records.iter().any(|r| r.is_held() && r.metadata.is_none()));

        // A new document with the same key does not overwrite the old folder.
        let b = doc(input.path(), "b.pdf", Some(m));
        let pb = organizer.file(&b).await.unwrap();
        assert_eq!(pb.folder, PathBuf::from("UniversityA_20250301_2"));
    }

    #[tokio::test]
    async fn resume_skips_torn_journal_line() {
        let out = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join(JOURNAL_FILE), "{\"source\":\"/in/a.pdf\",\"fol").unwrap();
        let (_, records) = Organizer::resume(out.path(), false).await.unwrap();
        assert!(records.is_empty());

        let fresh = tempfile::tempdir().unwrap();
        let (_, records) = Organizer::resume(fresh.path(), false).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn filing_requires_metadata() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let organizer = Organizer::new(out.path(), false);
        let d = doc(input.path(), "a.pdf", None);
        assert!(matches!(
            organizer.file(&d).await,
            Err(OrganizeError::MissingMetadata { .. })
        ));
    }
}
