//! Input discovery: snapshot the input directory into a work list.
//!
//! The list is built once at run start. Files dropped into the directory
//! while a run is in progress are picked up by the next run, never by this
//! one, so the report's "documents seen" always matches what was processed.

use crate::error::{PipelineError, RenderError};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// List the PDFs in `dir` (non-recursive), sorted by file name.
///
/// A file qualifies when it is a regular file whose extension is `pdf` in any
/// case. Content is not inspected here; a mislabelled file fails at render
/// time and is counted as a render failure.
pub fn collect_work_list(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if !dir.is_dir() {
        return Err(PipelineError::InputDirNotFound {
            path: dir.to_path_buf(),
        });
    }

    let entries = std::fs::read_dir(dir).map_err(|source| PipelineError::InputDirUnreadable {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut pdfs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| PipelineError::InputDirUnreadable {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && has_pdf_extension(&path) {
            pdfs.push(path);
        }
    }

    pdfs.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    debug!("Work list: {} PDF(s) in {}", pdfs.len(), dir.display());
    Ok(pdfs)
}

fn has_pdf_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
}

/// Verify the `%PDF` magic bytes at the start of the file.
pub fn check_pdf_magic(path: &Path) -> Result<(), RenderError> {
    let mut f = std::fs::File::open(path).map_err(|e| RenderError::Corrupt {
        path: path.to_path_buf(),
        detail: format!("cannot open: {e}"),
    })?;

    let mut magic = [0u8; 4];
    let n = f.read(&mut magic).map_err(|e| RenderError::Corrupt {
        path: path.to_path_buf(),
        detail: format!("cannot read: {e}"),
    })?;

    if n < 4 || &magic != b"%PDF" {
        return Err(RenderError::NotAPdf {
            path: path.to_path_buf(),
            magic: magic[..n].to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_list_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.pdf", "a.PDF", "notes.txt", "c.pdf.bak"] {
            std::fs::write(dir.path().join(name), b"%PDF-1.4").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.pdf")).unwrap();

        let names: Vec<String> = collect_work_list(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.PDF", "b.pdf"]);
    }

    #[test]
    fn missing_dir_is_fatal() {
        let err = collect_work_list(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, PipelineError::InputDirNotFound { .. }));
    }

    #[test]
    fn magic_check() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.pdf");
        let bad = dir.path().join("bad.pdf");
        let short = dir.path().join("short.pdf");
        std::fs::write(&good, b"%PDF-1.7\n...").unwrap();
        std::fs::write(&bad, b"PK\x03\x04zip").unwrap();
        std::fs::write(&short, b"%P").unwrap();

        assert!(check_pdf_magic(&good).is_ok());
        match check_pdf_magic(&bad) {
            Err(RenderError::NotAPdf { magic, .. }) => assert_eq!(magic, b"PK\x03\x04"),
            other => panic!("expected NotAPdf, got {other:?}"),
        }
        assert_eq!(check_pdf_magic(&short).unwrap_err().kind(), "not_a_pdf");
    }
}
