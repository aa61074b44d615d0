//! Run-level accounting.
//!
//! All stages report through [`Reporter::record`], the single synchronised
//! entry point; nothing else mutates the [`RunReport`]. The CLI progress bar
//! polls [`Reporter::snapshot`]. At the end of a run the report is rendered
//! to text and written next to the filed handbooks together with its JSON
//! form and an index of every filed handbook.

use crate::document::DocumentStatus;
use crate::error::PipelineError;
use chrono::{DateTime, Local, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const REPORT_TEXT_FILE: &str = "run_report.txt";
pub const REPORT_JSON_FILE: &str = "run_report.json";
pub const INDEX_FILE: &str = "index.json";

/// One filed handbook, as listed in `index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub university: String,
    pub deadline: NaiveDate,
    pub folder: PathBuf,
    pub files: Vec<String>,
    pub source: String,
    pub address: Option<String>,
    pub summary: Option<String>,
}

/// Counters and outcomes of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
    pub output_root: Option<PathBuf>,

    pub documents_seen: usize,
    pub documents_settled: usize,
    /// Placements recorded by an earlier run of the same root (resume only).
    pub previously_placed: usize,
    pub organized: usize,
    pub held: usize,
    pub discarded: usize,
    pub failed: usize,
    pub aborted: usize,
    pub valid_handbooks: usize,
    pub render_failures: usize,

    pub pages_rendered: usize,
    pub pages_transcribed: usize,
    pub pages_blank: usize,
    pub pages_placeholder: usize,

    pub translations: usize,
    pub translations_missing: usize,
    pub translation_drift: usize,
    /// Documents translated a second time because of line drift.
    pub retranslations: usize,
    pub ambiguities: usize,
    pub retries: u64,

    /// Failure counts keyed `stage/kind`.
    pub failures: BTreeMap<String, usize>,

    /// Set when the run was aborted by a fatal error.
    pub fatal: Option<String>,

    #[serde(skip)]
    pub index: Vec<IndexEntry>,
}

impl RunReport {
    /// Wall time between start and finish (or now, while running).
    pub fn elapsed(&self) -> chrono::Duration {
        match self.started_at {
            Some(start) => self.finished_at.unwrap_or_else(Local::now) - start,
            None => chrono::Duration::zero(),
        }
    }

    pub fn total_failures(&self) -> usize {
        self.failures.values().sum()
    }

    /// Deterministic textual summary.
    pub fn render(&self) -> String {
        let mut s = String::new();
        let ts = |t: &Option<DateTime<Local>>| {
            t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".into())
        };
        let root = self
            .output_root
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".into());

        let _ = writeln!(s, "Handbook pipeline run report");
        let _ = writeln!(s, "============================");
        let _ = writeln!(s, "Output root:       {root}");
        let _ = writeln!(s, "Started:           {}", ts(&self.started_at));
        let _ = writeln!(s, "Finished:          {}", ts(&self.finished_at));
        let _ = writeln!(
            s,
            "Elapsed:           {:.1}s",
            self.elapsed().num_milliseconds() as f64 / 1000.0
        );
        if let Some(fatal) = &self.fatal {
            let _ = writeln!(s, "ABORTED:           {fatal}");
        }

        let _ = writeln!(s);
        let _ = writeln!(s, "Documents");
        let _ = writeln!(s, "  seen:            {}", self.documents_seen);
        if self.previously_placed > 0 {
            let _ = writeln!(s, "  placed earlier:  {}", self.previously_placed);
        }
        let _ = writeln!(s, "  valid handbooks: {}", self.valid_handbooks);
        let _ = writeln!(s, "  organized:       {}", self.organized);
        let _ = writeln!(s, "  held:            {}", self.held);
        let _ = writeln!(s, "  discarded:       {}", self.discarded);
        let _ = writeln!(s, "  failed:          {}", self.failed);
        let _ = writeln!(s, "  render failures: {}", self.render_failures);
        let _ = writeln!(s, "  aborted:         {}", self.aborted);

        let _ = writeln!(s);
        let _ = writeln!(s, "Pages");
        let _ = writeln!(s, "  rendered:        {}", self.pages_rendered);
        let _ = writeln!(s, "  transcribed:     {}", self.pages_transcribed);
        let _ = writeln!(s, "  blank:           {}", self.pages_blank);
        let _ = writeln!(s, "  placeholders:    {}", self.pages_placeholder);

        let _ = writeln!(s);
        let _ = writeln!(s, "Translation");
        let _ = writeln!(s, "  translated:      {}", self.translations);
        let _ = writeln!(s, "  missing:         {}", self.translations_missing);
        let _ = writeln!(s, "  re-translated:   {}", self.retranslations);
        let _ = writeln!(s, "  line drift:      {}", self.translation_drift);

        let _ = writeln!(s);
        let _ = writeln!(s, "Ambiguities:       {}", self.ambiguities);
        let _ = writeln!(s, "Retries:           {}", self.retries);

        let _ = writeln!(s);
        let _ = writeln!(s, "Failures by stage/kind");
        if self.failures.is_empty() {
            let _ = writeln!(s, "  (none)");
        }
        for (key, count) in &self.failures {
            let _ = writeln!(s, "  {key:<32} {count}");
        }
        s
    }

    /// `index.json` content: filed handbooks sorted by university, then
    /// deadline, then folder.
    pub fn sorted_index(&self) -> Vec<IndexEntry> {
        let mut index = self.index.clone();
        index.sort_by(|a, b| {
            (&a.university, a.deadline, &a.folder).cmp(&(&b.university, b.deadline, &b.folder))
        });
        index
    }
}

/// Something that happened during a run.
#[derive(Debug, Clone)]
pub enum ReportEvent {
    RunStarted { output_root: PathBuf, documents: usize },
    /// Filed and held documents found in the root being resumed.
    Resumed { placed: usize, index: Vec<IndexEntry> },
    PagesRendered(usize),
    PagesTranscribed { transcribed: usize, blank: usize, placeholders: usize },
    Retries(u32),
    Failure { stage: &'static str, kind: String },
    /// The PDF could not be rasterised at all.
    RenderFailed { kind: String },
    Translated { drift: bool, retranslated: bool },
    TranslationMissing,
    Ambiguity,
    /// A document reached a terminal state.
    Settled {
        status: DocumentStatus,
        valid: bool,
        entry: Option<IndexEntry>,
    },
    /// A document was stopped (or never started) because the run aborted.
    Aborted,
    Fatal(String),
    RunFinished,
}

/// Thread-safe owner of the [`RunReport`].
#[derive(Debug, Default)]
pub struct Reporter {
    inner: Mutex<RunReport>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. The only way the report changes.
    pub fn record(&self, event: ReportEvent) {
        let mut r = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match event {
            ReportEvent::RunStarted {
                output_root,
                documents,
            } => {
                r.started_at = Some(Local::now());
                r.output_root = Some(output_root);
                r.documents_seen = documents;
            }
            ReportEvent::PagesRendered(n) => r.pages_rendered += n,
            ReportEvent::PagesTranscribed {
                transcribed,
                blank,
                placeholders,
            } => {
                r.pages_transcribed += transcribed;
                r.pages_blank += blank;
                r.pages_placeholder += placeholders;
            }
            ReportEvent::Retries(n) => r.retries += u64::from(n),
            ReportEvent::Failure { stage, kind } => {
                *r.failures.entry(format!("{stage}/{kind}")).or_insert(0) += 1;
            }
            ReportEvent::RenderFailed { kind } => {
                r.render_failures += 1;
                *r.failures.entry(format!("render/{kind}")).or_insert(0) += 1;
            }
            ReportEvent::Resumed { placed, index } => {
                r.previously_placed += placed;
                r.index.extend(index);
            }
            ReportEvent::Translated {
                drift,
                retranslated,
            } => {
                r.translations += 1;
                if drift {
                    r.translation_drift += 1;
                }
                if retranslated {
                    r.retranslations += 1;
                }
            }
            ReportEvent::TranslationMissing => r.translations_missing += 1,
            ReportEvent::Ambiguity => r.ambiguities += 1,
            ReportEvent::Settled {
                status,
                valid,
                entry,
            } => {
                r.documents_settled += 1;
                if valid {
                    r.valid_handbooks += 1;
                }
                match status {
                    DocumentStatus::Organized => r.organized += 1,
                    DocumentStatus::Held => r.held += 1,
                    DocumentStatus::Discarded => r.discarded += 1,
                    _ => r.failed += 1,
                }
                if let Some(entry) = entry {
                    r.index.push(entry);
                }
            }
            ReportEvent::Aborted => {
                r.documents_settled += 1;
                r.aborted += 1;
            }
            ReportEvent::Fatal(message) => {
                if r.fatal.is_none() {
                    r.fatal = Some(message);
                }
            }
            ReportEvent::RunFinished => r.finished_at = Some(Local::now()),
        }
    }

    /// Copy of the report as it stands.
    pub fn snapshot(&self) -> RunReport {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Write `run_report.txt`, `run_report.json` and `index.json` into `root`.
pub async fn write_reports(report: &RunReport, root: &Path) -> Result<(), PipelineError> {
    let write = |name: &'static str, contents: String| {
        let path = root.join(name);
        async move {
            tokio::fs::write(&path, contents)
                .await
                .map_err(|source| PipelineError::ReportWriteFailed { path, source })
        }
    };

    let json = serde_json::to_string_pretty(report)
        .map_err(|e| PipelineError::Internal(format!("report serialisation: {e}")))?;
    let index = serde_json::to_string_pretty(&report.sorted_index())
        .map_err(|e| PipelineError::Internal(format!("index serialisation: {e}")))?;

    write(REPORT_TEXT_FILE, report.render()).await?;
    write(REPORT_JSON_FILE, json).await?;
    write(INDEX_FILE, index).await?;
    Ok(())
}
