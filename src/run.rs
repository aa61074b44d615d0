//! The pipeline orchestrator.
//!
//! [`Pipeline::run`] snapshots the input directory, then drives every
//! document through render → transcribe → translate → analyze → organize with
//! `buffer_unordered(document_concurrency)`. Within a document the stages are
//! strictly sequential; across documents nothing is ordered.
//!
//! Unit failures degrade the document and are reported. Two conditions abort
//! the whole run: a provider rejecting our credentials and the PDF engine
//! being unavailable. Either one cancels the run's token; documents not yet
//! started are recorded as aborted without being touched, documents in flight
//! stop at their next stage boundary, and `run` returns the fatal error after
//! writing the report accumulated so far.

use crate::config::{PipelineConfig, ProviderRole};
use crate::document::{Document, DocumentStatus, HandbookMetadata, Page, Verdict};
use crate::error::{PipelineError, RenderError};
use crate::limiter::Gates;
use crate::organize::{Organizer, Placement, PlacementRecord};
use crate::pipeline::analyze::{analyze_document, AnalysisOutcome};
use crate::pipeline::input;
use crate::pipeline::llm::{CallError, RoleClient};
use crate::pipeline::render::{rasterize_document, PdfiumRasterizer, Rasterizer};
use crate::pipeline::transcribe::transcribe_document;
use crate::pipeline::translate::{translate_transcript, TranslationOutcome};
use crate::provider::{resolve_provider, CompletionProvider};
use crate::report::{write_reports, IndexEntry, ReportEvent, Reporter};
use chrono::Local;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Clone)]
struct Clients {
    ocr: RoleClient,
    format: RoleClient,
    translate: RoleClient,
    analyze: RoleClient,
}

/// A configured pipeline, ready to run over an input directory.
pub struct Pipeline {
    config: PipelineConfig,
    providers: [Arc<dyn CompletionProvider>; 4],
    gates: Gates,
    clients: Clients,
    rasterizer: Arc<dyn Rasterizer>,
    cpu: Arc<Semaphore>,
    cancel: CancellationToken,
    fatal: Mutex<Option<PipelineError>>,
}

impl Pipeline {
    /// Build a pipeline with an explicit rasteriser. Providers are resolved
    /// per role; a role without a usable provider is a fatal configuration
    /// error.
    pub fn new(
        config: PipelineConfig,
        rasterizer: Arc<dyn Rasterizer>,
    ) -> Result<Self, PipelineError> {
        let providers = [
            resolve_provider(ProviderRole::Ocr, &config.ocr)?,
            resolve_provider(ProviderRole::Format, &config.format)?,
            resolve_provider(ProviderRole::Translate, &config.translate)?,
            resolve_provider(ProviderRole::Analyze, &config.analyze)?,
        ];
        let gates = Gates::from_config(&config);
        let cancel = CancellationToken::new();
        let clients = build_clients(&config, &providers, &gates, &cancel);
        let cpu = Arc::new(Semaphore::new(config.render_workers.max(1)));
        Ok(Self {
            config,
            providers,
            gates,
            clients,
            rasterizer,
            cpu,
            cancel,
            fatal: Mutex::new(None),
        })
    }

    /// Build a pipeline that renders with pdfium.
    pub fn with_pdfium(config: PipelineConfig) -> Result<Self, PipelineError> {
        let rasterizer = PdfiumRasterizer::new().map_err(|e| match e {
            RenderError::Engine(detail) => PipelineError::PdfiumBindingFailed(detail),
            other => PipelineError::PdfiumBindingFailed(other.to_string()),
        })?;
        Self::new(config, Arc::new(rasterizer))
    }

    /// Replace the per-role gates, e.g. to share them between pipelines.
    pub fn with_gates(mut self, gates: Gates) -> Self {
        self.clients = build_clients(&self.config, &self.providers, &gates, &self.cancel);
        self.gates = gates;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gates(&self) -> &Gates {
        &self.gates
    }

    /// Token that aborts the run when cancelled (the CLI wires Ctrl-C to it).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process every PDF in `input_dir` into a fresh run root under
    /// `output_base`. Returns the run root.
    ///
    /// Everything that happens is recorded into `reporter`, which stays with
    /// the caller; on a fatal error it still holds the partial report.
    pub async fn run(
        &self,
        input_dir: &Path,
        output_base: &Path,
        reporter: &Reporter,
    ) -> Result<PathBuf, PipelineError> {
        let work = input::collect_work_list(input_dir)?;
        let root = create_run_root(output_base).await?;

        info!(
            "Processing {} PDF(s) from {} into {}",
            work.len(),
            input_dir.display(),
            root.display()
        );
        reporter.record(ReportEvent::RunStarted {
            output_root: root.clone(),
            documents: work.len(),
        });

        let organizer = Organizer::new(&root, self.config.copy_source);
        self.execute(work, root, &organizer, reporter).await
    }

    /// Continue an interrupted run in its existing `run_root`.
    ///
    /// Documents the root's placement journal lists as filed or held are
    /// skipped, their folders stay reserved, and their index entries carry
    /// over into the new `index.json`. Everything else in `input_dir` is
    /// processed as in [`Pipeline::run`].
    pub async fn resume(
        &self,
        input_dir: &Path,
        run_root: &Path,
        reporter: &Reporter,
    ) -> Result<PathBuf, PipelineError> {
        if !run_root.is_dir() {
            return Err(PipelineError::ResumeRootNotFound {
                path: run_root.to_path_buf(),
            });
        }
        let (organizer, records) = Organizer::resume(run_root, self.config.copy_source)
            .await
            .map_err(|source| PipelineError::ResumeFailed {
                path: run_root.to_path_buf(),
                source,
            })?;

        let placed: HashSet<&OsStr> = records.iter().filter_map(|r| r.source.file_name()).collect();
        let (skipped, work): (Vec<PathBuf>, Vec<PathBuf>) = input::collect_work_list(input_dir)?
            .into_iter()
            .partition(|p| p.file_name().is_some_and(|n| placed.contains(n)));
        for path in &skipped {
            debug!("already placed: {}", path.display());
        }

        info!(
            "Resuming {}: {} placed earlier, {} PDF(s) left in {}",
            run_root.display(),
            records.len(),
            work.len(),
            input_dir.display()
        );
        reporter.record(ReportEvent::RunStarted {
            output_root: run_root.to_path_buf(),
            documents: work.len(),
        });
        reporter.record(ReportEvent::Resumed {
            placed: records.len(),
            index: records.iter().filter_map(resumed_entry).collect(),
        });

        self.execute(work, run_root.to_path_buf(), &organizer, reporter)
            .await
    }

    async fn execute(
        &self,
        work: Vec<PathBuf>,
        root: PathBuf,
        organizer: &Organizer,
        reporter: &Reporter,
    ) -> Result<PathBuf, PipelineError> {
        stream::iter(work.into_iter().enumerate().map(|(seq, source)| {
            let doc = Document::new(seq, source);
            let span = info_span!("document", name = %doc.name());
            self.process(doc, organizer, reporter).instrument(span)
        }))
        .buffer_unordered(self.config.document_concurrency.max(1))
        .collect::<Vec<()>>()
        .await;

        let fatal = self
            .fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(err) = &fatal {
            reporter.record(ReportEvent::Fatal(err.to_string()));
        }
        reporter.record(ReportEvent::RunFinished);
        write_reports(&reporter.snapshot(), &root).await?;

        match fatal {
            Some(err) => {
                error!("Run aborted: {err}");
                Err(err)
            }
            None if self.cancel.is_cancelled() => Err(PipelineError::Interrupted),
            None => Ok(root),
        }
    }

    async fn process(&self, mut doc: Document, organizer: &Organizer, reporter: &Reporter) {
        if self.cancel.is_cancelled() {
            debug!("not started: run aborted");
            reporter.record(ReportEvent::Aborted);
            return;
        }

        // Page images live here until transcription consumes them; the
        // directory goes away when the document settles.
        let scratch = match tempfile::Builder::new().prefix("handbook-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                warn!("cannot create scratch directory: {e}");
                reporter.record(ReportEvent::Failure {
                    stage: "render",
                    kind: "scratch_dir".into(),
                });
                self.settle(&mut doc, DocumentStatus::Failed, None, reporter);
                return;
            }
        };

        // ── Render ───────────────────────────────────────────────────────
        let rendered = rasterize_document(
            Arc::clone(&self.rasterizer),
            &self.cpu,
            &doc.source,
            self.config.dpi,
            self.config.max_rendered_pixels,
            scratch.path(),
        )
        .await;
        match rendered {
            Ok(paths) => {
                reporter.record(ReportEvent::PagesRendered(paths.len()));
                doc.pages = paths
                    .into_iter()
                    .enumerate()
                    .map(|(i, p)| Page::new(i, p))
                    .collect();
                doc.set_status(DocumentStatus::Rasterized);
                debug!("rendered {} page(s)", doc.pages.len());
            }
            Err(RenderError::Engine(detail)) => {
                self.abort_run(PipelineError::PdfiumBindingFailed(detail));
                self.abort_document(&mut doc, reporter);
                return;
            }
            Err(e) => {
                warn!("render failed: {e}");
                reporter.record(ReportEvent::RenderFailed {
                    kind: e.kind().to_string(),
                });
                self.settle(&mut doc, DocumentStatus::Failed, None, reporter);
                return;
            }
        }

        // ── Transcribe ───────────────────────────────────────────────────
        if self.cancel.is_cancelled() {
            self.abort_document(&mut doc, reporter);
            return;
        }
        let stats = match transcribe_document(
            &mut doc,
            &self.clients.ocr,
            &self.clients.format,
            &self.config.page_separator,
        )
        .await
        {
            Ok(stats) => stats,
            Err(e) => {
                self.on_call_abort(e, &mut doc, reporter);
                return;
            }
        };
        reporter.record(ReportEvent::PagesTranscribed {
            transcribed: stats.transcribed,
            blank: stats.empty,
            placeholders: stats.placeholders,
        });
        reporter.record(ReportEvent::Retries(stats.retries));
        for (role, kind) in stats.failures {
            reporter.record(ReportEvent::Failure { stage: role, kind });
        }
        doc.set_status(DocumentStatus::Transcribed);

        if !doc.pages.is_empty() && doc.failed_pages == doc.pages.len() {
            warn!("every page failed transcription; holding");
            reporter.record(ReportEvent::Failure {
                stage: "transcribe",
                kind: "all_pages_failed".into(),
            });
            self.hold(&mut doc, organizer, reporter).await;
            return;
        }
        if doc.is_partial() {
            warn!("{} of {} page(s) are placeholders", doc.failed_pages, doc.pages.len());
        }
        let transcript = doc.transcript.clone().unwrap_or_default();
        if transcript.trim().is_empty() {
            info!("every page is blank; discarding");
            self.settle(&mut doc, DocumentStatus::Discarded, None, reporter);
            return;
        }

        // ── Translate ────────────────────────────────────────────────────
        if self.cancel.is_cancelled() {
            self.abort_document(&mut doc, reporter);
            return;
        }
        let name = doc.name();
        match translate_transcript(
            &name,
            &transcript,
            &self.clients.translate,
            &self.config.source_language,
            &self.config.target_language,
        )
        .await
        {
            Ok(TranslationOutcome::Translated(t)) => {
                reporter.record(ReportEvent::Retries(t.retries));
                reporter.record(ReportEvent::Translated {
                    drift: t.drift.is_some(),
                    retranslated: t.retranslated,
                });
                doc.translation = Some(t.text);
                doc.set_status(DocumentStatus::Translated);
            }
            Ok(TranslationOutcome::Unavailable { kind, retries }) => {
                reporter.record(ReportEvent::Retries(retries));
                reporter.record(ReportEvent::TranslationMissing);
                reporter.record(ReportEvent::Failure {
                    stage: "translate",
                    kind,
                });
            }
            Err(e) => {
                self.on_call_abort(e, &mut doc, reporter);
                return;
            }
        }

        // ── Analyze ──────────────────────────────────────────────────────
        if self.cancel.is_cancelled() {
            self.abort_document(&mut doc, reporter);
            return;
        }
        let analysis = match analyze_document(
            &name,
            &transcript,
            doc.translation.as_deref(),
            &self.clients.analyze,
            self.config.confidence_threshold,
            self.config.analysis_char_budget,
        )
        .await
        {
            Ok(a) => a,
            Err(e) => {
                self.on_call_abort(e, &mut doc, reporter);
                return;
            }
        };
        reporter.record(ReportEvent::Retries(analysis.retries));
        for _ in &analysis.ambiguities {
            reporter.record(ReportEvent::Ambiguity);
        }
        doc.set_status(DocumentStatus::Analyzed);

        // ── Organize ─────────────────────────────────────────────────────
        match analysis.outcome {
            AnalysisOutcome::Valid(meta) => {
                doc.verdict = Verdict::Valid;
                doc.metadata = Some(meta);
                match organizer.file(&doc).await {
                    Ok(placement) => {
                        let entry = index_entry(&doc, placement);
                        self.settle(&mut doc, DocumentStatus::Organized, entry, reporter);
                    }
                    Err(e) => {
                        error!("filing failed: {e}");
                        reporter.record(ReportEvent::Failure {
                            stage: "organize",
                            kind: "io".into(),
                        });
                        self.settle(&mut doc, DocumentStatus::Failed, None, reporter);
                    }
                }
            }
            AnalysisOutcome::Invalid { reason } => {
                info!("not filed: {reason}");
                doc.verdict = Verdict::Invalid;
                self.settle(&mut doc, DocumentStatus::Discarded, None, reporter);
            }
            AnalysisOutcome::Unfiled { kind } => {
                // Incomplete metadata and a failed analysis call both mean
                // valid-but-unfiled.
                doc.verdict = Verdict::Valid;
                reporter.record(ReportEvent::Failure {
                    stage: "analyze",
                    kind,
                });
                self.hold(&mut doc, organizer, reporter).await;
            }
        }
    }

    async fn hold(&self, doc: &mut Document, organizer: &Organizer, reporter: &Reporter) {
        match organizer.hold(doc).await {
            Ok(_) => self.settle(doc, DocumentStatus::Held, None, reporter),
            Err(e) => {
                error!("holding failed: {e}");
                reporter.record(ReportEvent::Failure {
                    stage: "organize",
                    kind: "io".into(),
                });
                self.settle(doc, DocumentStatus::Failed, None, reporter);
            }
        }
    }

    fn settle(
        &self,
        doc: &mut Document,
        status: DocumentStatus,
        entry: Option<IndexEntry>,
        reporter: &Reporter,
    ) {
        doc.set_status(status);
        debug!(?status, verdict = ?doc.verdict, "settled");
        reporter.record(ReportEvent::Settled {
            status,
            valid: doc.verdict == Verdict::Valid,
            entry,
        });
    }

    fn on_call_abort(&self, err: CallError, doc: &mut Document, reporter: &Reporter) {
        if let CallError::Fatal(e) = err {
            self.abort_run(PipelineError::from(e));
        }
        self.abort_document(doc, reporter);
    }

    fn abort_document(&self, doc: &mut Document, reporter: &Reporter) {
        warn!("stopped: run aborted");
        doc.set_status(DocumentStatus::Failed);
        reporter.record(ReportEvent::Aborted);
    }

    /// Remember the first fatal error and stop everything else.
    fn abort_run(&self, err: PipelineError) {
        let mut fatal = self
            .fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if fatal.is_none() {
            error!("fatal: {err}");
            *fatal = Some(err);
        }
        self.cancel.cancel();
    }
}

fn build_clients(
    config: &PipelineConfig,
    providers: &[Arc<dyn CompletionProvider>; 4],
    gates: &Gates,
    cancel: &CancellationToken,
) -> Clients {
    let client = |role: ProviderRole, provider: &Arc<dyn CompletionProvider>| {
        RoleClient::new(
            role,
            Arc::clone(provider),
            Arc::clone(gates.get(role)),
            config.settings(role).clone(),
            cancel.clone(),
        )
    };
    Clients {
        ocr: client(ProviderRole::Ocr, &providers[0]),
        format: client(ProviderRole::Format, &providers[1]),
        translate: client(ProviderRole::Translate, &providers[2]),
        analyze: client(ProviderRole::Analyze, &providers[3]),
    }
}

/// Create `handbooks_<timestamp>` under `output_base`. A root that already
/// exists belongs to another run started the same second; the new run takes
/// the next free `_<n>` suffix instead of sharing it.
async fn create_run_root(output_base: &Path) -> Result<PathBuf, PipelineError> {
    let root_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PipelineError::OutputRootFailed { path, source }
    };
    tokio::fs::create_dir_all(output_base)
        .await
        .map_err(root_err(output_base))?;

    let stamp = format!("handbooks_{}", Local::now().format("%Y%m%d_%H%M%S"));
    let mut n = 1;
    loop {
        let root = if n == 1 {
            output_base.join(&stamp)
        } else {
            output_base.join(format!("{stamp}_{n}"))
        };
        match tokio::fs::create_dir(&root).await {
            Ok(()) => return Ok(root),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(root_err(&root)(e)),
        }
    }
}

fn index_entry(doc: &Document, placement: Placement) -> Option<IndexEntry> {
    let meta = doc.metadata.as_ref()?;
    Some(entry_for(meta, placement.folder, placement.files, doc.name()))
}

fn resumed_entry(record: &PlacementRecord) -> Option<IndexEntry> {
    let meta = record.metadata.as_ref()?;
    let source = record
        .source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Some(entry_for(meta, record.folder.clone(), record.files.clone(), source))
}

fn entry_for(
    meta: &HandbookMetadata,
    folder: PathBuf,
    files: Vec<String>,
    source: String,
) -> IndexEntry {
    IndexEntry {
        university: meta.university.clone(),
        deadline: meta.deadline,
        folder,
        files,
        source,
        address: meta.address.clone(),
        summary: meta.summary.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{Completion, Request};
    use async_trait::async_trait;

    struct Never;

    #[async_trait]
    impl CompletionProvider for Never {
        fn name(&self) -> &str {
            "never"
        }
        async fn complete(&self, _: &Request) -> Result<Completion, ProviderError> {
            Err(ProviderError::Rejected {
                provider: "never".into(),
                detail: "not expected".into(),
            })
        }
    }

    struct NoRender;

    impl Rasterizer for NoRender {
        fn rasterize(
            &self,
            pdf: &Path,
            _dpi: u32,
            _max_pixels: u32,
            _out_dir: &Path,
        ) -> Result<Vec<PathBuf>, RenderError> {
            Err(RenderError::Corrupt {
                path: pdf.to_path_buf(),
                detail: "xref".into(),
            })
        }
    }

    fn pipeline() -> Pipeline {
        let config = PipelineConfig::builder()
            .provider_for_all(Arc::new(Never))
            .build()
            .unwrap();
        Pipeline::new(config, Arc::new(NoRender)).unwrap()
    }

    #[tokio::test]
    async fn empty_input_writes_empty_report() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let reporter = Reporter::new();

        let root = pipeline()
            .run(input.path(), output.path(), &reporter)
            .await
            .unwrap();
        assert!(root
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("handbooks_"));
        assert!(root.join(crate::report::REPORT_TEXT_FILE).exists());
        let r = reporter.snapshot();
        assert_eq!(r.documents_seen, 0);
        assert!(r.finished_at.is_some());
    }

    #[tokio::test]
    async fn missing_input_is_fatal() {
        let output = tempfile::tempdir().unwrap();
        let err = pipeline()
            .run(Path::new("/no/such/dir"), output.path(), &Reporter::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InputDirNotFound { .. }));
    }

    #[tokio::test]
    async fn render_failure_is_counted_not_fatal() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        std::fs::write(input.path().join("broken.pdf"), b"%PDF-1.4 garbage").unwrap();
        let reporter = Reporter::new();

        pipeline()
            .run(input.path(), output.path(), &reporter)
            .await
            .unwrap();
        let r = reporter.snapshot();
        assert_eq!(r.render_failures, 1);
        assert_eq!(r.failed, 1);
        assert_eq!(r.failures.get("render/corrupt"), Some(&1));
        assert!(input.path().join("broken.pdf").exists());
    }

    #[tokio::test]
    async fn runs_in_the_same_second_get_distinct_roots() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let p = pipeline();

        let first = p.run(input.path(), output.path(), &Reporter::new()).await.unwrap();
        let second = p.run(input.path(), output.path(), &Reporter::new()).await.unwrap();
        assert_ne!(first, second);
        assert!(first.join(crate::report::REPORT_TEXT_FILE).exists());
        assert!(second.join(crate::report::REPORT_TEXT_FILE).exists());
    }

    #[tokio::test]
    async fn resume_needs_an_existing_root() {
        let input = tempfile::tempdir().unwrap();
        let err = pipeline()
            .resume(input.path(), Path::new("/no/such/run"), &Reporter::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ResumeRootNotFound { .. }));
    }

    #[tokio::test]
    async fn cancelled_run_processes_nothing() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        std::fs::write(input.path().join("a.pdf"), b"%PDF-1.4").unwrap();
        let reporter = Reporter::new();
        let p = pipeline();
        p.cancel_token().cancel();

        let err = p.run(input.path(), output.path(), &reporter).await.unwrap_err();
        assert!(matches!(err, PipelineError::Interrupted));
        let r = reporter.snapshot();
        assert_eq!(r.aborted, 1);
        assert_eq!(r.render_failures, 0);
    }
}
