//! CLI binary for handbook-pipeline.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, shows a progress bar while the run is going and prints
//! the run report at the end.

use anyhow::{Context, Result};
use clap::Parser;
use handbook_pipeline::pipeline::input::collect_work_list;
use handbook_pipeline::{
    PageSeparator, Pipeline, PipelineConfig, PipelineError, ProviderRole, Reporter, RunReport,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process everything in ./downloads into ./handbooks_<timestamp>/
  handbooks downloads

  # Write the run root somewhere else, keep the input PDFs in place
  handbooks downloads -o /srv/archive --copy-source

  # Use Anthropic for every role, a cheaper model for OCR
  handbooks downloads --provider anthropic --ocr-model claude-haiku-4-20250514

  # Be gentle with a rate-limited account
  handbooks downloads --ocr-concurrency 1 --ocr-min-interval-ms 1500

  # Continue a run that was interrupted, in the same run root
  handbooks downloads --resume ./handbooks_20250301_101500

  # Just list what would be processed
  handbooks downloads --dry-run

OUTPUT LAYOUT:
  handbooks_<YYYYMMDD_HHMMSS>/
    <University>_<YYYYMMDD>/        one folder per valid handbook
      <University>_<YYYYMMDD>.pdf
      <University>_<YYYYMMDD>.md
      <University>_<YYYYMMDD>_translated.md
    _unfiled/<pdf name>/            needs a human look
    run_report.txt / run_report.json / index.json
    placements.jsonl                one line per filed or held document

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  HANDBOOKS_*             Every flag below (see --help for names)
  PDFIUM_LIB_PATH         Path to an existing libpdfium — skips auto-download
  PDFIUM_AUTO_CACHE_DIR   Override the default pdfium cache directory

  A .env file in the working directory is loaded at startup.
"#;

/// Transcribe, translate, classify and file scanned admission handbooks.
#[derive(Parser, Debug)]
#[command(
    name = "handbooks",
    version,
    about = "Transcribe, translate, classify and file scanned admission handbooks",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Directory holding the downloaded PDFs.
    #[arg(env = "HANDBOOKS_INPUT_DIR")]
    input_dir: PathBuf,

    /// Directory the run root is created in.
    #[arg(short, long, env = "HANDBOOKS_OUTPUT_DIR", default_value = ".")]
    output: PathBuf,

    /// edgequake-llm provider for every role (openai, anthropic, gemini, ollama, …).
    #[arg(long, env = "HANDBOOKS_PROVIDER")]
    provider: Option<String>,

    #[arg(long, env = "HANDBOOKS_OCR_MODEL")]
    ocr_model: Option<String>,

    #[arg(long, env = "HANDBOOKS_FORMAT_MODEL")]
    format_model: Option<String>,

    #[arg(long, env = "HANDBOOKS_TRANSLATE_MODEL")]
    translate_model: Option<String>,

    #[arg(long, env = "HANDBOOKS_ANALYZE_MODEL")]
    analyze_model: Option<String>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "HANDBOOKS_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Documents processed at the same time.
    #[arg(long, env = "HANDBOOKS_DOCUMENT_CONCURRENCY", default_value_t = 4)]
    document_concurrency: usize,

    /// Concurrent rasterisation jobs (default: number of CPUs).
    #[arg(long, env = "HANDBOOKS_RENDER_WORKERS")]
    render_workers: Option<usize>,

    #[arg(long, env = "HANDBOOKS_OCR_CONCURRENCY")]
    ocr_concurrency: Option<usize>,

    #[arg(long, env = "HANDBOOKS_FORMAT_CONCURRENCY")]
    format_concurrency: Option<usize>,

    #[arg(long, env = "HANDBOOKS_TRANSLATE_CONCURRENCY")]
    translate_concurrency: Option<usize>,

    #[arg(long, env = "HANDBOOKS_ANALYZE_CONCURRENCY")]
    analyze_concurrency: Option<usize>,

    /// Minimum spacing between OCR requests.
    #[arg(long, env = "HANDBOOKS_OCR_MIN_INTERVAL_MS")]
    ocr_min_interval_ms: Option<u64>,

    #[arg(long, env = "HANDBOOKS_FORMAT_MIN_INTERVAL_MS")]
    format_min_interval_ms: Option<u64>,

    #[arg(long, env = "HANDBOOKS_TRANSLATE_MIN_INTERVAL_MS")]
    translate_min_interval_ms: Option<u64>,

    #[arg(long, env = "HANDBOOKS_ANALYZE_MIN_INTERVAL_MS")]
    analyze_min_interval_ms: Option<u64>,

    /// Retries per provider call on transient failure.
    #[arg(long, env = "HANDBOOKS_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Base backoff before the first retry; doubles each attempt.
    #[arg(long, env = "HANDBOOKS_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// OCR retries; overrides --max-retries.
    #[arg(long, env = "HANDBOOKS_OCR_MAX_RETRIES")]
    ocr_max_retries: Option<u32>,

    #[arg(long, env = "HANDBOOKS_FORMAT_MAX_RETRIES")]
    format_max_retries: Option<u32>,

    #[arg(long, env = "HANDBOOKS_TRANSLATE_MAX_RETRIES")]
    translate_max_retries: Option<u32>,

    #[arg(long, env = "HANDBOOKS_ANALYZE_MAX_RETRIES")]
    analyze_max_retries: Option<u32>,

    /// OCR backoff base; overrides --retry-backoff-ms.
    #[arg(long, env = "HANDBOOKS_OCR_RETRY_BACKOFF_MS")]
    ocr_retry_backoff_ms: Option<u64>,

    #[arg(long, env = "HANDBOOKS_FORMAT_RETRY_BACKOFF_MS")]
    format_retry_backoff_ms: Option<u64>,

    #[arg(long, env = "HANDBOOKS_TRANSLATE_RETRY_BACKOFF_MS")]
    translate_retry_backoff_ms: Option<u64>,

    #[arg(long, env = "HANDBOOKS_ANALYZE_RETRY_BACKOFF_MS")]
    analyze_retry_backoff_ms: Option<u64>,

    /// Per-page OCR/format call timeout in seconds.
    #[arg(long, env = "HANDBOOKS_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    #[arg(long, env = "HANDBOOKS_SOURCE_LANGUAGE", default_value = "Japanese")]
    source_language: String,

    #[arg(long, env = "HANDBOOKS_TARGET_LANGUAGE", default_value = "Simplified Chinese")]
    target_language: String,

    /// Minimum classifier confidence for a document to be filed.
    #[arg(long, env = "HANDBOOKS_CONFIDENCE_THRESHOLD", default_value_t = 0.7)]
    confidence_threshold: f32,

    /// Page separator in transcripts: none, hr, comment, or a custom string.
    #[arg(long, env = "HANDBOOKS_SEPARATOR", default_value = "none")]
    separator: String,

    /// Continue in an existing run root; documents it already filed or held
    /// are skipped.
    #[arg(long, env = "HANDBOOKS_RESUME", value_name = "RUN_ROOT")]
    resume: Option<PathBuf>,

    /// Copy input PDFs instead of moving them.
    #[arg(long, env = "HANDBOOKS_COPY_SOURCE")]
    copy_source: bool,

    /// List the work list and exit without calling any provider.
    #[arg(long)]
    dry_run: bool,

    /// Disable progress bar.
    #[arg(long, env = "HANDBOOKS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "HANDBOOKS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "HANDBOOKS_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env first so clap's `env = ...` attributes see it.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // With the bar active only errors are logged; the bar and the final
    // report carry everything else.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.dry_run;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Dry run ──────────────────────────────────────────────────────────
    if cli.dry_run {
        let work = collect_work_list(&cli.input_dir).context("Failed to read input directory")?;
        for path in &work {
            println!("{}", path.display());
        }
        eprintln!("{} PDF(s) would be processed", bold(&work.len().to_string()));
        return Ok(());
    }

    ensure_pdfium(cli.quiet)?;

    let config = build_config(&cli)?;
    let pipeline = Pipeline::with_pdfium(config).context("Failed to set up the pipeline")?;

    // Ctrl-C aborts the run; whatever finished is still reported.
    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    // ── Run ──────────────────────────────────────────────────────────────
    let reporter = Reporter::new();
    let bar = show_progress.then(new_bar);

    let run = async {
        match &cli.resume {
            Some(root) => pipeline.resume(&cli.input_dir, root, &reporter).await,
            None => pipeline.run(&cli.input_dir, &cli.output, &reporter).await,
        }
    };
    tokio::pin!(run);
    let mut tick = tokio::time::interval(Duration::from_millis(200));
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = tick.tick() => {
                if let Some(bar) = &bar {
                    update_bar(bar, &reporter.snapshot());
                }
            }
        }
    };

    let report = reporter.snapshot();
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    if !cli.quiet {
        println!("{}", report.render());
    }

    match result {
        Ok(root) => {
            if !cli.quiet {
                eprintln!(
                    "{} {} filed, {} held, {} discarded  →  {}",
                    green("✔"),
                    bold(&report.organized.to_string()),
                    report.held,
                    report.discarded,
                    bold(&root.display().to_string()),
                );
            }
            Ok(())
        }
        Err(err @ (PipelineError::Authentication { .. }
        | PipelineError::PdfiumBindingFailed(_)
        | PipelineError::Interrupted)) => {
            eprintln!(
                "{} run aborted after {}/{} document(s)",
                red("✘"),
                report.documents_settled - report.aborted,
                report.documents_seen
            );
            Err(err).context("Run aborted")
        }
        Err(err) => Err(err).context("Run failed"),
    }
}

/// Make sure the pdfium shared library is present before anything renders.
///
/// With `bundled` the library was embedded at compile time and only needs
/// extracting. Otherwise the first run downloads it (~30 MB) into the
/// pdfium-auto cache; later runs just check the path.
fn ensure_pdfium(quiet: bool) -> Result<()> {
    #[cfg(feature = "bundled")]
    {
        let _ = quiet;
        tokio::task::block_in_place(pdfium_auto::ensure_pdfium_bundled)
            .context("Failed to extract bundled PDFium engine")?;
    }

    #[cfg(not(feature = "bundled"))]
    if !pdfium_auto::is_pdfium_cached() {
        if quiet {
            tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
                .context("Failed to download PDFium engine")?;
            return Ok(());
        }

        let dl_bar = ProgressBar::new(0);
        dl_bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        dl_bar.set_prefix("PDF engine");
        dl_bar.enable_steady_tick(Duration::from_millis(80));

        let bar = dl_bar.clone();
        tokio::task::block_in_place(|| {
            pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
                if let Some(t) = total {
                    if bar.length().unwrap_or(0) != t {
                        bar.set_length(t);
                    }
                }
                bar.set_position(downloaded);
            }))
        })
        .context("Failed to download PDFium engine")?;

        dl_bar.finish_with_message("ready ✓");
    }

    Ok(())
}

fn new_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} documents  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    bar.set_prefix("Processing");
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

fn update_bar(bar: &ProgressBar, report: &RunReport) {
    bar.set_length(report.documents_seen as u64);
    bar.set_position(report.documents_settled as u64);
    bar.set_message(format!(
        "{} pages  {} filed  {}",
        report.pages_transcribed,
        cyan(&report.organized.to_string()),
        if report.total_failures() > 0 {
            red(&format!("{} failures", report.total_failures()))
        } else {
            String::new()
        }
    ));
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .dpi(cli.dpi)
        .document_concurrency(cli.document_concurrency)
        .source_language(cli.source_language.as_str())
        .target_language(cli.target_language.as_str())
        .confidence_threshold(cli.confidence_threshold)
        .page_separator(parse_separator(&cli.separator))
        .copy_source(cli.copy_source)
        .max_retries(cli.max_retries)
        .retry_backoff_ms(cli.retry_backoff_ms)
        .page_timeout_secs(cli.api_timeout);

    if let Some(n) = cli.render_workers {
        builder = builder.render_workers(n);
    }
    if let Some(ref name) = cli.provider {
        builder = builder.provider_name(name.as_str());
    }

    let per_role = [
        (ProviderRole::Ocr, &cli.ocr_model, cli.ocr_concurrency, cli.ocr_min_interval_ms),
        (ProviderRole::Format, &cli.format_model, cli.format_concurrency, cli.format_min_interval_ms),
        (ProviderRole::Translate, &cli.translate_model, cli.translate_concurrency, cli.translate_min_interval_ms),
        (ProviderRole::Analyze, &cli.analyze_model, cli.analyze_concurrency, cli.analyze_min_interval_ms),
    ];
    for (role, model, concurrency, interval) in per_role {
        if let Some(m) = model {
            builder = builder.model(role, m.as_str());
        }
        if let Some(n) = concurrency {
            builder = builder.max_in_flight(role, n);
        }
        if let Some(ms) = interval {
            builder = builder.min_interval_ms(role, ms);
        }
    }

    let retry_policy = [
        (ProviderRole::Ocr, cli.ocr_max_retries, cli.ocr_retry_backoff_ms),
        (ProviderRole::Format, cli.format_max_retries, cli.format_retry_backoff_ms),
        (ProviderRole::Translate, cli.translate_max_retries, cli.translate_retry_backoff_ms),
        (ProviderRole::Analyze, cli.analyze_max_retries, cli.analyze_retry_backoff_ms),
    ];
    for (role, retries, backoff) in retry_policy {
        if let Some(n) = retries {
            builder = builder.role_max_retries(role, n);
        }
        if let Some(ms) = backoff {
            builder = builder.role_retry_backoff_ms(role, ms);
        }
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--separator` string into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" | "---" => PageSeparator::HorizontalRule,
        "comment" => PageSeparator::Comment,
        custom => PageSeparator::Custom(custom.to_string()),
    }
}
