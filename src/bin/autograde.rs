//! CLI binary for autograde-pipeline.
//!
//! A thin shim over the library crate: `process` runs one batch with a live
//! progress bar, `status` prints the latest results, `grade` scores one
//! submission against the rubric and `submissions` lists the graded ones.

use anyhow::{bail, Context, Result};
use autograde_pipeline::{
    grade_and_record, latest_results_at, metadata_status_at, BatchService, GradeReport,
    GradedSubmission, Grader, IncomingFile, LlmGrader, PdfiumDecoder, PipelineConfig, PipelineConfigBuilder,
    ProcessingStatus, ReductionStatus, Student, SubmissionStore,
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process a batch; artifacts land in ./results and ./Extracted_images
  autograde process submissions/*.pdf

  # Keep everything under one folder, finer rasters
  autograde --root /srv/grading process --dpi 150 week3/*.pdf

  # Latest summary and image-table status as JSON
  autograde status

  # Rubric grade for one submission
  autograde grade student.pdf --architect "Zaha Hadid"

  # Grade, write student feedback and record it in submissions/
  autograde grade student.pdf --student "Ada Lovelace" --pid A1234567

  # Every recorded grade, newest first
  autograde submissions

ENVIRONMENT VARIABLES:
  AUTOGRADE_ROOT          Root folder for uploads/, results/, Extracted_images/, submissions/
  PDFIUM_LIB_PATH         Path to an existing libpdfium
  OPENAI_API_KEY          OpenAI API key (grading)
  ANTHROPIC_API_KEY       Anthropic API key (grading)
  GEMINI_API_KEY          Google Gemini API key (grading)
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
"#;

/// Batch-process and grade architecture-course PDF submissions.
#[derive(Parser, Debug)]
#[command(
    name = "autograde",
    version,
    about = "Batch-process and grade architecture-course PDF submissions",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Root folder for uploads/, results/, Extracted_images/ and submissions/.
    #[arg(long, global = true, env = "AUTOGRADE_ROOT")]
    root: Option<PathBuf>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "AUTOGRADE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "AUTOGRADE_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage files and run one batch: image extraction, compression, reports.
    Process(ProcessArgs),
    /// Print the latest batch results and image-table status as JSON.
    Status,
    /// Grade one submission against the rubric with a vision model.
    Grade(GradeArgs),
    /// List recorded grades, newest first.
    Submissions {
        /// Print the records as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct ProcessArgs {
    /// Files to submit. Non-PDF files are passed through unprocessed.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Rasterisation DPI for compression (36–600).
    #[arg(long, env = "AUTOGRADE_DPI", default_value_t = 100)]
    dpi: u32,

    /// Integer downscale factor applied to each page raster (1–16).
    #[arg(long, env = "AUTOGRADE_DOWNSCALE", default_value_t = 2)]
    downscale: u32,

    /// JPEG quality of re-encoded pages (1–100).
    #[arg(long, env = "AUTOGRADE_JPEG_QUALITY", default_value_t = 75)]
    jpeg_quality: u8,

    /// Minimum width in pixels for an image to count as high resolution.
    #[arg(long, env = "AUTOGRADE_MIN_WIDTH", default_value_t = 1200)]
    min_width: u32,

    /// Per-file, per-stage timeout in seconds.
    #[arg(long, env = "AUTOGRADE_FILE_TIMEOUT", default_value_t = 300)]
    file_timeout: u64,

    /// Print the batch summary as JSON.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "AUTOGRADE_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct GradeArgs {
    /// Submission PDF.
    pdf: PathBuf,

    /// Architect the submission is about.
    #[arg(long, default_value = "Bjarke Ingels")]
    architect: String,

    /// Student name. With --pid, also writes feedback and records the grade.
    #[arg(long, requires = "pid")]
    student: Option<String>,

    /// Student ID.
    #[arg(long)]
    pid: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// LLM model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Print the full report as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let base = match &cli.root {
        Some(root) => PipelineConfig::rooted_at(root),
        None => PipelineConfig::default(),
    };

    match cli.command {
        Command::Process(ref args) => process(&cli, base, args).await,
        Command::Status => status(base),
        Command::Grade(ref args) => grade(&cli, base, args).await,
        Command::Submissions { json } => submissions(base, json),
    }
}

async fn process(cli: &Cli, base: PipelineConfig, args: &ProcessArgs) -> Result<()> {
    let config = PipelineConfigBuilder::from_config(base)
        .dpi(args.dpi)
        .downscale_factor(args.downscale)
        .jpeg_quality(args.jpeg_quality)
        .min_image_width(args.min_width)
        .file_timeout_secs(args.file_timeout)
        .build()?;
    let service = BatchService::with_pdfium(config)?;

    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        files.push(IncomingFile::new(name, bytes));
    }

    let job = service.submit(files).await?;

    if !cli.quiet && !args.no_progress && !args.json {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} [{bar:42.green/238}] {pos:>3}%  {msg}  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        let tracker = service.tracker().clone();
        while tracker.is_processing() {
            let s = tracker.get();
            bar.set_position(u64::from(s.progress));
            bar.set_message(s.status_message);
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        let s = tracker.get();
        bar.set_position(u64::from(s.progress));
        bar.finish_and_clear();
    }

    let summary = match job.wait().await {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("{} {}", red("✗"), e);
            bail!("batch failed");
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    if cli.quiet {
        return Ok(());
    }

    for r in &summary.size_results {
        let mark = match r.status {
            ReductionStatus::Reduced => green("✓"),
            ReductionStatus::Failed => red("✗"),
            ReductionStatus::NotProcessed => dim("–"),
        };
        eprintln!(
            "  {} {:<40} {:>9.1} KB → {:>9.1} KB  {}",
            mark,
            r.file_name,
            r.original_size_kb,
            r.reduced_size_kb,
            dim(&format!("{:.1}%", r.reduction_percent))
        );
    }
    eprintln!(
        "{} {} files, {} reduced, {} failed; {} images ({} high-res); {}% saved",
        bold("Done:"),
        summary.total_files,
        summary.reduced_count,
        summary.failed_count,
        summary.image_extraction.total_images,
        summary.image_extraction.high_res_images,
        summary.percent_saved
    );
    eprintln!("  {}", dim(&summary.archive_path));
    Ok(())
}

fn status(config: PipelineConfig) -> Result<()> {
    // No job runs in this process, so the live fields are idle.
    let report = serde_json::json!({
        "latest_results": latest_results_at(&config)?,
        "metadata_status": metadata_status_at(&config, ProcessingStatus::default())?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn grade(cli: &Cli, config: PipelineConfig, args: &GradeArgs) -> Result<()> {
    if !args.pdf.is_file() {
        bail!("{} does not exist", args.pdf.display());
    }
    let decoder = PdfiumDecoder::new();
    decoder.probe().context("pdfium is required for grading")?;
    let grader = LlmGrader::from_env(
        Arc::new(decoder),
        args.provider.as_deref(),
        args.model.as_deref(),
    )?;

    let spinner = (!cli.quiet && !args.json).then(|| {
        let s = ProgressBar::new_spinner();
        s.set_message(format!("Grading {}…", args.pdf.display()));
        s.enable_steady_tick(Duration::from_millis(80));
        s
    });

    let student = args
        .pid
        .as_ref()
        .map(|pid| Student::new(args.student.clone().unwrap_or_default(), pid.clone()));
    let outcome = match &student {
        Some(student) => {
            let store = SubmissionStore::from_config(&config);
            grade_and_record(&grader, &store, &args.pdf, student, &args.architect)
                .await
                .map(Graded::Recorded)
        }
        None => grader
            .grade(&args.pdf, &args.architect)
            .await
            .map(Graded::Report),
    };
    if let Some(s) = spinner {
        s.finish_and_clear();
    }

    match outcome? {
        Graded::Report(report) if args.json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Graded::Report(report) => print_report(&report),
        Graded::Recorded(done) if args.json => {
            println!("{}", serde_json::to_string_pretty(&done)?);
        }
        Graded::Recorded(done) => {
            print_report(&done.report);
            println!();
            println!("{}", bold("Feedback:"));
            println!("{}", done.feedback);
            eprintln!("  {}", dim(&done.record_path.display().to_string()));
        }
    }
    Ok(())
}

enum Graded {
    Report(GradeReport),
    Recorded(GradedSubmission),
}

fn print_report(report: &GradeReport) {
    println!("{}", report.evaluation);
    println!();
    for (criterion, score) in &report.scorecard.scores {
        println!("  {:<40} {}/5", criterion.label(), score);
    }
    println!(
        "{} {}/{} = {}%  {}",
        bold("Total:"),
        report.scorecard.total,
        report.scorecard.max_total,
        report.scorecard.final_percent,
        bold(&format!("Grade: {}", report.scorecard.grade))
    );
}

fn submissions(config: PipelineConfig, json: bool) -> Result<()> {
    let records = SubmissionStore::from_config(&config).list()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        eprintln!("{}", dim("No graded submissions yet."));
        return Ok(());
    }
    for r in &records {
        println!(
            "{}  {:<12} {:<28} {:<24} {:>6.2}%  {}",
            r.timestamp, r.student_pid, r.student_name, r.architect_name, r.score, r.grade
        );
    }
    Ok(())
}
