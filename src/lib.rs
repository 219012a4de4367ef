//! # autograde-pipeline
//!
//! Batch processing of graded PDF submissions: pull every embedded image out
//! for review, shrink every document to a predictable size, and grade it
//! against the course rubric with a vision model.
//!
//! ## Why a background job?
//!
//! A batch of fifty photo-heavy submissions takes minutes to rasterise. The
//! upload returns as soon as the files are staged; the job runs on the tokio
//! runtime and anyone can poll [`ProgressTracker`] snapshots while it works.
//! Exactly one job runs at a time, and a second submission is rejected, not
//! queued.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Stage     sanitise names, write to uploads/           (0%)
//!  ├─ 2. Prepare   wipe image + reduced folders, count pages   (2%)
//!  ├─ 3. Extract   embedded images → PNG + ImageRecord         (5–55%)
//!  ├─ 4. Compress  page rasters → downscaled JPEG PDF          (60–95%)
//!  └─ 5. Finalize  CSV tables, zip, latest_results.json        (95–100%)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use autograde_pipeline::{BatchService, IncomingFile, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = BatchService::with_pdfium(PipelineConfig::default())?;
//!     let job = service
//!         .submit(vec![IncomingFile::new("student.pdf", std::fs::read("student.pdf")?)])
//!         .await?;
//!
//!     // Meanwhile: service.progress() from any task or thread.
//!     let summary = job.wait().await?;
//!     println!("{} images, {}% saved",
//!         summary.image_extraction.total_images,
//!         summary.percent_saved);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `autograde` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod grading;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod service;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{DecodeError, FileError, PipelineError};
pub use grading::{
    grade_and_record, parse_summary_scores, Criterion, GradeReport, GradedSubmission, Grader,
    GraderConfig, LetterGrade, LlmGrader, Scorecard, Student, SubmissionRecord, SubmissionStore,
};
pub use orchestrator::{run_batch, JobContext};
pub use output::{
    BatchSummary, ImageExtractionSummary, ImageRecord, LatestResults, MetadataStatus,
    ReductionStatus, SizeReductionRecord, UploadedFile,
};
pub use pipeline::decode::{DecodedDocument, DocumentDecoder, PageSize, PdfiumDecoder, RawImage};
pub use progress::{JobState, ProcessingStatus, ProgressTracker, Stage};
pub use service::{
    latest_results_at, metadata_status_at, sanitize_file_name, Artifact, BatchService,
    IncomingFile, JobHandle,
};
