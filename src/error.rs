//! Error types for the autograde pipeline.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`PipelineError`] — **Fatal / rejecting**: a submission is refused
//!   (no files, a job already running) or a job cannot continue (the results
//!   folder cannot be written). Returned as `Err(PipelineError)` from the
//!   service and the orchestrator; a job that hits one ends `Failed`.
//!
//! * [`FileError`] — **Non-fatal**: one file of the batch could not be
//!   decoded, compressed or finished in time. The orchestrator records it
//!   (a `Failed` size record, zero image records) and moves to the next file.
//!
//! * [`DecodeError`] — failures reported by the PDF decoder collaborator.
//!   Stages translate them into [`FileError`]s with the file name attached.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal or rejecting errors returned by the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Submission errors ─────────────────────────────────────────────────
    /// The batch contained no files at all.
    #[error("No files part in the request")]
    NoFiles,

    /// A file of the batch has no usable name once sanitised.
    #[error("No files selected")]
    EmptyFileName,

    /// Two files of the batch would be staged under the same name.
    #[error("Duplicate file name '{name}' in batch")]
    DuplicateFileName { name: String },

    /// Another batch currently holds the single job slot.
    #[error("A processing task is already in progress")]
    AlreadyProcessing,

    /// A batch pre-check found a file without a `.pdf` extension.
    #[error("File {name} is not a PDF")]
    NotAPdf { name: String },

    /// A download request named something other than a plain file name.
    #[error("Invalid file name '{name}'")]
    InvalidFileName { name: String },

    /// A requested artifact or reduced file does not exist (yet).
    #[error("File not found: '{path}'")]
    FileNotFound { path: PathBuf },

    // ── Artifact errors ───────────────────────────────────────────────────
    /// Creating, wiping or writing a pipeline directory or file failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing or reading a CSV metadata table failed.
    #[error("Metadata table '{path}' failed: {source}")]
    Table {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// Building the reduced-files archive failed.
    #[error("Archive '{path}' failed: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    /// The JSON batch summary could not be written or parsed.
    #[error("Summary '{path}' failed: {source}")]
    Summary {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A graded-submission record could not be written or parsed.
    #[error("Submission record '{path}' failed: {source}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A blocking pipeline task panicked or was cancelled by the runtime.
    #[error("{stage} task panicked: {detail}")]
    TaskPanicked { stage: &'static str, detail: String },

    // ── Decoder / grading errors ──────────────────────────────────────────
    /// The PDF could not be opened for grading.
    #[error("PDF '{path}' is unreadable: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium, place the library next to the\n\
working directory, or install it system-wide.\n"
    )]
    PdfiumBindingFailed(String),

    /// The configured LLM provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The LLM API kept failing after all retries.
    #[error("LLM API error: {message}")]
    LlmApiError { message: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Build an [`PipelineError::Io`] mapper for `path`, for use with `map_err`.
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| PipelineError::Io { path, source }
    }

    /// True for errors caused by the caller's request rather than the server.
    ///
    /// An HTTP layer maps these to a 4xx status; everything else is a 5xx.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::NoFiles
                | PipelineError::EmptyFileName
                | PipelineError::DuplicateFileName { .. }
                | PipelineError::AlreadyProcessing
                | PipelineError::NotAPdf { .. }
                | PipelineError::InvalidFileName { .. }
                | PipelineError::FileNotFound { .. }
        )
    }
}

/// A non-fatal error for a single file of the batch.
///
/// The batch continues; the file ends up with a `Failed` size record and
/// contributes no image records.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FileError {
    /// The document could not be opened or a page could not be read.
    #[error("{file}: could not decode document: {detail}")]
    Decode { file: String, detail: String },

    /// Rasterising a page failed.
    #[error("{file}: page {page}: rasterisation failed: {detail}")]
    Render {
        file: String,
        page: usize,
        detail: String,
    },

    /// Re-encoding a page raster failed.
    #[error("{file}: page {page}: image encoding failed: {detail}")]
    Encode {
        file: String,
        page: usize,
        detail: String,
    },

    /// The reduced document could not be written.
    #[error("{file}: failed to write '{path}': {detail}")]
    Write {
        file: String,
        path: String,
        detail: String,
    },

    /// The per-file budget expired; the work was cancelled.
    #[error("{file}: timed out after {secs}s")]
    TimedOut { file: String, secs: u64 },

    /// The stage observed its cancellation token and stopped early.
    #[error("{file}: cancelled")]
    Cancelled { file: String },

    /// The blocking task for this file panicked.
    #[error("{file}: processing crashed: {detail}")]
    Crashed { file: String, detail: String },
}

/// Errors reported by a [`crate::pipeline::decode::DocumentDecoder`].
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// The decoder library itself is unavailable.
    #[error("decoder unavailable: {0}")]
    Unavailable(String),

    /// The file is missing, not a PDF, encrypted or corrupt.
    #[error("cannot open '{path}': {detail}")]
    Open { path: PathBuf, detail: String },

    /// 1-based page number beyond the end of the document.
    #[error("page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// The decoder failed on one page (1-based).
    #[error("page {page}: {detail}")]
    Page { page: usize, detail: String },
}
