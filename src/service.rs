//! Single-slot job runner and the read side of the pipeline.
//!
//! [`BatchService`] is what an upload/progress/download front end talks to.
//! It accepts a batch, stages it, and starts the job on the tokio runtime;
//! every other method is a side-effect-free read of the tracker or of the
//! artifacts on disk.
//!
//! Only one job runs at a time. A submission while a job is running is
//! rejected with [`PipelineError::AlreadyProcessing`] before anything is
//! written; there is no queue.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::orchestrator::{run_batch, JobContext};
use crate::output::{is_pdf_name, BatchSummary, LatestResults, MetadataStatus, UploadedFile};
use crate::pipeline::aggregate;
use crate::pipeline::decode::{DocumentDecoder, PdfiumDecoder};
use crate::progress::{ProcessingStatus, ProgressTracker};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A file as received from the client: its original name and contents.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl IncomingFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Downloadable batch artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    ImageTable,
    SizeTable,
    ReducedArchive,
}

/// A running job.
#[derive(Debug)]
pub struct JobHandle {
    handle: JoinHandle<Result<BatchSummary, PipelineError>>,
    files: Vec<UploadedFile>,
}

impl JobHandle {
    /// Files staged for this job, in submission order.
    pub fn files(&self) -> &[UploadedFile] {
        &self.files
    }

    /// Wait for the job to end.
    pub async fn wait(self) -> Result<BatchSummary, PipelineError> {
        self.handle
            .await
            .map_err(|e| PipelineError::TaskPanicked {
                stage: "Batch",
                detail: e.to_string(),
            })?
    }
}

/// Entry point for submissions and status reads.
#[derive(Clone)]
pub struct BatchService {
    config: Arc<PipelineConfig>,
    decoder: Arc<dyn DocumentDecoder>,
    tracker: ProgressTracker,
}

impl BatchService {
    /// Create the service and every folder it writes to.
    pub fn new(
        config: PipelineConfig,
        decoder: Arc<dyn DocumentDecoder>,
    ) -> Result<Self, PipelineError> {
        for dir in [
            &config.upload_dir,
            &config.results_dir,
            &config.images_dir,
            &config.reduced_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(PipelineError::io(dir))?;
        }
        Ok(Self {
            config: Arc::new(config),
            decoder,
            tracker: ProgressTracker::new(),
        })
    }

    /// Service backed by pdfium, failing early if no library can be bound.
    pub fn with_pdfium(config: PipelineConfig) -> Result<Self, PipelineError> {
        let decoder = PdfiumDecoder::new();
        decoder
            .probe()
            .map_err(|e| PipelineError::PdfiumBindingFailed(e.to_string()))?;
        Self::new(config, Arc::new(decoder))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Handle to the shared progress record.
    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Accept a batch and start processing it in the background.
    ///
    /// Every name is checked before the job slot is claimed, so a rejected
    /// batch leaves the progress record and the staging folder untouched.
    /// Must be called from within a tokio runtime.
    pub async fn submit(&self, files: Vec<IncomingFile>) -> Result<JobHandle, PipelineError> {
        staged_names(&files)?;
        self.tracker.try_begin(files.len())?;

        let staged = match self.stage_files(files).await {
            Ok(staged) => staged,
            Err(e) => {
                self.tracker.fail(&e.to_string());
                return Err(e);
            }
        };
        info!("Accepted batch of {} files", staged.len());

        let ctx = JobContext {
            config: Arc::clone(&self.config),
            decoder: Arc::clone(&self.decoder),
            tracker: self.tracker.clone(),
        };
        let handle = tokio::spawn(run_batch(ctx, staged.clone()));
        Ok(JobHandle {
            handle,
            files: staged,
        })
    }

    /// Write every file to the staging folder under its sanitised name.
    pub async fn stage_files(
        &self,
        files: Vec<IncomingFile>,
    ) -> Result<Vec<UploadedFile>, PipelineError> {
        let dir = &self.config.upload_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(PipelineError::io(dir))?;

        let names = staged_names(&files)?;
        let mut staged = Vec::with_capacity(files.len());
        for (file, name) in files.into_iter().zip(names) {
            let storage_path = dir.join(&name);
            tokio::fs::write(&storage_path, &file.bytes)
                .await
                .map_err(PipelineError::io(&storage_path))?;
            debug!("Staged {} ({} bytes)", storage_path.display(), file.bytes.len());
            staged.push(UploadedFile {
                name,
                storage_path,
                size_bytes: file.bytes.len() as u64,
            });
        }
        Ok(staged)
    }

    /// Snapshot of the progress record.
    pub fn progress(&self) -> ProcessingStatus {
        self.tracker.get()
    }

    /// The last summary with download paths and byte totals recomputed.
    pub fn latest_results(&self) -> Result<Option<LatestResults>, PipelineError> {
        latest_results_at(&self.config)
    }

    /// State of the image metadata table, with the live job fields.
    pub fn metadata_status(&self) -> Result<MetadataStatus, PipelineError> {
        metadata_status_at(&self.config, self.tracker.get())
    }

    /// Path of a downloadable artifact, if it exists.
    pub fn artifact_path(&self, artifact: Artifact) -> Result<PathBuf, PipelineError> {
        let path = match artifact {
            Artifact::ImageTable => self.config.image_table_path(),
            Artifact::SizeTable => self.config.size_table_path(),
            Artifact::ReducedArchive => self.config.archive_path(),
        };
        existing(path)
    }

    /// Path of one reduced document by its file name.
    pub fn reduced_file(&self, name: &str) -> Result<PathBuf, PipelineError> {
        let mut components = Path::new(name).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(std::path::Component::Normal(c)), None) if c == name
        );
        if !plain {
            return Err(PipelineError::InvalidFileName {
                name: name.to_string(),
            });
        }
        existing(self.config.reduced_dir.join(name))
    }

    /// Pre-check a batch without staging it: every name must be a PDF.
    pub fn validate_batch<S: AsRef<str>>(&self, names: &[S]) -> Result<(), PipelineError> {
        if names.is_empty() {
            return Err(PipelineError::NoFiles);
        }
        for name in names {
            let name = name.as_ref();
            if name.trim().is_empty() {
                return Err(PipelineError::EmptyFileName);
            }
            if !is_pdf_name(name) {
                return Err(PipelineError::NotAPdf {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// [`BatchService::latest_results`] for the layout in `config`, without a
/// service. Reads only; no folder is created.
pub fn latest_results_at(config: &PipelineConfig) -> Result<Option<LatestResults>, PipelineError> {
    Ok(aggregate::read_latest(&config.summary_path())?.map(LatestResults::from_summary))
}

/// [`BatchService::metadata_status`] for the layout in `config`, with the
/// live fields taken from `status`. Reads only.
pub fn metadata_status_at(
    config: &PipelineConfig,
    status: ProcessingStatus,
) -> Result<MetadataStatus, PipelineError> {
    let stats = aggregate::read_image_table_stats(&config.image_table_path())?;
    let message = if status.is_processing {
        format!("Processing in progress: {}", status.status_message)
    } else if stats.is_some() {
        "Metadata file is ready".to_string()
    } else {
        "Metadata file does not exist yet".to_string()
    };

    Ok(MetadataStatus {
        exists: stats.is_some(),
        status: message,
        is_processing: status.is_processing,
        progress: status.progress,
        current_file: status.current_file,
        file_size: stats.as_ref().map(|s| s.size_bytes),
        file_size_kb: stats.as_ref().map(|s| s.size_kb),
        last_modified: stats.as_ref().and_then(|s| s.modified.clone()),
        row_count: stats.as_ref().map(|s| s.rows),
        high_res_count: stats.as_ref().map(|s| s.high_res_rows),
    })
}

fn existing(path: PathBuf) -> Result<PathBuf, PipelineError> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(PipelineError::FileNotFound { path })
    }
}

/// Sanitised name of every file, in order.
///
/// Fails on an empty batch, on a name with nothing usable left and on two
/// names that sanitise to the same file.
fn staged_names(files: &[IncomingFile]) -> Result<Vec<String>, PipelineError> {
    if files.is_empty() {
        return Err(PipelineError::NoFiles);
    }
    let mut seen = HashSet::with_capacity(files.len());
    files
        .iter()
        .map(|file| {
            let name = sanitize_file_name(&file.name).ok_or(PipelineError::EmptyFileName)?;
            if !seen.insert(name.clone()) {
                return Err(PipelineError::DuplicateFileName { name });
            }
            Ok(name)
        })
        .collect()
}

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.-]").unwrap());

/// Reduce a client-supplied name to a safe flat file name.
///
/// Non-ASCII characters are dropped, path separators and whitespace become
/// `_`, anything else outside `[A-Za-z0-9._-]` is removed, and leading or
/// trailing dots and underscores are stripped. `None` if nothing is left.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let ascii: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| {
            if c == '/' || c == '\\' || c.is_ascii_whitespace() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let ascii = ascii.split('_').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("_");
    let cleaned = UNSAFE_CHARS.replace_all(&ascii, "");
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
