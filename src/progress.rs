//! Process-wide progress record for the single batch job.
//!
//! [`ProgressTracker`] is a cheaply clonable handle around one
//! [`ProcessingStatus`]. The job that holds the slot is the only writer;
//! any number of pollers read snapshots through [`ProgressTracker::get`].
//!
//! The slot itself is taken with [`ProgressTracker::try_begin`], which checks
//! and sets `is_processing` under the same write lock, so two submissions
//! racing for an idle pipeline cannot both start a job.
//!
//! # Example
//!
//! ```rust
//! use autograde_pipeline::{ProgressTracker, Stage};
//!
//! let tracker = ProgressTracker::new();
//! tracker.try_begin(2).unwrap();
//! assert!(tracker.try_begin(1).is_err()); // slot taken
//!
//! tracker.enter(Stage::ExtractingImages);
//! tracker.update(30, Some("Processing page 1/4"), Some("a.pdf"));
//! tracker.update(10, None, None); // ignored: progress never goes back
//! assert_eq!(tracker.get().progress, 30);
//!
//! tracker.complete("Processing complete!");
//! assert!(!tracker.get().is_processing);
//! ```

use crate::error::PipelineError;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Running phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Wiping output folders and counting pages.
    Preparing,
    /// Pulling embedded images out of every PDF.
    ExtractingImages,
    /// Rasterising and re-encoding every PDF.
    Compressing,
    /// Writing tables, archive and summary.
    Finalizing,
}

/// Job state machine: `Idle → Running(..) → Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Idle,
    Running(Stage),
    Completed,
    Failed,
}

/// Snapshot of the progress record, serialised as-is by the progress endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    /// True exactly while a batch is in flight.
    pub is_processing: bool,
    /// 0–100, non-decreasing within one job.
    pub progress: u8,
    pub status_message: String,
    pub current_file: String,
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: Option<DateTime<Local>>,
    pub last_updated_at: Option<DateTime<Local>>,
    /// Files whose extraction finished (or was cleanly skipped), in order.
    pub processed_files: Vec<String>,
    pub total_files: usize,
    /// Set when the job failed; summaries written before it are untrustworthy.
    pub error: Option<String>,
    pub state: JobState,
}

/// Shared handle to the process-wide [`ProcessingStatus`].
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<ProcessingStatus>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, ProcessingStatus> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ProcessingStatus> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the job slot for a batch of `total_files`.
    ///
    /// Fails with [`PipelineError::AlreadyProcessing`] and leaves the record
    /// untouched when another job is running.
    pub fn try_begin(&self, total_files: usize) -> Result<(), PipelineError> {
        let mut status = self.write();
        if status.is_processing {
            return Err(PipelineError::AlreadyProcessing);
        }
        *status = fresh_status(total_files);
        status.is_processing = true;
        status.state = JobState::Running(Stage::Preparing);
        Ok(())
    }

    /// Replace the record with a fresh job record for `total_files`.
    ///
    /// Does not claim the slot; use [`Self::try_begin`] to start a job.
    pub fn reset(&self, total_files: usize) {
        *self.write() = fresh_status(total_files);
    }

    /// Move the running job to `stage`.
    pub fn enter(&self, stage: Stage) {
        let mut status = self.write();
        debug!("Job stage → {:?}", stage);
        status.state = JobState::Running(stage);
        status.last_updated_at = Some(Local::now());
    }

    /// Record progress, optionally replacing the message and current file.
    ///
    /// Empty strings count as "not given". A `progress` below the current
    /// value is ignored so pollers never see the bar move backwards.
    pub fn update(&self, progress: u8, message: Option<&str>, current_file: Option<&str>) {
        let mut status = self.write();
        status.progress = status.progress.max(progress.min(100));
        if let Some(message) = message.filter(|m| !m.is_empty()) {
            status.status_message = message.to_string();
        }
        if let Some(file) = current_file.filter(|f| !f.is_empty()) {
            status.current_file = file.to_string();
        }
        status.last_updated_at = Some(Local::now());
        debug!("Progress: {}% - {}", status.progress, status.status_message);
    }

    /// Replace message and current file without touching the percentage.
    pub fn message(&self, message: &str, current_file: Option<&str>) {
        let current = self.read().progress;
        self.update(current, Some(message), current_file);
    }

    /// Append `file` to the processed list.
    pub fn note_processed(&self, file: &str) {
        let mut status = self.write();
        status.processed_files.push(file.to_string());
        status.last_updated_at = Some(Local::now());
    }

    /// Release the job slot.
    pub fn finish(&self) {
        release(&mut self.write());
    }

    /// Successful end of the job: progress forced to 100.
    ///
    /// Readers never see 100 while `is_processing` is still true.
    pub fn complete(&self, message: &str) {
        let mut status = self.write();
        status.progress = 100;
        status.status_message = message.to_string();
        status.state = JobState::Completed;
        release(&mut status);
    }

    /// Failed end of the job. Progress stays where it was.
    pub fn fail(&self, error: &str) {
        let mut status = self.write();
        status.status_message = format!("Processing error: {error}");
        status.error = Some(error.to_string());
        status.state = JobState::Failed;
        release(&mut status);
    }

    /// Consistent snapshot of the record.
    pub fn get(&self) -> ProcessingStatus {
        self.read().clone()
    }

    pub fn is_processing(&self) -> bool {
        self.read().is_processing
    }
}

fn release(status: &mut ProcessingStatus) {
    let now = Local::now();
    status.is_processing = false;
    status.ended_at = Some(now);
    status.last_updated_at = Some(now);
    if matches!(status.state, JobState::Running(_)) {
        status.state = JobState::Idle;
    }
    debug!("Job slot released ({:?})", status.state);
}

fn fresh_status(total_files: usize) -> ProcessingStatus {
    let now = Local::now();
    ProcessingStatus {
        status_message: "Starting file processing...".to_string(),
        started_at: Some(now),
        last_updated_at: Some(now),
        total_files,
        ..ProcessingStatus::default()
    }
}
