//! Job orchestration: one batch through every stage, with progress.
//!
//! [`run_batch`] owns the sequencing and the percentage bookkeeping; the
//! stages in [`crate::pipeline`] know nothing about the tracker.
//!
//! ## Progress checkpoints
//!
//! ```text
//!   0  job claimed
//!   2  output folders wiped, pages counted
//!   5–10   start of each PDF's extraction (by file index)
//!  10–55   extraction, by pages done across the whole batch
//!  55  image table written
//!  60–95   compression, by file index
//!  95  tables, archive, summary
//! 100  complete
//! ```
//!
//! ## Failure scopes
//!
//! A [`FileError`] costs one file (a `Failed` size record, no images) and the
//! batch goes on. A [`PipelineError`] from a batch-wide step ends the job:
//! the tracker records the error and artifacts already written stay on disk.
//!
//! Every blocking stage call runs under `file_timeout_secs`. On expiry the
//! file's cancellation token fires and the batch moves on, but the blocking
//! task keeps running until its next page boundary. Such tasks are parked
//! and awaited before the archive is built and before the job slot is
//! released: a late task never writes into the next job's folders or
//! progress record. A cancelled task reports no progress.

use crate::config::PipelineConfig;
use crate::error::{FileError, PipelineError};
use crate::output::{BatchSummary, ImageRecord, SizeReductionRecord, UploadedFile};
use crate::pipeline::aggregate::{self, ArtifactPaths};
use crate::pipeline::compress::{self, CompressionOutcome};
use crate::pipeline::decode::DocumentDecoder;
use crate::pipeline::extract::{self, ExtractionRequest};
use crate::progress::{ProgressTracker, Stage};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Everything one job needs, cheap to clone into blocking tasks.
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<PipelineConfig>,
    pub decoder: Arc<dyn DocumentDecoder>,
    pub tracker: ProgressTracker,
}

/// Run one batch to completion.
///
/// The caller must already hold the job slot (see
/// [`ProgressTracker::try_begin`]); this function releases it through
/// `complete` or `fail`.
pub async fn run_batch(
    ctx: JobContext,
    files: Vec<UploadedFile>,
) -> Result<BatchSummary, PipelineError> {
    info!("Batch started: {} files", files.len());
    let mut stragglers = Stragglers::default();
    let outcome = run_stages(&ctx, &files, &mut stragglers).await;
    stragglers.drain().await;

    match outcome {
        Ok(summary) => {
            ctx.tracker.complete("Processing complete!");
            info!(
                "Batch complete: {} reduced, {} failed, {} images",
                summary.reduced_count,
                summary.failed_count,
                summary.image_extraction.total_images
            );
            Ok(summary)
        }
        Err(e) => {
            error!("Batch failed: {}", e);
            ctx.tracker.fail(&e.to_string());
            Err(e)
        }
    }
}

async fn run_stages(
    ctx: &JobContext,
    files: &[UploadedFile],
    stragglers: &mut Stragglers,
) -> Result<BatchSummary, PipelineError> {
    let tracker = &ctx.tracker;
    let config = &ctx.config;

    // ── Preparing ──────────────────────────────────────────────────────────
    tracker.enter(Stage::Preparing);
    tracker.update(0, Some("Preparing output folders..."), None);
    let images_dir = config.images_dir.clone();
    let reduced_dir = config.reduced_dir.clone();
    let results_dir = config.results_dir.clone();
    blocking("Cleanup", move || {
        extract::prepare_output_dir(&images_dir).map_err(PipelineError::io(&images_dir))?;
        extract::prepare_output_dir(&reduced_dir).map_err(PipelineError::io(&reduced_dir))?;
        std::fs::create_dir_all(&results_dir).map_err(PipelineError::io(&results_dir))
    })
    .await?;
    tracker.update(2, Some("Counting pages..."), None);

    let pdfs: Vec<&UploadedFile> = files.iter().filter(|f| f.is_pdf()).collect();
    let total_pages = count_pages(ctx, &pdfs).await?;

    // ── Image extraction ───────────────────────────────────────────────────
    tracker.enter(Stage::ExtractingImages);
    let image_records = extract_all(ctx, &pdfs, total_pages, stragglers).await;

    let table = config.image_table_path();
    let records = image_records.clone();
    blocking("Image table", move || aggregate::write_image_table(&table, &records)).await?;
    tracker.update(
        55,
        Some(&format!("Extracted {} images", image_records.len())),
        None,
    );

    // ── Compression ────────────────────────────────────────────────────────
    tracker.enter(Stage::Compressing);
    tracker.update(60, Some("Reducing PDF sizes..."), None);
    let (size_records, stale) = compress_all(ctx, files, stragglers).await;

    // A timed-out task may still write its output; wait, then clean up.
    stragglers.drain().await;
    for path in stale {
        remove_stale_output(&path);
    }

    // ── Finalizing ─────────────────────────────────────────────────────────
    tracker.enter(Stage::Finalizing);
    tracker.update(95, Some("Generating result data..."), None);
    let config = Arc::clone(config);
    blocking("Finalize", move || {
        aggregate::write_size_table(&config.size_table_path(), &size_records)?;
        aggregate::package_reduced(&config.reduced_dir, &config.archive_path())?;
        let summary = BatchSummary::from_records(
            size_records,
            &image_records,
            &ArtifactPaths::from(config.as_ref()),
            config.preview_len,
        );
        aggregate::write_summary(&config.summary_path(), &summary)?;
        Ok(summary)
    })
    .await
}

/// Pages across all PDFs. Unreadable documents count as zero; the result
/// is at least 1 so it can divide.
async fn count_pages(ctx: &JobContext, pdfs: &[&UploadedFile]) -> Result<usize, PipelineError> {
    let decoder = Arc::clone(&ctx.decoder);
    let paths: Vec<(String, PathBuf)> = pdfs
        .iter()
        .map(|f| (f.name.clone(), f.storage_path.clone()))
        .collect();
    let total = blocking("Page count", move || {
        Ok(paths
            .iter()
            .map(|(name, path)| match decoder.page_count(path) {
                Ok(n) => n,
                Err(e) => {
                    warn!("{}: cannot count pages: {}", name, e);
                    0
                }
            })
            .sum::<usize>())
    })
    .await?;
    info!("Batch has {} pages across {} PDFs", total, pdfs.len());
    Ok(total.max(1))
}

async fn extract_all(
    ctx: &JobContext,
    pdfs: &[&UploadedFile],
    total_pages: usize,
    stragglers: &mut Stragglers,
) -> Vec<ImageRecord> {
    let tracker = &ctx.tracker;
    let n = pdfs.len();
    let mut records = Vec::new();
    let mut pages_before = 0usize;

    for (idx, file) in pdfs.iter().enumerate() {
        tracker.update(
            checkpoint(5, 5, idx, n),
            Some(&format!("Extracting images from {}", file.name)),
            Some(&file.name),
        );

        let request = ExtractionRequest {
            path: file.storage_path.clone(),
            file_name: file.name.clone(),
            images_root: ctx.config.images_dir.clone(),
            min_width: ctx.config.min_image_width,
        };
        let decoder = Arc::clone(&ctx.decoder);
        let progress = tracker.clone();
        let name = file.name.clone();
        let base = pages_before;

        let outcome = run_file_task(ctx, &file.name, stragglers, move |cancel| {
            let mut done_here = 0;
            let result = extract::extract_images(
                decoder.as_ref(),
                &request,
                &mut |page, total| {
                    done_here = page;
                    if cancel.is_cancelled() {
                        return;
                    }
                    progress.update(
                        checkpoint(10, 45, base + page, total_pages),
                        Some(&format!("Processing page {page}/{total} of {name}")),
                        None,
                    );
                },
                &cancel,
            );
            (result, done_here)
        })
        .await;

        match outcome {
            Ok((Ok(found), pages)) => {
                pages_before += pages;
                records.extend(found);
                tracker.note_processed(&file.name);
            }
            Ok((Err(e @ FileError::Decode { .. }), pages)) => {
                // Unreadable document: nothing to extract, counts as handled.
                warn!("Skipping image extraction: {}", e);
                pages_before += pages;
                tracker.note_processed(&file.name);
            }
            Ok((Err(e), pages)) => {
                warn!("Image extraction failed: {}", e);
                pages_before += pages;
            }
            Err(e) => warn!("Image extraction failed: {}", e),
        }
    }
    records
}

/// Size records in submission order, plus the outputs of failed files that
/// must be removed once every task has stopped.
async fn compress_all(
    ctx: &JobContext,
    files: &[UploadedFile],
    stragglers: &mut Stragglers,
) -> (Vec<SizeReductionRecord>, Vec<PathBuf>) {
    let tracker = &ctx.tracker;
    let n = files.len();
    let mut records = Vec::with_capacity(n);
    let mut stale = Vec::new();

    for (idx, file) in files.iter().enumerate() {
        tracker.update(
            checkpoint(60, 35, idx, n),
            Some(&format!("Reducing {}", file.name)),
            Some(&file.name),
        );

        if !file.is_pdf() {
            info!("{}: not a PDF, passed through", file.name);
            records.push(SizeReductionRecord::not_processed(file));
            continue;
        }

        let output = ctx.config.reduced_dir.join(format!("reduced_{}", file.name));
        let input = file.storage_path.clone();
        let target = output.clone();
        let name = file.name.clone();
        let decoder = Arc::clone(&ctx.decoder);
        let settings = ctx.config.compression();
        let progress = tracker.clone();

        let outcome = run_file_task(ctx, &file.name, stragglers, move |cancel| {
            compress::compress_document(
                decoder.as_ref(),
                &input,
                &target,
                &name,
                settings,
                &mut |page, total| {
                    if !cancel.is_cancelled() {
                        progress.message(&format!("Reducing {name}: page {page}/{total}"), None);
                    }
                },
                &cancel,
            )
        })
        .await
        .and_then(|r| r);

        records.push(match outcome {
            Ok(CompressionOutcome {
                original_size,
                reduced_size,
                output_bytes,
                ..
            }) => SizeReductionRecord::reduced(
                file,
                &output,
                output_bytes,
                original_size.label(),
                reduced_size.label(),
            ),
            Err(e) => {
                warn!("Compression failed: {}", e);
                stale.push(output);
                SizeReductionRecord::failed(file)
            }
        });
    }
    (records, stale)
}

fn remove_stale_output(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}

/// Blocking tasks given up on after a timeout but still running.
#[derive(Default)]
struct Stragglers(Vec<(String, JoinHandle<()>)>);

impl Stragglers {
    fn push<T: Send + 'static>(&mut self, file: &str, handle: JoinHandle<T>) {
        let name = file.to_string();
        let watcher = tokio::spawn(async move {
            if let Err(e) = handle.await {
                warn!("{}: timed-out task crashed: {}", name, e);
            }
        });
        self.0.push((file.to_string(), watcher));
    }

    /// Wait for every parked task to stop.
    async fn drain(&mut self) {
        for (file, watcher) in self.0.drain(..) {
            info!("{}: waiting for the timed-out task to stop", file);
            if let Err(e) = watcher.await {
                warn!("{}: {}", file, e);
            }
        }
    }
}

/// Run `work` on the blocking pool under the per-file timeout.
///
/// On timeout the token handed to `work` is cancelled, the still-running
/// task is parked in `stragglers` and [`FileError::TimedOut`] returned; a
/// panic becomes [`FileError::Crashed`].
async fn run_file_task<T, F>(
    ctx: &JobContext,
    file: &str,
    stragglers: &mut Stragglers,
    work: F,
) -> Result<T, FileError>
where
    F: FnOnce(CancellationToken) -> T + Send + 'static,
    T: Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let secs = ctx.config.file_timeout_secs;
    let mut handle = tokio::task::spawn_blocking(move || work(token));

    match tokio::time::timeout(Duration::from_secs(secs), &mut handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(FileError::Crashed {
            file: file.to_string(),
            detail: e.to_string(),
        }),
        Err(_) => {
            cancel.cancel();
            stragglers.push(file, handle);
            Err(FileError::TimedOut {
                file: file.to_string(),
                secs,
            })
        }
    }
}

/// Batch-wide blocking step; a panic ends the job.
async fn blocking<T, F>(stage: &'static str, f: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::TaskPanicked {
            stage,
            detail: e.to_string(),
        })?
}

/// `base + done/total * span`, truncated.
fn checkpoint(base: u8, span: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return base;
    }
    let frac = (done.min(total) as f64) / (total as f64);
    base + (frac * span as f64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::decode::PdfiumDecoder;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn timed_out_task_is_awaited_by_drain() {
        let ctx = JobContext {
            config: Arc::new(PipelineConfig::builder().file_timeout_secs(1).build().unwrap()),
            decoder: Arc::new(PdfiumDecoder::new()),
            tracker: ProgressTracker::new(),
        };
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let mut stragglers = Stragglers::default();

        let err = run_file_task(&ctx, "slow.pdf", &mut stragglers, move |cancel| {
            std::thread::sleep(Duration::from_millis(1500));
            if cancel.is_cancelled() {
                flag.store(true, Ordering::SeqCst);
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, FileError::TimedOut { secs: 1, .. }));
        assert!(!finished.load(Ordering::SeqCst));
        stragglers.drain().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn checkpoints_stay_in_their_band() {
        assert_eq!(checkpoint(5, 5, 0, 3), 5);
        assert_eq!(checkpoint(5, 5, 2, 3), 8);
        assert_eq!(checkpoint(10, 45, 7, 7), 55);
        assert_eq!(checkpoint(10, 45, 9, 7), 55);
        assert_eq!(checkpoint(60, 35, 1, 2), 77);
        assert_eq!(checkpoint(60, 35, 0, 0), 60);
    }
}
