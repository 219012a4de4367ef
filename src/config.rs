//! Configuration for the batch pipeline.
//!
//! Every knob lives in [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. The folder layout mirrors what graders already
//! know from the upload tool: uploads are staged in `uploads/`, extracted
//! images land in `Extracted_images/<document>/` and every result artifact in
//! `results/`.

use crate::error::PipelineError;
use crate::pipeline::compress::CompressionSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the image metadata table inside the results folder.
pub const IMAGE_TABLE_FILE: &str = "image_metadata.csv";
/// File name of the size-reduction table inside the results folder.
pub const SIZE_TABLE_FILE: &str = "file_size_metadata.csv";
/// File name of the packaged reduced documents.
pub const ARCHIVE_FILE: &str = "reduced_pdfs.zip";
/// File name of the single-slot batch summary.
pub const SUMMARY_FILE: &str = "latest_results.json";

/// Configuration for batch processing.
///
/// # Example
/// ```rust
/// use autograde_pipeline::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .results_dir("/srv/grading/results")
///     .dpi(120)
///     .min_image_width(1600)
///     .build()
///     .unwrap();
/// assert_eq!(config.compression().dpi, 120);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Staging folder for uploaded files. Default: `uploads`.
    pub upload_dir: PathBuf,

    /// Folder holding every result artifact. Default: `results`.
    pub results_dir: PathBuf,

    /// Folder for reduced documents; wiped at the start of every job.
    /// Default: `results/reduced_pdfs`.
    pub reduced_dir: PathBuf,

    /// Root of the per-document image folders; wiped at the start of every
    /// job. Default: `Extracted_images`.
    pub images_dir: PathBuf,

    /// Ledger of graded submissions, one JSON file each. Default: `submissions`.
    pub submissions_dir: PathBuf,

    /// Minimum pixel width for an image to count as high resolution. Default: 1200.
    pub min_image_width: u32,

    /// Rasterisation DPI for the compression stage. Range: 36–600. Default: 100.
    pub dpi: u32,

    /// Integer factor each page raster is shrunk by. Range: 1–16. Default: 2.
    pub downscale_factor: u32,

    /// JPEG quality of the re-encoded pages. Range: 1–100. Default: 75.
    pub jpeg_quality: u8,

    /// Budget for one file in one stage, in seconds. Default: 300.
    ///
    /// A file that exceeds it is cancelled and recorded as failed; the rest
    /// of the batch continues.
    pub file_timeout_secs: u64,

    /// Number of image records copied into the summary as a preview. Default: 10.
    pub preview_len: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            results_dir: PathBuf::from("results"),
            reduced_dir: PathBuf::from("results/reduced_pdfs"),
            images_dir: PathBuf::from("Extracted_images"),
            submissions_dir: PathBuf::from("submissions"),
            min_image_width: 1200,
            dpi: 100,
            downscale_factor: 2,
            jpeg_quality: 75,
            file_timeout_secs: 300,
            preview_len: 10,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Root every folder under `root`, keeping the default layout.
    ///
    /// Handy for tests and for running several isolated pipelines side by side.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let results_dir = root.join("results");
        Self {
            upload_dir: root.join("uploads"),
            reduced_dir: results_dir.join("reduced_pdfs"),
            results_dir,
            images_dir: root.join("Extracted_images"),
            submissions_dir: root.join("submissions"),
            ..Self::default()
        }
    }

    /// Settings handed to the compression stage.
    pub fn compression(&self) -> CompressionSettings {
        CompressionSettings {
            dpi: self.dpi,
            downscale_factor: self.downscale_factor,
            jpeg_quality: self.jpeg_quality,
        }
    }

    pub fn image_table_path(&self) -> PathBuf {
        self.results_dir.join(IMAGE_TABLE_FILE)
    }

    pub fn size_table_path(&self) -> PathBuf {
        self.results_dir.join(SIZE_TABLE_FILE)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.results_dir.join(ARCHIVE_FILE)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.results_dir.join(SUMMARY_FILE)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Start from an existing configuration instead of the defaults.
    pub fn from_config(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.upload_dir = dir.into();
        self
    }

    /// Set the results folder. The reduced-output folder follows it unless
    /// set explicitly afterwards.
    pub fn results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.config.reduced_dir = dir.join("reduced_pdfs");
        self.config.results_dir = dir;
        self
    }

    pub fn reduced_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.reduced_dir = dir.into();
        self
    }

    pub fn images_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.images_dir = dir.into();
        self
    }

    pub fn submissions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.submissions_dir = dir.into();
        self
    }

    pub fn min_image_width(mut self, px: u32) -> Self {
        self.config.min_image_width = px;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi;
        self
    }

    pub fn downscale_factor(mut self, factor: u32) -> Self {
        self.config.downscale_factor = factor;
        self
    }

    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.config.jpeg_quality = quality;
        self
    }

    pub fn file_timeout_secs(mut self, secs: u64) -> Self {
        self.config.file_timeout_secs = secs;
        self
    }

    pub fn preview_len(mut self, n: usize) -> Self {
        self.config.preview_len = n;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.min_image_width == 0 {
            return Err(PipelineError::InvalidConfig(
                "Minimum image width must be ≥ 1".into(),
            ));
        }
        if !(36..=600).contains(&c.dpi) {
            return Err(PipelineError::InvalidConfig(format!(
                "DPI must be 36–600, got {}",
                c.dpi
            )));
        }
        if !(1..=16).contains(&c.downscale_factor) {
            return Err(PipelineError::InvalidConfig(format!(
                "Downscale factor must be 1–16, got {}",
                c.downscale_factor
            )));
        }
        if !(1..=100).contains(&c.jpeg_quality) {
            return Err(PipelineError::InvalidConfig(format!(
                "JPEG quality must be 1–100, got {}",
                c.jpeg_quality
            )));
        }
        if c.file_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "Per-file timeout must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_upload_tool_layout() {
        let c = PipelineConfig::default();
        assert_eq!(c.min_image_width, 1200);
        assert_eq!(c.dpi, 100);
        assert_eq!(c.downscale_factor, 2);
        assert_eq!(c.image_table_path(), PathBuf::from("results/image_metadata.csv"));
        assert_eq!(c.archive_path(), PathBuf::from("results/reduced_pdfs.zip"));
        assert_eq!(c.reduced_dir, PathBuf::from("results/reduced_pdfs"));
    }

    #[test]
    fn results_dir_moves_reduced_dir() {
        let c = PipelineConfig::builder()
            .results_dir("/srv/out")
            .build()
            .unwrap();
        assert_eq!(c.reduced_dir, PathBuf::from("/srv/out/reduced_pdfs"));
        assert_eq!(c.summary_path(), PathBuf::from("/srv/out/latest_results.json"));
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(PipelineConfig::builder().dpi(10).build().is_err());
        assert!(PipelineConfig::builder().downscale_factor(0).build().is_err());
        assert!(PipelineConfig::builder().jpeg_quality(0).build().is_err());
        assert!(PipelineConfig::builder().file_timeout_secs(0).build().is_err());
        assert!(PipelineConfig::builder().min_image_width(0).build().is_err());
    }

    #[test]
    fn rooted_layout() {
        let c = PipelineConfig::rooted_at("/tmp/job");
        assert_eq!(c.upload_dir, PathBuf::from("/tmp/job/uploads"));
        assert_eq!(c.reduced_dir, PathBuf::from("/tmp/job/results/reduced_pdfs"));
        assert_eq!(c.images_dir, PathBuf::from("/tmp/job/Extracted_images"));
        assert_eq!(c.submissions_dir, PathBuf::from("/tmp/job/submissions"));
    }
}
