//! Records produced by a batch job.
//!
//! [`ImageRecord`] and [`SizeReductionRecord`] serialise with the column names
//! of the CSV tables graders already open in spreadsheets, so the same serde
//! derive drives both the tables and the JSON summary.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Timestamp format used inside tables and the summary.
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn timestamp_now() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Round to one decimal place.
pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub(crate) fn kib(bytes: u64) -> f64 {
    round1(bytes as f64 / 1024.0)
}

/// A file accepted into a batch and staged on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Sanitised file name; unique within the staging folder.
    pub name: String,
    pub storage_path: PathBuf,
    pub size_bytes: u64,
}

impl UploadedFile {
    /// Describe an already staged file, reading its size from disk.
    pub fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let storage_path = path.into();
        let size_bytes = std::fs::metadata(&storage_path)?.len();
        let name = storage_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            storage_path,
            size_bytes,
        })
    }

    /// Whether the pipeline treats this file as a PDF (by extension).
    pub fn is_pdf(&self) -> bool {
        is_pdf_name(&self.name)
    }
}

pub(crate) fn is_pdf_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".pdf")
}

/// One embedded raster image pulled out of a submitted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    #[serde(rename = "pdf_file")]
    pub source_file: String,
    /// 1-based page number.
    pub page: usize,
    pub image_name: String,
    pub image_path: String,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "resolution")]
    pub resolution_label: String,
    pub is_high_res: bool,
}

impl ImageRecord {
    pub(crate) const COLUMNS: [&'static str; 8] = [
        "pdf_file",
        "page",
        "image_name",
        "image_path",
        "width",
        "height",
        "resolution",
        "is_high_res",
    ];

    /// Build a record; `is_high_res` is `width >= min_width`.
    pub fn new(
        source_file: impl Into<String>,
        page: usize,
        image_name: impl Into<String>,
        image_path: &Path,
        (width, height): (u32, u32),
        min_width: u32,
    ) -> Self {
        Self {
            source_file: source_file.into(),
            page,
            image_name: image_name.into(),
            image_path: image_path.to_string_lossy().into_owned(),
            width,
            height,
            resolution_label: format!("{width}x{height}"),
            is_high_res: width >= min_width,
        }
    }
}

/// Outcome of the compression stage for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReductionStatus {
    Reduced,
    Failed,
    #[serde(rename = "Not Processed (Not a PDF)")]
    NotProcessed,
}

/// Before/after sizes of one submitted file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeReductionRecord {
    pub file_name: String,
    pub original_path: String,
    /// `"-"` when no reduced document exists.
    pub reduced_path: String,
    pub original_size_kb: f64,
    pub reduced_size_kb: f64,
    pub reduction_percent: f64,
    pub original_resolution: String,
    pub reduced_resolution: String,
    pub status: ReductionStatus,
    pub timestamp: String,
    /// Exact byte counts feeding the batch totals; not part of the tables.
    #[serde(skip)]
    pub original_bytes: u64,
    #[serde(skip)]
    pub reduced_bytes: u64,
}

impl SizeReductionRecord {
    pub(crate) const COLUMNS: [&'static str; 10] = [
        "file_name",
        "original_path",
        "reduced_path",
        "original_size_kb",
        "reduced_size_kb",
        "reduction_percent",
        "original_resolution",
        "reduced_resolution",
        "status",
        "timestamp",
    ];

    /// A successfully reduced document.
    pub fn reduced(
        file: &UploadedFile,
        reduced_path: &Path,
        reduced_bytes: u64,
        original_resolution: String,
        reduced_resolution: String,
    ) -> Self {
        let reduction_percent = if file.size_bytes == 0 {
            0.0
        } else {
            round1(100.0 * (1.0 - reduced_bytes as f64 / file.size_bytes as f64))
        };
        Self {
            file_name: file.name.clone(),
            original_path: file.storage_path.to_string_lossy().into_owned(),
            reduced_path: reduced_path.to_string_lossy().into_owned(),
            original_size_kb: kib(file.size_bytes),
            reduced_size_kb: kib(reduced_bytes),
            reduction_percent,
            original_resolution,
            reduced_resolution,
            status: ReductionStatus::Reduced,
            timestamp: timestamp_now(),
            original_bytes: file.size_bytes,
            reduced_bytes,
        }
    }

    /// A PDF whose compression failed. Its reduced size is reported as the
    /// original size so batch savings are never overstated.
    pub fn failed(file: &UploadedFile) -> Self {
        Self::unchanged(file, ReductionStatus::Failed, "Unknown")
    }

    /// A non-PDF file passed through untouched.
    pub fn not_processed(file: &UploadedFile) -> Self {
        Self::unchanged(file, ReductionStatus::NotProcessed, "N/A")
    }

    fn unchanged(file: &UploadedFile, status: ReductionStatus, resolution: &str) -> Self {
        Self {
            file_name: file.name.clone(),
            original_path: file.storage_path.to_string_lossy().into_owned(),
            reduced_path: "-".to_string(),
            original_size_kb: kib(file.size_bytes),
            reduced_size_kb: kib(file.size_bytes),
            reduction_percent: 0.0,
            original_resolution: resolution.to_string(),
            reduced_resolution: resolution.to_string(),
            status,
            timestamp: timestamp_now(),
            original_bytes: file.size_bytes,
            reduced_bytes: file.size_bytes,
        }
    }
}

/// Image counts of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageExtractionSummary {
    pub total_images: usize,
    pub high_res_images: usize,
    pub metadata_csv: String,
}

/// The single current result of the last finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_files: usize,
    pub reduced_count: usize,
    pub failed_count: usize,
    pub not_processed_count: usize,
    pub total_original_size_kb: f64,
    pub total_reduced_size_kb: f64,
    /// Whole percent saved over the batch; negative if the batch grew.
    pub percent_saved: i64,
    pub image_extraction: ImageExtractionSummary,
    pub size_results: Vec<SizeReductionRecord>,
    /// The first few image records, for a quick look.
    pub image_metadata: Vec<ImageRecord>,
    pub meta_size_csv_path: String,
    pub meta_image_csv_path: String,
    pub archive_path: String,
    pub timestamp: String,
}

/// [`BatchSummary`] as returned to clients, with download paths and totals
/// recomputed from the per-file records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestResults {
    #[serde(flatten)]
    pub summary: BatchSummary,
    pub status: String,
    pub pdf_path: String,
    pub csv_path: String,
    /// Bytes, summed from `size_results`.
    pub original_size: f64,
    /// Bytes, summed from `size_results`.
    pub compressed_size: f64,
    pub image_count: usize,
}

impl LatestResults {
    pub fn from_summary(summary: BatchSummary) -> Self {
        let original_size = summary
            .size_results
            .iter()
            .map(|r| r.original_size_kb)
            .sum::<f64>()
            * 1024.0;
        let compressed_size = summary
            .size_results
            .iter()
            .map(|r| r.reduced_size_kb)
            .sum::<f64>()
            * 1024.0;
        let image_count = summary.image_extraction.total_images;
        Self {
            summary,
            status: "success".to_string(),
            pdf_path: "/download/reduced_pdfs.zip".to_string(),
            csv_path: "/download/image_metadata.csv".to_string(),
            original_size,
            compressed_size,
            image_count,
        }
    }
}

/// State of the image metadata table plus the live job fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataStatus {
    pub exists: bool,
    pub status: String,
    pub is_processing: bool,
    pub progress: u8,
    pub current_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_kb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_res_count: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(name: &str, size: u64) -> UploadedFile {
        UploadedFile {
            name: name.to_string(),
            storage_path: PathBuf::from("uploads").join(name),
            size_bytes: size,
        }
    }

    #[test]
    fn high_res_boundary() {
        let p = Path::new("x.png");
        assert!(ImageRecord::new("a.pdf", 1, "x.png", p, (1200, 10), 1200).is_high_res);
        assert!(!ImageRecord::new("a.pdf", 1, "x.png", p, (1199, 10), 1200).is_high_res);
        assert_eq!(
            ImageRecord::new("a.pdf", 1, "x.png", p, (1600, 900), 1200).resolution_label,
            "1600x900"
        );
    }

    #[test]
    fn failed_record_reports_original_size() {
        let r = SizeReductionRecord::failed(&upload("a.pdf", 20_480));
        assert_eq!(r.status, ReductionStatus::Failed);
        assert_eq!(r.reduced_size_kb, r.original_size_kb);
        assert_eq!(r.reduction_percent, 0.0);
        assert_eq!(r.reduced_path, "-");
        assert_eq!(r.original_resolution, "Unknown");
    }

    #[test]
    fn reduced_record_percent() {
        let r = SizeReductionRecord::reduced(
            &upload("a.pdf", 10_240),
            Path::new("results/reduced_pdfs/reduced_a.pdf"),
            2_560,
            "612x792".into(),
            "306x396".into(),
        );
        assert_eq!(r.original_size_kb, 10.0);
        assert_eq!(r.reduced_size_kb, 2.5);
        assert_eq!(r.reduction_percent, 75.0);
    }

    #[test]
    fn not_processed_status_serialises_with_label() {
        let json = serde_json::to_string(&ReductionStatus::NotProcessed).unwrap();
        assert_eq!(json, "\"Not Processed (Not a PDF)\"");
        assert!(!upload("notes.txt", 1).is_pdf());
        assert!(upload("REPORT.PDF", 1).is_pdf());
    }
}
