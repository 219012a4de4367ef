//! Durable batch artifacts: the two CSV tables, the archive of reduced
//! documents and the JSON summary.
//!
//! Every artifact is a snapshot. Tables and the summary are written to a
//! sibling temp file and renamed over the previous one, so a reader sees
//! either the old or the new artifact, never a half-written one, and a rerun
//! replaces rows instead of appending to them.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::output::{
    kib, round1, timestamp_now, BatchSummary, ImageExtractionSummary, ImageRecord,
    ReductionStatus, SizeReductionRecord,
};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Paths of the persisted artifacts, as recorded in the summary.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub image_table: PathBuf,
    pub size_table: PathBuf,
    pub archive: PathBuf,
}

impl From<&PipelineConfig> for ArtifactPaths {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            image_table: config.image_table_path(),
            size_table: config.size_table_path(),
            archive: config.archive_path(),
        }
    }
}

/// Replace the image metadata table at `path`.
pub fn write_image_table(path: &Path, records: &[ImageRecord]) -> Result<(), PipelineError> {
    write_table(path, &ImageRecord::COLUMNS, records)?;
    info!("Image table written: {} ({} rows)", path.display(), records.len());
    Ok(())
}

/// Replace the size-reduction table at `path`.
pub fn write_size_table(path: &Path, records: &[SizeReductionRecord]) -> Result<(), PipelineError> {
    write_table(path, &SizeReductionRecord::COLUMNS, records)?;
    info!("Size table written: {} ({} rows)", path.display(), records.len());
    Ok(())
}

fn write_table<T: Serialize>(
    path: &Path,
    columns: &[&str],
    rows: &[T],
) -> Result<(), PipelineError> {
    let table_err = |source| PipelineError::Table {
        path: path.to_path_buf(),
        source,
    };

    atomic_write(path, |file| {
        // The header is written by hand so an empty table still has one.
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(columns).map_err(table_err)?;
        for row in rows {
            writer.serialize(row).map_err(table_err)?;
        }
        writer
            .flush()
            .map_err(PipelineError::io(path.to_path_buf()))?;
        Ok(())
    })
}

/// Write through a temp file in the target folder, then rename over `path`.
pub(crate) fn atomic_write(
    path: &Path,
    fill: impl FnOnce(&mut NamedTempFile) -> Result<(), PipelineError>,
) -> Result<(), PipelineError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(PipelineError::io(parent))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(PipelineError::io(parent))?;
    fill(&mut tmp)?;
    tmp.as_file()
        .sync_all()
        .map_err(PipelineError::io(path.to_path_buf()))?;
    tmp.persist(path)
        .map_err(|e| PipelineError::io(path.to_path_buf())(e.error))?;
    Ok(())
}

/// Zip every regular file currently in `dir` into `zip_path`.
///
/// Entries are stored flat, in name order. Returns the entry names.
pub fn package_reduced(dir: &Path, zip_path: &Path) -> Result<Vec<String>, PipelineError> {
    let mut entries: Vec<(String, PathBuf)> = Vec::new();
    if dir.is_dir() {
        for entry in fs::read_dir(dir).map_err(PipelineError::io(dir))? {
            let entry = entry.map_err(PipelineError::io(dir))?;
            let path = entry.path();
            if path.is_file() {
                entries.push((entry.file_name().to_string_lossy().into_owned(), path));
            }
        }
    }
    entries.sort();

    let archive_err = |source| PipelineError::Archive {
        path: zip_path.to_path_buf(),
        source,
    };

    atomic_write(zip_path, |file| {
        let mut zip = ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, path) in &entries {
            zip.start_file(name.as_str(), options).map_err(archive_err)?;
            let mut src = File::open(path).map_err(PipelineError::io(path))?;
            io::copy(&mut src, &mut zip).map_err(PipelineError::io(path))?;
            debug!("Archived {}", name);
        }
        zip.finish().map_err(archive_err)?;
        Ok(())
    })?;

    info!(
        "Archive written: {} ({} files)",
        zip_path.display(),
        entries.len()
    );
    Ok(entries.into_iter().map(|(name, _)| name).collect())
}

impl BatchSummary {
    /// Aggregate the per-file and per-image records of one job.
    pub fn from_records(
        size_results: Vec<SizeReductionRecord>,
        image_records: &[ImageRecord],
        artifacts: &ArtifactPaths,
        preview_len: usize,
    ) -> Self {
        let count = |status| size_results.iter().filter(|r| r.status == status).count();
        let original_bytes: u64 = size_results.iter().map(|r| r.original_bytes).sum();
        let reduced_bytes: u64 = size_results.iter().map(|r| r.reduced_bytes).sum();
        let percent_saved = if original_bytes == 0 {
            0
        } else {
            (100.0 * (original_bytes as f64 - reduced_bytes as f64) / original_bytes as f64)
                .round() as i64
        };
        let image_table = artifacts.image_table.to_string_lossy().into_owned();

        Self {
            total_files: size_results.len(),
            reduced_count: count(ReductionStatus::Reduced),
            failed_count: count(ReductionStatus::Failed),
            not_processed_count: count(ReductionStatus::NotProcessed),
            total_original_size_kb: kib(original_bytes),
            total_reduced_size_kb: kib(reduced_bytes),
            percent_saved,
            image_extraction: ImageExtractionSummary {
                total_images: image_records.len(),
                high_res_images: image_records.iter().filter(|r| r.is_high_res).count(),
                metadata_csv: image_table.clone(),
            },
            size_results,
            image_metadata: image_records.iter().take(preview_len).cloned().collect(),
            meta_size_csv_path: artifacts.size_table.to_string_lossy().into_owned(),
            meta_image_csv_path: image_table,
            archive_path: artifacts.archive.to_string_lossy().into_owned(),
            timestamp: timestamp_now(),
        }
    }
}

/// Replace the summary at `path`.
pub fn write_summary(path: &Path, summary: &BatchSummary) -> Result<(), PipelineError> {
    atomic_write(path, |file| {
        serde_json::to_writer_pretty(&mut *file, summary).map_err(|source| {
            PipelineError::Summary {
                path: path.to_path_buf(),
                source,
            }
        })?;
        file.write_all(b"\n")
            .map_err(PipelineError::io(path.to_path_buf()))
    })?;
    info!("Summary written: {}", path.display());
    Ok(())
}

/// The last written summary, or `None` if no job has finished yet.
pub fn read_latest(path: &Path) -> Result<Option<BatchSummary>, PipelineError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PipelineError::io(path)(e)),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| PipelineError::Summary {
            path: path.to_path_buf(),
            source,
        })
}

/// Row statistics of an image table on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTableStats {
    pub size_bytes: u64,
    pub size_kb: f64,
    pub modified: Option<String>,
    pub rows: usize,
    pub high_res_rows: usize,
}

/// Read the image table at `path`; `None` if it does not exist.
pub fn read_image_table_stats(path: &Path) -> Result<Option<ImageTableStats>, PipelineError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PipelineError::io(path)(e)),
    };

    let table_err = |source| PipelineError::Table {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(table_err)?;
    let mut rows = 0;
    let mut high_res_rows = 0;
    for record in reader.deserialize::<ImageRecord>() {
        let record = record.map_err(table_err)?;
        rows += 1;
        if record.is_high_res {
            high_res_rows += 1;
        }
    }

    let modified = meta.modified().ok().map(|t| {
        chrono::DateTime::<chrono::Local>::from(t)
            .format(crate::output::TIMESTAMP_FORMAT)
            .to_string()
    });

    Ok(Some(ImageTableStats {
        size_bytes: meta.len(),
        size_kb: round1(meta.len() as f64 / 1024.0),
        modified,
        rows,
        high_res_rows,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::UploadedFile;
    use std::io::Read;

    fn image(name: &str, width: u32) -> ImageRecord {
        ImageRecord::new("a.pdf", 1, name, Path::new(name), (width, 100), 1200)
    }

    fn upload(name: &str, size: u64) -> UploadedFile {
        UploadedFile {
            name: name.into(),
            storage_path: PathBuf::from("uploads").join(name),
            size_bytes: size,
        }
    }

    fn artifacts(root: &Path) -> ArtifactPaths {
        ArtifactPaths {
            image_table: root.join("image_metadata.csv"),
            size_table: root.join("file_size_metadata.csv"),
            archive: root.join("reduced_pdfs.zip"),
        }
    }

    #[test]
    fn empty_table_still_has_header() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("image_metadata.csv");
        write_image_table(&path, &[]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text.trim_end(),
            "pdf_file,page,image_name,image_path,width,height,resolution,is_high_res"
        );
    }

    #[test]
    fn rewrite_replaces_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("image_metadata.csv");
        write_image_table(&path, &[image("x.png", 1300), image("y.png", 10)]).unwrap();
        write_image_table(&path, &[image("z.png", 1300)]).unwrap();

        let stats = read_image_table_stats(&path).unwrap().unwrap();
        assert_eq!(stats.rows, 1);
        assert_eq!(stats.high_res_rows, 1);
    }

    #[test]
    fn size_table_status_labels() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("file_size_metadata.csv");
        write_size_table(&path, &[SizeReductionRecord::not_processed(&upload("b.txt", 10))])
            .unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("Not Processed (Not a PDF)"), "got: {text}");
        assert!(text.starts_with("file_name,original_path,reduced_path"));
    }

    #[test]
    fn archive_contains_current_files_only() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("reduced_pdfs");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("reduced_b.pdf"), b"bbb").unwrap();
        fs::write(dir.join("reduced_a.pdf"), b"aaa").unwrap();

        let zip_path = tmp.path().join("reduced_pdfs.zip");
        let names = package_reduced(&dir, &zip_path).unwrap();
        assert_eq!(names, ["reduced_a.pdf", "reduced_b.pdf"]);

        let mut archive = zip::ZipArchive::new(File::open(&zip_path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut body = String::new();
        archive
            .by_name("reduced_b.pdf")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "bbb");
    }

    #[test]
    fn summary_counts_and_savings() {
        let tmp = tempfile::tempdir().unwrap();
        let reduced = SizeReductionRecord::reduced(
            &upload("a.pdf", 10_240),
            Path::new("reduced_a.pdf"),
            2_048,
            "612x792".into(),
            "306x396".into(),
        );
        let failed = SizeReductionRecord::failed(&upload("c.pdf", 10_240));
        let skipped = SizeReductionRecord::not_processed(&upload("b.txt", 0));
        let images: Vec<_> = (0..12).map(|i| image(&format!("{i}.png"), 1100 + i * 20)).collect();

        let summary = BatchSummary::from_records(
            vec![reduced, failed, skipped],
            &images,
            &artifacts(tmp.path()),
            10,
        );
        assert_eq!(summary.total_files, 3);
        assert_eq!(summary.reduced_count, 1);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.not_processed_count, 1);
        // 20 KiB in, 12 KiB out
        assert_eq!(summary.percent_saved, 40);
        assert_eq!(summary.image_extraction.total_images, 12);
        assert_eq!(summary.image_extraction.high_res_images, 7);
        assert_eq!(summary.image_metadata.len(), 10);

        let path = tmp.path().join("latest_results.json");
        write_summary(&path, &summary).unwrap();
        assert_eq!(read_latest(&path).unwrap().unwrap().percent_saved, 40);
    }

    #[test]
    fn no_summary_yet() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_latest(&tmp.path().join("latest_results.json"))
            .unwrap()
            .is_none());
        assert!(read_image_table_stats(&tmp.path().join("image_metadata.csv"))
            .unwrap()
            .is_none());
    }
}
