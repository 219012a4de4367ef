//! Image extraction: every embedded raster image of a document, saved as PNG.
//!
//! Images land in `{images_root}/{base}/{base}_p{page}_img{index}.png`, where
//! `base` is the document's file stem and `page`/`index` are 1-based. The
//! index counts every image object on the page, so an image that fails to
//! decode leaves a gap in the numbering instead of shifting its neighbours.
//!
//! ## Failure scopes
//!
//! * one image will not decode: logged, skipped
//! * one page will not list its images: logged, page skipped
//! * the document will not open: [`FileError::Decode`], zero records
//! * the cancellation token fires: partial folder removed, [`FileError::Cancelled`]

use crate::error::{DecodeError, FileError};
use crate::output::ImageRecord;
use crate::pipeline::decode::{DecodedDocument, DocumentDecoder};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inputs for one document.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub path: PathBuf,
    /// Name recorded as `pdf_file` in every record.
    pub file_name: String,
    pub images_root: PathBuf,
    pub min_width: u32,
}

impl ExtractionRequest {
    /// Folder receiving this document's images.
    pub fn output_dir(&self) -> PathBuf {
        self.images_root.join(base_name(&self.file_name))
    }
}

/// Wipe `dir` completely and recreate it empty.
pub fn prepare_output_dir(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::create_dir_all(dir)
}

/// `report.pdf` → `report`.
pub(crate) fn base_name(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| file_name.to_string())
}

/// Extract every embedded image of one document.
///
/// `on_page(pages_done, total_pages)` is called after each page, skipped
/// pages included.
pub fn extract_images(
    decoder: &dyn DocumentDecoder,
    request: &ExtractionRequest,
    on_page: &mut dyn FnMut(usize, usize),
    cancel: &CancellationToken,
) -> Result<Vec<ImageRecord>, FileError> {
    let out_dir = request.output_dir();

    let outcome = decoder.with_document(&request.path, |doc| {
        extract_from_document(doc, request, &out_dir, on_page, cancel)
    });

    let result = match outcome {
        Ok(inner) => inner,
        Err(e) => Err(FileError::Decode {
            file: request.file_name.clone(),
            detail: e.to_string(),
        }),
    };

    if matches!(result, Err(FileError::Cancelled { .. })) {
        if let Err(e) = fs::remove_dir_all(&out_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove partial image folder {}: {}", out_dir.display(), e);
            }
        }
    }
    result
}

fn extract_from_document(
    doc: &dyn DecodedDocument,
    request: &ExtractionRequest,
    out_dir: &Path,
    on_page: &mut dyn FnMut(usize, usize),
    cancel: &CancellationToken,
) -> Result<Vec<ImageRecord>, FileError> {
    let file = &request.file_name;
    let base = base_name(file);
    let total = doc.page_count();
    let mut records = Vec::new();

    fs::create_dir_all(out_dir).map_err(|e| FileError::Write {
        file: file.clone(),
        path: out_dir.display().to_string(),
        detail: e.to_string(),
    })?;

    for index in 0..total {
        if cancel.is_cancelled() {
            return Err(FileError::Cancelled { file: file.clone() });
        }
        let page = index + 1;

        match doc.embedded_images(index) {
            Ok(images) => {
                for (i, raw) in images.into_iter().enumerate() {
                    let image_index = i + 1;
                    let pixels = match raw.decode() {
                        Ok(img) => img,
                        Err(reason) => {
                            warn!(
                                "{}: page {}: couldn't open image {}: {}",
                                file, page, image_index, reason
                            );
                            continue;
                        }
                    };

                    let image_name = format!("{base}_p{page}_img{image_index}.png");
                    let image_path = out_dir.join(&image_name);
                    if let Err(e) = pixels.save_with_format(&image_path, image::ImageFormat::Png) {
                        warn!("{}: could not save {}: {}", file, image_path.display(), e);
                        continue;
                    }

                    records.push(ImageRecord::new(
                        file.as_str(),
                        page,
                        image_name,
                        &image_path,
                        (pixels.width(), pixels.height()),
                        request.min_width,
                    ));
                }
            }
            Err(e) => log_page_skip(file, page, &e),
        }

        on_page(page, total);
    }

    info!(
        "{}: {} images extracted from {} pages ({} high-res)",
        file,
        records.len(),
        total,
        records.iter().filter(|r| r.is_high_res).count()
    );
    Ok(records)
}

fn log_page_skip(file: &str, page: usize, err: &DecodeError) {
    warn!("{}: skipping page {}: {}", file, page, err);
    debug!("{}: page {} contributes no images", file, page);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::decode::{PageSize, RawImage};
    use image::{DynamicImage, RgbImage};

    struct Pages(Vec<Result<Vec<(u32, u32)>, ()>>);

    impl DecodedDocument for Pages {
        fn page_count(&self) -> usize {
            self.0.len()
        }
        fn page_size(&self, _index: usize) -> Result<PageSize, DecodeError> {
            Ok(PageSize {
                width: 612.0,
                height: 792.0,
            })
        }
        fn embedded_images(&self, index: usize) -> Result<Vec<RawImage>, DecodeError> {
            match &self.0[index] {
                Ok(dims) => Ok(dims
                    .iter()
                    .map(|&(w, h)| {
                        if w == 0 {
                            RawImage::Unreadable("broken".into())
                        } else {
                            RawImage::Pixels(DynamicImage::ImageRgb8(RgbImage::new(w, h)))
                        }
                    })
                    .collect()),
                Err(()) => Err(DecodeError::Page {
                    page: index + 1,
                    detail: "bad object stream".into(),
                }),
            }
        }
        fn rasterize(&self, _index: usize, _dpi: u32) -> Result<DynamicImage, DecodeError> {
            unreachable!()
        }
    }

    struct Fixed(Vec<Result<Vec<(u32, u32)>, ()>>);

    impl DocumentDecoder for Fixed {
        fn open_document(
            &self,
            _path: &Path,
            visit: &mut dyn FnMut(&dyn DecodedDocument),
        ) -> Result<(), DecodeError> {
            visit(&Pages(self.0.clone()));
            Ok(())
        }
    }

    struct Corrupt;

    impl DocumentDecoder for Corrupt {
        fn open_document(
            &self,
            path: &Path,
            _visit: &mut dyn FnMut(&dyn DecodedDocument),
        ) -> Result<(), DecodeError> {
            Err(DecodeError::Open {
                path: path.to_path_buf(),
                detail: "not a PDF".into(),
            })
        }
    }

    fn request(root: &Path) -> ExtractionRequest {
        ExtractionRequest {
            path: root.join("uploads/a.pdf"),
            file_name: "a.pdf".into(),
            images_root: root.join("Extracted_images"),
            min_width: 1200,
        }
    }

    #[test]
    fn names_and_skips() {
        let tmp = tempfile::tempdir().unwrap();
        let decoder = Fixed(vec![
            Ok(vec![(1200, 10), (0, 0), (1199, 10)]),
            Err(()),
            Ok(vec![(1600, 900)]),
        ]);
        let mut pages = Vec::new();
        let records = extract_images(
            &decoder,
            &request(tmp.path()),
            &mut |done, total| pages.push((done, total)),
            &CancellationToken::new(),
        )
        .unwrap();

        let names: Vec<_> = records.iter().map(|r| r.image_name.as_str()).collect();
        assert_eq!(names, ["a_p1_img1.png", "a_p1_img3.png", "a_p3_img1.png"]);
        assert_eq!(
            records.iter().map(|r| r.is_high_res).collect::<Vec<_>>(),
            [true, false, true]
        );
        assert_eq!(pages, [(1, 3), (2, 3), (3, 3)]);
        assert!(tmp.path().join("Extracted_images/a/a_p3_img1.png").exists());
    }

    #[test]
    fn unreadable_document_is_decode_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = extract_images(
            &Corrupt,
            &request(tmp.path()),
            &mut |_, _| {},
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, FileError::Decode { .. }));
    }

    #[test]
    fn cancellation_removes_partial_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let decoder = Fixed(vec![Ok(vec![(10, 10)]), Ok(vec![(10, 10)])]);
        let cancel = CancellationToken::new();
        let err = extract_images(
            &decoder,
            &request(tmp.path()),
            &mut |_, _| cancel.cancel(),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, FileError::Cancelled { .. }));
        assert!(!tmp.path().join("Extracted_images/a").exists());
    }

    #[test]
    fn prepare_wipes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("Extracted_images");
        fs::create_dir_all(dir.join("old")).unwrap();
        fs::write(dir.join("old/x.png"), b"stale").unwrap();
        prepare_output_dir(&dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn base_name_strips_extension() {
        assert_eq!(base_name("report.final.pdf"), "report.final");
        assert_eq!(base_name("notes"), "notes");
    }
}
