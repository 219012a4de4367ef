//! Compression: rebuild a document from downscaled JPEG page rasters.
//!
//! ## Why rasterise?
//!
//! Submissions are a mix of scanned sketches, exported CAD sheets and
//! photo-heavy boards. Rasterising every page at a fixed DPI and shrinking it
//! gives a predictable size cap whatever the page contains; vector fidelity
//! is not needed for grading.
//!
//! Each page becomes one JPEG image XObject (`DCTDecode`, so the encoded bytes
//! go into the file as-is) drawn over the full MediaBox. The page size in
//! points is `pixels * 72 / dpi`, so a page downscaled by 2 shows up at half
//! its original dimensions.
//!
//! The output is built in memory and written only after every page
//! succeeded; a failed or cancelled file never leaves a partial document.

use crate::error::FileError;
use crate::pipeline::decode::{DecodedDocument, DocumentDecoder, PageSize};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Raster settings for the compression stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSettings {
    pub dpi: u32,
    pub downscale_factor: u32,
    pub jpeg_quality: u8,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            dpi: 100,
            downscale_factor: 2,
            jpeg_quality: 75,
        }
    }
}

/// What one successful compression produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionOutcome {
    pub pages: usize,
    /// First page of the input, in points.
    pub original_size: PageSize,
    /// First page of the output, in points.
    pub reduced_size: PageSize,
    /// Size of the written file.
    pub output_bytes: u64,
}

/// Rasterise, downscale and re-encode every page of `input` into `output`.
///
/// `on_page(pages_done, total_pages)` is called after each page.
pub fn compress_document(
    decoder: &dyn DocumentDecoder,
    input: &Path,
    output: &Path,
    file_name: &str,
    settings: CompressionSettings,
    on_page: &mut dyn FnMut(usize, usize),
    cancel: &CancellationToken,
) -> Result<CompressionOutcome, FileError> {
    let built = decoder
        .with_document(input, |doc| build_reduced(doc, file_name, settings, on_page, cancel))
        .map_err(|e| FileError::Decode {
            file: file_name.to_string(),
            detail: e.to_string(),
        })??;

    if cancel.is_cancelled() {
        return Err(FileError::Cancelled {
            file: file_name.to_string(),
        });
    }

    let write_err = |detail: String| FileError::Write {
        file: file_name.to_string(),
        path: output.display().to_string(),
        detail,
    };
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
    }
    std::fs::write(output, &built.bytes).map_err(|e| write_err(e.to_string()))?;

    info!(
        "{}: {} pages re-encoded, {} → {} bytes",
        file_name,
        built.pages,
        std::fs::metadata(input).map(|m| m.len()).unwrap_or(0),
        built.bytes.len()
    );

    Ok(CompressionOutcome {
        pages: built.pages,
        original_size: built.original_size,
        reduced_size: built.reduced_size,
        output_bytes: built.bytes.len() as u64,
    })
}

struct BuiltDocument {
    pages: usize,
    original_size: PageSize,
    reduced_size: PageSize,
    bytes: Vec<u8>,
}

fn build_reduced(
    doc: &dyn DecodedDocument,
    file: &str,
    settings: CompressionSettings,
    on_page: &mut dyn FnMut(usize, usize),
    cancel: &CancellationToken,
) -> Result<BuiltDocument, FileError> {
    let total = doc.page_count();
    if total == 0 {
        return Err(FileError::Decode {
            file: file.to_string(),
            detail: "document has no pages".to_string(),
        });
    }

    let original_size = doc.page_size(0).map_err(|e| FileError::Decode {
        file: file.to_string(),
        detail: e.to_string(),
    })?;

    let mut builder = ImagePdfBuilder::new();
    let mut reduced_size = None;

    for index in 0..total {
        if cancel.is_cancelled() {
            return Err(FileError::Cancelled {
                file: file.to_string(),
            });
        }
        let page = index + 1;

        let raster = doc
            .rasterize(index, settings.dpi)
            .map_err(|e| FileError::Render {
                file: file.to_string(),
                page,
                detail: e.to_string(),
            })?;
        let small = downscale(&raster, settings.downscale_factor);
        let jpeg = encode_jpeg(&small, settings.jpeg_quality).map_err(|detail| FileError::Encode {
            file: file.to_string(),
            page,
            detail,
        })?;

        let size = builder.add_page(small.width(), small.height(), settings.dpi, jpeg);
        reduced_size.get_or_insert(size);
        debug!(
            "{}: page {} {}x{} px → {}x{} px",
            file,
            page,
            raster.width(),
            raster.height(),
            small.width(),
            small.height()
        );

        on_page(page, total);
    }

    let bytes = builder.finish().map_err(|detail| FileError::Encode {
        file: file.to_string(),
        page: total,
        detail,
    })?;

    Ok(BuiltDocument {
        pages: total,
        original_size,
        reduced_size: reduced_size.unwrap_or(original_size),
        bytes,
    })
}

/// Shrink both sides by `factor` with a Lanczos filter. Never below 1 px.
pub fn downscale(image: &DynamicImage, factor: u32) -> DynamicImage {
    let factor = factor.max(1);
    if factor == 1 {
        return image.clone();
    }
    let w = (image.width() / factor).max(1);
    let h = (image.height() / factor).max(1);
    image.resize_exact(w, h, FilterType::Lanczos3)
}

/// Baseline JPEG of `image` (alpha dropped).
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, String> {
    let rgb = image.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(&rgb)
        .map_err(|e| e.to_string())?;
    Ok(buf)
}

/// Builds a PDF whose pages are single full-page JPEG images.
struct ImagePdfBuilder {
    doc: Document,
    pages_id: ObjectId,
    kids: Vec<Object>,
}

impl ImagePdfBuilder {
    fn new() -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            kids: Vec::new(),
        }
    }

    /// Append one page and return its size in points.
    fn add_page(&mut self, width_px: u32, height_px: u32, dpi: u32, jpeg: Vec<u8>) -> PageSize {
        let size = PageSize {
            width: width_px as f32 * 72.0 / dpi as f32,
            height: height_px as f32 * 72.0 / dpi as f32,
        };

        let image_id = self.doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width_px as i64,
                "Height" => height_px as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            jpeg,
        ));

        let content = format!(
            "q\n{:.3} 0 0 {:.3} 0 0 cm\n/Im1 Do\nQ\n",
            size.width, size.height
        );
        let content_id = self
            .doc
            .add_object(Stream::new(dictionary! {}, content.into_bytes()));

        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![0.into(), 0.into(), Object::Real(size.width), Object::Real(size.height)],
            "Resources" => dictionary! {
                "XObject" => dictionary! {
                    "Im1" => image_id,
                },
            },
            "Contents" => content_id,
        });
        self.kids.push(page_id.into());
        size
    }

    fn finish(mut self) -> Result<Vec<u8>, String> {
        let count = self.kids.len() as i64;
        self.doc.objects.insert(
            self.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => self.kids,
                "Count" => count,
            }),
        );
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);

        let mut buffer = Vec::new();
        self.doc.save_to(&mut buffer).map_err(|e| e.to_string())?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::pipeline::decode::RawImage;
    use image::{Rgb, RgbImage};

    /// Letter-sized pages; page `fail_at` (0-based) refuses to render.
    struct Letter {
        pages: usize,
        fail_at: Option<usize>,
    }

    impl DecodedDocument for Letter {
        fn page_count(&self) -> usize {
            self.pages
        }
        fn page_size(&self, _index: usize) -> Result<PageSize, DecodeError> {
            Ok(PageSize {
                width: 612.0,
                height: 792.0,
            })
        }
        fn embedded_images(&self, _index: usize) -> Result<Vec<RawImage>, DecodeError> {
            Ok(vec![])
        }
        fn rasterize(&self, index: usize, dpi: u32) -> Result<DynamicImage, DecodeError> {
            if Some(index) == self.fail_at {
                return Err(DecodeError::Page {
                    page: index + 1,
                    detail: "render failed".into(),
                });
            }
            let w = 612 * dpi / 72;
            let h = 792 * dpi / 72;
            Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([200, 180, 160]))))
        }
    }

    struct LetterDecoder {
        pages: usize,
        fail_at: Option<usize>,
    }

    impl DocumentDecoder for LetterDecoder {
        fn open_document(
            &self,
            _path: &Path,
            visit: &mut dyn FnMut(&dyn DecodedDocument),
        ) -> Result<(), DecodeError> {
            visit(&Letter {
                pages: self.pages,
                fail_at: self.fail_at,
            });
            Ok(())
        }
    }

    #[test]
    fn writes_one_image_page_per_input_page() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("a.pdf");
        std::fs::write(&input, vec![0u8; 4096]).unwrap();
        let output = tmp.path().join("out/reduced_a.pdf");

        let mut seen = Vec::new();
        let outcome = compress_document(
            &LetterDecoder {
                pages: 2,
                fail_at: None,
            },
            &input,
            &output,
            "a.pdf",
            CompressionSettings::default(),
            &mut |done, total| seen.push((done, total)),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(seen, [(1, 2), (2, 2)]);
        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.original_size.label(), "612x792");
        assert_eq!(outcome.reduced_size.label(), "306x396");
        assert_eq!(outcome.output_bytes, std::fs::metadata(&output).unwrap().len());

        let doc = Document::load(&output).unwrap();
        assert_eq!(doc.get_pages().len(), 2);
    }

    #[test]
    fn failed_page_leaves_no_output() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("reduced_a.pdf");
        let err = compress_document(
            &LetterDecoder {
                pages: 3,
                fail_at: Some(1),
            },
            &tmp.path().join("a.pdf"),
            &output,
            "a.pdf",
            CompressionSettings::default(),
            &mut |_, _| {},
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, FileError::Render { page: 2, .. }));
        assert!(!output.exists());
    }

    #[test]
    fn cancelled_before_write() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("reduced_a.pdf");
        let cancel = CancellationToken::new();
        let err = compress_document(
            &LetterDecoder {
                pages: 1,
                fail_at: None,
            },
            &tmp.path().join("a.pdf"),
            &output,
            "a.pdf",
            CompressionSettings::default(),
            &mut |_, _| cancel.cancel(),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, FileError::Cancelled { .. }));
        assert!(!output.exists());
    }

    #[test]
    fn empty_document_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = compress_document(
            &LetterDecoder {
                pages: 0,
                fail_at: None,
            },
            &tmp.path().join("a.pdf"),
            &tmp.path().join("reduced_a.pdf"),
            "a.pdf",
            CompressionSettings::default(),
            &mut |_, _| {},
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, FileError::Decode { .. }));
    }

    #[test]
    fn downscale_never_hits_zero() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(3, 1));
        let small = downscale(&img, 4);
        assert_eq!((small.width(), small.height()), (1, 1));
    }
}
