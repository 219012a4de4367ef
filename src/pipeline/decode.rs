//! PDF decoding collaborator: page count, embedded images, page rasters.
//!
//! The stages never talk to pdfium directly. They go through
//! [`DocumentDecoder`], which hands a [`DecodedDocument`] to a visitor for the
//! duration of one open document. The visitor shape keeps pdfium's borrowed
//! document (`PdfDocument<'a>` borrows its `Pdfium` binding) on the stack of
//! the blocking thread that opened it.
//!
//! [`PdfiumDecoder`] is the production implementation. Tests plug in an
//! in-memory decoder instead.
//!
//! ## Why bind per document?
//!
//! pdfium keeps thread-local state; binding inside the `spawn_blocking`
//! closure that uses it keeps every call on one thread. With the
//! `thread_safe` feature of `pdfium-render` concurrent bindings serialise
//! on an internal lock.

use crate::error::DecodeError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Page size in PDF points (1/72 inch).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    /// `"{w}x{h}"` with both sides truncated to whole points.
    pub fn label(&self) -> String {
        format!("{}x{}", self.width as i64, self.height as i64)
    }
}

/// An embedded raster image as the decoder hands it over.
#[derive(Debug, Clone)]
pub enum RawImage {
    /// The decoder already produced pixels.
    Pixels(DynamicImage),
    /// Still-encoded image bytes (PNG, JPEG, …).
    Encoded(Vec<u8>),
    /// The decoder found an image object but could not read it.
    Unreadable(String),
}

impl RawImage {
    /// Turn the image into a pixel buffer.
    pub fn decode(self) -> Result<DynamicImage, String> {
        match self {
            RawImage::Pixels(img) => Ok(img),
            RawImage::Encoded(bytes) => image::load_from_memory(&bytes).map_err(|e| e.to_string()),
            RawImage::Unreadable(reason) => Err(reason),
        }
    }
}

/// One open document. Page indices are 0-based.
pub trait DecodedDocument {
    fn page_count(&self) -> usize;

    fn page_size(&self, index: usize) -> Result<PageSize, DecodeError>;

    /// Every embedded raster image on the page, in content order.
    fn embedded_images(&self, index: usize) -> Result<Vec<RawImage>, DecodeError>;

    /// Render the page at `dpi`.
    fn rasterize(&self, index: usize, dpi: u32) -> Result<DynamicImage, DecodeError>;
}

/// Opens documents for the pipeline stages.
pub trait DocumentDecoder: Send + Sync {
    /// Open `path` and call `visit` exactly once with the open document.
    fn open_document(
        &self,
        path: &Path,
        visit: &mut dyn FnMut(&dyn DecodedDocument),
    ) -> Result<(), DecodeError>;
}

impl<'d> dyn DocumentDecoder + 'd {
    /// Open `path`, run `f` on the document and return its result.
    pub fn with_document<R>(
        &self,
        path: &Path,
        f: impl FnOnce(&dyn DecodedDocument) -> R,
    ) -> Result<R, DecodeError> {
        let mut f = Some(f);
        let mut out = None;
        self.open_document(path, &mut |doc| {
            if let Some(f) = f.take() {
                out = Some(f(doc));
            }
        })?;
        out.ok_or_else(|| DecodeError::Open {
            path: path.to_path_buf(),
            detail: "decoder did not yield the document".to_string(),
        })
    }

    /// Number of pages in `path`.
    pub fn page_count(&self, path: &Path) -> Result<usize, DecodeError> {
        self.with_document(path, |doc| doc.page_count())
    }
}

/// [`DocumentDecoder`] backed by the pdfium library.
///
/// Library resolution, first match wins:
/// 1. an explicit path ([`PdfiumDecoder::with_library`] or `PDFIUM_LIB_PATH`)
/// 2. the platform library in the working directory
/// 3. the system library search path
#[derive(Debug, Clone, Default)]
pub struct PdfiumDecoder {
    library_path: Option<PathBuf>,
}

impl PdfiumDecoder {
    /// Decoder honouring `PDFIUM_LIB_PATH` when set.
    pub fn new() -> Self {
        Self {
            library_path: std::env::var_os("PDFIUM_LIB_PATH")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Decoder bound to the library at `path`.
    pub fn with_library(path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: Some(path.into()),
        }
    }

    /// Check that a pdfium library can be bound at all.
    pub fn probe(&self) -> Result<(), DecodeError> {
        self.bind().map(|_| ())
    }

    fn bind(&self) -> Result<Pdfium, DecodeError> {
        let bindings = match &self.library_path {
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                .or_else(|_| Pdfium::bind_to_system_library()),
        }
        .map_err(|e| DecodeError::Unavailable(format!("{:?}", e)))?;
        Ok(Pdfium::new(bindings))
    }
}

impl DocumentDecoder for PdfiumDecoder {
    fn open_document(
        &self,
        path: &Path,
        visit: &mut dyn FnMut(&dyn DecodedDocument),
    ) -> Result<(), DecodeError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| DecodeError::Open {
                path: path.to_path_buf(),
                detail: format!("{:?}", e),
            })?;
        info!(
            "PDF loaded: {} ({} pages)",
            path.display(),
            document.pages().len()
        );

        visit(&PdfiumDocument { document });
        Ok(())
    }
}

struct PdfiumDocument<'a> {
    document: PdfDocument<'a>,
}

impl<'a> PdfiumDocument<'a> {
    fn page(&self, index: usize) -> Result<PdfPage<'a>, DecodeError> {
        let total = self.page_count();
        if index >= total {
            return Err(DecodeError::PageOutOfRange {
                page: index + 1,
                total,
            });
        }
        self.document
            .pages()
            .get(index as u16)
            .map_err(|e| DecodeError::Page {
                page: index + 1,
                detail: format!("{:?}", e),
            })
    }
}

impl DecodedDocument for PdfiumDocument<'_> {
    fn page_count(&self) -> usize {
        self.document.pages().len() as usize
    }

    fn page_size(&self, index: usize) -> Result<PageSize, DecodeError> {
        let page = self.page(index)?;
        Ok(PageSize {
            width: page.width().value,
            height: page.height().value,
        })
    }

    fn embedded_images(&self, index: usize) -> Result<Vec<RawImage>, DecodeError> {
        let page = self.page(index)?;
        let images: Vec<RawImage> = page
            .objects()
            .iter()
            .filter_map(|object| {
                object.as_image_object().map(|image| match image.get_raw_image() {
                    Ok(pixels) => RawImage::Pixels(pixels),
                    Err(e) => RawImage::Unreadable(format!("{:?}", e)),
                })
            })
            .collect();
        debug!("Page {}: {} embedded images", index + 1, images.len());
        Ok(images)
    }

    fn rasterize(&self, index: usize, dpi: u32) -> Result<DynamicImage, DecodeError> {
        let page = self.page(index)?;
        let render_config = PdfRenderConfig::new().scale_page_by_factor(dpi as f32 / 72.0);
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| DecodeError::Page {
                page: index + 1,
                detail: format!("{:?}", e),
            })?;
        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            index + 1,
            image.width(),
            image.height()
        );
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    struct OnePage;

    impl DecodedDocument for OnePage {
        fn page_count(&self) -> usize {
            1
        }
        fn page_size(&self, _index: usize) -> Result<PageSize, DecodeError> {
            Ok(PageSize {
                width: 612.4,
                height: 792.9,
            })
        }
        fn embedded_images(&self, _index: usize) -> Result<Vec<RawImage>, DecodeError> {
            Ok(vec![])
        }
        fn rasterize(&self, _index: usize, _dpi: u32) -> Result<DynamicImage, DecodeError> {
            Ok(DynamicImage::ImageRgb8(RgbImage::new(1, 1)))
        }
    }

    struct OnePageDecoder;

    impl DocumentDecoder for OnePageDecoder {
        fn open_document(
            &self,
            _path: &Path,
            visit: &mut dyn FnMut(&dyn DecodedDocument),
        ) -> Result<(), DecodeError> {
            visit(&OnePage);
            Ok(())
        }
    }

    #[test]
    fn with_document_returns_visitor_result() {
        let decoder: &dyn DocumentDecoder = &OnePageDecoder;
        assert_eq!(decoder.page_count(Path::new("x.pdf")).unwrap(), 1);
        let label = decoder
            .with_document(Path::new("x.pdf"), |doc| doc.page_size(0).map(|s| s.label()))
            .unwrap()
            .unwrap();
        assert_eq!(label, "612x792");
    }

    #[test]
    fn raw_image_decoding() {
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 3, Rgb([9, 9, 9])))
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let img = RawImage::Encoded(png).decode().unwrap();
        assert_eq!((img.width(), img.height()), (4, 3));

        assert!(RawImage::Encoded(vec![1, 2, 3]).decode().is_err());
        assert_eq!(
            RawImage::Unreadable("bad xref".into()).decode().unwrap_err(),
            "bad xref"
        );
    }
}
