//! Pipeline stages for batch processing of submissions.
//!
//! Each submodule implements exactly one transformation step. The stages are
//! synchronous and CPU-bound; the orchestrator runs them inside
//! `spawn_blocking` and owns the progress bookkeeping.
//!
//! ## Data Flow
//!
//! ```text
//! uploads ──▶ extract ──▶ aggregate ──▶ compress ──▶ aggregate
//!            (images)    (image CSV)   (JPEG PDF)   (size CSV, zip, JSON)
//! ```
//!
//! 1. [`decode`]    — the PDF decoder seam; pdfium in production
//! 2. [`extract`]   — pull every embedded raster image out of a document
//! 3. [`compress`]  — rasterise, downscale and re-encode every page
//! 4. [`aggregate`] — snapshot tables, archive and the batch summary

pub mod aggregate;
pub mod compress;
pub mod decode;
pub mod extract;
