//! PDF uploads: each page is rendered to PNG and extracted as its own document.
//!
//! Rendering uses PDFium behind the `pdf` feature. The library is loaded per
//! call because the upstream `Pdfium` handle is `!Send`; the OS caches the
//! `dlopen`, so repeat loads are cheap.

/// Rendering DPI for engine input.
pub const RENDER_DPI: u32 = 200;

/// Longest side of a rendered page, in pixels.
const MAX_RENDER_PX: u32 = 4096;

/// PDF points per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// Pixel size for a page at `dpi`, both sides clamped to `[1, MAX_RENDER_PX]`
/// with the aspect ratio kept.
#[cfg_attr(not(feature = "pdf"), allow(dead_code))]
fn compute_render_dimensions(width_points: f32, height_points: f32, dpi: u32) -> (u32, u32) {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let raw_w = (width_points * scale).max(1.0);
    let raw_h = (height_points * scale).max(1.0);

    let longest = raw_w.max(raw_h);
    if longest > MAX_RENDER_PX as f32 {
        let ratio = MAX_RENDER_PX as f32 / longest;
        let w = ((raw_w * ratio) as u32).clamp(1, MAX_RENDER_PX);
        let h = ((raw_h * ratio) as u32).clamp(1, MAX_RENDER_PX);
        (w, h)
    } else {
        (raw_w as u32, raw_h as u32)
    }
}

#[cfg(feature = "pdf")]
pub use pdfium::PdfiumRenderer;

#[cfg(feature = "pdf")]
mod pdfium {
    use std::io::Cursor;

    use image::ImageOutputFormat;
    use pdfium_render::prelude::*;
    use tracing::{debug, warn};

    use super::{compute_render_dimensions, MAX_RENDER_PX};
    use crate::pipeline::extraction::types::PdfPageRenderer;
    use crate::pipeline::extraction::ExtractionError;

    pub struct PdfiumRenderer;

    impl PdfiumRenderer {
        /// Fails when the PDFium library cannot be found.
        ///
        /// Looked up through `PDFIUM_DYNAMIC_LIB_PATH`, then next to the
        /// running executable, then the system library path.
        pub fn new() -> Result<Self, ExtractionError> {
            let _ = load_pdfium()?;
            Ok(Self)
        }
    }

    fn load_pdfium() -> Result<Pdfium, ExtractionError> {
        if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
            debug!(path = %path, "Loading PDFium from env var");
            let bindings = Pdfium::bind_to_library(&path).map_err(|e| ExtractionError::PdfRendering {
                page: 0,
                reason: format!("Failed to load PDFium from {path}: {e}"),
            })?;
            return Ok(Pdfium::new(bindings));
        }

        if let Some(dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(|d| d.to_path_buf())) {
            let lib_path = Pdfium::pdfium_platform_library_name_at_path(dir.to_string_lossy().as_ref());
            if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
                debug!(dir = %dir.display(), "Loaded PDFium next to executable");
                return Ok(Pdfium::new(bindings));
            }
        }

        let bindings = Pdfium::bind_to_system_library().map_err(|e| ExtractionError::PdfRendering {
            page: 0,
            reason: format!("PDFium library not found. Set PDFIUM_DYNAMIC_LIB_PATH or install PDFium: {e}"),
        })?;
        Ok(Pdfium::new(bindings))
    }

    fn map_load_error(e: PdfiumError) -> ExtractionError {
        let msg = e.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("password") || lower.contains("encrypt") {
            ExtractionError::PdfEncrypted
        } else {
            ExtractionError::PdfRendering {
                page: 0,
                reason: format!("Failed to load PDF: {msg}"),
            }
        }
    }

    impl PdfPageRenderer for PdfiumRenderer {
        fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, ExtractionError> {
            let pdfium = load_pdfium()?;
            let document = pdfium
                .load_pdf_from_byte_slice(pdf_bytes, None)
                .map_err(map_load_error)?;
            Ok(document.pages().len() as usize)
        }

        fn render_page(&self, pdf_bytes: &[u8], page_number: usize, dpi: u32) -> Result<Vec<u8>, ExtractionError> {
            let pdfium = load_pdfium()?;
            let document = pdfium
                .load_pdf_from_byte_slice(pdf_bytes, None)
                .map_err(map_load_error)?;
            let pages = document.pages();

            let index = u16::try_from(page_number).map_err(|_| ExtractionError::PdfRendering {
                page: page_number,
                reason: "page index exceeds u16".into(),
            })?;
            let page = pages.get(index).map_err(|_| ExtractionError::PdfRendering {
                page: page_number,
                reason: format!("out of range (document has {} pages)", pages.len()),
            })?;

            let (width, height) = compute_render_dimensions(page.width().value, page.height().value, dpi);
            if width == MAX_RENDER_PX || height == MAX_RENDER_PX {
                warn!(page = page_number, width, height, "Page render capped to {MAX_RENDER_PX}px");
            }

            let config = PdfRenderConfig::new()
                .set_target_width(width as i32)
                .set_maximum_height(height as i32);
            let bitmap = page.render_with_config(&config).map_err(|e| ExtractionError::PdfRendering {
                page: page_number,
                reason: format!("Rendering failed: {e}"),
            })?;

            let mut cursor = Cursor::new(Vec::new());
            bitmap
                .as_image()
                .write_to(&mut cursor, ImageOutputFormat::Png)
                .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
            let png = cursor.into_inner();

            debug!(page = page_number, width, height, png_size = png.len(), "Rendered PDF page");
            Ok(png)
        }
    }
}
