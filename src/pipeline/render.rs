//! PDF rasterisation: render every page of a PDF to PNG files.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which is CPU-bound and not
//! async-aware. [`rasterize_document`] runs the [`Rasterizer`] on tokio's
//! blocking pool, and only while holding a permit of the run's CPU semaphore,
//! so at most `render_workers` documents render at once.
//!
//! ## Why cap pixels as well as DPI?
//!
//! Handbook scans range from A5 leaflets to A3 fold-outs. DPI controls
//! legibility; `max_rendered_pixels` caps the longest edge so a fold-out does
//! not produce a 7,000 px image that the vision API will downscale anyway.

use crate::error::RenderError;
use crate::pipeline::input;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Turns one PDF into ordered page image files.
pub trait Rasterizer: Send + Sync {
    /// Render every page of `pdf` into `out_dir`, returning the image paths in
    /// page order. Blocking; called from `spawn_blocking`.
    fn rasterize(
        &self,
        pdf: &Path,
        dpi: u32,
        max_pixels: u32,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, RenderError>;
}

/// File name of the image for a 0-based page index.
pub fn page_file_name(index: usize) -> String {
    format!("page-{:04}.png", index + 1)
}

/// Render a document on the blocking pool under the CPU semaphore.
///
/// The `%PDF` magic bytes are checked first so a mislabelled file never
/// reaches the engine.
pub async fn rasterize_document(
    rasterizer: Arc<dyn Rasterizer>,
    cpu: &Semaphore,
    pdf: &Path,
    dpi: u32,
    max_pixels: u32,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, RenderError> {
    input::check_pdf_magic(pdf)?;

    let _cpu = cpu
        .acquire()
        .await
        .map_err(|e| RenderError::Engine(format!("CPU pool closed: {e}")))?;

    let path = pdf.to_path_buf();
    let pdf = path.clone();
    let out_dir = out_dir.to_path_buf();
    // A panic while rendering is a property of this file, not of the engine.
    tokio::task::spawn_blocking(move || rasterizer.rasterize(&pdf, dpi, max_pixels, &out_dir))
        .await
        .map_err(|e| RenderError::Corrupt {
            path,
            detail: format!("renderer panicked: {e}"),
        })?
}

/// [`Rasterizer`] backed by pdfium.
///
/// Holds the one bound [`Pdfium`] instance for the whole run. Dropping a
/// `Pdfium` tears down the library's global state, so render workers must
/// share a single instance rather than bind per document. The `sync`
/// feature of pdfium-render makes it `Send + Sync` and serialises calls
/// into the engine.
#[derive(Debug)]
pub struct PdfiumRasterizer {
    pdfium: Pdfium,
}

impl PdfiumRasterizer {
    /// Bind pdfium (downloaded and cached by `pdfium-auto`).
    pub fn new() -> Result<Self, RenderError> {
        let pdfium =
            pdfium_auto::bind_pdfium_silent().map_err(|e| RenderError::Engine(e.to_string()))?;
        Ok(Self { pdfium })
    }
}

impl Rasterizer for PdfiumRasterizer {
    fn rasterize(
        &self,
        pdf: &Path,
        dpi: u32,
        max_pixels: u32,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, RenderError> {
        let document = self.pdfium.load_pdf_from_file(pdf, None).map_err(|e| {
            let err_str = format!("{:?}", e);
            if err_str.contains("Password") || err_str.contains("password") {
                RenderError::PasswordRequired {
                    path: pdf.to_path_buf(),
                }
            } else {
                RenderError::Corrupt {
                    path: pdf.to_path_buf(),
                    detail: err_str,
                }
            }
        })?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        if total_pages == 0 {
            return Err(RenderError::Corrupt {
                path: pdf.to_path_buf(),
                detail: "document has no pages".into(),
            });
        }
        info!("PDF loaded: {} ({} pages)", pdf.display(), total_pages);

        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(dpi as f32 / 72.0)
            .set_maximum_width(max_pixels as i32)
            .set_maximum_height(max_pixels as i32);

        let mut paths = Vec::with_capacity(total_pages);
        for idx in 0..total_pages {
            let page = pages.get(idx as u16).map_err(|e| RenderError::Page {
                page: idx + 1,
                detail: format!("{:?}", e),
            })?;

            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| RenderError::Page {
                    page: idx + 1,
                    detail: format!("{:?}", e),
                })?;

            let rendered = bitmap.as_image();
            let path = out_dir.join(page_file_name(idx));
            rendered
                .save_with_format(&path, image::ImageFormat::Png)
                .map_err(|e| RenderError::Page {
                    page: idx + 1,
                    detail: format!("failed to save image: {e}"),
                })?;
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                rendered.width(),
                rendered.height()
            );
            paths.push(path);
        }

        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Rasterizer for Counting {
        fn rasterize(
            &self,
            _pdf: &Path,
            _dpi: u32,
            _max_pixels: u32,
            out_dir: &Path,
        ) -> Result<Vec<PathBuf>, RenderError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![out_dir.join(page_file_name(0))])
        }
    }

    #[test]
    fn page_files_sort_in_page_order() {
        let mut names: Vec<String> = [10, 2, 0].iter().map(|&i| page_file_name(i)).collect();
        names.sort();
        assert_eq!(names, ["page-0001.png", "page-0003.png", "page-0011.png"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cpu_semaphore_bounds_parallel_renders() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("a.pdf");
        std::fs::write(&pdf, b"%PDF-1.7\n").unwrap();

        let rasterizer = Arc::new(Counting {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let cpu = Arc::new(Semaphore::new(2));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let r: Arc<dyn Rasterizer> = rasterizer.clone();
            let cpu = Arc::clone(&cpu);
            let pdf = pdf.clone();
            let out = dir.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                rasterize_document(r, &cpu, &pdf, 150, 2000, &out).await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().len(), 1);
        }
        assert!(rasterizer.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn non_pdf_is_rejected_before_rendering() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake.pdf");
        std::fs::write(&fake, b"<html>").unwrap();
        let rasterizer: Arc<dyn Rasterizer> = Arc::new(Counting {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let cpu = Semaphore::new(1);
        let err = rasterize_document(rasterizer, &cpu, &fake, 150, 2000, dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_a_pdf");
    }

    struct Panicking;

    impl Rasterizer for Panicking {
        fn rasterize(&self, _: &Path, _: u32, _: u32, _: &Path) -> Result<Vec<PathBuf>, RenderError> {
            panic!("malformed xref table");
        }
    }

    #[tokio::test]
    async fn renderer_panic_is_a_per_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("broken.pdf");
        std::fs::write(&pdf, b"%PDF-1.4\n").unwrap();
        let cpu = Semaphore::new(1);
        let err = rasterize_document(Arc::new(Panicking), &cpu, &pdf, 150, 2000, dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "corrupt");
        assert!(err.to_string().contains("broken.pdf"));
        // The semaphore permit was released despite the panic.
        assert_eq!(cpu.available_permits(), 1);
    }

    #[test]
    fn pdfium_rasterizer_is_shareable_across_workers() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PdfiumRasterizer>();
    }
}
