use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pageview_core::{DocumentBackend, DocumentProvider, PageSize};

#[cfg(feature = "pdf")]
use anyhow::Context;
#[cfg(feature = "pdf")]
use pdfium_render::prelude::*;
#[cfg(feature = "pdf")]
use tracing::instrument;

/// A document whose intrinsic page sizes were captured up front. The viewer
/// core never asks the renderer for anything else, so once the sizes are
/// known the underlying decoder can be released.
pub struct PresizedDocument {
    sizes: Vec<PageSize>,
}

impl PresizedDocument {
    pub fn new(sizes: Vec<PageSize>) -> Self {
        Self { sizes }
    }
}

impl DocumentBackend for PresizedDocument {
    fn page_count(&self) -> usize {
        self.sizes.len()
    }

    fn page_size(&self, page_number: usize) -> Result<PageSize> {
        page_number
            .checked_sub(1)
            .and_then(|index| self.sizes.get(index))
            .copied()
            .ok_or_else(|| anyhow!("page {} out of range", page_number))
    }
}

/// Provider producing documents of identical blank pages. Lets the viewer be
/// exercised end to end without a PDF decoder installed.
pub struct SyntheticProvider {
    page_count: usize,
    page_size: PageSize,
}

impl SyntheticProvider {
    pub fn new(page_count: usize, page_size: PageSize) -> Self {
        Self {
            page_count,
            page_size,
        }
    }

    /// US Letter at 72dpi, the same intrinsic size most PDF pages report.
    pub fn letter(page_count: usize) -> Self {
        Self::new(
            page_count,
            PageSize {
                width: 612.0,
                height: 792.0,
            },
        )
    }
}

#[async_trait]
impl DocumentProvider for SyntheticProvider {
    async fn open(&self, _source: &str) -> Result<Arc<dyn DocumentBackend>> {
        Ok(Arc::new(PresizedDocument::new(vec![
            self.page_size;
            self.page_count
        ])))
    }
}

#[cfg(feature = "pdf")]
pub struct PdfiumProvider {
    pdfium: Arc<Pdfium>,
}

#[cfg(feature = "pdf")]
impl PdfiumProvider {
    pub fn new() -> Result<Self> {
        let pdfium = bind_pdfium()?;
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[cfg(feature = "pdf")]
#[async_trait]
impl DocumentProvider for PdfiumProvider {
    #[instrument(skip(self))]
    async fn open(&self, source: &str) -> Result<Arc<dyn DocumentBackend>> {
        let path = std::path::Path::new(source)
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", source))?;
        let document = self
            .pdfium
            .load_pdf_from_file(&path, None)
            .with_context(|| format!("failed to open {:?}", path))?;

        let mut sizes = Vec::with_capacity(document.pages().len() as usize);
        for page in document.pages().iter() {
            sizes.push(PageSize {
                width: f64::from(page.width().value),
                height: f64::from(page.height().value),
            });
        }

        Ok(Arc::new(PresizedDocument::new(sizes)))
    }
}

#[cfg(feature = "pdf")]
fn bind_pdfium() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "no usable pdfium library found; install one next to the binary or system-wide ({})",
                errors.join(", ")
            ))
        }
    }
}
