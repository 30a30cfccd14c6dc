//! Rasterizer adapters: turn an uploaded document into page images.

use crate::{
    async_utils::blocking::spawn_blocking_propagating_panics,
    cpu_limit::CpuLimit,
    errors::RasterizationError,
    model::{ContentKind, PageImage, SUPPORTED_IMAGE_TYPES},
    prelude::*,
    session::DocumentSession,
};

mod multipage_tiff;
mod pdf;

/// TIFF MIME type, handled separately due to multipage complexity.
const TIFF_MIME_TYPE: &str = "image/tiff";

/// Interface for splitting a document into pages.
///
/// Must return the same pages, in the same order, every time it is called
/// with the same input. Any intermediate files belong in
/// [`DocumentSession::scratch_dir`].
#[async_trait]
pub trait Rasterizer: Send + Sync + 'static {
    async fn rasterize(
        &self,
        content: &[u8],
        content_kind: ContentKind,
        session: &DocumentSession,
    ) -> Result<Vec<PageImage>, RasterizationError>;
}

/// Rasterizer using Poppler's CLI tools for PDFs, and the `tiff` crate for
/// multipage TIFFs. Other images are passed through unchanged.
#[derive(Clone, Debug)]
pub struct PopplerRasterizer {
    /// Resolution used when rendering PDF pages.
    dpi: u32,

    /// Attach each PDF page's embedded text, so it can skip OCR.
    read_text_layer: bool,

    /// Limits concurrent Poppler processes.
    cpu_limit: CpuLimit,
}

impl PopplerRasterizer {
    pub fn new(dpi: u32, cpu_limit: CpuLimit) -> Self {
        Self {
            dpi,
            read_text_layer: true,
            cpu_limit,
        }
    }

    /// Should PDF pages carry their embedded text? On by default.
    pub fn with_text_layer(mut self, read_text_layer: bool) -> Self {
        self.read_text_layer = read_text_layer;
        self
    }
}

#[async_trait]
impl Rasterizer for PopplerRasterizer {
    #[instrument(level = "debug", skip_all, fields(session = %session.id(), kind = ?content_kind))]
    async fn rasterize(
        &self,
        content: &[u8],
        content_kind: ContentKind,
        session: &DocumentSession,
    ) -> Result<Vec<PageImage>, RasterizationError> {
        let mime_type = infer::get(content)
            .map(|kind| kind.mime_type())
            .ok_or_else(|| RasterizationError::Unsupported("unknown content type".to_owned()))?;

        let pages = match content_kind {
            ContentKind::Pdf if mime_type == "application/pdf" => {
                let scratch = session
                    .scratch_dir()
                    .ok_or(RasterizationError::SessionReleased)?;
                pdf::rasterize_pdf(
                    content,
                    &scratch,
                    self.dpi,
                    self.read_text_layer,
                    &self.cpu_limit,
                )
                .await?
            }
            ContentKind::Image if mime_type == TIFF_MIME_TYPE => {
                let content = content.to_vec();
                spawn_blocking_propagating_panics(move || {
                    multipage_tiff::split_tiff(&content)
                })
                .await?
            }
            ContentKind::Image if SUPPORTED_IMAGE_TYPES.contains(&mime_type) => {
                vec![PageImage::new(mime_type, content.to_vec())]
            }
            _ => {
                return Err(RasterizationError::Unsupported(format!(
                    "declared {:?} but content looks like {}",
                    content_kind, mime_type
                )));
            }
        };

        if pages.is_empty() {
            return Err(RasterizationError::NoPages);
        }
        debug!(page_count = pages.len(), "Rasterized document");
        Ok(pages)
    }
}
