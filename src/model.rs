//! Requests, pages and results.

use schemars::JsonSchema;

use crate::{errors::PipelineError, language::Language, prelude::*};

/// Image types passed to the recognizer as-is.
pub const SUPPORTED_IMAGE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/gif",
    "image/bmp",
    "image/tiff",
];

/// Marker used in joined text for pages we could not read.
pub const COULD_NOT_OCR_PAGE: &str = "**COULD_NOT_OCR_PAGE**";

/// What kind of document was uploaded?
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentKind {
    Pdf,
    Image,
}

impl ContentKind {
    /// Sniff the content type from the first bytes of an upload.
    pub fn detect(content: &[u8]) -> Result<Self, PipelineError> {
        let mime_type = infer::get(content)
            .map(|kind| kind.mime_type())
            .ok_or_else(|| {
                PipelineError::InvalidRequest("could not detect content type".to_owned())
            })?;
        if mime_type == "application/pdf" {
            Ok(ContentKind::Pdf)
        } else if SUPPORTED_IMAGE_TYPES.contains(&mime_type) {
            Ok(ContentKind::Image)
        } else {
            Err(PipelineError::InvalidRequest(format!(
                "unsupported content type {} (supported: PDF, PNG, JPEG, WebP, GIF, BMP, TIFF)",
                mime_type
            )))
        }
    }
}

/// One OCR job.
#[derive(Clone, Debug)]
pub struct DocumentRequest {
    /// The uploaded bytes.
    pub content: Vec<u8>,

    /// Declared content kind.
    pub content_kind: ContentKind,

    /// Requested languages, highest priority first.
    pub languages: Vec<Language>,
}

/// Lifecycle of a page inside the pipeline.
#[derive(Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// A decoded page image.
#[derive(Debug)]
pub struct PageImage {
    /// MIME type of `data`. One of [`SUPPORTED_IMAGE_TYPES`].
    pub mime_type: String,

    /// Encoded image bytes.
    pub data: Vec<u8>,

    /// Text already embedded in the source document for this page, if any.
    pub text_layer: Option<String>,
}

impl PageImage {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
            text_layer: None,
        }
    }

    /// Attach the page's embedded text.
    pub fn with_text_layer(mut self, text: String) -> Self {
        self.text_layer = Some(text);
        self
    }

    /// The embedded text, if there is any that isn't whitespace.
    pub fn searchable_text(&self) -> Option<&str> {
        self.text_layer
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

/// One unit of recognizable content, owned by whichever worker runs it.
#[derive(Debug)]
pub struct Page {
    /// Zero-based position in the document.
    pub index: usize,

    pub image: PageImage,

    pub status: PageStatus,
}

impl Page {
    pub fn new(index: usize, image: PageImage) -> Self {
        Self {
            index,
            image,
            status: PageStatus::Pending,
        }
    }
}

/// What happened when we tried one language on one page.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct LanguageAttempt {
    pub language: Language,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The result for a single page.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct PageResult {
    /// Zero-based position in the document.
    pub index: usize,

    /// Either `DONE` or `FAILED`.
    pub status: PageStatus,

    /// Recognized text. Empty for failed pages.
    pub text: String,

    /// Confidence between 0.0 and 1.0, absent if recognition failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,

    /// The language whose result we kept. Absent for pages taken from the
    /// document's own text layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,

    /// Why the page failed. `"timeout"` for timeouts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Every language we tried, in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<LanguageAttempt>,
}

impl PageResult {
    /// A page whose embedded text was used instead of OCR.
    pub fn from_text_layer(index: usize, text: &str) -> Self {
        Self {
            index,
            status: PageStatus::Done,
            text: text.to_owned(),
            confidence: Some(1.0),
            language: None,
            error: None,
            attempts: vec![],
        }
    }

    /// A failed page.
    pub fn failed(index: usize, error: String, attempts: Vec<LanguageAttempt>) -> Self {
        Self {
            index,
            status: PageStatus::Failed,
            text: String::new(),
            confidence: None,
            language: None,
            error: Some(error),
            attempts,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == PageStatus::Done
    }
}

/// Aggregate status of a document.
#[derive(Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    /// Every page succeeded.
    Complete,
    /// Some pages succeeded, some failed.
    Partial,
    /// No page succeeded, or the document could not be rasterized.
    Failed,
}

/// The result for a whole document.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct DocumentResult {
    pub overall_status: DocumentStatus,

    /// One entry per page, in page order.
    pub pages: Vec<PageResult>,

    /// Set when the document could not be split into pages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DocumentResult {
    /// Build a result from page results that are already in page order.
    pub fn from_pages(pages: Vec<PageResult>) -> Self {
        let done = pages.iter().filter(|p| p.is_done()).count();
        let overall_status = if pages.is_empty() || done == 0 {
            DocumentStatus::Failed
        } else if done == pages.len() {
            DocumentStatus::Complete
        } else {
            DocumentStatus::Partial
        };
        Self {
            overall_status,
            pages,
            error: None,
        }
    }

    /// The document could not be rasterized.
    pub fn rasterization_failed(error: String) -> Self {
        Self {
            overall_status: DocumentStatus::Failed,
            pages: vec![],
            error: Some(error),
        }
    }

    /// All page text, in page order. Failed pages are replaced with
    /// [`COULD_NOT_OCR_PAGE`].
    pub fn joined_text(&self, include_page_breaks: bool) -> String {
        let page_break = if include_page_breaks {
            "\n\x0C\n"
        } else {
            "\n\n"
        };
        self.pages
            .iter()
            .map(|page| {
                if page.is_done() {
                    page.text.trim()
                } else {
                    COULD_NOT_OCR_PAGE
                }
            })
            .collect::<Vec<_>>()
            .join(page_break)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done(index: usize, text: &str) -> PageResult {
        PageResult {
            index,
            status: PageStatus::Done,
            text: text.to_owned(),
            confidence: Some(0.9),
            language: Some(Language::English),
            error: None,
            attempts: vec![],
        }
    }

    #[test]
    fn status_follows_page_outcomes() {
        let all_done = DocumentResult::from_pages(vec![done(0, "a"), done(1, "b")]);
        assert_eq!(all_done.overall_status, DocumentStatus::Complete);

        let partial = DocumentResult::from_pages(vec![
            done(0, "a"),
            PageResult::failed(1, "timeout".to_owned(), vec![]),
        ]);
        assert_eq!(partial.overall_status, DocumentStatus::Partial);

        let failed = DocumentResult::from_pages(vec![PageResult::failed(
            0,
            "boom".to_owned(),
            vec![],
        )]);
        assert_eq!(failed.overall_status, DocumentStatus::Failed);

        assert_eq!(
            DocumentResult::from_pages(vec![]).overall_status,
            DocumentStatus::Failed
        );
    }

    #[test]
    fn joined_text_marks_failed_pages() {
        let result = DocumentResult::from_pages(vec![
            done(0, "first\n"),
            PageResult::failed(1, "timeout".to_owned(), vec![]),
            done(2, "third"),
        ]);
        assert_eq!(
            result.joined_text(false),
            format!("first\n\n{}\n\nthird", COULD_NOT_OCR_PAGE)
        );
        assert!(result.joined_text(true).contains('\x0C'));
    }

    #[test]
    fn blank_text_layers_are_not_searchable() {
        let image = PageImage::new("image/png", vec![]);
        assert_eq!(image.searchable_text(), None);
        let image = image.with_text_layer(" \n\x0C\n".to_owned());
        assert_eq!(image.searchable_text(), None);
        let image =
            PageImage::new("image/png", vec![]).with_text_layer("  Minutes\n".to_owned());
        assert_eq!(image.searchable_text(), Some("Minutes"));
    }

    #[test]
    fn detects_pdf_and_png() {
        assert_eq!(
            ContentKind::detect(b"%PDF-1.7\n...").unwrap(),
            ContentKind::Pdf
        );
        let png_header = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(ContentKind::detect(&png_header).unwrap(), ContentKind::Image);
        assert!(ContentKind::detect(b"just some text").is_err());
    }
}
