//! Recognition adapters: turn one page image into text, for one language.

use crate::{errors::RecognitionError, language::Language, model::PageImage, prelude::*};

pub mod tesseract;

/// Text recognized on a page.
#[derive(Clone, Debug, PartialEq)]
pub struct Recognition {
    pub text: String,

    /// Between 0.0 and 1.0.
    pub confidence: f32,
}

/// Interface to a recognition engine.
///
/// Implementations must not keep state between calls, because many pages are
/// recognized concurrently through the same instance.
#[async_trait]
pub trait Recognizer: Send + Sync + 'static {
    /// Recognize the text on `image`, assuming it is written in `language`.
    async fn recognize(
        &self,
        image: &PageImage,
        language: Language,
    ) -> Result<Recognition, RecognitionError>;
}
