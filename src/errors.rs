//! Error types for the OCR pipeline.
//!
//! Page-level errors never escape a page. Only [`PipelineError`] reaches the
//! caller of [`crate::pipeline::Pipeline::process`], and only for problems that
//! prevent us from producing a structured result at all.

use thiserror::Error;

/// Errors returned to the caller instead of a document result.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The request was malformed. No work was scheduled.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request was cancelled before it finished.
    #[error("request was cancelled")]
    Cancelled,

    /// The page worker pool has been shut down.
    #[error("page worker pool is shut down")]
    PoolClosed,

    /// We could not set up per-request resources.
    #[error("could not create document session: {0}")]
    Session(#[source] std::io::Error),
}

/// The document could not be turned into pages at all.
#[derive(Debug, Error)]
pub enum RasterizationError {
    #[error("unsupported content: {0}")]
    Unsupported(String),

    #[error("document has no pages")]
    NoPages,

    #[error("could not decode document: {0}")]
    Decode(String),

    #[error("document session was released")]
    SessionReleased,

    #[error("rasterizer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One recognition attempt for one page and one language failed.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("recognition engine failed: {0}")]
    Engine(String),

    #[error("could not prepare page image: {0}")]
    Image(String),

    #[error("recognition I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a page ended up FAILED.
#[derive(Debug, Error)]
pub enum PageError {
    /// Every requested language failed.
    #[error("{0}")]
    Recognition(String),

    /// The page did not finish within the per-page timeout.
    #[error("timeout")]
    Timeout,

    /// The owning session was released while the page was pending.
    #[error("cancelled")]
    Cancelled,

    /// The worker task died.
    #[error("worker panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_displays_as_bare_marker() {
        assert_eq!(PageError::Timeout.to_string(), "timeout");
    }
}
