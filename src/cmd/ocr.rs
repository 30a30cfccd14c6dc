//! The `ocr` subcommand.

use std::sync::Arc;

use clap::Args;
use futures::{StreamExt as _, stream};
use schemars::JsonSchema;
use tokio::sync::watch;

use crate::{
    async_utils::io::write_jsonl,
    config::PipelineOpts,
    errors::PipelineError,
    language::{Language, LanguageList},
    model::{ContentKind, DocumentRequest, DocumentResult, DocumentStatus},
    pipeline::Pipeline,
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// PDF or image files to OCR.
    #[clap(required = true, value_name = "FILES")]
    pub input_paths: Vec<PathBuf>,

    /// Languages to try, in order. Later languages are only used when earlier
    /// ones produce low-confidence text.
    #[clap(short = 'l', long, value_delimiter = ',', default_value = "eng")]
    pub languages: Vec<Language>,

    /// Output file. Defaults to stdout.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Max number of documents to process at a time. Pages from all of them
    /// share the same `--max-concurrent-pages` limit.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,

    /// Separate pages in `text` with form feeds instead of blank lines.
    #[clap(long)]
    pub page_breaks: bool,

    #[clap(flatten)]
    pub pipeline: PipelineOpts,
}

/// One output line per input document.
#[derive(Debug, Serialize, JsonSchema)]
pub struct OcrOutput {
    /// The input file.
    pub path: PathBuf,

    /// Per-page results, if the document could be submitted at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DocumentResult>,

    /// Why the document could not be submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Text of all pages, in order. Pages we couldn't read are replaced by a
    /// marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl OcrOutput {
    fn rejected(path: PathBuf, error: impl ToString) -> Self {
        Self {
            path,
            result: None,
            error: Some(error.to_string()),
            text: None,
        }
    }
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    if opts.job_count == 0 {
        return Err(anyhow!("--jobs must be greater than 0"));
    }
    let pipeline = Arc::new(Pipeline::from_opts(&opts.pipeline).await?);

    // A bad language list would fail every document, so fail once, up front.
    LanguageList::validate(&opts.languages, pipeline.installed_languages())?;

    // Ctrl-C cancels every document still in flight.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let signal_pipeline = pipeline.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight documents");
            signal_pipeline.shutdown();
            cancel_tx.send_replace(true);
        }
    });

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing files",
            done_msg: "OCRed files",
        },
        opts.input_paths.len() as u64,
    );

    let languages = opts.languages.clone();
    let page_breaks = opts.page_breaks;
    let documents = stream::iter(opts.input_paths.clone()).map(move |path| {
        let pipeline = pipeline.clone();
        let languages = languages.clone();
        let mut cancel_rx = cancel_rx.clone();
        async move {
            let cancelled = async move {
                // An error means the signal task is gone, which also means
                // nobody can cancel us.
                if cancel_rx.wait_for(|cancelled| *cancelled).await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            ocr_file(&pipeline, path, languages, page_breaks, cancelled).await
        }
    });
    let output = pb.wrap_stream(documents.buffered(opts.job_count)).boxed();
    write_jsonl(opts.output_path.as_deref(), output).await
}

/// OCR a single file.
///
/// Problems with this one document are reported in the output record. Only
/// cancellation is returned as an error, because it stops the whole run.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
async fn ocr_file(
    pipeline: &Pipeline,
    path: PathBuf,
    languages: Vec<Language>,
    page_breaks: bool,
    cancelled: impl Future<Output = ()>,
) -> Result<OcrOutput> {
    let content = match tokio::fs::read(&path).await {
        Ok(content) => content,
        Err(err) => {
            warn!("Could not read input: {}", err);
            return Ok(OcrOutput::rejected(path, format!("could not read file: {err}")));
        }
    };
    let content_kind = match ContentKind::detect(&content) {
        Ok(content_kind) => content_kind,
        Err(err) => {
            warn!("Rejected input: {}", err);
            return Ok(OcrOutput::rejected(path, err));
        }
    };

    let request = DocumentRequest {
        content,
        content_kind,
        languages,
    };
    match pipeline.process_until(request, cancelled).await {
        Ok(result) => {
            if result.overall_status != DocumentStatus::Complete {
                warn!(status = ?result.overall_status, "Document was not fully OCRed");
            }
            let text = result.joined_text(page_breaks);
            Ok(OcrOutput {
                path,
                result: Some(result),
                error: None,
                text: Some(text),
            })
        }
        Err(err @ (PipelineError::Cancelled | PipelineError::PoolClosed)) => {
            Err(anyhow::Error::new(err).context(format!("stopped while OCRing {}", path.display())))
        }
        Err(err) => Ok(OcrOutput::rejected(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        errors::{RasterizationError, RecognitionError},
        language::InstalledLanguages,
        model::PageImage,
        pool::PagePool,
        rasterize::Rasterizer,
        recognize::{Recognition, Recognizer},
        session::DocumentSession,
    };

    struct OnePageRasterizer;

    #[async_trait]
    impl Rasterizer for OnePageRasterizer {
        async fn rasterize(
            &self,
            _content: &[u8],
            _content_kind: ContentKind,
            _session: &DocumentSession,
        ) -> Result<Vec<PageImage>, RasterizationError> {
            Ok(vec![PageImage::new("image/png", vec![])])
        }
    }

    struct EchoRecognizer;

    #[async_trait]
    impl Recognizer for EchoRecognizer {
        async fn recognize(
            &self,
            _image: &PageImage,
            language: Language,
        ) -> Result<Recognition, RecognitionError> {
            Ok(Recognition {
                text: format!("hello in {language}"),
                confidence: 0.95,
            })
        }
    }

    fn pipeline() -> Result<Pipeline> {
        Ok(Pipeline::new(
            Arc::new(OnePageRasterizer),
            Arc::new(EchoRecognizer),
            Arc::new(PagePool::new(2, Duration::from_secs(5))?),
            InstalledLanguages::new([Language::English]),
            0.6,
        ))
    }

    /// Smallest PNG header `infer` will recognize.
    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[tokio::test]
    async fn ocr_file_reports_text() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ocr-cmd-test")?;
        let path = dir.path().join("scan.png");
        std::fs::write(&path, PNG_MAGIC)?;

        let output = ocr_file(
            &pipeline()?,
            path.clone(),
            vec![Language::English],
            false,
            std::future::pending(),
        )
        .await?;
        assert_eq!(output.path, path);
        assert_eq!(output.text.as_deref(), Some("hello in eng"));
        assert_eq!(
            output.result.map(|r| r.overall_status),
            Some(DocumentStatus::Complete)
        );
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_and_unsupported_files_become_error_records() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ocr-cmd-test")?;
        let text_path = dir.path().join("notes.txt");
        std::fs::write(&text_path, "just some text")?;
        let pipeline = pipeline()?;

        for path in [dir.path().join("missing.pdf"), text_path] {
            let output = ocr_file(
                &pipeline,
                path,
                vec![Language::English],
                false,
                std::future::pending(),
            )
            .await?;
            assert!(output.result.is_none());
            assert!(output.error.is_some());
        }
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ocr-cmd-test")?;
        let path = dir.path().join("scan.png");
        std::fs::write(&path, PNG_MAGIC)?;

        let result = ocr_file(
            &pipeline()?,
            path,
            vec![Language::English],
            false,
            std::future::ready(()),
        )
        .await;
        assert!(result.is_err());
        Ok(())
    }
}
