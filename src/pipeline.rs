//! Drive one document from uploaded bytes to per-page text.
//!
//! The flow for each request is:
//!
//! 1. Validate requested languages. Bad requests are rejected before we touch
//!    the document.
//! 2. Acquire a [`DocumentSession`] and rasterize the document into pages. If
//!    this fails, the whole document fails, with no pages.
//! 3. Submit every page to the shared [`PagePool`]. Each page tries the
//!    requested languages in order until one is confident enough.
//! 4. Collect page results as they finish, and put them back in page order.
//!
//! The session is released on every path out of [`Pipeline::process`],
//! including when the caller drops the future.

use std::sync::Arc;

use futures::{StreamExt as _, stream::FuturesUnordered};

use crate::{
    config::PipelineOpts,
    cpu_limit::CpuLimit,
    errors::{PageError, PipelineError, RecognitionError},
    language::{InstalledLanguages, LanguageList},
    model::{DocumentRequest, DocumentResult, LanguageAttempt, Page, PageResult, PageStatus},
    pool::PagePool,
    prelude::*,
    rasterize::{PopplerRasterizer, Rasterizer},
    recognize::{Recognition, Recognizer, tesseract::TesseractRecognizer},
    session::DocumentSession,
};

/// The OCR pipeline. Cheap to share between concurrent requests via [`Arc`].
pub struct Pipeline {
    rasterizer: Arc<dyn Rasterizer>,
    recognizer: Arc<dyn Recognizer>,
    pool: Arc<PagePool>,
    installed: InstalledLanguages,
    confidence_threshold: f32,
}

impl Pipeline {
    /// Create a pipeline from its parts.
    pub fn new(
        rasterizer: Arc<dyn Rasterizer>,
        recognizer: Arc<dyn Recognizer>,
        pool: Arc<PagePool>,
        installed: InstalledLanguages,
        confidence_threshold: f32,
    ) -> Self {
        Self {
            rasterizer,
            recognizer,
            pool,
            installed,
            confidence_threshold,
        }
    }

    /// Create a pipeline backed by Poppler and Tesseract.
    pub async fn from_opts(opts: &PipelineOpts) -> Result<Self> {
        opts.validate()?;
        let pool = PagePool::new(opts.max_concurrent_pages(), opts.per_page_timeout())?;
        info!(
            max_concurrent_pages = pool.max_concurrent_pages(),
            per_page_timeout = ?pool.per_page_timeout(),
            "Starting OCR pipeline"
        );
        Ok(Self::new(
            Arc::new(
                PopplerRasterizer::new(opts.rasterize_dpi, CpuLimit::per_cpu())
                    .with_text_layer(!opts.ignore_text_layer),
            ),
            Arc::new(TesseractRecognizer::new(!opts.keep_color)),
            Arc::new(pool),
            opts.installed_languages().await?,
            opts.confidence_threshold,
        ))
    }

    pub fn installed_languages(&self) -> &InstalledLanguages {
        &self.installed
    }

    /// Stop accepting new pages. Documents still being processed will see
    /// [`PipelineError::PoolClosed`].
    pub fn shutdown(&self) {
        self.pool.close();
    }

    /// Run OCR on a single document.
    ///
    /// Page failures are reported inside the returned [`DocumentResult`].
    /// Only invalid requests and cancellations are returned as errors.
    pub async fn process(&self, request: DocumentRequest) -> Result<DocumentResult, PipelineError> {
        self.process_until(request, std::future::pending::<()>())
            .await
    }

    /// Like [`Pipeline::process`], but give up with
    /// [`PipelineError::Cancelled`] as soon as `cancel` resolves.
    pub async fn process_until(
        &self,
        request: DocumentRequest,
        cancel: impl Future<Output = ()>,
    ) -> Result<DocumentResult, PipelineError> {
        let languages = LanguageList::validate(&request.languages, &self.installed)?;
        let session = DocumentSession::acquire()?;
        let result = tokio::select! {
            result = self.process_in_session(&request, &languages, &session) => result,
            _ = cancel => {
                info!(session = %session.id(), "Request cancelled");
                Err(PipelineError::Cancelled)
            }
        };
        // Also happens on drop, but we don't want to wait for that.
        session.release();
        result
    }

    #[instrument(level = "debug", skip_all, fields(session = %session.id(), languages = languages.len()))]
    async fn process_in_session(
        &self,
        request: &DocumentRequest,
        languages: &LanguageList,
        session: &DocumentSession,
    ) -> Result<DocumentResult, PipelineError> {
        let images = match self
            .rasterizer
            .rasterize(&request.content, request.content_kind, session)
            .await
        {
            Ok(images) => images,
            Err(err) => {
                warn!("Could not rasterize document: {}", err);
                return Ok(DocumentResult::rasterization_failed(err.to_string()));
            }
        };
        let page_count = images.len();
        debug!(page_count, in_flight = self.pool.in_flight(), "Submitting pages");

        // Submission waits whenever the pool is full. Pages already submitted
        // keep running in their own tasks meanwhile.
        let mut handles = Vec::with_capacity(page_count);
        for (index, image) in images.into_iter().enumerate() {
            let recognizer = self.recognizer.clone();
            let languages = languages.clone();
            let threshold = self.confidence_threshold;
            let handle = self
                .pool
                .submit(
                    Page::new(index, image),
                    session.cancel_signal(),
                    move |page| recognize_page(recognizer, page, languages, threshold),
                )
                .await?;
            handles.push(handle);
        }

        // Collect in completion order, then restore page order.
        let mut slots: Vec<Option<PageResult>> = vec![None; page_count];
        let mut pending = handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<FuturesUnordered<_>>();
        while let Some(result) = pending.next().await {
            let index = result.index;
            match slots.get_mut(index) {
                Some(slot) if slot.is_none() => *slot = Some(result),
                _ => error!(page = index, "Ignoring unexpected page result"),
            }
        }

        let pages = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    PageResult::failed(index, "page result was lost".to_owned(), vec![])
                })
            })
            .collect::<Vec<_>>();
        let result = DocumentResult::from_pages(pages);
        info!(
            page_count,
            status = ?result.overall_status,
            "Processed document"
        );
        Ok(result)
    }
}

/// Recognize one page, falling back through `languages` in order.
///
/// Pages with an embedded text layer use that text as-is. Otherwise, the first
/// attempt whose confidence reaches `threshold` wins. If none does,
/// we keep the most confident successful attempt, preferring earlier languages
/// on ties. If every attempt fails, so does the page.
#[instrument(level = "debug", skip_all, fields(page = page.index))]
async fn recognize_page(
    recognizer: Arc<dyn Recognizer>,
    mut page: Page,
    languages: LanguageList,
    threshold: f32,
) -> PageResult {
    if let Some(text) = page.image.searchable_text() {
        debug!("Using embedded text layer");
        return PageResult::from_text_layer(page.index, text);
    }

    let mut attempts = Vec::with_capacity(languages.len());
    let mut best: Option<(Recognition, usize)> = None;

    for language in languages.iter() {
        let result = recognizer
            .recognize(&page.image, language)
            .await
            .and_then(|recognition| {
                if recognition.confidence.is_finite() {
                    Ok(recognition)
                } else {
                    Err(RecognitionError::Engine(format!(
                        "engine reported invalid confidence {}",
                        recognition.confidence
                    )))
                }
            });
        match result {
            Ok(recognition) => {
                let confidence = recognition.confidence.clamp(0.0, 1.0);
                debug!(%language, confidence, "Recognized page");
                attempts.push(LanguageAttempt {
                    language,
                    confidence: Some(confidence),
                    error: None,
                });
                let attempt_idx = attempts.len() - 1;
                if confidence >= threshold {
                    best = Some((recognition, attempt_idx));
                    break;
                }
                let better = best
                    .as_ref()
                    .is_none_or(|(prev, _)| confidence > prev.confidence.clamp(0.0, 1.0));
                if better {
                    best = Some((recognition, attempt_idx));
                }
            }
            Err(err) => {
                warn!(%language, "Recognition failed: {}", err);
                attempts.push(LanguageAttempt {
                    language,
                    confidence: None,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    match best {
        Some((recognition, attempt_idx)) => {
            page.status = PageStatus::Done;
            PageResult {
                index: page.index,
                status: page.status,
                text: recognition.text,
                confidence: attempts[attempt_idx].confidence,
                language: Some(attempts[attempt_idx].language),
                error: None,
                attempts,
            }
        }
        None => {
            page.status = PageStatus::Failed;
            let errors = attempts
                .iter()
                .filter_map(|attempt| {
                    attempt
                        .error
                        .as_ref()
                        .map(|err| format!("{}: {}", attempt.language, err))
                })
                .collect::<Vec<_>>();
            let err = PageError::Recognition(errors.join("; "));
            PageResult::failed(page.index, err.to_string(), attempts)
        }
    }
}
