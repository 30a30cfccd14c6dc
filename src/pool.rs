//! A bounded pool of page workers.
//!
//! Recognition is CPU and memory hungry, so we limit how many pages may be
//! recognized at once across _all_ in-flight documents. The limit is a
//! [`Semaphore`] owned by one [`PagePool`], which is shared by reference with
//! every pipeline. Submitting a page waits for a free slot, which is where our
//! backpressure comes from.
//!
//! Each page then runs in its own Tokio task. A panic, timeout or cancellation
//! in one task turns into a FAILED [`PageResult`] for that page alone, and the
//! slot is returned as soon as the task ends.

use std::{any::Any, sync::Arc, time::Duration};

use tokio::{sync::Semaphore, task::JoinHandle, time};

use crate::{
    errors::{PageError, PipelineError},
    model::{Page, PageResult, PageStatus},
    prelude::*,
    session::CancelSignal,
};

/// Process-wide page worker pool.
pub struct PagePool {
    /// One permit per concurrently running page.
    permits: Arc<Semaphore>,

    max_concurrent_pages: usize,

    per_page_timeout: Duration,
}

impl PagePool {
    /// Create a new pool.
    pub fn new(max_concurrent_pages: usize, per_page_timeout: Duration) -> Result<Self> {
        if max_concurrent_pages == 0 {
            return Err(anyhow!("max_concurrent_pages must be greater than 0"));
        }
        if per_page_timeout.is_zero() {
            return Err(anyhow!("per_page_timeout must be greater than 0"));
        }
        debug!(
            max_concurrent_pages,
            per_page_timeout = ?per_page_timeout,
            "Created page worker pool"
        );
        Ok(Self {
            permits: Arc::new(Semaphore::new(max_concurrent_pages)),
            max_concurrent_pages,
            per_page_timeout,
        })
    }

    pub fn max_concurrent_pages(&self) -> usize {
        self.max_concurrent_pages
    }

    pub fn per_page_timeout(&self) -> Duration {
        self.per_page_timeout
    }

    /// How many pages are running right now?
    pub fn in_flight(&self) -> usize {
        self.max_concurrent_pages - self.permits.available_permits()
    }

    /// Refuse any further submissions. Pages already running are unaffected.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Wait for a free slot, then run `work` on `page` in its own task.
    ///
    /// The returned [`PageHandle`] always resolves to a [`PageResult`] for
    /// this page, even if `work` panics, times out or is cancelled.
    pub async fn submit<F, Fut>(
        &self,
        mut page: Page,
        cancel: CancelSignal,
        work: F,
    ) -> Result<PageHandle, PipelineError>
    where
        F: FnOnce(Page) -> Fut + Send + 'static,
        Fut: Future<Output = PageResult> + Send + 'static,
    {
        let index = page.index;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| PipelineError::PoolClosed)?
            }
        };

        let timeout = self.per_page_timeout;
        let handle = tokio::spawn(async move {
            // Held until this task ends, whatever happens to `work`.
            let _permit = permit;
            page.status = PageStatus::Running;
            trace!(page = index, "Page running");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PageError::Cancelled),
                result = time::timeout(timeout, work(page)) => {
                    result.map_err(|_| PageError::Timeout)
                }
            };
            match outcome {
                Ok(result) => result,
                Err(err) => {
                    warn!(page = index, "Page failed: {}", err);
                    PageResult::failed(index, err.to_string(), vec![])
                }
            }
        });
        Ok(PageHandle { index, handle })
    }
}

/// A page that has been handed to the pool.
pub struct PageHandle {
    index: usize,
    handle: JoinHandle<PageResult>,
}

impl PageHandle {
    /// Wait for the page to finish.
    pub async fn join(self) -> PageResult {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => {
                let err = if err.is_panic() {
                    PageError::Panicked(panic_message(err.into_panic()))
                } else {
                    PageError::Cancelled
                };
                error!(page = self.index, "Page worker died: {}", err);
                PageResult::failed(self.index, err.to_string(), vec![])
            }
        }
    }
}

/// Get a printable message out of a panic payload.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
