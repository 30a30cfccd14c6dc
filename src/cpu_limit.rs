//! Tools for limiting the number of concurrent CPU-bound external processes.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// A limit on the number of external processes that are each trying to use
/// 100% of a CPU core, such as `pdftocairo`.
///
/// Cloning shares the same underlying permits.
#[derive(Clone, Debug)]
pub struct CpuLimit {
    semaphore: Arc<Semaphore>,
}

impl CpuLimit {
    /// Allow up to `permits` processes at once.
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    /// One permit per CPU.
    pub fn per_cpu() -> Self {
        Self::new(num_cpus::get())
    }

    /// Call an async function while holding a permit.
    #[instrument(level = "trace", skip_all)]
    pub async fn run<Func, Fut, R>(&self, f: Func) -> Result<R>
    where
        Func: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let permit = self
            .semaphore
            .acquire()
            .await
            .context("Could not acquire CPU permit")?;
        let result = f().await;
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;

    use super::*;

    #[tokio::test]
    async fn never_exceeds_permits() -> Result<()> {
        let limit = CpuLimit::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks = (0..8).map(|_| {
            let limit = limit.clone();
            let running = running.clone();
            let peak = peak.clone();
            async move {
                limit
                    .run(|| async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }
        });
        for result in join_all(tasks).await {
            result?;
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        Ok(())
    }
}
