//! Per-request resource ownership.
//!
//! A [`DocumentSession`] owns the scratch directory used while splitting a
//! document into pages, plus the cancellation signal shared by every page task
//! of the request. Releasing the session deletes the scratch directory and
//! cancels outstanding page work. Dropping a session releases it, so an
//! abandoned request future cleans up after itself.

use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::watch;
use uuid::Uuid;

use crate::{errors::PipelineError, prelude::*};

/// Resources for a single document request.
pub struct DocumentSession {
    /// Used in logs.
    id: Uuid,

    /// Scratch space for intermediate files. `None` once released.
    scratch: Mutex<Option<tempfile::TempDir>>,

    /// Set to `true` on release.
    cancel_tx: watch::Sender<bool>,

    released: AtomicBool,
}

impl DocumentSession {
    /// Create a new session with a fresh scratch directory.
    pub fn acquire() -> Result<Self, PipelineError> {
        let id = Uuid::new_v4();
        let scratch = tempfile::TempDir::with_prefix("docquery-")
            .map_err(PipelineError::Session)?;
        debug!(session = %id, dir = %scratch.path().display(), "Acquired document session");
        let (cancel_tx, _) = watch::channel(false);
        Ok(Self {
            id,
            scratch: Mutex::new(Some(scratch)),
            cancel_tx,
            released: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Path of the scratch directory, or `None` if the session was released.
    pub fn scratch_dir(&self) -> Option<PathBuf> {
        self.scratch
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(|dir| dir.path().to_owned())
    }

    /// A signal which fires when this session is released.
    pub fn cancel_signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.cancel_tx.subscribe(),
        }
    }

    /// Cancel outstanding page work and delete scratch files. Safe to call
    /// more than once; only the first call does anything.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_tx.send_replace(true);

        let scratch = self.scratch.lock().expect("lock poisoned").take();
        if let Some(scratch) = scratch {
            let path = scratch.path().to_owned();
            if let Err(err) = scratch.close() {
                error!(
                    session = %self.id,
                    directory = ?path.display(),
                    "failed to delete scratch directory: {}",
                    err
                );
            }
        }
        debug!(session = %self.id, "Released document session");
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Cooperative cancellation, handed to every page task of a session.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Has the owning session been released (or dropped)?
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once the owning session is released.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // An error means the sender is gone, which also counts.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_is_idempotent_and_removes_scratch() -> Result<()> {
        let session = DocumentSession::acquire()?;
        let dir = session.scratch_dir().context("missing scratch dir")?;
        std::fs::write(dir.join("page-1.png"), b"data")?;

        let signal = session.cancel_signal();
        assert!(!signal.is_cancelled());

        session.release();
        session.release();
        assert!(session.scratch_dir().is_none());
        assert!(!dir.exists());
        assert!(signal.is_cancelled());
        Ok(())
    }

    #[tokio::test]
    async fn dropping_a_session_cancels_its_signal() -> Result<()> {
        let session = DocumentSession::acquire()?;
        let dir = session.scratch_dir().context("missing scratch dir")?;
        let signal = session.cancel_signal();
        drop(session);
        // Must resolve immediately.
        signal.cancelled().await;
        assert!(signal.is_cancelled());
        assert!(!dir.exists());
        Ok(())
    }
}
