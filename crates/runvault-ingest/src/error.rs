//! Ingestion error types

use runvault_store::StoreError;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Ingestion pipeline error
#[derive(Error, Debug)]
pub enum IngestError {
    /// The pipeline was called in a way it does not support
    #[error("Usage error: {0}")]
    Usage(String),

    /// Configuration or document error
    #[error(transparent)]
    Common(#[from] runvault_common::Error),

    /// Document store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A background worker failed; every later call reports the same failure
    #[error("{worker} worker failed: {source}")]
    Worker {
        worker: &'static str,
        source: Arc<IngestError>,
    },

    /// Run data did not survive the move between stores
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// No header exists for the run
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// A background thread panicked
    #[error("{0} worker panicked")]
    WorkerPanicked(&'static str),

    /// Failed to start a background thread
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A single document is larger than the page buffer
    #[error("Document of {size} bytes can never fit a page buffer of {max} bytes")]
    DocumentTooLarge { size: usize, max: usize },
}

impl IngestError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Check if this error came from a background worker
    #[must_use]
    pub fn is_worker(&self) -> bool {
        matches!(self, Self::Worker { .. })
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

/// First error raised by any background thread. Later errors are dropped.
#[derive(Debug, Default)]
pub struct StickyError {
    first: OnceLock<(&'static str, Arc<IngestError>)>,
}

impl StickyError {
    /// Record a failure and return the error now reported for the pipeline.
    pub fn record(&self, worker: &'static str, err: IngestError) -> IngestError {
        let (worker, source) = self.first.get_or_init(|| (worker, Arc::new(err)));
        IngestError::Worker {
            worker: *worker,
            source: Arc::clone(source),
        }
    }

    pub fn check(&self) -> IngestResult<()> {
        match self.first.get() {
            Some((worker, source)) => Err(IngestError::Worker {
                worker: *worker,
                source: Arc::clone(source),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sticky_error_first_wins() {
        let sticky = StickyError::default();
        assert!(sticky.check().is_ok());

        let err = sticky.record("event", IngestError::usage("first"));
        assert!(err.is_worker());
        sticky.record("datum", IngestError::usage("second"));

        let err = sticky.check().unwrap_err();
        assert_eq!(err.to_string(), "event worker failed: Usage error: first");
    }
}
