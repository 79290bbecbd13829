//! Store error types

use thiserror::Error;

/// One failed operation inside a bulk write
#[derive(Debug, Clone)]
pub struct WriteFailure {
    /// Position of the operation in the submitted batch
    pub index: usize,
    pub message: String,
}

/// Error type for document store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An update operator met a field of the wrong type
    #[error("cannot apply {op} to field '{path}': {reason}")]
    TypeMismatch {
        op: &'static str,
        path: String,
        reason: String,
    },

    #[error("document of {size} bytes exceeds the {limit} byte limit")]
    DocumentTooLarge { size: usize, limit: usize },

    #[error(
        "bulk write failed for {} of {total} operations: {}",
        .failures.len(),
        first_message(.failures)
    )]
    BulkWrite {
        failures: Vec<WriteFailure>,
        total: usize,
    },
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

fn first_message(failures: &[WriteFailure]) -> String {
    failures
        .first()
        .map(|f| format!("op {}: {}", f.index, f.message))
        .unwrap_or_default()
}

pub type StoreResult<T> = Result<T, StoreError>;
