//! RunVault Store - document store boundary
//!
//! The ingestion pipeline talks to its volatile and permanent stores only
//! through [`DocumentStore`]. Two backends are provided:
//!
//! - [`MemoryStore`]: in-process, for tests and dry runs
//! - [`DiskStore`]: persistent, backed by redb
//!
//! Documents are JSON objects. Every collection preserves insertion order,
//! and every stored document carries a store-assigned `_id`.

mod disk;
mod docset;
pub mod error;
mod memory;
pub mod query;
mod tables;

pub use disk::DiskStore;
pub use error::{StoreError, StoreResult, WriteFailure};
pub use memory::MemoryStore;
pub use query::{
    encoded_len, get_path, without_id, BulkWriteResult, Condition, Filter, Update, UpdateOne,
    UpdateResult, ID_FIELD,
};

use runvault_common::{Doc, StreamClass};
use std::fmt;

/// Collections a run is stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    /// One header record per run
    Header,
    /// Event pages
    Event,
    /// Datum pages
    Datum,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Header, Collection::Event, Collection::Datum];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Event => "event",
            Self::Datum => "datum",
        }
    }
}

impl From<StreamClass> for Collection {
    fn from(class: StreamClass) -> Self {
        match class {
            StreamClass::Event => Self::Event,
            StreamClass::Datum => Self::Datum,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Document store primitives used by the ingestion pipeline.
///
/// Writes are acknowledged when the call returns.
pub trait DocumentStore: Send + Sync {
    /// Insert a document, assigning `_id` if absent. Returns the `_id`.
    fn insert_one(&self, collection: Collection, doc: Doc) -> StoreResult<String>;

    /// Update the first matching document, or create one when `op.upsert`
    /// is set and nothing matches.
    fn update_one(&self, collection: Collection, op: &UpdateOne) -> StoreResult<UpdateResult>;

    /// Apply a batch of updates. Unordered batches apply every operation
    /// that can be applied; any failure is reported as
    /// [`StoreError::BulkWrite`] after the rest of the batch is written.
    fn bulk_write(
        &self,
        collection: Collection,
        ops: &[UpdateOne],
        ordered: bool,
    ) -> StoreResult<BulkWriteResult>;

    /// Matching documents in insertion order.
    fn find(&self, collection: Collection, filter: &Filter) -> StoreResult<Vec<Doc>>;

    fn find_one(&self, collection: Collection, filter: &Filter) -> StoreResult<Option<Doc>> {
        Ok(self.find(collection, filter)?.into_iter().next())
    }

    fn count(&self, collection: Collection, filter: &Filter) -> StoreResult<u64> {
        Ok(self.find(collection, filter)?.len() as u64)
    }

    /// Delete matching documents, returning how many were removed.
    fn delete_many(&self, collection: Collection, filter: &Filter) -> StoreResult<u64>;

    /// Remove every document in the collection.
    fn drop_collection(&self, collection: Collection) -> StoreResult<()>;
}
