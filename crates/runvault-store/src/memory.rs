//! In-memory document store

use crate::docset::DocSet;
use crate::error::{StoreError, StoreResult};
use crate::query::{BulkWriteResult, Filter, UpdateOne, UpdateResult};
use crate::{Collection, DocumentStore};
use parking_lot::RwLock;
use runvault_common::Doc;
use std::collections::HashMap;

/// Document store held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<Collection, DocSet>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of documents across all collections
    pub fn len(&self) -> usize {
        self.collections
            .read()
            .values()
            .map(|set| set.count(&Filter::new()) as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryStore {
    fn insert_one(&self, collection: Collection, doc: Doc) -> StoreResult<String> {
        let mut collections = self.collections.write();
        let (_, id) = collections.entry(collection).or_default().insert(doc)?;
        Ok(id)
    }

    fn update_one(&self, collection: Collection, op: &UpdateOne) -> StoreResult<UpdateResult> {
        let mut collections = self.collections.write();
        let (result, _) = collections.entry(collection).or_default().update(op)?;
        Ok(result)
    }

    fn bulk_write(
        &self,
        collection: Collection,
        ops: &[UpdateOne],
        ordered: bool,
    ) -> StoreResult<BulkWriteResult> {
        let mut collections = self.collections.write();
        let outcome = collections.entry(collection).or_default().bulk(ops, ordered);
        if outcome.failures.is_empty() {
            Ok(outcome.result)
        } else {
            Err(StoreError::BulkWrite {
                failures: outcome.failures,
                total: ops.len(),
            })
        }
    }

    fn find(&self, collection: Collection, filter: &Filter) -> StoreResult<Vec<Doc>> {
        Ok(self
            .collections
            .read()
            .get(&collection)
            .map(|set| set.find(filter))
            .unwrap_or_default())
    }

    fn count(&self, collection: Collection, filter: &Filter) -> StoreResult<u64> {
        Ok(self
            .collections
            .read()
            .get(&collection)
            .map_or(0, |set| set.count(filter)))
    }

    fn delete_many(&self, collection: Collection, filter: &Filter) -> StoreResult<u64> {
        let mut collections = self.collections.write();
        Ok(collections
            .get_mut(&collection)
            .map_or(0, |set| set.delete(filter).len() as u64))
    }

    fn drop_collection(&self, collection: Collection) -> StoreResult<()> {
        if let Some(set) = self.collections.write().get_mut(&collection) {
            set.clear();
        }
        Ok(())
    }
}
