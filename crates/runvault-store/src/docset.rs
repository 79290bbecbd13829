//! Ordered document set shared by the store backends
//!
//! Both backends keep each collection as documents keyed by a monotonically
//! increasing sequence number, so iteration order is insertion order.

use crate::error::{StoreResult, WriteFailure};
use crate::query::{
    check_size, ensure_id, plan_update, BulkWriteResult, Filter, UpdateOne, UpdateResult,
};
use runvault_common::Doc;
use std::collections::BTreeSet;

#[derive(Debug, Default, Clone)]
pub(crate) struct DocSet {
    docs: Vec<(u64, Doc)>,
    next_key: u64,
}

/// Outcome of a bulk write against a `DocSet`
pub(crate) struct BulkOutcome {
    pub result: BulkWriteResult,
    pub failures: Vec<WriteFailure>,
    /// Keys whose documents were replaced or inserted
    pub touched: BTreeSet<u64>,
}

impl DocSet {
    /// Build from entries already in key order.
    pub fn from_entries(docs: Vec<(u64, Doc)>) -> Self {
        let next_key = docs.last().map_or(0, |(key, _)| key + 1);
        Self { docs, next_key }
    }

    pub fn get(&self, key: u64) -> Option<&Doc> {
        self.docs
            .binary_search_by_key(&key, |(k, _)| *k)
            .ok()
            .map(|idx| &self.docs[idx].1)
    }

    pub fn insert(&mut self, mut doc: Doc) -> StoreResult<(u64, String)> {
        let id = ensure_id(&mut doc);
        check_size(&doc)?;
        let key = self.push(doc);
        Ok((key, id))
    }

    pub fn update(&mut self, op: &UpdateOne) -> StoreResult<(UpdateResult, Option<u64>)> {
        let planned = plan_update(self.docs.iter().map(|(k, d)| (*k, d)), op)?;
        let Some((key, doc, result)) = planned else {
            return Ok((UpdateResult::default(), None));
        };
        let key = match key {
            Some(key) => {
                if let Ok(idx) = self.docs.binary_search_by_key(&key, |(k, _)| *k) {
                    self.docs[idx].1 = doc;
                }
                key
            }
            None => self.push(doc),
        };
        Ok((result, Some(key)))
    }

    /// Apply every operation. Unordered writes keep going after a failure;
    /// ordered writes stop at the first one.
    pub fn bulk(&mut self, ops: &[UpdateOne], ordered: bool) -> BulkOutcome {
        let mut outcome = BulkOutcome {
            result: BulkWriteResult::default(),
            failures: Vec::new(),
            touched: BTreeSet::new(),
        };
        for (index, op) in ops.iter().enumerate() {
            match self.update(op) {
                Ok((result, touched)) => {
                    outcome.result.record(&result);
                    outcome.touched.extend(touched);
                }
                Err(e) => {
                    outcome.failures.push(WriteFailure {
                        index,
                        message: e.to_string(),
                    });
                    if ordered {
                        break;
                    }
                }
            }
        }
        outcome
    }

    pub fn find(&self, filter: &Filter) -> Vec<Doc> {
        self.docs
            .iter()
            .filter(|(_, doc)| filter.matches(doc))
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    pub fn count(&self, filter: &Filter) -> u64 {
        self.docs.iter().filter(|(_, doc)| filter.matches(doc)).count() as u64
    }

    /// Remove matching documents, returning their keys.
    pub fn delete(&mut self, filter: &Filter) -> Vec<u64> {
        let mut removed = Vec::new();
        self.docs.retain(|(key, doc)| {
            if filter.matches(doc) {
                removed.push(*key);
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn clear(&mut self) {
        self.docs.clear();
    }

    fn push(&mut self, doc: Doc) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        self.docs.push((key, doc));
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Update;
    use serde_json::json;

    #[test]
    fn test_bulk_unordered_continues_after_failure() {
        let mut set = DocSet::default();
        set.insert(json!({"k": "a", "v": "text"}).as_object().cloned().unwrap())
            .unwrap();

        let ops = vec![
            UpdateOne::new(Filter::new().eq("k", "a"), Update::new().inc("v", 1)),
            UpdateOne::upsert(Filter::new().eq("k", "b"), Update::new().inc("v", 1)),
        ];
        let outcome = set.clone().bulk(&ops, true);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.result.upserted, 0);

        let outcome = set.bulk(&ops, false);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 0);
        assert_eq!(outcome.result.upserted, 1);
        assert_eq!(set.count(&Filter::new()), 2);
    }

    #[test]
    fn test_keys_follow_insertion_order() {
        let mut set = DocSet::from_entries(vec![(7, Doc::new())]);
        let (key, _) = set.insert(Doc::new()).unwrap();
        assert_eq!(key, 8);
        assert!(set.get(7).is_some());
        assert_eq!(set.delete(&Filter::new()), vec![7, 8]);
    }
}
