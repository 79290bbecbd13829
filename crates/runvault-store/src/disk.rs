//! Persistent document store backed by redb.
//!
//! Every collection is one table keyed by sequence number. Each collection
//! is loaded into an in-memory `DocSet` when the store opens; queries are
//! answered from it, and a mutation writes only the keys it touched or
//! removed inside a single write transaction. A write is acknowledged once
//! that transaction commits.

use crate::docset::DocSet;
use crate::error::{StoreError, StoreResult};
use crate::query::{BulkWriteResult, Filter, UpdateOne, UpdateResult};
use crate::tables;
use crate::{Collection, DocumentStore};
use parking_lot::RwLock;
use redb::{Database, ReadableTable};
use runvault_common::Doc;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

pub struct DiskStore {
    db: Database,
    cache: RwLock<HashMap<Collection, DocSet>>,
}

impl DiskStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::HEADER)?;
            let _t = write_txn.open_table(tables::EVENT)?;
            let _t = write_txn.open_table(tables::DATUM)?;
        }
        write_txn.commit()?;

        let mut cache = HashMap::new();
        for collection in Collection::ALL {
            cache.insert(collection, load(&db, collection)?);
        }
        let documents: u64 = cache.values().map(|set| set.count(&Filter::new())).sum();

        info!("Opened document store at {:?} ({} documents)", path, documents);
        Ok(Self {
            db,
            cache: RwLock::new(cache),
        })
    }

    /// Run `apply` against the cached collection and persist the keys it
    /// reports as touched or removed.
    ///
    /// If the transaction fails the cached collection is reloaded, so it
    /// never holds a write that was not committed.
    fn mutate<T>(
        &self,
        collection: Collection,
        apply: impl FnOnce(&mut DocSet) -> (Mutation, T),
    ) -> StoreResult<T> {
        let mut cache = self.cache.write();
        let set = cache.entry(collection).or_default();
        let (mutation, out) = apply(set);
        if let Err(e) = self.persist(collection, set, &mutation) {
            warn!("Write to {} failed, reloading collection: {}", collection, e);
            *set = load(&self.db, collection)?;
            return Err(e);
        }
        Ok(out)
    }

    fn persist(
        &self,
        collection: Collection,
        set: &DocSet,
        mutation: &Mutation,
    ) -> StoreResult<()> {
        if mutation.touched.is_empty() && mutation.removed.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::for_collection(collection))?;
            for key in &mutation.removed {
                table.remove(*key)?;
            }
            for key in &mutation.touched {
                if let Some(doc) = set.get(*key) {
                    let bytes = serde_json::to_vec(doc)?;
                    table.insert(*key, bytes.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

fn load(db: &Database, collection: Collection) -> StoreResult<DocSet> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(tables::for_collection(collection))?;
    let mut docs = Vec::new();
    for entry in table.iter()? {
        let (key, value) = entry?;
        let doc: Doc = serde_json::from_slice(value.value())?;
        docs.push((key.value(), doc));
    }
    Ok(DocSet::from_entries(docs))
}

#[derive(Default)]
struct Mutation {
    touched: Vec<u64>,
    removed: Vec<u64>,
}

impl Mutation {
    fn touched(keys: impl IntoIterator<Item = u64>) -> Self {
        Self {
            touched: keys.into_iter().collect(),
            removed: Vec::new(),
        }
    }
}

impl DocumentStore for DiskStore {
    fn insert_one(&self, collection: Collection, doc: Doc) -> StoreResult<String> {
        self.mutate(collection, |set| match set.insert(doc) {
            Ok((key, id)) => (Mutation::touched([key]), Ok(id)),
            Err(e) => (Mutation::default(), Err(e)),
        })?
    }

    fn update_one(&self, collection: Collection, op: &UpdateOne) -> StoreResult<UpdateResult> {
        self.mutate(collection, |set| match set.update(op) {
            Ok((result, touched)) => (Mutation::touched(touched), Ok(result)),
            Err(e) => (Mutation::default(), Err(e)),
        })?
    }

    fn bulk_write(
        &self,
        collection: Collection,
        ops: &[UpdateOne],
        ordered: bool,
    ) -> StoreResult<BulkWriteResult> {
        let outcome = self.mutate(collection, |set| {
            let outcome = set.bulk(ops, ordered);
            (Mutation::touched(outcome.touched.iter().copied()), outcome)
        })?;
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
            .cache
            .read()
            .get(&collection)
            .map(|set| set.find(filter))
            .unwrap_or_default())
    }

    fn count(&self, collection: Collection, filter: &Filter) -> StoreResult<u64> {
        Ok(self
            .cache
            .read()
            .get(&collection)
            .map_or(0, |set| set.count(filter)))
    }

    fn delete_many(&self, collection: Collection, filter: &Filter) -> StoreResult<u64> {
        self.mutate(collection, |set| {
            let removed = set.delete(filter);
            let count = removed.len() as u64;
            (
                Mutation {
                    touched: Vec::new(),
                    removed,
                },
                count,
            )
        })
    }

    fn drop_collection(&self, collection: Collection) -> StoreResult<()> {
        let definition = tables::for_collection(collection);
        let mut cache = self.cache.write();
        let write_txn = self.db.begin_write()?;
        write_txn.delete_table(definition)?;
        {
            let _t = write_txn.open_table(definition)?;
        }
        write_txn.commit()?;
        if let Some(set) = cache.get_mut(&collection) {
            set.clear();
        }
        debug!("Dropped collection {}", collection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Update, ID_FIELD};
    use serde_json::json;
    use tempfile::tempdir;

    fn doc(value: serde_json::Value) -> Doc {
        value.as_object().cloned().unwrap()
    }

    /// Floats whose shortest decimal form is hard to parse back exactly
    fn awkward_floats() -> Vec<f64> {
        let mut values = vec![1.071_566_039_146_582_6e-75, -1.603_964_615_428_183e143, 0.1];
        let mut bits: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..500 {
            bits ^= bits << 13;
            bits ^= bits >> 7;
            bits ^= bits << 17;
            let arbitrary = f64::from_bits(bits);
            if arbitrary.is_finite() {
                values.push(arbitrary);
            }
            let u = (bits >> 11) as f64 / (1u64 << 53) as f64;
            values.push(u);
            values.push(1.7e9 + u * 1e6);
        }
        values
    }

    #[test]
    fn test_reopen_preserves_documents_and_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("volatile.redb");
        {
            let store = DiskStore::open(&path).unwrap();
            for n in 0..5 {
                store
                    .insert_one(Collection::Event, doc(json!({"descriptor": "d1", "n": n})))
                    .unwrap();
            }
        }

        let store = DiskStore::open(&path).unwrap();
        let pages = store.find(Collection::Event, &Filter::new()).unwrap();
        let ns: Vec<_> = pages.iter().map(|p| p["n"].clone()).collect();
        assert_eq!(ns, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
        assert!(pages.iter().all(|p| p.contains_key(ID_FIELD)));
    }

    #[test]
    fn test_floats_read_back_exactly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.redb");
        let floats = awkward_floats();
        {
            let store = DiskStore::open(&path).unwrap();
            store
                .insert_one(Collection::Event, doc(json!({"descriptor": "d1", "time": floats})))
                .unwrap();
        }

        let store = DiskStore::open(&path).unwrap();
        let page = store
            .find_one(Collection::Event, &Filter::new().eq("descriptor", "d1"))
            .unwrap()
            .unwrap();
        let read: Vec<u64> = page["time"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap().to_bits())
            .collect();
        let written: Vec<u64> = floats.iter().map(|f| f.to_bits()).collect();
        assert_eq!(read, written);
    }

    #[test]
    fn test_reopen_matches_cached_view() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.redb");
        let live = {
            let store = DiskStore::open(&path).unwrap();
            for n in 0..6 {
                let op = UpdateOne::upsert(
                    Filter::new().eq("descriptor", format!("d{}", n % 2)).lt("size", 3.0),
                    Update::new().push_each("seq_num", vec![json!(n)]).inc("size", 2),
                );
                store.bulk_write(Collection::Event, &[op], false).unwrap();
            }
            store
                .delete_many(Collection::Event, &Filter::new().eq("descriptor", "d0"))
                .unwrap();
            store
                .insert_one(Collection::Event, doc(json!({"descriptor": "d2"})))
                .unwrap();
            store.insert_one(Collection::Header, doc(json!({"run_id": "r1"}))).unwrap();
            store.drop_collection(Collection::Header).unwrap();

            Collection::ALL.map(|c| store.find(c, &Filter::new()).unwrap())
        };
        assert_eq!(live[1].len(), 3);

        let store = DiskStore::open(&path).unwrap();
        let reopened = Collection::ALL.map(|c| store.find(c, &Filter::new()).unwrap());
        assert_eq!(reopened, live);
    }

    #[test]
    fn test_bulk_write_persists_successful_ops() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path().join("db.redb")).unwrap();
        store
            .insert_one(Collection::Datum, doc(json!({"resource": "r1", "size": "bad"})))
            .unwrap();

        let ops = vec![
            UpdateOne::upsert(Filter::new().eq("resource", "r1"), Update::new().inc("size", 1)),
            UpdateOne::upsert(
                Filter::new().eq("resource", "r2"),
                Update::new().push_each("datum_id", vec![json!("a")]).inc("size", 1),
            ),
        ];
        let err = store.bulk_write(Collection::Datum, &ops, false).unwrap_err();
        assert!(matches!(err, StoreError::BulkWrite { total: 2, .. }));

        let page = store
            .find_one(Collection::Datum, &Filter::new().eq("resource", "r2"))
            .unwrap()
            .unwrap();
        assert_eq!(page["datum_id"], json!(["a"]));
        assert_eq!(page["size"], json!(1));
    }

    #[test]
    fn test_update_and_delete() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path().join("db.redb")).unwrap();
        let op = UpdateOne::upsert(
            Filter::new().eq("run_id", "r1"),
            Update::new().push_each("descriptors", vec![json!({"uid": "d1"})]),
        );
        let first = store.update_one(Collection::Header, &op).unwrap();
        assert!(first.upserted_id.is_some());
        let second = store.update_one(Collection::Header, &op).unwrap();
        assert_eq!(second.matched, 1);

        let header = store
            .find_one(Collection::Header, &Filter::new().eq("run_id", "r1"))
            .unwrap()
            .unwrap();
        assert_eq!(header["descriptors"].as_array().unwrap().len(), 2);

        let removed = store
            .delete_many(Collection::Header, &Filter::new().eq("run_id", "r1"))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count(Collection::Header, &Filter::new()).unwrap(), 0);
    }

    #[test]
    fn test_drop_collection() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path().join("db.redb")).unwrap();
        store
            .insert_one(Collection::Event, doc(json!({"descriptor": "d1"})))
            .unwrap();
        store
            .insert_one(Collection::Header, doc(json!({"run_id": "r1"})))
            .unwrap();

        store.drop_collection(Collection::Event).unwrap();
        assert_eq!(store.count(Collection::Event, &Filter::new()).unwrap(), 0);
        assert_eq!(store.count(Collection::Header, &Filter::new()).unwrap(), 1);

        store
            .insert_one(Collection::Event, doc(json!({"descriptor": "d2"})))
            .unwrap();
        assert_eq!(store.count(Collection::Event, &Filter::new()).unwrap(), 1);
    }
}
