//! Filters and update operators
//!
//! A small subset of document-store query semantics: conjunctive filters
//! with equality and less-than clauses, and `$set`, `$push`/`$each`, `$inc`,
//! `$min`, `$max` updates over dotted field paths. Missing intermediate
//! objects are created on write, and an upsert seeds the new document from
//! the filter's equality clauses.

use crate::error::{StoreError, StoreResult};
use runvault_common::config::MAX_STORE_DOCUMENT_SIZE;
use runvault_common::Doc;
use serde_json::{Map, Number, Value};
use std::io;

/// Store-assigned identity field
pub const ID_FIELD: &str = "_id";

/// Filter clause condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field equals the value
    Eq(Value),
    /// Field is a number strictly below the bound. Missing fields never match.
    Lt(f64),
}

/// Conjunction of clauses; an empty filter matches every document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((path.into(), Condition::Eq(value.into())));
        self
    }

    pub fn lt(mut self, path: impl Into<String>, bound: f64) -> Self {
        self.clauses.push((path.into(), Condition::Lt(bound)));
        self
    }

    pub fn matches(&self, doc: &Doc) -> bool {
        self.clauses.iter().all(|(path, cond)| {
            let field = get_path(doc, path);
            match cond {
                Condition::Eq(value) => field == Some(value),
                Condition::Lt(bound) => field
                    .and_then(Value::as_f64)
                    .is_some_and(|n| n < *bound),
            }
        })
    }

    /// Document an upsert starts from.
    fn seed(&self) -> StoreResult<Doc> {
        let mut doc = Map::new();
        for (path, cond) in &self.clauses {
            if let Condition::Eq(value) = cond {
                let (parent, leaf) = parent_mut(&mut doc, path, "$eq")?;
                parent.insert(leaf.to_string(), value.clone());
            }
        }
        Ok(doc)
    }
}

/// Update operators, applied in the order set, push, inc, min, max
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    set: Vec<(String, Value)>,
    push: Vec<(String, Vec<Value>)>,
    inc: Vec<(String, i64)>,
    min: Vec<(String, i64)>,
    max: Vec<(String, i64)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((path.into(), value.into()));
        self
    }

    /// Append every value to the array at `path`.
    pub fn push_each(mut self, path: impl Into<String>, values: Vec<Value>) -> Self {
        self.push.push((path.into(), values));
        self
    }

    pub fn inc(mut self, path: impl Into<String>, by: i64) -> Self {
        self.inc.push((path.into(), by));
        self
    }

    pub fn min(mut self, path: impl Into<String>, value: i64) -> Self {
        self.min.push((path.into(), value));
        self
    }

    pub fn max(mut self, path: impl Into<String>, value: i64) -> Self {
        self.max.push((path.into(), value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.push.is_empty()
            && self.inc.is_empty()
            && self.min.is_empty()
            && self.max.is_empty()
    }

    /// Apply the update in place. On error the document may be partially
    /// modified; callers apply to a copy.
    pub fn apply(&self, doc: &mut Doc) -> StoreResult<()> {
        for (path, value) in &self.set {
            let (parent, leaf) = parent_mut(doc, path, "$set")?;
            parent.insert(leaf.to_string(), value.clone());
        }
        for (path, values) in &self.push {
            let (parent, leaf) = parent_mut(doc, path, "$push")?;
            match parent
                .entry(leaf.to_string())
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                Value::Array(items) => items.extend(values.iter().cloned()),
                other => return Err(mismatch("$push", path, "an array", other)),
            }
        }
        for (path, by) in &self.inc {
            let (parent, leaf) = parent_mut(doc, path, "$inc")?;
            let next = match parent.get(leaf) {
                None => Value::from(*by),
                Some(Value::Number(n)) => add(n, *by),
                Some(other) => return Err(mismatch("$inc", path, "a number", other)),
            };
            parent.insert(leaf.to_string(), next);
        }
        for (path, value) in &self.min {
            bound(doc, path, *value, "$min", |candidate, current| candidate < current)?;
        }
        for (path, value) in &self.max {
            bound(doc, path, *value, "$max", |candidate, current| candidate > current)?;
        }
        Ok(())
    }
}

/// One append-or-create operation
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOne {
    pub filter: Filter,
    pub update: Update,
    pub upsert: bool,
}

impl UpdateOne {
    pub fn new(filter: Filter, update: Update) -> Self {
        Self {
            filter,
            update,
            upsert: false,
        }
    }

    pub fn upsert(filter: Filter, update: Update) -> Self {
        Self {
            filter,
            update,
            upsert: true,
        }
    }
}

/// Result of a single update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<String>,
}

/// Aggregate result of a bulk write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
}

impl BulkWriteResult {
    pub(crate) fn record(&mut self, result: &UpdateResult) {
        self.matched += result.matched;
        self.modified += result.modified;
        if result.upserted_id.is_some() {
            self.upserted += 1;
        }
    }
}

/// Look up a dotted path.
pub fn get_path<'a>(doc: &'a Doc, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Size of the document in the store's wire encoding (compact JSON).
pub fn encoded_len(doc: &Doc) -> StoreResult<usize> {
    let mut counter = ByteCounter(0);
    serde_json::to_writer(&mut counter, doc)?;
    Ok(counter.0)
}

/// Reject documents over the store's size limit.
pub(crate) fn check_size(doc: &Doc) -> StoreResult<()> {
    let size = encoded_len(doc)?;
    if size > MAX_STORE_DOCUMENT_SIZE {
        return Err(StoreError::DocumentTooLarge {
            size,
            limit: MAX_STORE_DOCUMENT_SIZE,
        });
    }
    Ok(())
}

/// Return the document's `_id`, assigning a fresh one if absent.
pub(crate) fn ensure_id(doc: &mut Doc) -> String {
    if let Some(Value::String(id)) = doc.get(ID_FIELD) {
        return id.clone();
    }
    let id = uuid::Uuid::new_v4().to_string();
    doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
    id
}

/// Copy of `doc` without the identity field.
pub fn without_id(mut doc: Doc) -> Doc {
    doc.remove(ID_FIELD);
    doc
}

/// Apply one update against a collection snapshot. Returns the key of the
/// document to replace or `None` for an insert, plus the new document.
pub(crate) fn plan_update<'a>(
    docs: impl IntoIterator<Item = (u64, &'a Doc)>,
    op: &UpdateOne,
) -> StoreResult<Option<(Option<u64>, Doc, UpdateResult)>> {
    if let Some((key, current)) = docs.into_iter().find(|(_, doc)| op.filter.matches(doc)) {
        let mut next = current.clone();
        op.update.apply(&mut next)?;
        check_size(&next)?;
        let result = UpdateResult {
            matched: 1,
            modified: u64::from(next != *current),
            upserted_id: None,
        };
        return Ok(Some((Some(key), next, result)));
    }
    if !op.upsert {
        return Ok(None);
    }
    let mut doc = op.filter.seed()?;
    op.update.apply(&mut doc)?;
    let id = ensure_id(&mut doc);
    check_size(&doc)?;
    let result = UpdateResult {
        matched: 0,
        modified: 0,
        upserted_id: Some(id),
    };
    Ok(Some((None, doc, result)))
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn parent_mut<'d, 'p>(
    doc: &'d mut Doc,
    path: &'p str,
    op: &'static str,
) -> StoreResult<(&'d mut Doc, &'p str)> {
    let (parents, leaf) = match path.rsplit_once('.') {
        Some((parents, leaf)) => (Some(parents), leaf),
        None => (None, path),
    };
    let mut current = doc;
    if let Some(parents) = parents {
        for segment in parents.split('.') {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            current = match entry {
                Value::Object(map) => map,
                other => return Err(mismatch(op, path, "an object on the path", other)),
            };
        }
    }
    Ok((current, leaf))
}

fn bound(
    doc: &mut Doc,
    path: &str,
    candidate: i64,
    op: &'static str,
    replaces: impl Fn(f64, f64) -> bool,
) -> StoreResult<()> {
    let (parent, leaf) = parent_mut(doc, path, op)?;
    let write = match parent.get(leaf) {
        None => true,
        Some(Value::Number(current)) => {
            replaces(candidate as f64, current.as_f64().unwrap_or(f64::NAN))
        }
        Some(other) => return Err(mismatch(op, path, "a number", other)),
    };
    if write {
        parent.insert(leaf.to_string(), Value::from(candidate));
    }
    Ok(())
}

fn add(current: &Number, by: i64) -> Value {
    if let Some(sum) = current.as_i64().and_then(|n| n.checked_add(by)) {
        return Value::from(sum);
    }
    Value::from(current.as_f64().unwrap_or(0.0) + by as f64)
}

fn mismatch(op: &'static str, path: &str, expected: &str, found: &Value) -> StoreError {
    let found = match found {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    StoreError::TypeMismatch {
        op,
        path: path.to_string(),
        reason: format!("expected {expected}, found {found}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Doc {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_matching() {
        let page = doc(json!({"descriptor": "d1", "size": 10, "nested": {"k": 1}}));
        assert!(Filter::new().matches(&page));
        assert!(Filter::new().eq("descriptor", "d1").lt("size", 11.0).matches(&page));
        assert!(!Filter::new().eq("descriptor", "d1").lt("size", 10.0).matches(&page));
        assert!(Filter::new().eq("nested.k", 1).matches(&page));
        assert!(!Filter::new().lt("missing", 100.0).matches(&page));
    }

    #[test]
    fn test_update_operators() {
        let mut page = doc(json!({"seq_num": [1], "size": 5, "first_index": 3}));
        Update::new()
            .push_each("seq_num", vec![json!(2), json!(3)])
            .push_each("data.x", vec![json!(1.5)])
            .inc("size", 7)
            .min("first_index", 1)
            .max("last_index", 4)
            .set("descriptor", "d1")
            .apply(&mut page)
            .unwrap();

        assert_eq!(
            Value::Object(page),
            json!({
                "seq_num": [1, 2, 3],
                "data": {"x": [1.5]},
                "size": 12,
                "first_index": 1,
                "last_index": 4,
                "descriptor": "d1",
            })
        );
    }

    #[test]
    fn test_min_max_keep_existing() {
        let mut page = doc(json!({"first_index": 0, "last_index": 9}));
        Update::new()
            .min("first_index", 5)
            .max("last_index", 3)
            .apply(&mut page)
            .unwrap();
        assert_eq!(page["first_index"], json!(0));
        assert_eq!(page["last_index"], json!(9));
    }

    #[test]
    fn test_type_mismatch() {
        let mut page = doc(json!({"seq_num": 1, "data": 4}));
        let err = Update::new()
            .push_each("seq_num", vec![json!(2)])
            .apply(&mut page.clone())
            .unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { op: "$push", .. }));

        let err = Update::new().set("data.x", 1).apply(&mut page).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { op: "$set", .. }));
    }

    #[test]
    fn test_upsert_seeds_from_equality_clauses() {
        let op = UpdateOne::upsert(
            Filter::new().eq("descriptor", "d1").lt("size", 100.0),
            Update::new().inc("size", 10),
        );
        let (key, page, result) = plan_update(std::iter::empty(), &op).unwrap().unwrap();
        assert!(key.is_none());
        assert_eq!(page["descriptor"], json!("d1"));
        assert_eq!(page["size"], json!(10));
        assert_eq!(result.upserted_id.as_deref(), page[ID_FIELD].as_str());
    }

    #[test]
    fn test_encoded_len_matches_serialization() {
        let page = doc(json!({"uid": "abc", "data": {"x": [1, 2.5]}}));
        assert_eq!(
            encoded_len(&page).unwrap(),
            serde_json::to_vec(&page).unwrap().len()
        );
    }
}
