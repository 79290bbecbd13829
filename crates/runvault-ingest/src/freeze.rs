//! Run reconstruction and copy between stores.
//!
//! A run is read back as its header, then the event pages of each descriptor
//! and the datum pages of each resource, in the order the header lists them.
//! Store identity fields are stripped so copies from different stores
//! compare equal.

use crate::counter::header_filter;
use crate::error::{IngestError, IngestResult};
use runvault_common::{document, Doc, StreamClass};
use runvault_store::{without_id, Collection, DocumentStore, Filter};
use serde_json::Value;
use tracing::debug;

/// A run as an ordered list of `(collection, document)` pairs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunCopy(pub Vec<(Collection, Doc)>);

impl RunCopy {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn header(&self) -> Option<&Doc> {
        self.0
            .iter()
            .find(|(collection, _)| *collection == Collection::Header)
            .map(|(_, doc)| doc)
    }
}

/// Uids of the stream owners listed in the header
fn owners(header: &Doc, class: StreamClass) -> IngestResult<Vec<String>> {
    let Some(list) = header.get(class.owner_field()) else {
        return Ok(Vec::new());
    };
    let Value::Array(owners) = list else {
        return Err(IngestError::integrity(format!(
            "header field '{}' is not an array",
            class.owner_field()
        )));
    };
    owners
        .iter()
        .map(|owner| match owner {
            Value::Object(doc) => Ok(document::uid(doc)?.to_string()),
            _ => Err(IngestError::integrity(format!(
                "header field '{}' holds a non-document entry",
                class.owner_field()
            ))),
        })
        .collect()
}

/// Read a run back from a store.
pub fn get_run(store: &dyn DocumentStore, run_uid: &str) -> IngestResult<RunCopy> {
    let header = store
        .find_one(Collection::Header, &header_filter(run_uid))?
        .ok_or_else(|| IngestError::RunNotFound(run_uid.to_string()))?;

    let mut run = Vec::new();
    let mut streams = Vec::new();
    for class in [StreamClass::Event, StreamClass::Datum] {
        for owner in owners(&header, class)? {
            streams.push((class, owner));
        }
    }
    run.push((Collection::Header, without_id(header)));

    for (class, owner) in streams {
        let filter = Filter::new().eq(class.roles().stream_key, owner);
        let collection = Collection::from(class);
        for page in store.find(collection, &filter)? {
            run.push((collection, without_id(page)));
        }
    }
    Ok(RunCopy(run))
}

/// Insert every document of a run copy.
pub fn insert_run(store: &dyn DocumentStore, run: &RunCopy) -> IngestResult<()> {
    for (collection, doc) in &run.0 {
        store.insert_one(*collection, doc.clone())?;
    }
    debug!("Inserted {} run documents", run.len());
    Ok(())
}

/// Delete a run's header and pages.
pub fn delete_run(store: &dyn DocumentStore, run_uid: &str) -> IngestResult<()> {
    let filter = header_filter(run_uid);
    let header = store
        .find_one(Collection::Header, &filter)?
        .ok_or_else(|| IngestError::RunNotFound(run_uid.to_string()))?;

    for class in [StreamClass::Event, StreamClass::Datum] {
        for owner in owners(&header, class)? {
            let pages = Filter::new().eq(class.roles().stream_key, owner);
            store.delete_many(Collection::from(class), &pages)?;
        }
    }
    store.delete_many(Collection::Header, &filter)?;
    Ok(())
}

/// Drop every collection a run is stored in.
pub fn drop_run_collections(store: &dyn DocumentStore) -> IngestResult<()> {
    for collection in Collection::ALL {
        store.drop_collection(collection)?;
    }
    Ok(())
}

/// Copy a run and verify the copy. Returns the run as read from `from`.
pub fn copy_run(
    from: &dyn DocumentStore,
    to: &dyn DocumentStore,
    run_uid: &str,
) -> IngestResult<RunCopy> {
    let source = get_run(from, run_uid)?;
    insert_run(to, &source)?;
    let copied = get_run(to, run_uid)?;
    if source != copied {
        return Err(IngestError::integrity(format!(
            "run {run_uid} read back from the permanent store differs from the volatile copy \
             ({} vs {} documents)",
            copied.len(),
            source.len()
        )));
    }
    Ok(source)
}
