//! Page writer.
//!
//! Turns a buffer dump into one append-or-create update per stream and
//! submits them as a single unordered bulk write. A page is open while its
//! `size` is below the page size threshold; once a write pushes it past the
//! threshold, the next write for that stream no longer matches it and the
//! upsert starts a new page.

use crate::counter::StreamCounters;
use crate::embedder::EmbedderDump;
use crate::error::IngestResult;
use runvault_common::StreamClass;
use runvault_store::{Collection, DocumentStore, Filter, Update, UpdateOne, ID_FIELD};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Fields maintained by the writer itself
const PAGE_FIELDS: [&str; 4] = ["size", "first_index", "last_index", ID_FIELD];

pub struct PageWriter {
    class: StreamClass,
    store: Arc<dyn DocumentStore>,
    page_size: usize,
    /// Next index per stream; this writer is the only one advancing them
    next_index: HashMap<String, u64>,
    published: Arc<StreamCounters>,
}

impl PageWriter {
    /// `published` receives the per-stream index counters after every
    /// batch, for readers on other threads.
    pub fn new(
        class: StreamClass,
        store: Arc<dyn DocumentStore>,
        page_size: usize,
        published: Arc<StreamCounters>,
    ) -> Self {
        Self {
            class,
            store,
            page_size,
            next_index: HashMap::new(),
            published,
        }
    }

    /// Build the update for each stream of the dump, advancing the index
    /// counters. Streams with no documents are skipped.
    pub fn build(&mut self, dump: EmbedderDump) -> Vec<(String, u64, UpdateOne)> {
        let roles = self.class.roles();
        let mut ops = Vec::with_capacity(dump.pages.len());
        for (stream, page) in dump.pages {
            let count = page.len();
            if count == 0 {
                continue;
            }
            let size = dump.sizes.get(&stream).copied().unwrap_or(0);
            let before = self.next_index.get(&stream).copied().unwrap_or(0);
            let after = before + count;

            let mut update = Update::new();
            for (field, values) in page.arrays {
                update = update.push_each(field, values);
            }
            for (field, inner) in page.maps {
                for (key, values) in inner {
                    update = update.push_each(format!("{field}.{key}"), values);
                }
            }
            update = update
                .inc("size", i64::try_from(size).unwrap_or(i64::MAX))
                .min("first_index", before as i64)
                .max("last_index", after as i64 - 1);
            for (field, value) in page.scalars {
                if field != roles.stream_key && !PAGE_FIELDS.contains(&field.as_str()) {
                    update = update.set(field, value);
                }
            }

            let filter = Filter::new()
                .eq(roles.stream_key, stream.as_str())
                .lt("size", self.page_size as f64);
            self.next_index.insert(stream.clone(), after);
            self.published.set(&stream, after);
            ops.push((stream, count, UpdateOne::upsert(filter, update)));
        }
        ops
    }

    /// Write a dump. Returns the number of documents written per stream.
    pub fn write(&mut self, dump: EmbedderDump) -> IngestResult<Vec<(String, u64)>> {
        let planned = self.build(dump);
        if planned.is_empty() {
            return Ok(Vec::new());
        }
        let mut ops = Vec::with_capacity(planned.len());
        let mut written = Vec::with_capacity(planned.len());
        for (stream, count, op) in planned {
            ops.push(op);
            written.push((stream, count));
        }
        let result = self
            .store
            .bulk_write(Collection::from(self.class), &ops, false)?;
        debug!(
            "Wrote {} {} streams ({} new pages)",
            ops.len(),
            self.class,
            result.upserted
        );
        Ok(written)
    }
}
