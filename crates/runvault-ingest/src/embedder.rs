//! Page buffer.
//!
//! Embedding merges a run of documents from one stream into a single page:
//! array fields become lists, each inner key of a map field becomes a list,
//! and every other field keeps its latest value. The buffer is bounded by
//! the encoded size of the documents it has consumed.

use crate::error::{IngestError, IngestResult};
use runvault_common::config::validate_embedder_size;
use runvault_common::{Doc, Error, FieldRole, StreamClass};
use runvault_store::encoded_len;
use serde_json::Value;
use std::collections::BTreeMap;

/// Documents of one stream merged into page form
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialPage {
    pub arrays: BTreeMap<String, Vec<Value>>,
    pub maps: BTreeMap<String, BTreeMap<String, Vec<Value>>>,
    pub scalars: Doc,
    count: u64,
}

impl PartialPage {
    /// Number of documents embedded in this page
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn embed(&mut self, class: StreamClass, doc: Doc) {
        let roles = class.roles();
        for (field, value) in doc {
            match roles.role(&field) {
                FieldRole::Array => self.arrays.entry(field).or_default().push(value),
                FieldRole::MapOfArray => {
                    let inner = self.maps.entry(field).or_default();
                    if let Value::Object(map) = value {
                        for (key, value) in map {
                            inner.entry(key).or_default().push(value);
                        }
                    }
                }
                FieldRole::Scalar => {
                    self.scalars.insert(field, value);
                }
            }
        }
        self.count += 1;
    }

    /// Split an already paged document (`event_page` / `datum_page`) into
    /// its stream id and page form.
    pub fn from_page(class: StreamClass, page: Doc) -> IngestResult<(String, Self)> {
        let roles = class.roles();
        let stream_id = roles.stream_id(&page)?.to_string();
        let mut partial = Self::default();
        for (field, value) in page {
            match (roles.role(&field), value) {
                (FieldRole::Array, Value::Array(values)) => {
                    partial.arrays.insert(field, values);
                }
                (FieldRole::MapOfArray, Value::Object(map)) => {
                    let mut inner = BTreeMap::new();
                    for (key, value) in map {
                        match value {
                            Value::Array(values) => inner.insert(key, values),
                            _ => return Err(not_paged(class, &field)),
                        };
                    }
                    partial.maps.insert(field, inner);
                }
                (FieldRole::Scalar, value) => {
                    partial.scalars.insert(field, value);
                }
                _ => return Err(not_paged(class, &field)),
            }
        }
        partial.count = partial
            .arrays
            .get(roles.count_field)
            .map_or(0, |values| values.len() as u64);
        Ok((stream_id, partial))
    }
}

fn not_paged(class: StreamClass, field: &str) -> IngestError {
    Error::invalid_document(format!("{class} page field '{field}' is not in page form")).into()
}

/// Buffer contents handed to the page writer
#[derive(Debug, Default, PartialEq)]
pub struct EmbedderDump {
    pub pages: BTreeMap<String, PartialPage>,
    /// Encoded bytes consumed per stream
    pub sizes: BTreeMap<String, usize>,
}

impl EmbedderDump {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Size-bounded buffer of partial pages, keyed by stream id
#[derive(Debug)]
pub struct Embedder {
    class: StreamClass,
    max_size: usize,
    current_size: usize,
    pages: BTreeMap<String, PartialPage>,
    sizes: BTreeMap<String, usize>,
}

impl Embedder {
    pub fn new(class: StreamClass, max_size: usize) -> IngestResult<Self> {
        validate_embedder_size(max_size)?;
        Ok(Self {
            class,
            max_size,
            current_size: 0,
            pages: BTreeMap::new(),
            sizes: BTreeMap::new(),
        })
    }

    pub fn class(&self) -> StreamClass {
        self.class
    }

    /// Bytes currently buffered
    pub fn current_size(&self) -> usize {
        self.current_size
    }

    /// Embed a document. Returns it back unconsumed when the buffer has no
    /// room; the caller should flush and retry.
    pub fn insert(&mut self, doc: Doc) -> IngestResult<Option<Doc>> {
        let roles = self.class.roles();
        let stream_id = roles.stream_id(&doc)?.to_string();
        for field in roles.map_fields {
            if let Some(value) = doc.get(*field) {
                if !value.is_object() {
                    return Err(Error::invalid_document(format!(
                        "{} field '{field}' must be an object",
                        self.class
                    ))
                    .into());
                }
            }
        }

        let size = encoded_len(&doc)?;
        if size > self.max_size {
            return Err(IngestError::DocumentTooLarge {
                size,
                max: self.max_size,
            });
        }
        if self.current_size + size > self.max_size {
            return Ok(Some(doc));
        }

        *self.sizes.entry(stream_id.clone()).or_default() += size;
        self.pages.entry(stream_id).or_default().embed(self.class, doc);
        self.current_size += size;
        Ok(None)
    }

    /// Take the buffered pages, leaving the buffer empty.
    pub fn dump(&mut self) -> EmbedderDump {
        self.current_size = 0;
        EmbedderDump {
            pages: std::mem::take(&mut self.pages),
            sizes: std::mem::take(&mut self.sizes),
        }
    }

    pub fn empty(&self) -> bool {
        self.current_size == 0
    }
}
