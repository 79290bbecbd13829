//! Run document model
//!
//! Documents arrive already validated, so the body of each one is kept as a
//! plain JSON object. What the pipeline needs to know about a document is
//! its kind, and for the two high-frequency kinds, which role each field
//! plays when documents of one stream are merged into a page.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A raw document body.
pub type Doc = Map<String, Value>;

/// Kind of a run document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Start,
    Stop,
    Descriptor,
    Resource,
    Event,
    Datum,
    EventPage,
    DatumPage,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Descriptor => "descriptor",
            Self::Resource => "resource",
            Self::Event => "event",
            Self::Datum => "datum",
            Self::EventPage => "event_page",
            Self::DatumPage => "datum_page",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified run document.
///
/// Serialized as `{"name": "<kind>", "doc": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "doc", rename_all = "snake_case")]
pub enum Document {
    Start(Doc),
    Stop(Doc),
    Descriptor(Doc),
    Resource(Doc),
    Event(Doc),
    Datum(Doc),
    EventPage(Doc),
    DatumPage(Doc),
}

impl Document {
    pub fn kind(&self) -> DocumentKind {
        match self {
            Self::Start(_) => DocumentKind::Start,
            Self::Stop(_) => DocumentKind::Stop,
            Self::Descriptor(_) => DocumentKind::Descriptor,
            Self::Resource(_) => DocumentKind::Resource,
            Self::Event(_) => DocumentKind::Event,
            Self::Datum(_) => DocumentKind::Datum,
            Self::EventPage(_) => DocumentKind::EventPage,
            Self::DatumPage(_) => DocumentKind::DatumPage,
        }
    }

    pub fn body(&self) -> &Doc {
        match self {
            Self::Start(doc)
            | Self::Stop(doc)
            | Self::Descriptor(doc)
            | Self::Resource(doc)
            | Self::Event(doc)
            | Self::Datum(doc)
            | Self::EventPage(doc)
            | Self::DatumPage(doc) => doc,
        }
    }

    pub fn into_body(self) -> Doc {
        match self {
            Self::Start(doc)
            | Self::Stop(doc)
            | Self::Descriptor(doc)
            | Self::Resource(doc)
            | Self::Event(doc)
            | Self::Datum(doc)
            | Self::EventPage(doc)
            | Self::DatumPage(doc) => doc,
        }
    }

    /// Rebuild a document of the given kind around a body.
    pub fn from_parts(kind: DocumentKind, doc: Doc) -> Self {
        match kind {
            DocumentKind::Start => Self::Start(doc),
            DocumentKind::Stop => Self::Stop(doc),
            DocumentKind::Descriptor => Self::Descriptor(doc),
            DocumentKind::Resource => Self::Resource(doc),
            DocumentKind::Event => Self::Event(doc),
            DocumentKind::Datum => Self::Datum(doc),
            DocumentKind::EventPage => Self::EventPage(doc),
            DocumentKind::DatumPage => Self::DatumPage(doc),
        }
    }
}

/// How a field is merged when documents are embedded into a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// Each value is appended to a per-field list
    Array,
    /// An object whose inner values are appended to per-inner-key lists
    MapOfArray,
    /// Latest value wins
    Scalar,
}

/// Field roles for one stream class
#[derive(Debug)]
pub struct FieldRoles {
    /// Field holding the stream identifier
    pub stream_key: &'static str,
    pub array_fields: &'static [&'static str],
    pub map_fields: &'static [&'static str],
    /// Array field whose length is the number of documents in a page
    pub count_field: &'static str,
}

impl FieldRoles {
    pub fn role(&self, field: &str) -> FieldRole {
        if self.array_fields.contains(&field) {
            FieldRole::Array
        } else if self.map_fields.contains(&field) {
            FieldRole::MapOfArray
        } else {
            FieldRole::Scalar
        }
    }

    /// Stream identifier of a document, required for routing.
    pub fn stream_id<'a>(&self, doc: &'a Doc) -> Result<&'a str> {
        doc.get(self.stream_key)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::invalid_document(format!("missing string field '{}'", self.stream_key))
            })
    }
}

static EVENT_ROLES: FieldRoles = FieldRoles {
    stream_key: "descriptor",
    array_fields: &["seq_num", "time", "uid"],
    map_fields: &["data", "timestamps", "filled"],
    count_field: "seq_num",
};

static DATUM_ROLES: FieldRoles = FieldRoles {
    stream_key: "resource",
    array_fields: &["datum_id"],
    map_fields: &["datum_kwargs"],
    count_field: "datum_id",
};

/// High-frequency document class that gets paged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamClass {
    Event,
    Datum,
}

impl StreamClass {
    pub fn roles(&self) -> &'static FieldRoles {
        match self {
            Self::Event => &EVENT_ROLES,
            Self::Datum => &DATUM_ROLES,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Datum => "datum",
        }
    }

    /// Header field listing the documents that own this class's streams.
    pub fn owner_field(&self) -> &'static str {
        match self {
            Self::Event => "descriptors",
            Self::Datum => "resources",
        }
    }

    /// Header field holding the per-stream insert counts.
    pub fn counts_field(&self) -> &'static str {
        match self {
            Self::Event => "event_counts",
            Self::Datum => "datum_counts",
        }
    }

    /// Header field holding the total insert count.
    pub fn total_field(&self) -> &'static str {
        match self {
            Self::Event => "event_count",
            Self::Datum => "datum_count",
        }
    }
}

impl fmt::Display for StreamClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `uid` field of a document.
pub fn uid(doc: &Doc) -> Result<&str> {
    doc.get("uid")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_document("missing string field 'uid'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_tagging() {
        let doc: Document =
            serde_json::from_value(json!({"name": "event_page", "doc": {"descriptor": "d1"}}))
                .unwrap();
        assert_eq!(doc.kind(), DocumentKind::EventPage);
        assert_eq!(doc.body()["descriptor"], json!("d1"));

        let value = serde_json::to_value(Document::Stop(Doc::new())).unwrap();
        assert_eq!(value, json!({"name": "stop", "doc": {}}));
    }

    #[test]
    fn test_field_roles() {
        let roles = StreamClass::Event.roles();
        assert_eq!(roles.role("seq_num"), FieldRole::Array);
        assert_eq!(roles.role("timestamps"), FieldRole::MapOfArray);
        assert_eq!(roles.role("descriptor"), FieldRole::Scalar);

        let roles = StreamClass::Datum.roles();
        assert_eq!(roles.role("datum_kwargs"), FieldRole::MapOfArray);
        assert_eq!(roles.role("seq_num"), FieldRole::Scalar);
    }

    #[test]
    fn test_stream_id() {
        let doc = json!({"resource": "r1", "datum_id": "r1/0"});
        let doc = doc.as_object().unwrap();
        assert_eq!(StreamClass::Datum.roles().stream_id(doc).unwrap(), "r1");
        assert!(StreamClass::Event.roles().stream_id(doc).is_err());
        assert!(uid(doc).is_err());
    }
}
