//! Redb table definitions for the disk store.
//!
//! Key: per-collection sequence number, Value: compact JSON document

use crate::Collection;
use redb::TableDefinition;

pub const HEADER: TableDefinition<u64, &[u8]> = TableDefinition::new("header");
pub const EVENT: TableDefinition<u64, &[u8]> = TableDefinition::new("event");
pub const DATUM: TableDefinition<u64, &[u8]> = TableDefinition::new("datum");

pub fn for_collection(collection: Collection) -> TableDefinition<'static, u64, &'static [u8]> {
    match collection {
        Collection::Header => HEADER,
        Collection::Event => EVENT,
        Collection::Datum => DATUM,
    }
}
