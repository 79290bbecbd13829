//! RunVault Ingest - run ingestion and staged commit
//!
//! This crate turns a stream of run documents into paged records in a
//! volatile document store, then moves the finished run into a permanent
//! store:
//!
//! - [`Embedder`]: merges documents of one stream into a size-capped page
//! - [`PageWriter`]: appends buffered pages with one bulk upsert per flush
//! - [`RunPipeline`]: queues, background workers, count aggregation and
//!   the freeze protocol

pub mod counter;
pub mod embedder;
pub mod error;
pub mod freeze;
pub mod page_writer;
pub mod pipeline;
pub mod worker;

pub use counter::StreamCounters;
pub use embedder::{Embedder, EmbedderDump, PartialPage};
pub use error::{IngestError, IngestResult};
pub use freeze::RunCopy;
pub use page_writer::PageWriter;
pub use pipeline::RunPipeline;
pub use worker::{StreamMessage, WorkerState};
