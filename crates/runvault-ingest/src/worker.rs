//! Stream worker.
//!
//! One worker per stream class drains that class's bounded queue into a
//! page buffer and flushes the buffer through a [`PageWriter`] when:
//!
//! - the buffer rejects a document (flush, then retry the same document)
//! - a shutdown message arrives, or every sender is gone
//! - the queue stays idle for one poll interval
//! - `max_insert_time` has passed since the last flush
//!
//! Any error ends the worker and is recorded as the pipeline's sticky error.

use crate::counter::StreamCounters;
use crate::embedder::{Embedder, EmbedderDump, PartialPage};
use crate::error::{IngestResult, StickyError};
use crate::page_writer::PageWriter;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use runvault_common::{Doc, StreamClass};
use runvault_store::encoded_len;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Message on a stream class queue
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// A single event or datum
    Document(Doc),
    /// An already paged `event_page` / `datum_page`
    Page(Doc),
    Shutdown,
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Running = 0,
    Draining = 1,
    Stopped = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Worker progress published for other threads
#[derive(Debug, Default)]
pub struct WorkerStatus {
    /// Documents written per stream, updated after each flush
    pub inserted: Arc<StreamCounters>,
    /// Page index counters per stream, advanced by the page writer
    pub indices: Arc<StreamCounters>,
    buffered_bytes: AtomicUsize,
    state: AtomicU8,
}

impl WorkerStatus {
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Bytes held in the worker's page buffer
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Acquire)
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_buffered(&self, bytes: usize) {
        self.buffered_bytes.store(bytes, Ordering::Release);
    }
}

pub(crate) struct StreamWorker {
    pub class: StreamClass,
    pub receiver: Receiver<StreamMessage>,
    pub embedder: Embedder,
    pub writer: PageWriter,
    pub status: Arc<WorkerStatus>,
    pub sticky: Arc<StickyError>,
    pub poll_interval: Duration,
    pub max_insert_time: Duration,
}

impl StreamWorker {
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<IngestResult<()>>> {
        thread::Builder::new()
            .name(format!("runvault-{}", self.class))
            .spawn(move || self.run())
    }

    fn run(mut self) -> IngestResult<()> {
        debug!("{} worker started", self.class);
        let result = self.run_loop();
        self.status.set_state(WorkerState::Stopped);
        match result {
            Ok(()) => {
                info!("{} worker stopped", self.class);
                Ok(())
            }
            Err(e) => {
                error!("{} worker failed: {}", self.class, e);
                Err(self.sticky.record(self.class.as_str(), e))
            }
        }
    }

    fn run_loop(&mut self) -> IngestResult<()> {
        let mut pending: Option<Doc> = None;
        let mut last_flush = Instant::now();
        loop {
            let mut flush = false;
            let mut shutdown = false;

            let doc = match pending.take() {
                Some(doc) => Some(doc),
                None => match self.receiver.recv_timeout(self.poll_interval) {
                    Ok(StreamMessage::Document(doc)) => Some(doc),
                    Ok(StreamMessage::Page(page)) => {
                        self.flush()?;
                        last_flush = Instant::now();
                        self.write_page(page)?;
                        None
                    }
                    Ok(StreamMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        self.status.set_state(WorkerState::Draining);
                        shutdown = true;
                        flush = true;
                        None
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        flush = true;
                        None
                    }
                },
            };

            if let Some(doc) = doc {
                if let Some(rejected) = self.embedder.insert(doc)? {
                    pending = Some(rejected);
                    flush = true;
                }
                self.status.set_buffered(self.embedder.current_size());
            }

            if flush || last_flush.elapsed() >= self.max_insert_time {
                self.flush()?;
                last_flush = Instant::now();
            }
            if shutdown {
                return Ok(());
            }
        }
    }

    fn flush(&mut self) -> IngestResult<()> {
        if self.embedder.empty() {
            return Ok(());
        }
        let dump = self.embedder.dump();
        self.status.set_buffered(0);
        self.commit(dump)
    }

    /// Write a pre-paged document as a one-stream batch.
    fn write_page(&mut self, page: Doc) -> IngestResult<()> {
        let size = encoded_len(&page)?;
        let (stream, partial) = PartialPage::from_page(self.class, page)?;
        let dump = EmbedderDump {
            sizes: BTreeMap::from([(stream.clone(), size)]),
            pages: BTreeMap::from([(stream, partial)]),
        };
        self.commit(dump)
    }

    fn commit(&mut self, dump: EmbedderDump) -> IngestResult<()> {
        for (stream, count) in self.writer.write(dump)? {
            self.status.inserted.add(&stream, count);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crossbeam_channel::bounded;
    use runvault_store::{Collection, DocumentStore, Filter, MemoryStore};
    use serde_json::json;

    fn spawn_worker(
        store: Arc<MemoryStore>,
        poll_interval: Duration,
        max_insert_time: Duration,
    ) -> (
        crossbeam_channel::Sender<StreamMessage>,
        Arc<WorkerStatus>,
        Arc<StickyError>,
        thread::JoinHandle<IngestResult<()>>,
    ) {
        let (tx, rx) = bounded(4);
        let status = Arc::new(WorkerStatus::default());
        let sticky = Arc::new(StickyError::default());
        let worker = StreamWorker {
            class: StreamClass::Datum,
            receiver: rx,
            embedder: Embedder::new(StreamClass::Datum, 1_000_000).unwrap(),
            writer: PageWriter::new(
                StreamClass::Datum,
                store,
                1_000_000,
                status.indices.clone(),
            ),
            status: status.clone(),
            sticky: sticky.clone(),
            poll_interval,
            max_insert_time,
        };
        (tx, status, sticky, worker.spawn().unwrap())
    }

    fn datum(resource: &str, id: &str) -> Doc {
        json!({"resource": resource, "datum_id": id, "datum_kwargs": {"n": 1}})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_shutdown_flushes_buffer() {
        let store = Arc::new(MemoryStore::new());
        let (tx, status, _, handle) =
            spawn_worker(store.clone(), Duration::from_secs(60), Duration::from_secs(60));
        for id in ["a", "b", "c"] {
            tx.send(StreamMessage::Document(datum("r1", id))).unwrap();
        }
        tx.send(StreamMessage::Shutdown).unwrap();
        handle.join().unwrap().unwrap();

        assert_eq!(status.state(), WorkerState::Stopped);
        assert_eq!(status.buffered_bytes(), 0);
        assert_eq!(status.inserted.get("r1"), 3);
        assert_eq!(status.indices.get("r1"), 3);
        let page = store
            .find_one(Collection::Datum, &Filter::new().eq("resource", "r1"))
            .unwrap()
            .unwrap();
        assert_eq!(page["datum_id"], json!(["a", "b", "c"]));
    }

    #[test]
    fn test_idle_queue_triggers_flush() {
        let store = Arc::new(MemoryStore::new());
        let (tx, status, _, handle) =
            spawn_worker(store.clone(), Duration::from_millis(10), Duration::from_secs(60));
        tx.send(StreamMessage::Document(datum("r1", "a"))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while status.inserted.get("r1") == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(status.inserted.get("r1"), 1);
        assert_eq!(status.state(), WorkerState::Running);

        drop(tx);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_busy_queue_flushes_after_max_insert_time() {
        let store = Arc::new(MemoryStore::new());
        let (tx, status, _, handle) =
            spawn_worker(store.clone(), Duration::from_secs(60), Duration::from_millis(20));

        // The queue never goes idle for a poll interval, so only the
        // insert-time trigger can flush
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut sent = 0;
        while status.inserted.get("r1") == 0 && Instant::now() < deadline {
            tx.send(StreamMessage::Document(datum("r1", &sent.to_string())))
                .unwrap();
            sent += 1;
            thread::sleep(Duration::from_millis(2));
        }
        assert!(status.inserted.get("r1") > 0);
        assert!(status.inserted.get("r1") <= sent);
        assert_eq!(status.state(), WorkerState::Running);

        tx.send(StreamMessage::Shutdown).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(status.inserted.get("r1"), sent);
    }

    #[test]
    fn test_page_message_keeps_stream_order() {
        let store = Arc::new(MemoryStore::new());
        let (tx, status, _, handle) =
            spawn_worker(store.clone(), Duration::from_secs(60), Duration::from_secs(60));
        tx.send(StreamMessage::Document(datum("r1", "a"))).unwrap();
        let page = json!({"resource": "r1", "datum_id": ["b", "c"], "datum_kwargs": {"n": [2, 3]}});
        tx.send(StreamMessage::Page(page.as_object().cloned().unwrap()))
            .unwrap();
        tx.send(StreamMessage::Shutdown).unwrap();
        handle.join().unwrap().unwrap();

        let page = store
            .find_one(Collection::Datum, &Filter::new().eq("resource", "r1"))
            .unwrap()
            .unwrap();
        assert_eq!(page["datum_id"], json!(["a", "b", "c"]));
        assert_eq!(page["first_index"], json!(0));
        assert_eq!(page["last_index"], json!(2));
        assert_eq!(status.indices.get("r1"), 3);
    }

    #[test]
    fn test_error_is_recorded() {
        let store = Arc::new(MemoryStore::new());
        let (tx, status, sticky, handle) =
            spawn_worker(store, Duration::from_secs(60), Duration::from_secs(60));
        let keyless = json!({"datum_id": "a"}).as_object().cloned().unwrap();
        tx.send(StreamMessage::Document(keyless)).unwrap();

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, IngestError::Worker { worker: "datum", .. }));
        assert!(sticky.check().is_err());
        assert_eq!(status.state(), WorkerState::Stopped);
    }
}
