//! Run ingestion pipeline.
//!
//! A `RunPipeline` accepts the documents of one run. Headers (start,
//! descriptors, resources) are written synchronously on the caller's
//! thread. Events and datum are handed to one background worker per class
//! through bounded queues, so callers block when a worker falls behind.
//! A third thread mirrors the inserted counts into the run header.
//!
//! When the run is complete, [`RunPipeline::freeze`] drains the workers,
//! finalises the header and moves the run from the volatile store to the
//! permanent store, deleting the volatile copy only after the permanent copy
//! reads back identical.

use crate::counter::{counts_update, header_filter, CountAggregator, Signal};
use crate::embedder::Embedder;
use crate::error::{IngestError, IngestResult, StickyError};
use crate::freeze;
use crate::page_writer::PageWriter;
use crate::worker::{StreamMessage, StreamWorker, WorkerState, WorkerStatus};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use runvault_common::{document, Doc, Document, DocumentKind, PipelineConfig, StreamClass};
use runvault_store::{Collection, DocumentStore, Update, UpdateOne};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

struct Threads {
    aggregator: JoinHandle<IngestResult<()>>,
    event: JoinHandle<IngestResult<()>>,
    datum: JoinHandle<IngestResult<()>>,
}

/// Ingestion pipeline for a single run
pub struct RunPipeline {
    config: PipelineConfig,
    volatile: Arc<dyn DocumentStore>,
    permanent: Arc<dyn DocumentStore>,
    event_tx: Sender<StreamMessage>,
    datum_tx: Sender<StreamMessage>,
    event_status: Arc<WorkerStatus>,
    datum_status: Arc<WorkerStatus>,
    run_uid: Arc<OnceLock<String>>,
    started: AtomicBool,
    frozen: AtomicBool,
    stop_doc: Mutex<Option<Doc>>,
    sticky: Arc<StickyError>,
    wake: Arc<Signal>,
    threads: Mutex<Option<Threads>>,
}

impl RunPipeline {
    /// Validate the configuration and start the background threads.
    pub fn new(
        volatile: Arc<dyn DocumentStore>,
        permanent: Arc<dyn DocumentStore>,
        config: PipelineConfig,
    ) -> IngestResult<Self> {
        config.validate()?;

        let sticky = Arc::new(StickyError::default());
        let run_uid = Arc::new(OnceLock::new());
        let wake = Arc::new(Signal::default());

        let (event_tx, event_rx) = bounded(config.queue_size);
        let (datum_tx, datum_rx) = bounded(config.queue_size);
        let event_status = Arc::new(WorkerStatus::default());
        let datum_status = Arc::new(WorkerStatus::default());

        let spawn_worker = |class: StreamClass,
                            receiver: Receiver<StreamMessage>,
                            status: &Arc<WorkerStatus>|
         -> IngestResult<JoinHandle<IngestResult<()>>> {
            let handle = StreamWorker {
                class,
                receiver,
                embedder: Embedder::new(class, config.embedder_size)?,
                writer: PageWriter::new(
                    class,
                    Arc::clone(&volatile),
                    config.page_size,
                    Arc::clone(&status.indices),
                ),
                status: Arc::clone(status),
                sticky: Arc::clone(&sticky),
                poll_interval: config.poll_interval(),
                max_insert_time: config.max_insert_time(),
            }
            .spawn()?;
            Ok(handle)
        };
        let event = spawn_worker(StreamClass::Event, event_rx, &event_status)?;
        let datum = spawn_worker(StreamClass::Datum, datum_rx, &datum_status)?;

        let aggregator = CountAggregator {
            store: Arc::clone(&volatile),
            run_uid: Arc::clone(&run_uid),
            event: Arc::clone(&event_status.inserted),
            datum: Arc::clone(&datum_status.inserted),
            wake: Arc::clone(&wake),
            sticky: Arc::clone(&sticky),
            interval: config.count_interval(),
        }
        .spawn()?;

        info!(
            "Pipeline started (embedder_size={}, page_size={}, queue_size={})",
            config.embedder_size, config.page_size, config.queue_size
        );

        Ok(Self {
            config,
            volatile,
            permanent,
            event_tx,
            datum_tx,
            event_status,
            datum_status,
            run_uid,
            started: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            stop_doc: Mutex::new(None),
            sticky,
            wake,
            threads: Mutex::new(Some(Threads {
                aggregator,
                event,
                datum,
            })),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Uid of the run being ingested, once `start` has been seen
    pub fn run_uid(&self) -> Option<&str> {
        self.run_uid.get().map(String::as_str)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn worker_status(&self, class: StreamClass) -> &WorkerStatus {
        match class {
            StreamClass::Event => &self.event_status,
            StreamClass::Datum => &self.datum_status,
        }
    }

    pub fn worker_state(&self, class: StreamClass) -> WorkerState {
        self.worker_status(class).state()
    }

    // ---- Ingestion ----

    pub fn start(&self, doc: Doc) -> IngestResult<Doc> {
        self.check_usable()?;
        let run_uid = document::uid(&doc)?.to_string();
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(IngestError::usage(
                "a second start document was received; a pipeline ingests a single run",
            ));
        }

        let update = Update::new()
            .set("start", Value::Object(doc.clone()))
            .set(StreamClass::Event.total_field(), 0)
            .set(StreamClass::Datum.total_field(), 0)
            .set(StreamClass::Event.owner_field(), Value::Array(Vec::new()))
            .set(StreamClass::Datum.owner_field(), Value::Array(Vec::new()));
        self.volatile
            .update_one(Collection::Header, &UpdateOne::upsert(header_filter(&run_uid), update))?;

        info!("Run {} started", run_uid);
        let _ = self.run_uid.set(run_uid);
        Ok(doc)
    }

    pub fn descriptor(&self, doc: Doc) -> IngestResult<Doc> {
        self.push_header(StreamClass::Event.owner_field(), doc)
    }

    pub fn resource(&self, doc: Doc) -> IngestResult<Doc> {
        self.push_header(StreamClass::Datum.owner_field(), doc)
    }

    pub fn event(&self, doc: Doc) -> IngestResult<Doc> {
        self.enqueue(StreamClass::Event, StreamMessage::Document(doc.clone()))?;
        Ok(doc)
    }

    pub fn datum(&self, doc: Doc) -> IngestResult<Doc> {
        self.enqueue(StreamClass::Datum, StreamMessage::Document(doc.clone()))?;
        Ok(doc)
    }

    pub fn event_page(&self, doc: Doc) -> IngestResult<Doc> {
        self.enqueue(StreamClass::Event, StreamMessage::Page(doc.clone()))?;
        Ok(doc)
    }

    pub fn datum_page(&self, doc: Doc) -> IngestResult<Doc> {
        self.enqueue(StreamClass::Datum, StreamMessage::Page(doc.clone()))?;
        Ok(doc)
    }

    /// Record the stop document and freeze the run.
    pub fn stop(&self, doc: Doc) -> IngestResult<Doc> {
        self.check_usable()?;
        *self.stop_doc.lock() = Some(doc.clone());
        self.close()?;
        Ok(doc)
    }

    /// Dispatch a tagged document to the matching call.
    pub fn ingest(&self, document: Document) -> IngestResult<Document> {
        let kind = document.kind();
        let doc = document.into_body();
        let doc = match kind {
            DocumentKind::Start => self.start(doc)?,
            DocumentKind::Stop => self.stop(doc)?,
            DocumentKind::Descriptor => self.descriptor(doc)?,
            DocumentKind::Resource => self.resource(doc)?,
            DocumentKind::Event => self.event(doc)?,
            DocumentKind::Datum => self.datum(doc)?,
            DocumentKind::EventPage => self.event_page(doc)?,
            DocumentKind::DatumPage => self.datum_page(doc)?,
        };
        Ok(Document::from_parts(kind, doc))
    }

    /// Freeze the pipeline's own run.
    pub fn close(&self) -> IngestResult<()> {
        let run_uid = self.current_run()?.to_string();
        self.freeze(&run_uid)
    }

    // ---- Freeze ----

    /// Drain the workers, finalise the header and move the run to the
    /// permanent store. The volatile copy is deleted only after the
    /// permanent copy reads back identical.
    pub fn freeze(&self, run_uid: &str) -> IngestResult<()> {
        if self.frozen.swap(true, Ordering::AcqRel) {
            return Err(IngestError::usage("pipeline is already frozen"));
        }
        info!("Freezing run {}", run_uid);

        self.shutdown_threads();
        let joined = self.join_threads(true);
        let counted = self.write_final_counts(run_uid);

        // Worker failures take precedence over a failed count write
        self.sticky.check()?;
        joined?;
        counted?;
        self.check_drained()?;

        if let Some(stop) = self.stop_doc.lock().take() {
            let update = Update::new().set("stop", Value::Object(stop));
            self.volatile
                .update_one(Collection::Header, &UpdateOne::new(header_filter(run_uid), update))?;
        }

        let run = freeze::copy_run(self.volatile.as_ref(), self.permanent.as_ref(), run_uid)?;
        freeze::delete_run(self.volatile.as_ref(), run_uid)?;
        info!("Run {} frozen: {} documents moved to the permanent store", run_uid, run.len());
        Ok(())
    }

    /// Move a run that was never stopped, e.g. after a failure. Does not
    /// wait for the count aggregator, and writes neither final counts nor a
    /// stop document. After a verified copy the volatile collections are
    /// dropped wholesale.
    pub fn explicit_freeze(&self, run_uid: &str) -> IngestResult<()> {
        if self.frozen.swap(true, Ordering::AcqRel) {
            return Err(IngestError::usage("pipeline is already frozen"));
        }
        info!("Freezing partial run {}", run_uid);

        self.shutdown_threads();
        let joined = self.join_threads(false);

        self.sticky.check()?;
        joined?;
        self.check_drained()?;

        let run = freeze::copy_run(self.volatile.as_ref(), self.permanent.as_ref(), run_uid)?;
        freeze::drop_run_collections(self.volatile.as_ref())?;
        info!(
            "Partial run {} frozen: {} documents moved to the permanent store",
            run_uid,
            run.len()
        );
        Ok(())
    }

    // ---- Internals ----

    fn check_usable(&self) -> IngestResult<()> {
        self.sticky.check()?;
        if self.is_frozen() {
            return Err(IngestError::usage("pipeline is frozen"));
        }
        Ok(())
    }

    fn current_run(&self) -> IngestResult<&str> {
        self.run_uid()
            .ok_or_else(|| IngestError::usage("no start document has been received"))
    }

    fn push_header(&self, field: &'static str, doc: Doc) -> IngestResult<Doc> {
        self.check_usable()?;
        let run_uid = self.current_run()?;
        let update = Update::new().push_each(field, vec![Value::Object(doc.clone())]);
        self.volatile
            .update_one(Collection::Header, &UpdateOne::upsert(header_filter(run_uid), update))?;
        Ok(doc)
    }

    fn enqueue(&self, class: StreamClass, message: StreamMessage) -> IngestResult<()> {
        self.check_usable()?;
        let sender = match class {
            StreamClass::Event => &self.event_tx,
            StreamClass::Datum => &self.datum_tx,
        };
        // Blocks while the queue is full
        sender.send(message).map_err(|_| {
            self.sticky
                .check()
                .err()
                .unwrap_or_else(|| IngestError::usage(format!("{class} worker is not running")))
        })
    }

    fn shutdown_threads(&self) {
        for sender in [&self.event_tx, &self.datum_tx] {
            // A worker that already failed has dropped its receiver
            let _ = sender.send(StreamMessage::Shutdown);
        }
        self.wake.notify();
    }

    /// Join the background threads. Worker errors are already recorded as
    /// the sticky error; only panics are reported here.
    fn join_threads(&self, wait_for_aggregator: bool) -> IngestResult<()> {
        let Some(threads) = self.threads.lock().take() else {
            return Ok(());
        };
        let mut panicked = None;
        if wait_for_aggregator {
            if threads.aggregator.join().is_err() {
                panicked = Some("count");
            }
        } else {
            debug!("Leaving count aggregator to exit on its own");
        }
        for (name, handle) in [("event", threads.event), ("datum", threads.datum)] {
            if handle.join().is_err() {
                panicked.get_or_insert(name);
            }
        }
        match panicked {
            Some(name) => Err(IngestError::WorkerPanicked(name)),
            None => Ok(()),
        }
    }

    fn write_final_counts(&self, run_uid: &str) -> IngestResult<()> {
        let event = &self.event_status.indices;
        let datum = &self.datum_status.indices;
        let update = counts_update(event, datum)
            .set(StreamClass::Event.total_field(), event.total())
            .set(StreamClass::Datum.total_field(), datum.total());
        self.volatile
            .update_one(Collection::Header, &UpdateOne::new(header_filter(run_uid), update))?;
        debug!(
            "Final counts for run {}: {} events, {} datum",
            run_uid,
            event.total(),
            datum.total()
        );
        Ok(())
    }

    fn check_drained(&self) -> IngestResult<()> {
        for (class, sender, status) in [
            (StreamClass::Event, &self.event_tx, &self.event_status),
            (StreamClass::Datum, &self.datum_tx, &self.datum_status),
        ] {
            if !sender.is_empty() {
                return Err(IngestError::integrity(format!(
                    "{class} queue still holds {} messages after shutdown",
                    sender.len()
                )));
            }
            if status.buffered_bytes() != 0 {
                return Err(IngestError::integrity(format!(
                    "{class} page buffer still holds {} bytes after shutdown",
                    status.buffered_bytes()
                )));
            }
        }
        Ok(())
    }
}

impl Drop for RunPipeline {
    fn drop(&mut self) {
        if self.threads.get_mut().is_none() {
            return;
        }
        if !self.is_frozen() {
            warn!("Pipeline dropped before freeze; flushing workers");
        }
        self.shutdown_threads();
        let _ = self.join_threads(true);
    }
}
