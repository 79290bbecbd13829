//! Per-stream counters and the count aggregator.
//!
//! Each counter has a single writer (the worker owning the stream class);
//! readers take snapshots. The aggregator periodically copies the inserted
//! counts into the run header so a run being ingested reports progress.

use crate::error::{IngestResult, StickyError};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use runvault_common::StreamClass;
use runvault_store::{Collection, DocumentStore, Filter, Update, UpdateOne};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

/// Concurrent stream id -> count map
#[derive(Debug, Default)]
pub struct StreamCounters {
    counts: DashMap<String, u64>,
}

impl StreamCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, stream: &str, n: u64) {
        *self.counts.entry(stream.to_string()).or_insert(0) += n;
    }

    pub fn set(&self, stream: &str, value: u64) {
        self.counts.insert(stream.to_string(), value);
    }

    pub fn get(&self, stream: &str) -> u64 {
        self.counts.get(stream).map_or(0, |count| *count)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|entry| *entry.value()).sum()
    }

    /// Counts as a JSON object, for the run header
    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .snapshot()
            .into_iter()
            .map(|(stream, count)| (stream, Value::from(count)))
            .collect();
        Value::Object(map)
    }
}

/// One-shot wake-up flag. Once notified it stays set.
#[derive(Debug, Default)]
pub struct Signal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn notify(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    /// Wait up to `timeout`; returns true if the signal is set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock();
        if !*set {
            self.cond.wait_for(&mut set, timeout);
        }
        *set
    }
}

/// Header update writing the per-stream count maps
pub(crate) fn counts_update(event: &StreamCounters, datum: &StreamCounters) -> Update {
    Update::new()
        .set(StreamClass::Event.counts_field(), event.to_value())
        .set(StreamClass::Datum.counts_field(), datum.to_value())
}

pub(crate) fn header_filter(run_uid: &str) -> Filter {
    Filter::new().eq("run_id", run_uid)
}

/// Background task mirroring inserted counts into the run header
pub(crate) struct CountAggregator {
    pub store: Arc<dyn DocumentStore>,
    pub run_uid: Arc<OnceLock<String>>,
    pub event: Arc<StreamCounters>,
    pub datum: Arc<StreamCounters>,
    pub wake: Arc<Signal>,
    pub sticky: Arc<StickyError>,
    pub interval: Duration,
}

impl CountAggregator {
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<IngestResult<()>>> {
        thread::Builder::new()
            .name("runvault-count".to_string())
            .spawn(move || self.run())
    }

    fn run(self) -> IngestResult<()> {
        let mut last = (0, 0);
        loop {
            if self.wake.wait(self.interval) {
                debug!("Count aggregator stopping");
                return Ok(());
            }
            let Some(run_uid) = self.run_uid.get() else {
                continue;
            };
            let totals = (self.event.total(), self.datum.total());
            if totals.0 <= last.0 && totals.1 <= last.1 {
                continue;
            }
            if let Err(e) = self.write(run_uid) {
                error!("Count aggregator failed for run {}: {}", run_uid, e);
                return Err(self.sticky.record("count", e));
            }
            debug!(
                "Updated counts for run {}: {} events, {} datum",
                run_uid, totals.0, totals.1
            );
            last = totals;
        }
    }

    fn write(&self, run_uid: &str) -> IngestResult<()> {
        let op = UpdateOne::new(header_filter(run_uid), counts_update(&self.event, &self.datum));
        self.store.update_one(Collection::Header, &op)?;
        Ok(())
    }
}
