//! Trace replay telemetry service
//!
//! Replays an OpenXC JSON-lines trace (one `{"name", "value", "event",
//! "timestamp"}` object per line) as if it came from a live vehicle. Each
//! connection gets its own replay thread which reports `connected`, streams
//! the records to the subscribed sinks and, optionally, reports
//! `disconnected` at the end of the trace.

use crate::connection::{ConnectionHandle, MeasurementSink, ServiceCallbacks, TelemetryService};
use crate::types::{BridgeError, MeasurementType, RawMeasurement, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest pause between two records in realtime mode
const MAX_REALTIME_GAP: Duration = Duration::from_secs(5);

/// Upper bound on one wait in `wait_until_finished`; several waiters share
/// the completion channel
const FINISH_POLL: Duration = Duration::from_millis(20);

/// Parse a JSON-lines trace
///
/// Blank lines are skipped; malformed lines are logged and skipped so one
/// corrupt record does not invalidate a whole drive.
pub fn parse_trace<R: BufRead>(reader: R) -> Result<Vec<RawMeasurement>> {
    let mut records = Vec::new();
    let mut skipped = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawMeasurement>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                log::warn!("Skipping trace line {}: {}", index + 1, e);
            }
        }
    }

    if records.is_empty() && skipped > 0 {
        return Err(BridgeError::TraceParseError(format!(
            "no valid record among {} line(s)",
            skipped
        )));
    }

    log::debug!("Parsed {} trace record(s), {} skipped", records.len(), skipped);
    Ok(records)
}

/// Load a JSON-lines trace file
pub fn load_trace(path: &Path) -> Result<Vec<RawMeasurement>> {
    log::info!("Loading trace file: {:?}", path);
    let file = File::open(path)?;
    parse_trace(BufReader::new(file))
}

/// Replay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records handed to a subscription sink
    pub delivered: u64,
    /// Records without a matching subscription
    pub unrouted: u64,
}

type SinkTable = Arc<Mutex<HashMap<MeasurementType, MeasurementSink>>>;
type SessionTable = Arc<Mutex<HashMap<ConnectionHandle, Session>>>;

struct Session {
    sinks: SinkTable,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

/// Replay thread completion tracking
struct Progress {
    started: AtomicU64,
    finished: AtomicU64,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
}

impl Progress {
    fn new() -> Self {
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        Self {
            started: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            done_tx,
            done_rx,
        }
    }

    fn start(&self) {
        self.started.fetch_add(1, Ordering::AcqRel);
    }

    fn finish(&self) {
        self.finished.fetch_add(1, Ordering::AcqRel);
        let _ = self.done_tx.send(());
    }

    fn all_finished(&self) -> bool {
        let started = self.started.load(Ordering::Acquire);
        started > 0 && self.finished.load(Ordering::Acquire) >= started
    }
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    unrouted: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`TelemetryService`] backed by a recorded trace
pub struct TraceService {
    records: Arc<Vec<RawMeasurement>>,
    realtime: bool,
    disconnect_at_end: bool,
    supported: Option<Vec<MeasurementType>>,
    next_handle: AtomicU64,
    sessions: SessionTable,
    progress: Arc<Progress>,
    counters: Arc<Counters>,
}

impl TraceService {
    /// Create a service replaying `records` as fast as possible
    pub fn new(records: Vec<RawMeasurement>) -> Self {
        Self {
            records: Arc::new(records),
            realtime: false,
            disconnect_at_end: false,
            supported: None,
            next_handle: AtomicU64::new(1),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            progress: Arc::new(Progress::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create a service from a trace file
    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(Self::new(load_trace(path)?))
    }

    /// Builder method: pace records by their timestamps
    pub fn with_realtime(mut self, enabled: bool) -> Self {
        self.realtime = enabled;
        self
    }

    /// Builder method: report a disconnect once the trace is exhausted
    pub fn with_disconnect_at_end(mut self, enabled: bool) -> Self {
        self.disconnect_at_end = enabled;
        self
    }

    /// Builder method: reject subscriptions outside this list
    pub fn with_supported(mut self, measurements: Vec<MeasurementType>) -> Self {
        self.supported = Some(measurements);
        self
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Connections that are open and not yet released
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn stats(&self) -> ReplayStats {
        ReplayStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            unrouted: self.counters.unrouted.load(Ordering::Relaxed),
        }
    }

    /// Block until every started replay has finished
    ///
    /// Returns false on timeout or if no replay was started.
    pub fn wait_until_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.progress.all_finished() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = self
                .progress
                .done_rx
                .recv_timeout((deadline - now).min(FINISH_POLL));
        }
    }

    fn replay(
        records: &[RawMeasurement],
        sinks: &SinkTable,
        stop: &AtomicBool,
        realtime: bool,
        counters: &Counters,
    ) {
        let mut previous: Option<f64> = None;

        for record in records {
            if stop.load(Ordering::Acquire) {
                log::debug!("Replay stopped");
                return;
            }

            if realtime {
                if let (Some(prev), Some(now)) = (previous, record.timestamp) {
                    let gap = (now - prev).clamp(0.0, MAX_REALTIME_GAP.as_secs_f64());
                    thread::sleep(Duration::from_secs_f64(gap));
                }
                previous = record.timestamp.or(previous);
            }

            let sink = MeasurementType::from_name(&record.name)
                .and_then(|measurement| lock(sinks).get(&measurement).cloned());
            match sink {
                Some(sink) => {
                    sink(record);
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    counters.unrouted.fetch_add(1, Ordering::Relaxed);
                    log::trace!("No subscription for '{}'", record.name);
                }
            }
        }
    }
}

impl TelemetryService for TraceService {
    fn connect(&self, callbacks: ServiceCallbacks) -> Result<ConnectionHandle> {
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let sinks: SinkTable = Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));

        // Registered before the thread starts so `subscribe` finds the session
        lock(&self.sessions).insert(
            handle,
            Session {
                sinks: Arc::clone(&sinks),
                stop: Arc::clone(&stop),
                worker: None,
            },
        );
        self.progress.start();

        let records = Arc::clone(&self.records);
        let progress = Arc::clone(&self.progress);
        let counters = Arc::clone(&self.counters);
        let sessions = Arc::clone(&self.sessions);
        let realtime = self.realtime;
        let disconnect_at_end = self.disconnect_at_end;

        let spawned = thread::Builder::new()
            .name(format!("trace-replay-{}", handle.0))
            .spawn(move || {
                callbacks.connected(handle);
                Self::replay(&records, &sinks, &stop, realtime, &counters);
                if disconnect_at_end && !stop.load(Ordering::Acquire) {
                    log::info!("End of trace reached");
                    // The manager forgets the handle on `disconnected`
                    let finished_session = lock(&sessions).remove(&handle);
                    if let Some(session) = finished_session {
                        lock(&session.sinks).clear();
                    }
                    callbacks.disconnected(handle);
                }
                progress.finish();
            });

        match spawned {
            Ok(worker) => {
                if let Some(session) = lock(&self.sessions).get_mut(&handle) {
                    session.worker = Some(worker);
                }
                log::info!("Trace replay connected ({} records)", self.records.len());
                Ok(handle)
            }
            Err(e) => {
                lock(&self.sessions).remove(&handle);
                self.progress.finish();
                Err(BridgeError::ConnectError(format!("cannot start replay thread: {}", e)))
            }
        }
    }

    fn subscribe(
        &self,
        handle: ConnectionHandle,
        measurement: MeasurementType,
        sink: MeasurementSink,
    ) -> Result<()> {
        if let Some(supported) = &self.supported {
            if !supported.contains(&measurement) {
                return Err(BridgeError::SubscriptionError {
                    measurement,
                    reason: "not published by this vehicle".to_string(),
                });
            }
        }

        let sessions = lock(&self.sessions);
        let session = sessions.get(&handle).ok_or_else(|| BridgeError::SubscriptionError {
            measurement,
            reason: format!("unknown connection {:?}", handle),
        })?;
        lock(&session.sinks).insert(measurement, sink);
        Ok(())
    }

    fn disconnect(&self, handle: ConnectionHandle) {
        let session = lock(&self.sessions).remove(&handle);
        let Some(mut session) = session else {
            log::debug!("Disconnect of unknown or closed {:?}", handle);
            return;
        };

        session.stop.store(true, Ordering::Release);
        lock(&session.sinks).clear();
        if let Some(worker) = session.worker.take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                log::error!("Trace replay thread terminated abnormally");
            }
        }
        log::info!("Trace replay {:?} disconnected", handle);
    }
}

impl Drop for TraceService {
    fn drop(&mut self) {
        let handles: Vec<ConnectionHandle> = lock(&self.sessions).keys().copied().collect();
        for handle in handles {
            self.disconnect(handle);
        }
    }
}
