//! Ordered single-consumer notification delivery
//!
//! Producers (the telemetry service's threads) submit accepted changes; the
//! queue stamps each with a global sequence number and delivers them to the
//! registered [`ChangeListener`] on one execution context, in submission
//! order, exactly once. Nothing is throttled: every accepted change is
//! delivered unless the queue is closed first.
//!
//! Two execution contexts are supported (see [`DispatchMode`]):
//! - `Thread`: a dispatch thread owned by the queue
//! - `Manual`: the host drains the queue from its own loop with [`DispatchQueue::pump`]
//!
//! In both modes a producer never runs the listener itself.

use crate::cache::Transition;
use crate::config::DispatchMode;
use crate::types::{ChannelId, MeasurementValue, Reading, Result, Timestamp};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

/// A change waiting for (or undergoing) delivery
#[derive(Debug, Clone, PartialEq)]
pub struct PendingNotification {
    /// Global, strictly increasing delivery order
    pub sequence: u64,
    pub channel: ChannelId,
    /// Reading before the change (`None` for the first value)
    pub old: Reading,
    pub new: MeasurementValue,
    /// When the queue accepted the change
    pub accepted_at: Timestamp,
}

/// Application callback receiving change notifications
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, notification: &PendingNotification);
}

impl<F> ChangeListener for F
where
    F: Fn(&PendingNotification) + Send + Sync,
{
    fn on_change(&self, notification: &PendingNotification) {
        self(notification)
    }
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Notifications accepted by `submit`
    pub submitted: u64,
    /// Notifications handed to the dispatch context (with or without a listener)
    pub delivered: u64,
    /// Notifications dropped by `close`
    pub discarded: u64,
}

/// Producer side of the queue
///
/// Sequence stamping and the send happen under this lock, so channel order
/// is sequence order. `close` drops the sender and drains the channel under
/// the same lock.
struct Inlet {
    sender: Option<Sender<PendingNotification>>,
    next_sequence: u64,
    stats: DispatchStats,
}

struct Shared {
    inlet: Mutex<Inlet>,
    receiver: Receiver<PendingNotification>,
    closed: AtomicBool,
    listener: RwLock<Option<Arc<dyn ChangeListener>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            inlet: Mutex::new(Inlet {
                sender: Some(sender),
                next_sequence: 0,
                stats: DispatchStats::default(),
            }),
            receiver,
            closed: AtomicBool::new(false),
            listener: RwLock::new(None),
        }
    }

    /// Run the listener for one dequeued notification outside every lock
    ///
    /// A notification dequeued after `close` is counted as discarded.
    fn deliver(&self, notification: &PendingNotification) -> bool {
        if self.closed.load(Ordering::Acquire) {
            lock(&self.inlet).stats.discarded += 1;
            return false;
        }

        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match listener {
            Some(listener) => {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| listener.on_change(notification)));
                if outcome.is_err() {
                    log::error!(
                        "Change listener panicked on #{} ({}); continuing",
                        notification.sequence,
                        notification.channel
                    );
                }
            }
            None => log::trace!(
                "No listener registered, dropping #{} ({})",
                notification.sequence,
                notification.channel
            ),
        }

        lock(&self.inlet).stats.delivered += 1;
        true
    }

    /// Dispatch thread body: deliver until the sender is dropped by `close`
    fn run(&self) {
        while let Ok(notification) = self.receiver.recv() {
            self.deliver(&notification);
        }
        log::debug!("Dispatch thread exiting");
    }
}

/// The single serialization point between producers and the application
pub struct DispatchQueue {
    shared: Arc<Shared>,
    mode: DispatchMode,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchQueue {
    /// Create a queue; in `Thread` mode this spawns the dispatch thread
    pub fn new(mode: DispatchMode, thread_name: &str) -> Result<Self> {
        let shared = Arc::new(Shared::new());

        let worker = match mode {
            DispatchMode::Thread => {
                let worker_shared = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name(thread_name.to_string())
                    .spawn(move || worker_shared.run())?;
                log::debug!("Dispatch thread '{}' started", thread_name);
                Some(handle)
            }
            DispatchMode::Manual => None,
        };

        Ok(Self {
            shared,
            mode,
            worker: Mutex::new(worker),
        })
    }

    /// Create a queue drained by the host via [`DispatchQueue::pump`]
    pub fn manual() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            mode: DispatchMode::Manual,
            worker: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Register (or replace) the listener; later deliveries go to it
    pub fn set_listener(&self, listener: Arc<dyn ChangeListener>) {
        *self
            .shared
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Enqueue an accepted change
    ///
    /// Returns the assigned sequence number, or `None` if the queue is closed.
    /// Never blocks beyond the enqueue itself.
    pub fn submit(&self, transition: Transition) -> Option<u64> {
        let mut inlet = lock(&self.shared.inlet);
        let sequence = inlet.next_sequence;
        let notification = PendingNotification {
            sequence,
            channel: transition.channel,
            old: transition.old,
            new: transition.new,
            accepted_at: Utc::now(),
        };

        let sent = match &inlet.sender {
            Some(sender) => sender.send(notification).is_ok(),
            None => false,
        };
        if !sent {
            log::debug!("Dispatch queue closed, dropping change of {}", transition.channel);
            return None;
        }

        inlet.next_sequence += 1;
        inlet.stats.submitted += 1;
        Some(sequence)
    }

    /// Deliver everything queued on the calling thread (`Manual` mode)
    ///
    /// Returns the number of notifications delivered. In `Thread` mode the
    /// dispatch thread owns delivery and this returns 0.
    pub fn pump(&self) -> usize {
        if self.mode != DispatchMode::Manual {
            return 0;
        }

        let mut delivered = 0;
        while let Ok(notification) = self.shared.receiver.try_recv() {
            if self.shared.deliver(&notification) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Stop accepting submissions and discard everything still queued
    ///
    /// The discard is one critical section with `submit`: the listener
    /// observes none of the queued notifications, apart from one the
    /// dispatch thread may already be running. Joins the dispatch thread
    /// unless called from it. Returns the number of discarded notifications.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut inlet = lock(&self.shared.inlet);
            if inlet.sender.is_none() {
                return 0;
            }
            self.shared.closed.store(true, Ordering::Release);
            inlet.sender = None;
            let discarded = self.shared.receiver.try_iter().count();
            inlet.stats.discarded += discarded as u64;
            discarded
        };

        if let Some(handle) = lock(&self.worker).take() {
            if handle.thread().id() == thread::current().id() {
                log::debug!("Dispatch queue closed from its own thread, not joining");
            } else if handle.join().is_err() {
                log::error!("Dispatch thread terminated abnormally");
            }
        }

        log::info!("Dispatch queue closed, {} pending notification(s) discarded", discarded);
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of notifications queued and not yet dequeued
    pub fn pending(&self) -> usize {
        self.shared.receiver.len()
    }

    pub fn stats(&self) -> DispatchStats {
        lock(&self.shared.inlet).stats
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn speed(old: Option<f64>, new: f64) -> Transition {
        Transition {
            channel: ChannelId::VehicleSpeed,
            old: old.map(MeasurementValue::Number),
            new: MeasurementValue::Number(new),
        }
    }

    fn recording_listener() -> (Arc<Mutex<Vec<PendingNotification>>>, Arc<dyn ChangeListener>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = move |n: &PendingNotification| sink.lock().unwrap().push(n.clone());
        (seen, Arc::new(listener))
    }

    #[test]
    fn test_manual_pump_delivers_in_sequence() {
        let queue = DispatchQueue::manual();
        let (seen, listener) = recording_listener();
        queue.set_listener(listener);

        assert_eq!(queue.submit(speed(None, 1.0)), Some(0));
        assert_eq!(queue.submit(speed(Some(1.0), 2.0)), Some(1));
        assert_eq!(queue.submit(speed(Some(2.0), 3.0)), Some(2));
        assert!(seen.lock().unwrap().is_empty(), "submit must not deliver synchronously");

        assert_eq!(queue.pump(), 3);
        let seen = seen.lock().unwrap();
        let sequences: Vec<u64> = seen.iter().map(|n| n.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(seen[2].old, Some(MeasurementValue::Number(2.0)));
        assert_eq!(queue.pump(), 0);
    }

    #[test]
    fn test_close_discards_everything_queued() {
        let queue = DispatchQueue::manual();
        let (seen, listener) = recording_listener();
        queue.set_listener(listener);

        for i in 0..5 {
            queue.submit(speed(None, i as f64));
        }
        assert_eq!(queue.close(), 5);
        assert_eq!(queue.pump(), 0);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(queue.submit(speed(None, 9.0)), None);

        let stats = queue.stats();
        assert_eq!(stats.submitted, 5);
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.discarded, 5);
        assert_eq!(queue.close(), 0);
    }

    #[test]
    fn test_thread_mode_delivers_off_the_producer_thread() {
        let queue = DispatchQueue::new(DispatchMode::Thread, "test-dispatch").unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        queue.set_listener(Arc::new(move |n: &PendingNotification| {
            let name = thread::current().name().map(str::to_string);
            tx.lock().unwrap().send((n.sequence, name)).unwrap();
        }));

        for i in 0..10 {
            queue.submit(speed(None, i as f64));
        }

        for expected in 0..10 {
            let (sequence, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(sequence, expected);
            assert_eq!(name.as_deref(), Some("test-dispatch"));
        }
        queue.close();
    }

    #[test]
    fn test_missing_listener_drops_without_stalling() {
        let queue = DispatchQueue::manual();
        queue.submit(speed(None, 1.0));
        assert_eq!(queue.pump(), 1);

        let (seen, listener) = recording_listener();
        queue.set_listener(listener);
        queue.submit(speed(Some(1.0), 2.0));
        assert_eq!(queue.pump(), 1);
        assert_eq!(seen.lock().unwrap()[0].sequence, 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_delivery() {
        let queue = DispatchQueue::manual();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        queue.set_listener(Arc::new(move |n: &PendingNotification| {
            *counter.lock().unwrap() += 1;
            if n.sequence == 0 {
                panic!("listener failure");
            }
        }));

        queue.submit(speed(None, 1.0));
        queue.submit(speed(Some(1.0), 2.0));
        assert_eq!(queue.pump(), 2);
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn test_close_wakes_an_idle_dispatch_thread() {
        let queue = DispatchQueue::new(DispatchMode::Thread, "idle-dispatch").unwrap();
        let (seen, listener) = recording_listener();
        queue.set_listener(listener);

        queue.submit(speed(None, 1.0));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while queue.stats().delivered == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(queue.close(), 0);
        assert!(queue.is_closed());
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.submit(speed(Some(1.0), 2.0)), None);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(queue.stats().delivered, 1);
    }
}

