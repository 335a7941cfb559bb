//! Connection lifecycle to the telemetry service
//!
//! The [`ConnectionManager`] owns the single [`ConnectionState`] of a bridge.
//! It connects when the host becomes active and nothing is live, subscribes
//! every configured measurement type once the service reports the
//! connection, and resets to `Disconnected` on teardown or when the service
//! drops the connection. Retries are driven only by host lifecycle events.
//!
//! Service callbacks may arrive on any thread, including synchronously from
//! inside `connect`, `subscribe` or `disconnect`. The manager therefore
//! never calls into the service while holding its state lock, and tags every
//! connection attempt so callbacks belonging to a superseded attempt are
//! ignored.

use crate::detector::ChangeDetector;
use crate::types::{BridgeError, MeasurementType, RawMeasurement, Result};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Opaque identifier of a live service connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// Connection state of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Callback receiving the raw samples of one subscription
pub type MeasurementSink = Arc<dyn Fn(&RawMeasurement) + Send + Sync>;

/// Client interface of the external telemetry service
///
/// Implementations deliver raw samples to subscription sinks on their own
/// thread(s) and report connection changes through [`ServiceCallbacks`].
/// `disconnect` must tolerate a handle that is already closed.
pub trait TelemetryService: Send + Sync {
    /// Start connecting; `callbacks.connected` signals success
    fn connect(&self, callbacks: ServiceCallbacks) -> Result<ConnectionHandle>;

    /// Route samples of `measurement` to `sink`
    ///
    /// Fails with [`BridgeError::SubscriptionError`] when the service does not
    /// support the measurement.
    fn subscribe(
        &self,
        handle: ConnectionHandle,
        measurement: MeasurementType,
        sink: MeasurementSink,
    ) -> Result<()>;

    /// Release a connection
    fn disconnect(&self, handle: ConnectionHandle);
}

/// Asynchronous connection callbacks handed to [`TelemetryService::connect`]
///
/// Holds only a weak reference to the manager, so a service keeping these
/// around does not keep a torn-down bridge alive.
#[derive(Clone)]
pub struct ServiceCallbacks {
    manager: Weak<ManagerInner>,
    attempt: u64,
}

impl ServiceCallbacks {
    /// The service accepted the connection
    pub fn connected(&self, handle: ConnectionHandle) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_connected(self.attempt, handle);
        }
    }

    /// The service closed the connection
    pub fn disconnected(&self, handle: ConnectionHandle) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_disconnected(self.attempt, handle);
        }
    }

    /// Connection attempt these callbacks belong to
    pub fn attempt(&self) -> u64 {
        self.attempt
    }
}

impl fmt::Debug for ServiceCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCallbacks")
            .field("attempt", &self.attempt)
            .field("live", &(self.manager.strong_count() > 0))
            .finish()
    }
}

#[derive(Debug)]
struct Link {
    state: ConnectionState,
    attempt: u64,
    handle: Option<ConnectionHandle>,
    subscribed: Vec<MeasurementType>,
}

struct ManagerInner {
    service: Arc<dyn TelemetryService>,
    detector: Arc<ChangeDetector>,
    measurements: Vec<MeasurementType>,
    link: Mutex<Link>,
}

impl ManagerInner {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_connected(&self, attempt: u64, handle: ConnectionHandle) {
        {
            let mut link = self.link();
            if link.attempt != attempt || link.state != ConnectionState::Connecting {
                log::debug!(
                    "Ignoring connected callback of attempt {} while {} (attempt {})",
                    attempt,
                    link.state,
                    link.attempt
                );
                return;
            }
            link.state = ConnectionState::Connected;
            link.handle = Some(handle);
            link.subscribed.clear();
        }

        log::info!("Connected to telemetry service ({:?})", handle);
        self.subscribe_all(attempt, handle);
    }

    /// Subscribe every configured measurement in one batch
    ///
    /// A rejected measurement is logged and skipped; the rest still subscribe.
    /// The batch stops early once `attempt` is no longer the live connection.
    fn subscribe_all(&self, attempt: u64, handle: ConnectionHandle) {
        let mut accepted = Vec::with_capacity(self.measurements.len());

        for &measurement in &self.measurements {
            if !self.is_live(attempt) {
                log::info!(
                    "Connection attempt {} ended during subscription, {} of {} subscribed",
                    attempt,
                    accepted.len(),
                    self.measurements.len()
                );
                return;
            }

            let detector = Arc::clone(&self.detector);
            let sink: MeasurementSink =
                Arc::new(move |raw: &RawMeasurement| detector.on_raw_measurement(measurement, raw));

            match self.service.subscribe(handle, measurement, sink) {
                Ok(()) => accepted.push(measurement),
                Err(e @ BridgeError::SubscriptionError { .. }) => log::warn!("{}", e),
                Err(e) => log::warn!("Subscription to {} failed: {}", measurement, e),
            }
        }

        log::info!(
            "Subscribed {}/{} measurement types",
            accepted.len(),
            self.measurements.len()
        );

        let mut link = self.link();
        if link.attempt == attempt && link.state == ConnectionState::Connected {
            link.subscribed = accepted;
        }
    }

    fn is_live(&self, attempt: u64) -> bool {
        let link = self.link();
        link.attempt == attempt && link.state == ConnectionState::Connected
    }

    fn on_disconnected(&self, attempt: u64, handle: ConnectionHandle) {
        let mut link = self.link();
        if link.attempt != attempt || link.state == ConnectionState::Disconnected {
            log::debug!("Ignoring disconnected callback of attempt {}", attempt);
            return;
        }
        if link.handle.is_some_and(|current| current != handle) {
            log::debug!("Ignoring disconnected callback for foreign {:?}", handle);
            return;
        }

        link.state = ConnectionState::Disconnected;
        link.handle = None;
        link.subscribed.clear();
        log::info!(
            "{} ({:?}); reconnecting on next foreground",
            BridgeError::UnexpectedDisconnect,
            handle
        );
    }
}

/// Owner of the connection state machine of one bridge
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a disconnected manager
    ///
    /// `measurements` is the batch subscribed on every successful connect.
    pub fn new(
        service: Arc<dyn TelemetryService>,
        detector: Arc<ChangeDetector>,
        measurements: Vec<MeasurementType>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                service,
                detector,
                measurements,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    attempt: 0,
                    handle: None,
                    subscribed: Vec::new(),
                }),
            }),
        }
    }

    /// Connect unless a connection is live or in progress
    ///
    /// Connect failures are logged and leave the manager `Disconnected`.
    /// Returns the state after the call.
    pub fn ensure_connected(&self) -> ConnectionState {
        let attempt = {
            let mut link = self.inner.link();
            if link.state != ConnectionState::Disconnected {
                log::debug!("Already {}, not reconnecting", link.state);
                return link.state;
            }
            link.state = ConnectionState::Connecting;
            link.attempt += 1;
            link.handle = None;
            link.attempt
        };

        log::info!("Connecting to telemetry service (attempt {})", attempt);
        let callbacks = ServiceCallbacks {
            manager: Arc::downgrade(&self.inner),
            attempt,
        };

        match self.inner.service.connect(callbacks) {
            Ok(handle) => {
                let superseded = {
                    let mut link = self.inner.link();
                    if link.attempt != attempt {
                        true
                    } else {
                        if link.state == ConnectionState::Connecting && link.handle.is_none() {
                            link.handle = Some(handle);
                        }
                        false
                    }
                };
                if superseded {
                    log::info!("Connection attempt {} torn down while connecting, releasing", attempt);
                    self.inner.service.disconnect(handle);
                }
            }
            Err(e) => {
                log::warn!("{}; staying disconnected until next foreground", e);
                let mut link = self.inner.link();
                if link.attempt == attempt && link.state == ConnectionState::Connecting {
                    link.state = ConnectionState::Disconnected;
                    link.handle = None;
                }
            }
        }

        self.state()
    }

    /// Drop the connection and release the handle, if any
    ///
    /// Invalidates every outstanding callback of the current attempt.
    pub fn teardown(&self) {
        let (previous, handle) = {
            let mut link = self.inner.link();
            let previous = link.state;
            link.attempt += 1;
            link.state = ConnectionState::Disconnected;
            link.subscribed.clear();
            (previous, link.handle.take())
        };

        match handle {
            Some(handle) => {
                log::info!("Releasing telemetry connection {:?} (was {})", handle, previous);
                self.inner.service.disconnect(handle);
            }
            None => log::debug!("Teardown with no connection handle (was {})", previous),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link().state
    }

    /// Handle of the live or pending connection
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.inner.link().handle
    }

    /// Measurement types accepted by the service in the last subscription batch
    pub fn subscribed(&self) -> Vec<MeasurementType> {
        self.inner.link().subscribed.clone()
    }
}
