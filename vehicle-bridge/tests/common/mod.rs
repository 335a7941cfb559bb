//! Shared test fixtures: a scripted telemetry service and a recording listener

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use vehicle_bridge::{
    Bridge, BridgeConfig, BridgeError, ConnectionHandle, DispatchMode, MeasurementSink,
    MeasurementType, PendingNotification, RawMeasurement, Result, ServiceCallbacks,
    TelemetryService,
};

/// Telemetry service driven step by step from the test
#[derive(Default)]
pub struct ScriptedService {
    fail_connect: AtomicBool,
    rejected: Mutex<Vec<MeasurementType>>,
    next_handle: AtomicU64,
    current: Mutex<Option<(ConnectionHandle, ServiceCallbacks)>>,
    sinks: Mutex<HashMap<MeasurementType, MeasurementSink>>,
    connect_calls: AtomicU64,
    subscribe_calls: Mutex<Vec<MeasurementType>>,
    released: Mutex<Vec<ConnectionHandle>>,
}

impl ScriptedService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Service that rejects subscriptions to `measurements`
    pub fn rejecting(measurements: Vec<MeasurementType>) -> Arc<Self> {
        let service = Self::default();
        *service.rejected.lock().unwrap() = measurements;
        Arc::new(service)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Report the pending connection as established
    pub fn acknowledge(&self) {
        let current = self.current.lock().unwrap().clone();
        let (handle, callbacks) = current.expect("no pending connection");
        callbacks.connected(handle);
    }

    /// Drop the live connection from the service side
    pub fn drop_connection(&self) {
        let current = self.current.lock().unwrap().take();
        self.sinks.lock().unwrap().clear();
        let (handle, callbacks) = current.expect("no live connection");
        callbacks.disconnected(handle);
    }

    /// Deliver a raw sample to its subscription; false if nothing subscribed
    pub fn emit(&self, raw: RawMeasurement) -> bool {
        let sink = MeasurementType::from_name(&raw.name)
            .and_then(|measurement| self.sinks.lock().unwrap().get(&measurement).cloned());
        match sink {
            Some(sink) => {
                sink(&raw);
                true
            }
            None => false,
        }
    }

    /// The sink currently subscribed to `measurement`, kept by the caller
    pub fn sink(&self, measurement: MeasurementType) -> Option<MeasurementSink> {
        self.sinks.lock().unwrap().get(&measurement).cloned()
    }

    pub fn connect_calls(&self) -> u64 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> Vec<MeasurementType> {
        self.subscribe_calls.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<ConnectionHandle> {
        self.released.lock().unwrap().clone()
    }
}

impl TelemetryService for ScriptedService {
    fn connect(&self, callbacks: ServiceCallbacks) -> Result<ConnectionHandle> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectError("vehicle interface not found".to_string()));
        }
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        *self.current.lock().unwrap() = Some((handle, callbacks));
        Ok(handle)
    }

    fn subscribe(
        &self,
        _handle: ConnectionHandle,
        measurement: MeasurementType,
        sink: MeasurementSink,
    ) -> Result<()> {
        self.subscribe_calls.lock().unwrap().push(measurement);
        if self.rejected.lock().unwrap().contains(&measurement) {
            return Err(BridgeError::SubscriptionError {
                measurement,
                reason: "unsupported by vehicle".to_string(),
            });
        }
        self.sinks.lock().unwrap().insert(measurement, sink);
        Ok(())
    }

    fn disconnect(&self, handle: ConnectionHandle) {
        self.released.lock().unwrap().push(handle);
        self.sinks.lock().unwrap().clear();
    }
}

/// Listener that records every delivered notification
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<PendingNotification>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(&self) -> impl Fn(&PendingNotification) + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |notification: &PendingNotification| seen.lock().unwrap().push(notification.clone())
    }

    pub fn seen(&self) -> Vec<PendingNotification> {
        self.seen.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

/// Build, create, foreground and acknowledge a bridge on `service`
pub fn connected_bridge(service: &Arc<ScriptedService>, config: BridgeConfig) -> Bridge {
    let bridge = Bridge::new(Arc::clone(service) as Arc<dyn TelemetryService>, config).unwrap();
    bridge.create();
    bridge.on_foreground();
    service.acknowledge();
    bridge
}

pub fn manual_config() -> BridgeConfig {
    BridgeConfig::new().with_dispatch_mode(DispatchMode::Manual)
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
