//! Vehicle Bridge Library
//!
//! Connects an application to a long-lived vehicle telemetry service and
//! turns its high-frequency measurement stream into deduplicated,
//! edge-triggered "value changed" notifications.
//!
//! # Architecture
//!
//! - [`ChannelCache`] holds the last accepted value of every channel
//! - [`ChangeDetector`] decodes raw samples and compares them with the cache
//! - [`ConnectionManager`] connects, subscribes and reconnects on demand
//! - [`DispatchQueue`] delivers notifications in order on one execution context
//! - [`Bridge`] wires the above together for one host session
//!
//! The library does NOT:
//! - Parse the service's wire protocol (samples arrive as parsed JSON values)
//! - Persist history
//! - Retry connections on a timer (only host lifecycle events reconnect)
//!
//! # Example Usage
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use vehicle_bridge::{Bridge, BridgeConfig, ChannelId, PendingNotification, TraceService};
//!
//! let service = TraceService::from_file(Path::new("drive.json")).unwrap();
//! let bridge = Bridge::new(Arc::new(service), BridgeConfig::new()).unwrap();
//!
//! bridge.register_on_change(|change: &PendingNotification| {
//!     println!("{} is now {}", change.channel, change.new);
//! });
//!
//! bridge.create();
//! bridge.on_foreground();
//!
//! if let Some(speed) = bridge.current_value(ChannelId::VehicleSpeed) {
//!     println!("Vehicle speed: {}", speed);
//! }
//!
//! bridge.on_destroy();
//! ```

// Public modules
pub mod bridge;
pub mod cache;
pub mod config;
pub mod connection;
pub mod detector;
pub mod dispatch;
pub mod trace;
pub mod types;

// Re-export main types for convenience
pub use bridge::{Bridge, BridgeStats};
pub use cache::{ChannelCache, Transition};
pub use config::{BridgeConfig, DispatchMode};
pub use connection::{
    ConnectionHandle, ConnectionManager, ConnectionState, MeasurementSink, ServiceCallbacks,
    TelemetryService,
};
pub use detector::{ChangeDetector, DetectorStats};
pub use dispatch::{ChangeListener, DispatchQueue, DispatchStats, PendingNotification};
pub use trace::{ReplayStats, TraceService};
pub use types::{
    BridgeError, ChannelId, DoorId, GearPosition, IgnitionState, MeasurementType,
    MeasurementValue, RawMeasurement, Reading, Result, Timestamp, ValueKind,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
