//! Bridge composition root
//!
//! Wires the cache, change detector, dispatch queue and connection manager
//! of one host session together. The host drives the bridge through its
//! lifecycle methods; application code reads current values and registers
//! the change listener.

use crate::cache::ChannelCache;
use crate::config::{BridgeConfig, DispatchMode};
use crate::connection::{ConnectionManager, ConnectionState, TelemetryService};
use crate::detector::{ChangeDetector, DetectorStats};
use crate::dispatch::{ChangeListener, DispatchQueue, DispatchStats};
use crate::types::{ChannelId, MeasurementType, MeasurementValue, Reading, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Constructed,
    Created,
    Destroyed,
}

/// Combined counters of one bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStats {
    pub connection: ConnectionState,
    pub subscribed: Vec<MeasurementType>,
    pub detector: DetectorStats,
    pub dispatch: DispatchStats,
}

/// One bridge per host session
pub struct Bridge {
    config: BridgeConfig,
    cache: Arc<ChannelCache>,
    queue: Arc<DispatchQueue>,
    detector: Arc<ChangeDetector>,
    connection: ConnectionManager,
    lifecycle: Mutex<Lifecycle>,
}

impl Bridge {
    /// Build a bridge on top of a telemetry service client
    ///
    /// Nothing connects until [`Bridge::on_foreground`].
    pub fn new(service: Arc<dyn TelemetryService>, config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(ChannelCache::new());
        let queue = Arc::new(DispatchQueue::new(
            config.dispatch_mode,
            &config.dispatch_thread_name,
        )?);
        let detector = Arc::new(ChangeDetector::new(Arc::clone(&cache), Arc::clone(&queue)));
        let connection =
            ConnectionManager::new(service, Arc::clone(&detector), config.subscription_list());

        Ok(Self {
            config,
            cache,
            queue,
            detector,
            connection,
            lifecycle: Mutex::new(Lifecycle::Constructed),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // ---- host lifecycle ----

    /// Host created the component
    pub fn create(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if *lifecycle == Lifecycle::Constructed {
            *lifecycle = Lifecycle::Created;
            log::info!(
                "Vehicle bridge created ({} measurement types, {:?} dispatch)",
                self.config.subscription_list().len(),
                self.config.dispatch_mode
            );
        }
    }

    /// Host became active: connect if nothing is live
    ///
    /// The lifecycle lock is held until the connect attempt has started, so
    /// a concurrent `on_destroy` either sees the attempt and tears it down or
    /// prevents it.
    pub fn on_foreground(&self) -> ConnectionState {
        let lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if *lifecycle == Lifecycle::Destroyed {
            log::warn!("Foreground after destroy ignored");
            return ConnectionState::Disconnected;
        }
        self.connection.ensure_connected()
    }

    /// Host went to the background; the connection is kept
    pub fn on_background(&self) {
        log::debug!("Background (connection {})", self.connection.state());
    }

    /// Host stopped; the connection is kept
    pub fn on_stop(&self) {
        log::debug!("Stop (connection {})", self.connection.state());
    }

    /// Host is going away: stop accepting samples, discard queued
    /// notifications, release the connection and reset every channel to no
    /// reading
    ///
    /// Idempotent and safe to call before `create`.
    pub fn on_destroy(&self) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            if *lifecycle == Lifecycle::Destroyed {
                return;
            }
            *lifecycle = Lifecycle::Destroyed;
        }

        self.detector.close();
        let discarded = self.queue.close();
        self.connection.teardown();
        self.cache.clear();
        log::info!("Vehicle bridge destroyed ({} notification(s) discarded)", discarded);
    }

    // ---- application interface ----

    /// Last accepted value of a channel, `None` before the first reading
    pub fn current_value(&self, channel: ChannelId) -> Reading {
        self.cache.get(channel)
    }

    /// Every channel that has a reading
    pub fn snapshot(&self) -> BTreeMap<ChannelId, MeasurementValue> {
        self.cache.snapshot()
    }

    /// Register the listener receiving change notifications
    pub fn register_on_change<L>(&self, listener: L)
    where
        L: ChangeListener + 'static,
    {
        self.queue.set_listener(Arc::new(listener));
    }

    /// Deliver queued notifications on the calling thread (`Manual` dispatch)
    pub fn pump(&self) -> usize {
        if self.queue.mode() != DispatchMode::Manual {
            log::debug!("pump() ignored, notifications are delivered by the dispatch thread");
        }
        self.queue.pump()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            connection: self.connection.state(),
            subscribed: self.connection.subscribed(),
            detector: self.detector.stats(),
            dispatch: self.queue.stats(),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.on_destroy();
    }
}
