//! Change detection
//!
//! Turns the raw measurement stream into edge-triggered notifications. Every
//! measurement type goes through the same path: decode by its declared value
//! kind, compare-and-replace in the [`ChannelCache`], and on change submit the
//! transition to the [`DispatchQueue`]. A malformed sample is logged and
//! dropped; it never interrupts the stream.

use crate::cache::ChannelCache;
use crate::dispatch::DispatchQueue;
use crate::types::{
    BridgeError, ChannelId, DoorId, GearPosition, IgnitionState, MeasurementType,
    MeasurementValue, RawMeasurement, Result, ValueKind,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Decodes one raw sample into the channel it updates and its value
type DecodeFn = fn(MeasurementType, &RawMeasurement) -> Result<(ChannelId, MeasurementValue)>;

/// Decode function for each value kind
fn decoder_for(kind: ValueKind) -> DecodeFn {
    match kind {
        ValueKind::Numeric => decode_numeric,
        ValueKind::Boolean => decode_boolean,
        ValueKind::Gear => decode_gear,
        ValueKind::Ignition => decode_ignition,
        ValueKind::DoorStatus => decode_door,
    }
}

fn mismatch(measurement: MeasurementType, reason: impl Into<String>) -> BridgeError {
    BridgeError::DecodeError {
        measurement,
        reason: reason.into(),
    }
}

fn direct_channel(measurement: MeasurementType) -> Result<ChannelId> {
    ChannelId::for_measurement(measurement)
        .ok_or_else(|| mismatch(measurement, "measurement has no direct channel"))
}

fn decode_numeric(
    measurement: MeasurementType,
    raw: &RawMeasurement,
) -> Result<(ChannelId, MeasurementValue)> {
    let value = raw
        .value
        .as_f64()
        .ok_or_else(|| mismatch(measurement, format!("expected a number, got {}", raw.value)))?;
    if !value.is_finite() {
        return Err(mismatch(measurement, "number is not finite"));
    }
    Ok((direct_channel(measurement)?, MeasurementValue::Number(value)))
}

fn decode_boolean(
    measurement: MeasurementType,
    raw: &RawMeasurement,
) -> Result<(ChannelId, MeasurementValue)> {
    let value = raw
        .value
        .as_bool()
        .ok_or_else(|| mismatch(measurement, format!("expected a boolean, got {}", raw.value)))?;
    Ok((direct_channel(measurement)?, MeasurementValue::Flag(value)))
}

fn symbol<'a>(measurement: MeasurementType, value: &'a serde_json::Value) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| mismatch(measurement, format!("expected a symbol, got {}", value)))
}

fn decode_gear(
    measurement: MeasurementType,
    raw: &RawMeasurement,
) -> Result<(ChannelId, MeasurementValue)> {
    let name = symbol(measurement, &raw.value)?;
    let gear = GearPosition::from_name(name)
        .ok_or_else(|| mismatch(measurement, format!("unknown gear '{}'", name)))?;
    Ok((direct_channel(measurement)?, MeasurementValue::Gear(gear)))
}

fn decode_ignition(
    measurement: MeasurementType,
    raw: &RawMeasurement,
) -> Result<(ChannelId, MeasurementValue)> {
    let name = symbol(measurement, &raw.value)?;
    let state = IgnitionState::from_name(name)
        .ok_or_else(|| mismatch(measurement, format!("unknown ignition state '{}'", name)))?;
    Ok((direct_channel(measurement)?, MeasurementValue::Ignition(state)))
}

/// Door status carries the door in `value` and "open" in `event`; each door
/// is its own channel.
fn decode_door(
    measurement: MeasurementType,
    raw: &RawMeasurement,
) -> Result<(ChannelId, MeasurementValue)> {
    let name = symbol(measurement, &raw.value)?;
    let door = DoorId::from_name(name)
        .ok_or_else(|| mismatch(measurement, format!("unknown door '{}'", name)))?;
    let open = raw
        .event
        .as_ref()
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| mismatch(measurement, "door status without a boolean event"))?;
    Ok((ChannelId::Door(door), MeasurementValue::Flag(open)))
}

/// Decode a raw sample delivered on a `measurement` subscription
pub fn decode(
    measurement: MeasurementType,
    raw: &RawMeasurement,
) -> Result<(ChannelId, MeasurementValue)> {
    if !raw.name.is_empty() && raw.name != measurement.name() {
        return Err(mismatch(
            measurement,
            format!("sample named '{}' on this subscription", raw.name),
        ));
    }
    decoder_for(measurement.kind())(measurement, raw)
}

/// Sample counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorStats {
    /// Samples that changed their channel
    pub changed: u64,
    /// Samples equal to the cached reading
    pub unchanged: u64,
    /// Samples dropped because they did not decode
    pub decode_errors: u64,
    /// Samples that arrived after the detector was closed
    pub after_close: u64,
}

/// Entry point for raw measurements of every subscription
pub struct ChangeDetector {
    cache: Arc<ChannelCache>,
    queue: Arc<DispatchQueue>,
    /// Held shared by every `accept`, exclusively by `close`
    closed: RwLock<bool>,
    changed: AtomicU64,
    unchanged: AtomicU64,
    decode_errors: AtomicU64,
    after_close: AtomicU64,
}

impl ChangeDetector {
    pub fn new(cache: Arc<ChannelCache>, queue: Arc<DispatchQueue>) -> Self {
        Self {
            cache,
            queue,
            closed: RwLock::new(false),
            changed: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            after_close: AtomicU64::new(0),
        }
    }

    /// Stop accepting samples
    ///
    /// Waits for any `accept` already running, so once this returns no
    /// sample can reach the cache again.
    pub fn close(&self) {
        *self.closed.write().unwrap_or_else(PoisonError::into_inner) = true;
        log::debug!("Change detector closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one raw sample from the telemetry service
    ///
    /// Safe to call concurrently from any number of service threads.
    pub fn on_raw_measurement(&self, measurement: MeasurementType, raw: &RawMeasurement) {
        match decode(measurement, raw) {
            Ok((channel, value)) => self.accept(channel, value),
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping sample: {}", e);
            }
        }
    }

    /// Compare a decoded value with the cache and notify on change
    pub fn accept(&self, channel: ChannelId, value: MeasurementValue) {
        let closed = self.closed.read().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            self.after_close.fetch_add(1, Ordering::Relaxed);
            log::trace!("Detector closed, ignoring {} = {}", channel, value);
            return;
        }

        let changed = self.cache.replace_with(channel, value, |transition| {
            match self.queue.submit(transition.clone()) {
                Some(sequence) => log::debug!(
                    "{} changed {} -> {} (#{})",
                    channel,
                    transition
                        .old
                        .map(|old| old.to_string())
                        .unwrap_or_else(|| "<no reading>".to_string()),
                    transition.new,
                    sequence
                ),
                None => log::debug!("{} changed after dispatch closed", channel),
            }
        });

        if changed {
            self.changed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unchanged.fetch_add(1, Ordering::Relaxed);
            log::trace!("{} unchanged at {}", channel, value);
        }
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            changed: self.changed.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            after_close: self.after_close.load(Ordering::Relaxed),
        }
    }
}
