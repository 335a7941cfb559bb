//! Last-known value per channel
//!
//! The cache only stores and compares; it never notifies. Each channel lives
//! in its own map entry, so writers to the same channel are serialized by the
//! entry lock while writers to different channels proceed in parallel.

use crate::types::{ChannelId, MeasurementValue, Reading};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// An accepted change of one channel
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub channel: ChannelId,
    /// Previous reading (`None` if this is the first accepted value)
    pub old: Reading,
    pub new: MeasurementValue,
}

/// Concurrent store of the last accepted value of every channel
#[derive(Debug, Default)]
pub struct ChannelCache {
    values: DashMap<ChannelId, MeasurementValue>,
}

impl ChannelCache {
    /// Create an empty cache (every channel at no reading)
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    /// Last accepted value of a channel, or `None` before the first reading
    pub fn get(&self, channel: ChannelId) -> Reading {
        self.values.get(&channel).map(|value| *value)
    }

    /// Store `value` if it differs from the cached reading
    ///
    /// Returns true iff the cache changed. No reading always differs from a
    /// concrete value.
    pub fn update(&self, channel: ChannelId, value: MeasurementValue) -> bool {
        self.replace_with(channel, value, |_| {})
    }

    /// Like [`ChannelCache::update`], running `on_change` while the channel
    /// entry is still locked
    ///
    /// Holding the entry lock makes "store then notify" atomic per channel, so
    /// notifications of one channel are handed on in acceptance order.
    /// `on_change` must not access this cache.
    pub fn replace_with<F>(&self, channel: ChannelId, value: MeasurementValue, on_change: F) -> bool
    where
        F: FnOnce(&Transition),
    {
        match self.values.entry(channel) {
            Entry::Occupied(mut slot) => {
                if slot.get().same_reading(&value) {
                    return false;
                }
                let old = slot.insert(value);
                on_change(&Transition {
                    channel,
                    old: Some(old),
                    new: value,
                });
                true
            }
            Entry::Vacant(slot) => {
                let _stored = slot.insert(value);
                on_change(&Transition {
                    channel,
                    old: None,
                    new: value,
                });
                true
            }
        }
    }

    /// Copy of every channel that has a reading, ordered by channel
    pub fn snapshot(&self) -> BTreeMap<ChannelId, MeasurementValue> {
        self.values
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Number of channels with a reading
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reset every channel to no reading
    pub fn clear(&self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DoorId, GearPosition};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_no_reading_before_first_update() {
        let cache = ChannelCache::new();
        for channel in ChannelId::ALL {
            assert_eq!(cache.get(channel), None);
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn test_update_reports_changes_only() {
        let cache = ChannelCache::new();
        let neutral = MeasurementValue::Gear(GearPosition::Neutral);
        let first = MeasurementValue::Gear(GearPosition::First);

        assert!(cache.update(ChannelId::TransmissionGearPosition, neutral));
        assert!(!cache.update(ChannelId::TransmissionGearPosition, neutral));
        assert!(cache.update(ChannelId::TransmissionGearPosition, first));
        assert_eq!(cache.get(ChannelId::TransmissionGearPosition), Some(first));
    }

    #[test]
    fn test_replace_with_passes_transition() {
        let cache = ChannelCache::new();
        let mut seen = Vec::new();

        cache.replace_with(ChannelId::VehicleSpeed, MeasurementValue::Number(10.0), |t| {
            seen.push(t.clone())
        });
        cache.replace_with(ChannelId::VehicleSpeed, MeasurementValue::Number(10.0), |t| {
            seen.push(t.clone())
        });
        cache.replace_with(ChannelId::VehicleSpeed, MeasurementValue::Number(12.5), |t| {
            seen.push(t.clone())
        });

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].old, None);
        assert_eq!(seen[1].old, Some(MeasurementValue::Number(10.0)));
        assert_eq!(seen[1].new, MeasurementValue::Number(12.5));
    }

    #[test]
    fn test_float_compare_is_exact() {
        let cache = ChannelCache::new();
        assert!(cache.update(ChannelId::EngineSpeed, MeasurementValue::Number(1000.0)));
        assert!(cache.update(ChannelId::EngineSpeed, MeasurementValue::Number(1000.0000001)));
        assert!(!cache.update(ChannelId::EngineSpeed, MeasurementValue::Number(1000.0000001)));
    }

    #[test]
    fn test_clear_and_snapshot() {
        let cache = ChannelCache::new();
        cache.update(ChannelId::Door(DoorId::Driver), MeasurementValue::Flag(true));
        cache.update(ChannelId::Odometer, MeasurementValue::Number(1234.5));

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&ChannelId::Odometer), Some(&MeasurementValue::Number(1234.5)));

        cache.clear();
        assert_eq!(cache.get(ChannelId::Odometer), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_concurrent_writers_on_different_channels() {
        let cache = Arc::new(ChannelCache::new());
        let handles: Vec<_> = [ChannelId::VehicleSpeed, ChannelId::EngineSpeed, ChannelId::FuelLevel]
            .into_iter()
            .map(|channel| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let mut changes = 0;
                    for i in 0..500 {
                        // Every value is repeated once
                        if cache.update(channel, MeasurementValue::Number((i / 2) as f64)) {
                            changes += 1;
                        }
                    }
                    changes
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 250);
        }
        assert_eq!(cache.get(ChannelId::FuelLevel), Some(MeasurementValue::Number(249.0)));
    }
}
