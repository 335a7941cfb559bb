//! Property tests for change detection over arbitrary sample sequences

mod common;

use common::{connected_bridge, manual_config, Recorder, ScriptedService};
use proptest::prelude::*;
use vehicle_bridge::{
    ChannelId, GearPosition, MeasurementType, MeasurementValue, RawMeasurement,
};

/// Number of strict transitions, counting the first value as one
fn transitions<T: PartialEq>(values: &[T]) -> usize {
    values
        .iter()
        .enumerate()
        .filter(|(i, value)| *i == 0 || values[i - 1] != **value)
        .count()
}

/// Values with consecutive repeats collapsed
fn collapse<T: PartialEq + Clone>(values: &[T]) -> Vec<T> {
    let mut collapsed: Vec<T> = Vec::new();
    for value in values {
        if collapsed.last() != Some(value) {
            collapsed.push(value.clone());
        }
    }
    collapsed
}

proptest! {
    /// Repeats never notify: one notification per strict transition
    #[test]
    fn notifications_equal_strict_transitions(
        samples in proptest::collection::vec(0u8..4, 0..60),
    ) {
        let service = ScriptedService::new();
        let bridge = connected_bridge(&service, manual_config());
        let recorder = Recorder::new();
        bridge.register_on_change(recorder.listener());

        for sample in &samples {
            service.emit(RawMeasurement::new(MeasurementType::VehicleSpeed, *sample as f64));
        }
        bridge.pump();

        prop_assert_eq!(recorder.len(), transitions(&samples));
    }

    /// The current value is always the last accepted one
    #[test]
    fn current_value_is_last_accepted(
        gears in proptest::collection::vec(0usize..GearPosition::ALL.len(), 0..40),
    ) {
        let service = ScriptedService::new();
        let bridge = connected_bridge(&service, manual_config());

        for index in &gears {
            let gear = GearPosition::ALL[*index];
            service.emit(RawMeasurement::new(MeasurementType::TransmissionGearPosition, gear.name()));
        }

        let expected = gears
            .last()
            .map(|index| MeasurementValue::Gear(GearPosition::ALL[*index]));
        prop_assert_eq!(bridge.current_value(ChannelId::TransmissionGearPosition), expected);
    }

    /// A single channel's notifications arrive in acceptance order
    #[test]
    fn single_channel_order_is_preserved(
        samples in proptest::collection::vec(proptest::bool::ANY, 1..60),
    ) {
        let service = ScriptedService::new();
        let bridge = connected_bridge(&service, manual_config());
        let recorder = Recorder::new();
        bridge.register_on_change(recorder.listener());

        for open in &samples {
            service.emit(RawMeasurement::new(MeasurementType::HeadlampStatus, *open));
        }
        bridge.pump();

        let delivered: Vec<MeasurementValue> = recorder.seen().iter().map(|n| n.new).collect();
        let expected: Vec<MeasurementValue> = collapse(&samples)
            .into_iter()
            .map(MeasurementValue::Flag)
            .collect();
        prop_assert_eq!(delivered, expected);
    }
}
