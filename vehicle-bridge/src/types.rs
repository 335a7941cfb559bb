//! Core types for the vehicle bridge
//!
//! This module defines the measurement vocabulary shared by every component:
//! the subscribable measurement types of the telemetry service, the channels
//! the bridge tracks independently, the values those channels carry and the
//! error type used throughout the crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamp type used throughout the bridge
pub type Timestamp = DateTime<Utc>;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Last-known value of a channel; `None` means no reading has been accepted yet
pub type Reading = Option<MeasurementValue>;

/// Errors that can occur inside the bridge
///
/// None of these are fatal to the host: every path degrades to "channel stays
/// at no reading" or "reconnect on next foreground".
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to connect to telemetry service: {0}")]
    ConnectError(String),

    #[error("Subscription to {measurement} rejected: {reason}")]
    SubscriptionError {
        measurement: MeasurementType,
        reason: String,
    },

    #[error("Failed to decode {measurement}: {reason}")]
    DecodeError {
        measurement: MeasurementType,
        reason: String,
    },

    #[error("Telemetry service disconnected unexpectedly")]
    UnexpectedDisconnect,

    #[error("Failed to parse trace: {0}")]
    TraceParseError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Shape of the value a measurement type carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Continuous numeric value
    Numeric,
    /// On/off status flag
    Boolean,
    /// Transmission gear symbol
    Gear,
    /// Ignition state symbol
    Ignition,
    /// Composite door identifier plus open/closed event
    DoorStatus,
}

/// One subscribable measurement stream of the telemetry service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementType {
    SteeringWheelAngle,
    TorqueAtTransmission,
    EngineSpeed,
    VehicleSpeed,
    AcceleratorPedalPosition,
    Odometer,
    FuelLevel,
    FuelConsumedSinceRestart,
    Latitude,
    Longitude,
    ParkingBrakeStatus,
    BrakePedalStatus,
    HeadlampStatus,
    HighBeamStatus,
    WindshieldWiperStatus,
    TransmissionGearPosition,
    IgnitionStatus,
    DoorStatus,
}

impl MeasurementType {
    /// Every measurement type the service can publish
    pub const ALL: [MeasurementType; 18] = [
        MeasurementType::SteeringWheelAngle,
        MeasurementType::TorqueAtTransmission,
        MeasurementType::EngineSpeed,
        MeasurementType::VehicleSpeed,
        MeasurementType::AcceleratorPedalPosition,
        MeasurementType::Odometer,
        MeasurementType::FuelLevel,
        MeasurementType::FuelConsumedSinceRestart,
        MeasurementType::Latitude,
        MeasurementType::Longitude,
        MeasurementType::ParkingBrakeStatus,
        MeasurementType::BrakePedalStatus,
        MeasurementType::HeadlampStatus,
        MeasurementType::HighBeamStatus,
        MeasurementType::WindshieldWiperStatus,
        MeasurementType::TransmissionGearPosition,
        MeasurementType::IgnitionStatus,
        MeasurementType::DoorStatus,
    ];

    /// Wire name used by the service (e.g. "vehicle_speed")
    pub fn name(&self) -> &'static str {
        match self {
            MeasurementType::SteeringWheelAngle => "steering_wheel_angle",
            MeasurementType::TorqueAtTransmission => "torque_at_transmission",
            MeasurementType::EngineSpeed => "engine_speed",
            MeasurementType::VehicleSpeed => "vehicle_speed",
            MeasurementType::AcceleratorPedalPosition => "accelerator_pedal_position",
            MeasurementType::Odometer => "odometer",
            MeasurementType::FuelLevel => "fuel_level",
            MeasurementType::FuelConsumedSinceRestart => "fuel_consumed_since_restart",
            MeasurementType::Latitude => "latitude",
            MeasurementType::Longitude => "longitude",
            MeasurementType::ParkingBrakeStatus => "parking_brake_status",
            MeasurementType::BrakePedalStatus => "brake_pedal_status",
            MeasurementType::HeadlampStatus => "headlamp_status",
            MeasurementType::HighBeamStatus => "high_beam_status",
            MeasurementType::WindshieldWiperStatus => "windshield_wiper_status",
            MeasurementType::TransmissionGearPosition => "transmission_gear_position",
            MeasurementType::IgnitionStatus => "ignition_status",
            MeasurementType::DoorStatus => "door_status",
        }
    }

    /// Look up a measurement type by its wire name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }

    /// The value kind this measurement is declared to carry
    pub fn kind(&self) -> ValueKind {
        match self {
            MeasurementType::SteeringWheelAngle
            | MeasurementType::TorqueAtTransmission
            | MeasurementType::EngineSpeed
            | MeasurementType::VehicleSpeed
            | MeasurementType::AcceleratorPedalPosition
            | MeasurementType::Odometer
            | MeasurementType::FuelLevel
            | MeasurementType::FuelConsumedSinceRestart
            | MeasurementType::Latitude
            | MeasurementType::Longitude => ValueKind::Numeric,
            MeasurementType::ParkingBrakeStatus
            | MeasurementType::BrakePedalStatus
            | MeasurementType::HeadlampStatus
            | MeasurementType::HighBeamStatus
            | MeasurementType::WindshieldWiperStatus => ValueKind::Boolean,
            MeasurementType::TransmissionGearPosition => ValueKind::Gear,
            MeasurementType::IgnitionStatus => ValueKind::Ignition,
            MeasurementType::DoorStatus => ValueKind::DoorStatus,
        }
    }
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MeasurementType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
            .ok_or_else(|| BridgeError::ConfigError(format!("Unknown measurement type: {}", s)))
    }
}

/// Door identifier carried by the composite door status measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorId {
    Driver,
    Passenger,
    RearLeft,
    RearRight,
}

impl DoorId {
    pub const ALL: [DoorId; 4] = [
        DoorId::Driver,
        DoorId::Passenger,
        DoorId::RearLeft,
        DoorId::RearRight,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DoorId::Driver => "driver",
            DoorId::Passenger => "passenger",
            DoorId::RearLeft => "rear_left",
            DoorId::RearRight => "rear_right",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|d| d.name() == name)
    }
}

/// Transmission gear position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GearPosition {
    Reverse,
    Neutral,
    First,
    Second,
    Third,
    Fourth,
    Fifth,
    Sixth,
    Seventh,
    Eighth,
}

impl GearPosition {
    pub const ALL: [GearPosition; 10] = [
        GearPosition::Reverse,
        GearPosition::Neutral,
        GearPosition::First,
        GearPosition::Second,
        GearPosition::Third,
        GearPosition::Fourth,
        GearPosition::Fifth,
        GearPosition::Sixth,
        GearPosition::Seventh,
        GearPosition::Eighth,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            GearPosition::Reverse => "reverse",
            GearPosition::Neutral => "neutral",
            GearPosition::First => "first",
            GearPosition::Second => "second",
            GearPosition::Third => "third",
            GearPosition::Fourth => "fourth",
            GearPosition::Fifth => "fifth",
            GearPosition::Sixth => "sixth",
            GearPosition::Seventh => "seventh",
            GearPosition::Eighth => "eighth",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|g| g.name() == name)
    }
}

/// Ignition key state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnitionState {
    Off,
    Accessory,
    Run,
    Start,
}

impl IgnitionState {
    pub const ALL: [IgnitionState; 4] = [
        IgnitionState::Off,
        IgnitionState::Accessory,
        IgnitionState::Run,
        IgnitionState::Start,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            IgnitionState::Off => "off",
            IgnitionState::Accessory => "accessory",
            IgnitionState::Run => "run",
            IgnitionState::Start => "start",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|i| i.name() == name)
    }
}

/// An independently tracked channel
///
/// Every non-composite measurement type maps to exactly one channel. Door
/// status fans out to one channel per door so each door keeps its own cached
/// state and notification identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    SteeringWheelAngle,
    TorqueAtTransmission,
    EngineSpeed,
    VehicleSpeed,
    AcceleratorPedalPosition,
    Odometer,
    FuelLevel,
    FuelConsumedSinceRestart,
    Latitude,
    Longitude,
    ParkingBrakeStatus,
    BrakePedalStatus,
    HeadlampStatus,
    HighBeamStatus,
    WindshieldWiperStatus,
    TransmissionGearPosition,
    IgnitionStatus,
    Door(DoorId),
}

impl ChannelId {
    /// Every channel the bridge can track
    pub const ALL: [ChannelId; 21] = [
        ChannelId::SteeringWheelAngle,
        ChannelId::TorqueAtTransmission,
        ChannelId::EngineSpeed,
        ChannelId::VehicleSpeed,
        ChannelId::AcceleratorPedalPosition,
        ChannelId::Odometer,
        ChannelId::FuelLevel,
        ChannelId::FuelConsumedSinceRestart,
        ChannelId::Latitude,
        ChannelId::Longitude,
        ChannelId::ParkingBrakeStatus,
        ChannelId::BrakePedalStatus,
        ChannelId::HeadlampStatus,
        ChannelId::HighBeamStatus,
        ChannelId::WindshieldWiperStatus,
        ChannelId::TransmissionGearPosition,
        ChannelId::IgnitionStatus,
        ChannelId::Door(DoorId::Driver),
        ChannelId::Door(DoorId::Passenger),
        ChannelId::Door(DoorId::RearLeft),
        ChannelId::Door(DoorId::RearRight),
    ];

    /// The channel fed directly by a measurement type
    ///
    /// Returns `None` for door status, which has to be decomposed per door.
    pub fn for_measurement(measurement: MeasurementType) -> Option<Self> {
        let channel = match measurement {
            MeasurementType::SteeringWheelAngle => ChannelId::SteeringWheelAngle,
            MeasurementType::TorqueAtTransmission => ChannelId::TorqueAtTransmission,
            MeasurementType::EngineSpeed => ChannelId::EngineSpeed,
            MeasurementType::VehicleSpeed => ChannelId::VehicleSpeed,
            MeasurementType::AcceleratorPedalPosition => ChannelId::AcceleratorPedalPosition,
            MeasurementType::Odometer => ChannelId::Odometer,
            MeasurementType::FuelLevel => ChannelId::FuelLevel,
            MeasurementType::FuelConsumedSinceRestart => ChannelId::FuelConsumedSinceRestart,
            MeasurementType::Latitude => ChannelId::Latitude,
            MeasurementType::Longitude => ChannelId::Longitude,
            MeasurementType::ParkingBrakeStatus => ChannelId::ParkingBrakeStatus,
            MeasurementType::BrakePedalStatus => ChannelId::BrakePedalStatus,
            MeasurementType::HeadlampStatus => ChannelId::HeadlampStatus,
            MeasurementType::HighBeamStatus => ChannelId::HighBeamStatus,
            MeasurementType::WindshieldWiperStatus => ChannelId::WindshieldWiperStatus,
            MeasurementType::TransmissionGearPosition => ChannelId::TransmissionGearPosition,
            MeasurementType::IgnitionStatus => ChannelId::IgnitionStatus,
            MeasurementType::DoorStatus => return None,
        };
        Some(channel)
    }

    /// The measurement type this channel is fed by
    pub fn measurement(&self) -> MeasurementType {
        match self {
            ChannelId::SteeringWheelAngle => MeasurementType::SteeringWheelAngle,
            ChannelId::TorqueAtTransmission => MeasurementType::TorqueAtTransmission,
            ChannelId::EngineSpeed => MeasurementType::EngineSpeed,
            ChannelId::VehicleSpeed => MeasurementType::VehicleSpeed,
            ChannelId::AcceleratorPedalPosition => MeasurementType::AcceleratorPedalPosition,
            ChannelId::Odometer => MeasurementType::Odometer,
            ChannelId::FuelLevel => MeasurementType::FuelLevel,
            ChannelId::FuelConsumedSinceRestart => MeasurementType::FuelConsumedSinceRestart,
            ChannelId::Latitude => MeasurementType::Latitude,
            ChannelId::Longitude => MeasurementType::Longitude,
            ChannelId::ParkingBrakeStatus => MeasurementType::ParkingBrakeStatus,
            ChannelId::BrakePedalStatus => MeasurementType::BrakePedalStatus,
            ChannelId::HeadlampStatus => MeasurementType::HeadlampStatus,
            ChannelId::HighBeamStatus => MeasurementType::HighBeamStatus,
            ChannelId::WindshieldWiperStatus => MeasurementType::WindshieldWiperStatus,
            ChannelId::TransmissionGearPosition => MeasurementType::TransmissionGearPosition,
            ChannelId::IgnitionStatus => MeasurementType::IgnitionStatus,
            ChannelId::Door(_) => MeasurementType::DoorStatus,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Door(door) => write!(f, "door_status.{}", door.name()),
            other => f.write_str(other.measurement().name()),
        }
    }
}

/// A decoded channel value
///
/// Equality follows the external representation: two values are the same
/// reading iff they display identically. Numbers therefore compare by their
/// shortest round-trip decimal form, so `0` and `-0` are different readings
/// and `NaN` equals itself.
#[derive(Debug, Clone, Copy)]
pub enum MeasurementValue {
    /// Continuous numeric value
    Number(f64),
    /// Boolean status (door channels carry `true` when open)
    Flag(bool),
    /// Transmission gear
    Gear(GearPosition),
    /// Ignition state
    Ignition(IgnitionState),
}

impl MeasurementValue {
    /// Check whether two values represent the same reading
    pub fn same_reading(&self, other: &MeasurementValue) -> bool {
        match (self, other) {
            (MeasurementValue::Number(a), MeasurementValue::Number(b)) => {
                a.to_string() == b.to_string()
            }
            (MeasurementValue::Flag(a), MeasurementValue::Flag(b)) => a == b,
            (MeasurementValue::Gear(a), MeasurementValue::Gear(b)) => a == b,
            (MeasurementValue::Ignition(a), MeasurementValue::Ignition(b)) => a == b,
            _ => false,
        }
    }

    /// Convert to the JSON shape the service uses
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            MeasurementValue::Number(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            MeasurementValue::Flag(v) => serde_json::Value::Bool(*v),
            MeasurementValue::Gear(g) => serde_json::Value::String(g.name().to_string()),
            MeasurementValue::Ignition(i) => serde_json::Value::String(i.name().to_string()),
        }
    }
}

impl PartialEq for MeasurementValue {
    fn eq(&self, other: &Self) -> bool {
        self.same_reading(other)
    }
}

impl fmt::Display for MeasurementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementValue::Number(v) => write!(f, "{}", v),
            MeasurementValue::Flag(v) => write!(f, "{}", if *v { "true" } else { "false" }),
            MeasurementValue::Gear(g) => f.write_str(g.name()),
            MeasurementValue::Ignition(i) => f.write_str(i.name()),
        }
    }
}

/// A raw sample as handed over by the telemetry service
///
/// Mirrors the OpenXC JSON message: `{"name": ..., "value": ..., "event": ...}`.
/// Only composite measurements such as door status use `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMeasurement {
    /// Measurement wire name
    pub name: String,
    /// Primary value
    pub value: serde_json::Value,
    /// Secondary value of composite measurements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<serde_json::Value>,
    /// Seconds since epoch, when the service provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl RawMeasurement {
    /// Create a raw sample for a measurement type
    pub fn new(measurement: MeasurementType, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: measurement.name().to_string(),
            value: value.into(),
            event: None,
            timestamp: None,
        }
    }

    /// Builder method: attach the secondary event value
    pub fn with_event(mut self, event: impl Into<serde_json::Value>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Builder method: attach a timestamp in seconds
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}
