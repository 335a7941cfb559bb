//! Bridge configuration types
//!
//! This module defines the configuration consumed by [`crate::Bridge`]: which
//! measurement types to subscribe once connected and where change
//! notifications are delivered.

use crate::types::{BridgeError, MeasurementType, Result};
use serde::{Deserialize, Serialize};

/// Where the dispatch queue runs the application listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// A dedicated dispatch thread owned by the queue
    #[default]
    Thread,
    /// The host drains the queue from its own loop via `pump()`
    Manual,
}

/// Configuration for a bridge instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Measurement types to subscribe on connect (default: all)
    #[serde(default = "default_measurements")]
    pub measurements: Vec<MeasurementType>,

    /// Delivery context for change notifications
    #[serde(default)]
    pub dispatch_mode: DispatchMode,

    /// Name of the dispatch thread in `Thread` mode
    #[serde(default = "default_thread_name")]
    pub dispatch_thread_name: String,
}

fn default_measurements() -> Vec<MeasurementType> {
    MeasurementType::ALL.to_vec()
}

fn default_thread_name() -> String {
    "vehicle-dispatch".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            measurements: default_measurements(),
            dispatch_mode: DispatchMode::default(),
            dispatch_thread_name: default_thread_name(),
        }
    }
}

impl BridgeConfig {
    /// Create a new bridge configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: subscribe only these measurement types
    pub fn with_measurements(mut self, measurements: Vec<MeasurementType>) -> Self {
        self.measurements = measurements;
        self
    }

    /// Builder method: choose the dispatch context
    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Builder method: rename the dispatch thread
    pub fn with_dispatch_thread_name(mut self, name: impl Into<String>) -> Self {
        self.dispatch_thread_name = name.into();
        self
    }

    /// Measurement types to subscribe, in order and without duplicates
    pub fn subscription_list(&self) -> Vec<MeasurementType> {
        let mut list = Vec::with_capacity(self.measurements.len());
        for measurement in &self.measurements {
            if !list.contains(measurement) {
                list.push(*measurement);
            }
        }
        list
    }

    /// Check the configuration for values the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.dispatch_mode == DispatchMode::Thread && self.dispatch_thread_name.trim().is_empty() {
            return Err(BridgeError::ConfigError(
                "dispatch_thread_name must not be empty".to_string(),
            ));
        }
        if self.measurements.is_empty() {
            log::warn!("Bridge configured without measurements; no channel will ever update");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_config_builder() {
        let config = BridgeConfig::new()
            .with_measurements(vec![
                MeasurementType::VehicleSpeed,
                MeasurementType::DoorStatus,
                MeasurementType::VehicleSpeed,
            ])
            .with_dispatch_mode(DispatchMode::Manual)
            .with_dispatch_thread_name("ui");

        assert_eq!(config.dispatch_mode, DispatchMode::Manual);
        assert_eq!(config.dispatch_thread_name, "ui");
        assert_eq!(
            config.subscription_list(),
            vec![MeasurementType::VehicleSpeed, MeasurementType::DoorStatus]
        );
    }

    #[test]
    fn test_defaults_subscribe_everything() {
        let config = BridgeConfig::default();
        assert_eq!(config.subscription_list().len(), MeasurementType::ALL.len());
        assert_eq!(config.dispatch_mode, DispatchMode::Thread);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"measurements": ["engine_speed"], "dispatch_mode": "manual"}"#)
                .unwrap();
        assert_eq!(config.measurements, vec![MeasurementType::EngineSpeed]);
        assert_eq!(config.dispatch_mode, DispatchMode::Manual);
        assert_eq!(config.dispatch_thread_name, "vehicle-dispatch");
    }

    #[test]
    fn test_empty_thread_name_rejected() {
        let config = BridgeConfig::new().with_dispatch_thread_name("  ");
        assert!(config.validate().is_err());

        let manual = config.with_dispatch_mode(DispatchMode::Manual);
        assert!(manual.validate().is_ok());
    }
}
