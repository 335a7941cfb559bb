//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use vehicle_bridge::{BridgeConfig, MeasurementType};

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraceConfig {
    /// JSON-lines trace to replay
    pub file: Option<PathBuf>,
    /// Pace records by their timestamps
    #[serde(default)]
    pub realtime: bool,
    /// Report a disconnect when the trace ends
    #[serde(default = "default_true")]
    pub disconnect_at_end: bool,
    /// Measurement types the simulated vehicle publishes (default: all)
    pub supported: Option<Vec<MeasurementType>>,
    /// Seconds to wait for the replay to finish
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    600
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            file: None,
            realtime: false,
            disconnect_at_end: default_true(),
            supported: None,
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
    /// Print every change notification as it is delivered
    #[serde(default = "default_true")]
    pub show_changes: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            show_changes: default_true(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl AppConfig {
    /// Check the configuration before starting the bridge
    pub fn validate(&self) -> Result<()> {
        let Some(file) = &self.trace.file else {
            bail!("No trace file configured (use --trace or [trace] file)");
        };
        if !file.exists() {
            bail!("Trace file does not exist: {:?}", file);
        }
        self.bridge
            .validate()
            .context("Invalid [bridge] section")?;
        Ok(())
    }

    /// Parse measurement names given on the command line
    pub fn set_measurements(&mut self, names: &[String]) -> Result<()> {
        let measurements = names
            .iter()
            .map(|name| name.parse::<MeasurementType>())
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid --measurement")?;
        self.bridge.measurements = measurements;
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}
