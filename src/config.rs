//! Configuration loading for rack connections.
//!
//! Settings are plain serde structs with sensible defaults, layered from an
//! optional TOML file and `RACK_`-prefixed environment variables (e.g.
//! `RACK_LINK__PORT=/dev/ttyUSB1`). Nothing here is persisted back: all
//! module state is volatile and re-established each session, so the
//! configuration only describes how to reach the rack.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::RackResult;

/// Serial link parameters for one rack controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Serial port the controller enumerates on.
    pub port: String,
    /// Baud rate. Accepted by the controller but without effect on the
    /// USB-virtual link's throughput.
    pub baud_rate: u32,
    /// Receive timeout in milliseconds for one command/response exchange.
    pub timeout_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 1_000_000,
            timeout_ms: 1000,
        }
    }
}

impl LinkSettings {
    /// The receive timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Top-level settings for a rack session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Serial link parameters.
    pub link: LinkSettings,
    /// Reference frequency present on the backplane, if one is distributed.
    pub reference_frequency_hz: Option<f64>,
}

impl Settings {
    /// Load settings from an optional TOML file plus the environment.
    ///
    /// Environment variables use the `RACK_` prefix with `__` as the level
    /// separator and take precedence over the file.
    pub fn new(path: Option<&Path>) -> RackResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(Environment::with_prefix("RACK").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_usable() {
        let settings = Settings::default();
        assert_eq!(settings.link.port, "/dev/ttyUSB0");
        assert_eq!(settings.link.timeout(), Duration::from_millis(1000));
        assert!(settings.reference_frequency_hz.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "reference_frequency_hz = 10e6\n\n[link]\nport = \"/dev/ttyACM3\"\ntimeout_ms = 250"
        )
        .unwrap();

        let settings = Settings::new(Some(file.path())).unwrap();
        assert_eq!(settings.link.port, "/dev/ttyACM3");
        assert_eq!(settings.link.timeout_ms, 250);
        // Untouched fields keep their defaults.
        assert_eq!(settings.link.baud_rate, 1_000_000);
        assert_eq!(settings.reference_frequency_hz, Some(10e6));
    }
}
