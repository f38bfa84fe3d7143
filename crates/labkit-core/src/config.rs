/*!
 * Configuration management for LabKit.
 *
 * This module provides functionality to load, validate, and access the
 * application-level settings: logging, measurement loop timing and the
 * location of the equipment configuration file.
 */
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Application configuration for LabKit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Measurement loop configuration
    #[serde(default)]
    pub measurement: MeasurementConfig,

    /// Equipment file configuration
    #[serde(default)]
    pub equipment: EquipmentConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Directory exported snapshots are written to
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// Measurement loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// How long `stop_measurement` waits for the polling worker to exit
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Lower bound on the polling interval derived from `sample_rate`
    #[serde(default = "default_min_poll_interval_ms")]
    pub min_poll_interval_ms: u64,

    /// Export format used when the caller does not pick one
    #[serde(default = "default_export_format")]
    pub default_export_format: String,
}

/// Equipment file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquipmentConfig {
    /// Path of the equipment configuration file loaded at startup
    #[serde(default = "default_equipment_file")]
    pub config_file: String,

    /// Whether equipment listed in the file is connected after loading
    #[serde(default)]
    pub connect_on_load: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout_ms(),
            min_poll_interval_ms: default_min_poll_interval_ms(),
            default_export_format: default_export_format(),
        }
    }
}

impl Default for EquipmentConfig {
    fn default() -> Self {
        Self {
            config_file: default_equipment_file(),
            connect_on_load: false,
        }
    }
}

impl MeasurementConfig {
    /// The bounded join timeout for stopping a polling worker
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// The smallest polling interval a worker will use
    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }
}

fn default_app_name() -> String {
    "labkit".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stop_timeout_ms() -> u64 {
    2000
}

fn default_min_poll_interval_ms() -> u64 {
    10
}

fn default_export_format() -> String {
    "json".to_string()
}

fn default_equipment_file() -> String {
    "equipment_config.json".to_string()
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        if config.measurement.stop_timeout_ms == 0 {
            return Err(Error::config("measurement.stop_timeout_ms must be positive"));
        }

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File as StdFile;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "labkit");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.measurement.stop_timeout(), Duration::from_secs(2));
        assert_eq!(config.measurement.default_export_format, "json");
        assert_eq!(config.equipment.config_file, "equipment_config.json");
        assert!(!config.equipment.connect_on_load);
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "labkit");
        assert_eq!(config.measurement.min_poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_config_builder_missing_file_uses_defaults() {
        let config = ConfigBuilder::new()
            .with_config_file("/nonexistent/labkit.toml")
            .build()
            .unwrap();
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("labkit.toml");

        {
            let mut file = StdFile::create(&file_path)?;
            file.write_all(
                br#"
                [general]
                app_name = "bench-3"

                [logging]
                level = "debug"

                [measurement]
                stop_timeout_ms = 500

                [equipment]
                config_file = "bench3.json"
                connect_on_load = true
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.general.app_name, "bench-3");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.measurement.stop_timeout(), Duration::from_millis(500));
        assert_eq!(config.measurement.min_poll_interval_ms, 10);
        assert_eq!(config.equipment.config_file, "bench3.json");
        assert!(config.equipment.connect_on_load);

        Ok(())
    }

    #[test]
    fn test_zero_stop_timeout_rejected() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("labkit.toml");
        std::fs::write(&file_path, "[measurement]\nstop_timeout_ms = 0\n")?;

        let result = ConfigBuilder::new().with_config_file(file_path).build();
        assert!(matches!(result, Err(Error::Config(_))));
        Ok(())
    }
}
