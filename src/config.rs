//! Configuration management for the colorimetric calibration core
//!
//! Follows the reference's `Config::load_or_create`/`Config::save`
//! pattern (toml + `anyhow::Context`, parent-directory creation on
//! save) but the schema here is the §6 "Configuration envelope" table
//! plus server and storage settings instead of TV-geometry calibration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::driver::{AGain, SensorConfig};
use crate::trainer::DeltaEMetric;

/// The externally settable sensor register options (§6 configuration
/// envelope table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorSettings {
    pub atime: u8,
    pub again: u8,
    pub wtime: u8,
    pub auto_zero_mode: bool,
    pub auto_zero_frequency: u8,
}

impl Default for SensorSettings {
    fn default() -> Self {
        let defaults = SensorConfig::default();
        Self {
            atime: defaults.atime,
            again: defaults.again.encoded(),
            wtime: defaults.wtime,
            auto_zero_mode: defaults.auto_zero_enabled,
            auto_zero_frequency: defaults.auto_zero_frequency,
        }
    }
}

impl SensorSettings {
    pub fn to_sensor_config(&self) -> SensorConfig {
        let again = match self.again {
            0 => AGain::X1,
            1 => AGain::X4,
            2 => AGain::X16,
            _ => AGain::X64,
        };
        SensorConfig {
            atime: self.atime,
            again,
            wtime: self.wtime,
            auto_zero_enabled: self.auto_zero_mode,
            auto_zero_frequency: self.auto_zero_frequency,
        }
    }
}

/// Dual-matrix IR blend settings (§6 configuration envelope table).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DualMatrixSettings {
    pub dual_mode: bool,
    pub ir_threshold_low: f32,
    pub ir_threshold_high: f32,
}

impl Default for DualMatrixSettings {
    fn default() -> Self {
        Self {
            dual_mode: true,
            ir_threshold_low: 0.15,
            ir_threshold_high: 0.35,
        }
    }
}

/// Server configuration for the HTTP transport shim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

/// On-disk location of the non-volatile calibration store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}

/// Which perceptual distance metric the calibration trainer scores
/// against (§9 Open Question #2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeltaEMetricSetting {
    EuclideanRgb,
    #[default]
    CieLab76,
}

impl From<DeltaEMetricSetting> for DeltaEMetric {
    fn from(s: DeltaEMetricSetting) -> Self {
        match s {
            DeltaEMetricSetting::EuclideanRgb => DeltaEMetric::EuclideanRgb,
            DeltaEMetricSetting::CieLab76 => DeltaEMetric::CieLab76,
        }
    }
}

/// Scan-illumination default (§6 `led_brightness`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LedSettings {
    pub led_brightness: u8,
}

impl Default for LedSettings {
    fn default() -> Self {
        Self { led_brightness: 128 }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sensor: SensorSettings,

    #[serde(default)]
    pub dual_matrix: DualMatrixSettings,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub led: LedSettings,

    #[serde(default)]
    pub delta_e_metric: DeltaEMetricSetting,

    /// Opt-in per-channel IR postfilter on `scan()` output (§4.3 last
    /// paragraph, wired per the supplemented-features section).
    #[serde(default)]
    pub ir_postfilter_enabled: bool,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.sensor, config.sensor);
        assert_eq!(parsed.dual_matrix, config.dual_matrix);
    }

    #[test]
    fn load_or_create_writes_default_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        let config = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.server.port, 8090);
    }

    #[test]
    fn sensor_settings_round_trip_through_sensor_config() {
        let settings = SensorSettings {
            atime: 150,
            again: 2,
            wtime: 5,
            auto_zero_mode: false,
            auto_zero_frequency: 3,
        };
        let cfg = settings.to_sensor_config();
        assert_eq!(cfg.atime, 150);
        assert_eq!(cfg.again, AGain::X16);
        assert!(!cfg.auto_zero_enabled);
    }
}
