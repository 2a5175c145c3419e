// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Application configuration management.
//!
//! Settings persist in TOML through `confy`. Every field has a serde default
//! so older or hand-edited files keep loading as new settings are added.
//! Command-line flags override the stored values for a single run.

use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use wave_recon_core::{
    GainMode, HardwareOptions, PipelineConfig, SimulationConfig, SourceConfig, SyntheticSignal,
};

const APP_NAME: &str = "wave-recon";
const CONFIG_NAME: &str = "config";

/// How the `run` command picks its sample source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Use an RTL-SDR if one is attached, otherwise simulate
    #[default]
    Auto,
    Hardware,
    Simulated,
}

/// Application configuration stored in TOML format
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    /// Configuration schema version for migrations
    #[serde(default = "default_config_version")]
    pub config_version: u32,

    /// `env_logger` filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Optional file that receives a copy of every log record
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub mode: RunMode,

    /// Tuned center frequency in Hz
    #[serde(default = "default_center_frequency")]
    pub center_frequency: f64,

    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// Manual tuner gain in dB; automatic gain when unset
    #[serde(default)]
    pub gain_db: Option<f64>,

    /// Samples per block handed to the analysis stage
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// RTL-SDR device index
    #[serde(default)]
    pub device_index: u32,

    /// Tuner frequency correction in PPM
    #[serde(default)]
    pub ppm_correction: i32,

    /// Simulation RNG seed
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Simulated noise power per sample in dB
    #[serde(default = "default_noise_floor_db")]
    pub noise_floor_db: f32,

    /// Signals injected into the simulated feed
    #[serde(default = "default_signals")]
    pub signals: Vec<SyntheticSignal>,

    /// Buffer, spectrum and detection tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

// Default value functions for serde
fn default_config_version() -> u32 {
    1 // Current schema version
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_center_frequency() -> f64 {
    SourceConfig::default().center_frequency
}

fn default_sample_rate() -> f64 {
    SourceConfig::default().sample_rate
}

fn default_block_size() -> usize {
    SourceConfig::default().block_size
}

fn default_seed() -> u64 {
    SimulationConfig::default().seed
}

fn default_noise_floor_db() -> f32 {
    SimulationConfig::default().noise_floor_db
}

fn default_signals() -> Vec<SyntheticSignal> {
    SimulationConfig::default().signals
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            log_filter: default_log_filter(),
            log_file: None,
            mode: RunMode::default(),
            center_frequency: default_center_frequency(),
            sample_rate: default_sample_rate(),
            gain_db: None,
            block_size: default_block_size(),
            device_index: 0,
            ppm_correction: 0,
            seed: default_seed(),
            noise_floor_db: default_noise_floor_db(),
            signals: default_signals(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from disk, creating it with defaults if missing
    pub fn load() -> Result<Self, confy::ConfyError> {
        confy::load(APP_NAME, CONFIG_NAME)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<(), confy::ConfyError> {
        confy::store(APP_NAME, CONFIG_NAME, self)
    }

    /// Get the config file path for display to user
    pub fn get_config_path() -> Result<std::path::PathBuf, confy::ConfyError> {
        confy::get_configuration_file_path(APP_NAME, CONFIG_NAME)
    }

    pub fn gain(&self) -> GainMode {
        match self.gain_db {
            #[allow(clippy::cast_possible_truncation, reason = "tuner gains are a few tens of dB")]
            Some(db) => GainMode::Manual((db * 10.0).round() as i32),
            None => GainMode::Auto,
        }
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            center_frequency: self.center_frequency,
            sample_rate: self.sample_rate,
            gain: self.gain(),
            block_size: self.block_size,
        }
    }

    pub fn hardware_options(&self) -> HardwareOptions {
        HardwareOptions {
            device_index: self.device_index,
            ppm_correction: self.ppm_correction,
        }
    }

    pub fn simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            seed: self.seed,
            noise_floor_db: self.noise_floor_db,
            signals: self.signals.clone(),
            realtime: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_usable() {
        let config = AppConfig::default();
        assert_eq!(config.mode, RunMode::Auto);
        assert!(config.source_config().validate().is_ok());
        assert_eq!(config.gain(), GainMode::Auto);
        assert!(config.simulation_config().realtime);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"center_frequency": 433920000.0, "mode": "simulated"}"#).unwrap();
        assert_eq!(config.center_frequency, 433.92e6);
        assert_eq!(config.mode, RunMode::Simulated);
        assert_eq!(config.sample_rate, default_sample_rate());
        assert_eq!(config.signals, default_signals());
        assert_eq!(config.pipeline, PipelineConfig::default());
        assert_eq!(config.log_file, None);
    }

    #[test]
    fn test_manual_gain_in_tenths() {
        let config = AppConfig {
            gain_db: Some(49.6),
            ..Default::default()
        };
        assert_eq!(config.gain(), GainMode::Manual(496));
        assert_eq!(config.source_config().gain, GainMode::Manual(496));
    }

    #[test]
    fn test_hardware_options_from_config() {
        let config = AppConfig {
            device_index: 2,
            ppm_correction: -15,
            ..Default::default()
        };
        assert_eq!(
            config.hardware_options(),
            HardwareOptions {
                device_index: 2,
                ppm_correction: -15
            }
        );
    }
}
