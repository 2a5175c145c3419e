//! Sample sources: where I/Q blocks come from.
//!
//! A [`SampleSource`] yields timestamped [`SampleBlock`]s. Two
//! implementations exist:
//! - [`HardwareSource`] wraps an RTL-SDR dongle (requires the `hardware` feature)
//! - [`SimulatedSource`] synthesizes noise plus injected test signals
//!
//! The choice is made by type, not by a runtime flag, so hardware-only
//! operations such as device enumeration never reach a simulated source.

mod hardware;
mod simulated;

pub use hardware::{list_devices, DeviceInfo, HardwareOptions, HardwareSource};
pub use simulated::{SimulatedSource, SimulationConfig, SyntheticSignal};

use std::fmt;
use std::time::Duration;

use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::AcquisitionError;

/// Gain mode for the tuner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GainMode {
    /// Automatic gain control
    #[default]
    Auto,
    /// Manual gain (value in tenths of dB, e.g. 496 = 49.6 dB)
    Manual(i32),
}

impl fmt::Display for GainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual(tenths) => write!(f, "{:.1} dB", f64::from(*tenths) / 10.0),
        }
    }
}

/// Which family of source produced (or will produce) the samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Hardware,
    Simulated,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware => write!(f, "hardware"),
            Self::Simulated => write!(f, "simulated"),
        }
    }
}

/// Tuning parameters common to every source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Center frequency in Hz
    pub center_frequency: f64,
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// Tuner gain
    pub gain: GainMode,
    /// Samples per block
    pub block_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            center_frequency: 100_000_000.0, // 100 MHz
            sample_rate: 2_400_000.0,        // 2.4 MHz
            gain: GainMode::Auto,
            block_size: 2048,
        }
    }
}

impl SourceConfig {
    /// Check the parameters a source cannot work without.
    pub fn validate(&self) -> Result<(), AcquisitionError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(AcquisitionError::InvalidConfig(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if !(self.center_frequency.is_finite() && self.center_frequency >= 0.0) {
            return Err(AcquisitionError::InvalidConfig(format!(
                "center frequency must be non-negative, got {}",
                self.center_frequency
            )));
        }
        if self.block_size == 0 {
            return Err(AcquisitionError::InvalidConfig(
                "block size must be at least one sample".to_string(),
            ));
        }
        Ok(())
    }
}

/// A contiguous run of I/Q samples.
///
/// Immutable once produced; it moves by value from the source into the
/// buffer and from the buffer into the spectrum engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    start_timestamp: Duration,
    sample_rate: f64,
    center_frequency: f64,
    samples: Vec<Complex<f32>>,
}

impl SampleBlock {
    #[must_use]
    pub fn new(
        start_timestamp: Duration,
        sample_rate: f64,
        center_frequency: f64,
        samples: Vec<Complex<f32>>,
    ) -> Self {
        Self {
            start_timestamp,
            sample_rate,
            center_frequency,
            samples,
        }
    }

    /// Stream time of the first sample, measured from session start.
    #[must_use]
    pub fn start_timestamp(&self) -> Duration {
        self.start_timestamp
    }

    #[must_use]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    #[must_use]
    pub fn center_frequency(&self) -> f64 {
        self.center_frequency
    }

    #[must_use]
    pub fn samples(&self) -> &[Complex<f32>] {
        &self.samples
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time covered by the block.
    #[must_use]
    pub fn duration(&self) -> Duration {
        #[allow(clippy::cast_precision_loss, reason = "block lengths are far below 2^52")]
        let len = self.samples.len() as f64;
        Duration::from_secs_f64(len / self.sample_rate)
    }
}

/// Stream clock shared by the sources: converts a running sample count into
/// the timestamp of that sample.
pub(crate) fn sample_timestamp(sample_index: u64, sample_rate: f64) -> Duration {
    #[allow(clippy::cast_precision_loss, reason = "sample counts stay well below 2^52")]
    let index = sample_index as f64;
    Duration::from_secs_f64(index / sample_rate)
}

/// A producer of timestamped I/Q sample blocks.
///
/// Implementations are moved onto the acquisition thread, hence `Send`.
pub trait SampleSource: Send {
    /// Source-specific options that do not apply to other sources.
    type Options;

    /// Open and configure the source.
    fn open(config: &SourceConfig, options: &Self::Options) -> Result<Self, AcquisitionError>
    where
        Self: Sized;

    /// Wait up to `timeout` for the next block.
    ///
    /// Returns [`AcquisitionError::Timeout`] when nothing arrived in time;
    /// callers are expected to retry.
    fn read_block(&mut self, timeout: Duration) -> Result<SampleBlock, AcquisitionError>;

    /// Release the source. Calling it more than once is harmless.
    fn close(&mut self);

    fn kind(&self) -> SourceKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_config_default_is_valid() {
        assert!(SourceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_source_config_rejects_zero_rate() {
        let config = SourceConfig {
            sample_rate: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(AcquisitionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_block_duration() {
        let block = SampleBlock::new(
            Duration::ZERO,
            2_000_000.0,
            100e6,
            vec![Complex::new(0.0, 0.0); 2000],
        );
        assert!((block.duration().as_secs_f64() - 0.001).abs() < 1e-9);
        assert_eq!(block.len(), 2000);
    }

    #[test]
    fn test_gain_display() {
        assert_eq!(GainMode::Auto.to_string(), "auto");
        assert_eq!(GainMode::Manual(496).to_string(), "49.6 dB");
    }
}
