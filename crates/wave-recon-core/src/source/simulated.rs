//! Synthetic I/Q source for offline and educational use.
//!
//! Produces complex white Gaussian noise at a configurable floor with a set
//! of injected signals on top, so the detection stages behave as they would
//! on a live feed. Output is fully determined by the seed and configuration.

use std::f64::consts::TAU;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use num_complex::Complex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use super::{sample_timestamp, SampleBlock, SampleSource, SourceConfig, SourceKind};
use crate::error::AcquisitionError;

/// A signal injected into the simulated feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticSignal {
    /// Absolute center frequency in Hz
    pub frequency: f64,
    /// Occupied bandwidth in Hz (0 for a pure carrier)
    pub bandwidth: f64,
    /// Mean signal power in dB relative to full scale
    pub power_db: f32,
}

/// Configuration for the simulated source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// RNG seed; equal seeds give identical sample streams
    pub seed: u64,
    /// Noise power per sample in dB relative to full scale
    pub noise_floor_db: f32,
    /// Injected signals; those outside the tuned band are ignored
    pub signals: Vec<SyntheticSignal>,
    /// Pace block delivery to the sample rate like a real receiver
    pub realtime: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0x5EED,
            noise_floor_db: -80.0,
            signals: vec![
                SyntheticSignal {
                    frequency: 100_500_000.0,
                    bandwidth: 50_000.0,
                    power_db: -30.0,
                },
                SyntheticSignal {
                    frequency: 99_700_000.0,
                    bandwidth: 0.0,
                    power_db: -45.0,
                },
            ],
            realtime: true,
        }
    }
}

/// Per-signal oscillator state carried across blocks for phase continuity.
#[derive(Debug, Clone)]
struct Oscillator {
    offset_hz: f64,
    bandwidth_hz: f64,
    amplitude: f64,
    phase: f64,
}

impl Oscillator {
    /// Add this signal to `samples`. Wide signals sweep their band once per block.
    #[allow(clippy::cast_possible_truncation, reason = "output samples are f32")]
    #[allow(clippy::cast_precision_loss, reason = "block lengths are far below 2^52")]
    fn render(&mut self, samples: &mut [Complex<f32>], sample_rate: f64) {
        let n = samples.len() as f64;
        let start_hz = self.offset_hz - self.bandwidth_hz / 2.0;

        for (i, sample) in samples.iter_mut().enumerate() {
            let freq = if self.bandwidth_hz > 0.0 {
                start_hz + self.bandwidth_hz * (i as f64 / n)
            } else {
                self.offset_hz
            };

            sample.re += (self.amplitude * self.phase.cos()) as f32;
            sample.im += (self.amplitude * self.phase.sin()) as f32;

            self.phase = (self.phase + TAU * freq / sample_rate).rem_euclid(TAU);
        }
    }
}

/// Simulated sample source.
#[derive(Debug)]
pub struct SimulatedSource {
    config: SourceConfig,
    rng: StdRng,
    noise: Normal<f32>,
    oscillators: Vec<Oscillator>,
    sample_index: u64,
    realtime: bool,
    opened_at: Instant,
    closed: bool,
}

impl SimulatedSource {
    /// Number of injected signals that fall inside the tuned band.
    #[must_use]
    pub fn active_signal_count(&self) -> usize {
        self.oscillators.len()
    }

    fn generate_block(&mut self) -> SampleBlock {
        let n = self.config.block_size;
        let sample_rate = self.config.sample_rate;

        let mut samples = Vec::with_capacity(n);
        for _ in 0..n {
            let i = self.noise.sample(&mut self.rng);
            let q = self.noise.sample(&mut self.rng);
            samples.push(Complex::new(i, q));
        }

        for oscillator in &mut self.oscillators {
            oscillator.render(&mut samples, sample_rate);
        }

        let block = SampleBlock::new(
            sample_timestamp(self.sample_index, sample_rate),
            sample_rate,
            self.config.center_frequency,
            samples,
        );
        self.sample_index += n as u64;
        block
    }
}

impl SampleSource for SimulatedSource {
    type Options = SimulationConfig;

    fn open(config: &SourceConfig, options: &SimulationConfig) -> Result<Self, AcquisitionError> {
        config.validate()?;

        // Split the per-sample noise power evenly between I and Q.
        let noise_power = 10f32.powf(options.noise_floor_db / 10.0);
        let noise = Normal::new(0.0, (noise_power / 2.0).sqrt())
            .map_err(|e| AcquisitionError::InvalidConfig(format!("noise floor: {e}")))?;

        let mut rng = StdRng::seed_from_u64(options.seed);
        let nyquist = config.sample_rate / 2.0;
        let mut oscillators = Vec::new();

        for signal in &options.signals {
            let offset_hz = signal.frequency - config.center_frequency;
            if offset_hz.abs() + signal.bandwidth / 2.0 > nyquist {
                warn!(
                    "Skipping synthetic signal at {:.3} MHz: outside the tuned band ({:.3} MHz ± {:.3} MHz)",
                    signal.frequency / 1e6,
                    config.center_frequency / 1e6,
                    nyquist / 1e6
                );
                continue;
            }

            oscillators.push(Oscillator {
                offset_hz,
                bandwidth_hz: signal.bandwidth.max(0.0),
                amplitude: 10f64.powf(f64::from(signal.power_db) / 20.0),
                phase: rng.gen_range(0.0..TAU),
            });
        }

        info!("Opened simulated source:");
        info!("  Center frequency: {:.3} MHz", config.center_frequency / 1e6);
        info!("  Sample rate: {:.3} MHz", config.sample_rate / 1e6);
        info!("  Gain: {} (not applied in simulation)", config.gain);
        info!("  Noise floor: {:.1} dB, seed {}", options.noise_floor_db, options.seed);
        info!("  Injected signals: {} of {}", oscillators.len(), options.signals.len());

        Ok(Self {
            config: config.clone(),
            rng,
            noise,
            oscillators,
            sample_index: 0,
            realtime: options.realtime,
            opened_at: Instant::now(),
            closed: false,
        })
    }

    fn read_block(&mut self, timeout: Duration) -> Result<SampleBlock, AcquisitionError> {
        if self.closed {
            return Err(AcquisitionError::DeviceDisconnected(
                "simulated source is closed".to_string(),
            ));
        }

        if self.realtime {
            // A block is ready once the wall clock passes its last sample.
            let end_index = self.sample_index + self.config.block_size as u64;
            let due = self.opened_at + sample_timestamp(end_index, self.config.sample_rate);
            let wait = due.saturating_duration_since(Instant::now());
            if wait > timeout {
                std::thread::sleep(timeout);
                return Err(AcquisitionError::Timeout);
            }
            std::thread::sleep(wait);
        }

        let block = self.generate_block();
        debug!(
            "Simulated block at {:?} ({} samples)",
            block.start_timestamp(),
            block.len()
        );
        Ok(block)
    }

    fn close(&mut self) {
        if !self.closed {
            info!("Closing simulated source after {} samples", self.sample_index);
            self.closed = true;
        }
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Simulated
    }
}
