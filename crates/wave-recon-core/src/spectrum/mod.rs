//! Spectrum analysis: windowed FFT, dB power, and running statistics.
//!
//! [`SpectrumEngine`] turns each [`SampleBlock`] into a [`Spectrum`] and
//! tracks a per-bin noise floor and a decaying peak hold across calls.

mod window;

pub use window::WindowType;

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::source::SampleBlock;

/// A closed frequency interval in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRange {
    pub start_hz: f64,
    pub end_hz: f64,
}

impl FrequencyRange {
    #[must_use]
    pub fn new(start_hz: f64, end_hz: f64) -> Self {
        Self { start_hz, end_hz }
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.end_hz - self.start_hz
    }

    #[must_use]
    pub fn center(&self) -> f64 {
        (self.start_hz + self.end_hz) / 2.0
    }

    #[must_use]
    pub fn contains(&self, frequency: f64) -> bool {
        frequency >= self.start_hz && frequency <= self.end_hz
    }

    #[must_use]
    pub fn overlaps(&self, other: &FrequencyRange) -> bool {
        self.start_hz <= other.end_hz && other.start_hz <= self.end_hz
    }

    /// Whether `self` lies entirely inside `outer`.
    #[must_use]
    pub fn is_within(&self, outer: &FrequencyRange) -> bool {
        self.start_hz >= outer.start_hz && self.end_hz <= outer.end_hz
    }
}

/// Configuration for the spectrum engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumConfig {
    /// Minimum transform size; longer blocks grow it to the next power of two
    pub fft_size: usize,
    pub window: WindowType,
    /// EWMA weight of each new spectrum in the noise floor estimate (0..1]
    pub noise_floor_alpha: f32,
    /// How far above the spectrum median a bin may pull its floor, in dB
    pub noise_floor_clamp_db: f32,
    /// Lowest reported power; empty bins read exactly this value
    pub power_floor_db: f32,
    /// Peak hold decay per spectrum, in dB
    pub peak_decay_db: f32,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            fft_size: 1024,
            window: WindowType::Hann,
            noise_floor_alpha: 0.1,
            noise_floor_clamp_db: 6.0,
            power_floor_db: -150.0,
            peak_decay_db: 0.5,
        }
    }
}

/// Power spectrum of one sample block.
///
/// Bins run from the lowest to the highest frequency, with the tuned
/// center frequency in the middle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    timestamp: Duration,
    center_frequency: f64,
    sample_rate: f64,
    resolution_bandwidth: f64,
    power_db: Vec<f32>,
    noise_floor_db: Vec<f32>,
}

impl Spectrum {
    /// Build a spectrum from per-bin power and noise floor values.
    #[must_use]
    pub fn new(
        timestamp: Duration,
        center_frequency: f64,
        sample_rate: f64,
        power_db: Vec<f32>,
        noise_floor_db: Vec<f32>,
    ) -> Self {
        assert!(!power_db.is_empty(), "spectrum needs at least one bin");
        assert_eq!(
            power_db.len(),
            noise_floor_db.len(),
            "power and noise floor must have the same bin count"
        );
        #[allow(clippy::cast_precision_loss, reason = "bin counts are far below 2^52")]
        let resolution_bandwidth = sample_rate / power_db.len() as f64;
        Self {
            timestamp,
            center_frequency,
            sample_rate,
            resolution_bandwidth,
            power_db,
            noise_floor_db,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    #[must_use]
    pub fn center_frequency(&self) -> f64 {
        self.center_frequency
    }

    #[must_use]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Width of one bin in Hz.
    #[must_use]
    pub fn resolution_bandwidth(&self) -> f64 {
        self.resolution_bandwidth
    }

    #[must_use]
    pub fn bin_count(&self) -> usize {
        self.power_db.len()
    }

    #[must_use]
    pub fn power_db(&self) -> &[f32] {
        &self.power_db
    }

    #[must_use]
    pub fn noise_floor_db(&self) -> &[f32] {
        &self.noise_floor_db
    }

    /// Center frequency of `bin` in Hz.
    #[must_use]
    #[allow(clippy::cast_precision_loss, reason = "bin indices are far below 2^52")]
    pub fn frequency_of(&self, bin: usize) -> f64 {
        self.center_frequency - self.sample_rate / 2.0 + bin as f64 * self.resolution_bandwidth
    }

    /// Bin whose center is nearest to `frequency`, if it falls inside the spectrum.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "value is range checked before the cast"
    )]
    pub fn bin_of(&self, frequency: f64) -> Option<usize> {
        if !self.span().contains(frequency) {
            return None;
        }
        let offset = frequency - (self.center_frequency - self.sample_rate / 2.0);
        let bin = (offset / self.resolution_bandwidth).round().max(0.0) as usize;
        Some(bin.min(self.bin_count() - 1))
    }

    /// Frequency interval covered by all bins, edge to edge.
    #[must_use]
    pub fn span(&self) -> FrequencyRange {
        let half_bin = self.resolution_bandwidth / 2.0;
        FrequencyRange::new(
            self.frequency_of(0) - half_bin,
            self.frequency_of(self.bin_count() - 1) + half_bin,
        )
    }

    /// `(frequency_hz, power_db)` pairs from low to high frequency.
    pub fn bins(&self) -> impl Iterator<Item = (f64, f32)> + '_ {
        self.power_db
            .iter()
            .enumerate()
            .map(|(i, &p)| (self.frequency_of(i), p))
    }

    /// Strongest bin as `(frequency_hz, power_db)`.
    #[must_use]
    pub fn peak(&self) -> (f64, f32) {
        let (bin, power) = self
            .power_db
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });
        (self.frequency_of(bin), power)
    }
}

/// Windowed-FFT spectrum engine with running noise floor and peak hold.
pub struct SpectrumEngine {
    config: SpectrumConfig,
    planner: FftPlanner<f32>,
    fft: Option<Arc<dyn Fft<f32>>>,
    transform_size: usize,
    window: Vec<f32>,
    /// Squared coherent gain of `window`, used to normalize bin power
    window_gain: f32,
    noise_floor: Vec<f32>,
    peak_hold: Vec<f32>,
    spectra_processed: u64,
}

impl std::fmt::Debug for SpectrumEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumEngine")
            .field("config", &self.config)
            .field("transform_size", &self.transform_size)
            .field("spectra_processed", &self.spectra_processed)
            .finish_non_exhaustive()
    }
}

impl SpectrumEngine {
    #[must_use]
    pub fn new(config: SpectrumConfig) -> Self {
        Self {
            config,
            planner: FftPlanner::new(),
            fft: None,
            transform_size: 0,
            window: Vec::new(),
            window_gain: 1.0,
            noise_floor: Vec::new(),
            peak_hold: Vec::new(),
            spectra_processed: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SpectrumConfig {
        &self.config
    }

    /// Transform size used for the most recent block (0 before the first).
    #[must_use]
    pub fn transform_size(&self) -> usize {
        self.transform_size
    }

    /// Current per-bin noise floor estimate in dB.
    #[must_use]
    pub fn noise_floor(&self) -> &[f32] {
        &self.noise_floor
    }

    /// Decaying per-bin maximum in dB.
    #[must_use]
    pub fn peak_hold(&self) -> &[f32] {
        &self.peak_hold
    }

    #[must_use]
    pub fn spectra_processed(&self) -> u64 {
        self.spectra_processed
    }

    /// Forget the noise floor and peak hold history.
    pub fn reset(&mut self) {
        self.noise_floor.clear();
        self.peak_hold.clear();
        self.spectra_processed = 0;
    }

    /// Compute the power spectrum of `block` and update the running statistics.
    ///
    /// Blocks longer than the configured transform size grow the transform to
    /// the next power of two; shorter blocks are zero-padded.
    pub fn process(&mut self, block: SampleBlock) -> Spectrum {
        assert!(!block.is_empty(), "spectrum engine received an empty block");
        assert!(
            block.sample_rate() > 0.0,
            "spectrum engine received a block with non-positive sample rate"
        );

        let len = block.len();
        let size = len.max(self.config.fft_size).next_power_of_two();
        if size != self.transform_size {
            self.retune(size);
        }
        if self.window.len() != len {
            self.window = self.config.window.coefficients(len);
            let sum: f32 = self.window.iter().sum();
            self.window_gain = (sum * sum).max(f32::MIN_POSITIVE);
        }

        let mut buffer: Vec<Complex<f32>> = block
            .samples()
            .iter()
            .zip(&self.window)
            .map(|(&sample, &w)| sample * w)
            .collect();
        buffer.resize(size, Complex::new(0.0, 0.0));

        if let Some(fft) = &self.fft {
            fft.process(&mut buffer);
        }

        // FFT-shift so bin 0 is the most negative frequency.
        let half = size / 2;
        let floor_db = self.config.power_floor_db;
        let power_db: Vec<f32> = (0..size)
            .map(|k| {
                let power = buffer[(k + half) % size].norm_sqr() / self.window_gain;
                if power > 0.0 {
                    (10.0 * power.log10()).max(floor_db)
                } else {
                    floor_db
                }
            })
            .collect();

        self.update_noise_floor(&power_db);
        self.update_peak_hold(&power_db);
        self.spectra_processed += 1;

        Spectrum::new(
            block.start_timestamp(),
            block.center_frequency(),
            block.sample_rate(),
            power_db,
            self.noise_floor.clone(),
        )
    }

    fn retune(&mut self, size: usize) {
        debug!(
            "Transform size {} -> {}, resetting spectral statistics",
            self.transform_size, size
        );
        self.fft = Some(self.planner.plan_fft_forward(size));
        self.transform_size = size;
        self.noise_floor.clear();
        self.peak_hold.clear();
    }

    fn update_noise_floor(&mut self, power_db: &[f32]) {
        let level = median(power_db);
        let ceiling = level + self.config.noise_floor_clamp_db;
        let alpha = self.config.noise_floor_alpha.clamp(0.0, 1.0);

        if self.noise_floor.len() != power_db.len() {
            self.noise_floor = vec![level; power_db.len()];
        }

        for (floor, &power) in self.noise_floor.iter_mut().zip(power_db) {
            let observed = power.min(ceiling);
            *floor += alpha * (observed - *floor);
        }
    }

    fn update_peak_hold(&mut self, power_db: &[f32]) {
        if self.peak_hold.len() != power_db.len() {
            self.peak_hold = power_db.to_vec();
            return;
        }
        let decay = self.config.peak_decay_db;
        for (held, &power) in self.peak_hold.iter_mut().zip(power_db) {
            *held = power.max(*held - decay);
        }
    }
}

fn median(values: &[f32]) -> f32 {
    let mut sorted = values.to_vec();
    let mid = sorted.len() / 2;
    let (_, median, _) = sorted.select_nth_unstable_by(mid, f32::total_cmp);
    *median
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;

    fn tone_block(len: usize, sample_rate: f64, offset_hz: f64, amplitude: f64) -> SampleBlock {
        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, reason = "test signal")]
        let samples = (0..len)
            .map(|i| {
                let phase = TAU * offset_hz * i as f64 / sample_rate;
                Complex::new((amplitude * phase.cos()) as f32, (amplitude * phase.sin()) as f32)
            })
            .collect();
        SampleBlock::new(Duration::ZERO, sample_rate, 100e6, samples)
    }

    #[test]
    fn test_zero_block_stays_at_floor() {
        let config = SpectrumConfig::default();
        for (sample_rate, fft_size) in [(1e6, 256), (2e6, 1024), (2.4e6, 2048), (10e6, 4096)] {
            let mut engine = SpectrumEngine::new(SpectrumConfig {
                fft_size,
                ..config.clone()
            });
            let block = SampleBlock::new(
                Duration::ZERO,
                sample_rate,
                433.92e6,
                vec![Complex::new(0.0, 0.0); fft_size],
            );
            let spectrum = engine.process(block);
            assert_eq!(spectrum.bin_count(), fft_size);
            assert!(spectrum.power_db().iter().all(|&p| p <= config.power_floor_db));
            assert!(spectrum.noise_floor_db().iter().all(|&p| p <= config.power_floor_db));
        }
    }

    #[test]
    fn test_tone_lands_in_expected_bin() {
        let mut engine = SpectrumEngine::new(SpectrumConfig::default());
        let spectrum = engine.process(tone_block(1024, 2e6, 250e3, 0.5));

        let (peak_freq, peak_power) = spectrum.peak();
        assert!((peak_freq - 100.25e6).abs() < spectrum.resolution_bandwidth());
        // Coherent-gain normalization: amplitude 0.5 reads -6.02 dB
        assert!((peak_power + 6.02).abs() < 0.1, "peak power {peak_power}");
    }

    #[test]
    fn test_axis_matches_block() {
        let mut engine = SpectrumEngine::new(SpectrumConfig::default());
        let spectrum = engine.process(tone_block(1024, 2e6, 0.0, 0.1));

        assert_eq!(spectrum.center_frequency(), 100e6);
        assert_eq!(spectrum.sample_rate(), 2e6);
        assert!((spectrum.resolution_bandwidth() - 2e6 / 1024.0).abs() < 1e-9);
        assert!(spectrum.span().contains(100e6));
        assert_eq!(spectrum.bin_of(100e6), Some(512));
        assert_eq!(spectrum.bin_of(200e6), None);
    }

    #[test]
    fn test_transform_grows_to_fit_block() {
        let mut engine = SpectrumEngine::new(SpectrumConfig {
            fft_size: 256,
            ..Default::default()
        });
        let spectrum = engine.process(tone_block(700, 1e6, 0.0, 0.1));
        assert_eq!(spectrum.bin_count(), 1024);
        assert_eq!(engine.transform_size(), 1024);

        // Shorter blocks are zero-padded up to the configured size
        let spectrum = engine.process(tone_block(100, 1e6, 0.0, 0.1));
        assert_eq!(spectrum.bin_count(), 256);
    }

    #[test]
    fn test_deterministic() {
        let block = tone_block(1024, 2e6, 125e3, 0.3);
        let a = SpectrumEngine::new(SpectrumConfig::default()).process(block.clone());
        let b = SpectrumEngine::new(SpectrumConfig::default()).process(block);
        assert_eq!(a, b);
    }

    #[test]
    fn test_transient_peak_does_not_raise_floor() {
        let config = SpectrumConfig::default();
        let mut engine = SpectrumEngine::new(config.clone());

        // Low-level tone everywhere else gives the spectrum a defined median
        let quiet = tone_block(1024, 2e6, -500e3, 0.001);
        for _ in 0..5 {
            engine.process(quiet.clone());
        }

        let loud = tone_block(1024, 2e6, 250e3, 0.9);
        let spectrum = engine.process(loud);
        let bin = spectrum.bin_of(100.25e6).unwrap();
        let level = median(spectrum.power_db());

        assert!(spectrum.power_db()[bin] > -2.0);
        assert!(spectrum.noise_floor_db()[bin] <= level + config.noise_floor_clamp_db + 0.01);
    }

    #[test]
    fn test_peak_hold_decays() {
        let mut engine = SpectrumEngine::new(SpectrumConfig {
            peak_decay_db: 1.0,
            ..Default::default()
        });
        let loud = engine.process(tone_block(1024, 2e6, 250e3, 0.5));
        let bin = loud.bin_of(100.25e6).unwrap();
        let first = engine.peak_hold()[bin];

        engine.process(SampleBlock::new(
            Duration::from_millis(1),
            2e6,
            100e6,
            vec![Complex::new(0.0, 0.0); 1024],
        ));
        assert!((engine.peak_hold()[bin] - (first - 1.0)).abs() < 1e-4);
    }
}
