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

//! Signal detection over power spectra.
//!
//! Bins standing above the noise floor by a margin are merged into runs,
//! filtered by bandwidth, classified, and scored. Confidence blends the
//! margin with how persistently the same band was occupied in recent
//! spectra, tracked in a bounded [`SpectrumHistory`].

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::spectrum::{FrequencyRange, Spectrum};

/// Configuration for the detection engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// dB above the noise floor a bin must reach to count as occupied
    pub threshold_margin_db: f32,
    /// Runs narrower than this are discarded
    pub min_bandwidth_hz: f64,
    /// Upper bandwidth bound for narrowband carriers
    pub narrowband_max_hz: f64,
    /// Lower bandwidth bound for wideband digital signals
    pub wideband_min_hz: f64,
    /// Number of spectrum summaries kept for persistence scoring
    pub history_len: usize,
    /// Below this many summaries persistence is reported as neutral
    pub min_history: usize,
    /// Margin above threshold at which the margin term saturates
    pub margin_saturation_db: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold_margin_db: 12.0,
            min_bandwidth_hz: 2_500.0,
            narrowband_max_hz: 100_000.0,
            wideband_min_hz: 180_000.0,
            history_len: 8,
            min_history: 3,
            margin_saturation_db: 30.0,
        }
    }
}

/// Coarse signal classification by occupied bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalClass {
    Unknown,
    NarrowbandCarrier,
    WidebandDigital,
}

impl fmt::Display for SignalClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::NarrowbandCarrier => write!(f, "narrowband"),
            Self::WidebandDigital => write!(f, "wideband"),
        }
    }
}

/// A contiguous band of occupied spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Stream time of the spectrum this detection came from
    pub timestamp: Duration,
    pub frequency_range: FrequencyRange,
    pub peak_frequency: f64,
    pub peak_power_db: f32,
    /// Noise floor estimate at the peak bin
    pub noise_floor_db: f32,
    pub estimated_bandwidth: f64,
    pub classification: SignalClass,
    /// Score in [0, 1]
    pub confidence: f32,
}

impl Detection {
    /// Peak power above the noise floor, in dB.
    #[must_use]
    pub fn margin_db(&self) -> f32 {
        self.peak_power_db - self.noise_floor_db
    }
}

/// Occupied bands of one past spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumSummary {
    pub timestamp: Duration,
    pub occupied: Vec<FrequencyRange>,
}

impl SpectrumSummary {
    #[must_use]
    pub fn from_detections(timestamp: Duration, detections: &[Detection]) -> Self {
        Self {
            timestamp,
            occupied: detections.iter().map(|d| d.frequency_range).collect(),
        }
    }

    #[must_use]
    pub fn overlaps(&self, range: &FrequencyRange) -> bool {
        self.occupied.iter().any(|r| r.overlaps(range))
    }
}

/// Fixed-size ring of recent [`SpectrumSummary`] entries.
#[derive(Debug, Clone)]
pub struct SpectrumHistory {
    entries: VecDeque<SpectrumSummary>,
    capacity: usize,
}

impl SpectrumHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a summary, evicting the oldest once full.
    pub fn record(&mut self, summary: SpectrumSummary) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(summary);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpectrumSummary> {
        self.entries.iter()
    }

    /// Number of entries with an occupied band overlapping `range`.
    #[must_use]
    pub fn overlapping(&self, range: &FrequencyRange) -> usize {
        self.entries.iter().filter(|s| s.overlaps(range)).count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Threshold, merge, classify, and score.
#[derive(Debug, Clone)]
pub struct DetectionEngine {
    config: DetectionConfig,
    history: SpectrumHistory,
}

impl DetectionEngine {
    #[must_use]
    pub fn new(config: DetectionConfig) -> Self {
        let history = SpectrumHistory::new(config.history_len);
        Self { config, history }
    }

    #[must_use]
    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    #[must_use]
    pub fn history(&self) -> &SpectrumHistory {
        &self.history
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Detect against the engine's own history, then record this spectrum.
    pub fn process(&mut self, spectrum: &Spectrum) -> Vec<Detection> {
        let detections = self.detect(spectrum, &self.history);
        self.history.record(SpectrumSummary::from_detections(
            spectrum.timestamp(),
            &detections,
        ));
        detections
    }

    /// Find occupied bands in `spectrum`, scoring persistence against `history`.
    #[must_use]
    pub fn detect(&self, spectrum: &Spectrum, history: &SpectrumHistory) -> Vec<Detection> {
        let rbw = spectrum.resolution_bandwidth();
        let power = spectrum.power_db();
        let floor = spectrum.noise_floor_db();
        let threshold = self.config.threshold_margin_db;

        let detections: Vec<Detection> = occupied_runs(power, floor, threshold)
            .into_iter()
            .filter_map(|(first, last)| {
                let bins = last - first + 1;
                #[allow(clippy::cast_precision_loss, reason = "bin counts are far below 2^52")]
                let bandwidth = bins as f64 * rbw;
                if bins < 2 || bandwidth < self.config.min_bandwidth_hz {
                    return None;
                }

                let peak_bin = (first..=last)
                    .max_by(|&a, &b| power[a].total_cmp(&power[b]))
                    .unwrap_or(first);
                let frequency_range = FrequencyRange::new(
                    spectrum.frequency_of(first) - rbw / 2.0,
                    spectrum.frequency_of(last) + rbw / 2.0,
                );
                let margin = power[peak_bin] - floor[peak_bin];

                Some(Detection {
                    timestamp: spectrum.timestamp(),
                    frequency_range,
                    peak_frequency: spectrum.frequency_of(peak_bin),
                    peak_power_db: power[peak_bin],
                    noise_floor_db: floor[peak_bin],
                    estimated_bandwidth: bandwidth,
                    classification: self.classify(bandwidth),
                    confidence: self.confidence(margin, &frequency_range, history),
                })
            })
            .collect();

        debug!(
            "{} detection(s) at t={:.3}s",
            detections.len(),
            spectrum.timestamp().as_secs_f64()
        );
        detections
    }

    fn classify(&self, bandwidth: f64) -> SignalClass {
        if bandwidth <= self.config.narrowband_max_hz {
            SignalClass::NarrowbandCarrier
        } else if bandwidth >= self.config.wideband_min_hz {
            SignalClass::WidebandDigital
        } else {
            SignalClass::Unknown
        }
    }

    fn confidence(&self, margin: f32, range: &FrequencyRange, history: &SpectrumHistory) -> f32 {
        let saturation = self.config.margin_saturation_db.max(f32::EPSILON);
        let margin_term = ((margin - self.config.threshold_margin_db) / saturation).clamp(0.0, 1.0);

        let persistence = if history.len() < self.config.min_history {
            0.5
        } else {
            #[allow(clippy::cast_precision_loss, reason = "history is a handful of entries")]
            let ratio = (history.overlapping(range) + 1) as f32 / (history.len() + 1) as f32;
            ratio
        };

        (0.5 * margin_term + 0.5 * persistence).clamp(0.0, 1.0)
    }
}

/// Inclusive `(first, last)` bin runs standing above `floor + margin`.
fn occupied_runs(power: &[f32], floor: &[f32], margin: f32) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = None;
    for (i, (&p, &f)) in power.iter().zip(floor).enumerate() {
        match (p > f + margin, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push((s, i - 1));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, power.len() - 1));
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    const CENTER: f64 = 100e6;
    const RATE: f64 = 2e6;
    const BINS: usize = 1024;

    fn flat_spectrum(timestamp: Duration) -> Spectrum {
        Spectrum::new(timestamp, CENTER, RATE, vec![-100.0; BINS], vec![-100.0; BINS])
    }

    fn with_peak(spectrum: Spectrum, frequency: f64, bandwidth: f64, power_db: f32) -> Spectrum {
        let band = FrequencyRange::new(frequency - bandwidth / 2.0, frequency + bandwidth / 2.0);
        let power = (0..spectrum.bin_count())
            .map(|bin| {
                if band.contains(spectrum.frequency_of(bin)) {
                    power_db
                } else {
                    spectrum.power_db()[bin]
                }
            })
            .collect();
        Spectrum::new(
            spectrum.timestamp(),
            spectrum.center_frequency(),
            spectrum.sample_rate(),
            power,
            spectrum.noise_floor_db().to_vec(),
        )
    }

    #[test]
    fn test_single_peak_single_detection() {
        let engine = DetectionEngine::new(DetectionConfig::default());
        let history = SpectrumHistory::new(8);

        for (bandwidth, class) in [
            (50e3, SignalClass::NarrowbandCarrier),
            (140e3, SignalClass::Unknown),
            (300e3, SignalClass::WidebandDigital),
        ] {
            let spectrum = with_peak(flat_spectrum(Duration::ZERO), 100.3e6, bandwidth, -40.0);
            let detections = engine.detect(&spectrum, &history);

            assert_eq!(detections.len(), 1, "bandwidth {bandwidth}");
            let detection = &detections[0];
            assert!(detection.frequency_range.contains(100.3e6));
            assert!(detection.frequency_range.is_within(&spectrum.span()));
            assert_eq!(detection.classification, class);
            assert!((detection.estimated_bandwidth - bandwidth).abs() < 2.0 * spectrum.resolution_bandwidth());
            assert!((detection.margin_db() - 60.0).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn test_quiet_spectrum_has_no_detections() {
        let engine = DetectionEngine::new(DetectionConfig::default());
        let spectrum = flat_spectrum(Duration::ZERO);
        assert!(engine.detect(&spectrum, &SpectrumHistory::new(8)).is_empty());
    }

    #[test]
    fn test_single_bin_spike_rejected() {
        let engine = DetectionEngine::new(DetectionConfig {
            min_bandwidth_hz: 0.0,
            ..Default::default()
        });
        let mut power = vec![-100.0; BINS];
        power[300] = -20.0;
        let spectrum = Spectrum::new(Duration::ZERO, CENTER, RATE, power, vec![-100.0; BINS]);
        assert!(engine.detect(&spectrum, &SpectrumHistory::new(8)).is_empty());
    }

    #[test]
    fn test_min_bandwidth_filter() {
        let mut power = vec![-100.0; BINS];
        power[300] = -20.0;
        power[301] = -20.0;
        let spectrum = Spectrum::new(Duration::ZERO, CENTER, RATE, power, vec![-100.0; BINS]);
        let history = SpectrumHistory::new(8);

        // Two bins at ~1953 Hz each clear the 2.5 kHz default
        let engine = DetectionEngine::new(DetectionConfig::default());
        assert_eq!(engine.detect(&spectrum, &history).len(), 1);

        let engine = DetectionEngine::new(DetectionConfig {
            min_bandwidth_hz: 5_000.0,
            ..Default::default()
        });
        assert!(engine.detect(&spectrum, &history).is_empty());
    }

    #[test]
    fn test_adjacent_runs_stay_separate() {
        let spectrum = with_peak(flat_spectrum(Duration::ZERO), 99.5e6, 20e3, -50.0);
        let spectrum = with_peak(spectrum, 100.5e6, 20e3, -50.0);
        let engine = DetectionEngine::new(DetectionConfig::default());

        let detections = engine.detect(&spectrum, &SpectrumHistory::new(8));
        assert_eq!(detections.len(), 2);
        assert!(detections[0].frequency_range.contains(99.5e6));
        assert!(detections[1].frequency_range.contains(100.5e6));
    }

    #[test]
    fn test_persistence_neutral_then_rises() {
        let mut engine = DetectionEngine::new(DetectionConfig::default());
        let mut confidences = Vec::new();
        for i in 0..5 {
            let spectrum = with_peak(
                flat_spectrum(Duration::from_millis(i)),
                100.5e6,
                50e3,
                -40.0,
            );
            let detections = engine.process(&spectrum);
            assert_eq!(detections.len(), 1);
            confidences.push(detections[0].confidence);
        }

        // Margin term saturates, persistence is neutral for the first three
        assert!(confidences[..3].iter().all(|&c| (c - 0.75).abs() < 1e-6));
        assert!((confidences[3] - 1.0).abs() < 1e-6);
        assert!((confidences[4] - 1.0).abs() < 1e-6);
        assert_eq!(engine.history().len(), 5);
    }

    #[test]
    fn test_persistence_penalizes_new_signal() {
        let mut engine = DetectionEngine::new(DetectionConfig::default());
        for i in 0..4 {
            engine.process(&flat_spectrum(Duration::from_millis(i)));
        }
        let spectrum = with_peak(flat_spectrum(Duration::from_millis(4)), 100.5e6, 50e3, -40.0);
        let detections = engine.process(&spectrum);

        // Margin term 1.0, persistence 1 / 5
        assert!((detections[0].confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = SpectrumHistory::new(3);
        for i in 0..10 {
            history.record(SpectrumSummary {
                timestamp: Duration::from_millis(i),
                occupied: Vec::new(),
            });
        }
        assert_eq!(history.len(), 3);
        assert_eq!(
            history.iter().next().map(|s| s.timestamp),
            Some(Duration::from_millis(7))
        );
    }
}
