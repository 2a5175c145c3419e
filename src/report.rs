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

//! Detection report output: terminal lines, JSON lines, and CSV files.

use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use wave_recon_core::{Detection, DetectionReport, SignalClass};

/// Minimum spacing between terminal summaries in text mode.
const PRINT_INTERVAL: Duration = Duration::from_secs(1);

/// One CSV row per detection.
#[derive(Debug, Serialize)]
struct DetectionRecord {
    sequence: u64,
    stream_time_s: f64,
    published_at: String,
    start_hz: f64,
    end_hz: f64,
    peak_hz: f64,
    peak_power_db: f32,
    noise_floor_db: f32,
    bandwidth_hz: f64,
    classification: SignalClass,
    confidence: f32,
}

impl DetectionRecord {
    fn new(report: &DetectionReport, detection: &Detection) -> Self {
        Self {
            sequence: report.sequence,
            stream_time_s: detection.timestamp.as_secs_f64(),
            published_at: report.published_at.to_rfc3339(),
            start_hz: detection.frequency_range.start_hz,
            end_hz: detection.frequency_range.end_hz,
            peak_hz: detection.peak_frequency,
            peak_power_db: detection.peak_power_db,
            noise_floor_db: detection.noise_floor_db,
            bandwidth_hz: detection.estimated_bandwidth,
            classification: detection.classification,
            confidence: detection.confidence,
        }
    }
}

/// Writes published reports to the terminal and, optionally, a CSV sink.
#[derive(Debug)]
pub struct ReportWriter<W: Write> {
    csv: Option<csv::Writer<W>>,
    json: bool,
    last_printed: Option<Instant>,
    reports: u64,
    detections: u64,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(csv_sink: Option<W>, json: bool) -> Self {
        Self {
            csv: csv_sink.map(csv::Writer::from_writer),
            json,
            last_printed: None,
            reports: 0,
            detections: 0,
        }
    }

    pub fn reports(&self) -> u64 {
        self.reports
    }

    pub fn detections(&self) -> u64 {
        self.detections
    }

    pub fn write(&mut self, report: &DetectionReport) -> Result<()> {
        self.reports += 1;
        self.detections += report.detections.len() as u64;

        if let Some(csv) = self.csv.as_mut() {
            for detection in &report.detections {
                csv.serialize(DetectionRecord::new(report, detection))
                    .context("failed to write CSV row")?;
            }
        }

        if self.json {
            if !report.detections.is_empty() {
                println!("{}", serde_json::to_string(report)?);
            }
        } else if self.should_print() && !report.detections.is_empty() {
            print_report(report);
        }
        Ok(())
    }

    /// Flush the CSV sink and hand it back.
    pub fn finish(self) -> Result<Option<W>> {
        self.csv
            .map(|mut csv| {
                csv.flush().context("failed to flush CSV report")?;
                csv.into_inner()
                    .map_err(|e| anyhow!("failed to flush CSV report: {}", e.error()))
            })
            .transpose()
    }

    fn should_print(&mut self) -> bool {
        let now = Instant::now();
        match self.last_printed {
            Some(last) if now.duration_since(last) < PRINT_INTERVAL => false,
            _ => {
                self.last_printed = Some(now);
                true
            }
        }
    }
}

fn print_report(report: &DetectionReport) {
    println!(
        "[{:>8.3}s] {} signal(s)",
        report.timestamp.as_secs_f64(),
        report.detections.len()
    );
    for detection in &report.detections {
        println!(
            "  {:>10.4} MHz  {:>7.1} kHz  {:>6.1} dB (+{:.1})  {:<10}  {:>3.0}%",
            detection.peak_frequency / 1e6,
            detection.estimated_bandwidth / 1e3,
            detection.peak_power_db,
            detection.margin_db(),
            detection.classification.to_string(),
            detection.confidence * 100.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wave_recon_core::FrequencyRange;

    fn detection(start_hz: f64, end_hz: f64, classification: SignalClass) -> Detection {
        Detection {
            timestamp: Duration::from_millis(5),
            frequency_range: FrequencyRange::new(start_hz, end_hz),
            peak_frequency: (start_hz + end_hz) / 2.0,
            peak_power_db: -47.0,
            noise_floor_db: -110.0,
            estimated_bandwidth: end_hz - start_hz,
            classification,
            confidence: 0.75,
        }
    }

    fn report(sequence: u64, detections: Vec<Detection>) -> DetectionReport {
        DetectionReport {
            sequence,
            timestamp: Duration::from_millis(5),
            published_at: Utc::now(),
            detections,
        }
    }

    #[test]
    fn test_csv_row_per_detection() {
        let mut writer = ReportWriter::new(Some(Vec::new()), true);
        writer
            .write(&report(
                0,
                vec![
                    detection(100.475e6, 100.525e6, SignalClass::NarrowbandCarrier),
                    detection(101.0e6, 101.2e6, SignalClass::WidebandDigital),
                ],
            ))
            .unwrap();
        writer.write(&report(1, Vec::new())).unwrap();

        assert_eq!(writer.reports(), 2);
        assert_eq!(writer.detections(), 2);

        let bytes = writer.finish().unwrap().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("sequence,stream_time_s,published_at,start_hz"));
        assert!(lines[1].contains("narrowband_carrier"));
        assert!(lines[2].contains("wideband_digital"));
    }

    #[test]
    fn test_without_csv_sink() {
        let mut writer: ReportWriter<Vec<u8>> = ReportWriter::new(None, false);
        writer.write(&report(0, Vec::new())).unwrap();
        assert!(writer.finish().unwrap().is_none());
    }
}
