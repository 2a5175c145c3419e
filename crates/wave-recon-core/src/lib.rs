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

//! Signal acquisition, spectrum analysis and detection for software-defined
//! radios.
//!
//! The crate is organized as a pipeline of independent layers:
//!
//! - **Source layer**: [`SampleSource`] implementations for RTL-SDR hardware
//!   (behind the `hardware` feature) and a deterministic simulated feed
//! - **Buffer layer**: a bounded, drop-oldest [`SampleBuffer`] between
//!   acquisition and analysis
//! - **Spectrum layer**: windowed FFT power spectra with a running noise floor
//! - **Detection layer**: thresholding, band merging, classification and
//!   persistence scoring
//! - **Session layer**: [`ModeController`], which binds a source mode and
//!   runs the pipeline on worker threads
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use wave_recon_core::{GainMode, ModeController, PipelineConfig, SourceKind};
//!
//! let mut controller = ModeController::new(PipelineConfig::default());
//! let _dispatcher = controller.subscribe_detections(|report| {
//!     for detection in &report.detections {
//!         println!(
//!             "{:.3} MHz {} ({:.0}%)",
//!             detection.peak_frequency / 1e6,
//!             detection.classification,
//!             detection.confidence * 100.0
//!         );
//!     }
//! });
//!
//! controller
//!     .start_session(SourceKind::Simulated, 100e6, 2e6, GainMode::Auto)
//!     .expect("simulated source always opens");
//! std::thread::sleep(Duration::from_secs(1));
//! controller.stop_session();
//! ```
//!
//! # Using Individual Layers
//!
//! The analysis stages run without threads for offline processing:
//!
//! ```
//! use std::time::Duration;
//! use wave_recon_core::{
//!     DetectionConfig, DetectionEngine, SampleSource, SimulatedSource, SimulationConfig,
//!     SourceConfig, SpectrumConfig, SpectrumEngine,
//! };
//!
//! let config = SourceConfig::default();
//! let simulation = SimulationConfig { realtime: false, ..Default::default() };
//! let mut source = SimulatedSource::open(&config, &simulation).unwrap();
//!
//! let mut spectra = SpectrumEngine::new(SpectrumConfig::default());
//! let mut detector = DetectionEngine::new(DetectionConfig::default());
//!
//! let block = source.read_block(Duration::from_secs(1)).unwrap();
//! let spectrum = spectra.process(block);
//! for detection in detector.process(&spectrum) {
//!     println!("{:?}", detection.frequency_range);
//! }
//! ```

pub mod buffer;
pub mod detection;
pub mod error;
pub mod session;
pub mod source;
pub mod spectrum;

pub use buffer::SampleBuffer;
pub use detection::{
    Detection, DetectionConfig, DetectionEngine, SignalClass, SpectrumHistory, SpectrumSummary,
};
pub use error::AcquisitionError;
pub use session::{
    AcquisitionSession, AnalysisStage, DetectionReport, ModeController, PipelineConfig,
    SessionStats, SessionStatus, SourceSelection,
};
pub use source::{
    list_devices, DeviceInfo, GainMode, HardwareOptions, HardwareSource, SampleBlock,
    SampleSource, SimulatedSource, SimulationConfig, SourceConfig, SourceKind, SyntheticSignal,
};
pub use spectrum::{FrequencyRange, Spectrum, SpectrumConfig, SpectrumEngine, WindowType};
