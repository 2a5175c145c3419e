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

//! Session lifecycle and source mode control.
//!
//! [`ModeController`] owns the bound source selection and, while a session
//! runs, two worker threads:
//!
//! ```text
//! SampleSource -> [acquisition] -> SampleBuffer -> [analysis] -> broadcast
//! ```
//!
//! The acquisition worker is generic over the concrete [`SampleSource`], so
//! the hardware/simulated choice is fixed when the session starts.

mod worker;

pub use worker::AnalysisStage;

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer::SampleBuffer;
use crate::detection::{Detection, DetectionConfig};
use crate::error::AcquisitionError;
use crate::source::{
    GainMode, HardwareOptions, HardwareSource, SampleSource, SimulatedSource, SimulationConfig,
    SourceConfig, SourceKind,
};
use crate::spectrum::{Spectrum, SpectrumConfig};
use worker::Shared;

/// Lifecycle state of an acquisition session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Stopped,
    Running,
    /// The device failed mid-session; `stop` returns to `Stopped`.
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Which source the next session will open, with its source-specific options.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSelection {
    Hardware(HardwareOptions),
    Simulated(SimulationConfig),
}

impl SourceSelection {
    #[must_use]
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Hardware(_) => SourceKind::Hardware,
            Self::Simulated(_) => SourceKind::Simulated,
        }
    }
}

impl Default for SourceSelection {
    fn default() -> Self {
        Self::Hardware(HardwareOptions::default())
    }
}

/// The running (or failed) session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSession {
    pub id: Uuid,
    pub mode: SourceKind,
    pub center_frequency: f64,
    pub sample_rate: f64,
    pub gain: GainMode,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
}

/// Block counters for the current or most recent session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub blocks_acquired: u64,
    pub blocks_processed: u64,
    /// Evicted from a full buffer
    pub blocks_dropped: u64,
    /// Refused for not advancing the stream clock
    pub blocks_rejected: u64,
}

/// Detections from one processed spectrum, published even when empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub sequence: u64,
    /// Stream time of the analyzed block
    pub timestamp: Duration,
    pub published_at: DateTime<Utc>,
    pub detections: Vec<Detection>,
}

/// Pipeline tuning shared by every session of a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Blocks held between acquisition and analysis
    pub buffer_capacity: usize,
    /// Bounded wait per source read; also bounds stop latency
    pub read_timeout: Duration,
    /// Broadcast channel depth for reports and spectra
    pub event_capacity: usize,
    pub spectrum: SpectrumConfig,
    pub detection: DetectionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 16,
            read_timeout: Duration::from_millis(500),
            event_capacity: 64,
            spectrum: SpectrumConfig::default(),
            detection: DetectionConfig::default(),
        }
    }
}

struct Workers {
    cancel: CancellationToken,
    buffer: Arc<SampleBuffer>,
    acquisition: JoinHandle<()>,
    analysis: JoinHandle<()>,
}

/// Binds a source mode and runs acquisition sessions against it.
pub struct ModeController {
    config: PipelineConfig,
    selection: SourceSelection,
    shared: Arc<Shared>,
    workers: Option<Workers>,
    reports: broadcast::Sender<DetectionReport>,
    spectra: broadcast::Sender<Arc<Spectrum>>,
}

impl fmt::Debug for ModeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeController")
            .field("mode", &self.selection.kind())
            .field("status", &self.status())
            .field("subscribers", &self.reports.receiver_count())
            .finish_non_exhaustive()
    }
}

impl ModeController {
    /// Create a stopped controller bound to the hardware source.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        let capacity = config.event_capacity.max(1);
        let (reports, _) = broadcast::channel(capacity);
        let (spectra, _) = broadcast::channel(capacity);
        Self {
            config,
            selection: SourceSelection::default(),
            shared: Arc::new(Shared::default()),
            workers: None,
            reports,
            spectra,
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Snapshot of the current session, if one was started and not stopped.
    #[must_use]
    pub fn session(&self) -> Option<AcquisitionSession> {
        self.shared.session().clone()
    }

    /// Counters for the current session, or the last one after `stop`.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }

    /// Source kind the next `start` will open.
    #[must_use]
    pub fn bound_mode(&self) -> SourceKind {
        self.selection.kind()
    }

    #[must_use]
    pub fn selection(&self) -> &SourceSelection {
        &self.selection
    }

    /// Bind the simulated source with its default configuration.
    pub fn set_simulation_mode(&mut self) -> Result<(), AcquisitionError> {
        self.set_simulation_mode_with(SimulationConfig::default())
    }

    pub fn set_simulation_mode_with(
        &mut self,
        options: SimulationConfig,
    ) -> Result<(), AcquisitionError> {
        self.ensure_stopped("switch to simulation mode")?;
        info!("Bound simulated source ({} synthetic signals)", options.signals.len());
        self.selection = SourceSelection::Simulated(options);
        Ok(())
    }

    /// Bind the hardware source with device 0 and no PPM correction.
    pub fn set_hardware_mode(&mut self) -> Result<(), AcquisitionError> {
        self.set_hardware_mode_with(HardwareOptions::default())
    }

    pub fn set_hardware_mode_with(&mut self, options: HardwareOptions) -> Result<(), AcquisitionError> {
        self.ensure_stopped("switch to hardware mode")?;
        info!("Bound hardware source (device {})", options.device_index);
        self.selection = SourceSelection::Hardware(options);
        Ok(())
    }

    /// Open the bound source and start the acquisition and analysis workers.
    ///
    /// Fails with [`AcquisitionError::InvalidStateTransition`] unless the
    /// controller is stopped. If the source cannot be opened the controller
    /// stays stopped.
    pub fn start(&mut self, config: SourceConfig) -> Result<(), AcquisitionError> {
        self.ensure_stopped("start")?;
        config.validate()?;

        match self.selection.clone() {
            SourceSelection::Hardware(options) => self.launch::<HardwareSource>(&config, &options),
            SourceSelection::Simulated(options) => self.launch::<SimulatedSource>(&config, &options),
        }
    }

    /// Bind `mode` if it differs from the current one, then start a session.
    ///
    /// Options already bound for the same mode are kept.
    pub fn start_session(
        &mut self,
        mode: SourceKind,
        center_frequency: f64,
        sample_rate: f64,
        gain: GainMode,
    ) -> Result<(), AcquisitionError> {
        if mode != self.bound_mode() {
            match mode {
                SourceKind::Hardware => self.set_hardware_mode()?,
                SourceKind::Simulated => self.set_simulation_mode()?,
            }
        }
        self.start(SourceConfig {
            center_frequency,
            sample_rate,
            gain,
            ..SourceConfig::default()
        })
    }

    /// Stop the session, if any, and wait for both workers to exit.
    ///
    /// A session in [`SessionStatus::Error`] publishes every block acquired
    /// before the failure first. Always succeeds; calling it on a stopped
    /// controller is a no-op.
    pub fn stop(&mut self) {
        let Some(workers) = self.workers.take() else {
            debug!("Stop requested with no session running");
            *self.shared.session() = None;
            return;
        };

        // After a disconnect the acquisition worker has already closed the
        // buffer; let analysis drain and publish what was acquired.
        if self.status() == SessionStatus::Error {
            info!("Stopping failed session, flushing buffered blocks...");
        } else {
            info!("Stopping acquisition session...");
            workers.cancel.cancel();
        }
        workers.buffer.close();

        if workers.acquisition.join().is_err() {
            error!("Acquisition worker panicked");
        }
        if workers.analysis.join().is_err() {
            error!("Analysis worker panicked");
        }

        let discarded = workers.buffer.clear();
        if discarded > 0 {
            debug!("Discarded {discarded} unprocessed blocks");
        }

        let stats = self.stats();
        *self.shared.session() = None;
        info!(
            "Session stopped: {} acquired, {} processed, {} dropped, {} rejected",
            stats.blocks_acquired, stats.blocks_processed, stats.blocks_dropped, stats.blocks_rejected
        );
    }

    /// Alias of [`ModeController::stop`].
    pub fn stop_session(&mut self) {
        self.stop();
    }

    /// Receive every [`DetectionReport`] published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DetectionReport> {
        self.reports.subscribe()
    }

    /// Receive every spectrum computed from now on.
    #[must_use]
    pub fn subscribe_spectra(&self) -> broadcast::Receiver<Arc<Spectrum>> {
        self.spectra.subscribe()
    }

    /// Run `callback` on a dispatcher thread for each published report.
    ///
    /// The thread ends once the controller is dropped. A callback that
    /// falls behind skips the oldest reports rather than slowing analysis.
    pub fn subscribe_detections<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(&DetectionReport) + Send + 'static,
    {
        let mut rx = self.reports.subscribe();
        std::thread::spawn(move || loop {
            match rx.blocking_recv() {
                Ok(report) => callback(&report),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Detection subscriber lagged, skipped {skipped} reports");
                }
                Err(RecvError::Closed) => break,
            }
        })
    }

    fn ensure_stopped(&self, action: &'static str) -> Result<(), AcquisitionError> {
        match self.status() {
            SessionStatus::Stopped => Ok(()),
            status => Err(AcquisitionError::InvalidStateTransition { status, action }),
        }
    }

    fn launch<S>(&mut self, config: &SourceConfig, options: &S::Options) -> Result<(), AcquisitionError>
    where
        S: SampleSource + 'static,
    {
        let source = S::open(config, options)?;
        let mode = source.kind();

        let session = AcquisitionSession {
            id: Uuid::new_v4(),
            mode,
            center_frequency: config.center_frequency,
            sample_rate: config.sample_rate,
            gain: config.gain,
            status: SessionStatus::Running,
            started_at: Utc::now(),
        };
        info!(
            "Starting {} session {} at {:.3} MHz, {:.3} MS/s, gain {}",
            mode,
            session.id,
            config.center_frequency / 1e6,
            config.sample_rate / 1e6,
            config.gain
        );

        self.shared.reset_counters();
        *self.shared.session() = Some(session);

        let buffer = Arc::new(SampleBuffer::new(self.config.buffer_capacity.max(1)));
        let cancel = CancellationToken::new();

        let acquisition = {
            let buffer = Arc::clone(&buffer);
            let cancel = cancel.clone();
            let shared = Arc::clone(&self.shared);
            let timeout = self.config.read_timeout;
            std::thread::spawn(move || worker::acquisition_loop(source, buffer, cancel, shared, timeout))
        };

        let analysis = {
            let stage = AnalysisStage::new(&self.config);
            let buffer = Arc::clone(&buffer);
            let cancel = cancel.clone();
            let shared = Arc::clone(&self.shared);
            let reports = self.reports.clone();
            let spectra = self.spectra.clone();
            std::thread::spawn(move || {
                worker::analysis_loop(stage, buffer, cancel, shared, reports, spectra);
            })
        };

        self.workers = Some(Workers {
            cancel,
            buffer,
            acquisition,
            analysis,
        });
        Ok(())
    }
}

impl Drop for ModeController {
    fn drop(&mut self) {
        self.stop();
    }
}
