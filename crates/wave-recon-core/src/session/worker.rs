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

//! Acquisition and analysis worker loops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{AcquisitionSession, DetectionReport, PipelineConfig, SessionStats, SessionStatus};
use crate::buffer::SampleBuffer;
use crate::detection::DetectionEngine;
use crate::error::AcquisitionError;
use crate::source::{SampleBlock, SampleSource};
use crate::spectrum::{Spectrum, SpectrumEngine};

/// Log a statistics line every this many processed blocks.
const STATS_INTERVAL: u64 = 500;

/// Overflow warnings are emitted for the first drop and then every this many.
const OVERFLOW_WARN_INTERVAL: u64 = 100;

/// State shared between the controller and its workers.
#[derive(Debug, Default)]
pub(super) struct Shared {
    pub session: Mutex<Option<AcquisitionSession>>,
    pub blocks_acquired: AtomicU64,
    pub blocks_processed: AtomicU64,
    pub blocks_dropped: AtomicU64,
    pub blocks_rejected: AtomicU64,
}

impl Shared {
    pub fn session(&self) -> std::sync::MutexGuard<'_, Option<AcquisitionSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> SessionStatus {
        self.session()
            .as_ref()
            .map_or(SessionStatus::Stopped, |s| s.status)
    }

    fn set_status(&self, status: SessionStatus) {
        if let Some(session) = self.session().as_mut() {
            session.status = status;
        }
    }

    pub fn reset_counters(&self) {
        for counter in [
            &self.blocks_acquired,
            &self.blocks_processed,
            &self.blocks_dropped,
            &self.blocks_rejected,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            blocks_acquired: self.blocks_acquired.load(Ordering::Relaxed),
            blocks_processed: self.blocks_processed.load(Ordering::Relaxed),
            blocks_dropped: self.blocks_dropped.load(Ordering::Relaxed),
            blocks_rejected: self.blocks_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Spectrum and detection stages, run back to back on each block.
#[derive(Debug)]
pub struct AnalysisStage {
    spectrum: SpectrumEngine,
    detection: DetectionEngine,
    sequence: u64,
}

impl AnalysisStage {
    #[must_use]
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            spectrum: SpectrumEngine::new(config.spectrum.clone()),
            detection: DetectionEngine::new(config.detection.clone()),
            sequence: 0,
        }
    }

    /// Transform one block and run detection over the result.
    pub fn analyze(&mut self, block: SampleBlock) -> (Spectrum, DetectionReport) {
        let spectrum = self.spectrum.process(block);
        let detections = self.detection.process(&spectrum);
        let report = DetectionReport {
            sequence: self.sequence,
            timestamp: spectrum.timestamp(),
            published_at: Utc::now(),
            detections,
        };
        self.sequence += 1;
        (spectrum, report)
    }

    #[must_use]
    pub fn spectrum_engine(&self) -> &SpectrumEngine {
        &self.spectrum
    }

    #[must_use]
    pub fn detection_engine(&self) -> &DetectionEngine {
        &self.detection
    }
}

/// Read blocks from `source` into `buffer` until cancelled or the device fails.
///
/// The buffer is closed on exit so the analysis worker drains what was
/// acquired and then finishes.
pub(super) fn acquisition_loop<S: SampleSource>(
    mut source: S,
    buffer: Arc<SampleBuffer>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    read_timeout: Duration,
) {
    info!("Acquisition worker started ({} source)", source.kind());

    while !cancel.is_cancelled() {
        let block = match source.read_block(read_timeout) {
            Ok(block) => block,
            Err(AcquisitionError::Timeout) => {
                debug!("No samples within {read_timeout:?}, retrying");
                continue;
            }
            Err(e) if e.is_fatal_to_session() => {
                error!("Acquisition failed: {e}");
                shared.set_status(SessionStatus::Error);
                break;
            }
            Err(e) => {
                warn!("Read error: {e}");
                continue;
            }
        };
        shared.blocks_acquired.fetch_add(1, Ordering::Relaxed);

        match buffer.push(block) {
            Ok(()) => {}
            Err(AcquisitionError::BufferOverflow { dropped }) => {
                shared.blocks_dropped.store(dropped, Ordering::Relaxed);
                if dropped == 1 || dropped % OVERFLOW_WARN_INTERVAL == 0 {
                    warn!("Analysis is falling behind: {dropped} blocks dropped");
                }
            }
            Err(e @ AcquisitionError::OutOfOrder { .. }) => {
                shared.blocks_rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Rejected block: {e}");
            }
            Err(AcquisitionError::BufferClosed) => break,
            Err(e) => warn!("Unexpected buffer error: {e}"),
        }
    }

    source.close();
    buffer.close();
    info!(
        "Acquisition worker stopped after {} blocks",
        shared.blocks_acquired.load(Ordering::Relaxed)
    );
}

/// Analyze buffered blocks and publish the results until the buffer is
/// drained or the session is cancelled.
pub(super) fn analysis_loop(
    mut stage: AnalysisStage,
    buffer: Arc<SampleBuffer>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    reports: broadcast::Sender<DetectionReport>,
    spectra: broadcast::Sender<Arc<Spectrum>>,
) {
    info!("Analysis worker started");
    let mut detections_since_log = 0usize;

    while let Some(block) = buffer.pop() {
        if cancel.is_cancelled() {
            break;
        }

        let (spectrum, report) = stage.analyze(block);
        detections_since_log += report.detections.len();

        // Sends only fail when nobody is subscribed.
        let _ = spectra.send(Arc::new(spectrum));
        let _ = reports.send(report);

        let processed = shared.blocks_processed.fetch_add(1, Ordering::Relaxed) + 1;
        if processed % STATS_INTERVAL == 0 {
            info!(
                "Processed {processed} blocks, {detections_since_log} detections in the last {STATS_INTERVAL}, {} dropped",
                shared.blocks_dropped.load(Ordering::Relaxed)
            );
            detections_since_log = 0;
        }
    }

    info!(
        "Analysis worker stopped after {} blocks",
        shared.blocks_processed.load(Ordering::Relaxed)
    );
}
