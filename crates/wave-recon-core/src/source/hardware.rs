//! RTL-SDR hardware source.
//!
//! The device handle is not `Send`, so a dedicated reader thread opens,
//! configures and owns it for its whole life. Samples reach the acquisition
//! thread through a bounded channel. Enable the `hardware` feature to compile
//! with RTL-SDR support; without it every open reports the device as
//! unavailable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{SampleBlock, SampleSource, SourceConfig, SourceKind};
use crate::error::AcquisitionError;

/// Information about an RTL-SDR device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device index (0-based)
    pub index: u32,
    /// Device name (manufacturer + product)
    pub name: String,
    /// Device serial number
    pub serial: String,
}

/// Options that only make sense for physical hardware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareOptions {
    /// Device index to open
    pub device_index: u32,
    /// Frequency correction in PPM
    pub ppm_correction: i32,
}

/// Enumerate available RTL-SDR devices.
#[cfg(feature = "hardware")]
#[must_use]
pub fn list_devices() -> Vec<DeviceInfo> {
    let count = rtlsdr::get_device_count();
    let mut devices = Vec::new();

    #[allow(clippy::cast_sign_loss, reason = "device indices are non-negative")]
    for i in 0..count {
        let name = rtlsdr::get_device_name(i);
        if let Ok(usb_strings) = rtlsdr::get_device_usb_strings(i) {
            devices.push(DeviceInfo {
                index: i as u32,
                name,
                serial: usb_strings.serial,
            });
        }
    }

    devices
}

/// Enumerate available RTL-SDR devices (always empty without the `hardware` feature).
#[cfg(not(feature = "hardware"))]
#[must_use]
pub fn list_devices() -> Vec<DeviceInfo> {
    log::warn!("RTL-SDR hardware support not compiled (enable 'hardware' feature)");
    Vec::new()
}

/// RTL-SDR sample source.
#[cfg(feature = "hardware")]
#[derive(Debug)]
pub struct HardwareSource {
    config: SourceConfig,
    device_index: u32,
    chunks: std::sync::mpsc::Receiver<imp::Chunk>,
    pending: Vec<num_complex::Complex<f32>>,
    pending_start: u64,
    stop_flag: std::sync::Arc<std::sync::atomic::AtomicBool>,
    reader: Option<std::thread::JoinHandle<()>>,
}

#[cfg(feature = "hardware")]
impl HardwareSource {
    #[must_use]
    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    fn take_block(&mut self) -> SampleBlock {
        let n = self.config.block_size;
        let rest = self.pending.split_off(n);
        let samples = std::mem::replace(&mut self.pending, rest);
        let block = SampleBlock::new(
            super::sample_timestamp(self.pending_start, self.config.sample_rate),
            self.config.sample_rate,
            self.config.center_frequency,
            samples,
        );
        self.pending_start += n as u64;
        block
    }
}

#[cfg(feature = "hardware")]
impl SampleSource for HardwareSource {
    type Options = HardwareOptions;

    fn open(config: &SourceConfig, options: &HardwareOptions) -> Result<Self, AcquisitionError> {
        config.validate()?;

        let count = rtlsdr::get_device_count();
        if count <= 0 {
            return Err(AcquisitionError::DeviceUnavailable(
                "no RTL-SDR devices detected".to_string(),
            ));
        }

        let (chunks, stop_flag, reader) = imp::spawn_reader(config, options)?;

        Ok(Self {
            config: config.clone(),
            device_index: options.device_index,
            chunks,
            pending: Vec::with_capacity(config.block_size * 2),
            pending_start: 0,
            stop_flag,
            reader: Some(reader),
        })
    }

    fn read_block(&mut self, timeout: Duration) -> Result<SampleBlock, AcquisitionError> {
        use std::sync::mpsc::RecvTimeoutError;

        let deadline = std::time::Instant::now() + timeout;

        while self.pending.len() < self.config.block_size {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.chunks.recv_timeout(remaining) {
                Ok(chunk) => {
                    // A gap means the reader dropped chunks; restart the block
                    // at the new position so timestamps stay truthful.
                    let expected = self.pending_start + self.pending.len() as u64;
                    if chunk.first_sample != expected {
                        log::warn!(
                            "RTL-SDR stream gap: expected sample {}, got {} (discarding {} partial samples)",
                            expected,
                            chunk.first_sample,
                            self.pending.len()
                        );
                        self.pending.clear();
                        self.pending_start = chunk.first_sample;
                    }
                    self.pending.extend_from_slice(&chunk.samples);
                }
                Err(RecvTimeoutError::Timeout) => return Err(AcquisitionError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AcquisitionError::DeviceDisconnected(format!(
                        "RTL-SDR device {} stopped delivering samples",
                        self.device_index
                    )));
                }
            }
        }

        Ok(self.take_block())
    }

    fn close(&mut self) {
        self.stop_flag.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            log::info!("Waiting for RTL-SDR reader thread to finish...");
            match handle.join() {
                Ok(()) => log::info!("RTL-SDR reader thread stopped"),
                Err(_) => log::error!("RTL-SDR reader thread panicked"),
            }
        }
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Hardware
    }
}

#[cfg(feature = "hardware")]
impl Drop for HardwareSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "hardware")]
mod imp {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;

    use num_complex::Complex;

    use super::{HardwareOptions, SourceConfig};
    use crate::error::AcquisitionError;
    use crate::source::GainMode;

    /// RTL-SDR requires read sizes that are multiples of 512 bytes (USB packet size).
    const READ_SIZE: usize = 262_144;
    /// Chunks queued between the reader thread and `read_block`.
    const CHUNK_QUEUE_DEPTH: usize = 8;
    const INIT_TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Debug)]
    pub(super) struct Chunk {
        pub first_sample: u64,
        pub samples: Vec<Complex<f32>>,
    }

    type Reader = (mpsc::Receiver<Chunk>, Arc<AtomicBool>, JoinHandle<()>);

    fn configure(
        device: &mut rtlsdr::RTLSDRDevice,
        config: &SourceConfig,
        options: &HardwareOptions,
    ) -> Result<(), String> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "range checked below")]
        let center_freq = config.center_frequency as u64;
        let center_freq: u32 = center_freq
            .try_into()
            .map_err(|e| format!("center frequency {center_freq} Hz is too large for RTL-SDR: {e}"))?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "RTL-SDR rates fit in u32")]
        let sample_rate = config.sample_rate as u32;

        device
            .set_center_freq(center_freq)
            .map_err(|e| format!("failed to set center frequency: {e:?}"))?;
        device
            .set_sample_rate(sample_rate)
            .map_err(|e| format!("failed to set sample rate: {e:?}"))?;

        match config.gain {
            GainMode::Auto => device
                .set_tuner_gain_mode(false)
                .map_err(|e| format!("failed to set gain mode: {e:?}"))?,
            GainMode::Manual(tenths_db) => {
                device
                    .set_tuner_gain_mode(true)
                    .map_err(|e| format!("failed to set gain mode: {e:?}"))?;
                device
                    .set_tuner_gain(tenths_db)
                    .map_err(|e| format!("failed to set gain: {e:?}"))?;
            }
        }

        if options.ppm_correction != 0 {
            device
                .set_freq_correction(options.ppm_correction)
                .map_err(|e| format!("failed to set PPM correction: {e:?}"))?;
        }

        device
            .reset_buffer()
            .map_err(|e| format!("failed to reset buffer: {e:?}"))?;

        Ok(())
    }

    /// Convert interleaved uint8 I/Q (0-255, centered at 127.5) to -1.0..1.0.
    fn convert(buf: &[u8]) -> Vec<Complex<f32>> {
        buf.chunks_exact(2)
            .map(|iq| {
                Complex::new(
                    (f32::from(iq[0]) - 127.5) / 127.5,
                    (f32::from(iq[1]) - 127.5) / 127.5,
                )
            })
            .collect()
    }

    pub(super) fn spawn_reader(
        config: &SourceConfig,
        options: &HardwareOptions,
    ) -> Result<Reader, AcquisitionError> {
        let (chunk_tx, chunk_rx) = mpsc::sync_channel::<Chunk>(CHUNK_QUEUE_DEPTH);
        let (init_tx, init_rx) = mpsc::channel::<Result<(), String>>();
        let stop_flag = Arc::new(AtomicBool::new(false));

        let config = config.clone();
        let options = options.clone();
        let thread_stop = Arc::clone(&stop_flag);

        let handle = std::thread::spawn(move || {
            log::info!("Opening RTL-SDR device {}...", options.device_index);

            #[allow(clippy::cast_possible_wrap, reason = "rtlsdr expects i32 indices")]
            let mut device = match rtlsdr::open(options.device_index as i32) {
                Ok(dev) => dev,
                Err(e) => {
                    let _ = init_tx.send(Err(format!(
                        "failed to open RTL-SDR device {}: {e:?}",
                        options.device_index
                    )));
                    return;
                }
            };

            if let Err(e) = configure(&mut device, &config, &options) {
                let _ = init_tx.send(Err(e));
                return;
            }

            log::info!("RTL-SDR configured:");
            log::info!("  Center frequency: {:.3} MHz", config.center_frequency / 1e6);
            log::info!("  Sample rate: {:.3} MHz", config.sample_rate / 1e6);
            log::info!("  Gain: {}", config.gain);
            log::info!("  PPM correction: {}", options.ppm_correction);

            let _ = init_tx.send(Ok(()));

            let mut read_count = 0u64;
            let mut next_sample = 0u64;
            let mut dropped_chunks = 0u64;

            while !thread_stop.load(Ordering::Relaxed) {
                match device.read_sync(READ_SIZE) {
                    Ok(buf) => {
                        read_count += 1;
                        let samples = convert(&buf);
                        let len = samples.len() as u64;
                        let chunk = Chunk {
                            first_sample: next_sample,
                            samples,
                        };
                        next_sample += len;

                        // Never block the USB read loop; a full queue drops the chunk.
                        match chunk_tx.try_send(chunk) {
                            Ok(()) => {}
                            Err(mpsc::TrySendError::Full(_)) => {
                                dropped_chunks += 1;
                                if dropped_chunks % 100 == 1 {
                                    log::warn!("RTL-SDR chunk queue full ({dropped_chunks} chunks dropped)");
                                }
                            }
                            Err(mpsc::TrySendError::Disconnected(_)) => break,
                        }

                        if read_count % 1000 == 0 {
                            log::debug!("RTL-SDR read #{read_count}: {} bytes", buf.len());
                        }
                    }
                    Err(e) => {
                        log::error!("RTL-SDR read error after {read_count} successful reads: {e:?}");
                        log::error!("  The device may have been unplugged or claimed by another process");
                        break;
                    }
                }
            }

            log::info!("RTL-SDR read loop exited after {read_count} reads, closing device");
            drop(device);
        });

        match init_rx.recv_timeout(INIT_TIMEOUT) {
            Ok(Ok(())) => Ok((chunk_rx, stop_flag, handle)),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(AcquisitionError::DeviceUnavailable(e))
            }
            Err(_) => {
                stop_flag.store(true, Ordering::Relaxed);
                Err(AcquisitionError::DeviceUnavailable(
                    "RTL-SDR initialization timed out".to_string(),
                ))
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_convert_centers_samples() {
            let samples = convert(&[0, 255, 128, 127]);
            assert_eq!(samples.len(), 2);
            assert!((samples[0].re + 1.0).abs() < 1e-6);
            assert!((samples[0].im - 1.0).abs() < 1e-6);
            assert!(samples[1].re.abs() < 0.01);
        }
    }
}

/// Stub implementation when the `hardware` feature is disabled.
#[cfg(not(feature = "hardware"))]
#[derive(Debug)]
pub struct HardwareSource {
    _private: (),
}

#[cfg(not(feature = "hardware"))]
impl SampleSource for HardwareSource {
    type Options = HardwareOptions;

    fn open(_config: &SourceConfig, _options: &HardwareOptions) -> Result<Self, AcquisitionError> {
        Err(AcquisitionError::DeviceUnavailable(
            "RTL-SDR hardware support not compiled (enable 'hardware' feature)".to_string(),
        ))
    }

    fn read_block(&mut self, _timeout: Duration) -> Result<SampleBlock, AcquisitionError> {
        Err(AcquisitionError::DeviceDisconnected(
            "RTL-SDR hardware support not compiled".to_string(),
        ))
    }

    fn close(&mut self) {}

    fn kind(&self) -> SourceKind {
        SourceKind::Hardware
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "hardware"))]
    #[test]
    fn test_open_without_feature_is_unavailable() {
        let result = HardwareSource::open(&SourceConfig::default(), &HardwareOptions::default());
        assert!(matches!(result, Err(AcquisitionError::DeviceUnavailable(_))));
    }

    #[cfg(not(feature = "hardware"))]
    #[test]
    fn test_list_devices_without_feature_is_empty() {
        assert!(list_devices().is_empty());
    }
}
