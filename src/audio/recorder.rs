//! Audio input capture to 32-bit float WAV
//!
//! `start_recording` spawns a dedicated capture thread that owns both the
//! cpal input stream and the WAV writer: the stream callback pushes raw
//! samples into a lock-free ring buffer, the thread pops fixed-size
//! blocks, meters them (with optional automatic gain), and writes them
//! out. `stop_recording` sets a flag, joins the thread and validates the
//! finished file by re-opening it.

use hound::{SampleFormat, WavSpec, WavWriter};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};

use super::device;
use crate::error::{EngineError, Result};

/// Frames per processed block.
const CAPTURE_BLOCK_FRAMES: usize = 256;

/// Minimum free space to start a recording.
const MIN_START_BYTES: u64 = 10 * 1024 * 1024;

/// Free space below this requests a stop mid-recording.
const MIN_RUNNING_BYTES: u64 = 1024 * 1024;

/// Gain slew factors: slow when raising gain, faster when lowering it.
const GAIN_ATTACK: f32 = 0.01;
const GAIN_RELEASE: f32 = 0.05;
const GAIN_MIN: f32 = 0.1;
const GAIN_MAX: f32 = 10.0;

/// Level meter smoothing.
const PEAK_SMOOTHING: f32 = 0.3;
const RMS_SMOOTHING: f32 = 0.1;

#[inline]
fn f32_to_u32(f: f32) -> u32 {
    f.to_bits()
}

#[inline]
fn u32_to_f32(u: u32) -> f32 {
    f32::from_bits(u)
}

/// Metadata returned by `stop_recording`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecordingInfo {
    pub file_path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_count: u64,
}

/// Metering and gain state shared with the capture thread.
struct Metering {
    peak_bits: AtomicU32,
    rms_bits: AtomicU32,
    gain_bits: AtomicU32,
    target_bits: AtomicU32,
    auto_gain: AtomicBool,
    frames_written: AtomicU64,
}

impl Metering {
    fn new() -> Self {
        Self {
            peak_bits: AtomicU32::new(f32_to_u32(0.0)),
            rms_bits: AtomicU32::new(f32_to_u32(0.0)),
            gain_bits: AtomicU32::new(f32_to_u32(1.0)),
            target_bits: AtomicU32::new(f32_to_u32(0.5)),
            auto_gain: AtomicBool::new(false),
            frames_written: AtomicU64::new(0),
        }
    }

    fn reset_levels(&self) {
        self.peak_bits.store(f32_to_u32(0.0), Ordering::Relaxed);
        self.rms_bits.store(f32_to_u32(0.0), Ordering::Relaxed);
        self.gain_bits.store(f32_to_u32(1.0), Ordering::Relaxed);
        self.frames_written.store(0, Ordering::Relaxed);
    }
}

struct CaptureThread {
    handle: thread::JoinHandle<Result<RecordingInfo>>,
    stop: Arc<AtomicBool>,
}

pub struct AudioRecorder {
    metering: Arc<Metering>,
    is_recording: AtomicBool,
    thread: Mutex<Option<CaptureThread>>,
}

impl Default for AudioRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioRecorder {
    pub fn new() -> Self {
        Self {
            metering: Arc::new(Metering::new()),
            is_recording: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::SeqCst)
    }

    pub fn peak_level(&self) -> f32 {
        u32_to_f32(self.metering.peak_bits.load(Ordering::Relaxed))
    }

    pub fn rms_level(&self) -> f32 {
        u32_to_f32(self.metering.rms_bits.load(Ordering::Relaxed))
    }

    pub fn current_gain(&self) -> f32 {
        u32_to_f32(self.metering.gain_bits.load(Ordering::Relaxed))
    }

    pub fn set_auto_gain_enabled(&self, enabled: bool) {
        self.metering.auto_gain.store(enabled, Ordering::Relaxed);
        log::info!("auto gain control {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_auto_gain_enabled(&self) -> bool {
        self.metering.auto_gain.load(Ordering::Relaxed)
    }

    pub fn set_target_level(&self, level: f32) {
        self.metering
            .target_bits
            .store(f32_to_u32(level.clamp(0.1, 0.9)), Ordering::Relaxed);
    }

    pub fn target_level(&self) -> f32 {
        u32_to_f32(self.metering.target_bits.load(Ordering::Relaxed))
    }

    /// Starts capturing the default input device to a 32-bit float WAV
    /// file. If the device negotiates a different format than requested,
    /// the actual values are used for the WAV header.
    pub fn start_recording(&self, file_path: &str, sample_rate: u32, channels: u16) -> Result<()> {
        if !(1..=2).contains(&channels) {
            return Err(EngineError::InvalidArgument(format!(
                "invalid channel count: {channels} (must be 1 or 2)"
            )));
        }
        if !(8000..=192_000).contains(&sample_rate) {
            return Err(EngineError::InvalidArgument(format!("invalid sample rate: {sample_rate}")));
        }

        let mut thread_slot = self.thread.lock();
        if self.is_recording.load(Ordering::SeqCst) || thread_slot.is_some() {
            return Err(EngineError::InvalidState("recording already in progress".to_string()));
        }

        let path = PathBuf::from(file_path);
        let check_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        if let Some(available) = available_bytes(&check_dir) {
            if available < MIN_START_BYTES {
                return Err(EngineError::Io(std::io::Error::other(format!(
                    "insufficient storage: {available} bytes available"
                ))));
            }
        }

        self.metering.reset_levels();

        let stop = Arc::new(AtomicBool::new(false));
        let metering = Arc::clone(&self.metering);
        let thread_stop = Arc::clone(&stop);
        let thread_path = path.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(u32, u16), String>>();

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                capture_thread(thread_path, sample_rate, channels, thread_stop, metering, ready_tx)
            })
            .map_err(EngineError::Io)?;

        match ready_rx.recv() {
            Ok(Ok((actual_rate, actual_channels))) => {
                log::info!(
                    "recording started: {file_path} ({actual_rate} Hz, {actual_channels} ch)"
                );
                self.is_recording.store(true, Ordering::SeqCst);
                *thread_slot = Some(CaptureThread { handle, stop });
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = handle.join();
                Err(EngineError::Device(message))
            }
            Err(_) => {
                let _ = handle.join();
                Err(EngineError::Device("capture thread exited before starting".to_string()))
            }
        }
    }

    /// Stops the capture, joins the reader thread, zeroes metering state
    /// and returns the finished file's metadata after validating that it
    /// re-opens as a WAV.
    pub fn stop_recording(&self) -> Result<RecordingInfo> {
        let capture = self
            .thread
            .lock()
            .take()
            .ok_or_else(|| EngineError::InvalidState("no recording in progress".to_string()))?;

        capture.stop.store(true, Ordering::SeqCst);
        let result = capture
            .handle
            .join()
            .unwrap_or_else(|_| Err(EngineError::Device("capture thread panicked".to_string())));

        self.is_recording.store(false, Ordering::SeqCst);
        self.metering.reset_levels();

        let info = result?;

        // Confirm the finished file decodes
        match hound::WavReader::open(&info.file_path) {
            Ok(reader) => {
                let spec = reader.spec();
                log::info!(
                    "recording validated: {} frames, {} Hz, {} ch",
                    reader.duration(),
                    spec.sample_rate,
                    spec.channels
                );
            }
            Err(e) => {
                log::error!("recording validation failed: {e}");
            }
        }

        log::info!(
            "recording stopped: {:.2}s, {} frames",
            info.duration_seconds,
            info.frame_count
        );
        Ok(info)
    }
}

impl Drop for AudioRecorder {
    fn drop(&mut self) {
        if self.thread.lock().is_some() {
            let _ = self.stop_recording();
        }
    }
}

fn capture_thread(
    path: PathBuf,
    requested_rate: u32,
    requested_channels: u16,
    stop: Arc<AtomicBool>,
    metering: Arc<Metering>,
    ready_tx: mpsc::Sender<std::result::Result<(u32, u16), String>>,
) -> Result<RecordingInfo> {
    let setup = (|| -> Result<(cpal::Device, cpal::StreamConfig)> {
        let input_device = device::get_default_input_device()?;
        let config = device::get_input_config_for(&input_device, requested_rate, requested_channels)?;
        Ok((input_device, config))
    })();

    let (input_device, stream_config) = match setup {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return Err(e);
        }
    };

    let actual_rate = stream_config.sample_rate.0;
    let actual_channels = stream_config.channels;

    let spec = WavSpec {
        channels: actual_channels,
        sample_rate: actual_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = match WavWriter::create(&path, spec) {
        Ok(writer) => writer,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("failed to create WAV writer: {e}")));
            return Err(EngineError::Io(std::io::Error::other(e.to_string())));
        }
    };

    // One second of headroom between the stream callback and this thread
    let ring = HeapRb::<f32>::new((actual_rate as usize) * actual_channels as usize);
    let (mut producer, mut consumer) = ring.split();

    let stream = match input_device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            // Drop samples when the ring is full
            for &sample in data {
                let _ = producer.try_push(sample);
            }
        },
        move |err| {
            log::error!("input stream error: {err}");
        },
        None,
    ) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("failed to build input stream: {e}")));
            return Err(EngineError::Device(e.to_string()));
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(format!("failed to start input stream: {e}")));
        return Err(EngineError::Device(e.to_string()));
    }
    let _ = ready_tx.send(Ok((actual_rate, actual_channels)));

    let block_len = CAPTURE_BLOCK_FRAMES * actual_channels as usize;
    let mut block = vec![0.0f32; block_len];
    let mut frames_written: u64 = 0;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let popped = consumer.pop_slice(&mut block);
        if popped == 0 {
            thread::sleep(Duration::from_millis(1));
            continue;
        }

        let samples = &mut block[..popped];
        let auto_gain = metering.auto_gain.load(Ordering::Relaxed);
        let target = u32_to_f32(metering.target_bits.load(Ordering::Relaxed));
        let gain = u32_to_f32(metering.gain_bits.load(Ordering::Relaxed));
        let (peak, rms, new_gain) = process_capture_block(samples, auto_gain, target, gain);
        metering.gain_bits.store(f32_to_u32(new_gain), Ordering::Relaxed);

        // Smooth the exposed levels
        let smoothed_peak =
            u32_to_f32(metering.peak_bits.load(Ordering::Relaxed)) * (1.0 - PEAK_SMOOTHING)
                + peak * PEAK_SMOOTHING;
        let smoothed_rms =
            u32_to_f32(metering.rms_bits.load(Ordering::Relaxed)) * (1.0 - RMS_SMOOTHING)
                + rms * RMS_SMOOTHING;
        metering.peak_bits.store(f32_to_u32(smoothed_peak), Ordering::Relaxed);
        metering.rms_bits.store(f32_to_u32(smoothed_rms), Ordering::Relaxed);

        let mut write_failed = false;
        for &sample in samples.iter() {
            if writer.write_sample(sample).is_err() {
                write_failed = true;
                break;
            }
        }
        if write_failed {
            log::error!("WAV write error after {frames_written} frames");
            let check_dir =
                path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
            if let Some(available) = available_bytes(&check_dir) {
                if available < MIN_RUNNING_BYTES {
                    log::error!("storage space critically low: {available} bytes");
                }
            }
            stop.store(true, Ordering::SeqCst);
            break;
        }
        frames_written += (popped / actual_channels as usize) as u64;
        metering.frames_written.store(frames_written, Ordering::Relaxed);
    }

    // Stop the stream before finalizing so no more samples arrive
    drop(stream);
    writer
        .finalize()
        .map_err(|e| EngineError::Io(std::io::Error::other(e.to_string())))?;

    Ok(RecordingInfo {
        file_path: path.display().to_string(),
        duration_seconds: frames_written as f64 / actual_rate as f64,
        sample_rate: actual_rate,
        channels: actual_channels,
        frame_count: frames_written,
    })
}

/// Meters one block and applies automatic gain in place. Returns the
/// post-gain peak and RMS plus the slewed gain.
fn process_capture_block(
    samples: &mut [f32],
    auto_gain: bool,
    target_level: f32,
    current_gain: f32,
) -> (f32, f32, f32) {
    let (mut peak, mut rms) = measure(samples);
    let mut gain = current_gain;

    if auto_gain && rms > 1e-3 {
        let desired = target_level / rms;
        let factor = if desired > gain { GAIN_ATTACK } else { GAIN_RELEASE };
        gain = (gain + (desired - gain) * factor).clamp(GAIN_MIN, GAIN_MAX);
        for sample in samples.iter_mut() {
            *sample *= gain;
        }
        let remeasured = measure(samples);
        peak = remeasured.0;
        rms = remeasured.1;
    }

    (peak, rms, gain)
}

fn measure(samples: &[f32]) -> (f32, f32) {
    let mut peak = 0.0f32;
    let mut sum_squares = 0.0f32;
    for &sample in samples {
        peak = peak.max(sample.abs());
        sum_squares += sample * sample;
    }
    let rms = if samples.is_empty() { 0.0 } else { (sum_squares / samples.len() as f32).sqrt() };
    (peak, rms)
}

#[cfg(unix)]
fn available_bytes(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated string and stat is a
    // properly sized out-parameter.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc == 0 {
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn available_bytes(_path: &Path) -> Option<u64> {
    None
}
