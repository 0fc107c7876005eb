//! Multichannel recorder
//!
//! Dual-thread recording pipeline:
//!
//! ```text
//! ┌─────────────────┐   gain + meters   ┌─────────────────┐
//! │ USB reader      │──────────────────►│  4 MiB SPSC     │
//! │ (capture.read)  │   in place        │  byte ring      │
//! └─────────────────┘                   └────────┬────────┘
//!                                                │ condvar kick
//!                                       ┌────────▼────────┐
//!                                       │ disk writer     │
//!                                       │ (256 KiB drains)│
//!                                       └─────────────────┘
//! ```
//!
//! The reader thread starts with monitoring (live level meters before any
//! file exists) and additionally feeds the ring once recording starts. The
//! disk thread blocks on a condition variable with a 10 ms bound and
//! drains the ring in large chunks so sustained disk latency never stalls
//! the USB side; a full ring costs a counted overflow, never a block.
//!
//! All cross-thread state is atomics; the controller polls metrics, nothing
//! calls back.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use crate::ring::{RingBuffer, RingConsumer, RingProducer};
use crate::types::{db_to_linear, pcm24_read, pcm24_write, Sample, BYTES_PER_SAMPLE, CHANNEL_COUNT, FRAME_SIZE, PCM24_FULL_SCALE, PCM24_MAX, PCM24_MIN};
use crate::usb::{CaptureError, UacCapture};
use crate::wav::{SampleFormat, WavFormat, WavWriter};

/// Ring between the USB reader and the disk writer
pub const RING_BUFFER_BYTES: usize = 4 * 1024 * 1024;
/// Disk writer drain chunk
pub const DISK_WRITE_CHUNK: usize = 256 * 1024;
/// Upper bound on recorder input gain
pub const MAX_GAIN_DB: f32 = 64.0;

const DISK_CV_TIMEOUT: Duration = Duration::from_millis(10);
const MIN_STAGING_BYTES: usize = 8 * 1024;
/// Gain smoothing time constant (seconds to ~63% of a step)
const GAIN_SMOOTHING_TAU: f32 = 0.050;
const GAIN_SNAP_EPSILON: f32 = 1e-4;
const PEAK_DECAY: f32 = 0.95;
const EMPTY_READ_WARN_THRESHOLD: u64 = 100;

/// Recorder state errors
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("WAV error: {0}")]
    Wav(#[from] crate::wav::WavError),

    #[error("not monitoring; call start_monitoring first")]
    NotMonitoring,

    #[error("recording already in progress")]
    AlreadyRecording,
}

/// Abstraction over the USB capture for the reader thread.
///
/// The recorder only needs this narrow surface, which keeps the pipeline
/// testable against a synthetic source.
pub trait CaptureSource: Send {
    fn start_streaming(&mut self) -> Result<(), CaptureError>;
    fn stop_streaming(&mut self);
    /// Read frame-aligned bytes; 0 when nothing is available yet
    fn read(&mut self, dest: &mut [u8]) -> usize;
    fn recommended_buffer_size(&self) -> usize;
    fn effective_sample_rate_rounded(&self) -> u32;
}

impl CaptureSource for UacCapture {
    fn start_streaming(&mut self) -> Result<(), CaptureError> {
        UacCapture::start_streaming(self)
    }

    fn stop_streaming(&mut self) {
        UacCapture::stop_streaming(self)
    }

    fn read(&mut self, dest: &mut [u8]) -> usize {
        UacCapture::read(self, dest)
    }

    fn recommended_buffer_size(&self) -> usize {
        UacCapture::recommended_buffer_size(self)
    }

    fn effective_sample_rate_rounded(&self) -> u32 {
        UacCapture::effective_sample_rate_rounded(self)
    }
}

/// Cross-thread recorder state (atomics only on the hot paths)
struct RecorderShared {
    is_monitoring: AtomicBool,
    is_recording: AtomicBool,
    /// Target linear gain as f32 bits
    gain_target: AtomicU32,
    /// Peak meter in [0, 1] as f32 bits, exponential fall-off
    peak_level: AtomicU32,
    clip_detected: AtomicBool,
    /// Recorded frames (counted only while recording)
    total_samples: AtomicU64,
    buffer_overflows: AtomicU64,
    /// Per-capsule RMS of the latest block
    channel_levels: Mutex<Vec<f32>>,
}

/// Disk thread wake-up: the bool tracks whether the thread should keep
/// running, the condvar is kicked on every ring push
struct DiskSignal {
    running: Mutex<bool>,
    wake: Condvar,
}

/// First-order gain smoother, advanced once per block
struct GainSmoother {
    current: f32,
    alpha: f32,
}

impl GainSmoother {
    fn step(&mut self, target: f32) -> f32 {
        if (self.current - target).abs() > GAIN_SNAP_EPSILON {
            self.current += (target - self.current) * self.alpha;
        } else {
            self.current = target;
        }
        self.current
    }
}

/// 84-channel recorder over a [`CaptureSource`]
pub struct Recorder {
    capture: Option<Box<dyn CaptureSource>>,
    shared: Arc<RecorderShared>,
    signal: Arc<DiskSignal>,
    /// Producer slot the reader thread pulls from when recording starts
    producer_slot: Arc<Mutex<Option<RingProducer>>>,

    reader_thread: Option<JoinHandle<Box<dyn CaptureSource>>>,
    disk_thread: Option<JoinHandle<WavWriter>>,

    effective_rate: u32,
}

impl Recorder {
    pub fn new(capture: Box<dyn CaptureSource>) -> Self {
        Self {
            capture: Some(capture),
            shared: Arc::new(RecorderShared {
                is_monitoring: AtomicBool::new(false),
                is_recording: AtomicBool::new(false),
                gain_target: AtomicU32::new(1.0f32.to_bits()),
                peak_level: AtomicU32::new(0f32.to_bits()),
                clip_detected: AtomicBool::new(false),
                total_samples: AtomicU64::new(0),
                buffer_overflows: AtomicU64::new(0),
                channel_levels: Mutex::new(vec![0.0; CHANNEL_COUNT]),
            }),
            signal: Arc::new(DiskSignal {
                running: Mutex::new(false),
                wake: Condvar::new(),
            }),
            producer_slot: Arc::new(Mutex::new(None)),
            reader_thread: None,
            disk_thread: None,
            effective_rate: 0,
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // State machine
    // ───────────────────────────────────────────────────────────────────

    /// Idle → Monitoring: start USB streaming and the reader thread so the
    /// host can show live levels. Idempotent.
    pub fn start_monitoring(&mut self, gain_db: f32) -> Result<(), RecorderError> {
        self.set_gain_db(gain_db);

        if self.shared.is_monitoring.load(Ordering::Acquire) {
            log::info!("Already monitoring");
            return Ok(());
        }

        let Some(mut capture) = self.capture.take() else {
            // Only reachable after a reader-thread panic lost the handle
            return Err(RecorderError::Capture(CaptureError::NotInitialized));
        };
        if let Err(e) = capture.start_streaming() {
            self.capture = Some(capture);
            return Err(e.into());
        }
        self.effective_rate = capture.effective_sample_rate_rounded();

        let staging_bytes = staging_size(capture.recommended_buffer_size());
        let block_frames = staging_bytes / FRAME_SIZE;
        let alpha = if self.effective_rate > 0 {
            let block_duration = block_frames as f32 / self.effective_rate as f32;
            1.0 - (-block_duration / GAIN_SMOOTHING_TAU).exp()
        } else {
            1.0
        };

        self.shared.clip_detected.store(false, Ordering::Relaxed);
        self.shared.is_monitoring.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let signal = self.signal.clone();
        let producer_slot = self.producer_slot.clone();
        let target = f32::from_bits(self.shared.gain_target.load(Ordering::Relaxed));

        let handle = std::thread::Builder::new()
            .name("usb-reader".to_string())
            .spawn(move || {
                reader_thread(capture, shared, signal, producer_slot, staging_bytes, GainSmoother {
                    current: target,
                    alpha,
                })
            })
            .expect("failed to spawn usb-reader thread");
        self.reader_thread = Some(handle);

        log::info!(
            "Monitoring started ({} byte staging, {:.0} Hz effective)",
            staging_bytes,
            self.effective_rate as f64
        );
        Ok(())
    }

    /// Monitoring → Recording against a filesystem path
    pub fn start_recording<P: AsRef<Path>>(
        &mut self,
        path: P,
        gain_db: f32,
    ) -> Result<(), RecorderError> {
        let writer = WavWriter::create(path, self.output_format()?)?;
        self.start_recording_with(writer, gain_db)
    }

    /// Monitoring → Recording against a pre-opened descriptor
    #[cfg(unix)]
    pub fn start_recording_fd(
        &mut self,
        fd: std::os::unix::io::RawFd,
        gain_db: f32,
    ) -> Result<(), RecorderError> {
        let writer = WavWriter::create_from_fd(fd, self.output_format()?)?;
        self.start_recording_with(writer, gain_db)
    }

    fn output_format(&self) -> Result<WavFormat, RecorderError> {
        if !self.shared.is_monitoring.load(Ordering::Acquire) {
            return Err(RecorderError::NotMonitoring);
        }
        if self.shared.is_recording.load(Ordering::Acquire) {
            return Err(RecorderError::AlreadyRecording);
        }
        Ok(WavFormat {
            sample_format: SampleFormat::Pcm,
            num_channels: CHANNEL_COUNT as u16,
            sample_rate: self.effective_rate,
            bits_per_sample: (BYTES_PER_SAMPLE * 8) as u16,
        })
    }

    fn start_recording_with(&mut self, writer: WavWriter, gain_db: f32) -> Result<(), RecorderError> {
        self.set_gain_db(gain_db);
        self.shared.total_samples.store(0, Ordering::Relaxed);
        self.shared.buffer_overflows.store(0, Ordering::Relaxed);
        self.shared.clip_detected.store(false, Ordering::Relaxed);

        let (producer, consumer) = RingBuffer::with_capacity(RING_BUFFER_BYTES);
        *self.producer_slot.lock().unwrap() = Some(producer);

        *self.signal.running.lock().unwrap() = true;
        let signal = self.signal.clone();
        let handle = std::thread::Builder::new()
            .name("disk-writer".to_string())
            .spawn(move || disk_thread(writer, consumer, signal))
            .expect("failed to spawn disk-writer thread");
        self.disk_thread = Some(handle);

        self.shared.is_recording.store(true, Ordering::Release);
        log::info!(
            "Recording started ({} channels, {} Hz, {} MiB ring)",
            CHANNEL_COUNT,
            self.effective_rate,
            RING_BUFFER_BYTES / (1024 * 1024)
        );
        Ok(())
    }

    /// Recording/Monitoring → Idle. Joins both threads, closes the file,
    /// frees the ring. Idempotent.
    pub fn stop(&mut self) {
        let was_recording = self.shared.is_recording.swap(false, Ordering::AcqRel);
        let was_monitoring = self.shared.is_monitoring.swap(false, Ordering::AcqRel);
        if !was_recording && !was_monitoring {
            return;
        }

        if let Some(handle) = self.reader_thread.take() {
            match handle.join() {
                Ok(capture) => self.capture = Some(capture),
                Err(_) => log::error!("USB reader thread panicked"),
            }
        }

        // Stop the disk thread after the reader so the final ring contents
        // get flushed
        {
            let mut running = self.signal.running.lock().unwrap();
            *running = false;
        }
        self.signal.wake.notify_one();
        if let Some(handle) = self.disk_thread.take() {
            match handle.join() {
                Ok(mut writer) => {
                    if let Err(e) = writer.close() {
                        log::error!("Failed to finalize recording: {}", e);
                    }
                }
                Err(_) => log::error!("Disk writer thread panicked"),
            }
        }

        *self.producer_slot.lock().unwrap() = None;

        if let Some(capture) = &mut self.capture {
            capture.stop_streaming();
        }

        if was_recording {
            log::info!(
                "Recording stopped: {} frames, {} overflows",
                self.shared.total_samples.load(Ordering::Relaxed),
                self.shared.buffer_overflows.load(Ordering::Relaxed)
            );
        } else {
            log::info!("Monitoring stopped");
        }
    }

    /// Alias for the full teardown; stopping monitoring while recording
    /// stops the recording first.
    pub fn stop_monitoring(&mut self) {
        self.stop();
    }

    // ───────────────────────────────────────────────────────────────────
    // Gain and metrics
    // ───────────────────────────────────────────────────────────────────

    /// Set the input gain target in dB, clamped to [0, 64]
    pub fn set_gain_db(&self, gain_db: f32) {
        let clamped = gain_db.clamp(0.0, MAX_GAIN_DB);
        self.shared
            .gain_target
            .store(db_to_linear(clamped).to_bits(), Ordering::Relaxed);
    }

    pub fn is_monitoring(&self) -> bool {
        self.shared.is_monitoring.load(Ordering::Acquire)
    }

    pub fn is_recording(&self) -> bool {
        self.shared.is_recording.load(Ordering::Acquire)
    }

    /// Recorded frames so far
    pub fn total_samples(&self) -> u64 {
        self.shared.total_samples.load(Ordering::Relaxed)
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.effective_rate == 0 {
            return 0.0;
        }
        self.total_samples() as f64 / self.effective_rate as f64
    }

    /// Peak meter in [0, 1] with exponential fall-off
    pub fn peak_level(&self) -> f32 {
        f32::from_bits(self.shared.peak_level.load(Ordering::Relaxed))
    }

    /// Sticky clip indicator
    pub fn clip_detected(&self) -> bool {
        self.shared.clip_detected.load(Ordering::Relaxed)
    }

    pub fn reset_clip_indicator(&self) {
        self.shared.clip_detected.store(false, Ordering::Relaxed);
    }

    pub fn buffer_overflows(&self) -> u64 {
        self.shared.buffer_overflows.load(Ordering::Relaxed)
    }

    /// Per-capsule RMS levels of the latest block
    pub fn channel_levels(&self) -> Vec<f32> {
        self.shared.channel_levels.lock().unwrap().clone()
    }

    /// Effective sample rate negotiated with the device (0 before
    /// monitoring starts)
    pub fn sample_rate(&self) -> u32 {
        self.effective_rate
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn staging_size(recommended: usize) -> usize {
    let bytes = recommended.max(MIN_STAGING_BYTES);
    bytes.div_ceil(FRAME_SIZE) * FRAME_SIZE
}

// ───────────────────────────────────────────────────────────────────────
// Reader thread
// ───────────────────────────────────────────────────────────────────────

fn reader_thread(
    mut capture: Box<dyn CaptureSource>,
    shared: Arc<RecorderShared>,
    signal: Arc<DiskSignal>,
    producer_slot: Arc<Mutex<Option<RingProducer>>>,
    staging_bytes: usize,
    mut gain: GainSmoother,
) -> Box<dyn CaptureSource> {
    log::info!("USB reader thread started");

    let mut staging = vec![0u8; staging_bytes];
    let mut consecutive_empty: u64 = 0;
    let mut total_bytes: u64 = 0;
    let mut overflow_logged: u64 = 0;

    while shared.is_monitoring.load(Ordering::Acquire) {
        let bytes_read = capture.read(&mut staging);
        if bytes_read == 0 {
            consecutive_empty += 1;
            if consecutive_empty == EMPTY_READ_WARN_THRESHOLD {
                log::warn!(
                    "{} consecutive empty USB reads ({} bytes so far)",
                    EMPTY_READ_WARN_THRESHOLD,
                    total_bytes
                );
            }
            std::thread::yield_now();
            continue;
        }
        consecutive_empty = 0;
        total_bytes += bytes_read as u64;

        let block = &mut staging[..bytes_read];
        process_block(block, &mut gain, &shared);

        if shared.is_recording.load(Ordering::Acquire) {
            let frames = (bytes_read / FRAME_SIZE) as u64;
            shared.total_samples.fetch_add(frames, Ordering::Relaxed);

            let mut slot = producer_slot.lock().unwrap();
            if let Some(producer) = slot.as_mut() {
                let written = producer.write(block);
                if written < block.len() {
                    let overflows = shared.buffer_overflows.fetch_add(1, Ordering::Relaxed) + 1;
                    if overflows >= overflow_logged + 10 || overflows == 1 {
                        overflow_logged = overflows;
                        log::error!(
                            "Recorder ring overflow #{}: disk writer is behind, lost {} bytes",
                            overflows,
                            block.len() - written
                        );
                    }
                }
            }
            drop(slot);
            signal.wake.notify_one();
        }
    }

    log::info!("USB reader thread finished ({} bytes read)", total_bytes);
    capture
}

/// Gain, clip detection and meters, in place over one staging block
fn process_block(block: &mut [u8], gain: &mut GainSmoother, shared: &RecorderShared) {
    let target = f32::from_bits(shared.gain_target.load(Ordering::Relaxed));
    let gain_now = gain.step(target);
    let unity = (gain_now - 1.0).abs() < 1e-6;

    let frames = block.len() / FRAME_SIZE;
    if frames == 0 {
        return;
    }

    let mut peak_block: f32 = 0.0;
    let mut channel_sums = [0.0f64; CHANNEL_COUNT];
    let mut clipped = false;

    for frame in 0..frames {
        let frame_base = frame * FRAME_SIZE;
        for channel in 0..CHANNEL_COUNT {
            let offset = frame_base + channel * BYTES_PER_SAMPLE;
            let bytes = &mut block[offset..offset + BYTES_PER_SAMPLE];
            let mut value = pcm24_read(bytes);

            if !unity {
                let scaled = value as f32 * gain_now;
                if scaled > PCM24_MAX as f32 {
                    value = PCM24_MAX;
                    clipped = true;
                } else if scaled < PCM24_MIN as f32 {
                    value = PCM24_MIN;
                    clipped = true;
                } else {
                    value = scaled as i32;
                }
                pcm24_write(value, bytes);
            } else if value >= PCM24_MAX || value <= PCM24_MIN {
                clipped = true;
            }

            let normalized = value as Sample / PCM24_FULL_SCALE;
            let magnitude = normalized.abs();
            if magnitude > peak_block {
                peak_block = magnitude;
            }
            channel_sums[channel] += (normalized * normalized) as f64;
        }
    }

    if clipped {
        shared.clip_detected.store(true, Ordering::Relaxed);
    }

    // peak = max(peak_block, previous × decay)
    let previous = f32::from_bits(shared.peak_level.load(Ordering::Relaxed));
    let next = peak_block.max(previous * PEAK_DECAY);
    shared.peak_level.store(next.to_bits(), Ordering::Relaxed);

    let mut levels = shared.channel_levels.lock().unwrap();
    for (level, sum) in levels.iter_mut().zip(channel_sums.iter()) {
        *level = (sum / frames as f64).sqrt() as f32;
    }
}

// ───────────────────────────────────────────────────────────────────────
// Disk thread
// ───────────────────────────────────────────────────────────────────────

fn disk_thread(mut writer: WavWriter, mut consumer: RingConsumer, signal: Arc<DiskSignal>) -> WavWriter {
    log::info!("Disk writer thread started");

    let mut chunk = vec![0u8; DISK_WRITE_CHUNK];
    let mut write_count: u64 = 0;

    loop {
        let running = { *signal.running.lock().unwrap() };

        if consumer.available_read() > 0 {
            let n = consumer.read(&mut chunk);
            if n > 0 {
                if let Err(e) = writer.write_data(&chunk[..n]) {
                    log::error!("Disk write failed: {}", e);
                }
                write_count += 1;
                if write_count % 100 == 0 {
                    let fill = consumer.available_read();
                    let metrics = consumer.metrics();
                    log::debug!(
                        "Disk writer: {} writes, {} MiB on disk, ring {:.1}% full",
                        write_count,
                        writer.data_size() / (1024 * 1024),
                        fill as f64 * 100.0 / metrics.capacity() as f64
                    );
                }
            }
            continue;
        }

        if !running {
            break;
        }

        let guard = signal.running.lock().unwrap();
        let _ = signal
            .wake
            .wait_timeout_while(guard, DISK_CV_TIMEOUT, |running| {
                *running && consumer.available_read() == 0
            });
    }

    // Reader has stopped by now; drain whatever is left
    loop {
        let n = consumer.read(&mut chunk);
        if n == 0 {
            break;
        }
        if let Err(e) = writer.write_data(&chunk[..n]) {
            log::error!("Disk write failed during flush: {}", e);
            break;
        }
    }

    log::info!(
        "Disk writer thread finished ({} bytes written)",
        writer.data_size()
    );
    writer
}
