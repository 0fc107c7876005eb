//! Playback engine
//!
//! Plays 84-channel recordings three ways:
//!
//! - *Direct*: channel 0 duplicated to both stereo outputs (raw array
//!   audition, no rendering);
//! - *Convolved, pre-rendered*: the whole file is convolved offline against
//!   the preset IR matrix into a stereo cache file, which then plays like a
//!   normal stereo source (zero realtime DSP cost, exportable);
//! - *Convolved, realtime*: a worker thread convolves ahead of the audio
//!   callback through an SPSC ring (instant preset audition, no cache).
//!
//! The audio callback never blocks: in realtime mode it only drains the
//! ring; in the file modes it takes the (uncontended) source mutex, reads
//! one block and scales it. The controller thread is the single caller of
//! every command; progress is polled through atomics.

mod sink;
mod worker;

pub use sink::{AudioSink, CpalSink, SinkCallback, SinkError};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::convolver::{ConvolverError, IrError, IrLoader, IrPreset, MatrixConvolver};
use crate::ring::{RingBuffer, RingConsumer};
use crate::types::{db_to_linear, linear_to_db, pcm24_write, CHANNEL_COUNT};
use crate::wav::{SampleFormat, WavError, WavFormat, WavReader, WavWriter};

/// Fixed processing and sink block size in frames
pub const BUFFER_FRAMES: usize = 4096;
/// Blocks the realtime worker buffers before playback starts
pub const REALTIME_PRIMING_CHUNKS: usize = 3;
/// How long `play` waits for priming before proceeding anyway
pub const PRIMING_DEADLINE: Duration = Duration::from_millis(200);
/// Upper bound on playback gain
pub const MAX_PLAYBACK_GAIN_DB: f32 = 48.0;
/// Cache file name used when no preset-specific name is configured
pub const DEFAULT_CACHE_NAME: &str = "playback_cache.wav";

/// 24-bit positive full scale used when quantizing the pre-render
const PRE_RENDER_SCALE: f32 = 8_388_607.0;

/// Playback errors. Realtime paths never produce these; they are counted
/// and logged instead.
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("WAV error: {0}")]
    Wav(#[from] WavError),

    #[error("impulse response error: {0}")]
    Ir(#[from] IrError),

    #[error("convolver error: {0}")]
    Convolver(#[from] ConvolverError),

    #[error("audio sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source has {found} channels, expected {expected}")]
    WrongChannelCount { expected: usize, found: usize },

    #[error("no file loaded")]
    NoFile,

    #[error("pre-render cache directory not configured")]
    NoCacheDir,

    #[error("{0}")]
    NotReady(&'static str),
}

/// Engine state, advanced only by the controller (the audio callback may
/// demote Playing → Stopped at end of file)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    Idle = 0,
    Stopped = 1,
    Playing = 2,
    Paused = 3,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::Stopped,
            2 => PlaybackState::Playing,
            3 => PlaybackState::Paused,
            _ => PlaybackState::Idle,
        }
    }
}

/// Rendering preset plus its output shape and cache identity
#[derive(Debug, Clone)]
pub struct ExportPreset {
    pub preset: IrPreset,
    pub output_channels: usize,
    pub cache_name: String,
    /// Output gain applied by the convolver; stereo presets default to
    /// +12 dB of makeup, multichannel to unity
    pub output_gain_db: f32,
}

impl ExportPreset {
    pub fn new(preset: IrPreset) -> Self {
        let output_channels = preset.output_channels();
        Self {
            preset,
            output_channels,
            cache_name: format!("{}_cache.wav", preset.base_name()),
            output_gain_db: if output_channels == 2 { 12.0 } else { 0.0 },
        }
    }
}

impl Default for ExportPreset {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            ..Self::new(IrPreset::Binaural)
        }
    }
}

// ───────────────────────────────────────────────────────────────────────
// Shared state between controller, worker and audio callback
// ───────────────────────────────────────────────────────────────────────

/// The reader, convolver and their scratch buffers, guarded by the file
/// mutex. The audio callback takes this lock only in the non-realtime
/// paths; the worker holds it per block.
struct SourceState {
    reader: Option<WavReader>,
    convolver: MatrixConvolver,
    source_channels: usize,
    /// Interleaved source block, `block_frames × source_channels`
    input: Vec<f32>,
    /// Convolver output block, `block_frames × max(out_channels, 2)`
    rendered: Vec<f32>,
}

impl SourceState {
    fn set_reader(&mut self, reader: Option<WavReader>, block_frames: usize) {
        self.source_channels = reader
            .as_ref()
            .map(|r| r.num_channels() as usize)
            .unwrap_or(0);
        self.reader = reader;
        let needed = block_frames * self.source_channels.max(1);
        if self.input.len() < needed {
            self.input.resize(needed, 0.0);
        }
    }

    fn ensure_rendered(&mut self, block_frames: usize, out_channels: usize) {
        let needed = block_frames * out_channels.max(2);
        if self.rendered.len() < needed {
            self.rendered.resize(needed, 0.0);
        }
    }

    /// Read up to `frames` into the input buffer; 0 at end of data
    fn read_source_block(&mut self, frames: usize) -> usize {
        let Some(reader) = self.reader.as_mut() else {
            return 0;
        };
        match reader.read(&mut self.input, frames) {
            Ok(n) => n,
            Err(e) => {
                log::error!("Source read failed: {}", e);
                0
            }
        }
    }

    fn seek_start(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            if let Err(e) = reader.seek(0) {
                log::error!("Source rewind failed: {}", e);
            }
        }
    }

    fn zero_pad_input(&mut self, frames: usize, block_frames: usize) {
        if frames < block_frames {
            self.input[frames * self.source_channels..block_frames * self.source_channels]
                .fill(0.0);
        }
    }

    fn convolve_block(&mut self, block_frames: usize) {
        let out_channels = self.convolver.output_channels().max(1);
        self.convolver.process(
            &self.input,
            &mut self.rendered[..block_frames * out_channels],
            block_frames,
        );
    }

    /// Take convolver channels 0/1 as L/R (duplicating 0 for mono output
    /// shapes) and apply the playback gain
    fn fold_to_stereo(&self, out: &mut [f32], block_frames: usize, gain: f32) {
        let out_channels = self.convolver.output_channels().max(1);
        for frame in 0..block_frames {
            let left = self.rendered[frame * out_channels];
            let right = if out_channels > 1 {
                self.rendered[frame * out_channels + 1]
            } else {
                left
            };
            out[frame * 2] = left * gain;
            out[frame * 2 + 1] = right * gain;
        }
    }
}

/// Cross-thread playback state
struct PlaybackShared {
    source: Mutex<SourceState>,
    state: AtomicU8,
    playback_completed: AtomicBool,
    loop_enabled: AtomicBool,
    /// Playback gain, linear, as f32 bits
    gain_linear: AtomicU32,
    /// Callback mode switch: drain the realtime ring instead of the reader
    realtime_active: AtomicBool,
    /// The reader currently points at the pre-rendered stereo cache
    use_cache: AtomicBool,
    /// Consumer mailbox: every worker start creates a fresh ring and parks
    /// its consumer end here; the callback adopts it with a try_lock (never
    /// blocking) on its next realtime pull. Old rings die with both ends,
    /// so a restart can never replay stale audio.
    next_consumer: Mutex<Option<RingConsumer>>,
    underflow_warned: AtomicBool,
    worker_stop: AtomicBool,
    worker_running: AtomicBool,
    pre_render_progress: AtomicU32,
    pre_render_in_progress: AtomicBool,
    primed: Mutex<bool>,
    primed_cv: Condvar,
}

impl PlaybackShared {
    fn new(block_frames: usize) -> Self {
        Self {
            source: Mutex::new(SourceState {
                reader: None,
                convolver: MatrixConvolver::new(),
                source_channels: 0,
                input: vec![0.0; block_frames * CHANNEL_COUNT],
                rendered: vec![0.0; block_frames * 2],
            }),
            state: AtomicU8::new(PlaybackState::Idle as u8),
            playback_completed: AtomicBool::new(false),
            loop_enabled: AtomicBool::new(false),
            gain_linear: AtomicU32::new(1.0f32.to_bits()),
            realtime_active: AtomicBool::new(false),
            use_cache: AtomicBool::new(false),
            next_consumer: Mutex::new(None),
            underflow_warned: AtomicBool::new(false),
            worker_stop: AtomicBool::new(false),
            worker_running: AtomicBool::new(false),
            pre_render_progress: AtomicU32::new(0),
            pre_render_in_progress: AtomicBool::new(false),
            primed: Mutex::new(false),
            primed_cv: Condvar::new(),
        }
    }

    fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn reset_primed(&self) {
        *self.primed.lock().unwrap() = false;
    }

    fn signal_worker_primed(&self) {
        let mut primed = self.primed.lock().unwrap();
        *primed = true;
        self.primed_cv.notify_all();
    }

    fn wait_worker_primed(&self, timeout: Duration) -> bool {
        let primed = self.primed.lock().unwrap();
        let (primed, _) = self
            .primed_cv
            .wait_timeout_while(primed, timeout, |primed| !*primed)
            .unwrap();
        *primed
    }
}

// ───────────────────────────────────────────────────────────────────────
// Audio callback
// ───────────────────────────────────────────────────────────────────────

/// Build the sink pull callback. The realtime ring consumer is owned by
/// the closure; worker restarts deliver a fresh one through the mailbox.
fn make_callback(shared: Arc<PlaybackShared>) -> SinkCallback {
    let mut consumer: Option<RingConsumer> = None;

    Box::new(move |out: &mut [f32]| {
        if shared.state() != PlaybackState::Playing {
            out.fill(0.0);
            return;
        }

        if shared.realtime_active.load(Ordering::Acquire) {
            // Adopt a newly started worker's ring; try_lock keeps this
            // non-blocking (contention only at start/stop moments)
            if let Ok(mut mailbox) = shared.next_consumer.try_lock() {
                if let Some(fresh) = mailbox.take() {
                    consumer = Some(fresh);
                }
            }
            let Some(consumer) = consumer.as_mut() else {
                out.fill(0.0);
                return;
            };

            let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
            let mut filled = consumer.read(bytes);
            if filled < bytes.len() {
                filled += consumer.read(&mut bytes[filled..]);
            }
            if filled < bytes.len() {
                bytes[filled..].fill(0);
                if !shared.underflow_warned.swap(true, Ordering::Relaxed) {
                    log::warn!("Realtime playback ring underflow");
                }
            }
            return;
        }

        // File-backed paths: direct 84-channel audition or the stereo cache
        let mut source = shared.source.lock().unwrap();
        let gain = f32::from_bits(shared.gain_linear.load(Ordering::Relaxed));
        let use_cache = shared.use_cache.load(Ordering::Relaxed);
        let loop_enabled = shared.loop_enabled.load(Ordering::Relaxed);
        let frames = out.len() / 2;

        let mut filled = 0usize;
        while filled < frames {
            let got = source.read_source_block(frames - filled);
            if got == 0 {
                let has_frames = source
                    .reader
                    .as_ref()
                    .map(|r| r.total_frames() > 0)
                    .unwrap_or(false);
                if loop_enabled && has_frames {
                    source.seek_start();
                    continue;
                }
                break;
            }

            let channels = source.source_channels.max(1);
            for frame in 0..got {
                let base = (filled + frame) * 2;
                let left = source.input[frame * channels];
                let right = if use_cache && channels > 1 {
                    source.input[frame * channels + 1]
                } else {
                    left
                };
                out[base] = left * gain;
                out[base + 1] = right * gain;
            }
            filled += got;
        }

        if filled < frames {
            out[filled * 2..].fill(0.0);
            shared.set_state(PlaybackState::Stopped);
            if !shared.playback_completed.swap(true, Ordering::AcqRel) {
                log::debug!("End of file reached");
            }
        }
    })
}

// ───────────────────────────────────────────────────────────────────────
// Engine
// ───────────────────────────────────────────────────────────────────────

/// Playback engine over an [`AudioSink`] and an IR preset library
pub struct PlaybackEngine {
    shared: Arc<PlaybackShared>,
    sink: Box<dyn AudioSink>,
    ir_loader: IrLoader,
    block_frames: usize,

    source_path: Option<PathBuf>,
    source_rate: u32,
    source_bits: u16,
    source_channels: u16,

    cache_dir: Option<PathBuf>,
    export_preset: ExportPreset,
    convolved_enabled: bool,

    pre_rendered_path: Option<PathBuf>,
    pre_rendered_ready: bool,
    pre_rendered_source: Option<PathBuf>,

    worker: Option<worker::WorkerHandle>,
}

impl PlaybackEngine {
    pub fn new(sink: Box<dyn AudioSink>, ir_loader: IrLoader, cache_dir: Option<PathBuf>) -> Self {
        Self::with_block_frames(sink, ir_loader, cache_dir, BUFFER_FRAMES)
    }

    /// Engine with a non-default block size (small blocks keep tests fast;
    /// hosts should use [`BUFFER_FRAMES`])
    pub fn with_block_frames(
        sink: Box<dyn AudioSink>,
        ir_loader: IrLoader,
        cache_dir: Option<PathBuf>,
        block_frames: usize,
    ) -> Self {
        Self {
            shared: Arc::new(PlaybackShared::new(block_frames)),
            sink,
            ir_loader,
            block_frames,
            source_path: None,
            source_rate: 0,
            source_bits: 0,
            source_channels: 0,
            cache_dir,
            export_preset: ExportPreset::default(),
            convolved_enabled: true,
            pre_rendered_path: None,
            pre_rendered_ready: false,
            pre_rendered_source: None,
            worker: None,
        }
    }

    // ── Loading ────────────────────────────────────────────────────────

    /// Load an 84-channel WAV/RF64 file for playback.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PlaybackError> {
        let path = path.as_ref().to_path_buf();
        let reader = WavReader::open(&path)?;
        self.install_source(reader, path)
    }

    /// Load from a pre-opened descriptor; `display_path` is used for
    /// logging and cache bookkeeping.
    #[cfg(unix)]
    pub fn load_file_from_fd(
        &mut self,
        fd: std::os::unix::io::RawFd,
        display_path: &str,
    ) -> Result<(), PlaybackError> {
        let reader = WavReader::open_fd(fd)?;
        self.install_source(reader, PathBuf::from(display_path))
    }

    fn install_source(&mut self, reader: WavReader, path: PathBuf) -> Result<(), PlaybackError> {
        self.sink.stop();
        self.stop_worker();
        self.clear_pre_render_state();
        self.shared.set_state(PlaybackState::Idle);

        let channels = reader.num_channels() as usize;
        if channels != CHANNEL_COUNT {
            return Err(PlaybackError::WrongChannelCount {
                expected: CHANNEL_COUNT,
                found: channels,
            });
        }

        self.source_rate = reader.sample_rate();
        self.source_bits = reader.bits_per_sample();
        self.source_channels = reader.num_channels();
        log::info!(
            "Loaded {}: {}ch, {} Hz, {}-bit, {:.2}s",
            path.display(),
            self.source_channels,
            self.source_rate,
            self.source_bits,
            reader.duration_seconds()
        );
        self.source_path = Some(path);

        {
            let mut source = self.shared.source.lock().unwrap();
            source.set_reader(Some(reader), self.block_frames);
            source.ensure_rendered(self.block_frames, self.export_preset.output_channels);
        }
        self.shared.use_cache.store(false, Ordering::Release);

        if self.convolved_enabled {
            if let Err(e) = self.load_impulse_response() {
                log::warn!("Impulse response unavailable: {}; convolved playback disabled until a preset loads", e);
            }
        } else {
            self.shared.source.lock().unwrap().convolver.deconfigure();
        }

        self.shared.underflow_warned.store(false, Ordering::Relaxed);
        *self.shared.next_consumer.lock().unwrap() = None;
        let callback = make_callback(self.shared.clone());
        self.sink
            .initialize(self.source_rate, self.block_frames, callback)?;

        self.shared.playback_completed.store(false, Ordering::Release);
        self.shared.set_state(PlaybackState::Stopped);
        Ok(())
    }

    fn ring_bytes(&self) -> usize {
        6 * self.block_frames * 2 * std::mem::size_of::<f32>()
    }

    fn load_impulse_response(&mut self) -> Result<(), PlaybackError> {
        let ir = self
            .ir_loader
            .load(self.export_preset.preset, self.source_rate)?;
        let mut source = self.shared.source.lock().unwrap();
        source.ensure_rendered(self.block_frames, ir.num_output_channels);
        source.convolver.configure(ir, self.block_frames)?;
        source
            .convolver
            .set_output_gain(db_to_linear(self.export_preset.output_gain_db));
        Ok(())
    }

    // ── Transport ──────────────────────────────────────────────────────

    /// Start (or resume) playback according to the current mode.
    pub fn play(&mut self) -> Result<(), PlaybackError> {
        match self.shared.state() {
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Idle => return Err(PlaybackError::NoFile),
            PlaybackState::Paused => {
                self.sink.start()?;
                self.shared.set_state(PlaybackState::Playing);
                return Ok(());
            }
            PlaybackState::Stopped => {}
        }

        let cache_active = self.shared.use_cache.load(Ordering::Acquire);

        if self.convolved_enabled && !cache_active {
            // Realtime convolution
            {
                let mut source = self.shared.source.lock().unwrap();
                if !source.convolver.is_ready() {
                    return Err(PlaybackError::NotReady(
                        "no impulse response loaded for realtime playback",
                    ));
                }
                source.convolver.reset();
            }
            self.rewind_if_completed();
            self.shared.realtime_active.store(true, Ordering::Release);
            self.start_worker()?;
        } else if self.convolved_enabled {
            // Pre-rendered cache
            if !self.pre_rendered_ready {
                return Err(PlaybackError::NotReady("pre-rendered cache not ready"));
            }
            self.shared.realtime_active.store(false, Ordering::Release);
            self.rewind_if_completed();
        } else {
            // Direct audition of the raw array file
            if cache_active {
                self.reopen_original()?;
                self.shared.use_cache.store(false, Ordering::Release);
            }
            self.shared.realtime_active.store(false, Ordering::Release);
            self.rewind_if_completed();
        }

        self.sink.start()?;
        self.shared.set_state(PlaybackState::Playing);
        log::debug!("Playback started");
        Ok(())
    }

    fn rewind_if_completed(&mut self) {
        let completed = self.shared.playback_completed.swap(false, Ordering::AcqRel);
        let mut source = self.shared.source.lock().unwrap();
        let at_end = source
            .reader
            .as_ref()
            .map(|r| r.position() >= r.total_frames())
            .unwrap_or(false);
        if completed || at_end {
            source.seek_start();
        }
    }

    /// Playing → Paused
    pub fn pause(&mut self) {
        if self.shared.state() != PlaybackState::Playing {
            return;
        }
        self.sink.pause();
        self.shared.set_state(PlaybackState::Paused);
        log::debug!("Playback paused");
    }

    /// Stop playback, rewind, and settle in Stopped.
    pub fn stop(&mut self) {
        if self.shared.state() == PlaybackState::Idle {
            return;
        }
        self.sink.stop();
        let was_realtime = self.shared.realtime_active.load(Ordering::Acquire);
        self.stop_worker();

        {
            let mut source = self.shared.source.lock().unwrap();
            source.seek_start();
            if was_realtime {
                source.convolver.reset();
            }
        }
        self.shared.playback_completed.store(false, Ordering::Release);
        self.shared.set_state(PlaybackState::Stopped);
        log::debug!("Playback stopped");
    }

    /// Seek to a position in seconds, clamped to the file length.
    pub fn seek(&mut self, position_seconds: f64) -> Result<(), PlaybackError> {
        if self.shared.state() == PlaybackState::Idle {
            return Err(PlaybackError::NoFile);
        }
        let frame = (position_seconds.max(0.0) * self.source_rate as f64) as u64;

        let realtime_playing = self.shared.realtime_active.load(Ordering::Acquire)
            && self.shared.state() == PlaybackState::Playing;
        if realtime_playing {
            self.stop_worker();
            {
                let mut source = self.shared.source.lock().unwrap();
                if let Some(reader) = source.reader.as_mut() {
                    reader.seek(frame)?;
                }
                source.convolver.reset();
            }
            self.shared.realtime_active.store(true, Ordering::Release);
            self.start_worker()?;
        } else {
            let mut source = self.shared.source.lock().unwrap();
            if let Some(reader) = source.reader.as_mut() {
                reader.seek(frame)?;
            }
        }
        log::debug!("Seeked to {:.2}s", position_seconds);
        Ok(())
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    pub fn is_file_loaded(&self) -> bool {
        self.shared.source.lock().unwrap().reader.is_some()
    }

    pub fn position_seconds(&self) -> f64 {
        let source = self.shared.source.lock().unwrap();
        match (&source.reader, self.source_rate) {
            (Some(reader), rate) if rate > 0 => reader.position() as f64 / rate as f64,
            _ => 0.0,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.shared
            .source
            .lock()
            .unwrap()
            .reader
            .as_ref()
            .map(|r| r.duration_seconds())
            .unwrap_or(0.0)
    }

    /// One-shot end-of-file indicator (also set by the realtime worker)
    pub fn playback_completed(&self) -> bool {
        self.shared.playback_completed.load(Ordering::Acquire)
    }

    // ── Gain, loop, preset, mode ───────────────────────────────────────

    /// Set playback gain in dB, clamped to [0, 48]
    pub fn set_playback_gain_db(&self, gain_db: f32) {
        let clamped = gain_db.clamp(0.0, MAX_PLAYBACK_GAIN_DB);
        self.shared
            .gain_linear
            .store(db_to_linear(clamped).to_bits(), Ordering::Relaxed);
    }

    pub fn playback_gain_db(&self) -> f32 {
        linear_to_db(f32::from_bits(self.shared.gain_linear.load(Ordering::Relaxed)))
    }

    pub fn set_looping(&self, enabled: bool) {
        self.shared.loop_enabled.store(enabled, Ordering::Relaxed);
        if enabled {
            self.shared.playback_completed.store(false, Ordering::Release);
        }
    }

    pub fn is_looping(&self) -> bool {
        self.shared.loop_enabled.load(Ordering::Relaxed)
    }

    /// Replace the rendering preset. Invalidates the pre-rendered cache and
    /// reloads the IR when a file is loaded with convolved playback on.
    pub fn configure_export_preset(&mut self, preset: ExportPreset) -> Result<(), PlaybackError> {
        self.stop_worker();
        log::info!(
            "Export preset: {:?} ({} channels, cache {})",
            preset.preset,
            preset.output_channels,
            preset.cache_name
        );
        self.export_preset = preset;

        self.invalidate_cache()?;
        {
            let mut source = self.shared.source.lock().unwrap();
            source.ensure_rendered(self.block_frames, self.export_preset.output_channels);
        }

        if self.convolved_enabled && self.source_path.is_some() {
            self.load_impulse_response()?;
        }
        Ok(())
    }

    pub fn export_preset(&self) -> &ExportPreset {
        &self.export_preset
    }

    /// Toggle convolved playback. Either direction drops back to the
    /// original source file if the cache was active.
    pub fn set_playback_convolved(&mut self, enabled: bool) -> Result<(), PlaybackError> {
        self.stop_worker();
        if self.shared.use_cache.load(Ordering::Acquire) {
            self.reopen_original()?;
            self.shared.use_cache.store(false, Ordering::Release);
        }
        self.convolved_enabled = enabled;

        if enabled {
            if self.source_path.is_some() {
                let ready = self.shared.source.lock().unwrap().convolver.is_ready();
                if !ready {
                    self.load_impulse_response()?;
                }
            }
        } else {
            self.shared.source.lock().unwrap().convolver.deconfigure();
        }
        Ok(())
    }

    pub fn is_playback_convolved(&self) -> bool {
        self.convolved_enabled
    }

    /// Directory holding pre-render caches; changing it invalidates state.
    pub fn set_cache_directory<P: Into<PathBuf>>(&mut self, dir: P) {
        self.cache_dir = Some(dir.into());
        self.clear_pre_render_state();
    }

    // ── Pre-render, export, cache reuse ────────────────────────────────

    pub fn pre_render_progress(&self) -> u32 {
        self.shared.pre_render_progress.load(Ordering::Relaxed)
    }

    pub fn is_pre_render_in_progress(&self) -> bool {
        self.shared.pre_render_in_progress.load(Ordering::Relaxed)
    }

    pub fn is_pre_rendered_ready(&self) -> bool {
        self.pre_rendered_ready
    }

    pub fn pre_rendered_file_path(&self) -> Option<&Path> {
        self.pre_rendered_path.as_deref()
    }

    /// Convolve the whole source file into the stereo (or multichannel)
    /// cache, then adopt the cache as the playback source.
    pub fn prepare_pre_rendered(&mut self) -> Result<(), PlaybackError> {
        if self.source_path.is_none() {
            return Err(PlaybackError::NoFile);
        }
        let cache_dir = self.cache_dir.clone().ok_or(PlaybackError::NoCacheDir)?;
        {
            let source = self.shared.source.lock().unwrap();
            if !source.convolver.is_ready() {
                return Err(PlaybackError::NotReady("no impulse response loaded"));
            }
        }

        self.sink.stop();
        self.stop_worker();
        self.shared.set_state(PlaybackState::Stopped);

        let cache_path = cache_dir.join(&self.export_preset.cache_name);
        self.shared.pre_render_progress.store(0, Ordering::Relaxed);
        self.shared.pre_render_in_progress.store(true, Ordering::Relaxed);
        log::info!(
            "Pre-rendering {} to {}",
            self.source_path.as_ref().unwrap().display(),
            cache_path.display()
        );

        let result = self.run_pre_render(&cache_path);

        match result {
            Ok(frames_processed) => {
                // Adopt the cache as the playback source
                let cache_reader = WavReader::open(&cache_path)?;
                {
                    let mut source = self.shared.source.lock().unwrap();
                    source.set_reader(Some(cache_reader), self.block_frames);
                }
                self.shared.use_cache.store(true, Ordering::Release);
                self.pre_rendered_path = Some(cache_path.clone());
                self.pre_rendered_ready = true;
                self.pre_rendered_source = self.source_path.clone();
                self.shared.playback_completed.store(false, Ordering::Release);
                self.shared.set_state(PlaybackState::Stopped);
                self.shared.pre_render_progress.store(100, Ordering::Relaxed);
                self.shared.pre_render_in_progress.store(false, Ordering::Relaxed);
                log::info!(
                    "Pre-render complete: {} frames into {}",
                    frames_processed,
                    cache_path.display()
                );
                Ok(())
            }
            Err(e) => {
                log::error!("Pre-render failed: {}", e);
                let _ = fs::remove_file(&cache_path);
                if let Err(restore) = self.reopen_original() {
                    log::error!("Failed to restore original source: {}", restore);
                }
                self.shared.pre_render_progress.store(0, Ordering::Relaxed);
                self.shared.pre_render_in_progress.store(false, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn run_pre_render(&mut self, cache_path: &Path) -> Result<u64, PlaybackError> {
        let _ = fs::remove_file(cache_path);

        let mut source = self.shared.source.lock().unwrap();

        // Work from the original multichannel file even if the cache was
        // the active source
        if self.shared.use_cache.load(Ordering::Acquire)
            || source.source_channels != CHANNEL_COUNT
        {
            let path = self.source_path.as_ref().ok_or(PlaybackError::NoFile)?;
            let reader = WavReader::open(path)?;
            source.set_reader(Some(reader), self.block_frames);
            self.shared.use_cache.store(false, Ordering::Release);
        }
        source.seek_start();
        source.convolver.reset();

        let out_channels = source.convolver.output_channels();
        let mut writer = WavWriter::create(
            cache_path,
            WavFormat {
                sample_format: SampleFormat::Pcm,
                num_channels: out_channels as u16,
                sample_rate: self.source_rate,
                bits_per_sample: 24,
            },
        )?;

        let total_frames = source
            .reader
            .as_ref()
            .map(|r| r.total_frames())
            .unwrap_or(0);
        let block = self.block_frames;
        let mut quantized = vec![0u8; block * out_channels * 3];
        let mut processed: u64 = 0;

        loop {
            let frames = source.read_source_block(block);
            if frames == 0 {
                break;
            }
            source.zero_pad_input(frames, block);
            source.convolve_block(block);

            processed += frames as u64;
            if total_frames > 0 {
                let progress = ((processed * 100) / total_frames).min(99) as u32;
                self.shared.pre_render_progress.store(progress, Ordering::Relaxed);
            }

            quantize_pcm24(&source.rendered[..frames * out_channels], &mut quantized);
            writer.write_data(&quantized[..frames * out_channels * 3])?;

            if frames < block {
                // Flush the convolver's tail with one block of silence
                source.input.fill(0.0);
                source.convolve_block(block);
                quantize_pcm24(&source.rendered[..block * out_channels], &mut quantized);
                writer.write_data(&quantized[..block * out_channels * 3])?;
                break;
            }
        }

        writer.close()?;
        Ok(processed)
    }

    /// Copy the cache file byte-for-byte to `destination`.
    pub fn export_pre_rendered<P: AsRef<Path>>(&self, destination: P) -> Result<(), PlaybackError> {
        let cache = self
            .pre_rendered_path
            .as_ref()
            .ok_or(PlaybackError::NotReady("no pre-rendered file to export"))?;
        fs::copy(cache, destination.as_ref())?;
        log::info!("Exported pre-rendered file to {}", destination.as_ref().display());
        Ok(())
    }

    /// Adopt an existing cache file without regenerating it.
    pub fn use_existing_pre_rendered<P: AsRef<Path>>(
        &mut self,
        source_path: P,
    ) -> Result<(), PlaybackError> {
        if !self.convolved_enabled {
            return Err(PlaybackError::NotReady(
                "convolved playback disabled; cache not applicable",
            ));
        }
        let cache_dir = self.cache_dir.clone().ok_or(PlaybackError::NoCacheDir)?;
        let cache_path = cache_dir.join(&self.export_preset.cache_name);

        let reader = WavReader::open(&cache_path)?;
        self.source_rate = reader.sample_rate();
        self.source_bits = reader.bits_per_sample();
        self.source_channels = reader.num_channels();
        {
            let mut source = self.shared.source.lock().unwrap();
            source.set_reader(Some(reader), self.block_frames);
            source.seek_start();
        }

        self.shared.use_cache.store(true, Ordering::Release);
        self.pre_rendered_path = Some(cache_path.clone());
        self.pre_rendered_ready = true;
        self.pre_rendered_source = Some(source_path.as_ref().to_path_buf());
        self.shared.pre_render_progress.store(100, Ordering::Relaxed);
        self.shared.pre_render_in_progress.store(false, Ordering::Relaxed);
        self.shared.playback_completed.store(false, Ordering::Release);
        self.shared.set_state(PlaybackState::Stopped);
        log::info!("Reusing pre-rendered cache at {}", cache_path.display());
        Ok(())
    }

    fn clear_pre_render_state(&mut self) {
        self.pre_rendered_ready = false;
        self.pre_rendered_path = None;
        self.pre_rendered_source = None;
        self.shared.use_cache.store(false, Ordering::Release);
        self.shared.pre_render_progress.store(0, Ordering::Relaxed);
        self.shared.pre_render_in_progress.store(false, Ordering::Relaxed);
    }

    fn invalidate_cache(&mut self) -> Result<(), PlaybackError> {
        let was_active = self.shared.use_cache.load(Ordering::Acquire);
        self.pre_rendered_ready = false;
        self.pre_rendered_path = None;
        self.pre_rendered_source = None;
        self.shared.pre_render_progress.store(0, Ordering::Relaxed);
        if was_active {
            self.reopen_original()?;
            self.shared.use_cache.store(false, Ordering::Release);
        }
        Ok(())
    }

    fn reopen_original(&mut self) -> Result<(), PlaybackError> {
        let path = self.source_path.clone().ok_or(PlaybackError::NoFile)?;
        let reader = WavReader::open(&path)?;
        let channels = reader.num_channels() as usize;
        if channels != CHANNEL_COUNT {
            return Err(PlaybackError::WrongChannelCount {
                expected: CHANNEL_COUNT,
                found: channels,
            });
        }
        self.source_rate = reader.sample_rate();
        self.source_bits = reader.bits_per_sample();
        self.source_channels = reader.num_channels();
        let mut source = self.shared.source.lock().unwrap();
        source.set_reader(Some(reader), self.block_frames);
        Ok(())
    }

    // ── Realtime worker control ────────────────────────────────────────

    fn start_worker(&mut self) -> Result<(), PlaybackError> {
        // Each run gets a fresh ring; the callback adopts the consumer on
        // its next realtime pull, and the previous ring dies with both ends
        let (producer, consumer) = RingBuffer::with_capacity(self.ring_bytes());
        *self.shared.next_consumer.lock().unwrap() = Some(consumer);

        self.shared.worker_stop.store(false, Ordering::Release);
        self.shared.worker_running.store(true, Ordering::Release);
        self.shared.underflow_warned.store(false, Ordering::Relaxed);
        self.shared.reset_primed();

        self.worker = Some(worker::spawn(
            self.shared.clone(),
            producer,
            self.block_frames,
        ));

        if !self.shared.wait_worker_primed(PRIMING_DEADLINE) {
            log::warn!(
                "Realtime worker missed the {}ms priming deadline; starting with what is buffered",
                PRIMING_DEADLINE.as_millis()
            );
        }
        Ok(())
    }

    fn stop_worker(&mut self) {
        self.shared.realtime_active.store(false, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            self.shared.worker_stop.store(true, Ordering::Release);
            if handle.thread.join().is_err() {
                log::error!("Realtime worker thread panicked");
            }
            self.shared.worker_running.store(false, Ordering::Release);
            self.shared.worker_stop.store(false, Ordering::Release);
        }
        // An un-adopted consumer from a never-pulled run is stale too
        *self.shared.next_consumer.lock().unwrap() = None;
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.sink.stop();
        self.stop_worker();
    }
}

/// Clamp to [-1, 1] and quantize to packed little-endian 24-bit
fn quantize_pcm24(samples: &[f32], out: &mut [u8]) {
    for (i, &sample) in samples.iter().enumerate() {
        let value = (sample.clamp(-1.0, 1.0) * PRE_RENDER_SCALE).round() as i32;
        pcm24_write(value, &mut out[i * 3..i * 3 + 3]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolver::BlobSource;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    const BLOCK: usize = 256;
    /// Test files use a tiny "sample rate" so one second is one block
    const RATE: u32 = 256;

    // ── Mock sink ──────────────────────────────────────────────────────

    #[derive(Default)]
    struct MockSinkState {
        callback: Option<SinkCallback>,
        inits: Vec<(u32, usize)>,
        playing: AtomicBool,
    }

    #[derive(Clone)]
    struct MockSinkHandle {
        state: Arc<Mutex<MockSinkState>>,
    }

    impl MockSinkHandle {
        fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(MockSinkState::default())),
            }
        }

        fn sink(&self) -> Box<dyn AudioSink> {
            Box::new(MockSink {
                state: self.state.clone(),
            })
        }

        /// Drive the pull callback for `frames` frames
        fn render(&self, frames: usize) -> Vec<f32> {
            let mut out = vec![0.0f32; frames * 2];
            let mut state = self.state.lock().unwrap();
            let callback = state.callback.as_mut().expect("sink not initialized");
            callback(&mut out);
            out
        }

        fn last_init(&self) -> Option<(u32, usize)> {
            self.state.lock().unwrap().inits.last().copied()
        }
    }

    struct MockSink {
        state: Arc<Mutex<MockSinkState>>,
    }

    impl AudioSink for MockSink {
        fn initialize(
            &mut self,
            sample_rate: u32,
            buffer_frames: usize,
            callback: SinkCallback,
        ) -> Result<(), SinkError> {
            let mut state = self.state.lock().unwrap();
            state.callback = Some(callback);
            state.inits.push((sample_rate, buffer_frames));
            Ok(())
        }

        fn start(&mut self) -> Result<(), SinkError> {
            self.state.lock().unwrap().playing.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn pause(&mut self) {
            self.state.lock().unwrap().playing.store(false, Ordering::Relaxed);
        }

        fn stop(&mut self) {
            self.pause();
        }

        fn is_playing(&self) -> bool {
            self.state.lock().unwrap().playing.load(Ordering::Relaxed)
        }
    }

    // ── Fixtures ───────────────────────────────────────────────────────

    /// Channel-0 sample of the synthetic source at `frame`
    fn source_ch0(frame: usize) -> f32 {
        ((frame % 97) as f32 - 48.0) / 64.0
    }

    fn write_source_file(dir: &Path, frames: usize) -> PathBuf {
        let path = dir.join("source.wav");
        let format = WavFormat {
            sample_format: SampleFormat::Float,
            num_channels: CHANNEL_COUNT as u16,
            sample_rate: RATE,
            bits_per_sample: 32,
        };
        let mut writer = WavWriter::create(&path, format).unwrap();
        let mut frame_buffer = vec![0.0f32; CHANNEL_COUNT];
        for frame in 0..frames {
            frame_buffer.fill(0.0);
            frame_buffer[0] = source_ch0(frame);
            frame_buffer[1] = 0.25; // must never leak into direct output
            writer.write_data(bytemuck::cast_slice(&frame_buffer)).unwrap();
        }
        writer.close().unwrap();
        path
    }

    struct MapBlobSource {
        blobs: HashMap<String, Vec<u8>>,
    }

    impl BlobSource for MapBlobSource {
        fn open(&self, name: &str) -> std::io::Result<Vec<u8>> {
            self.blobs
                .get(name)
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, name.to_string()))
        }
    }

    fn float_wav(channels: u16, sample_rate: u32, frames: &[f32]) -> Vec<u8> {
        let data_len = frames.len() * 4;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&3u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * channels as u32 * 4).to_le_bytes());
        bytes.extend_from_slice(&(channels * 4).to_le_bytes());
        bytes.extend_from_slice(&32u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&(data_len as u32).to_le_bytes());
        for &sample in frames {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    /// Binaural blob: in0 -> out0 is a unit delta, in0 -> out1 is a
    /// half-amplitude delta delayed one sample; every other pair is silent.
    fn ir_loader_with_delta() -> IrLoader {
        let ir_length = 4usize;
        let total_frames = CHANNEL_COUNT * ir_length;
        let mut frames = vec![0.0f32; total_frames * 2];
        frames[0] = 1.0; // out0, in0, n=0
        frames[1 * 2 + 1] = 0.5; // out1, in0, n=1
        let mut blobs = HashMap::new();
        blobs.insert(
            "impulse_responses/binaural_48k.wav".to_string(),
            float_wav(2, RATE, &frames),
        );
        IrLoader::new(Box::new(MapBlobSource { blobs }))
    }

    fn test_preset() -> ExportPreset {
        // Unity output gain keeps expected values simple
        ExportPreset {
            output_gain_db: 0.0,
            ..ExportPreset::new(IrPreset::Binaural)
        }
    }

    fn engine_with(
        handle: &MockSinkHandle,
        cache_dir: Option<PathBuf>,
        convolved: bool,
    ) -> PlaybackEngine {
        let mut engine = PlaybackEngine::with_block_frames(
            handle.sink(),
            ir_loader_with_delta(),
            cache_dir,
            BLOCK,
        );
        engine.configure_export_preset(test_preset()).unwrap();
        engine.set_playback_convolved(convolved).unwrap();
        engine
    }

    // ── Tests ──────────────────────────────────────────────────────────

    #[test]
    fn test_load_rejects_wrong_channel_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let format = WavFormat {
            sample_format: SampleFormat::Float,
            num_channels: 2,
            sample_rate: RATE,
            bits_per_sample: 32,
        };
        let mut writer = WavWriter::create(&path, format).unwrap();
        writer.write_data(&[0u8; 64]).unwrap();
        writer.close().unwrap();

        let handle = MockSinkHandle::new();
        let mut engine = engine_with(&handle, None, false);
        assert!(matches!(
            engine.load_file(&path),
            Err(PlaybackError::WrongChannelCount { expected: 84, found: 2 })
        ));
        assert_eq!(engine.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_direct_play_duplicates_channel0() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source_file(dir.path(), 300);

        let handle = MockSinkHandle::new();
        let mut engine = engine_with(&handle, None, false);
        engine.load_file(&source).unwrap();
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(handle.last_init(), Some((RATE, BLOCK)));

        engine.play().unwrap();
        assert_eq!(engine.state(), PlaybackState::Playing);

        let out = handle.render(BLOCK);
        for frame in 0..BLOCK {
            let expected = source_ch0(frame);
            assert!((out[frame * 2] - expected).abs() < 1e-6, "L at {}", frame);
            assert!((out[frame * 2 + 1] - expected).abs() < 1e-6, "R at {}", frame);
        }

        // Second callback hits EOF after 44 frames: zero fill, Stopped,
        // completed raised once
        let out = handle.render(BLOCK);
        assert!((out[43 * 2] - source_ch0(299)).abs() < 1e-6);
        assert_eq!(out[44 * 2], 0.0);
        assert_eq!(*out.last().unwrap(), 0.0);
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert!(engine.playback_completed());
    }

    #[test]
    fn test_loop_boundary_restarts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        // Exactly one "second" (RATE frames) of audio
        let source = write_source_file(dir.path(), RATE as usize);

        let handle = MockSinkHandle::new();
        let mut engine = engine_with(&handle, None, false);
        engine.load_file(&source).unwrap();
        engine.set_looping(true);
        engine.play().unwrap();

        // Render 2.5 seconds in 64-frame callbacks
        let total_frames = (RATE as usize) * 5 / 2;
        let mut rendered = Vec::with_capacity(total_frames * 2);
        let mut driven = 0usize;
        while driven < total_frames {
            let n = 64.min(total_frames - driven);
            rendered.extend(handle.render(n));
            driven += n;
        }

        // Samples at t=1.0s and t=2.0s equal the source's t=0 sample
        let period = RATE as usize;
        assert!((rendered[period * 2] - source_ch0(0)).abs() < 1e-6);
        assert!((rendered[2 * period * 2] - source_ch0(0)).abs() < 1e-6);
        // And mid-loop positions line up too
        assert!((rendered[(period + 100) * 2] - source_ch0(100)).abs() < 1e-6);
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert!(!engine.playback_completed());
    }

    #[test]
    fn test_pre_render_cache_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        fs::create_dir(&cache_dir).unwrap();
        let source = write_source_file(dir.path(), 300);

        let handle = MockSinkHandle::new();
        let mut engine = engine_with(&handle, Some(cache_dir.clone()), true);
        engine.load_file(&source).unwrap();

        engine.prepare_pre_rendered().unwrap();
        assert!(engine.is_pre_rendered_ready());
        assert_eq!(engine.pre_render_progress(), 100);
        assert!(!engine.is_pre_render_in_progress());

        let cache_path = cache_dir.join("binaural_cache.wav");
        assert_eq!(engine.pre_rendered_file_path(), Some(cache_path.as_path()));

        let mut reader = WavReader::open(&cache_path).unwrap();
        assert_eq!(reader.num_channels(), 2);
        assert_eq!(reader.sample_rate(), RATE);
        assert_eq!(reader.bits_per_sample(), 24);
        // 300 source frames + one tail block
        assert_eq!(reader.total_frames(), 300 + BLOCK as u64);

        // Delta IR: L[f] = ch0[f], R[f] = 0.5 × ch0[f-1]
        let frames = 300usize;
        let mut out = vec![0.0f32; (frames + BLOCK) * 2];
        let mut got = 0usize;
        while got < frames + BLOCK {
            let n = reader.read(&mut out[got * 2..], BLOCK).unwrap();
            if n == 0 {
                break;
            }
            got += n;
        }
        let tolerance = 2e-5; // quantization + fft roundoff
        for frame in 0..frames {
            let expected_l = source_ch0(frame);
            let expected_r = if frame >= 1 { 0.5 * source_ch0(frame - 1) } else { 0.0 };
            assert!(
                (out[frame * 2] - expected_l).abs() < tolerance,
                "L at {}: {} vs {}",
                frame,
                out[frame * 2],
                expected_l
            );
            assert!(
                (out[frame * 2 + 1] - expected_r).abs() < tolerance,
                "R at {}: {} vs {}",
                frame,
                out[frame * 2 + 1],
                expected_r
            );
        }

        // Cache playback is the active source now
        engine.play().unwrap();
        let rendered = handle.render(64);
        assert!((rendered[0] - source_ch0(0)).abs() < tolerance);

        // Idempotence: a second pre-render produces byte-identical output
        let first = fs::read(&cache_path).unwrap();
        engine.stop();
        engine.prepare_pre_rendered().unwrap();
        let second = fs::read(&cache_path).unwrap();
        assert_eq!(first, second);

        // Export copies byte-for-byte
        let exported = dir.path().join("export.wav");
        engine.export_pre_rendered(&exported).unwrap();
        assert_eq!(fs::read(&exported).unwrap(), first);
    }

    #[test]
    fn test_use_existing_pre_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        fs::create_dir(&cache_dir).unwrap();
        let source = write_source_file(dir.path(), 300);

        let handle = MockSinkHandle::new();
        let mut engine = engine_with(&handle, Some(cache_dir.clone()), true);
        engine.load_file(&source).unwrap();
        engine.prepare_pre_rendered().unwrap();

        // A second engine adopts the cache without rendering
        let handle2 = MockSinkHandle::new();
        let mut engine2 = engine_with(&handle2, Some(cache_dir.clone()), true);
        engine2.load_file(&source).unwrap();
        assert!(!engine2.is_pre_rendered_ready());
        engine2.use_existing_pre_rendered(&source).unwrap();
        assert!(engine2.is_pre_rendered_ready());
        assert_eq!(engine2.pre_render_progress(), 100);

        // Cache reuse requires convolved playback
        let handle3 = MockSinkHandle::new();
        let mut engine3 = engine_with(&handle3, Some(cache_dir), false);
        engine3.load_file(&source).unwrap();
        assert!(matches!(
            engine3.use_existing_pre_rendered(&source),
            Err(PlaybackError::NotReady(_))
        ));
    }

    #[test]
    fn test_realtime_convolved_play() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source_file(dir.path(), BLOCK * 8);

        let handle = MockSinkHandle::new();
        let mut engine = engine_with(&handle, None, true);
        engine.load_file(&source).unwrap();

        engine.play().unwrap();
        assert_eq!(engine.state(), PlaybackState::Playing);

        // The worker primed at least 3 blocks; the first callback must see
        // fully convolved audio: L = ch0, R = 0.5 × ch0 delayed 1
        let out = handle.render(BLOCK);
        let tolerance = 1e-4;
        for frame in 1..BLOCK {
            assert!(
                (out[frame * 2] - source_ch0(frame)).abs() < tolerance,
                "L at {}: {} vs {}",
                frame,
                out[frame * 2],
                source_ch0(frame)
            );
            assert!(
                (out[frame * 2 + 1] - 0.5 * source_ch0(frame - 1)).abs() < tolerance,
                "R at {}",
                frame
            );
        }

        engine.stop();
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert!(engine.worker.is_none());
        assert!(engine.shared.next_consumer.lock().unwrap().is_none());

        // Play again from the top: same first block
        engine.play().unwrap();
        let out = handle.render(BLOCK);
        assert!((out[2] - source_ch0(1)).abs() < tolerance);
        engine.stop();
    }

    #[test]
    fn test_realtime_play_without_ir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source_file(dir.path(), BLOCK);

        let handle = MockSinkHandle::new();
        // Loader with no blobs at all
        let loader = IrLoader::new(Box::new(MapBlobSource { blobs: HashMap::new() }));
        let mut engine =
            PlaybackEngine::with_block_frames(handle.sink(), loader, None, BLOCK);
        engine.load_file(&source).unwrap(); // IR load failure is non-fatal
        assert!(matches!(
            engine.play(),
            Err(PlaybackError::NotReady(_))
        ));
        assert_eq!(engine.state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_seek_clamps_and_pauses_resume() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source_file(dir.path(), RATE as usize * 2);

        let handle = MockSinkHandle::new();
        let mut engine = engine_with(&handle, None, false);
        engine.load_file(&source).unwrap();

        engine.seek(0.5).unwrap();
        assert!((engine.position_seconds() - 0.5).abs() < 1e-9);

        engine.seek(1e9).unwrap();
        assert!((engine.position_seconds() - engine.duration_seconds()).abs() < 1e-9);

        engine.seek(0.0).unwrap();
        engine.play().unwrap();
        engine.pause();
        assert_eq!(engine.state(), PlaybackState::Paused);
        // Paused: callback produces silence without advancing
        let position = engine.position_seconds();
        let out = handle.render(64);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(engine.position_seconds(), position);

        engine.play().unwrap();
        assert_eq!(engine.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_gain_and_loop_setters() {
        let handle = MockSinkHandle::new();
        let engine = engine_with(&handle, None, false);

        engine.set_playback_gain_db(60.0);
        assert!((engine.playback_gain_db() - MAX_PLAYBACK_GAIN_DB).abs() < 1e-3);
        engine.set_playback_gain_db(-5.0);
        assert!(engine.playback_gain_db().abs() < 1e-6);

        engine.shared.playback_completed.store(true, Ordering::Release);
        engine.set_looping(true);
        assert!(engine.is_looping());
        assert!(!engine.playback_completed());
    }
}
