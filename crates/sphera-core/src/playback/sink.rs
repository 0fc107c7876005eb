//! Audio output port
//!
//! The playback engine renders into a pull callback; the sink owns the
//! relationship with the OS audio driver and invokes that callback from its
//! realtime thread. [`CpalSink`] is the production implementation;
//! tests drive the callback by hand through a mock.
//!
//! Sinks live on the controller thread next to the engine; only the
//! callback crosses into the driver's realtime context.

use thiserror::Error;

/// Pull callback: fill the interleaved stereo buffer (`len = frames × 2`).
/// Must never block, allocate or panic.
pub type SinkCallback = Box<dyn FnMut(&mut [f32]) + Send>;

/// Output-device failures
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("no audio output device available")]
    NoDevice,

    #[error("failed to get device config: {0}")]
    Config(String),

    #[error("failed to build audio stream: {0}")]
    BuildStream(String),

    #[error("failed to start audio stream: {0}")]
    Play(String),

    #[error("sink not initialized")]
    NotInitialized,
}

/// Pull-based stereo output
pub trait AudioSink {
    /// (Re)create the output stream at a sample rate and fixed block size,
    /// binding the pull callback. The stream starts paused.
    fn initialize(
        &mut self,
        sample_rate: u32,
        buffer_frames: usize,
        callback: SinkCallback,
    ) -> Result<(), SinkError>;

    fn start(&mut self) -> Result<(), SinkError>;
    fn pause(&mut self);
    fn stop(&mut self);
    fn is_playing(&self) -> bool;
}

/// cpal-backed output sink
///
/// Builds an f32 output stream on the default device, asking for the
/// requested rate and a fixed buffer size. The device may expose more than
/// two channels; extra channels are filled with silence.
pub struct CpalSink {
    stream: Option<cpal::Stream>,
    playing: bool,
}

impl CpalSink {
    pub fn new() -> Self {
        Self {
            stream: None,
            playing: false,
        }
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for CpalSink {
    fn initialize(
        &mut self,
        sample_rate: u32,
        buffer_frames: usize,
        mut callback: SinkCallback,
    ) -> Result<(), SinkError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        self.stream = None;
        self.playing = false;

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(SinkError::NoDevice)?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device
            .supported_output_configs()
            .map_err(|e| SinkError::Config(e.to_string()))?
            .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
            .filter(|c| c.channels() >= 2)
            .find(|c| {
                sample_rate >= c.min_sample_rate().0 && sample_rate <= c.max_sample_rate().0
            })
            .ok_or_else(|| {
                SinkError::Config(format!(
                    "{} has no stereo f32 config at {} Hz",
                    device_name, sample_rate
                ))
            })?;

        let channels = supported.channels() as usize;
        let config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Fixed(buffer_frames as u32),
        };

        log::info!(
            "Audio sink: {} ({} channels, {} Hz, {} frames)",
            device_name,
            channels,
            sample_rate,
            buffer_frames
        );

        // The engine renders stereo; interleave into however many channels
        // the device wants
        let mut stereo = vec![0.0f32; buffer_frames * 2];
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    let needed = frames * 2;
                    if stereo.len() < needed {
                        // Driver handed us more than the negotiated block;
                        // render what fits and silence the rest
                        log::warn!("Sink callback got {} frames, expected at most {}", frames, stereo.len() / 2);
                    }
                    let render = needed.min(stereo.len());
                    callback(&mut stereo[..render]);

                    for (frame_index, frame) in data.chunks_mut(channels).enumerate() {
                        let base = frame_index * 2;
                        if base + 1 < render {
                            frame[0] = stereo[base];
                            if channels > 1 {
                                frame[1] = stereo[base + 1];
                            }
                            for extra in frame.iter_mut().skip(2) {
                                *extra = 0.0;
                            }
                        } else {
                            for sample in frame.iter_mut() {
                                *sample = 0.0;
                            }
                        }
                    }
                },
                move |err| {
                    log::error!("Audio sink stream error: {}", err);
                },
                None,
            )
            .map_err(|e| SinkError::BuildStream(e.to_string()))?;

        // Streams start running on some hosts; hold it until play()
        let _ = stream.pause();
        self.stream = Some(stream);
        Ok(())
    }

    fn start(&mut self) -> Result<(), SinkError> {
        use cpal::traits::StreamTrait;

        let stream = self.stream.as_ref().ok_or(SinkError::NotInitialized)?;
        stream.play().map_err(|e| SinkError::Play(e.to_string()))?;
        self.playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        use cpal::traits::StreamTrait;

        if let Some(stream) = &self.stream {
            if let Err(e) = stream.pause() {
                log::warn!("Failed to pause audio stream: {}", e);
            }
        }
        self.playing = false;
    }

    fn stop(&mut self) {
        self.pause();
    }

    fn is_playing(&self) -> bool {
        self.playing
    }
}
