//! Sphera Core - Engine for the 84-capsule spherical microphone recorder/player
//!
//! This crate hosts the native engine behind the Sphera recorder app:
//!
//! - [`usb`]: USB Audio Class isochronous capture from the array over a
//!   pre-opened usbdevfs file descriptor (descriptor parsing, clock topology,
//!   URB ring).
//! - [`recorder`]: dual-thread recording pipeline (USB reader + disk writer
//!   decoupled by a lock-free ring) with gain smoothing, level meters and
//!   RF64-capable WAV output.
//! - [`convolver`]: 84-input matrix convolution (uniform partitioned
//!   overlap-save) against preset impulse-response matrices.
//! - [`playback`]: file playback with offline pre-render to a stereo cache
//!   and a realtime convolution worker feeding the audio output callback.
//!
//! The host application owns device enumeration, permissions and UI; it talks
//! to the engine exclusively through [`recorder::Recorder`] and
//! [`playback::PlaybackEngine`]. No callbacks cross back from realtime
//! threads into the controller: all progress is polled through atomics.

pub mod config;
pub mod convolver;
pub mod fft;
pub mod playback;
pub mod recorder;
pub mod ring;
pub mod types;
pub mod usb;
pub mod wav;

pub use types::{Sample, BYTES_PER_SAMPLE, CHANNEL_COUNT, FRAME_SIZE};
