//! WAV / RF64 file I/O
//!
//! The recorder writes 84-channel 24-bit PCM; at 48kHz that is ~43 MiB per
//! second of audio, so a take longer than about 5½ minutes no longer fits a
//! 32-bit RIFF size. The writer therefore reserves a `JUNK` chunk directly
//! after the `WAVE` tag and, when the final sizes overflow, rewrites it as
//! the RF64 `ds64` chunk carrying the 64-bit sizes. Files that stay small
//! close as plain RIFF and are readable by any WAV tool.
//!
//! The reader accepts both forms and converts PCM 16/24/32 and float32
//! payloads to `f32` in [-1, 1].

mod reader;
mod writer;

pub use reader::WavReader;
pub use writer::WavWriter;

use thiserror::Error;

/// Errors from WAV parsing and writing
#[derive(Error, Debug)]
pub enum WavError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a RIFF/RF64 WAVE file")]
    NotWave,

    #[error("missing required chunk: {0}")]
    MissingChunk(&'static str),

    #[error("unsupported audio format tag: {0}")]
    UnsupportedFormat(u16),

    #[error("unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),

    #[error("file corrupted: {0}")]
    Corrupted(String),

    #[error("writer is closed")]
    Closed,
}

/// Result alias for WAV operations
pub type WavResult<T> = Result<T, WavError>;

/// Sample encoding of the data chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Integer PCM (format tag 1)
    Pcm,
    /// IEEE float (format tag 3)
    Float,
}

/// Parsed (or to-be-written) stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    pub sample_format: SampleFormat,
    pub num_channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavFormat {
    /// Bytes per single-channel sample
    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// Bytes per interleaved frame
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.num_channels as usize
    }

    pub(crate) fn validate(&self) -> WavResult<()> {
        match (self.sample_format, self.bits_per_sample) {
            (SampleFormat::Pcm, 16 | 24 | 32) => Ok(()),
            (SampleFormat::Float, 32) => Ok(()),
            (_, bits) => Err(WavError::UnsupportedBitDepth(bits)),
        }
    }
}
