//! Preset impulse-response loading
//!
//! Presets ship as interleaved multichannel WAV blobs named
//! `impulse_responses/<preset>_<rate>.wav`. Each file holds the 84 per-capsule
//! impulse responses back to back on the time axis: `total_frames` must be a
//! multiple of 84, and `total_frames / 84` is the per-pair IR length. The
//! WAV's channel count is the preset's output count (2 for the stereo
//! presets, 16 for third-order Ambisonic).
//!
//! Where the blobs come from is the host's business: Android unpacks them
//! from the asset manager, the desktop build reads an install directory.
//! Both sides of that seam are the [`BlobSource`] trait.

use std::io::Cursor;
use std::path::PathBuf;

use thiserror::Error;

use super::MatrixImpulseResponse;
use crate::types::CHANNEL_COUNT;
use crate::wav::{WavError, WavReader};

/// Rendering preset identifiers (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum IrPreset {
    /// Dummy-head binaural stereo
    Binaural,
    /// ORTF near-coincident stereo pair
    Ortf,
    /// X-Y coincident stereo pair
    Xy,
    /// Third-order Ambisonic, 16 channels ACN/SN3D
    ThirdOrderAmbisonic,
}

impl IrPreset {
    /// All presets, in UI order
    pub const ALL: [IrPreset; 4] = [
        IrPreset::Binaural,
        IrPreset::Ortf,
        IrPreset::Xy,
        IrPreset::ThirdOrderAmbisonic,
    ];

    /// Blob base name
    pub fn base_name(&self) -> &'static str {
        match self {
            IrPreset::Binaural => "binaural",
            IrPreset::Ortf => "ortf",
            IrPreset::Xy => "xy",
            IrPreset::ThirdOrderAmbisonic => "3oa",
        }
    }

    /// Rendered output channel count
    pub fn output_channels(&self) -> usize {
        match self {
            IrPreset::ThirdOrderAmbisonic => 16,
            _ => 2,
        }
    }

    /// Blob name for a sample rate; 96k variants are used from 96kHz up
    pub fn blob_name(&self, sample_rate: u32) -> String {
        let rate_suffix = if sample_rate >= 96_000 { "96k" } else { "48k" };
        format!("impulse_responses/{}_{}.wav", self.base_name(), rate_suffix)
    }
}

/// Errors from IR loading
#[derive(Error, Debug)]
pub enum IrError {
    #[error("failed to open IR blob {name}: {source}")]
    Blob {
        name: String,
        source: std::io::Error,
    },

    #[error("IR blob {name} is not a usable WAV file: {source}")]
    Wav { name: String, source: WavError },

    #[error("IR blob {name} does not divide into {expected} impulse responses (frames={frames})")]
    WrongLayout {
        name: String,
        expected: usize,
        frames: u64,
    },

    #[error("IR blob {name} is empty")]
    Empty { name: String },
}

/// Source of preset blobs (asset manager, install dir, test fixture)
pub trait BlobSource: Send + Sync {
    /// Read the entire blob with the given logical name.
    fn open(&self, name: &str) -> std::io::Result<Vec<u8>>;
}

/// Blob source rooted at a filesystem directory
pub struct DirBlobSource {
    root: PathBuf,
}

impl DirBlobSource {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl BlobSource for DirBlobSource {
    fn open(&self, name: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.root.join(name))
    }
}

/// Loader turning preset blobs into [`MatrixImpulseResponse`] matrices
pub struct IrLoader {
    source: Box<dyn BlobSource>,
}

impl IrLoader {
    pub fn new(source: Box<dyn BlobSource>) -> Self {
        Self { source }
    }

    /// Load a preset at the given sample rate.
    ///
    /// A blob whose sample rate differs from the request is accepted with a
    /// warning (the rendering is slightly detuned, which beats failing the
    /// whole playback path).
    pub fn load(&self, preset: IrPreset, sample_rate: u32) -> Result<MatrixImpulseResponse, IrError> {
        let name = preset.blob_name(sample_rate);
        let bytes = self.source.open(&name).map_err(|source| IrError::Blob {
            name: name.clone(),
            source,
        })?;

        let mut reader = WavReader::new(Cursor::new(bytes)).map_err(|source| IrError::Wav {
            name: name.clone(),
            source,
        })?;

        if reader.sample_rate() != sample_rate {
            log::warn!(
                "IR blob {} is {}Hz but {}Hz was requested; continuing",
                name,
                reader.sample_rate(),
                sample_rate
            );
        }

        let num_outputs = reader.num_channels() as usize;
        let total_frames = reader.total_frames();
        if total_frames == 0 {
            return Err(IrError::Empty { name });
        }
        if total_frames % CHANNEL_COUNT as u64 != 0 {
            return Err(IrError::WrongLayout {
                name,
                expected: CHANNEL_COUNT,
                frames: total_frames,
            });
        }
        let ir_length = (total_frames / CHANNEL_COUNT as u64) as usize;

        // Pull the whole interleaved payload, then demultiplex: WAV channel
        // o at frame (in * ir_length + n) is coefficient (o, in, n)
        let total_frames = total_frames as usize;
        let mut interleaved = vec![0.0f32; total_frames * num_outputs];
        let mut cursor = 0usize;
        loop {
            let frames = reader
                .read(&mut interleaved[cursor * num_outputs..], total_frames - cursor)
                .map_err(|source| IrError::Wav {
                    name: name.clone(),
                    source,
                })?;
            if frames == 0 {
                break;
            }
            cursor += frames;
            if cursor >= total_frames {
                break;
            }
        }
        if cursor < total_frames {
            return Err(IrError::Wav {
                name,
                source: WavError::Corrupted("truncated IR payload".into()),
            });
        }

        let mut impulse_data = vec![0.0f32; num_outputs * CHANNEL_COUNT * ir_length];
        for out_channel in 0..num_outputs {
            for in_channel in 0..CHANNEL_COUNT {
                for n in 0..ir_length {
                    let frame = in_channel * ir_length + n;
                    impulse_data[(out_channel * CHANNEL_COUNT + in_channel) * ir_length + n] =
                        interleaved[frame * num_outputs + out_channel];
                }
            }
        }

        let ir = MatrixImpulseResponse {
            sample_rate: reader.sample_rate(),
            ir_length,
            num_input_channels: CHANNEL_COUNT,
            num_output_channels: num_outputs,
            impulse_data,
        };

        log::debug!(
            "Loaded IR {}: length={}, inputs={}, outputs={}",
            name,
            ir.ir_length,
            ir.num_input_channels,
            ir.num_output_channels
        );

        Ok(ir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

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

    /// Minimal float32 WAV blob with the given channel count and frames
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

    #[test]
    fn test_blob_names() {
        assert_eq!(
            IrPreset::Binaural.blob_name(48_000),
            "impulse_responses/binaural_48k.wav"
        );
        assert_eq!(
            IrPreset::ThirdOrderAmbisonic.blob_name(96_000),
            "impulse_responses/3oa_96k.wav"
        );
        assert_eq!(IrPreset::Xy.blob_name(44_100), "impulse_responses/xy_48k.wav");
        assert_eq!(IrPreset::Ortf.output_channels(), 2);
        assert_eq!(IrPreset::ThirdOrderAmbisonic.output_channels(), 16);
    }

    #[test]
    fn test_load_demultiplexes_matrix() {
        let ir_length = 4;
        let total_frames = CHANNEL_COUNT * ir_length;
        // interleaved[frame][channel]: encode (in, n) in L, negate in R
        let mut frames = vec![0.0f32; total_frames * 2];
        for in_channel in 0..CHANNEL_COUNT {
            for n in 0..ir_length {
                let frame = in_channel * ir_length + n;
                let value = (in_channel * 10 + n) as f32 / 1000.0;
                frames[frame * 2] = value;
                frames[frame * 2 + 1] = -value;
            }
        }

        let mut blobs = HashMap::new();
        blobs.insert(
            "impulse_responses/binaural_48k.wav".to_string(),
            float_wav(2, 48_000, &frames),
        );
        let loader = IrLoader::new(Box::new(MapBlobSource { blobs }));

        let ir = loader.load(IrPreset::Binaural, 48_000).unwrap();
        assert!(ir.is_valid());
        assert_eq!(ir.ir_length, ir_length);
        assert_eq!(ir.num_output_channels, 2);

        for in_channel in [0usize, 7, 83] {
            for n in 0..ir_length {
                let value = (in_channel * 10 + n) as f32 / 1000.0;
                assert_eq!(ir.ir(0, in_channel)[n], value);
                assert_eq!(ir.ir(1, in_channel)[n], -value);
            }
        }
    }

    #[test]
    fn test_load_rejects_uneven_frame_count() {
        let frames = vec![0.0f32; (CHANNEL_COUNT * 2 + 1) * 2];
        let mut blobs = HashMap::new();
        blobs.insert(
            "impulse_responses/ortf_48k.wav".to_string(),
            float_wav(2, 48_000, &frames),
        );
        let loader = IrLoader::new(Box::new(MapBlobSource { blobs }));

        assert!(matches!(
            loader.load(IrPreset::Ortf, 48_000),
            Err(IrError::WrongLayout { .. })
        ));
    }

    #[test]
    fn test_load_missing_blob() {
        let loader = IrLoader::new(Box::new(MapBlobSource { blobs: HashMap::new() }));
        assert!(matches!(
            loader.load(IrPreset::Xy, 48_000),
            Err(IrError::Blob { .. })
        ));
    }

    #[test]
    fn test_rate_mismatch_accepted() {
        let frames = vec![0.0f32; CHANNEL_COUNT * 2 * 2];
        let mut blobs = HashMap::new();
        blobs.insert(
            "impulse_responses/binaural_48k.wav".to_string(),
            float_wav(2, 44_100, &frames),
        );
        let loader = IrLoader::new(Box::new(MapBlobSource { blobs }));

        let ir = loader.load(IrPreset::Binaural, 48_000).unwrap();
        assert_eq!(ir.sample_rate, 44_100);
    }
}
