//! WAV / RF64 reader
//!
//! Streams interleaved frames as `f32` regardless of the on-disk encoding.
//! Integer PCM is scaled by 1/2^15, 1/2^23 or 1/2^31; float32 passes
//! through. Unknown chunks are skipped honoring even-byte padding. A `data`
//! chunk size of 0xFFFFFFFF defers to the 64-bit size from a preceding
//! `ds64` chunk.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::{SampleFormat, WavError, WavFormat, WavResult};

/// Streaming WAV/RF64 reader over any seekable byte source.
///
/// `WavReader::open` reads from a file; `WavReader::new` accepts any
/// `Read + Seek` (the IR loader parses in-memory blobs through a cursor).
pub struct WavReader<R = BufReader<File>> {
    reader: R,
    format: WavFormat,
    data_offset: u64,
    data_size: u64,
    total_frames: u64,
    current_frame: u64,
    scratch: Vec<u8>,
}

impl WavReader<BufReader<File>> {
    /// Open a WAV/RF64 file from a filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> WavResult<Self> {
        let file = File::open(path.as_ref())?;
        let reader = Self::new(BufReader::new(file))?;
        log::debug!(
            "Opened WAV file {}: {}ch, {}Hz, {}-bit, {} frames",
            path.as_ref().display(),
            reader.format.num_channels,
            reader.format.sample_rate,
            reader.format.bits_per_sample,
            reader.total_frames
        );
        Ok(reader)
    }

    /// Take ownership of a duplicated, pre-opened descriptor.
    #[cfg(unix)]
    pub fn open_fd(fd: std::os::unix::io::RawFd) -> WavResult<Self> {
        use std::os::unix::io::FromRawFd;

        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(WavError::Io(std::io::Error::last_os_error()));
        }
        let file = unsafe { File::from_raw_fd(dup_fd) };
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> WavReader<R> {
    /// Parse the header chunks and position the source at the first frame.
    pub fn new(mut reader: R) -> WavResult<Self> {
        let mut preamble = [0u8; 12];
        reader.read_exact(&mut preamble)?;

        let is_rf64 = match &preamble[0..4] {
            b"RIFF" => false,
            b"RF64" => true,
            _ => return Err(WavError::NotWave),
        };
        if &preamble[8..12] != b"WAVE" {
            return Err(WavError::NotWave);
        }

        let mut format: Option<WavFormat> = None;
        let mut ds64_data_size: Option<u64> = None;
        let mut data: Option<(u64, u64)> = None; // (offset, size)

        let mut header = [0u8; 8];
        loop {
            if reader.read_exact(&mut header).is_err() {
                break; // clean EOF between chunks
            }
            let chunk_id: [u8; 4] = header[0..4].try_into().unwrap();
            let chunk_size = u32::from_le_bytes(header[4..8].try_into().unwrap());

            match &chunk_id {
                b"ds64" => {
                    if chunk_size < 28 {
                        return Err(WavError::Corrupted("short ds64 chunk".into()));
                    }
                    let mut body = [0u8; 28];
                    reader.read_exact(&mut body)?;
                    ds64_data_size =
                        Some(u64::from_le_bytes(body[8..16].try_into().unwrap()));
                    skip_bytes(&mut reader, chunk_size as u64 - 28)?;
                    skip_padding(&mut reader, chunk_size)?;
                }
                b"fmt " => {
                    if chunk_size < 16 {
                        return Err(WavError::Corrupted("short fmt chunk".into()));
                    }
                    let mut body = [0u8; 16];
                    reader.read_exact(&mut body)?;

                    let format_tag = u16::from_le_bytes(body[0..2].try_into().unwrap());
                    let sample_format = match format_tag {
                        1 => SampleFormat::Pcm,
                        3 => SampleFormat::Float,
                        other => return Err(WavError::UnsupportedFormat(other)),
                    };
                    let parsed = WavFormat {
                        sample_format,
                        num_channels: u16::from_le_bytes(body[2..4].try_into().unwrap()),
                        sample_rate: u32::from_le_bytes(body[4..8].try_into().unwrap()),
                        bits_per_sample: u16::from_le_bytes(body[14..16].try_into().unwrap()),
                    };
                    parsed.validate()?;
                    if parsed.num_channels == 0 {
                        return Err(WavError::Corrupted("zero channels".into()));
                    }
                    format = Some(parsed);

                    skip_bytes(&mut reader, chunk_size as u64 - 16)?;
                    skip_padding(&mut reader, chunk_size)?;
                }
                b"data" => {
                    let size = if chunk_size == u32::MAX {
                        match ds64_data_size {
                            Some(size) if is_rf64 => size,
                            _ => {
                                return Err(WavError::Corrupted(
                                    "data size sentinel without ds64".into(),
                                ))
                            }
                        }
                    } else {
                        chunk_size as u64
                    };
                    let offset = reader.stream_position()?;
                    data = Some((offset, size));
                    break;
                }
                _ => {
                    skip_bytes(&mut reader, chunk_size as u64)?;
                    skip_padding(&mut reader, chunk_size)?;
                }
            }
        }

        let format = format.ok_or(WavError::MissingChunk("fmt "))?;
        let (data_offset, data_size) = data.ok_or(WavError::MissingChunk("data"))?;

        let bytes_per_frame = format.bytes_per_frame() as u64;
        let total_frames = data_size / bytes_per_frame;

        reader.seek(SeekFrom::Start(data_offset))?;

        // Sized for the playback block so steady-state reads never allocate
        let scratch = vec![0u8; bytes_per_frame as usize * 4096];

        Ok(Self {
            reader,
            format,
            data_offset,
            data_size,
            total_frames,
            current_frame: 0,
            scratch,
        })
    }

    /// Read up to `frames` interleaved frames into `out` as f32 in [-1, 1].
    /// Returns the number of frames produced; 0 at end of data.
    pub fn read(&mut self, out: &mut [f32], frames: usize) -> WavResult<usize> {
        let remaining = (self.total_frames - self.current_frame) as usize;
        let to_read = frames.min(remaining);
        if to_read == 0 {
            return Ok(0);
        }

        let bytes_per_frame = self.format.bytes_per_frame();
        let byte_count = to_read * bytes_per_frame;
        if self.scratch.len() < byte_count {
            self.scratch.resize(byte_count, 0);
        }

        // Tolerate truncated files: deliver whole frames up to what's there
        let mut filled = 0usize;
        while filled < byte_count {
            let n = self.reader.read(&mut self.scratch[filled..byte_count])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let frames_read = filled / bytes_per_frame;
        if frames_read == 0 {
            return Ok(0);
        }

        let samples = frames_read * self.format.num_channels as usize;
        debug_assert!(out.len() >= samples);

        match (self.format.sample_format, self.format.bits_per_sample) {
            (SampleFormat::Pcm, 16) => {
                const SCALE: f32 = 1.0 / 32_768.0;
                for (i, chunk) in self.scratch[..filled].chunks_exact(2).take(samples).enumerate() {
                    let v = i16::from_le_bytes([chunk[0], chunk[1]]);
                    out[i] = v as f32 * SCALE;
                }
            }
            (SampleFormat::Pcm, 24) => {
                const SCALE: f32 = 1.0 / crate::types::PCM24_FULL_SCALE;
                for (i, chunk) in self.scratch[..filled].chunks_exact(3).take(samples).enumerate() {
                    out[i] = crate::types::pcm24_read(chunk) as f32 * SCALE;
                }
            }
            (SampleFormat::Pcm, 32) => {
                const SCALE: f32 = 1.0 / 2_147_483_648.0;
                for (i, chunk) in self.scratch[..filled].chunks_exact(4).take(samples).enumerate() {
                    let v = i32::from_le_bytes(chunk.try_into().unwrap());
                    out[i] = v as f32 * SCALE;
                }
            }
            (SampleFormat::Float, 32) => {
                for (i, chunk) in self.scratch[..filled].chunks_exact(4).take(samples).enumerate() {
                    out[i] = f32::from_le_bytes(chunk.try_into().unwrap());
                }
            }
            (_, bits) => return Err(WavError::UnsupportedBitDepth(bits)),
        }

        self.current_frame += frames_read as u64;
        Ok(frames_read)
    }

    /// Reposition to an absolute frame, clamped to `[0, total_frames]`.
    pub fn seek(&mut self, frame: u64) -> WavResult<()> {
        let frame = frame.min(self.total_frames);
        let offset = self.data_offset + frame * self.format.bytes_per_frame() as u64;
        self.reader.seek(SeekFrom::Start(offset))?;
        self.current_frame = frame;
        Ok(())
    }

    /// Current frame position
    pub fn position(&self) -> u64 {
        self.current_frame
    }

    /// Total frames in the data chunk
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Data chunk payload size in bytes
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn format(&self) -> &WavFormat {
        &self.format
    }

    pub fn num_channels(&self) -> u16 {
        self.format.num_channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.format.bits_per_sample
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.format.sample_rate == 0 {
            return 0.0;
        }
        self.total_frames as f64 / self.format.sample_rate as f64
    }
}

fn skip_bytes<R: Read + Seek>(reader: &mut R, count: u64) -> WavResult<()> {
    if count > 0 {
        reader.seek(SeekFrom::Current(count as i64))?;
    }
    Ok(())
}

fn skip_padding<R: Read + Seek>(reader: &mut R, chunk_size: u32) -> WavResult<()> {
    if chunk_size % 2 == 1 {
        reader.seek(SeekFrom::Current(1))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wav::WavWriter;
    use std::io::Cursor;

    fn float_format(channels: u16) -> WavFormat {
        WavFormat {
            sample_format: SampleFormat::Float,
            num_channels: channels,
            sample_rate: 48_000,
            bits_per_sample: 32,
        }
    }

    #[test]
    fn test_float_roundtrip_and_seek() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.wav");

        let samples: Vec<f32> = (0..256).map(|i| (i as f32 / 256.0) - 0.5).collect();
        let mut writer = WavWriter::create(&path, float_format(2)).unwrap();
        writer.write_data(bytemuck::cast_slice(&samples)).unwrap();
        writer.close().unwrap();

        let mut reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.num_channels(), 2);
        assert_eq!(reader.total_frames(), 128);

        let mut out = vec![0.0f32; 256];
        assert_eq!(reader.read(&mut out, 128).unwrap(), 128);
        assert_eq!(out, samples);
        assert_eq!(reader.read(&mut out, 128).unwrap(), 0);

        // Seek back to the middle and reread
        reader.seek(64).unwrap();
        assert_eq!(reader.position(), 64);
        assert_eq!(reader.read(&mut out, 64).unwrap(), 64);
        assert_eq!(out[..128], samples[128..]);

        // Seek clamps past the end
        reader.seek(10_000).unwrap();
        assert_eq!(reader.position(), 128);
    }

    #[test]
    fn test_reads_hound_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hound.wav");

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for v in [0i16, 16_384, -16_384, 32_767, -32_768] {
            writer.write_sample(v).unwrap();
        }
        writer.finalize().unwrap();

        let mut reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.total_frames(), 5);
        let mut out = [0.0f32; 5];
        assert_eq!(reader.read(&mut out, 5).unwrap(), 5);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[2] + 0.5).abs() < 1e-6);
        assert!((out[3] - 32_767.0 / 32_768.0).abs() < 1e-6);
        assert_eq!(out[4], -1.0);
    }

    #[test]
    fn test_skips_unknown_chunks_with_padding() {
        let mut bytes: Vec<u8> = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&0u32.to_le_bytes()); // patched below
        bytes.extend_from_slice(b"WAVE");

        // Odd-sized unknown chunk, padded to even
        bytes.extend_from_slice(b"bext");
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 0]);

        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
        bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
        bytes.extend_from_slice(&48_000u32.to_le_bytes());
        bytes.extend_from_slice(&96_000u32.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());

        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&100i16.to_le_bytes());
        bytes.extend_from_slice(&(-100i16).to_le_bytes());

        let riff_size = (bytes.len() - 8) as u32;
        bytes[4..8].copy_from_slice(&riff_size.to_le_bytes());

        let mut reader = WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.total_frames(), 2);
        let mut out = [0.0f32; 2];
        assert_eq!(reader.read(&mut out, 2).unwrap(), 2);
        assert!((out[0] - 100.0 / 32_768.0).abs() < 1e-7);
    }

    #[test]
    fn test_rf64_with_ds64_size() {
        let mut bytes: Vec<u8> = Vec::new();
        bytes.extend_from_slice(b"RF64");
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(b"WAVE");

        bytes.extend_from_slice(b"ds64");
        bytes.extend_from_slice(&28u32.to_le_bytes());
        bytes.extend_from_slice(&200u64.to_le_bytes()); // riff size (unused)
        bytes.extend_from_slice(&8u64.to_le_bytes()); // data size
        bytes.extend_from_slice(&4u64.to_le_bytes()); // sample count
        bytes.extend_from_slice(&0u32.to_le_bytes()); // table length

        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&48_000u32.to_le_bytes());
        bytes.extend_from_slice(&96_000u32.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());

        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&u32::MAX.to_le_bytes()); // sentinel
        for v in [1i16, 2, 3, 4] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        let reader = WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.data_size(), 8);
        assert_eq!(reader.total_frames(), 4);
    }

    #[test]
    fn test_rejects_non_wave() {
        let bytes = b"RIFF\x04\x00\x00\x00JUNK".to_vec();
        assert!(matches!(
            WavReader::new(Cursor::new(bytes)),
            Err(WavError::NotWave)
        ));
    }

    #[test]
    fn test_rejects_unknown_format_tag() {
        let mut bytes: Vec<u8> = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&36u32.to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&85u16.to_le_bytes()); // MP3, not supported
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&48_000u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());

        assert!(matches!(
            WavReader::new(Cursor::new(bytes)),
            Err(WavError::UnsupportedFormat(85))
        ));
    }
}
