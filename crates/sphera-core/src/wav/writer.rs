//! RF64-capable WAV writer
//!
//! Header layout written on open (all offsets fixed):
//!
//! ```text
//! 0   "RIFF"          (rewritten as "RF64" on overflow)
//! 4   u32 riff size   (0xFFFFFFFF on overflow)
//! 8   "WAVE"
//! 12  "JUNK" u32:28   (rewritten as "ds64" on overflow)
//! 20  28 reserved bytes
//! 48  "fmt " u32:16   fmt body
//! 72  "data" u32 size (0xFFFFFFFF on overflow)
//! 80  payload...
//! ```
//!
//! Data is streamed sequentially; the header is patched in place on close
//! and the write cursor restored, so a close can also be used as a periodic
//! checkpoint while recording continues.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use super::{SampleFormat, WavError, WavFormat, WavResult};

const RIFF_SIZE_OFFSET: u64 = 4;
const RESERVED_CHUNK_OFFSET: u64 = 12;
const DATA_SIZE_OFFSET: u64 = 76;
const DATA_START_OFFSET: u64 = 80;

/// Streaming WAV/RF64 writer
pub struct WavWriter {
    file: Option<BufWriter<File>>,
    format: WavFormat,
    data_size: u64,
}

impl WavWriter {
    /// Create the file at `path` (truncating) and write the provisional
    /// header.
    pub fn create<P: AsRef<Path>>(path: P, format: WavFormat) -> WavResult<Self> {
        format.validate()?;
        log::info!(
            "Opening WAV file: {} ({}Hz, {}ch, {}bit)",
            path.as_ref().display(),
            format.sample_rate,
            format.num_channels,
            format.bits_per_sample
        );

        let file = File::create(path)?;
        Self::from_file(file, format)
    }

    /// Take ownership of a duplicated, pre-opened descriptor (Android SAF
    /// style hand-off) and write the provisional header.
    #[cfg(unix)]
    pub fn create_from_fd(fd: std::os::unix::io::RawFd, format: WavFormat) -> WavResult<Self> {
        use std::os::unix::io::FromRawFd;

        format.validate()?;
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(WavError::Io(std::io::Error::last_os_error()));
        }
        let file = unsafe { File::from_raw_fd(dup_fd) };
        log::info!("WAV writer opened from fd={}", dup_fd);
        Self::from_file(file, format)
    }

    fn from_file(file: File, format: WavFormat) -> WavResult<Self> {
        let mut writer = BufWriter::new(file);
        write_provisional_header(&mut writer, &format)?;

        Ok(Self {
            file: Some(writer),
            format,
            data_size: 0,
        })
    }

    /// Append raw interleaved sample bytes to the data chunk.
    pub fn write_data(&mut self, data: &[u8]) -> WavResult<()> {
        let file = self.file.as_mut().ok_or(WavError::Closed)?;
        if data.is_empty() {
            return Ok(());
        }
        file.write_all(data)?;
        self.data_size += data.len() as u64;
        Ok(())
    }

    /// Bytes written to the data chunk so far
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Stream format this writer was opened with
    pub fn format(&self) -> &WavFormat {
        &self.format
    }

    /// Patch the header for the current data size and restore the write
    /// cursor. Promotes the file to RF64 when the 32-bit fields overflow.
    pub fn update_header(&mut self) -> WavResult<()> {
        let format = self.format;
        let data_size = self.data_size;
        let file = self.file.as_mut().ok_or(WavError::Closed)?;

        file.flush()?;
        let inner = file.get_mut();
        let restore = inner.stream_position()?;

        let riff_size = DATA_START_OFFSET - 8 + data_size;
        if data_size <= u32::MAX as u64 && riff_size <= u32::MAX as u64 {
            inner.seek(SeekFrom::Start(RIFF_SIZE_OFFSET))?;
            inner.write_all(&(riff_size as u32).to_le_bytes())?;
            inner.seek(SeekFrom::Start(DATA_SIZE_OFFSET))?;
            inner.write_all(&(data_size as u32).to_le_bytes())?;
        } else {
            let sample_count = data_size / format.bytes_per_frame() as u64;

            inner.seek(SeekFrom::Start(0))?;
            inner.write_all(b"RF64")?;
            inner.write_all(&u32::MAX.to_le_bytes())?;

            // Rewrite the reserved JUNK chunk as ds64
            inner.seek(SeekFrom::Start(RESERVED_CHUNK_OFFSET))?;
            inner.write_all(b"ds64")?;
            inner.write_all(&28u32.to_le_bytes())?;
            inner.write_all(&riff_size.to_le_bytes())?;
            inner.write_all(&data_size.to_le_bytes())?;
            inner.write_all(&sample_count.to_le_bytes())?;
            inner.write_all(&0u32.to_le_bytes())?;

            inner.seek(SeekFrom::Start(DATA_SIZE_OFFSET))?;
            inner.write_all(&u32::MAX.to_le_bytes())?;
        }

        inner.seek(SeekFrom::Start(restore))?;
        Ok(())
    }

    /// Finalize the header and close the file.
    pub fn close(&mut self) -> WavResult<()> {
        if self.file.is_none() {
            return Ok(());
        }
        log::info!("Closing WAV file (wrote {} data bytes)", self.data_size);
        self.update_header()?;
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_data_size_for_tests(&mut self, size: u64) {
        self.data_size = size;
    }
}

impl Drop for WavWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(e) = self.close() {
                log::error!("Failed to finalize WAV file on drop: {}", e);
            }
        }
    }
}

fn write_provisional_header<W: Write>(writer: &mut W, format: &WavFormat) -> WavResult<()> {
    let format_tag: u16 = match format.sample_format {
        SampleFormat::Pcm => 1,
        SampleFormat::Float => 3,
    };
    let block_align = format.bytes_per_frame() as u16;
    let byte_rate = format.sample_rate * block_align as u32;

    writer.write_all(b"RIFF")?;
    writer.write_all(&((DATA_START_OFFSET - 8) as u32).to_le_bytes())?;
    writer.write_all(b"WAVE")?;

    // Reservation for a ds64 chunk, ignored by RIFF readers
    writer.write_all(b"JUNK")?;
    writer.write_all(&28u32.to_le_bytes())?;
    writer.write_all(&[0u8; 28])?;

    writer.write_all(b"fmt ")?;
    writer.write_all(&16u32.to_le_bytes())?;
    writer.write_all(&format_tag.to_le_bytes())?;
    writer.write_all(&format.num_channels.to_le_bytes())?;
    writer.write_all(&format.sample_rate.to_le_bytes())?;
    writer.write_all(&byte_rate.to_le_bytes())?;
    writer.write_all(&block_align.to_le_bytes())?;
    writer.write_all(&format.bits_per_sample.to_le_bytes())?;

    writer.write_all(b"data")?;
    writer.write_all(&0u32.to_le_bytes())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wav::WavReader;

    fn pcm24_format(channels: u16) -> WavFormat {
        WavFormat {
            sample_format: SampleFormat::Pcm,
            num_channels: channels,
            sample_rate: 48_000,
            bits_per_sample: 24,
        }
    }

    #[test]
    fn test_riff_header_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.wav");

        let mut writer = WavWriter::create(&path, pcm24_format(2)).unwrap();
        writer.write_data(&[0u8; 12]).unwrap();
        writer.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 72 + 12);
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(&bytes[12..16], b"JUNK");
        assert_eq!(&bytes[48..52], b"fmt ");
        assert_eq!(&bytes[72..76], b"data");
        assert_eq!(u32::from_le_bytes(bytes[76..80].try_into().unwrap()), 12);
        assert_eq!(bytes.len(), 80 + 12);
    }

    #[test]
    fn test_rf64_promotion_at_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.wav");

        let mut writer = WavWriter::create(&path, pcm24_format(84)).unwrap();
        writer.write_data(&[0u8; 252]).unwrap();
        // Pretend exactly 2^32 data bytes were streamed
        writer.set_data_size_for_tests(1u64 << 32);
        writer.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RF64");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), u32::MAX);
        assert_eq!(&bytes[12..16], b"ds64");
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 28);

        let riff64 = u64::from_le_bytes(bytes[20..28].try_into().unwrap());
        let data64 = u64::from_le_bytes(bytes[28..36].try_into().unwrap());
        let samples64 = u64::from_le_bytes(bytes[36..44].try_into().unwrap());
        assert_eq!(data64, 1u64 << 32);
        assert_eq!(riff64, 72 + (1u64 << 32));
        assert_eq!(samples64, (1u64 << 32) / 252);
        assert_eq!(u32::from_le_bytes(bytes[44..48].try_into().unwrap()), 0);

        // 32-bit data size must be the overflow sentinel
        assert_eq!(u32::from_le_bytes(bytes[76..80].try_into().unwrap()), u32::MAX);
    }

    #[test]
    fn test_hound_reads_our_pcm16_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cross.wav");

        let format = WavFormat {
            sample_format: SampleFormat::Pcm,
            num_channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
        };
        let samples: Vec<i16> = vec![0, 1000, -1000, i16::MAX, i16::MIN, 42];
        let mut writer = WavWriter::create(&path, format).unwrap();
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        writer.write_data(&bytes).unwrap();
        writer.close().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 44_100);
        assert_eq!(reader.spec().bits_per_sample, 16);
        let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read, samples);
    }

    #[test]
    fn test_own_reader_roundtrip_24bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rt24.wav");

        let mut writer = WavWriter::create(&path, pcm24_format(1)).unwrap();
        let values = [0i32, 1, -1, 4_194_304, -4_194_304, 8_388_607, -8_388_608];
        let mut bytes = Vec::new();
        for v in values {
            let mut b = [0u8; 3];
            crate::types::pcm24_write(v, &mut b);
            bytes.extend_from_slice(&b);
        }
        writer.write_data(&bytes).unwrap();
        writer.close().unwrap();

        let mut reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.total_frames(), values.len() as u64);
        let mut out = vec![0.0f32; values.len()];
        let frames = reader.read(&mut out, values.len()).unwrap();
        assert_eq!(frames, values.len());
        for (f, v) in out.iter().zip(values.iter()) {
            let expected = *v as f32 / crate::types::PCM24_FULL_SCALE;
            assert!((f - expected).abs() < 1e-7, "got {} want {}", f, expected);
        }
    }
}
