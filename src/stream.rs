//! The per-session append-only PCM stream file.
//!
//! A 16-byte self-describing header (magic, version, sample rate) followed
//! by raw mono `pcm_s16le` frames. Offsets in the checkpoint and marker
//! domain are payload-relative: byte 0 is the first PCM byte after the
//! header. Writes are fsynced before the new offset is reported; a tail
//! past the last durable checkpoint is reclaimed by `truncate_to` on
//! resume.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::PipelineError;

pub const STREAM_MAGIC: &[u8; 8] = b"AURDR\0\0\0";
pub const STREAM_VERSION: u32 = 1;
pub const STREAM_HEADER_LEN: u64 = 16;

/// Serial owner of the stream file. There is exactly one writer per session.
#[derive(Debug)]
pub struct StreamWriter {
    file: File,
    payload_len: u64,
}

impl StreamWriter {
    /// Open the stream, creating it with a header or validating an existing
    /// one against the configured sample rate.
    pub fn open(path: &Path, sample_rate: u32) -> Result<Self, PipelineError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            let mut header = Vec::with_capacity(STREAM_HEADER_LEN as usize);
            header.extend_from_slice(STREAM_MAGIC);
            header.extend_from_slice(&STREAM_VERSION.to_le_bytes());
            header.extend_from_slice(&sample_rate.to_le_bytes());
            file.write_all(&header)?;
            file.sync_data()?;
            return Ok(Self {
                file,
                payload_len: 0,
            });
        }
        let (version, rate) = validate_header(&mut file, len)?;
        if version != STREAM_VERSION {
            return Err(PipelineError::Corruption(format!(
                "stream file version {version} is not supported"
            )));
        }
        if rate != sample_rate {
            return Err(PipelineError::Corruption(format!(
                "stream file was written at {rate} Hz, configured rate is {sample_rate} Hz"
            )));
        }
        Ok(Self {
            file,
            payload_len: len - STREAM_HEADER_LEN,
        })
    }

    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// Append samples, fsync, and return the new payload offset. The offset
    /// is not durable-visible until the checkpoint log records it.
    pub fn append(&mut self, samples: &[i16]) -> Result<u64, PipelineError> {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;
        self.payload_len += bytes.len() as u64;
        Ok(self.payload_len)
    }

    /// Drop any tail past `payload_offset` (resume path).
    pub fn truncate_to(&mut self, payload_offset: u64) -> Result<(), PipelineError> {
        self.file.set_len(STREAM_HEADER_LEN + payload_offset)?;
        self.file.sync_data()?;
        self.payload_len = payload_offset;
        Ok(())
    }
}

fn validate_header(file: &mut File, len: u64) -> Result<(u32, u32), PipelineError> {
    if len < STREAM_HEADER_LEN {
        return Err(PipelineError::Corruption(
            "stream file is shorter than its header".to_string(),
        ));
    }
    let mut header = [0u8; STREAM_HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;
    if &header[..8] != STREAM_MAGIC {
        return Err(PipelineError::Corruption(
            "stream file magic does not match".to_string(),
        ));
    }
    let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let rate = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
    file.seek(SeekFrom::End(0))?;
    Ok((version, rate))
}

/// Read the whole PCM payload back (used by the WAV encoder and tests).
pub fn read_payload(path: &Path) -> Result<(u32, Vec<i16>), PipelineError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let (version, rate) = validate_header(&mut file, len)?;
    if version != STREAM_VERSION {
        return Err(PipelineError::Corruption(format!(
            "stream file version {version} is not supported"
        )));
    }
    file.seek(SeekFrom::Start(STREAM_HEADER_LEN))?;
    let mut bytes = Vec::with_capacity((len - STREAM_HEADER_LEN) as usize);
    file.read_to_end(&mut bytes)?;
    let samples = bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    Ok((rate, samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_header_and_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream.pcm");
        let mut writer = StreamWriter::open(&path, 48000).unwrap();
        assert_eq!(writer.payload_len(), 0);
        let offset = writer.append(&[1, 2, 3]).unwrap();
        assert_eq!(offset, 6);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16 + 6);

        let (rate, samples) = read_payload(&path).unwrap();
        assert_eq!(rate, 48000);
        assert_eq!(samples, vec![1, 2, 3]);
    }

    #[test]
    fn reopens_existing_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream.pcm");
        {
            let mut writer = StreamWriter::open(&path, 48000).unwrap();
            writer.append(&[9; 100]).unwrap();
        }
        let writer = StreamWriter::open(&path, 48000).unwrap();
        assert_eq!(writer.payload_len(), 200);
    }

    #[test]
    fn rejects_rate_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream.pcm");
        {
            StreamWriter::open(&path, 48000).unwrap();
        }
        let err = StreamWriter::open(&path, 24000).unwrap_err();
        assert!(matches!(err, PipelineError::Corruption(_)));
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream.pcm");
        std::fs::write(&path, b"WAVEFMT0\0\0\0\0\0\0\0\0extra").unwrap();
        let err = StreamWriter::open(&path, 48000).unwrap_err();
        assert!(matches!(err, PipelineError::Corruption(_)));
    }

    #[test]
    fn truncation_drops_the_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream.pcm");
        let mut writer = StreamWriter::open(&path, 48000).unwrap();
        writer.append(&[1; 50]).unwrap();
        let keep = writer.payload_len();
        writer.append(&[2; 50]).unwrap();
        writer.truncate_to(keep).unwrap();
        assert_eq!(writer.payload_len(), keep);

        let (_, samples) = read_payload(&path).unwrap();
        assert_eq!(samples, vec![1; 50]);

        // Appends continue cleanly after truncation.
        let offset = writer.append(&[3; 10]).unwrap();
        assert_eq!(offset, keep + 20);
        let (_, samples) = read_payload(&path).unwrap();
        assert_eq!(&samples[50..], &[3; 10]);
    }
}
