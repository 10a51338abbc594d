//! The TTS backend seam.
//!
//! The pipeline is handed a `TtsEngine`; it never discovers or downloads
//! backends itself. The binary ships one concrete implementation that shells
//! out to espeak-ng (or espeak) so a plain install works end-to-end; hosts
//! with a neural backend implement the trait around it.

use std::io::Cursor;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Errors a backend may report. Only `Transient` is retried.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend rejected input: {0}")]
    InvalidInput(String),

    #[error("backend failure: {0}")]
    Fatal(String),
}

/// One synthesized span of audio.
#[derive(Clone, Debug)]
pub struct TtsAudio {
    /// Mono samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Identity of a backend; folded into the settings fingerprint so swapping
/// models invalidates resume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineInfo {
    pub name: String,
    pub version: String,
    pub native_sample_rate: u32,
}

/// A text-to-speech backend.
///
/// Must be safe to call concurrently when the synthesis pool runs more than
/// one worker; implementations wrapping a single-threaded model should guard
/// it internally or be run with `parallel_workers = 1`.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
        speed: f32,
    ) -> Result<TtsAudio, EngineError>;

    fn info(&self) -> EngineInfo;
}

/// espeak words-per-minute at speed 1.0.
const ESPEAK_BASE_WPM: f32 = 175.0;

/// Backend that spawns espeak-ng/espeak per span and reads WAV from stdout.
///
/// Each call is an independent process, so the engine is trivially
/// thread-safe and any worker-pool size is valid.
pub struct EspeakEngine {
    program: String,
    version: String,
}

impl EspeakEngine {
    /// Probe for an installed espeak binary.
    pub fn detect() -> Result<Self, EngineError> {
        for program in ["espeak-ng", "espeak"] {
            let probe = std::process::Command::new(program)
                .arg("--version")
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .output();
            if let Ok(output) = probe {
                if output.status.success() {
                    let version = String::from_utf8_lossy(&output.stdout)
                        .split_whitespace()
                        .take(3)
                        .collect::<Vec<_>>()
                        .join(" ");
                    return Ok(Self {
                        program: program.to_string(),
                        version,
                    });
                }
            }
        }
        Err(EngineError::Fatal(
            "no TTS backend found; install espeak-ng or espeak".to_string(),
        ))
    }
}

#[async_trait]
impl TtsEngine for EspeakEngine {
    async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
        speed: f32,
    ) -> Result<TtsAudio, EngineError> {
        if text.trim().is_empty() {
            return Err(EngineError::InvalidInput("empty span text".to_string()));
        }
        let wpm = (ESPEAK_BASE_WPM * speed).round().clamp(80.0, 450.0) as u32;
        debug!(program = %self.program, voice = voice_id, wpm, "spawning espeak");
        let output = tokio::process::Command::new(&self.program)
            .arg("--stdout")
            .arg("-v")
            .arg(voice_id)
            .arg("-s")
            .arg(wpm.to_string())
            .arg("--")
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineError::Transient(format!("failed to spawn {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // espeak reports an unknown voice on stderr and exits non-zero.
            if stderr.to_lowercase().contains("voice") {
                return Err(EngineError::InvalidInput(format!(
                    "unknown voice '{voice_id}': {}",
                    stderr.trim()
                )));
            }
            return Err(EngineError::Fatal(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        parse_wav(&output.stdout)
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            name: self.program.clone(),
            version: self.version.clone(),
            native_sample_rate: 22050,
        }
    }
}

/// Decode a WAV byte buffer into mono f32 samples.
fn parse_wav(bytes: &[u8]) -> Result<TtsAudio, EngineError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| EngineError::Fatal(format!("backend produced unreadable WAV: {e}")))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let samples: Result<Vec<i16>, _> = reader.into_samples::<i16>().collect();
    let samples = samples
        .map_err(|e| EngineError::Fatal(format!("backend produced corrupt samples: {e}")))?;
    // Downmix to mono by taking the first channel.
    let mono: Vec<f32> = samples
        .chunks(channels)
        .map(|frame| frame[0] as f32 / 32768.0)
        .collect();
    Ok(TtsAudio {
        samples: mono,
        sample_rate: spec.sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn parses_mono_wav() {
        let bytes = wav_bytes(&[0, 16384, -16384], 22050, 1);
        let audio = parse_wav(&bytes).unwrap();
        assert_eq!(audio.sample_rate, 22050);
        assert_eq!(audio.samples.len(), 3);
        assert!((audio.samples[1] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn downmixes_stereo_to_first_channel() {
        let bytes = wav_bytes(&[100, -100, 200, -200], 48000, 2);
        let audio = parse_wav(&bytes).unwrap();
        assert_eq!(audio.samples.len(), 2);
        assert!(audio.samples[0] > 0.0 && audio.samples[1] > 0.0);
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert!(matches!(
            parse_wav(b"not a wav"),
            Err(EngineError::Fatal(_))
        ));
    }
}
