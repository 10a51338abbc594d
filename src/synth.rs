//! Synthesis worker: turn a chunk's spans into one PCM buffer.
//!
//! Each span goes through the backend with a deadline; transient failures
//! retry with exponential backoff. Output is mono `i16` at the configured
//! sample rate, with a short gap on voice changes and a longer one in front
//! of chapter-start chunks.

use std::time::Duration;

use tracing::warn;

use crate::chunker::{phoneme_estimate, Chunk};
use crate::engine::{EngineError, TtsAudio, TtsEngine};
use crate::error::PipelineError;
use crate::router::Span;

/// Silence inserted between spans when the voice changes.
const VOICE_CHANGE_GAP_MS: u64 = 30;
/// Silence prepended to the first chunk of a chapter (except the very first).
const CHAPTER_GAP_MS: u64 = 300;
/// Initial call plus this many retries for transient failures.
const MAX_RETRIES: usize = 3;
const RETRY_BACKOFF: [Duration; MAX_RETRIES] = [
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_millis(1600),
];

#[derive(Clone, Debug)]
pub struct SynthesisOptions {
    pub sample_rate: u32,
    pub speed: f32,
    /// Per-span synthesis deadline; exceeding it counts as transient.
    pub span_timeout: Duration,
    /// Chunker invariant re-checked here; violations are fatal.
    pub phoneme_hard_limit: usize,
}

/// Synthesize all spans of a chunk into a single PCM buffer.
pub async fn synthesize_chunk(
    engine: &dyn TtsEngine,
    chunk: &Chunk,
    spans: &[Span],
    opts: &SynthesisOptions,
) -> Result<Vec<i16>, PipelineError> {
    if phoneme_estimate(&chunk.text) > opts.phoneme_hard_limit {
        return Err(PipelineError::FatalBackend(format!(
            "chunk {} exceeds the backend phoneme budget",
            chunk.ordinal
        )));
    }

    let mut pcm: Vec<i16> = Vec::new();
    if chunk.is_chapter_start && chunk.ordinal > 0 {
        pcm.extend(silence(CHAPTER_GAP_MS, opts.sample_rate));
    }
    let mut previous_voice: Option<&str> = None;
    for span in spans {
        if previous_voice.is_some_and(|v| v != span.voice) {
            pcm.extend(silence(VOICE_CHANGE_GAP_MS, opts.sample_rate));
        }
        let audio = synthesize_span(engine, &span.text, &span.voice, opts).await?;
        let samples = if audio.sample_rate == opts.sample_rate {
            audio.samples
        } else {
            resample_linear(&audio.samples, audio.sample_rate, opts.sample_rate)
        };
        pcm.extend(pcm_i16(&samples));
        previous_voice = Some(&span.voice);
    }
    Ok(pcm)
}

async fn synthesize_span(
    engine: &dyn TtsEngine,
    text: &str,
    voice: &str,
    opts: &SynthesisOptions,
) -> Result<TtsAudio, PipelineError> {
    let mut attempt = 0usize;
    loop {
        let outcome =
            tokio::time::timeout(opts.span_timeout, engine.synthesize(text, voice, opts.speed))
                .await;
        let transient = match outcome {
            Ok(Ok(audio)) => return Ok(audio),
            Ok(Err(EngineError::Transient(msg))) => msg,
            Ok(Err(EngineError::InvalidInput(msg))) => {
                return Err(PipelineError::FatalBackend(msg))
            }
            Ok(Err(EngineError::Fatal(msg))) => return Err(PipelineError::FatalBackend(msg)),
            Err(_) => format!(
                "span synthesis exceeded the {}s deadline",
                opts.span_timeout.as_secs()
            ),
        };
        if attempt >= MAX_RETRIES {
            return Err(PipelineError::TransientBackend(transient));
        }
        warn!(attempt, error = %transient, "transient backend failure, retrying");
        tokio::time::sleep(RETRY_BACKOFF[attempt]).await;
        attempt += 1;
    }
}

/// Linear-interpolation resampling; adequate for speech content.
fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if samples.is_empty() || from == to {
        return samples.to_vec();
    }
    let ratio = from as f64 / to as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = (pos.floor() as usize).min(last);
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = samples[(idx + 1).min(last)];
        out.push(a + (b - a) * frac);
    }
    out
}

/// Map [-1.0, 1.0] to i16 with saturation.
fn pcm_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let v = (s.clamp(-1.0, 1.0) * 32768.0).round() as i32;
            v.clamp(i16::MIN as i32, i16::MAX as i32) as i16
        })
        .collect()
}

fn silence(ms: u64, sample_rate: u32) -> Vec<i16> {
    vec![0i16; (sample_rate as u64 * ms / 1000) as usize]
}
