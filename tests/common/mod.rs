//! Shared helpers for pipeline end-to-end tests.
//!
//! The pipeline is exercised with a deterministic in-process engine: every
//! synthesize call is a pure function of `(text, voice, speed)`, so two runs
//! with the same settings produce byte-identical stream files and artifacts.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use aureader::config::OutputFormat;
use aureader::{CancelFlag, EngineError, EngineInfo, PipelineConfig, TtsAudio, TtsEngine};

/// Deterministic pseudo-audio for a span: four samples per character,
/// amplitude stream seeded from the text, voice, and speed.
pub fn tone_for(text: &str, voice: &str, speed: f32, rate: u32) -> TtsAudio {
    let mut seed: u32 = 0x9E37_79B9;
    for b in text.bytes().chain(voice.bytes()) {
        seed = seed.wrapping_mul(31).wrapping_add(b as u32);
    }
    seed = seed.wrapping_add((speed * 1000.0) as u32);
    let len = text.chars().count().max(1) * 4;
    let mut samples = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        samples.push(((seed >> 16) as i32 - 32768) as f32 / 65536.0);
    }
    TtsAudio {
        samples,
        sample_rate: rate,
    }
}

fn tone_info(rate: u32) -> EngineInfo {
    EngineInfo {
        name: "tone-test".to_string(),
        version: "1".to_string(),
        native_sample_rate: rate,
    }
}

/// Always-succeeding deterministic engine.
pub struct ToneEngine {
    rate: u32,
    pub calls: AtomicUsize,
}

impl ToneEngine {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TtsEngine for ToneEngine {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
    ) -> Result<TtsAudio, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(tone_for(text, voice, speed, self.rate))
    }

    fn info(&self) -> EngineInfo {
        tone_info(self.rate)
    }
}

/// Succeeds for the first `after` calls, then fails fatally. Reports the
/// same identity as `ToneEngine` so a resume run fingerprints identically.
pub struct FailAfter {
    pub inner: ToneEngine,
    pub after: usize,
}

#[async_trait]
impl TtsEngine for FailAfter {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
    ) -> Result<TtsAudio, EngineError> {
        if self.inner.calls.load(Ordering::SeqCst) >= self.after {
            return Err(EngineError::Fatal("injected failure".to_string()));
        }
        self.inner.synthesize(text, voice, speed).await
    }

    fn info(&self) -> EngineInfo {
        self.inner.info()
    }
}

/// Raises the cancel flag after `after` successful calls; synthesis itself
/// keeps working so the in-flight chunk can complete and commit.
pub struct CancelAfter {
    pub inner: ToneEngine,
    pub flag: CancelFlag,
    pub after: usize,
}

#[async_trait]
impl TtsEngine for CancelAfter {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
    ) -> Result<TtsAudio, EngineError> {
        let audio = self.inner.synthesize(text, voice, speed).await?;
        if self.inner.calls.load(Ordering::SeqCst) >= self.after {
            self.flag.cancel();
        }
        Ok(audio)
    }

    fn info(&self) -> EngineInfo {
        self.inner.info()
    }
}

/// A wav-producing configuration with small chunks and a short checkpoint
/// interval, isolated into per-test workspace and output directories.
pub fn test_config(workspace: &Path, output: &Path) -> PipelineConfig {
    PipelineConfig {
        narrator_voice: "am_michael".to_string(),
        sample_rate: 48000,
        output_format: OutputFormat::Wav,
        char_target: 60,
        checkpoint_interval: 10,
        output_dir: output.to_path_buf(),
        workspace_dir: workspace.to_path_buf(),
        ..PipelineConfig::default()
    }
}

/// Write a plain-text book of `n` short sentences (one chapter).
pub fn write_sentences(path: &Path, n: usize) {
    let text: Vec<String> = (0..n)
        .map(|i| format!("Sentence number {i} is right here."))
        .collect();
    std::fs::write(path, text.join(" ")).unwrap();
}
