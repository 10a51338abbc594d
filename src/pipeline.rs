//! The orchestrator: owns the run state machine, the synthesis pool, the
//! checkpoint policy, and cancellation.
//!
//! Control flow is `parse → normalize → plan → (resume?) → synthesize →
//! encode`. Synthesis may run up to `parallel_workers` chunks concurrently;
//! completions are reordered by ordinal in a bounded buffer before the
//! serial stream writer, so audio bytes always land in strict ordinal
//! order. The bounded buffer doubles as backpressure: the pool stops
//! dispatching while the writer is behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::checkpoint::{self, ChapterMarker, Checkpoint, CheckpointStore};
use crate::chunker::{self, ChunkerOptions};
use crate::config::PipelineConfig;
use crate::document;
use crate::encode::{self, BookMeta};
use crate::engine::TtsEngine;
use crate::error::PipelineError;
use crate::normalize;
use crate::router;
use crate::stream::StreamWriter;
use crate::synth::{self, SynthesisOptions};

/// Cooperative cancellation signal, checked between chunks.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a run ended (failures are `Err(PipelineError)`).
#[derive(Debug)]
pub enum RunOutcome {
    /// The final artifact was written here; the workspace is gone.
    Completed(PathBuf),
    /// Cancelled cooperatively after a clean checkpoint; the workspace is
    /// retained and an identical re-run resumes.
    Cancelled { completed: u64, total: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Init,
    Normalizing,
    Planning,
    Resuming,
    Synthesizing,
    Encoding,
    Done,
    Failed,
    Cancelled,
}

fn transition(state: &mut State, next: State) {
    debug!(from = ?*state, to = ?next, "pipeline state");
    *state = next;
}

type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// One narration run over one document.
pub struct Pipeline {
    config: PipelineConfig,
    engine: Arc<dyn TtsEngine>,
    cancel: CancelFlag,
    progress: Option<Arc<ProgressFn>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, engine: Arc<dyn TtsEngine>) -> Self {
        Self {
            config,
            engine,
            cancel: CancelFlag::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    fn report_progress(&self, done: u64, total: u64) {
        if let Some(progress) = &self.progress {
            (progress.as_ref())(done, total);
        }
    }

    /// Drive a document all the way to the final artifact.
    pub async fn run(&self, input: &Path) -> Result<RunOutcome, PipelineError> {
        let mut state = State::Init;

        transition(&mut state, State::Normalizing);
        let doc = document::parse(input)?;
        let doc = normalize::normalize(&doc, &self.config.normalize);
        info!(
            chapters = doc.chapters.len(),
            narrative = doc.narrative_chapters().count(),
            "document normalized"
        );

        transition(&mut state, State::Planning);
        let chunk_opts = ChunkerOptions {
            char_target: self.config.char_target,
            phoneme_hard_limit: self.config.phoneme_hard_limit,
        };
        let chunks = chunker::plan(&doc, &chunk_opts);
        if chunks.is_empty() {
            return Err(PipelineError::Input(
                "no narrative content to synthesize".to_string(),
            ));
        }
        let total = chunks.len() as u64;
        info!(chunks = total, "synthesis planned");

        let fingerprint =
            checkpoint::settings_fingerprint(input, &self.config, &self.engine.info())?;
        let session = session_dir(&self.config.workspace_dir, input);
        std::fs::create_dir_all(&session)?;

        let (mut store, existing) = match CheckpointStore::open(&session) {
            Ok(pair) => pair,
            Err(PipelineError::Corruption(msg)) => {
                warn!(error = %msg, "resume state did not validate; discarding workspace");
                reset_session(&session)?;
                CheckpointStore::open(&session)?
            }
            Err(e) => return Err(e),
        };
        let resume = match existing {
            Some(ck) if ck.fingerprint == fingerprint => Some(ck),
            Some(_) => {
                info!("settings changed since the last run; starting fresh");
                reset_session(&session)?;
                let (fresh, _) = CheckpointStore::open(&session)?;
                store = fresh;
                None
            }
            None => None,
        };

        let stream_path = session.join("stream.pcm");
        if resume.is_none() && stream_path.exists() {
            // Stream with no usable checkpoint: nothing in it is durable.
            std::fs::remove_file(&stream_path)?;
        }
        let mut writer = StreamWriter::open(&stream_path, self.config.sample_rate)?;

        let (start_ordinal, mut markers, start_offset) = match &resume {
            Some(ck) => {
                transition(&mut state, State::Resuming);
                info!(
                    resumed_chunks = ck.last_completed_ordinal + 1,
                    offset = ck.stream_offset,
                    "resuming from checkpoint"
                );
                writer.truncate_to(ck.stream_offset)?;
                (
                    ck.last_completed_ordinal + 1,
                    ck.markers.clone(),
                    ck.stream_offset,
                )
            }
            None => (0, Vec::new(), 0),
        };

        transition(&mut state, State::Synthesizing);
        let chapter_titles: BTreeMap<usize, String> = doc
            .chapters
            .iter()
            .map(|c| (c.ordinal, c.title.clone().unwrap_or_default()))
            .collect();
        let synth_opts = SynthesisOptions {
            sample_rate: self.config.sample_rate,
            speed: self.config.speed,
            span_timeout: Duration::from_secs(self.config.span_timeout_secs),
            phoneme_hard_limit: self.config.phoneme_hard_limit,
        };
        let workers = self.config.parallel_workers.max(1);
        let reorder_cap = workers * 2;

        let mut pending: FuturesUnordered<BoxFuture<'static, (u64, Result<Vec<i16>, PipelineError>)>> =
            FuturesUnordered::new();
        let mut ready: BTreeMap<u64, Vec<i16>> = BTreeMap::new();
        let mut next_dispatch = start_ordinal as usize;
        let mut next_commit = start_ordinal;
        let mut offset = start_offset;
        let mut since_checkpoint = 0u64;
        let mut failure: Option<PipelineError> = None;

        self.report_progress(next_commit, total);

        while failure.is_none() {
            while failure.is_none()
                && !self.cancel.is_cancelled()
                && next_dispatch < chunks.len()
                && pending.len() < workers
                && pending.len() + ready.len() < reorder_cap
            {
                let chunk = chunks[next_dispatch].clone();
                let spans = router::route_chunk(
                    &chunk.text,
                    &self.config.narrator_voice,
                    &self.config.character_map,
                    self.config.character_voices,
                );
                let engine = Arc::clone(&self.engine);
                let opts = synth_opts.clone();
                debug!(
                    ordinal = chunk.ordinal,
                    spans = spans.len(),
                    chars = chunk.text.chars().count(),
                    "dispatching chunk"
                );
                pending.push(
                    async move {
                        let result =
                            synth::synthesize_chunk(engine.as_ref(), &chunk, &spans, &opts).await;
                        (chunk.ordinal, result)
                    }
                    .boxed(),
                );
                next_dispatch += 1;
            }

            let Some((ordinal, result)) = pending.next().await else {
                break;
            };
            match result {
                Ok(samples) => {
                    ready.insert(ordinal, samples);
                }
                Err(e) => {
                    warn!(ordinal, error = %e, "chunk synthesis failed");
                    failure = Some(e);
                    continue;
                }
            }

            // Commit the contiguous prefix in strict ordinal order.
            while let Some(samples) = ready.remove(&next_commit) {
                let chunk = &chunks[next_commit as usize];
                if chunk.is_chapter_start {
                    markers.push(ChapterMarker {
                        chapter_ordinal: chunk.chapter_ordinal as u64,
                        title: chapter_titles
                            .get(&chunk.chapter_ordinal)
                            .cloned()
                            .unwrap_or_default(),
                        offset,
                    });
                }
                match writer.append(&samples) {
                    Ok(new_offset) => offset = new_offset,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
                next_commit += 1;
                since_checkpoint += 1;
                self.report_progress(next_commit, total);
                if since_checkpoint >= self.config.checkpoint_interval {
                    let ck = Checkpoint {
                        fingerprint: fingerprint.clone(),
                        last_completed_ordinal: next_commit - 1,
                        stream_offset: offset,
                        markers: markers.clone(),
                    };
                    if let Err(e) = store.write(&ck) {
                        failure = Some(e);
                        break;
                    }
                    since_checkpoint = 0;
                }
            }
        }

        if let Some(err) = failure {
            // The last durable checkpoint and the stream stay on disk; a
            // re-run truncates the tail and picks up from there.
            transition(&mut state, State::Failed);
            return Err(err);
        }

        // Unconditional checkpoint on cancellation and before finalizing.
        if next_commit > 0 {
            let ck = Checkpoint {
                fingerprint: fingerprint.clone(),
                last_completed_ordinal: next_commit - 1,
                stream_offset: offset,
                markers: markers.clone(),
            };
            store.write(&ck)?;
        }

        if self.cancel.is_cancelled() && next_commit < total {
            transition(&mut state, State::Cancelled);
            info!(completed = next_commit, total, "run cancelled");
            return Ok(RunOutcome::Cancelled {
                completed: next_commit,
                total,
            });
        }

        transition(&mut state, State::Encoding);
        if writer.payload_len() > offset {
            writer.truncate_to(offset)?;
        }
        drop(writer);

        std::fs::create_dir_all(&self.config.output_dir)?;
        let dest = self
            .config
            .output_dir
            .join(artifact_name(input, &self.config));
        let meta = BookMeta {
            title: doc.title.clone(),
            author: doc.author.clone(),
            narrator: Some(self.config.narrator_voice.clone()),
        };
        encode::encode(
            &stream_path,
            self.config.output_format,
            self.config.sample_rate,
            &markers,
            &meta,
            &dest,
        )
        .await?;

        std::fs::remove_dir_all(&session)?;
        transition(&mut state, State::Done);
        info!(dest = %dest.display(), chunks = total, "narration complete");
        Ok(RunOutcome::Completed(dest))
    }
}

/// The per-input session directory. Derived from the input identity alone,
/// so an identical re-run finds its workspace and a settings change is
/// detected inside it via the fingerprint.
pub fn session_dir(workspace: &Path, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "book".to_string());
    let safe: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .take(40)
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(input.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    workspace.join(format!(
        "{safe}-{:02x}{:02x}{:02x}{:02x}",
        digest[0], digest[1], digest[2], digest[3]
    ))
}

fn artifact_name(input: &Path, config: &PipelineConfig) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "audiobook".to_string());
    format!("{stem}.{}", config.output_format.extension())
}

fn reset_session(session: &Path) -> Result<(), PipelineError> {
    std::fs::remove_dir_all(session)?;
    std::fs::create_dir_all(session)?;
    Ok(())
}
