//! Failure taxonomy for the narration pipeline.
//!
//! Every component boundary returns `Result<_, PipelineError>`. The
//! orchestrator is the only place that maps these into terminal run states;
//! workers retry transient backend failures locally and surface everything
//! else unchanged.

use thiserror::Error;

/// Errors that can abort a narration run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Unreadable or unparseable input, unknown voice, invalid configuration.
    /// Surfaced to the user without touching any checkpoint state.
    #[error("input error: {0}")]
    Input(String),

    /// The TTS backend kept failing transiently (timeouts, throttling) and
    /// the retry budget is exhausted.
    #[error("backend unavailable after retries: {0}")]
    TransientBackend(String),

    /// The TTS backend rejected the work outright (invalid voice, oversized
    /// chunk). The run aborts; checkpoint and stream are retained.
    #[error("backend failure: {0}")]
    FatalBackend(String),

    /// Write, fsync, or encoder failure. The last durable checkpoint remains
    /// valid and the run is resumable.
    #[error("storage error: {0}")]
    Storage(String),

    /// Resume state did not validate (bad CRC, version or fingerprint
    /// mismatch on both slots). The workspace is discarded.
    #[error("corrupt resume state: {0}")]
    Corruption(String),

    /// Cooperative cancellation was observed.
    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

impl PipelineError {
    /// True when a re-run with the same configuration can pick up from the
    /// last durable checkpoint.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientBackend(_) | PipelineError::Storage(_)
        )
    }
}
