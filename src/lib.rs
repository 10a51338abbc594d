pub mod checkpoint;
pub mod chunker;
pub mod config;
pub mod document;
pub mod encode;
pub mod engine;
pub mod error;
pub mod normalize;
pub mod pipeline;
pub mod router;
pub mod stream;
pub mod synth;

pub use config::{OutputFormat, PipelineConfig};
pub use document::{Chapter, Document, SourceTag};
pub use engine::{EngineError, EngineInfo, EspeakEngine, TtsAudio, TtsEngine};
pub use error::PipelineError;
pub use pipeline::{CancelFlag, Pipeline, RunOutcome};
