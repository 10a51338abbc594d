//! Configuration and CLI for the aureader narration pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::error::PipelineError;
use crate::normalize::NormalizeOptions;

/// Command line arguments with subcommands.
#[derive(Parser, Debug, Clone)]
#[command(name = "aureader")]
#[command(about = "Convert books into narrated audiobooks")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Convert a book into an audiobook (resumes automatically)
    Convert(ConvertArgs),
    /// Preview which chapters the classifier would narrate
    Chapters(ChaptersArgs),
    /// Report which TTS backend is available
    Engines,
}

#[derive(Args, Debug, Clone)]
pub struct ConvertArgs {
    /// Input document (.txt, .md, .rst)
    pub input: PathBuf,

    /// Narrator voice id passed to the TTS backend
    #[arg(long, default_value = "en-us")]
    pub voice: String,

    /// Speed multiplier (0.5 - 2.0)
    #[arg(long, default_value_t = 1.0)]
    pub speed: f32,

    /// Output sample rate in Hz
    #[arg(long, default_value_t = 48000)]
    pub sample_rate: u32,

    /// Output container format
    #[arg(long, value_enum, default_value_t = OutputFormat::M4b)]
    pub format: OutputFormat,

    /// Destination directory for the final artifact
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Workspace root for the stream file and checkpoints
    #[arg(long)]
    pub workspace_dir: Option<PathBuf>,

    /// Route detected dialogue to character voices
    #[arg(long)]
    pub character_voices: bool,

    /// JSON file mapping character names to voice ids
    #[arg(long)]
    pub character_map: Option<PathBuf>,

    /// Soft chunk bound in characters
    #[arg(long, default_value_t = 400)]
    pub char_target: usize,

    /// Hard phoneme budget per synthesis call
    #[arg(long, default_value_t = 510)]
    pub phoneme_limit: usize,

    /// Chunks between checkpoints
    #[arg(long, default_value_t = 50)]
    pub checkpoint_interval: u64,

    /// Parallel synthesis workers
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Per-span synthesis deadline in seconds
    #[arg(long, default_value_t = 60)]
    pub span_timeout: u64,

    /// Non-narrative classifier threshold in [0, 1]
    #[arg(long, default_value_t = 0.5)]
    pub junk_threshold: f32,

    /// Keep front/back matter chapters instead of classifying them away
    #[arg(long)]
    pub keep_all_chapters: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    pub log: String,
}

#[derive(Args, Debug, Clone)]
pub struct ChaptersArgs {
    /// Input document (.txt, .md, .rst)
    pub input: PathBuf,

    /// Non-narrative classifier threshold in [0, 1]
    #[arg(long, default_value_t = 0.5)]
    pub junk_threshold: f32,
}

/// Final artifact container format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Mp3,
    Wav,
    M4a,
    M4b,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Wav => "wav",
            OutputFormat::M4a => "m4a",
            OutputFormat::M4b => "m4b",
        }
    }

    /// Whether finalization needs the external encoder.
    pub fn needs_ffmpeg(self) -> bool {
        !matches!(self, OutputFormat::Wav)
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// The full configuration record handed to the pipeline. No global state;
/// everything the core needs is in here.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub narrator_voice: String,
    pub speed: f32,
    pub sample_rate: u32,
    pub output_format: OutputFormat,
    pub character_voices: bool,
    pub character_map: BTreeMap<String, String>,
    pub char_target: usize,
    pub phoneme_hard_limit: usize,
    pub checkpoint_interval: u64,
    pub parallel_workers: usize,
    pub span_timeout_secs: u64,
    pub output_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub normalize: NormalizeOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            narrator_voice: "en-us".to_string(),
            speed: 1.0,
            sample_rate: 48000,
            output_format: OutputFormat::M4b,
            character_voices: false,
            character_map: BTreeMap::new(),
            char_target: 400,
            phoneme_hard_limit: 510,
            checkpoint_interval: 50,
            parallel_workers: 1,
            span_timeout_secs: 60,
            output_dir: PathBuf::from("."),
            workspace_dir: default_workspace_dir(),
            normalize: NormalizeOptions::default(),
        }
    }
}

impl PipelineConfig {
    /// Build the pipeline configuration from CLI arguments.
    pub fn from_convert_args(args: &ConvertArgs) -> Result<Self, PipelineError> {
        if !(0.5..=2.0).contains(&args.speed) {
            return Err(PipelineError::Input(format!(
                "speed {} is outside the supported range 0.5 - 2.0",
                args.speed
            )));
        }
        if args.checkpoint_interval == 0 {
            return Err(PipelineError::Input(
                "checkpoint interval must be at least 1".to_string(),
            ));
        }
        let character_map = load_character_map(args.character_map.as_deref())?;
        if args.character_voices && character_map.is_empty() {
            return Err(PipelineError::Input(
                "character voices are enabled but no --character-map was given".to_string(),
            ));
        }
        Ok(Self {
            narrator_voice: args.voice.clone(),
            speed: args.speed,
            sample_rate: args.sample_rate,
            output_format: args.format,
            character_voices: args.character_voices,
            character_map,
            char_target: args.char_target,
            phoneme_hard_limit: args.phoneme_limit,
            checkpoint_interval: args.checkpoint_interval,
            parallel_workers: args.workers.max(1),
            span_timeout_secs: args.span_timeout,
            output_dir: args.output_dir.clone(),
            workspace_dir: args
                .workspace_dir
                .clone()
                .unwrap_or_else(default_workspace_dir),
            normalize: NormalizeOptions {
                strip_metadata: true,
                junk_threshold: if args.keep_all_chapters {
                    // A threshold above the maximum score keeps everything.
                    1.1
                } else {
                    args.junk_threshold
                },
                ..NormalizeOptions::default()
            },
        })
    }
}

fn default_workspace_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("aureader")
        .join("sessions")
}

/// Load a `{name: voice_id}` JSON map.
fn load_character_map(path: Option<&Path>) -> Result<BTreeMap<String, String>, PipelineError> {
    let Some(path) = path else {
        return Ok(BTreeMap::new());
    };
    let raw = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::Input(format!("cannot read character map '{}': {e}", path.display()))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        PipelineError::Input(format!("invalid character map '{}': {e}", path.display()))
    })
}

/// Initialize tracing with the given log level.
pub fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Load environment variables from .env file.
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}
