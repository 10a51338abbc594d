//! aureader - book-to-audiobook CLI
//!
//! A single binary providing:
//! - `convert` - narrate a document into an audiobook (resumes automatically)
//! - `chapters` - preview the narrative/non-narrative classification
//! - `engines` - report which TTS backend is available
//!
//! Usage:
//!   aureader convert book.txt --format m4b --voice en-us
//!   aureader chapters book.md
//!   aureader engines

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::info;

use aureader::{
    config::{init_tracing, load_dotenv, ChaptersArgs, Cli, Commands, ConvertArgs},
    document,
    normalize::{self, NormalizeOptions},
    CancelFlag, EspeakEngine, Pipeline, PipelineConfig, PipelineError, RunOutcome, TtsEngine,
};

#[tokio::main]
async fn main() -> ExitCode {
    load_dotenv();
    let cli = Cli::parse();
    match cli.command {
        Commands::Convert(args) => run_convert(args).await,
        Commands::Chapters(args) => run_chapters(args),
        Commands::Engines => run_engines(),
    }
}

async fn run_convert(args: ConvertArgs) -> ExitCode {
    init_tracing(&args.log);

    let config = match PipelineConfig::from_convert_args(&args) {
        Ok(config) => config,
        Err(e) => return report_failure(&e),
    };

    let engine = match EspeakEngine::detect() {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let engine_info = engine.info();
    info!(
        backend = %engine_info.name,
        version = %engine_info.version,
        voice = %config.narrator_voice,
        format = %config.output_format,
        workers = config.parallel_workers,
        "starting conversion"
    );

    // Cooperative cancel: the in-flight chunk finishes, a checkpoint is
    // written, and the next identical run resumes.
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupt received - checkpointing before exit");
                cancel.cancel();
            }
        });
    }

    let bar = ProgressBar::hidden();
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} chunks ({eta})")
            .unwrap()
            .progress_chars("#>-"),
    );
    let progress_bar = bar.clone();

    let pipeline = Pipeline::new(config, Arc::new(engine))
        .with_cancel(cancel)
        .with_progress(move |done, total| {
            if progress_bar.length() != Some(total) {
                progress_bar.set_length(total);
                progress_bar.set_draw_target(ProgressDrawTarget::stderr());
            }
            progress_bar.set_position(done);
        });

    let outcome = pipeline.run(&args.input).await;
    bar.finish_and_clear();

    match outcome {
        Ok(RunOutcome::Completed(path)) => {
            println!("wrote {}", path.display());
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Cancelled { completed, total }) => {
            println!("cancelled at chunk {completed}/{total}; re-run the same command to resume");
            ExitCode::SUCCESS
        }
        Err(e) => report_failure(&e),
    }
}

/// One concise line per failure class; details live at debug log level.
fn report_failure(err: &PipelineError) -> ExitCode {
    match err {
        PipelineError::Input(msg) => eprintln!("error: {msg}"),
        PipelineError::TransientBackend(msg) => {
            eprintln!("error: the TTS backend kept failing: {msg}");
            eprintln!("progress is checkpointed; re-run the same command to resume");
        }
        PipelineError::FatalBackend(msg) => eprintln!("error: the TTS backend gave up: {msg}"),
        PipelineError::Storage(msg) => {
            eprintln!("error: {msg}");
            eprintln!("progress is checkpointed; re-run the same command to resume");
        }
        PipelineError::Corruption(msg) => {
            eprintln!("error: resume state was unusable and has been discarded: {msg}")
        }
        PipelineError::Cancelled => eprintln!("cancelled"),
    }
    ExitCode::FAILURE
}

fn run_chapters(args: ChaptersArgs) -> ExitCode {
    let doc = match document::parse(&args.input) {
        Ok(doc) => doc,
        Err(e) => return report_failure(&e),
    };
    let opts = NormalizeOptions {
        junk_threshold: args.junk_threshold,
        ..NormalizeOptions::default()
    };
    let verdicts = normalize::classify_chapters(&doc, &opts);

    for (chapter, verdict) in doc.chapters.iter().zip(&verdicts) {
        let mark = if verdict.narrative { "keep" } else { "skip" };
        let title = verdict.title.clone().unwrap_or_else(|| "(untitled)".into());
        println!("[{mark}] {:>4.2}  {title}", verdict.score);
        if let Some(paragraph) = chapter.paragraphs.first() {
            let preview: String = paragraph.chars().take(100).collect();
            println!("             {preview}");
        }
    }
    let kept = verdicts.iter().filter(|v| v.narrative).count();
    println!("\n{kept} of {} chapters would be narrated", verdicts.len());
    ExitCode::SUCCESS
}

fn run_engines() -> ExitCode {
    match EspeakEngine::detect() {
        Ok(engine) => {
            let info = engine.info();
            println!("{} ({})", info.name, info.version);
            println!("native sample rate: {} Hz", info.native_sample_rate);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
