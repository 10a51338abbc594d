//! Finalizer: turn the session stream into the destination artifact.
//!
//! WAV output is written directly; mp3/m4a/m4b go through FFmpeg, fed the
//! raw PCM payload past the stream header. M4B receives the chapter marker
//! table as FFMETADATA chapter atoms. The artifact is encoded under a
//! hidden partial name and renamed into place, so the destination is only
//! ever complete. Encoder failures are storage-class: the stream remains
//! resumable and a re-run skips straight to encoding.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tracing::{debug, info};

use crate::checkpoint::ChapterMarker;
use crate::config::OutputFormat;
use crate::error::PipelineError;
use crate::stream;

/// Metadata stamped on the artifact when known.
#[derive(Clone, Debug, Default)]
pub struct BookMeta {
    pub title: Option<String>,
    pub author: Option<String>,
    pub narrator: Option<String>,
}

/// Bytes per mono PCM frame.
const BYTES_PER_FRAME: u64 = 2;

/// Check that FFmpeg is runnable.
pub async fn ffmpeg_available() -> bool {
    tokio::process::Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Encode the stream into `dest` (atomically replaced on success).
pub async fn encode(
    stream_path: &Path,
    format: OutputFormat,
    sample_rate: u32,
    markers: &[ChapterMarker],
    meta: &BookMeta,
    dest: &Path,
) -> Result<(), PipelineError> {
    let partial = partial_path(dest)?;
    match format {
        OutputFormat::Wav => encode_wav(stream_path, sample_rate, &partial)?,
        _ => encode_ffmpeg(stream_path, format, sample_rate, markers, meta, &partial).await?,
    }
    std::fs::rename(&partial, dest)?;
    info!(dest = %dest.display(), "final artifact written");
    Ok(())
}

fn partial_path(dest: &Path) -> Result<PathBuf, PipelineError> {
    let name = dest
        .file_name()
        .ok_or_else(|| PipelineError::Storage(format!("bad destination '{}'", dest.display())))?;
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join(format!(".{}.partial", name.to_string_lossy())))
}

fn encode_wav(stream_path: &Path, sample_rate: u32, partial: &Path) -> Result<(), PipelineError> {
    let (rate, samples) = stream::read_payload(stream_path)?;
    if rate != sample_rate {
        return Err(PipelineError::Corruption(format!(
            "stream rate {rate} does not match configured rate {sample_rate}"
        )));
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(partial, spec)
        .map_err(|e| PipelineError::Storage(format!("cannot create wav: {e}")))?;
    for sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| PipelineError::Storage(format!("wav write failed: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| PipelineError::Storage(format!("wav finalize failed: {e}")))?;
    Ok(())
}

async fn encode_ffmpeg(
    stream_path: &Path,
    format: OutputFormat,
    sample_rate: u32,
    markers: &[ChapterMarker],
    meta: &BookMeta,
    partial: &Path,
) -> Result<(), PipelineError> {
    if !ffmpeg_available().await {
        return Err(PipelineError::Storage(
            "ffmpeg not found; install it or use --format wav".to_string(),
        ));
    }

    let payload_len = std::fs::metadata(stream_path)?
        .len()
        .saturating_sub(stream::STREAM_HEADER_LEN);

    let mut command = tokio::process::Command::new("ffmpeg");
    command
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-y")
        .arg("-f")
        .arg("s16le")
        .arg("-ar")
        .arg(sample_rate.to_string())
        .arg("-ac")
        .arg("1")
        .arg("-skip_initial_bytes")
        .arg(stream::STREAM_HEADER_LEN.to_string())
        .arg("-i")
        .arg(stream_path);

    // Chapter atoms ride in as a second metadata-only input.
    let ffmeta_path = stream_path.with_extension("ffmeta");
    let with_chapters = format == OutputFormat::M4b && !markers.is_empty();
    if with_chapters {
        let rendered = chapter_metadata(markers, payload_len, sample_rate);
        std::fs::write(&ffmeta_path, rendered)?;
        command
            .arg("-f")
            .arg("ffmetadata")
            .arg("-i")
            .arg(&ffmeta_path)
            .arg("-map_metadata")
            .arg("1");
    }

    match format {
        OutputFormat::Mp3 => {
            command
                .arg("-codec:a")
                .arg("libmp3lame")
                .arg("-q:a")
                .arg("2")
                .arg("-f")
                .arg("mp3");
        }
        OutputFormat::M4a | OutputFormat::M4b => {
            command
                .arg("-codec:a")
                .arg("aac")
                .arg("-b:a")
                .arg("128k")
                .arg("-movflags")
                .arg("+faststart")
                .arg("-f")
                .arg("ipod");
        }
        OutputFormat::Wav => {
            return Err(PipelineError::Storage(
                "wav output does not use the external encoder".to_string(),
            ))
        }
    }

    if let Some(title) = &meta.title {
        command.arg("-metadata").arg(format!("title={title}"));
    }
    if let Some(author) = &meta.author {
        command.arg("-metadata").arg(format!("artist={author}"));
    }
    if let Some(narrator) = &meta.narrator {
        command.arg("-metadata").arg(format!("composer={narrator}"));
    }
    command.arg("-metadata").arg("genre=Audiobook");
    command.arg(partial);

    debug!(format = %format, "invoking ffmpeg");
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PipelineError::Storage(format!("failed to run ffmpeg: {e}")))?;

    if with_chapters {
        let _ = std::fs::remove_file(&ffmeta_path);
    }

    if !output.status.success() {
        return Err(PipelineError::Storage(format!(
            "ffmpeg failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Render the marker table as an FFMETADATA chapter list. Offsets convert to
/// milliseconds via `offset / (sample_rate * bytes_per_frame)`.
fn chapter_metadata(markers: &[ChapterMarker], payload_len: u64, sample_rate: u32) -> String {
    let to_ms = |offset: u64| offset * 1000 / (sample_rate as u64 * BYTES_PER_FRAME);
    let mut out = String::from(";FFMETADATA1\n");
    for (i, marker) in markers.iter().enumerate() {
        let start = to_ms(marker.offset);
        let end = markers
            .get(i + 1)
            .map(|next| to_ms(next.offset))
            .unwrap_or_else(|| to_ms(payload_len));
        let title = if marker.title.is_empty() {
            format!("Chapter {}", i + 1)
        } else {
            marker.title.clone()
        };
        out.push_str("[CHAPTER]\nTIMEBASE=1/1000\n");
        out.push_str(&format!("START={start}\n"));
        out.push_str(&format!("END={end}\n"));
        out.push_str(&format!("title={}\n", escape_ffmetadata(&title)));
    }
    out
}

/// FFMETADATA requires `=`, `;`, `#`, `\` and newlines to be escaped.
fn escape_ffmetadata(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '=' | ';' | '#' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\\n"),
            _ => out.push(c),
        }
    }
    out
}
