//! Durable resume state: settings fingerprint and the checkpoint log.
//!
//! The checkpoint is a small fixed-layout binary record written with the
//! double-slot discipline: serialize to `checkpoint.next`, fsync, rename
//! over the inactive of `checkpoint.a`/`checkpoint.b`, fsync the directory.
//! Reads validate both slots and prefer the one that has completed more
//! work. A fingerprint mismatch makes a slot stale (restart fresh); slots
//! that exist but fail validation are corruption.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::engine::EngineInfo;
use crate::error::PipelineError;

pub const CHECKPOINT_MAGIC: &[u8; 8] = b"AURCKPT\0";
pub const CHECKPOINT_VERSION: u32 = 1;

const SLOT_A: &str = "checkpoint.a";
const SLOT_B: &str = "checkpoint.b";
const SLOT_NEXT: &str = "checkpoint.next";
/// Debug mirror of the marker table.
const MARKER_MIRROR: &str = "chapters.tmp";

/// `(chapter_ordinal, title, stream_byte_offset_at_start)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChapterMarker {
    pub chapter_ordinal: u64,
    pub title: String,
    pub offset: u64,
}

/// Everything needed to resume exactly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub fingerprint: Vec<u8>,
    pub last_completed_ordinal: u64,
    pub stream_offset: u64,
    pub markers: Vec<ChapterMarker>,
}

impl Checkpoint {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.markers.len() * 48);
        out.extend_from_slice(CHECKPOINT_MAGIC);
        out.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.fingerprint.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.fingerprint);
        out.extend_from_slice(&self.last_completed_ordinal.to_le_bytes());
        out.extend_from_slice(&self.stream_offset.to_le_bytes());
        out.extend_from_slice(&(self.markers.len() as u32).to_le_bytes());
        for marker in &self.markers {
            out.extend_from_slice(&marker.chapter_ordinal.to_le_bytes());
            let title = marker.title.as_bytes();
            out.extend_from_slice(&(title.len() as u32).to_le_bytes());
            out.extend_from_slice(title);
            out.extend_from_slice(&marker.offset.to_le_bytes());
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Checkpoint, PipelineError> {
        if bytes.len() < 4 {
            return Err(corrupt("record too short"));
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if hasher.finalize() != expected {
            return Err(corrupt("crc mismatch"));
        }

        let mut cursor = Cursor::new(body);
        if cursor.take(8)? != CHECKPOINT_MAGIC.as_slice() {
            return Err(corrupt("bad magic"));
        }
        let version = cursor.u32()?;
        if version != CHECKPOINT_VERSION {
            return Err(corrupt(&format!("unsupported version {version}")));
        }
        let fp_len = cursor.u32()? as usize;
        let fingerprint = cursor.take(fp_len)?.to_vec();
        let last_completed_ordinal = cursor.u64()?;
        let stream_offset = cursor.u64()?;
        let n_markers = cursor.u32()? as usize;
        let mut markers = Vec::with_capacity(n_markers.min(4096));
        for _ in 0..n_markers {
            let chapter_ordinal = cursor.u64()?;
            let title_len = cursor.u32()? as usize;
            let title = String::from_utf8(cursor.take(title_len)?.to_vec())
                .map_err(|_| corrupt("marker title is not utf-8"))?;
            let offset = cursor.u64()?;
            markers.push(ChapterMarker {
                chapter_ordinal,
                title,
                offset,
            });
        }
        Ok(Checkpoint {
            fingerprint,
            last_completed_ordinal,
            stream_offset,
            markers,
        })
    }
}

fn corrupt(msg: &str) -> PipelineError {
    PipelineError::Corruption(format!("checkpoint: {msg}"))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PipelineError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| corrupt("record truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, PipelineError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, PipelineError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

enum SlotState {
    Missing,
    Valid(Checkpoint),
    Invalid,
}

/// Writer over the two alternating checkpoint slots.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    write_to_a: bool,
}

impl CheckpointStore {
    /// Open the store and read the best existing checkpoint, if any.
    ///
    /// Returns `Corruption` when slot files exist but none validates.
    pub fn open(dir: &Path) -> Result<(Self, Option<Checkpoint>), PipelineError> {
        let a = read_slot(&dir.join(SLOT_A));
        let b = read_slot(&dir.join(SLOT_B));
        let best = match (a, b) {
            (SlotState::Missing, SlotState::Missing) => None,
            (SlotState::Valid(a), SlotState::Valid(b)) => {
                if b.last_completed_ordinal > a.last_completed_ordinal {
                    Some((b, true))
                } else {
                    Some((a, false))
                }
            }
            (SlotState::Valid(a), _) => Some((a, false)),
            (_, SlotState::Valid(b)) => Some((b, true)),
            _ => {
                return Err(corrupt("no slot validates"));
            }
        };
        match best {
            Some((checkpoint, from_b)) => Ok((
                Self {
                    dir: dir.to_path_buf(),
                    // Overwrite the slot we did not load from.
                    write_to_a: from_b,
                },
                Some(checkpoint),
            )),
            None => Ok((
                Self {
                    dir: dir.to_path_buf(),
                    write_to_a: true,
                },
                None,
            )),
        }
    }

    /// Durably persist a checkpoint into the inactive slot.
    pub fn write(&mut self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        let next = self.dir.join(SLOT_NEXT);
        {
            let mut file = File::create(&next)?;
            file.write_all(&checkpoint.encode())?;
            file.sync_all()?;
        }
        let target = self
            .dir
            .join(if self.write_to_a { SLOT_A } else { SLOT_B });
        fs::rename(&next, &target)?;
        File::open(&self.dir)?.sync_all()?;
        self.write_to_a = !self.write_to_a;
        debug!(
            ordinal = checkpoint.last_completed_ordinal,
            offset = checkpoint.stream_offset,
            slot = %target.display(),
            "checkpoint written"
        );
        self.write_marker_mirror(&checkpoint.markers);
        Ok(())
    }

    /// Best-effort JSON mirror of the marker table for debugging.
    fn write_marker_mirror(&self, markers: &[ChapterMarker]) {
        let path = self.dir.join(MARKER_MIRROR);
        match serde_json::to_vec_pretty(markers) {
            Ok(json) => {
                if let Err(e) = fs::write(&path, json) {
                    warn!(error = %e, "could not write marker mirror");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize marker mirror"),
        }
    }
}

fn read_slot(path: &Path) -> SlotState {
    if !path.exists() {
        return SlotState::Missing;
    }
    match fs::read(path) {
        Ok(bytes) => match Checkpoint::decode(&bytes) {
            Ok(checkpoint) => SlotState::Valid(checkpoint),
            Err(_) => SlotState::Invalid,
        },
        Err(_) => SlotState::Invalid,
    }
}

/// Stable hash over everything that changes the produced audio. Any
/// difference invalidates resume.
pub fn settings_fingerprint(
    input: &Path,
    config: &PipelineConfig,
    engine: &EngineInfo,
) -> Result<Vec<u8>, PipelineError> {
    let meta = fs::metadata(input)
        .map_err(|e| PipelineError::Input(format!("cannot stat '{}': {e}", input.display())))?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    let mut field = |bytes: &[u8]| {
        hasher.update(bytes);
        hasher.update([0u8]);
    };
    field(input.to_string_lossy().as_bytes());
    field(&meta.len().to_le_bytes());
    field(&mtime.as_secs().to_le_bytes());
    field(&mtime.subsec_nanos().to_le_bytes());

    field(&[config.normalize.strip_metadata as u8]);
    field(&config.normalize.junk_threshold.to_bits().to_le_bytes());
    field(&config.normalize.edge_fraction.to_bits().to_le_bytes());

    field(&(config.char_target as u64).to_le_bytes());
    field(&(config.phoneme_hard_limit as u64).to_le_bytes());

    field(config.narrator_voice.as_bytes());
    field(&config.speed.to_bits().to_le_bytes());
    field(&config.sample_rate.to_le_bytes());
    field(&[config.character_voices as u8]);
    // BTreeMap iteration is already sorted, keeping the hash stable.
    for (name, voice) in &config.character_map {
        field(name.as_bytes());
        field(voice.as_bytes());
    }
    field(config.output_format.extension().as_bytes());

    field(engine.name.as_bytes());
    field(engine.version.as_bytes());
    Ok(hasher.finalize().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use tempfile::tempdir;

    fn sample_checkpoint(ordinal: u64) -> Checkpoint {
        Checkpoint {
            fingerprint: vec![0xAB; 32],
            last_completed_ordinal: ordinal,
            stream_offset: ordinal * 1000,
            markers: vec![
                ChapterMarker {
                    chapter_ordinal: 0,
                    title: String::new(),
                    offset: 0,
                },
                ChapterMarker {
                    chapter_ordinal: 1,
                    title: "Chapter 2".into(),
                    offset: 4800,
                },
            ],
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let checkpoint = sample_checkpoint(42);
        let decoded = Checkpoint::decode(&checkpoint.encode()).unwrap();
        assert_eq!(decoded, checkpoint);
    }

    #[test]
    fn decode_rejects_flipped_bits() {
        let mut bytes = sample_checkpoint(7).encode();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(matches!(
            Checkpoint::decode(&bytes),
            Err(PipelineError::Corruption(_))
        ));
    }

    #[test]
    fn decode_rejects_truncation() {
        let bytes = sample_checkpoint(7).encode();
        assert!(Checkpoint::decode(&bytes[..bytes.len() - 6]).is_err());
        assert!(Checkpoint::decode(&[]).is_err());
    }

    #[test]
    fn store_alternates_slots_and_prefers_newer() {
        let dir = tempdir().unwrap();
        let (mut store, existing) = CheckpointStore::open(dir.path()).unwrap();
        assert!(existing.is_none());

        store.write(&sample_checkpoint(10)).unwrap();
        store.write(&sample_checkpoint(20)).unwrap();
        assert!(dir.path().join("checkpoint.a").exists());
        assert!(dir.path().join("checkpoint.b").exists());
        assert!(dir.path().join("chapters.tmp").exists());

        let (_, loaded) = CheckpointStore::open(dir.path()).unwrap();
        assert_eq!(loaded.unwrap().last_completed_ordinal, 20);
    }

    #[test]
    fn one_corrupt_slot_falls_back_to_the_other() {
        let dir = tempdir().unwrap();
        let (mut store, _) = CheckpointStore::open(dir.path()).unwrap();
        store.write(&sample_checkpoint(10)).unwrap();
        store.write(&sample_checkpoint(20)).unwrap();
        // Clobber the newer slot (b holds ordinal 20 after two writes).
        std::fs::write(dir.path().join("checkpoint.b"), b"garbage").unwrap();

        let (_, loaded) = CheckpointStore::open(dir.path()).unwrap();
        assert_eq!(loaded.unwrap().last_completed_ordinal, 10);
    }

    #[test]
    fn all_slots_corrupt_is_a_corruption_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("checkpoint.a"), b"junk").unwrap();
        let err = CheckpointStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::Corruption(_)));
    }

    #[test]
    fn fingerprint_is_sensitive_to_settings() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("book.txt");
        std::fs::write(&input, "Hello world.").unwrap();

        let engine = EngineInfo {
            name: "test".into(),
            version: "1".into(),
            native_sample_rate: 48000,
        };
        let config = PipelineConfig::default();
        let base = settings_fingerprint(&input, &config, &engine).unwrap();

        let mut faster = config.clone();
        faster.speed = 1.2;
        assert_ne!(base, settings_fingerprint(&input, &faster, &engine).unwrap());

        let mut other_voice = config.clone();
        other_voice.narrator_voice = "bf_emma".into();
        assert_ne!(
            base,
            settings_fingerprint(&input, &other_voice, &engine).unwrap()
        );

        let mut other_engine = engine.clone();
        other_engine.version = "2".into();
        assert_ne!(
            base,
            settings_fingerprint(&input, &config, &other_engine).unwrap()
        );

        // Unchanged settings hash identically.
        assert_eq!(base, settings_fingerprint(&input, &config, &engine).unwrap());
    }

    #[test]
    fn fingerprint_tracks_input_identity() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("book.txt");
        std::fs::write(&input, "Hello world.").unwrap();
        let engine = EngineInfo {
            name: "test".into(),
            version: "1".into(),
            native_sample_rate: 48000,
        };
        let config = PipelineConfig::default();
        let before = settings_fingerprint(&input, &config, &engine).unwrap();
        std::fs::write(&input, "Hello world, changed.").unwrap();
        let after = settings_fingerprint(&input, &config, &engine).unwrap();
        assert_ne!(before, after);
    }
}
