//! Normalized document model and parser dispatch.
//!
//! Parsers return a `Document` (chapters of raw paragraphs); everything
//! downstream is format-agnostic. Format-specific extraction for container
//! formats such as EPUB and PDF lives in host-supplied collaborators — this
//! module carries the dispatch seam plus the two text-based parsers the
//! binary ships with.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::PipelineError;

/// Structural metadata a container-aware parser can attach to a chapter.
/// Feeds the classifier's structural signal; text parsers leave it unset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceTag {
    Toc,
    Copyright,
    Colophon,
    Index,
    Bibliography,
    BodyMatter,
}

impl SourceTag {
    /// Whether the container already marked this chapter as non-narrative.
    pub fn is_junk(self) -> bool {
        !matches!(self, SourceTag::BodyMatter)
    }
}

/// One chapter of the source document.
///
/// Paragraph strings may still contain soft line breaks from the source;
/// the normalizer owns whitespace repair. `narrative` defaults to true and
/// is rewritten by the classifier.
#[derive(Clone, Debug)]
pub struct Chapter {
    pub ordinal: usize,
    pub title: Option<String>,
    pub paragraphs: Vec<String>,
    pub source_tag: Option<SourceTag>,
    pub narrative: bool,
}

impl Chapter {
    pub fn new(ordinal: usize, title: Option<String>) -> Self {
        Self {
            ordinal,
            title,
            paragraphs: Vec::new(),
            source_tag: None,
            narrative: true,
        }
    }

    /// Total character count across paragraphs.
    pub fn char_len(&self) -> usize {
        self.paragraphs.iter().map(|p| p.chars().count()).sum()
    }
}

/// The in-memory document handed to the pipeline.
#[derive(Clone, Debug, Default)]
pub struct Document {
    pub title: Option<String>,
    pub author: Option<String>,
    pub chapters: Vec<Chapter>,
}

impl Document {
    /// Chapters that survived classification.
    pub fn narrative_chapters(&self) -> impl Iterator<Item = &Chapter> {
        self.chapters.iter().filter(|c| c.narrative)
    }
}

/// Supported input parsers, selected by file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParserKind {
    PlainText,
    Markdown,
}

impl ParserKind {
    pub fn for_path(path: &Path) -> Result<ParserKind, PipelineError> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "txt" | "text" => Ok(ParserKind::PlainText),
            "md" | "markdown" | "rst" => Ok(ParserKind::Markdown),
            "epub" | "pdf" => Err(PipelineError::Input(format!(
                "'{}' requires a container-aware parser; extract it to text or markdown first",
                path.display()
            ))),
            other => Err(PipelineError::Input(format!(
                "unsupported input extension '{other}' for '{}'",
                path.display()
            ))),
        }
    }

    pub fn parse(self, path: &Path) -> Result<Document, PipelineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Input(format!("cannot read '{}': {e}", path.display())))?;
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().replace(['_', '-'], " "));
        let doc = match self {
            ParserKind::PlainText => parse_plain_text(&raw, title),
            ParserKind::Markdown => parse_markdown(&raw, title),
        };
        if doc.chapters.iter().all(|c| c.paragraphs.is_empty()) {
            return Err(PipelineError::Input(format!(
                "'{}' contains no narratable text",
                path.display()
            )));
        }
        Ok(doc)
    }
}

/// Parse an input file, dispatching on its extension.
pub fn parse(path: &Path) -> Result<Document, PipelineError> {
    ParserKind::for_path(path)?.parse(path)
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(chapter|part|book|prologue|epilogue|appendix)\b[^\n]{0,60}$").unwrap()
    })
}

/// An all-caps short line reads as a heading in plain text sources. Lines
/// with digits (ISBNs, catalog numbers) do not qualify.
fn looks_like_caps_heading(line: &str) -> bool {
    let trimmed = line.trim();
    let alpha = trimmed.chars().filter(|c| c.is_alphabetic()).count();
    alpha >= 3
        && trimmed.chars().count() <= 60
        && trimmed
            .chars()
            .all(|c| c.is_uppercase() || c.is_whitespace())
}

struct DocumentBuilder {
    chapters: Vec<Chapter>,
    current: Chapter,
    lines: Vec<String>,
    saw_heading: bool,
}

impl DocumentBuilder {
    fn new() -> Self {
        Self {
            chapters: Vec::new(),
            current: Chapter::new(0, None),
            lines: Vec::new(),
            saw_heading: false,
        }
    }

    fn flush_paragraph(&mut self) {
        if !self.lines.is_empty() {
            self.current.paragraphs.push(self.lines.join("\n"));
            self.lines.clear();
        }
    }

    fn start_chapter(&mut self, title: String) {
        self.flush_paragraph();
        if !self.current.paragraphs.is_empty() || self.current.title.is_some() {
            let ordinal = self.chapters.len();
            let mut done = std::mem::replace(&mut self.current, Chapter::new(0, None));
            done.ordinal = ordinal;
            self.chapters.push(done);
        }
        self.current.title = Some(title);
        self.saw_heading = true;
    }

    fn finish(mut self, title: Option<String>, author: Option<String>) -> Document {
        self.flush_paragraph();
        if !self.current.paragraphs.is_empty() || self.current.title.is_some() {
            let ordinal = self.chapters.len();
            self.current.ordinal = ordinal;
            self.chapters.push(self.current);
        }
        Document {
            title,
            author,
            chapters: self.chapters,
        }
    }
}

fn parse_plain_text(raw: &str, title: Option<String>) -> Document {
    let mut b = DocumentBuilder::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            b.flush_paragraph();
        } else if heading_re().is_match(trimmed) || looks_like_caps_heading(trimmed) {
            b.start_chapter(trimmed.to_string());
        } else {
            b.lines.push(trimmed.to_string());
        }
    }
    b.finish(title, None)
}

fn parse_markdown(raw: &str, title: Option<String>) -> Document {
    let mut b = DocumentBuilder::new();
    let mut in_fence = false;
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if trimmed.is_empty() {
            b.flush_paragraph();
        } else if let Some(rest) = strip_heading_marker(trimmed) {
            b.start_chapter(rest.to_string());
        } else {
            // Blockquote markers and emphasis wrappers are presentation, not prose.
            let cleaned = trimmed
                .trim_start_matches("> ")
                .trim_matches(|c| c == '*' || c == '_');
            if !cleaned.is_empty() {
                b.lines.push(cleaned.to_string());
            }
        }
    }
    b.finish(title, None)
}

fn strip_heading_marker(line: &str) -> Option<&str> {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    if (1..=3).contains(&hashes) {
        let rest = line[hashes..].trim();
        if !rest.is_empty() {
            return Some(rest);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_kind_by_extension() {
        assert_eq!(
            ParserKind::for_path(Path::new("book.txt")).unwrap(),
            ParserKind::PlainText
        );
        assert_eq!(
            ParserKind::for_path(Path::new("book.md")).unwrap(),
            ParserKind::Markdown
        );
        assert!(ParserKind::for_path(Path::new("book.epub")).is_err());
        assert!(ParserKind::for_path(Path::new("book.zip")).is_err());
    }

    #[test]
    fn plain_text_single_chapter() {
        let doc = parse_plain_text("Hello world.\n\nSecond paragraph.", Some("demo".into()));
        assert_eq!(doc.chapters.len(), 1);
        assert_eq!(doc.chapters[0].paragraphs.len(), 2);
        assert!(doc.chapters[0].title.is_none());
    }

    #[test]
    fn plain_text_chapter_headings() {
        let raw = "Chapter 1\n\nFirst chapter text.\n\nChapter 2\n\nSecond chapter text.";
        let doc = parse_plain_text(raw, None);
        assert_eq!(doc.chapters.len(), 2);
        assert_eq!(doc.chapters[0].title.as_deref(), Some("Chapter 1"));
        assert_eq!(doc.chapters[1].title.as_deref(), Some("Chapter 2"));
        assert_eq!(doc.chapters[1].ordinal, 1);
    }

    #[test]
    fn all_caps_line_is_heading() {
        let raw = "PROLOGUE AT SEA\n\nThe ship rolled.";
        let doc = parse_plain_text(raw, None);
        assert_eq!(doc.chapters.len(), 1);
        assert_eq!(doc.chapters[0].title.as_deref(), Some("PROLOGUE AT SEA"));
    }

    #[test]
    fn markdown_headings_and_fences() {
        let raw = "# One\n\nText one.\n\n```\ncode ignored\n```\n\n## Two\n\nText two.";
        let doc = parse_markdown(raw, None);
        assert_eq!(doc.chapters.len(), 2);
        assert_eq!(doc.chapters[0].title.as_deref(), Some("One"));
        assert_eq!(doc.chapters[0].paragraphs, vec!["Text one.".to_string()]);
        assert_eq!(doc.chapters[1].paragraphs, vec!["Text two.".to_string()]);
    }

    #[test]
    fn preamble_before_first_heading_is_kept() {
        let raw = "Opening epigraph line.\n\n# One\n\nBody.";
        let doc = parse_markdown(raw, None);
        assert_eq!(doc.chapters.len(), 2);
        assert!(doc.chapters[0].title.is_none());
        assert_eq!(doc.chapters[0].paragraphs.len(), 1);
    }
}
