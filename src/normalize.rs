//! Text normalization and non-narrative chapter classification.
//!
//! The whole pass is a pure function of `(document, options)`: repair the
//! text inside every paragraph, score each chapter with a five-signal
//! classifier, and keep only the span between the first and last narrative
//! chapter. Classification never fails a run; anything ambiguous degrades
//! to "keep the chapter".

use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::document::{Chapter, Document};

/// Options for the normalization pass.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizeOptions {
    /// Strip ISBN lines and catalog blocks.
    pub strip_metadata: bool,
    /// Chapters scoring at or above this are tagged non-narrative.
    pub junk_threshold: f32,
    /// Fraction of the book at each end treated as front/back matter,
    /// where the title signal carries extra weight.
    pub edge_fraction: f32,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            strip_metadata: true,
            junk_threshold: 0.5,
            edge_fraction: 0.25,
        }
    }
}

/// Signal weights. They sum to 1.0 before the front-matter bias.
const WEIGHT_TITLE: f32 = 0.35;
const WEIGHT_STRUCTURAL: f32 = 0.20;
const WEIGHT_PATTERNS: f32 = 0.15;
const WEIGHT_PROSE: f32 = 0.15;
const WEIGHT_LENGTH: f32 = 0.15;
const EDGE_TITLE_BIAS: f32 = 1.5;

/// Titles that mark a chapter as non-narrative on their own.
const JUNK_TITLES: &[&str] = &[
    "table of contents",
    "contents",
    "bibliography",
    "references",
    "notes",
    "index",
    "acknowledgments",
    "acknowledgements",
    "about the author",
    "about the publisher",
    "copyright",
    "foreword",
    "preface",
];

/// Titles that force a chapter to stay narrative regardless of score.
const CONTENT_TITLE_PREFIXES: &[&str] = &[
    "chapter", "part", "book", "act", "scene", "prologue", "epilogue", "interlude",
];

/// Catalog block headers ("Also by the same author" pages).
const CATALOG_HEADERS: &[&str] = &["also by", "books by", "other works", "praise for"];

/// Small closed set of finite verbs; enough to tell prose from lists.
const FINITE_VERBS: &[&str] = &[
    "is", "are", "was", "were", "be", "been", "has", "have", "had", "said", "says", "did", "does",
    "do", "went", "came", "saw", "looked", "thought", "knew", "took", "made", "got", "would",
    "could", "should", "will", "can", "must", "might", "may",
];

fn isbn_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bISBN[-:\s]*[\dXx][\dXx -]{8,16}[\dXx]\b").unwrap())
}

fn reference_res() -> &'static [Regex; 4] {
    static RE: OnceLock<[Regex; 4]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r"\[\d+\]").unwrap(),
            Regex::new(r"\bpp?\.\s*\d+").unwrap(),
            Regex::new(r"\(\d{4}\)").unwrap(),
            Regex::new(r"^\s*\d+[.)]\s").unwrap(),
        ]
    })
}

/// Per-chapter classifier verdict, exposed for the `chapters` preview command.
#[derive(Clone, Debug)]
pub struct ChapterVerdict {
    pub ordinal: usize,
    pub title: Option<String>,
    pub score: f32,
    pub narrative: bool,
}

/// Run the full normalization pass.
pub fn normalize(doc: &Document, opts: &NormalizeOptions) -> Document {
    let mut out = Document {
        title: doc.title.clone(),
        author: doc.author.clone(),
        chapters: Vec::with_capacity(doc.chapters.len()),
    };
    for chapter in &doc.chapters {
        let mut cleaned = chapter.clone();
        cleaned.paragraphs = clean_paragraphs(&chapter.paragraphs, opts);
        out.chapters.push(cleaned);
    }

    let verdicts = classify_chapters(&out, opts);
    for (chapter, verdict) in out.chapters.iter_mut().zip(&verdicts) {
        chapter.narrative = verdict.narrative;
    }

    // Boundary extraction: discard everything outside the narrative span.
    let first = out.chapters.iter().position(|c| c.narrative);
    let last = out.chapters.iter().rposition(|c| c.narrative);
    match (first, last) {
        (Some(first), Some(last)) => {
            out.chapters.drain(last + 1..);
            out.chapters.drain(..first);
        }
        // No narrative chapter at all: degrade to keeping everything.
        _ => {
            for chapter in &mut out.chapters {
                chapter.narrative = true;
            }
        }
    }
    out
}

/// Score every chapter without mutating the document.
pub fn classify_chapters(doc: &Document, opts: &NormalizeOptions) -> Vec<ChapterVerdict> {
    let count = doc.chapters.len();
    let median = median_chapter_len(doc);
    doc.chapters
        .iter()
        .map(|chapter| {
            let (score, narrative) = classify(chapter, count, median, opts);
            ChapterVerdict {
                ordinal: chapter.ordinal,
                title: chapter.title.clone(),
                score,
                narrative,
            }
        })
        .collect()
}

fn classify(
    chapter: &Chapter,
    chapter_count: usize,
    median_len: usize,
    opts: &NormalizeOptions,
) -> (f32, bool) {
    let title = chapter
        .title
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    // Content protection: an explicit chapter-like title always narrates.
    if CONTENT_TITLE_PREFIXES.iter().any(|p| title.starts_with(p)) {
        return (0.0, true);
    }

    let position = if chapter_count <= 1 {
        0.0
    } else {
        chapter.ordinal as f32 / chapter_count as f32
    };
    let at_edge = position < opts.edge_fraction || position > 1.0 - opts.edge_fraction;

    let title_signal = if JUNK_TITLES
        .iter()
        .any(|k| title == *k || title.starts_with(&format!("{k} ")) || title.starts_with(&format!("{k}:")))
    {
        1.0
    } else {
        0.0
    };
    let title_weight = if at_edge {
        WEIGHT_TITLE * EDGE_TITLE_BIAS
    } else {
        WEIGHT_TITLE
    };

    let structural_signal = match chapter.source_tag {
        Some(tag) if tag.is_junk() => 1.0,
        _ => 0.0,
    };

    let text_len: usize = chapter.char_len();
    let (pattern_signal, prose_signal) = if text_len < 100 {
        // Too little text to judge; let title and length speak.
        (0.0, 0.0)
    } else {
        (pattern_density(chapter), prose_sparsity(chapter))
    };

    let length_signal = length_signal(text_len, median_len, at_edge);

    let score = (title_signal * title_weight
        + structural_signal * WEIGHT_STRUCTURAL
        + pattern_signal * WEIGHT_PATTERNS
        + prose_signal * WEIGHT_PROSE
        + length_signal * WEIGHT_LENGTH)
        .min(1.0);

    (score, score < opts.junk_threshold)
}

/// Fraction of paragraph-lines matching reference or enumerated-list shapes.
fn pattern_density(chapter: &Chapter) -> f32 {
    let mut lines = 0usize;
    let mut hits = 0usize;
    for paragraph in &chapter.paragraphs {
        for line in paragraph.split('\n') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            lines += 1;
            if reference_res().iter().any(|re| re.is_match(line)) {
                hits += 1;
            }
        }
    }
    if lines == 0 {
        0.0
    } else {
        hits as f32 / lines as f32
    }
}

/// 1 − the fraction of sentences that read as prose (≥ 8 tokens with a
/// finite verb).
fn prose_sparsity(chapter: &Chapter) -> f32 {
    let mut sentences = 0usize;
    let mut prose = 0usize;
    for paragraph in &chapter.paragraphs {
        for sentence in paragraph.split(['.', '!', '?']) {
            let tokens: Vec<&str> = sentence.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            sentences += 1;
            if tokens.len() >= 8
                && tokens.iter().any(|t| {
                    let t = t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
                    FINITE_VERBS.contains(&t.as_str())
                })
            {
                prose += 1;
            }
        }
    }
    if sentences == 0 {
        1.0
    } else {
        1.0 - prose as f32 / sentences as f32
    }
}

fn length_signal(text_len: usize, median_len: usize, at_edge: bool) -> f32 {
    if median_len == 0 {
        return 0.0;
    }
    let ratio = (text_len as f32 / median_len as f32).min(1.0);
    let shortness = 1.0 - ratio;
    // Tiny chapters in the middle of a book are usually scene breaks, not
    // junk; the head and tail are where colophons live.
    if at_edge {
        shortness
    } else {
        shortness * 0.4
    }
}

fn median_chapter_len(doc: &Document) -> usize {
    let mut lens: Vec<usize> = doc.chapters.iter().map(Chapter::char_len).collect();
    if lens.is_empty() {
        return 0;
    }
    lens.sort_unstable();
    lens[lens.len() / 2]
}

fn clean_paragraphs(paragraphs: &[String], opts: &NormalizeOptions) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::with_capacity(paragraphs.len());
    let mut i = 0;
    while i < paragraphs.len() {
        if opts.strip_metadata {
            if let Some(block_len) = catalog_block_len(&paragraphs[i..]) {
                i += block_len;
                continue;
            }
        }
        let paragraph = repair_paragraph(&paragraphs[i], opts);
        if !paragraph.is_empty() {
            cleaned.push(paragraph);
        }
        i += 1;
    }
    cleaned
}

/// Length (in paragraphs) of a catalog block starting here, if any.
///
/// A catalog block opens with a header keyword and runs through short,
/// unpunctuated title lines; it is removed only when it totals ≥ 200 chars.
fn catalog_block_len(paragraphs: &[String]) -> Option<usize> {
    let first = paragraphs.first()?;
    let head = first.trim_start().to_lowercase();
    if !CATALOG_HEADERS.iter().any(|h| head.starts_with(h)) {
        return None;
    }
    let mut total = first.chars().count();
    let mut len = 1;
    for paragraph in &paragraphs[1..] {
        let trimmed = paragraph.trim();
        let is_entry = trimmed.chars().count() <= 80 && !trimmed.ends_with(['.', '!', '?']);
        if !is_entry {
            break;
        }
        total += trimmed.chars().count();
        len += 1;
    }
    (total >= 200).then_some(len)
}

fn repair_paragraph(paragraph: &str, opts: &NormalizeOptions) -> String {
    let text: String = paragraph.nfc().collect();
    let text = repair_hyphenation(&text);
    let text = if opts.strip_metadata {
        strip_isbn_lines(&text)
    } else {
        text
    };
    collapse_whitespace(&text)
}

/// Join `word-\nword` line-break hyphenation when both halves are alphabetic
/// and the joined word stays ≤ 30 chars.
fn repair_hyphenation(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(\p{Alphabetic}+)-\s*\n\s*(\p{Alphabetic}+)").unwrap());
    re.replace_all(text, |caps: &regex::Captures| {
        let (a, b) = (&caps[1], &caps[2]);
        if a.chars().count() + b.chars().count() <= 30 {
            format!("{a}{b}")
        } else {
            format!("{a}-\n{b}")
        }
    })
    .into_owned()
}

fn strip_isbn_lines(text: &str) -> String {
    text.split('\n')
        .filter(|line| !isbn_re().is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
