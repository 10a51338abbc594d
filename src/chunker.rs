//! Chunk planning for synthesis.
//!
//! Partitions normalized chapter text into synthesis-ready units bounded by
//! a soft character target and a hard phoneme budget imposed by the TTS
//! backend. Planning is deterministic: identical input and options always
//! produce a byte-identical chunk sequence.
//!
//! Coverage invariant: joining a chapter's chunk texts with single spaces
//! reproduces that chapter's normalized text exactly.

use crate::document::{Chapter, Document};

/// The atomic unit of synthesis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based, monotonic across the whole document.
    pub ordinal: u64,
    /// The chapter this chunk belongs to (original document ordinal).
    pub chapter_ordinal: usize,
    pub text: String,
    /// True for the first chunk of each narrative chapter.
    pub is_chapter_start: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkerOptions {
    /// Soft bound on chunk length in characters.
    pub char_target: usize,
    /// Hard bound on the estimated phoneme count per chunk.
    pub phoneme_hard_limit: usize,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            char_target: 400,
            phoneme_hard_limit: 510,
        }
    }
}

/// Estimate the phoneme count of a piece of text.
///
/// Summed per whitespace token: Latin-script tokens cost `ceil(len × 1.1)`,
/// tokens containing CJK cost 2 per character, anything else costs
/// `len × 2`. Deliberately cheap; the hard limit carries enough headroom.
pub fn phoneme_estimate(text: &str) -> usize {
    text.split_whitespace().map(token_phonemes).sum()
}

fn token_phonemes(token: &str) -> usize {
    let mut latin = true;
    let mut cjk = false;
    let mut len = 0usize;
    for c in token.chars() {
        len += 1;
        if is_cjk(c) {
            cjk = true;
        } else if !c.is_ascii() && !is_latin_supplement(c) {
            latin = false;
        }
    }
    if cjk {
        len * 2
    } else if latin {
        (len as f64 * 1.1).ceil() as usize
    } else {
        len * 2
    }
}

fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3040..=0x30FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xAC00..=0xD7AF | 0xF900..=0xFAFF
    )
}

fn is_latin_supplement(c: char) -> bool {
    matches!(c as u32, 0x00C0..=0x024F)
}

/// The narrated text of a chapter: paragraphs joined by single spaces.
pub fn chapter_text(chapter: &Chapter) -> String {
    chapter.paragraphs.join(" ")
}

/// Plan the chunk stream for a normalized document.
pub fn plan(doc: &Document, opts: &ChunkerOptions) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut ordinal = 0u64;
    for chapter in doc.narrative_chapters() {
        let mut pieces: Vec<String> = Vec::new();
        for paragraph in &chapter.paragraphs {
            for sentence in split_sentences(paragraph) {
                sentence_pieces(sentence, opts, &mut pieces);
            }
        }

        let mut first = true;
        let mut cur = String::new();
        let mut cur_chars = 0usize;
        let mut cur_phonemes = 0usize;
        for piece in pieces {
            let piece_chars = piece.chars().count();
            let piece_phonemes = phoneme_estimate(&piece);
            let fits = cur.is_empty()
                || (cur_chars + 1 + piece_chars <= opts.char_target
                    && cur_phonemes + piece_phonemes <= opts.phoneme_hard_limit);
            if !fits {
                chunks.push(Chunk {
                    ordinal,
                    chapter_ordinal: chapter.ordinal,
                    text: std::mem::take(&mut cur),
                    is_chapter_start: first,
                });
                ordinal += 1;
                first = false;
                cur_chars = 0;
                cur_phonemes = 0;
            }
            if !cur.is_empty() {
                cur.push(' ');
                cur_chars += 1;
            }
            cur.push_str(&piece);
            cur_chars += piece_chars;
            cur_phonemes += piece_phonemes;
        }
        if !cur.is_empty() {
            chunks.push(Chunk {
                ordinal,
                chapter_ordinal: chapter.ordinal,
                text: cur,
                is_chapter_start: first,
            });
            ordinal += 1;
        }
    }
    chunks
}

/// Split a sentence that violates the bounds, preferring clause delimiters
/// over raw whitespace. Pieces land in `out` and each satisfies both bounds
/// (single over-long words excepted; they cannot be split further).
fn sentence_pieces(sentence: &str, opts: &ChunkerOptions, out: &mut Vec<String>) {
    if phoneme_estimate(sentence) <= opts.phoneme_hard_limit {
        out.push(sentence.to_string());
        return;
    }
    for clause in split_at_delimiters(sentence, &[',', ';', ':', '\u{2014}']) {
        if phoneme_estimate(clause) <= opts.phoneme_hard_limit
            && clause.chars().count() <= opts.char_target
        {
            out.push(clause.to_string());
        } else {
            whitespace_split(clause, opts, out);
        }
    }
}

fn whitespace_split(text: &str, opts: &ChunkerOptions, out: &mut Vec<String>) {
    let mut cur = String::new();
    let mut cur_chars = 0usize;
    let mut cur_phonemes = 0usize;
    for word in text.split(' ') {
        if word.is_empty() {
            continue;
        }
        let word_chars = word.chars().count();
        let word_phonemes = phoneme_estimate(word);
        let fits = cur.is_empty()
            || (cur_chars + 1 + word_chars <= opts.char_target
                && cur_phonemes + word_phonemes <= opts.phoneme_hard_limit);
        if !fits {
            out.push(std::mem::take(&mut cur));
            cur_chars = 0;
            cur_phonemes = 0;
        }
        if !cur.is_empty() {
            cur.push(' ');
            cur_chars += 1;
        }
        cur.push_str(word);
        cur_chars += word_chars;
        cur_phonemes += word_phonemes;
    }
    if !cur.is_empty() {
        out.push(cur);
    }
}

/// Split text into sentences at terminator runs followed by a space,
/// keeping the terminators (and a trailing closing quote) with the
/// sentence. Joining the results with single spaces reproduces the input.
fn split_sentences(text: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut k = 0usize;
    while k < chars.len() {
        if matches!(chars[k].1, '.' | '!' | '?') {
            let mut j = k + 1;
            while j < chars.len() && matches!(chars[j].1, '.' | '!' | '?') {
                j += 1;
            }
            if j < chars.len()
                && matches!(chars[j].1, '"' | '\u{201D}' | '\u{2019}' | '\u{00BB}' | '\'')
            {
                j += 1;
            }
            if j >= chars.len() {
                break;
            }
            if chars[j].1 == ' ' {
                let end = chars[j].0;
                out.push(&text[start..end]);
                start = end + 1;
                k = j + 1;
                continue;
            }
            k = j;
        } else {
            k += 1;
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

/// Split at delimiter characters followed by a space, keeping the delimiter
/// with the left piece. Joining with single spaces reproduces the input.
fn split_at_delimiters<'a>(text: &'a str, delimiters: &[char]) -> Vec<&'a str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut iter = text.char_indices().peekable();
    while let Some((_, c)) = iter.next() {
        if delimiters.contains(&c) {
            if let Some(&(j, next)) = iter.peek() {
                if next == ' ' {
                    out.push(&text[start..j]);
                    start = j + 1;
                    iter.next();
                }
            }
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Chapter;

    fn doc_with(paragraphs: Vec<&str>) -> Document {
        let mut chapter = Chapter::new(0, Some("Chapter 1".into()));
        chapter.paragraphs = paragraphs.into_iter().map(String::from).collect();
        Document {
            title: None,
            author: None,
            chapters: vec![chapter],
        }
    }

    #[test]
    fn phoneme_estimate_per_script() {
        // Latin: ceil(5 * 1.1) = 6
        assert_eq!(phoneme_estimate("hello"), 6);
        // CJK: 2 per character
        assert_eq!(phoneme_estimate("\u{3053}\u{3093}\u{306B}\u{3061}\u{306F}"), 10);
        // Tokens sum independently
        assert_eq!(
            phoneme_estimate("hello world"),
            phoneme_estimate("hello") + phoneme_estimate("world")
        );
    }

    #[test]
    fn sentence_split_roundtrips() {
        let text = "First one. Second one! Third?! And \"quoted.\" Last";
        let sentences = split_sentences(text);
        assert_eq!(sentences.join(" "), text);
        assert_eq!(sentences[0], "First one.");
        assert_eq!(sentences[2], "Third?!");
        assert_eq!(sentences[3], "And \"quoted.\"");
    }

    #[test]
    fn clause_split_roundtrips() {
        let text = "one, two; three: four\u{2014} five";
        let clauses = split_at_delimiters(text, &[',', ';', ':', '\u{2014}']);
        assert_eq!(clauses.join(" "), text);
        assert_eq!(clauses.len(), 5);
    }

    #[test]
    fn single_short_input_is_one_chunk() {
        let chunks = plan(&doc_with(vec!["Hello world."]), &ChunkerOptions::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello world.");
        assert!(chunks[0].is_chapter_start);
        assert_eq!(chunks[0].ordinal, 0);
    }

    #[test]
    fn coverage_invariant_holds() {
        let long: Vec<String> = (0..60)
            .map(|i| format!("Sentence number {i} has a handful of words in it."))
            .collect();
        let paragraphs: Vec<&str> = long.iter().map(String::as_str).collect();
        let doc = doc_with(paragraphs);
        let opts = ChunkerOptions::default();
        let chunks = plan(&doc, &opts);
        assert!(chunks.len() > 1);
        let joined: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        assert_eq!(joined.join(" "), chapter_text(&doc.chapters[0]));
    }

    #[test]
    fn chunks_respect_both_bounds() {
        let long: Vec<String> = (0..60)
            .map(|i| format!("Sentence number {i} has a handful of words in it."))
            .collect();
        let paragraphs: Vec<&str> = long.iter().map(String::as_str).collect();
        let opts = ChunkerOptions::default();
        for chunk in plan(&doc_with(paragraphs), &opts) {
            // A chunk may exceed the soft target only by a single sentence.
            assert!(chunk.text.chars().count() <= opts.char_target + 60);
            assert!(phoneme_estimate(&chunk.text) <= opts.phoneme_hard_limit);
        }
    }

    #[test]
    fn oversized_sentence_hard_splits_on_whitespace() {
        // ~2000 chars with no punctuation at all.
        let words: Vec<String> = (0..250).map(|i| format!("word{i}")).collect();
        let giant = words.join(" ");
        let doc = doc_with(vec![giant.as_str()]);
        let opts = ChunkerOptions::default();
        let chunks = plan(&doc, &opts);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= opts.char_target);
            assert!(phoneme_estimate(&chunk.text) <= opts.phoneme_hard_limit);
        }
        let joined: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        assert_eq!(joined.join(" "), giant);
    }

    #[test]
    fn chunks_never_cross_chapters() {
        let mut one = Chapter::new(0, Some("Chapter 1".into()));
        one.paragraphs = vec!["First chapter prose.".into()];
        let mut two = Chapter::new(1, Some("Chapter 2".into()));
        two.paragraphs = vec!["Second chapter prose.".into()];
        let doc = Document {
            title: None,
            author: None,
            chapters: vec![one, two],
        };
        let chunks = plan(&doc, &ChunkerOptions::default());
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_chapter_start && chunks[1].is_chapter_start);
        assert_eq!(chunks[0].chapter_ordinal, 0);
        assert_eq!(chunks[1].chapter_ordinal, 1);
        assert_eq!(chunks[1].ordinal, 1);
    }

    #[test]
    fn planning_is_deterministic() {
        let long: Vec<String> = (0..40)
            .map(|i| format!("Sentence {i} with some words, a clause; and more."))
            .collect();
        let paragraphs: Vec<&str> = long.iter().map(String::as_str).collect();
        let doc = doc_with(paragraphs);
        let opts = ChunkerOptions::default();
        assert_eq!(plan(&doc, &opts), plan(&doc, &opts));
    }

    #[test]
    fn non_narrative_chapters_are_skipped() {
        let mut junk = Chapter::new(0, Some("Copyright".into()));
        junk.paragraphs = vec!["All rights reserved.".into()];
        junk.narrative = false;
        let mut body = Chapter::new(1, Some("Chapter 1".into()));
        body.paragraphs = vec!["Real prose.".into()];
        let doc = Document {
            title: None,
            author: None,
            chapters: vec![junk, body],
        };
        let chunks = plan(&doc, &ChunkerOptions::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chapter_ordinal, 1);
    }
}
