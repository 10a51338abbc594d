//! Dialogue routing: split a chunk into voiced spans.
//!
//! Quoted dialogue is attributed to a speaker by scanning a short window
//! around the quote for an attribution verb; attributed speakers map to
//! character voices, everything else stays with the narrator. Attribution is
//! pattern-based and will miss speakers without nearby attribution; those
//! spans deliberately fall back to the narrator voice.

use std::collections::BTreeMap;

/// A contiguous sub-range of a chunk bound to a single voice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Span {
    pub text: String,
    pub voice: String,
}

/// Verbs that attribute nearby dialogue to a speaker.
const ATTRIBUTION_VERBS: &[&str] = &[
    "said", "says", "say", "replied", "replies", "asked", "asks", "exclaimed", "exclaims",
    "shouted", "shouts", "whispered", "whispers", "answered", "answers",
];

/// Pronouns accepted as speaker candidates next to an attribution verb.
const PRONOUNS: &[&str] = &["he", "she", "they", "i"];

/// Characters the attribution window scans on either side of a quote.
const WINDOW_CHARS: usize = 120;

/// Decompose a chunk into spans.
///
/// With routing disabled (or no character map) the whole chunk is one
/// narrator span. Unbalanced quotes also degrade to a single narrator span.
/// Spans partition the chunk text exactly: concatenating them in order
/// reproduces the input, quotes and whitespace included.
pub fn route_chunk(
    text: &str,
    narrator: &str,
    character_map: &BTreeMap<String, String>,
    enabled: bool,
) -> Vec<Span> {
    let narrator_span = || {
        vec![Span {
            text: text.to_string(),
            voice: narrator.to_string(),
        }]
    };
    if !enabled || character_map.is_empty() || text.is_empty() {
        return narrator_span();
    }
    let ranges = match find_dialogue_ranges(text) {
        Some(ranges) if !ranges.is_empty() => ranges,
        // No dialogue, or unbalanced quotes: keep the whole chunk narrated.
        _ => return narrator_span(),
    };

    let mut spans: Vec<Span> = Vec::new();
    let mut pos = 0usize;
    for range in &ranges {
        if range.start > pos {
            push_span(&mut spans, &text[pos..range.start], narrator);
        }
        let voice = find_speaker(text, range)
            .and_then(|name| lookup_voice(character_map, &name))
            .unwrap_or_else(|| narrator.to_string());
        push_span(&mut spans, &text[range.start..range.end], &voice);
        pos = range.end;
    }
    if pos < text.len() {
        push_span(&mut spans, &text[pos..], narrator);
    }
    spans
}

/// Append a span, merging with the previous one when the voice is unchanged.
fn push_span(spans: &mut Vec<Span>, text: &str, voice: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(last) = spans.last_mut() {
        if last.voice == voice {
            last.text.push_str(text);
            return;
        }
    }
    spans.push(Span {
        text: text.to_string(),
        voice: voice.to_string(),
    });
}

/// Byte range of a dialogue region, quote characters included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct QuoteRange {
    start: usize,
    end: usize,
}

/// Scan for balanced dialogue quote pairs. Returns `None` on unbalanced
/// input. While inside a pair only the matching closer is considered, so
/// the outermost pair wins over anything nested.
fn find_dialogue_ranges(text: &str) -> Option<Vec<QuoteRange>> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut ranges = Vec::new();
    let mut open: Option<(usize, char)> = None;
    for idx in 0..chars.len() {
        let (i, c) = chars[idx];
        match open {
            None => {
                let closer = match c {
                    '\u{201C}' => Some('\u{201D}'),
                    '\u{2018}' => Some('\u{2019}'),
                    '\u{00AB}' => Some('\u{00BB}'),
                    '"' => Some('"'),
                    '\'' if single_quote_opens(&chars, idx) => Some('\''),
                    _ => None,
                };
                if let Some(closer) = closer {
                    open = Some((i, closer));
                }
            }
            Some((start, closer)) => {
                if c == closer {
                    if matches!(closer, '\'' | '\u{2019}') && is_apostrophe(&chars, idx) {
                        continue;
                    }
                    ranges.push(QuoteRange {
                        start,
                        end: i + c.len_utf8(),
                    });
                    open = None;
                }
            }
        }
    }
    if open.is_some() {
        None
    } else {
        Some(ranges)
    }
}

/// A straight single quote opens dialogue only at a word boundary; inside a
/// word it is an apostrophe.
fn single_quote_opens(chars: &[(usize, char)], idx: usize) -> bool {
    let prev_ok = idx == 0 || chars[idx - 1].1.is_whitespace();
    let next_ok = chars
        .get(idx + 1)
        .is_some_and(|&(_, c)| c.is_alphanumeric() || c == '\u{201C}' || c == '"');
    prev_ok && next_ok
}

fn is_apostrophe(chars: &[(usize, char)], idx: usize) -> bool {
    idx > 0
        && chars[idx - 1].1.is_alphanumeric()
        && chars.get(idx + 1).is_some_and(|&(_, c)| c.is_alphanumeric())
}

/// Find the speaker for a dialogue range, if any.
fn find_speaker(text: &str, range: &QuoteRange) -> Option<String> {
    let before = window_before(text, range.start);
    let after = window_after(text, range.end);
    speaker_near_verb(after)
        .or_else(|| speaker_near_verb(before))
        .or_else(|| nearest_preceding_name(before))
}

fn window_before(text: &str, end: usize) -> &str {
    let slice = &text[..end];
    let mut start = end;
    for (count, (i, _)) in slice.char_indices().rev().enumerate() {
        if count >= WINDOW_CHARS {
            break;
        }
        start = i;
    }
    &text[start..end]
}

fn window_after(text: &str, start: usize) -> &str {
    let slice = &text[start..];
    let mut len = slice.len();
    for (count, (i, _)) in slice.char_indices().enumerate() {
        if count >= WINDOW_CHARS {
            len = i;
            break;
        }
    }
    &slice[..len]
}

/// Look for an attribution verb adjacent to a speaker candidate, in either
/// order ("he shouted", "John said", "said John").
fn speaker_near_verb(window: &str) -> Option<String> {
    let tokens: Vec<&str> = window.split_whitespace().collect();
    for pair in tokens.windows(2) {
        let a = clean_token(pair[0]);
        let b = clean_token(pair[1]);
        if is_attribution_verb(&b) && is_speaker_candidate(&a) {
            return Some(a);
        }
        if is_attribution_verb(&a) && is_speaker_candidate(&b) {
            return Some(b);
        }
    }
    None
}

/// Fallback heuristic: the nearest preceding capitalized token that does not
/// begin a sentence.
fn nearest_preceding_name(before: &str) -> Option<String> {
    let tokens: Vec<&str> = before.split_whitespace().collect();
    for i in (0..tokens.len()).rev() {
        let token = clean_token(tokens[i]);
        let capitalized = token.chars().next().is_some_and(char::is_uppercase);
        if capitalized && !is_attribution_verb(&token) {
            let sentence_initial = i == 0 || tokens[i - 1].ends_with(['.', '!', '?']);
            if !sentence_initial {
                return Some(token);
            }
        }
    }
    None
}

fn clean_token(token: &str) -> String {
    token
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
        .to_string()
}

fn is_attribution_verb(token: &str) -> bool {
    ATTRIBUTION_VERBS.contains(&token.to_lowercase().as_str())
}

fn is_speaker_candidate(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    token.chars().next().is_some_and(char::is_uppercase)
        || PRONOUNS.contains(&token.to_lowercase().as_str())
}

fn lookup_voice(map: &BTreeMap<String, String>, speaker: &str) -> Option<String> {
    let wanted = speaker.to_lowercase();
    map.iter()
        .find(|(name, _)| name.to_lowercase() == wanted)
        .map(|(_, voice)| voice.clone())
}
