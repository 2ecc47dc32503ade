//! Block splitting and text utilities.
//!
//! Notes are split into paragraph-like [`Block`]s on blank-line runs,
//! preserving exact byte offsets into the (newline-normalized) note text.
//! A quality-aware variant merges heading and list fragments into larger
//! content-bearing blocks so tiny structural spans do not become their own
//! retrieval units.
//!
//! All functions operate on text that has already been passed through
//! [`clean_text`]; offsets are relative to that cleaned text.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::Block;

static BLANK_SPLIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n[ \t]*\n+").unwrap());

/// Character cap for a heading-led merged block.
const QUALITY_MERGE_CAP: usize = 1600;

/// Normalize line endings to `\n`.
pub fn clean_text(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Strip legacy inline chunk markers left by old editor builds.
pub fn strip_chunk_markers(text: &str) -> String {
    text.replace("\n\n<!-- scriptorium-chunk -->\n\n", "\n\n")
        .replace("<!-- scriptorium-chunk -->", "")
}

/// Split text into blocks separated by blank-line runs.
///
/// Each block's `text` is the exact slice `&text[start..end]` with outer
/// whitespace trimmed away from the offsets themselves, so callers can map
/// blocks back onto editor positions. Empty input yields exactly one empty
/// block (never an empty list), so block 0 is always addressable.
pub fn split_blocks(text: &str) -> Vec<Block> {
    if text.is_empty() {
        return vec![Block {
            start: 0,
            end: 0,
            text: String::new(),
        }];
    }

    let mut blocks = Vec::new();
    let mut last = 0usize;
    for m in BLANK_SPLIT.find_iter(text) {
        push_trimmed(text, last, m.start(), &mut blocks, false);
        last = m.end();
    }
    let have_blocks = !blocks.is_empty();
    push_trimmed(text, last, text.len(), &mut blocks, !have_blocks);
    if blocks.is_empty() {
        blocks.push(Block {
            start: last,
            end: last,
            text: String::new(),
        });
    }
    blocks
}

fn push_trimmed(text: &str, lo: usize, hi: usize, out: &mut Vec<Block>, keep_empty: bool) {
    let raw = &text[lo..hi];
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        if keep_empty {
            out.push(Block {
                start: lo,
                end: lo,
                text: String::new(),
            });
        }
        return;
    }
    let start = lo + (raw.len() - raw.trim_start().len());
    let end = start + trimmed.len();
    out.push(Block {
        start,
        end,
        text: trimmed.to_string(),
    });
}

/// Quality-aware splitter: [`split_blocks`] plus structural merging.
///
/// A heading block absorbs the blocks that follow it until a heading of the
/// same or higher level appears or the merged span exceeds a size cap. A
/// short `label:` lead-in absorbs an immediately following bullet list.
/// Offsets still map exactly onto the input text.
pub fn split_quality_blocks(text: &str) -> Vec<Block> {
    let base = split_blocks(text);
    if base.len() <= 1 {
        return base;
    }

    let mut out: Vec<Block> = Vec::new();
    let mut i = 0usize;
    while i < base.len() {
        let block = &base[i];
        if let Some(level) = heading_level(&block.text) {
            let mut end = block.end;
            let mut j = i + 1;
            while j < base.len() {
                if let Some(next_level) = heading_level(&base[j].text) {
                    if next_level <= level {
                        break;
                    }
                }
                if base[j].end - block.start > QUALITY_MERGE_CAP {
                    break;
                }
                end = base[j].end;
                j += 1;
            }
            if j > i + 1 {
                out.push(slice_block(text, block.start, end));
                i = j;
                continue;
            }
        } else if is_list_leadin(&block.text)
            && i + 1 < base.len()
            && is_list_block(&base[i + 1].text)
        {
            out.push(slice_block(text, block.start, base[i + 1].end));
            i += 2;
            continue;
        }
        out.push(block.clone());
        i += 1;
    }
    out
}

fn slice_block(text: &str, start: usize, end: usize) -> Block {
    Block {
        start,
        end,
        text: text[start..end].to_string(),
    }
}

/// Markdown heading level of a single-line block, if it is one.
pub fn heading_level(text: &str) -> Option<usize> {
    if text.contains('\n') {
        return None;
    }
    let stripped = text.trim_start_matches(' ');
    if text.len() - stripped.len() > 3 {
        return None;
    }
    let hashes = stripped.chars().take_while(|&c| c == '#').count();
    if (1..=6).contains(&hashes)
        && stripped[hashes..]
            .chars()
            .next()
            .is_some_and(|c| c == ' ' || c == '\t')
    {
        Some(hashes)
    } else {
        None
    }
}

/// True when a block is nothing but a markdown heading line.
pub fn is_heading_only(text: &str) -> bool {
    heading_level(text.trim()).is_some()
}

fn is_list_leadin(text: &str) -> bool {
    !text.contains('\n') && text.len() <= 120 && text.trim_end().ends_with(':')
}

fn is_list_block(text: &str) -> bool {
    let first = text.lines().next().unwrap_or("").trim_start();
    first.starts_with("- ")
        || first.starts_with("* ")
        || first.starts_with("+ ")
        || first
            .split_once(['.', ')'])
            .is_some_and(|(n, rest)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) && rest.starts_with(' '))
}

/// Intrinsic quality score for a block, in `[0, 1]`.
///
/// Favors content-bearing prose: enough words, a healthy letter ratio, and
/// sentence punctuation. Heading-only blocks score a flat 0.2.
pub fn block_quality(text: &str) -> f32 {
    let t = text.trim();
    if t.is_empty() {
        return 0.0;
    }
    if is_heading_only(t) {
        return 0.2;
    }
    let words = t.split_whitespace().count();
    let chars = t.chars().count().max(1);
    let letters = t.chars().filter(|c| c.is_alphabetic()).count();
    let length_term = (words as f32 / 40.0).min(1.0) * 0.6;
    let letter_term = 0.2 * (letters as f32 / chars as f32);
    let sentence_term = if t.contains(['.', '!', '?']) { 0.2 } else { 0.0 };
    (length_term + letter_term + sentence_term).clamp(0.0, 1.0)
}

/// Clip `text` to at most `max_tokens` whitespace tokens centered on the
/// cursor's byte offset within the text.
pub fn clip_tokens_around_cursor(text: &str, cursor: usize, max_tokens: usize) -> String {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() <= max_tokens {
        return text.to_string();
    }
    let cursor = snap_to_char_boundary(text, cursor.min(text.len()));
    let cursor_tok = text[..cursor].split_whitespace().count().min(tokens.len());
    let half = max_tokens / 2;
    let start = cursor_tok.saturating_sub(half);
    let end = (start + max_tokens).min(tokens.len());
    let start = end.saturating_sub(max_tokens);
    tokens[start..end].join(" ")
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
pub fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Split text into sentence-like units on `.`/`!`/`?` followed by whitespace.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(j, next)) = chars.peek() {
                if next.is_whitespace() {
                    let seg = text[start..j].trim();
                    if !seg.is_empty() {
                        out.push(seg);
                    }
                    start = j;
                }
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// A short display excerpt: the first few sentences, capped by length.
pub fn sentence_excerpt(text: &str, max_sentences: usize, max_chars: usize) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    let sentences = split_sentences(text);
    let mut excerpt = sentences
        .iter()
        .take(max_sentences.max(1))
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    if excerpt.len() > max_chars {
        let cut = snap_to_char_boundary(&excerpt, max_chars);
        excerpt.truncate(cut);
        excerpt.truncate(excerpt.trim_end().len());
    }
    excerpt
}

/// Count case-insensitive, word-bounded occurrences of `needle` in `haystack`.
pub fn count_occurrences(haystack: &str, needle: &str) -> usize {
    let needle = needle.trim();
    if needle.is_empty() {
        return 0;
    }
    let hay = haystack.to_lowercase();
    let ndl = needle.to_lowercase();
    let mut count = 0usize;
    let mut from = 0usize;
    while let Some(pos) = hay[from..].find(&ndl) {
        let at = from + pos;
        let end = at + ndl.len();
        let before_ok = !hay[..at].chars().next_back().is_some_and(is_word_char);
        let after_ok = !hay[end..].chars().next().is_some_and(is_word_char);
        if before_ok && after_ok {
            count += 1;
        }
        from = end.max(at + 1);
    }
    count
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_single_block() {
        let blocks = split_blocks("");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start, 0);
        assert_eq!(blocks[0].end, 0);
        assert_eq!(blocks[0].text, "");
    }

    #[test]
    fn test_split_offsets_exact() {
        let text = "first para\n\nsecond para\n\n\nthird";
        let blocks = split_blocks(text);
        assert_eq!(blocks.len(), 3);
        for b in &blocks {
            assert_eq!(&text[b.start..b.end], b.text);
        }
        assert_eq!(blocks[0].text, "first para");
        assert_eq!(blocks[1].text, "second para");
        assert_eq!(blocks[2].text, "third");
    }

    #[test]
    fn test_blank_only_input() {
        let blocks = split_blocks("\n\n\n");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "");
    }

    #[test]
    fn test_split_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma";
        assert_eq!(split_blocks(text), split_blocks(text));
    }

    #[test]
    fn test_heading_level() {
        assert_eq!(heading_level("# Title"), Some(1));
        assert_eq!(heading_level("### Sub"), Some(3));
        assert_eq!(heading_level("#NotAHeading"), None);
        assert_eq!(heading_level("# Multi\nline"), None);
    }

    #[test]
    fn test_quality_merge_heading_with_body() {
        let text = "# Basilisk Venom\n\nA slow-acting toxin.\n\nIt petrifies tissue.\n\n# Other\n\nUnrelated.";
        let blocks = split_quality_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].text.contains("# Basilisk Venom"));
        assert!(blocks[0].text.contains("petrifies"));
        assert!(blocks[1].text.starts_with("# Other"));
        for b in &blocks {
            assert_eq!(&text[b.start..b.end], b.text);
        }
    }

    #[test]
    fn test_quality_merge_list_leadin() {
        let text = "Ingredients:\n\n- fang dust\n- moonwater";
        let blocks = split_quality_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].text.contains("Ingredients:"));
        assert!(blocks[0].text.contains("moonwater"));
    }

    #[test]
    fn test_block_quality_ordering() {
        let heading = block_quality("# Just A Heading");
        let prose = block_quality(
            "The venom acts slowly, spreading through the veins. Victims report numbness first, \
             then a creeping stiffness that healers struggle to reverse.",
        );
        assert!(prose > heading);
        assert_eq!(block_quality(""), 0.0);
    }

    #[test]
    fn test_clip_around_cursor() {
        let words: Vec<String> = (0..100).map(|i| format!("w{i}")).collect();
        let text = words.join(" ");
        let cursor = text.find("w50").unwrap();
        let clipped = clip_tokens_around_cursor(&text, cursor, 10);
        assert_eq!(clipped.split_whitespace().count(), 10);
        assert!(clipped.contains("w50"));
        // Short text passes through untouched.
        assert_eq!(clip_tokens_around_cursor("a b c", 1, 10), "a b c");
    }

    #[test]
    fn test_sentence_excerpt_caps() {
        let text = "One. Two. Three. Four.";
        assert_eq!(sentence_excerpt(text, 3, 600), "One. Two. Three.");
        let long = "x".repeat(700) + ". Next.";
        assert!(sentence_excerpt(&long, 3, 600).len() <= 600);
    }

    #[test]
    fn test_count_occurrences_word_bounded() {
        let hay = "Basilisk venom is rare. basilisk venom again; basiliskvenom is not.";
        assert_eq!(count_occurrences(hay, "Basilisk Venom"), 2);
        assert_eq!(count_occurrences(hay, ""), 0);
    }

    #[test]
    fn test_strip_chunk_markers() {
        let text = "a\n\n<!-- scriptorium-chunk -->\n\nb";
        assert_eq!(strip_chunk_markers(text), "a\n\nb");
    }
}
