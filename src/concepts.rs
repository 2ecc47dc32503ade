//! Heuristic concept candidate extraction.
//!
//! Concepts are the unit of the grounding model: a normalized key shared by
//! every chunk that mentions the same heading title or capitalized phrase.
//! Extraction is deliberately cheap and deterministic: markdown headings
//! plus capitalized 1-5-word phrases, de-duplicated by normalized key in
//! first-seen order so downstream tie-breaks are stable.
//!
//! The stoplist filters single capitalized sentence-starters ("The", "It")
//! that would otherwise flood the concept table. Tuning the stoplist and
//! normalizer is the expected way to improve extraction quality; the
//! pipeline around it stays fixed.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]{0,3}#{1,6}[ \t]+(.+?)[ \t]*$").unwrap());

// The inter-word separator stays on one line; a newline ends the phrase.
static CAP_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:[A-Z][A-Za-z0-9'_-]*)(?:[ \t]+[A-Z][A-Za-z0-9'_-]*){0,4}\b").unwrap()
});

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s-]").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Single-word candidates dropped after normalization. Mostly capitalized
/// sentence-starters and pronouns.
const STOPLIST: &[&str] = &[
    "the", "this", "that", "these", "those", "it", "its", "a", "an", "i", "we", "you", "he",
    "she", "they", "my", "our", "your", "their", "if", "in", "on", "at", "for", "and", "but",
    "or", "so", "as", "is", "are", "was", "were", "be", "been", "not", "no", "yes", "when",
    "what", "where", "which", "how", "why", "also", "then", "there", "here", "with", "from",
    "to", "of", "do", "does", "did", "can", "will", "would", "should", "one", "some", "all",
    "note", "notes", "todo",
];

/// Normalize a display label into its stable concept key.
///
/// Strips backticks and punctuation, collapses whitespace, lowercases.
/// Returns an empty string for labels with no word content.
pub fn normalize_label(label: &str) -> String {
    let stripped = label.trim().replace('`', "");
    let cleaned = NON_WORD.replace_all(&stripped, "");
    let collapsed = WHITESPACE.replace_all(cleaned.trim(), " ");
    collapsed.to_lowercase()
}

/// Extract concept candidate labels from a span of markdown.
///
/// Returns display labels (original casing) in first-seen order,
/// de-duplicated by normalized key. Keys shorter than 3 chars and
/// stoplisted single words are dropped.
pub fn extract_candidates(text: &str) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();

    for m in HEADING.captures_iter(text) {
        let title = m[1].trim();
        if !title.is_empty() {
            candidates.push(title.to_string());
        }
    }

    for m in CAP_PHRASE.find_iter(text) {
        let phrase = m.as_str().trim();
        if phrase.len() >= 3 {
            candidates.push(phrase.to_string());
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<String> = Vec::new();
    for label in candidates {
        let label = strip_leading_stopwords(&label);
        let norm = normalize_label(label);
        if norm.len() < 3 || seen.contains(&norm) {
            continue;
        }
        if !norm.contains(' ') && STOPLIST.contains(&norm.as_str()) {
            continue;
        }
        seen.insert(norm);
        out.push(label.to_string());
    }
    out
}

/// Drop stoplisted leading words from a multi-word phrase, keeping at least
/// one word. "The Alchemists Guild" becomes "Alchemists Guild".
fn strip_leading_stopwords(label: &str) -> &str {
    let mut rest = label.trim();
    loop {
        let Some((head, tail)) = rest.split_once(char::is_whitespace) else {
            return rest;
        };
        if STOPLIST.contains(&head.to_lowercase().as_str()) {
            rest = tail.trim_start();
        } else {
            return rest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("  `Basilisk`  Venom! "), "basilisk venom");
        assert_eq!(normalize_label("Graph-Based Index"), "graph-based index");
        assert_eq!(normalize_label("???"), "");
    }

    #[test]
    fn test_extract_headings_and_phrases() {
        let text = "# Basilisk Venom\n\nThe Alchemists Guild distills it near Mirror Lake.";
        let labels = extract_candidates(text);
        assert!(labels.contains(&"Basilisk Venom".to_string()));
        // The capitalized run starts at "The"; the leading stopword is
        // stripped before the phrase becomes a concept.
        assert!(labels.contains(&"Alchemists Guild".to_string()));
        assert!(labels.contains(&"Mirror Lake".to_string()));
        assert!(!labels.iter().any(|l| normalize_label(l) == "the"));
    }

    #[test]
    fn test_first_seen_order_and_dedup() {
        let text = "# Mirror Lake\n\nMirror Lake feeds the valley. Mirror Lake freezes over.";
        let labels = extract_candidates(text);
        let count = labels
            .iter()
            .filter(|l| normalize_label(l) == "mirror lake")
            .count();
        assert_eq!(count, 1);
        assert_eq!(labels[0], "Mirror Lake");
    }

    #[test]
    fn test_stoplist_filters_sentence_starters() {
        let labels = extract_candidates("This sentence starts plainly. It goes nowhere.");
        assert!(labels.is_empty(), "got {labels:?}");
    }

    #[test]
    fn test_phrases_never_span_lines() {
        // A capitalized word at a line end must not glue onto the next
        // paragraph's opening words.
        let text = "The route skirts Mirror Lake\n\nWyvern Scales deflect most blades.";
        let labels = extract_candidates(text);
        assert!(labels.contains(&"Mirror Lake".to_string()), "got {labels:?}");
        assert!(labels.contains(&"Wyvern Scales".to_string()), "got {labels:?}");
        assert!(!labels.iter().any(|l| l.contains('\n')), "got {labels:?}");
    }

    #[test]
    fn test_deterministic() {
        let text = "# Wards\n\nRunic Wards layered over Ironwood Gates.";
        assert_eq!(extract_candidates(text), extract_candidates(text));
    }
}
