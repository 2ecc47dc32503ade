//! BM25 inverted index over chunk text.
//!
//! Rebuilt wholesale from the chunk table whenever the index is dirty;
//! there is no incremental posting maintenance. Postings are kept sorted
//! by chunk id so scoring walks them deterministically, and score ties
//! break on chunk id ascending.

use std::collections::HashMap;

use std::sync::LazyLock;

use regex::Regex;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9_'-]{2,}").unwrap());

/// Lowercase and split into index tokens. Tokens are at least two chars of
/// `[a-z0-9_'-]`; everything else is a separator.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    TOKEN
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// One indexed document, as handed to [`Bm25Index::build`].
pub struct Bm25Doc<'a> {
    pub chunk_id: &'a str,
    pub note_id: &'a str,
    pub text: &'a str,
}

/// In-memory BM25 index.
pub struct Bm25Index {
    /// token -> postings sorted by chunk id, each `(chunk_id, term_freq)`.
    postings: HashMap<String, Vec<(String, u32)>>,
    doc_len: HashMap<String, u32>,
    doc_note: HashMap<String, String>,
    avgdl: f32,
    doc_count: usize,
    k1: f32,
    b: f32,
}

impl Bm25Index {
    /// Build the index from scratch over the given documents.
    pub fn build(docs: &[Bm25Doc<'_>], k1: f32, b: f32) -> Self {
        let mut postings: HashMap<String, Vec<(String, u32)>> = HashMap::new();
        let mut doc_len: HashMap<String, u32> = HashMap::new();
        let mut doc_note: HashMap<String, String> = HashMap::new();
        let mut total_len: u64 = 0;

        for doc in docs {
            let tokens = tokenize(doc.text);
            total_len += tokens.len() as u64;
            doc_len.insert(doc.chunk_id.to_string(), tokens.len() as u32);
            doc_note.insert(doc.chunk_id.to_string(), doc.note_id.to_string());

            let mut tf: HashMap<&str, u32> = HashMap::new();
            for token in &tokens {
                *tf.entry(token.as_str()).or_insert(0) += 1;
            }
            for (token, freq) in tf {
                postings
                    .entry(token.to_string())
                    .or_default()
                    .push((doc.chunk_id.to_string(), freq));
            }
        }

        for list in postings.values_mut() {
            list.sort_by(|a, b| a.0.cmp(&b.0));
        }

        let doc_count = docs.len();
        let avgdl = if doc_count > 0 {
            total_len as f32 / doc_count as f32
        } else {
            0.0
        };

        Self {
            postings,
            doc_len,
            doc_note,
            avgdl,
            doc_count,
            k1,
            b,
        }
    }

    pub fn doc_count(&self) -> usize {
        self.doc_count
    }

    /// Number of documents containing `token`.
    pub fn doc_freq(&self, token: &str) -> usize {
        self.postings.get(token).map_or(0, |p| p.len())
    }

    /// Smoothed inverse document frequency, always positive.
    pub fn idf(&self, token: &str) -> f32 {
        let n = self.doc_count as f32;
        let df = self.doc_freq(token) as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Top `top_k` chunks for `query`, highest score first, ties broken by
    /// chunk id ascending. `exclude_note` filters a whole note out of the
    /// result set.
    pub fn search(&self, query: &str, top_k: usize, exclude_note: Option<&str>) -> Vec<(String, f32)> {
        if self.doc_count == 0 || top_k == 0 {
            return Vec::new();
        }
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut scores: HashMap<&str, f32> = HashMap::new();
        for token in &tokens {
            let Some(list) = self.postings.get(token) else {
                continue;
            };
            let idf = self.idf(token);
            for (chunk_id, tf) in list {
                if let Some(excluded) = exclude_note {
                    if self.doc_note.get(chunk_id).map(String::as_str) == Some(excluded) {
                        continue;
                    }
                }
                let dl = *self.doc_len.get(chunk_id).unwrap_or(&0) as f32;
                let tf = *tf as f32;
                let denom = tf + self.k1 * (1.0 - self.b + self.b * dl / self.avgdl.max(1e-6));
                let contribution = idf * tf * (self.k1 + 1.0) / denom;
                *scores.entry(chunk_id.as_str()).or_insert(0.0) += contribution;
            }
        }

        let mut ranked: Vec<(String, f32)> = scores
            .into_iter()
            .map(|(id, score)| (id.to_string(), score))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(top_k);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> Bm25Index {
        let docs = vec![
            Bm25Doc {
                chunk_id: "a:0:10:0",
                note_id: "a",
                text: "basilisk venom is distilled by the alchemists guild",
            },
            Bm25Doc {
                chunk_id: "b:0:10:0",
                note_id: "b",
                text: "the guild charter forbids venom trade on market days",
            },
            Bm25Doc {
                chunk_id: "c:0:10:0",
                note_id: "c",
                text: "mirror lake freezes over in deep winter",
            },
        ];
        Bm25Index::build(&docs, 1.2, 0.75)
    }

    #[test]
    fn test_tokenize_basics() {
        assert_eq!(tokenize("Basilisk venom!"), vec!["basilisk", "venom"]);
        assert_eq!(tokenize("a b"), Vec::<String>::new());
        assert_eq!(tokenize("it's self-made"), vec!["it's", "self-made"]);
    }

    #[test]
    fn test_idf_positive_even_when_ubiquitous() {
        let docs = vec![
            Bm25Doc { chunk_id: "x", note_id: "n", text: "venom venom" },
            Bm25Doc { chunk_id: "y", note_id: "n", text: "venom" },
        ];
        let index = Bm25Index::build(&docs, 1.2, 0.75);
        assert!(index.idf("venom") > 0.0);
    }

    #[test]
    fn test_search_ranks_matching_docs() {
        let index = sample_index();
        let results = index.search("basilisk venom", 10, None);
        assert!(!results.is_empty());
        assert_eq!(results[0].0, "a:0:10:0");
        assert!(!results.iter().any(|(id, _)| id.starts_with("c:")));
    }

    #[test]
    fn test_search_excludes_note() {
        let index = sample_index();
        let results = index.search("venom", 10, Some("a"));
        assert!(results.iter().all(|(id, _)| !id.starts_with("a:")));
        assert!(results.iter().any(|(id, _)| id.starts_with("b:")));
    }

    #[test]
    fn test_empty_query_and_empty_index() {
        let index = sample_index();
        assert!(index.search("", 10, None).is_empty());
        let empty = Bm25Index::build(&[], 1.2, 0.75);
        assert!(empty.search("venom", 10, None).is_empty());
    }

    #[test]
    fn test_score_monotonic_in_term_frequency() {
        // Same length, one extra occurrence of the query term.
        let docs = vec![
            Bm25Doc { chunk_id: "one", note_id: "n1", text: "ward stone circle granite dust" },
            Bm25Doc { chunk_id: "two", note_id: "n2", text: "ward ward circle granite dust" },
        ];
        let index = Bm25Index::build(&docs, 1.2, 0.75);
        let results = index.search("ward", 10, None);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "two");
        assert!(results[0].1 > results[1].1);
    }

    #[test]
    fn test_deterministic_tie_break_on_chunk_id() {
        let docs = vec![
            Bm25Doc { chunk_id: "n2:0:5:0", note_id: "n2", text: "ward stone" },
            Bm25Doc { chunk_id: "n1:0:5:0", note_id: "n1", text: "ward stone" },
        ];
        let index = Bm25Index::build(&docs, 1.2, 0.75);
        let results = index.search("ward", 10, None);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "n1:0:5:0");
        assert_eq!(results[1].0, "n2:0:5:0");
    }
}
