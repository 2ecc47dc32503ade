//! Core data types shared across the indexing and retrieval pipeline.
//!
//! The durable unit is [`ChunkMeta`]: one paragraph-like span of a note,
//! with its normalized dense embedding and concept tags. Chunk ids are
//! deterministic, `"{note_id}:{start}:{end}:{block_index}"`, so
//! re-indexing unchanged text reproduces the same id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Whether a stored record is an indexable note or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    Note,
    Folder,
}

/// A note as handed to the engine by the storage layer.
///
/// The engine never mutates notes; it only reads `content` to (re)build
/// the chunk set for `id`.
#[derive(Debug, Clone)]
pub struct NoteRecord {
    pub id: String,
    pub title: String,
    pub kind: NoteKind,
    pub content: String,
}

/// A paragraph-like span of note text with exact byte offsets.
///
/// `text` is always the exact slice `&note[start..end]`, so callers can
/// map retrieval results back onto editor positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// An indexed, retrievable span of note text.
///
/// Created whole when its note is (re)indexed and never mutated in place;
/// an update replaces the entire chunk set for the note. The `dense`
/// vector is L2-normalized at indexing time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub chunk_id: String,
    pub note_id: String,
    pub block_index: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub quality: f32,
    pub dense: Vec<f32>,
    /// Normalized concept keys present in this chunk, sorted and de-duplicated.
    pub concepts: Vec<String>,
    /// Display label per concept key; first-seen label wins ties.
    pub concept_labels: BTreeMap<String, String>,
}

impl ChunkMeta {
    /// Deterministic chunk id from its note and block coordinates.
    pub fn id_for(note_id: &str, start: usize, end: usize, block_index: usize) -> String {
        format!("{note_id}:{start}:{end}:{block_index}")
    }
}

/// One retrieval query: a note, its full text, and the cursor position.
#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub note_id: String,
    pub text: String,
    /// Byte offset of the cursor within `text`; clamped by the service.
    pub cursor_offset: usize,
    /// Maximum number of snippets to return.
    pub limit: usize,
    /// Populate [`SnippetDebug`] on each result.
    pub include_debug: bool,
}

/// A retrieved excerpt, ordered by final selection rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnippet {
    pub note_id: String,
    pub chunk_id: String,
    pub text: String,
    /// Display score in `[0, 1]`, a bounded sigmoid of the combined score.
    pub score: f32,
    /// Label of the gap concept this snippet best supports, if any.
    pub concept: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<SnippetDebug>,
}

/// Scoring breakdown for one snippet, populated when `include_debug` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnippetDebug {
    pub relevance: f32,
    pub redundancy: f32,
    pub gap_support: f32,
    pub lexical_overlap: f32,
    pub active_overlap: f32,
    pub gap_overlap: f32,
    pub quality: f32,
    pub base: f32,
    pub reranker_raw: Option<f32>,
    pub reranker_norm: Option<f32>,
    pub combined: f32,
    pub gap_concept_id: Option<String>,
    pub mentions_gap: bool,
}

/// Outcome of [`ContextService::warmup`](crate::service::ContextService::warmup).
#[derive(Debug, Clone, Serialize)]
pub struct WarmupReport {
    pub embedder_model: String,
    pub reranker_enabled: bool,
    pub reranker_model: Option<String>,
    pub chunk_count: usize,
}

/// Index-level statistics, mainly for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub chunk_count: usize,
    pub note_count: usize,
    pub concept_count: usize,
    pub embedding_dim: Option<usize>,
}
