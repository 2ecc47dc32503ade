//! Durable chunk index and its derived retrieval structures.
//!
//! The source of truth is the chunk table plus the integer id map, both
//! persisted as one JSON document. Everything else (BM25 postings, the
//! dense cache, the ANN graph, concept postings, per-note prefix sums) is
//! derived and rebuilt lazily: mutations only mark the index dirty, and
//! [`ContextIndex::ensure_ready`] rebuilds before the next read.
//!
//! The id map is a bijection between string chunk ids and positive `i64`
//! keys (the ANN index wants integers). `0` and `-1` are never assigned.
//! On load the map is repaired rather than regenerated, so surviving
//! chunks keep their keys and an intact ANN artifact stays usable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ContextConfig;
use crate::dense::{AnnIndex, DenseCache};
use crate::embedding::{dot, normalized};
use crate::lexical::{Bm25Doc, Bm25Index};
use crate::models::{ChunkMeta, IndexStats};

/// On-disk shape of the metadata file.
#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedIndex {
    chunks: BTreeMap<String, ChunkMeta>,
    chunk_to_int: BTreeMap<String, i64>,
    int_to_chunk: BTreeMap<i64, String>,
    concept_labels: BTreeMap<String, String>,
}

pub struct ContextIndex {
    cfg: ContextConfig,

    chunks: BTreeMap<String, ChunkMeta>,
    chunk_to_int: BTreeMap<String, i64>,
    int_to_chunk: BTreeMap<i64, String>,
    concept_labels: BTreeMap<String, String>,

    // Derived; valid only when `dirty` is false.
    concept_chunks: HashMap<String, BTreeSet<String>>,
    bm25: Option<Bm25Index>,
    dense: Option<DenseCache>,
    ann: Option<AnnIndex>,
    prefix: HashMap<String, PrefixSums>,
    centroids: RwLock<HashMap<String, Option<Vec<f32>>>>,

    dirty: bool,
    ann_dirty: bool,
}

/// Cumulative embedding sums for one note, ordered by block index.
///
/// `sums[i]` is the unnormalized sum of the first `i` chunk vectors, so a
/// prefix embedding is one lookup plus a normalize.
struct PrefixSums {
    block_indices: Vec<usize>,
    sums: Vec<Vec<f32>>,
}

impl ContextIndex {
    /// Open the index at the configured storage dir. A missing metadata
    /// file yields a fresh empty index; a corrupt one is an error.
    pub fn open(cfg: ContextConfig) -> Result<Self> {
        let meta_path = cfg.storage.metadata_path();
        let persisted = if meta_path.exists() {
            let raw = std::fs::read_to_string(&meta_path)
                .with_context(|| format!("read index metadata {}", meta_path.display()))?;
            serde_json::from_str::<PersistedIndex>(&raw)
                .with_context(|| format!("parse index metadata {}", meta_path.display()))?
        } else {
            PersistedIndex::default()
        };

        let mut index = Self {
            cfg,
            chunks: persisted.chunks,
            chunk_to_int: persisted.chunk_to_int,
            int_to_chunk: persisted.int_to_chunk,
            concept_labels: persisted.concept_labels,
            concept_chunks: HashMap::new(),
            bm25: None,
            dense: None,
            ann: None,
            prefix: HashMap::new(),
            centroids: RwLock::new(HashMap::new()),
            dirty: true,
            ann_dirty: true,
        };

        let repaired = index.repair_chunk_id_mapping();
        if repaired {
            index.persist()?;
        }

        // Reuse the saved ANN graph only when the id map survived intact.
        if index.cfg.ann.enabled && !repaired {
            if let Some(dim) = index.embedding_dim() {
                let ann_path = index.cfg.storage.ann_path();
                if ann_path.exists() {
                    match AnnIndex::load(
                        &ann_path,
                        dim,
                        index.cfg.ann.connectivity,
                        index.cfg.ann.expansion_add,
                        index.cfg.ann.expansion_search,
                    ) {
                        Ok(ann) => {
                            debug!(vectors = ann.len(), "loaded ann artifact");
                            index.ann = Some(ann);
                            index.ann_dirty = false;
                        }
                        Err(err) => {
                            warn!(error = %err, "discarding unreadable ann artifact");
                        }
                    }
                }
            }
        }

        Ok(index)
    }

    /// Replace the chunk set of one note and persist.
    pub fn update_note(&mut self, note_id: &str, chunks: Vec<ChunkMeta>) -> Result<()> {
        self.remove_note_chunks(note_id);
        for chunk in chunks {
            self.ensure_chunk_int(&chunk.chunk_id);
            for (key, label) in &chunk.concept_labels {
                self.concept_labels
                    .entry(key.clone())
                    .or_insert_with(|| label.clone());
            }
            self.chunks.insert(chunk.chunk_id.clone(), chunk);
        }
        self.mark_dirty();
        self.persist()
    }

    /// Remove every chunk belonging to the given notes and persist.
    pub fn delete_notes(&mut self, note_ids: &[String]) -> Result<()> {
        for note_id in note_ids {
            self.remove_note_chunks(note_id);
        }
        self.mark_dirty();
        self.persist()
    }

    /// Drop all state, on disk included.
    pub fn clear(&mut self) -> Result<()> {
        self.chunks.clear();
        self.chunk_to_int.clear();
        self.int_to_chunk.clear();
        self.concept_labels.clear();
        self.mark_dirty();
        let ann_path = self.cfg.storage.ann_path();
        if ann_path.exists() {
            std::fs::remove_file(&ann_path)
                .with_context(|| format!("remove ann artifact {}", ann_path.display()))?;
        }
        self.persist()
    }

    /// Rebuild every derived structure if anything changed since the last
    /// call. Cheap when clean.
    pub fn ensure_ready(&mut self) -> Result<()> {
        if !self.dirty && !self.ann_dirty {
            return Ok(());
        }

        if self.dirty {
            self.rebuild_concept_postings();
            self.rebuild_bm25();
            self.rebuild_dense_cache();
            self.rebuild_prefix_sums();
            self.centroids
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            self.dirty = false;
        }

        if self.ann_dirty {
            self.rebuild_ann()?;
            self.ann_dirty = false;
        }
        Ok(())
    }

    pub fn chunk(&self, chunk_id: &str) -> Option<&ChunkMeta> {
        self.chunks.get(chunk_id)
    }

    pub fn concept_label(&self, key: &str) -> Option<&str> {
        self.concept_labels.get(key).map(String::as_str)
    }

    /// Embedding width, taken from the first stored chunk with a vector.
    pub fn embedding_dim(&self) -> Option<usize> {
        self.chunks
            .values()
            .find(|c| !c.dense.is_empty())
            .map(|c| c.dense.len())
    }

    pub fn stats(&self) -> IndexStats {
        let notes: BTreeSet<&str> = self.chunks.values().map(|c| c.note_id.as_str()).collect();
        IndexStats {
            chunk_count: self.chunks.len(),
            note_count: notes.len(),
            concept_count: self.concept_labels.len(),
            embedding_dim: self.embedding_dim(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    // --- retrieval, valid after ensure_ready ---

    pub fn bm25_search(
        &self,
        query: &str,
        top_k: usize,
        exclude_note: Option<&str>,
    ) -> Vec<(String, f32)> {
        self.bm25
            .as_ref()
            .map(|b| b.search(query, top_k, exclude_note))
            .unwrap_or_default()
    }

    pub fn bm25_idf(&self, token: &str) -> f32 {
        self.bm25.as_ref().map_or(0.0, |b| b.idf(token))
    }

    /// Dense neighbors of `query`, ANN-first with an exact fallback.
    ///
    /// The ANN index cannot filter by note, so it is over-fetched and
    /// post-filtered; when the filtered set still comes up short the exact
    /// cache answers instead.
    pub fn dense_search(
        &self,
        query: &[f32],
        top_k: usize,
        exclude_note: Option<&str>,
    ) -> Vec<(String, f32)> {
        if top_k == 0 {
            return Vec::new();
        }
        if let Some(ann) = &self.ann {
            let fetch = top_k.saturating_mul(3).max(top_k);
            match ann.search(query, fetch) {
                Ok(hits) => {
                    let mut out: Vec<(String, f32)> = Vec::with_capacity(top_k);
                    for (int_id, score) in hits {
                        let Some(chunk_id) = self.int_to_chunk.get(&int_id) else {
                            continue;
                        };
                        let Some(chunk) = self.chunks.get(chunk_id) else {
                            continue;
                        };
                        if exclude_note == Some(chunk.note_id.as_str()) {
                            continue;
                        }
                        out.push((chunk_id.clone(), score));
                        if out.len() == top_k {
                            break;
                        }
                    }
                    if out.len() == top_k || out.len() == self.chunks.len() {
                        return out;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "ann search failed, using exact scan");
                }
            }
        }
        self.dense
            .as_ref()
            .map(|d| d.search(query, top_k, exclude_note))
            .unwrap_or_default()
    }

    /// All chunks tagged with any of the given concept keys.
    pub fn chunks_for_concepts<'a, I>(&self, keys: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = BTreeSet::new();
        for key in keys {
            if let Some(chunks) = self.concept_chunks.get(key) {
                out.extend(chunks.iter().cloned());
            }
        }
        out
    }

    pub fn concept_members(&self, key: &str) -> usize {
        self.concept_chunks.get(key).map_or(0, BTreeSet::len)
    }

    /// The indexed chunk at a given block position of a note, if any.
    pub fn note_block_chunk(&self, note_id: &str, block_index: usize) -> Option<&ChunkMeta> {
        self.chunks
            .values()
            .find(|c| c.note_id == note_id && c.block_index == block_index)
    }

    /// Normalized mean embedding of the note's blocks before `block_index`,
    /// or `None` when nothing precedes the cursor.
    pub fn prefix_embedding(&self, note_id: &str, block_index: usize) -> Option<Vec<f32>> {
        let sums = self.prefix.get(note_id)?;
        let pos = sums.block_indices.partition_point(|&b| b < block_index);
        if pos == 0 {
            return None;
        }
        let sum = sums.sums[pos].clone();
        let vec = normalized(sum);
        if vec.iter().all(|v| *v == 0.0) {
            None
        } else {
            Some(vec)
        }
    }

    /// Centroid of a concept's member chunk embeddings, memoized until the
    /// next rebuild.
    ///
    /// Small concepts use the plain mean. Larger ones use the densest
    /// cluster among up to 60 sampled members, so one off-topic mention
    /// cannot drag the centroid away from the dominant sense.
    pub fn concept_centroid(&self, key: &str) -> Option<Vec<f32>> {
        if let Some(memo) = self
            .centroids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return memo.clone();
        }
        let centroid = self.compute_centroid(key);
        self.centroids
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), centroid.clone());
        centroid
    }

    fn compute_centroid(&self, key: &str) -> Option<Vec<f32>> {
        let members = self.concept_chunks.get(key)?;
        let vectors: Vec<&Vec<f32>> = members
            .iter()
            .filter_map(|id| self.chunks.get(id))
            .filter(|c| !c.dense.is_empty())
            .map(|c| &c.dense)
            .take(60)
            .collect();
        if vectors.is_empty() {
            return None;
        }
        if vectors.len() <= 3 {
            return Some(mean_normalized(&vectors));
        }

        // Densest cluster: seed with the member closest to everyone else,
        // then average the seed with its nine nearest members.
        let n = vectors.len();
        let mut sims = vec![vec![0.0f32; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let s = dot(vectors[i], vectors[j]);
                sims[i][j] = s;
                sims[j][i] = s;
            }
        }
        let mut seed = 0;
        let mut best_avg = f32::MIN;
        for (i, row) in sims.iter().enumerate() {
            let avg = row.iter().sum::<f32>() / (n as f32 - 1.0);
            if avg > best_avg {
                best_avg = avg;
                seed = i;
            }
        }
        let mut neighbors: Vec<usize> = (0..n).filter(|&j| j != seed).collect();
        neighbors.sort_by(|&a, &b| {
            sims[seed][b]
                .partial_cmp(&sims[seed][a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(&b))
        });
        let mut cluster: Vec<&Vec<f32>> = vec![vectors[seed]];
        cluster.extend(neighbors.into_iter().take(9).map(|j| vectors[j]));
        Some(mean_normalized(&cluster))
    }

    // --- internals ---

    fn remove_note_chunks(&mut self, note_id: &str) {
        let doomed: Vec<String> = self
            .chunks
            .values()
            .filter(|c| c.note_id == note_id)
            .map(|c| c.chunk_id.clone())
            .collect();
        for chunk_id in doomed {
            self.chunks.remove(&chunk_id);
            if let Some(int_id) = self.chunk_to_int.remove(&chunk_id) {
                self.int_to_chunk.remove(&int_id);
            }
        }
    }

    /// Assign an integer key to a chunk id if it has none. Keys start at 1
    /// and only grow; 0 and -1 stay reserved.
    fn ensure_chunk_int(&mut self, chunk_id: &str) -> i64 {
        if let Some(existing) = self.chunk_to_int.get(chunk_id) {
            return *existing;
        }
        let next = self
            .int_to_chunk
            .keys()
            .next_back()
            .map_or(1, |max| max + 1)
            .max(1);
        self.chunk_to_int.insert(chunk_id.to_string(), next);
        self.int_to_chunk.insert(next, chunk_id.to_string());
        next
    }

    /// Restore the id map to a bijection over the current chunk set.
    ///
    /// Keeps every entry that is positive, unique, reverse-consistent, and
    /// points at a live chunk; assigns fresh keys to chunks left without
    /// one. Returns whether anything changed. Running it twice is a no-op.
    fn repair_chunk_id_mapping(&mut self) -> bool {
        let mut kept_forward: BTreeMap<String, i64> = BTreeMap::new();
        let mut kept_reverse: BTreeMap<i64, String> = BTreeMap::new();

        for (chunk_id, &int_id) in &self.chunk_to_int {
            if int_id <= 0 {
                continue;
            }
            if !self.chunks.contains_key(chunk_id) {
                continue;
            }
            if kept_reverse.contains_key(&int_id) {
                continue;
            }
            if self.int_to_chunk.get(&int_id).map(String::as_str) != Some(chunk_id.as_str()) {
                continue;
            }
            kept_forward.insert(chunk_id.clone(), int_id);
            kept_reverse.insert(int_id, chunk_id.clone());
        }

        let mut next = kept_reverse.keys().next_back().map_or(1, |max| max + 1);
        for chunk_id in self.chunks.keys() {
            if !kept_forward.contains_key(chunk_id) {
                kept_forward.insert(chunk_id.clone(), next);
                kept_reverse.insert(next, chunk_id.clone());
                next += 1;
            }
        }

        let changed = kept_forward != self.chunk_to_int || kept_reverse != self.int_to_chunk;
        if changed {
            debug!(chunks = self.chunks.len(), "repaired chunk id mapping");
            self.chunk_to_int = kept_forward;
            self.int_to_chunk = kept_reverse;
        }
        changed
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.ann_dirty = true;
    }

    fn rebuild_concept_postings(&mut self) {
        let mut postings: HashMap<String, BTreeSet<String>> = HashMap::new();
        for chunk in self.chunks.values() {
            for key in &chunk.concepts {
                postings
                    .entry(key.clone())
                    .or_default()
                    .insert(chunk.chunk_id.clone());
            }
        }
        self.concept_chunks = postings;
    }

    fn rebuild_bm25(&mut self) {
        let docs: Vec<Bm25Doc<'_>> = self
            .chunks
            .values()
            .map(|c| Bm25Doc {
                chunk_id: &c.chunk_id,
                note_id: &c.note_id,
                text: &c.text,
            })
            .collect();
        self.bm25 = Some(Bm25Index::build(&docs, self.cfg.bm25.k1, self.cfg.bm25.b));
    }

    fn rebuild_dense_cache(&mut self) {
        let rows: Vec<(String, String, Vec<f32>)> = self
            .chunks
            .values()
            .filter(|c| !c.dense.is_empty())
            .map(|c| (c.chunk_id.clone(), c.note_id.clone(), c.dense.clone()))
            .collect();
        self.dense = Some(DenseCache::build(rows));
    }

    fn rebuild_ann(&mut self) -> Result<()> {
        self.ann = None;
        if !self.cfg.ann.enabled {
            return Ok(());
        }
        let Some(dim) = self.embedding_dim() else {
            return Ok(());
        };

        let mut ann = AnnIndex::new(
            dim,
            self.cfg.ann.connectivity,
            self.cfg.ann.expansion_add,
            self.cfg.ann.expansion_search,
        )?;
        let rows: Vec<(i64, Vec<f32>)> = self
            .chunks
            .values()
            .filter(|c| c.dense.len() == dim)
            .filter_map(|c| {
                self.chunk_to_int
                    .get(&c.chunk_id)
                    .map(|&int_id| (int_id, c.dense.clone()))
            })
            .collect();
        ann.add_all(&rows)?;

        if let Err(err) = ann.save(&self.cfg.storage.ann_path()) {
            // The graph stays usable in memory; only the warm restart is lost.
            warn!(error = %err, "failed to save ann artifact");
        }
        debug!(vectors = ann.len(), "rebuilt ann index");
        self.ann = Some(ann);
        Ok(())
    }

    fn rebuild_prefix_sums(&mut self) {
        let mut by_note: HashMap<String, Vec<(usize, &Vec<f32>)>> = HashMap::new();
        for chunk in self.chunks.values() {
            if chunk.dense.is_empty() {
                continue;
            }
            by_note
                .entry(chunk.note_id.clone())
                .or_default()
                .push((chunk.block_index, &chunk.dense));
        }

        let mut prefix = HashMap::with_capacity(by_note.len());
        for (note_id, mut blocks) in by_note {
            blocks.sort_by_key(|(idx, _)| *idx);
            let dim = blocks[0].1.len();
            let mut sums: Vec<Vec<f32>> = Vec::with_capacity(blocks.len() + 1);
            sums.push(vec![0.0; dim]);
            let mut block_indices = Vec::with_capacity(blocks.len());
            for (idx, vec) in blocks {
                if vec.len() != dim {
                    continue;
                }
                let mut next = sums.last().cloned().unwrap_or_else(|| vec![0.0; dim]);
                for (acc, v) in next.iter_mut().zip(vec.iter()) {
                    *acc += v;
                }
                sums.push(next);
                block_indices.push(idx);
            }
            prefix.insert(note_id, PrefixSums { block_indices, sums });
        }
        self.prefix = prefix;
    }

    fn persist(&self) -> Result<()> {
        let dir = &self.cfg.storage.dir;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create storage dir {}", dir.display()))?;
        let persisted = PersistedIndex {
            chunks: self.chunks.clone(),
            chunk_to_int: self.chunk_to_int.clone(),
            int_to_chunk: self.int_to_chunk.clone(),
            concept_labels: self.concept_labels.clone(),
        };
        let json = serde_json::to_string(&persisted).context("serialize index metadata")?;
        let path = self.cfg.storage.metadata_path();
        write_atomic(&path, json.as_bytes())
            .with_context(|| format!("write index metadata {}", path.display()))
    }
}

/// Write via a sibling temp file and rename, so a crash mid-write never
/// leaves a truncated metadata file behind.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn mean_normalized(vectors: &[&Vec<f32>]) -> Vec<f32> {
    let dim = vectors[0].len();
    let mut mean = vec![0.0f32; dim];
    for vec in vectors {
        for (acc, v) in mean.iter_mut().zip(vec.iter()) {
            *acc += v;
        }
    }
    let count = vectors.len() as f32;
    for v in mean.iter_mut() {
        *v /= count;
    }
    normalized(mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::normalized;
    use std::path::PathBuf;

    fn test_config(dir: &Path) -> ContextConfig {
        let mut cfg = ContextConfig::default();
        cfg.storage.dir = PathBuf::from(dir);
        cfg
    }

    fn chunk(note: &str, block: usize, text: &str, dense: Vec<f32>, concepts: &[&str]) -> ChunkMeta {
        let start = block * 100;
        let end = start + text.len();
        ChunkMeta {
            chunk_id: ChunkMeta::id_for(note, start, end, block),
            note_id: note.to_string(),
            block_index: block,
            start,
            end,
            text: text.to_string(),
            quality: 0.8,
            dense: normalized(dense),
            concepts: concepts.iter().map(|s| s.to_string()).collect(),
            concept_labels: concepts
                .iter()
                .map(|s| (s.to_string(), s.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_update_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContextIndex::open(test_config(dir.path())).unwrap();
        index
            .update_note(
                "n1",
                vec![
                    chunk("n1", 0, "basilisk venom antidote", vec![1.0, 0.0, 0.0], &["basilisk venom"]),
                    chunk("n1", 1, "mirror lake in winter", vec![0.0, 1.0, 0.0], &["mirror lake"]),
                ],
            )
            .unwrap();
        index.ensure_ready().unwrap();

        let hits = index.bm25_search("venom", 10, None);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].0.starts_with("n1:"));

        let dense = index.dense_search(&normalized(vec![1.0, 0.0, 0.0]), 1, None);
        assert_eq!(dense.len(), 1);
        assert_eq!(dense[0].0, hits[0].0);

        let members = index.chunks_for_concepts(["mirror lake"]);
        assert_eq!(members.len(), 1);
    }

    #[test]
    fn test_update_replaces_note_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContextIndex::open(test_config(dir.path())).unwrap();
        index
            .update_note("n1", vec![chunk("n1", 0, "old text", vec![1.0, 0.0], &[])])
            .unwrap();
        index
            .update_note("n1", vec![chunk("n1", 0, "new text", vec![0.0, 1.0], &[])])
            .unwrap();
        index.ensure_ready().unwrap();

        assert_eq!(index.stats().chunk_count, 1);
        assert!(index.bm25_search("old", 10, None).is_empty());
        assert_eq!(index.bm25_search("new", 10, None).len(), 1);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut index = ContextIndex::open(test_config(dir.path())).unwrap();
            index
                .update_note(
                    "n1",
                    vec![chunk("n1", 0, "runic wards", vec![0.5, 0.5, 0.0], &["runic wards"])],
                )
                .unwrap();
            index.ensure_ready().unwrap();
        }
        let mut reopened = ContextIndex::open(test_config(dir.path())).unwrap();
        reopened.ensure_ready().unwrap();
        assert_eq!(reopened.stats().chunk_count, 1);
        assert_eq!(reopened.concept_label("runic wards"), Some("runic wards"));
        assert_eq!(reopened.bm25_search("runic", 10, None).len(), 1);
    }

    #[test]
    fn test_corrupt_metadata_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        std::fs::create_dir_all(&cfg.storage.dir).unwrap();
        std::fs::write(cfg.storage.metadata_path(), b"{ not json").unwrap();
        assert!(ContextIndex::open(cfg).is_err());
    }

    #[test]
    fn test_id_map_repair_assigns_missing_and_drops_stale() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let c = chunk("n1", 0, "text", vec![1.0, 0.0], &[]);
        let mut persisted = PersistedIndex::default();
        persisted.chunks.insert(c.chunk_id.clone(), c.clone());
        // Stale entry for a chunk that no longer exists, plus a reserved key.
        persisted.chunk_to_int.insert("gone:0:4:0".into(), 5);
        persisted.int_to_chunk.insert(5, "gone:0:4:0".into());
        persisted.chunk_to_int.insert("bad:0:4:0".into(), 0);
        std::fs::create_dir_all(&cfg.storage.dir).unwrap();
        std::fs::write(
            cfg.storage.metadata_path(),
            serde_json::to_string(&persisted).unwrap(),
        )
        .unwrap();

        let index = ContextIndex::open(cfg).unwrap();
        assert_eq!(index.chunk_to_int.len(), 1);
        assert_eq!(index.int_to_chunk.len(), 1);
        let int_id = index.chunk_to_int[&c.chunk_id];
        assert!(int_id > 0);
        assert_eq!(index.int_to_chunk[&int_id], c.chunk_id);
    }

    #[test]
    fn test_id_map_repair_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContextIndex::open(test_config(dir.path())).unwrap();
        index
            .update_note("n1", vec![chunk("n1", 0, "text", vec![1.0, 0.0], &[])])
            .unwrap();
        assert!(!index.repair_chunk_id_mapping());
        assert!(!index.repair_chunk_id_mapping());
    }

    #[test]
    fn test_int_ids_never_reuse_zero_or_negative() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContextIndex::open(test_config(dir.path())).unwrap();
        for i in 0..5 {
            index
                .update_note(
                    &format!("n{i}"),
                    vec![chunk(&format!("n{i}"), 0, "text", vec![1.0, 0.0], &[])],
                )
                .unwrap();
        }
        assert!(index.int_to_chunk.keys().all(|&k| k > 0));
        assert_eq!(index.chunk_to_int.len(), index.int_to_chunk.len());
    }

    #[test]
    fn test_prefix_embedding_covers_blocks_before_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContextIndex::open(test_config(dir.path())).unwrap();
        index
            .update_note(
                "n1",
                vec![
                    chunk("n1", 0, "a", vec![1.0, 0.0], &[]),
                    chunk("n1", 1, "b", vec![0.0, 1.0], &[]),
                    chunk("n1", 2, "c", vec![-1.0, 0.0], &[]),
                ],
            )
            .unwrap();
        index.ensure_ready().unwrap();

        // Nothing before block 0.
        assert!(index.prefix_embedding("n1", 0).is_none());

        // Before block 1: only the first vector.
        let p1 = index.prefix_embedding("n1", 1).unwrap();
        assert!((dot(&p1, &[1.0, 0.0]) - 1.0).abs() < 1e-5);

        // Before block 2: mean of the first two, normalized.
        let p2 = index.prefix_embedding("n1", 2).unwrap();
        let expected = normalized(vec![1.0, 1.0]);
        assert!((dot(&p2, &expected) - 1.0).abs() < 1e-5);

        // Before block 3: first and third cancel, leaving the second.
        let p3 = index.prefix_embedding("n1", 3).unwrap();
        assert!((dot(&p3, &[0.0, 1.0]) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_centroid_small_concept_is_mean() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContextIndex::open(test_config(dir.path())).unwrap();
        index
            .update_note(
                "n1",
                vec![
                    chunk("n1", 0, "x", vec![1.0, 0.0], &["wards"]),
                    chunk("n1", 1, "y", vec![0.0, 1.0], &["wards"]),
                ],
            )
            .unwrap();
        index.ensure_ready().unwrap();

        let centroid = index.concept_centroid("wards").unwrap();
        let expected = normalized(vec![0.5, 0.5]);
        assert!((dot(&centroid, &expected) - 1.0).abs() < 1e-5);
        // Memoized value is identical.
        assert_eq!(index.concept_centroid("wards").unwrap(), centroid);
    }

    #[test]
    fn test_centroid_ignores_outlier_in_large_concept() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContextIndex::open(test_config(dir.path())).unwrap();
        let mut chunks = Vec::new();
        for i in 0..14 {
            // Tight cluster around (1, 0, 0) with tiny deterministic jitter.
            let jitter = (i as f32) * 0.01;
            chunks.push(chunk(
                "n1",
                i,
                &format!("member {i}"),
                vec![1.0, jitter, 0.0],
                &["cluster"],
            ));
        }
        chunks.push(chunk("n1", 14, "outlier", vec![0.0, 0.0, 1.0], &["cluster"]));
        index.update_note("n1", chunks).unwrap();
        index.ensure_ready().unwrap();

        let centroid = index.concept_centroid("cluster").unwrap();
        assert!(centroid[0] > 0.98);
        assert!(centroid[2] < 0.05);
    }

    #[test]
    fn test_centroid_cluster_caps_at_ten_members() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContextIndex::open(test_config(dir.path())).unwrap();
        // Ten identical members plus one orthogonal straggler. The cluster
        // is the seed and its nine nearest, so the straggler contributes
        // exactly nothing to the centroid.
        let mut chunks: Vec<ChunkMeta> = (0..10)
            .map(|i| chunk("n1", i, &format!("member {i}"), vec![1.0, 0.0, 0.0], &["cluster"]))
            .collect();
        chunks.push(chunk("n1", 10, "straggler", vec![0.0, 0.0, 1.0], &["cluster"]));
        index.update_note("n1", chunks).unwrap();
        index.ensure_ready().unwrap();

        let centroid = index.concept_centroid("cluster").unwrap();
        assert!(centroid[0] > 0.999);
        assert!(centroid[2].abs() < 1e-6);
    }

    #[test]
    fn test_clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContextIndex::open(test_config(dir.path())).unwrap();
        index
            .update_note("n1", vec![chunk("n1", 0, "text", vec![1.0, 0.0], &[])])
            .unwrap();
        index.ensure_ready().unwrap();
        index.clear().unwrap();
        index.ensure_ready().unwrap();

        assert!(index.is_empty());
        let reopened = ContextIndex::open(test_config(dir.path())).unwrap();
        assert!(reopened.is_empty());
    }
}
