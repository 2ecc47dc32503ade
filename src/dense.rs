//! Dense retrieval: an exact in-memory cache and an optional HNSW index.
//!
//! [`DenseCache`] holds every chunk vector and scores by brute force; it is
//! the fallback and the ground truth. [`AnnIndex`] wraps a usearch HNSW
//! graph keyed by the integer chunk ids from the id map. Because the ANN
//! index cannot filter by note, callers over-fetch and filter afterwards,
//! falling back to the cache when the filtered set comes up short.
//!
//! Vectors are normalized before they reach this module, so cosine
//! similarity equals the inner product and usearch's cosine distance maps
//! to similarity as `1.0 - distance`.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};
use usearch::Index;

use crate::embedding::dot;

/// Exact dense scorer over all chunk vectors.
pub struct DenseCache {
    /// Sorted by chunk id; `notes` and `vectors` are parallel.
    ids: Vec<String>,
    notes: Vec<String>,
    vectors: Vec<Vec<f32>>,
    dim: Option<usize>,
}

impl DenseCache {
    /// Build from `(chunk_id, note_id, vector)` rows. The first non-empty
    /// vector fixes the dimension; rows with a different width are skipped.
    pub fn build(rows: Vec<(String, String, Vec<f32>)>) -> Self {
        let mut rows = rows;
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        let mut ids = Vec::with_capacity(rows.len());
        let mut notes = Vec::with_capacity(rows.len());
        let mut vectors = Vec::with_capacity(rows.len());
        let mut dim: Option<usize> = None;

        for (id, note, vec) in rows {
            if vec.is_empty() {
                continue;
            }
            match dim {
                None => dim = Some(vec.len()),
                Some(d) if d != vec.len() => continue,
                Some(_) => {}
            }
            ids.push(id);
            notes.push(note);
            vectors.push(vec);
        }

        Self { ids, notes, vectors, dim }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    /// Top `top_k` chunks by inner product, ties broken by chunk id.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        exclude_note: Option<&str>,
    ) -> Vec<(String, f32)> {
        if top_k == 0 || self.dim != Some(query.len()) {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f32)> = Vec::with_capacity(self.ids.len());
        for i in 0..self.ids.len() {
            if exclude_note == Some(self.notes[i].as_str()) {
                continue;
            }
            scored.push((i, dot(query, &self.vectors[i])));
        }
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.ids[a.0].cmp(&self.ids[b.0]))
        });
        scored.truncate(top_k);
        scored
            .into_iter()
            .map(|(i, score)| (self.ids[i].clone(), score))
            .collect()
    }
}

/// Approximate nearest-neighbor index over the same vectors.
pub struct AnnIndex {
    index: Index,
    dim: usize,
}

impl AnnIndex {
    /// Create an empty HNSW index for `dim`-wide cosine vectors.
    pub fn new(dim: usize, connectivity: usize, expansion_add: usize, expansion_search: usize) -> Result<Self> {
        let options = IndexOptions {
            dimensions: dim,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity,
            expansion_add,
            expansion_search,
            multi: false,
        };
        let index = Index::new(&options).map_err(|e| anyhow!("create ann index: {e}"))?;
        Ok(Self { index, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.index.size() == 0
    }

    /// Bulk-insert rows keyed by integer chunk id. Keys must be positive.
    pub fn add_all(&mut self, rows: &[(i64, Vec<f32>)]) -> Result<()> {
        let needed = self.index.size() + rows.len();
        if needed > self.index.capacity() {
            self.index
                .reserve(needed)
                .map_err(|e| anyhow!("reserve ann capacity: {e}"))?;
        }
        for (key, vec) in rows {
            if vec.len() != self.dim {
                continue;
            }
            self.index
                .add(*key as u64, vec)
                .map_err(|e| anyhow!("add vector {key}: {e}"))?;
        }
        Ok(())
    }

    /// Nearest neighbors as `(int_id, similarity)`, most similar first.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<(i64, f32)>> {
        if query.len() != self.dim || top_k == 0 || self.index.size() == 0 {
            return Ok(Vec::new());
        }
        let matches = self
            .index
            .search(query, top_k)
            .map_err(|e| anyhow!("ann search: {e}"))?;
        Ok(matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .map(|(key, dist)| (*key as i64, 1.0 - dist))
            .collect())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .with_context(|| format!("non-utf8 ann path {path:?}"))?;
        self.index
            .save(path_str)
            .map_err(|e| anyhow!("save ann index to {path_str}: {e}"))
    }

    /// Load a previously saved graph into a freshly configured index.
    pub fn load(
        path: &Path,
        dim: usize,
        connectivity: usize,
        expansion_add: usize,
        expansion_search: usize,
    ) -> Result<Self> {
        let ann = Self::new(dim, connectivity, expansion_add, expansion_search)?;
        let path_str = path
            .to_str()
            .with_context(|| format!("non-utf8 ann path {path:?}"))?;
        ann.index
            .load(path_str)
            .map_err(|e| anyhow!("load ann index from {path_str}: {e}"))?;
        Ok(ann)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::normalized;

    fn rows() -> Vec<(String, String, Vec<f32>)> {
        vec![
            ("a:0:5:0".into(), "a".into(), normalized(vec![1.0, 0.0, 0.0])),
            ("b:0:5:0".into(), "b".into(), normalized(vec![0.9, 0.1, 0.0])),
            ("c:0:5:0".into(), "c".into(), normalized(vec![0.0, 1.0, 0.0])),
        ]
    }

    #[test]
    fn test_cache_ranks_by_similarity() {
        let cache = DenseCache::build(rows());
        let query = normalized(vec![1.0, 0.0, 0.0]);
        let results = cache.search(&query, 2, None);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "a:0:5:0");
        assert_eq!(results[1].0, "b:0:5:0");
        assert!(results[0].1 >= results[1].1);
    }

    #[test]
    fn test_cache_excludes_note() {
        let cache = DenseCache::build(rows());
        let query = normalized(vec![1.0, 0.0, 0.0]);
        let results = cache.search(&query, 3, Some("a"));
        assert!(results.iter().all(|(id, _)| !id.starts_with("a:")));
    }

    #[test]
    fn test_cache_skips_mismatched_dims() {
        let mut r = rows();
        r.push(("d:0:5:0".into(), "d".into(), vec![1.0, 0.0]));
        let cache = DenseCache::build(r);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.dim(), Some(3));
    }

    #[test]
    fn test_cache_rejects_wrong_width_query() {
        let cache = DenseCache::build(rows());
        assert!(cache.search(&[1.0, 0.0], 5, None).is_empty());
    }

    #[test]
    fn test_ann_round_trip_search() {
        let mut ann = AnnIndex::new(3, 16, 128, 64).unwrap();
        let int_rows: Vec<(i64, Vec<f32>)> = rows()
            .into_iter()
            .enumerate()
            .map(|(i, (_, _, v))| (i as i64 + 1, v))
            .collect();
        ann.add_all(&int_rows).unwrap();
        assert_eq!(ann.len(), 3);

        let query = normalized(vec![1.0, 0.0, 0.0]);
        let hits = ann.search(&query, 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 1);
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn test_ann_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ann.usearch");

        let mut ann = AnnIndex::new(3, 16, 128, 64).unwrap();
        ann.add_all(&[(7, normalized(vec![0.2, 0.8, 0.1]))]).unwrap();
        ann.save(&path).unwrap();

        let loaded = AnnIndex::load(&path, 3, 16, 128, 64).unwrap();
        assert_eq!(loaded.len(), 1);
        let hits = loaded.search(&normalized(vec![0.2, 0.8, 0.1]), 1).unwrap();
        assert_eq!(hits[0].0, 7);
        assert!(hits[0].1 > 0.99);
    }
}
