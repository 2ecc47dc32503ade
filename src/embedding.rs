//! Embedding and reranker provider traits, plus vector math helpers.
//!
//! The engine consumes inference through two narrow seams so it stays
//! portable across backends: [`Embedder`] maps text to a fixed-width
//! vector, [`Reranker`] scores query/document pairs. Neither is
//! implemented here; the application wires in concrete providers.
//!
//! All stored vectors are L2-normalized at the boundary, so inner product
//! and cosine similarity coincide everywhere downstream.

use anyhow::Result;

/// Text-to-vector provider.
///
/// Implementations must be deterministic for identical input, and
/// `dims()` must be stable for the lifetime of a corpus version; the
/// index detects a dimension change and clears itself rather than mixing
/// vector spaces.
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"bge-small-en-v1.5"`).
    fn model_name(&self) -> &str;
    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed one text. The engine normalizes the result itself.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Optional cross-encoder reranker.
///
/// Returns one raw score per document on any scale; the service min-max
/// normalizes locally. Returning a score count that differs from the
/// document count is a contract violation and surfaces as an error.
pub trait Reranker: Send + Sync {
    /// Model identifier.
    fn model_name(&self) -> &str;
    /// Score `(query, document)` pairs, one score per document.
    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

/// L2-normalize a vector in place. Zero vectors are left untouched.
pub fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// L2-normalized copy of a vector.
pub fn normalized(mut vec: Vec<f32>) -> Vec<f32> {
    normalize(&mut vec);
    vec
}

/// Inner product. Returns `0.0` for empty or mismatched-length inputs.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Numerically stable logistic sigmoid.
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_unit_length() {
        let v = normalized(vec![3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector_unchanged() {
        let v = normalized(vec![0.0, 0.0, 0.0]);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_dot_identical_normalized_is_one() {
        let v = normalized(vec![1.0, 2.0, 3.0]);
        assert!((dot(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dot_mismatched_lengths() {
        assert_eq!(dot(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(dot(&[], &[]), 0.0);
    }

    #[test]
    fn test_sigmoid_symmetry() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!((sigmoid(5.0) + sigmoid(-5.0) - 1.0).abs() < 1e-6);
        assert!(sigmoid(50.0) <= 1.0);
        assert!(sigmoid(-50.0) >= 0.0);
    }
}
