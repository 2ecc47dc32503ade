//! Engine configuration.
//!
//! Every knob has a default tuned for interactive note-taking corpora, so
//! `ContextConfig::default()` is a working configuration and a TOML file
//! only needs to name what it overrides.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ContextConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bm25: Bm25Config,
    #[serde(default)]
    pub ann: AnnConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub caps: CapsConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Directory for the persisted index artifacts.
    #[serde(default)]
    pub dir: PathBuf,
}

impl StorageConfig {
    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join("context_index.json")
    }

    pub fn ann_path(&self) -> PathBuf {
        self.dir.join("context_ann.usearch")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Bm25Config {
    #[serde(default = "default_k1")]
    pub k1: f32,
    #[serde(default = "default_b")]
    pub b: f32,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

fn default_k1() -> f32 {
    1.2
}
fn default_b() -> f32 {
    0.75
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnnConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_connectivity")]
    pub connectivity: usize,
    #[serde(default = "default_expansion_add")]
    pub expansion_add: usize,
    #[serde(default = "default_expansion_search")]
    pub expansion_search: usize,
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_connectivity() -> usize {
    16
}
fn default_expansion_add() -> usize {
    128
}
fn default_expansion_search() -> usize {
    64
}

/// Weights and thresholds for the cheap scoring pass.
#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    /// Prefix-similarity threshold above which a concept counts as grounded.
    #[serde(default = "default_grounded_tau")]
    pub grounded_tau: f32,
    /// Weight of the gap-centroid support term.
    #[serde(default = "default_gap_beta")]
    pub gap_beta: f32,
    /// Weight of the prefix-redundancy term subtracted from relevance.
    #[serde(default = "default_redundancy_lambda")]
    pub redundancy_lambda: f32,
    /// Flat bonus when a candidate mentions a gap concept.
    #[serde(default = "default_gap_mention_bonus")]
    pub gap_mention_bonus: f32,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f32,
    #[serde(default = "default_concept_weight")]
    pub concept_weight: f32,
    #[serde(default = "default_gap_weight")]
    pub gap_weight: f32,
    #[serde(default = "default_quality_weight")]
    pub quality_weight: f32,
    #[serde(default = "default_heading_penalty")]
    pub heading_penalty: f32,
    #[serde(default = "default_same_note_bonus")]
    pub same_note_bonus: f32,
    /// Chunks below this quality never enter scoring.
    #[serde(default = "default_min_quality")]
    pub min_quality: f32,
    /// Multiplier on the redundancy penalty when the candidate is also
    /// lexically on-topic; such candidates restate the prefix for a reason.
    #[serde(default = "default_redundancy_damp")]
    pub redundancy_damp: f32,
    /// Lexical overlap above which a candidate counts as on-topic, and the
    /// minimum overlap that admits a cross-note candidate on its own.
    #[serde(default = "default_admit_lexical_min")]
    pub admit_lexical_min: f32,
    /// Minimum idf an anchor term must carry to admit a cross-note
    /// candidate on its own.
    #[serde(default = "default_anchor_idf_min")]
    pub anchor_idf_min: f32,
    /// Dense relevance that admits a cross-note candidate with no lexical
    /// or concept link.
    #[serde(default = "default_relevance_floor")]
    pub relevance_floor: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            grounded_tau: 0.35,
            gap_beta: 0.55,
            redundancy_lambda: 0.35,
            gap_mention_bonus: 0.12,
            lexical_weight: 0.25,
            concept_weight: 0.10,
            gap_weight: 0.15,
            quality_weight: 0.10,
            heading_penalty: 0.15,
            same_note_bonus: 0.08,
            min_quality: 0.15,
            redundancy_damp: 0.5,
            admit_lexical_min: 0.15,
            anchor_idf_min: 2.0,
            relevance_floor: 0.6,
        }
    }
}

fn default_grounded_tau() -> f32 {
    0.35
}
fn default_gap_beta() -> f32 {
    0.55
}
fn default_redundancy_lambda() -> f32 {
    0.35
}
fn default_gap_mention_bonus() -> f32 {
    0.12
}
fn default_lexical_weight() -> f32 {
    0.25
}
fn default_concept_weight() -> f32 {
    0.10
}
fn default_gap_weight() -> f32 {
    0.15
}
fn default_quality_weight() -> f32 {
    0.10
}
fn default_heading_penalty() -> f32 {
    0.15
}
fn default_same_note_bonus() -> f32 {
    0.08
}
fn default_min_quality() -> f32 {
    0.15
}
fn default_redundancy_damp() -> f32 {
    0.5
}
fn default_admit_lexical_min() -> f32 {
    0.15
}
fn default_anchor_idf_min() -> f32 {
    2.0
}
fn default_relevance_floor() -> f32 {
    0.6
}

/// Greedy selection (MMR) parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct SelectionConfig {
    /// Redundancy weight in the marginal-gain objective.
    #[serde(default = "default_mmr_mu")]
    pub mmr_mu: f32,
    /// Bonus per not-yet-covered gap concept.
    #[serde(default = "default_coverage_weight")]
    pub coverage_weight: f32,
    /// Penalty per already-selected snippet from the same note.
    #[serde(default = "default_used_note_penalty")]
    pub used_note_penalty: f32,
    /// Only the top N scored candidates are eligible for selection.
    #[serde(default = "default_search_window")]
    pub search_window: usize,
    /// Temperature of the sigmoid mapping combined score to display score.
    #[serde(default = "default_score_temp")]
    pub score_temp: f32,
    #[serde(default)]
    pub score_bias: f32,
    #[serde(default = "default_excerpt_max_sentences")]
    pub excerpt_max_sentences: usize,
    #[serde(default = "default_excerpt_max_chars")]
    pub excerpt_max_chars: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            mmr_mu: 0.35,
            coverage_weight: 0.08,
            used_note_penalty: 0.06,
            search_window: 250,
            score_temp: 2.0,
            score_bias: 0.0,
            excerpt_max_sentences: 3,
            excerpt_max_chars: 600,
        }
    }
}

fn default_mmr_mu() -> f32 {
    0.35
}
fn default_coverage_weight() -> f32 {
    0.08
}
fn default_used_note_penalty() -> f32 {
    0.06
}
fn default_search_window() -> usize {
    250
}
fn default_score_temp() -> f32 {
    2.0
}
fn default_excerpt_max_sentences() -> usize {
    3
}
fn default_excerpt_max_chars() -> usize {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    /// How many top candidates go through the cross-encoder.
    #[serde(default = "default_rerank_top_k")]
    pub top_k: usize,
    /// Blend weight of the normalized reranker score.
    #[serde(default = "default_rerank_weight")]
    pub weight: f32,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self { top_k: 50, weight: 0.35 }
    }
}

fn default_rerank_top_k() -> usize {
    50
}
fn default_rerank_weight() -> f32 {
    0.35
}

/// Hard limits keeping one query's work bounded.
#[derive(Debug, Deserialize, Clone)]
pub struct CapsConfig {
    /// Token budget of the cursor window.
    #[serde(default = "default_window_tokens")]
    pub window_tokens: usize,
    #[serde(default = "default_retriever_top_n")]
    pub dense_top_n: usize,
    #[serde(default = "default_retriever_top_n")]
    pub bm25_top_n: usize,
    /// Candidate union is truncated here before any scoring.
    #[serde(default = "default_candidate_cap")]
    pub candidate_cap: usize,
    /// Scored list is truncated here before reranking.
    #[serde(default = "default_scored_cap")]
    pub scored_cap: usize,
    /// Tail of the prefix embedded when no block boundary is usable.
    #[serde(default = "default_prefix_embed_chars")]
    pub prefix_embed_chars: usize,
    #[serde(default = "default_result_cache")]
    pub result_cache: usize,
    #[serde(default = "default_window_cache")]
    pub window_cache: usize,
    /// Prefix tail chars included in the expanded lexical query.
    #[serde(default = "default_query_prefix_chars")]
    pub query_prefix_chars: usize,
}

impl Default for CapsConfig {
    fn default() -> Self {
        Self {
            window_tokens: 450,
            dense_top_n: 200,
            bm25_top_n: 200,
            candidate_cap: 800,
            scored_cap: 500,
            prefix_embed_chars: 800,
            result_cache: 32,
            window_cache: 64,
            query_prefix_chars: 300,
        }
    }
}

fn default_window_tokens() -> usize {
    450
}
fn default_retriever_top_n() -> usize {
    200
}
fn default_candidate_cap() -> usize {
    800
}
fn default_scored_cap() -> usize {
    500
}
fn default_prefix_embed_chars() -> usize {
    800
}
fn default_result_cache() -> usize {
    32
}
fn default_window_cache() -> usize {
    64
}
fn default_query_prefix_chars() -> usize {
    300
}

pub fn load_config(path: &Path) -> Result<ContextConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ContextConfig =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &ContextConfig) -> Result<()> {
    if config.bm25.k1 <= 0.0 {
        anyhow::bail!("bm25.k1 must be > 0");
    }
    if !(0.0..=1.0).contains(&config.bm25.b) {
        anyhow::bail!("bm25.b must be in [0.0, 1.0]");
    }
    for (name, value) in [
        ("scoring.grounded_tau", config.scoring.grounded_tau),
        ("scoring.gap_beta", config.scoring.gap_beta),
        ("scoring.redundancy_lambda", config.scoring.redundancy_lambda),
        ("scoring.redundancy_damp", config.scoring.redundancy_damp),
        ("selection.mmr_mu", config.selection.mmr_mu),
        ("rerank.weight", config.rerank.weight),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("{name} must be in [0.0, 1.0]");
        }
    }
    if config.caps.window_tokens == 0 {
        anyhow::bail!("caps.window_tokens must be > 0");
    }
    if config.caps.candidate_cap == 0 || config.caps.scored_cap == 0 {
        anyhow::bail!("caps.candidate_cap and caps.scored_cap must be > 0");
    }
    if config.selection.search_window == 0 {
        anyhow::bail!("selection.search_window must be > 0");
    }
    if config.selection.score_temp <= 0.0 {
        anyhow::bail!("selection.score_temp must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        validate(&ContextConfig::default()).unwrap();
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ContextConfig = toml::from_str(
            r#"
            [storage]
            dir = "/tmp/ctx"

            [scoring]
            grounded_tau = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.dir, PathBuf::from("/tmp/ctx"));
        assert!((config.scoring.grounded_tau - 0.5).abs() < 1e-6);
        assert!((config.scoring.gap_beta - 0.55).abs() < 1e-6);
        assert_eq!(config.caps.window_tokens, 450);
        assert!(config.ann.enabled);
    }

    #[test]
    fn test_load_config_rejects_bad_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [storage]
            dir = "/tmp/ctx"

            [bm25]
            b = 1.5
            "#
        )
        .unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("bm25.b"));
    }

    #[test]
    fn test_artifact_paths() {
        let storage = StorageConfig { dir: PathBuf::from("/data") };
        assert_eq!(storage.metadata_path(), PathBuf::from("/data/context_index.json"));
        assert_eq!(storage.ann_path(), PathBuf::from("/data/context_ann.usearch"));
    }
}
