//! The retrieval service: indexing entry points and the cursor query.
//!
//! A query models the reader mid-note. The text before the cursor is what
//! they already know (the prefix), the block under the cursor is what they
//! are writing now (the window). Concepts mentioned in the window split
//! into grounded (already established by the prefix) and gaps (introduced
//! but unexplained), and retrieval favors chunks that fill the gaps
//! without restating the prefix.
//!
//! The pipeline is synchronous and bounded: candidate generation unions
//! three capped retrievers, cheap scoring caps the survivors, the optional
//! cross-encoder sees a fixed top slice, and greedy selection walks a
//! fixed window. Identical (note, block, text-hash) queries are answered
//! from a small FIFO cache.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::concepts;
use crate::config::{validate, ContextConfig};
use crate::embedding::{dot, normalized, sigmoid, Embedder, Reranker};
use crate::index::ContextIndex;
use crate::lexical::tokenize;
use crate::models::{
    ChunkMeta, ContextRequest, ContextSnippet, IndexStats, NoteKind, NoteRecord, SnippetDebug,
    WarmupReport,
};
use crate::text;

type ResultKey = (String, usize, String);

/// Per-service mutable query state, separate from the index so cache hits
/// never contend with rebuilds.
struct QueryCaches {
    results: VecDeque<(ResultKey, Vec<ContextSnippet>)>,
    window_embeds: VecDeque<(String, Vec<f32>)>,
}

pub struct ContextService {
    cfg: ContextConfig,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    index: RwLock<ContextIndex>,
    caches: Mutex<QueryCaches>,
}

impl ContextService {
    pub fn new(
        cfg: ContextConfig,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Result<Self> {
        validate(&cfg)?;
        let index = ContextIndex::open(cfg.clone())?;
        Ok(Self {
            cfg,
            embedder,
            reranker,
            index: RwLock::new(index),
            caches: Mutex::new(QueryCaches {
                results: VecDeque::new(),
                window_embeds: VecDeque::new(),
            }),
        })
    }

    /// (Re)index one note, replacing its chunk set. Returns the number of
    /// chunks indexed. Folders are never indexed; passing one removes any
    /// chunks previously stored under its id.
    pub fn index_note(&self, note: &NoteRecord) -> Result<usize> {
        if note.kind == NoteKind::Folder {
            self.delete_notes(std::slice::from_ref(&note.id))?;
            return Ok(0);
        }

        let content = text::strip_chunk_markers(&text::clean_text(&note.content));
        let blocks = text::split_quality_blocks(&content);

        let mut chunks = Vec::with_capacity(blocks.len());
        for (block_index, block) in blocks.iter().enumerate() {
            if block.text.trim().is_empty() {
                continue;
            }
            let dense = normalized(
                self.embedder
                    .embed(&block.text)
                    .with_context(|| format!("embed block {block_index} of note {}", note.id))?,
            );
            let labels = concepts::extract_candidates(&block.text);
            let mut keys = Vec::new();
            let mut key_labels = std::collections::BTreeMap::new();
            for label in labels {
                let key = concepts::normalize_label(&label);
                if key.is_empty() || keys.contains(&key) {
                    continue;
                }
                keys.push(key.clone());
                key_labels.insert(key, label);
            }
            keys.sort();
            chunks.push(ChunkMeta {
                chunk_id: ChunkMeta::id_for(&note.id, block.start, block.end, block_index),
                note_id: note.id.clone(),
                block_index,
                start: block.start,
                end: block.end,
                text: block.text.clone(),
                quality: text::block_quality(&block.text),
                dense,
                concepts: keys,
                concept_labels: key_labels,
            });
        }

        let count = chunks.len();
        {
            let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
            if let Some(dim) = index.embedding_dim() {
                if dim != self.embedder.dims() {
                    warn!(
                        stored = dim,
                        current = self.embedder.dims(),
                        "embedding dimension changed, clearing index"
                    );
                    index.clear()?;
                }
            }
            index.update_note(&note.id, chunks)?;
        }
        self.invalidate_caches();
        debug!(note_id = %note.id, chunks = count, "indexed note");
        Ok(count)
    }

    pub fn delete_notes(&self, note_ids: &[String]) -> Result<()> {
        {
            let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
            index.delete_notes(note_ids)?;
        }
        self.invalidate_caches();
        Ok(())
    }

    /// Drop everything and re-index the given notes from scratch.
    pub fn rebuild(&self, notes: &[NoteRecord]) -> Result<usize> {
        {
            let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
            index.clear()?;
        }
        self.invalidate_caches();
        let mut total = 0;
        for note in notes {
            total += self.index_note(note)?;
        }
        self.ensure_ready()?;
        info!(notes = notes.len(), chunks = total, "rebuilt index");
        Ok(total)
    }

    /// Force the derived structures to be built now instead of on the
    /// first query. `notes` is the full record set: it bootstraps an
    /// empty index and replaces a stored index whose embedding dimension
    /// no longer matches the active embedder.
    pub fn ensure_built(&self, notes: &[NoteRecord]) -> Result<()> {
        let (bootstrap, stored_dim) = {
            let index = self.index.read().unwrap_or_else(|e| e.into_inner());
            (index.is_empty() && !notes.is_empty(), index.embedding_dim())
        };
        let dim_changed = stored_dim.is_some_and(|dim| dim != self.embedder.dims());
        if dim_changed {
            warn!(
                stored = ?stored_dim,
                current = self.embedder.dims(),
                "embedding dimension changed, rebuilding index"
            );
        }
        if bootstrap || dim_changed {
            self.rebuild(notes)?;
            return Ok(());
        }
        self.ensure_ready()
    }

    fn ensure_ready(&self) -> Result<()> {
        self.index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .ensure_ready()
    }

    /// Probe the inference providers and build the index over `notes`, so
    /// the first real query pays no cold-start cost. Provider failures are
    /// errors; a service that cannot embed cannot serve.
    pub fn warmup(&self, notes: &[NoteRecord], force_rebuild: bool) -> Result<WarmupReport> {
        let probe = self
            .embedder
            .embed("warmup probe")
            .context("embedder warmup probe failed")?;
        if probe.len() != self.embedder.dims() {
            bail!(
                "embedder returned {} dims, expected {}",
                probe.len(),
                self.embedder.dims()
            );
        }
        if let Some(reranker) = &self.reranker {
            let scores = reranker
                .score("warmup probe", &["warmup document".to_string()])
                .context("reranker warmup probe failed")?;
            if scores.len() != 1 {
                bail!("reranker returned {} scores for 1 document", scores.len());
            }
        }
        if force_rebuild {
            self.rebuild(notes)?;
        } else {
            self.ensure_built(notes)?;
        }

        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        let stats = index.stats();
        info!(chunks = stats.chunk_count, "warmup complete");
        Ok(WarmupReport {
            embedder_model: self.embedder.model_name().to_string(),
            reranker_enabled: self.reranker.is_some(),
            reranker_model: self.reranker.as_ref().map(|r| r.model_name().to_string()),
            chunk_count: stats.chunk_count,
        })
    }

    pub fn stats(&self) -> IndexStats {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .stats()
    }

    /// Retrieve context snippets for the cursor position in `req`.
    pub fn context(&self, req: &ContextRequest) -> Result<Vec<ContextSnippet>> {
        if req.limit == 0 {
            return Ok(Vec::new());
        }
        let scoring = &self.cfg.scoring;
        let caps = &self.cfg.caps;

        let content = text::strip_chunk_markers(&text::clean_text(&req.text));
        let cursor = text::snap_to_char_boundary(&content, req.cursor_offset.min(content.len()));
        let blocks = text::split_quality_blocks(&content);
        if blocks.is_empty() {
            return Ok(Vec::new());
        }
        let block_index = blocks
            .iter()
            .rposition(|b| b.start <= cursor)
            .unwrap_or(0);
        let block = &blocks[block_index];

        let cache_key: ResultKey = (req.note_id.clone(), block_index, short_hash(&block.text));
        if let Some(hit) = self.cached_result(&cache_key, req.limit) {
            return Ok(shape_output(hit, req));
        }

        let cursor_in_block = cursor.saturating_sub(block.start);
        let window = text::clip_tokens_around_cursor(&block.text, cursor_in_block, caps.window_tokens);
        if window.trim().is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_ready()?;
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        // Reuse the indexed vector when the window is exactly the indexed
        // block text; otherwise embed, memoized by window hash.
        let window_emb = match index
            .note_block_chunk(&req.note_id, block_index)
            .filter(|c| c.text == window)
        {
            Some(chunk) => chunk.dense.clone(),
            None => self.window_embedding(&window)?,
        };
        let Some(index_dim) = index.embedding_dim() else {
            return Ok(Vec::new());
        };
        if index_dim != window_emb.len() {
            warn!(
                index_dim,
                query_dim = window_emb.len(),
                "embedding dimension mismatch, re-index required"
            );
            return Ok(Vec::new());
        }

        // Prefix embedding: cumulative sums when the note is indexed,
        // otherwise embed the tail of the raw prefix text.
        let prefix_text = &content[..block.start];
        let prefix_emb = match index.prefix_embedding(&req.note_id, block_index) {
            Some(v) => Some(v),
            None => {
                let tail = tail_chars(prefix_text, caps.prefix_embed_chars);
                if tail.trim().is_empty() {
                    None
                } else {
                    Some(normalized(
                        self.embedder.embed(tail).context("embed prefix tail")?,
                    ))
                }
            }
        };

        // Classify window concepts into grounded and gaps.
        let mut active: Vec<(String, String)> = Vec::new();
        for label in concepts::extract_candidates(&window) {
            let key = concepts::normalize_label(&label);
            if key.is_empty() || active.iter().any(|(k, _)| *k == key) {
                continue;
            }
            if index.concept_members(&key) == 0 {
                continue;
            }
            active.push((key, label));
        }
        // Grounding looks at everything before the cursor, the prefix
        // embedding only at whole blocks before the current one.
        let known_text = &content[..cursor];
        let mut gaps: Vec<String> = Vec::new();
        let mut centroids: HashMap<String, Vec<f32>> = HashMap::new();
        for (key, label) in &active {
            let centroid = index.concept_centroid(key);
            let mentions = text::count_occurrences(known_text, label);
            let semantically_known = match (&prefix_emb, &centroid) {
                (Some(p), Some(c)) => dot(p, c) >= scoring.grounded_tau,
                _ => false,
            };
            if let Some(c) = centroid {
                centroids.insert(key.clone(), c);
            }
            if mentions < 2 && !semantically_known {
                gaps.push(key.clone());
            }
        }
        debug!(
            active = active.len(),
            gaps = gaps.len(),
            "classified window concepts"
        );

        // Candidate union: concept postings, dense neighbors, BM25 hits.
        let active_keys: HashSet<&str> = active.iter().map(|(k, _)| k.as_str()).collect();
        let gap_keys: HashSet<&str> = gaps.iter().map(String::as_str).collect();
        let mut candidates: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for id in index.chunks_for_concepts(active_keys.iter().copied()) {
            if seen.insert(id.clone()) {
                candidates.push(id);
            }
        }
        for (id, _) in index.dense_search(&window_emb, caps.dense_top_n, None) {
            if seen.insert(id.clone()) {
                candidates.push(id);
            }
        }
        let query_tail = tail_chars(prefix_text, caps.query_prefix_chars);
        let label_line = active
            .iter()
            .map(|(_, l)| l.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let expanded_query = format!("{window}\n{query_tail}\n{label_line}");
        for (id, _) in index.bm25_search(&expanded_query, caps.bm25_top_n, None) {
            if seen.insert(id.clone()) {
                candidates.push(id);
            }
        }
        candidates.truncate(caps.candidate_cap);

        // Cheap scoring pass.
        let window_tokens: HashSet<String> = tokenize(&window).into_iter().collect();
        let anchor_tokens: HashSet<&str> = window_tokens
            .iter()
            .map(String::as_str)
            .filter(|t| index.bm25_idf(t) >= scoring.anchor_idf_min)
            .collect();

        let mut scored: Vec<Scored<'_>> = Vec::new();
        for id in &candidates {
            let Some(chunk) = index.chunk(id) else {
                continue;
            };
            let same_note = chunk.note_id == req.note_id;
            if same_note
                && (chunk.block_index == block_index
                    || (chunk.start <= cursor && cursor < chunk.end))
            {
                continue;
            }
            if chunk.quality < scoring.min_quality || chunk.dense.len() != window_emb.len() {
                continue;
            }

            let relevance = dot(&window_emb, &chunk.dense);
            let redundancy = prefix_emb.as_ref().map_or(0.0, |p| dot(p, &chunk.dense));

            let chunk_tokens: HashSet<String> = tokenize(&chunk.text).into_iter().collect();
            let shared = window_tokens.intersection(&chunk_tokens).count();
            let lexical_overlap = shared as f32 / window_tokens.len().max(1) as f32;

            let active_hits = chunk
                .concepts
                .iter()
                .filter(|k| active_keys.contains(k.as_str()))
                .count();
            let active_overlap = active_hits as f32 / active_keys.len().max(1) as f32;
            let gap_hits: Vec<&str> = chunk
                .concepts
                .iter()
                .map(String::as_str)
                .filter(|k| gap_keys.contains(k))
                .collect();
            let gap_overlap = gap_hits.len() as f32 / gap_keys.len().max(1) as f32;
            let mentions_gap = !gap_hits.is_empty();

            // Gap support: similarity to the centroid of the gap concept
            // this chunk best explains.
            let mut gap_support = 0.0f32;
            let mut gap_concept: Option<String> = None;
            for key in &gaps {
                let Some(centroid) = centroids.get(key) else {
                    continue;
                };
                let support = dot(centroid, &chunk.dense);
                if support > gap_support {
                    gap_support = support;
                    gap_concept = Some(key.clone());
                }
            }

            if !same_note {
                let anchored = anchor_tokens
                    .iter()
                    .any(|t| chunk_tokens.contains(*t));
                let admitted = lexical_overlap >= scoring.admit_lexical_min
                    || active_hits > 0
                    || anchored
                    || relevance >= scoring.relevance_floor;
                if !admitted {
                    continue;
                }
            }

            // An on-topic candidate restates the prefix for a reason, so
            // its redundancy penalty is damped rather than applied in full.
            let damp = if lexical_overlap >= scoring.admit_lexical_min {
                scoring.redundancy_damp
            } else {
                1.0
            };
            let mut base = relevance - scoring.redundancy_lambda * redundancy * damp
                + scoring.gap_beta * gap_support
                + scoring.lexical_weight * lexical_overlap
                + scoring.concept_weight * active_overlap
                + scoring.gap_weight * gap_overlap
                + scoring.quality_weight * chunk.quality;
            if mentions_gap {
                base += scoring.gap_mention_bonus;
            }
            if text::is_heading_only(&chunk.text) {
                base -= scoring.heading_penalty;
            }
            if same_note {
                let distance = chunk.block_index.abs_diff(block_index) as f32;
                base += scoring.same_note_bonus / (1.0 + distance);
            }

            scored.push(Scored {
                chunk,
                base,
                relevance,
                redundancy,
                lexical_overlap,
                active_overlap,
                gap_overlap,
                gap_support,
                gap_concept,
                mentions_gap,
                reranker_raw: None,
                reranker_norm: None,
                combined: 0.0,
            });
        }

        scored.sort_by(|a, b| {
            b.base
                .partial_cmp(&a.base)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        scored.truncate(caps.scored_cap);

        // Optional cross-encoder pass over the top slice; normalized scores
        // are blended additively onto the cheap score.
        if let Some(reranker) = &self.reranker {
            if !scored.is_empty() {
                let k = self.cfg.rerank.top_k.min(scored.len());
                let docs: Vec<String> = scored[..k].iter().map(|s| s.chunk.text.clone()).collect();
                let raw = reranker
                    .score(&window, &docs)
                    .context("reranker scoring failed")?;
                if raw.len() != docs.len() {
                    bail!(
                        "reranker returned {} scores for {} documents",
                        raw.len(),
                        docs.len()
                    );
                }
                let norms = min_max(raw.iter().copied());
                for (i, (r, n)) in raw.iter().zip(norms.iter()).enumerate() {
                    scored[i].reranker_raw = Some(*r);
                    scored[i].reranker_norm = Some(*n);
                }
            }
        }
        for s in scored.iter_mut() {
            s.combined = s.base + self.cfg.rerank.weight * s.reranker_norm.unwrap_or(0.0);
        }
        scored.sort_by(|a, b| {
            b.combined
                .partial_cmp(&a.combined)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });

        let snippets = self.select(&index, &scored, &gap_keys, &window_tokens, req.limit);
        drop(index);

        self.store_result(cache_key, snippets.clone());
        Ok(shape_output(snippets, req))
    }

    /// Greedy selection over the top of the scored list: marginal gain is
    /// the combined score minus a redundancy term against what is already
    /// selected, plus a bonus for covering an unfilled gap concept and a
    /// penalty for leaning on one note.
    fn select(
        &self,
        index: &ContextIndex,
        scored: &[Scored<'_>],
        gap_keys: &HashSet<&str>,
        window_tokens: &HashSet<String>,
        limit: usize,
    ) -> Vec<ContextSnippet> {
        let selection = &self.cfg.selection;
        let pool = &scored[..scored.len().min(selection.search_window)];

        let mut consumed = vec![false; pool.len()];
        let mut selected: Vec<usize> = Vec::new();
        let mut covered: HashSet<&str> = HashSet::new();
        let mut note_counts: HashMap<&str, usize> = HashMap::new();
        let mut emitted_texts: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        while out.len() < limit && consumed.iter().any(|c| !c) {
            let mut best: Option<(usize, f32)> = None;
            for (i, cand) in pool.iter().enumerate() {
                if consumed[i] {
                    continue;
                }
                let max_sim = selected
                    .iter()
                    .map(|&j| dot(&cand.chunk.dense, &pool[j].chunk.dense))
                    .fold(0.0f32, f32::max);
                let new_cover = cand
                    .chunk
                    .concepts
                    .iter()
                    .filter(|k| gap_keys.contains(k.as_str()) && !covered.contains(k.as_str()))
                    .count();
                let reuse = *note_counts.get(cand.chunk.note_id.as_str()).unwrap_or(&0);
                let gain = cand.combined - selection.mmr_mu * max_sim
                    + selection.coverage_weight * new_cover as f32
                    - selection.used_note_penalty * reuse as f32;
                let better = match best {
                    None => true,
                    Some((bi, bg)) => {
                        gain > bg
                            || (gain == bg && cand.chunk.chunk_id < pool[bi].chunk.chunk_id)
                    }
                };
                if better {
                    best = Some((i, gain));
                }
            }
            let Some((pick, _)) = best else {
                break;
            };
            consumed[pick] = true;
            let cand = &pool[pick];

            let excerpt = query_excerpt(
                &cand.chunk.text,
                window_tokens,
                selection.excerpt_max_sentences,
                selection.excerpt_max_chars,
            );
            let dedup_key = excerpt.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
            if excerpt.is_empty() || !emitted_texts.insert(dedup_key) {
                continue;
            }

            selected.push(pick);
            covered.extend(
                cand.chunk
                    .concepts
                    .iter()
                    .map(String::as_str)
                    .filter(|k| gap_keys.contains(k)),
            );
            *note_counts.entry(cand.chunk.note_id.as_str()).or_insert(0) += 1;

            let display = sigmoid(
                selection.score_temp * (cand.combined - 0.5) + selection.score_bias,
            );
            let concept = cand.gap_concept.as_ref().map(|key| {
                index
                    .concept_label(key)
                    .map(str::to_string)
                    .unwrap_or_else(|| key.clone())
            });
            out.push(ContextSnippet {
                note_id: cand.chunk.note_id.clone(),
                chunk_id: cand.chunk.chunk_id.clone(),
                text: excerpt,
                score: display,
                concept,
                debug: Some(SnippetDebug {
                    relevance: cand.relevance,
                    redundancy: cand.redundancy,
                    gap_support: cand.gap_support,
                    lexical_overlap: cand.lexical_overlap,
                    active_overlap: cand.active_overlap,
                    gap_overlap: cand.gap_overlap,
                    quality: cand.chunk.quality,
                    base: cand.base,
                    reranker_raw: cand.reranker_raw,
                    reranker_norm: cand.reranker_norm,
                    combined: cand.combined,
                    gap_concept_id: cand.gap_concept.clone(),
                    mentions_gap: cand.mentions_gap,
                }),
            });
        }
        out
    }

    fn window_embedding(&self, window: &str) -> Result<Vec<f32>> {
        let key = short_hash(window);
        {
            let caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((_, emb)) = caches.window_embeds.iter().find(|(k, _)| *k == key) {
                return Ok(emb.clone());
            }
        }
        let emb = normalized(self.embedder.embed(window).context("embed cursor window")?);
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        caches.window_embeds.push_back((key, emb.clone()));
        while caches.window_embeds.len() > self.cfg.caps.window_cache {
            caches.window_embeds.pop_front();
        }
        Ok(emb)
    }

    fn cached_result(&self, key: &ResultKey, limit: usize) -> Option<Vec<ContextSnippet>> {
        let caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        caches
            .results
            .iter()
            .find(|(k, v)| k == key && v.len() >= limit)
            .map(|(_, v)| v.clone())
    }

    fn store_result(&self, key: ResultKey, snippets: Vec<ContextSnippet>) {
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        caches.results.retain(|(k, _)| *k != key);
        caches.results.push_back((key, snippets));
        while caches.results.len() > self.cfg.caps.result_cache {
            caches.results.pop_front();
        }
    }

    fn invalidate_caches(&self) {
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        caches.results.clear();
    }
}

struct Scored<'a> {
    chunk: &'a ChunkMeta,
    base: f32,
    relevance: f32,
    redundancy: f32,
    lexical_overlap: f32,
    active_overlap: f32,
    gap_overlap: f32,
    gap_support: f32,
    gap_concept: Option<String>,
    mentions_gap: bool,
    reranker_raw: Option<f32>,
    reranker_norm: Option<f32>,
    combined: f32,
}

/// Query-aware excerpt: start at the sentence with the highest token
/// overlap with the window; when nothing overlaps, fall back to the
/// leading sentences (the intrinsically best-reading opening).
fn query_excerpt(
    chunk_text: &str,
    window_tokens: &HashSet<String>,
    max_sentences: usize,
    max_chars: usize,
) -> String {
    let sentences = text::split_sentences(chunk_text);
    let mut best = 0usize;
    let mut best_overlap = 0usize;
    for (i, sentence) in sentences.iter().enumerate() {
        let overlap = tokenize(sentence)
            .iter()
            .filter(|t| window_tokens.contains(*t))
            .count();
        if overlap > best_overlap {
            best_overlap = overlap;
            best = i;
        }
    }
    if best_overlap == 0 {
        return text::sentence_excerpt(chunk_text, max_sentences, max_chars);
    }
    let end = sentences.len().min(best + max_sentences.max(1));
    let mut excerpt = sentences[best..end].join(" ");
    if excerpt.len() > max_chars {
        let cut = text::snap_to_char_boundary(&excerpt, max_chars);
        excerpt.truncate(cut);
        excerpt.truncate(excerpt.trim_end().len());
    }
    excerpt
}

/// Min-max normalize to `[0, 1]`; a flat distribution maps to 0.5.
fn min_max(values: impl Iterator<Item = f32>) -> Vec<f32> {
    let values: Vec<f32> = values.collect();
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !min.is_finite() || !max.is_finite() || (max - min) < 1e-9 {
        return vec![0.5; values.len()];
    }
    values.iter().map(|v| (v - min) / (max - min)).collect()
}

fn short_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

/// Last `n` bytes of `s`, snapped forward onto a char boundary.
fn tail_chars(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let start = text::snap_to_char_boundary(s, s.len() - n);
    &s[start..]
}

fn shape_output(mut snippets: Vec<ContextSnippet>, req: &ContextRequest) -> Vec<ContextSnippet> {
    snippets.truncate(req.limit);
    if !req.include_debug {
        for snippet in &mut snippets {
            snippet.debug = None;
        }
    }
    snippets
}
