//! # Scriptorium Context
//!
//! Cursor-conditioned context retrieval for Scriptorium, a local-first
//! note-taking app.
//!
//! Given a note and a cursor position, the engine models the reader's
//! state (what the text before the cursor has already established, and
//! which concepts the current paragraph leans on without explaining) and
//! retrieves short excerpts from the rest of the corpus that fill those
//! gaps. Retrieval is hybrid: BM25, dense nearest neighbors, and a
//! concept graph feed one candidate pool, a cheap scoring pass ranks it,
//! an optional cross-encoder refines the top, and greedy selection trades
//! relevance against redundancy and note diversity.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌──────────────────┐
//! │  Notes   │──▶│ Split + Embed  │──▶│   ContextIndex    │
//! │ (editor) │   │ + Concepts    │   │ JSON + usearch    │
//! └──────────┘   └───────────────┘   └────────┬─────────┘
//!                                             │
//!      cursor query                           ▼
//! ┌────────────────┐   ┌──────────────────────────────────┐
//! │ window + prefix │──▶│ BM25 ∪ dense ∪ concept postings  │
//! │ gap concepts    │   │ score → rerank → MMR selection   │
//! └────────────────┘   └──────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and defaults |
//! | [`models`] | Core data types |
//! | [`text`] | Block splitting, windows, excerpts |
//! | [`concepts`] | Concept candidate extraction |
//! | [`embedding`] | Embedder/reranker traits, vector math |
//! | [`lexical`] | BM25 inverted index |
//! | [`dense`] | Exact dense cache and HNSW index |
//! | [`index`] | Durable chunk index and rebuilds |
//! | [`service`] | Indexing entry points and the cursor query |

pub mod concepts;
pub mod config;
pub mod dense;
pub mod embedding;
pub mod index;
pub mod lexical;
pub mod models;
pub mod service;
pub mod text;

pub use config::{load_config, ContextConfig};
pub use embedding::{Embedder, Reranker};
pub use models::{
    ContextRequest, ContextSnippet, IndexStats, NoteKind, NoteRecord, WarmupReport,
};
pub use service::ContextService;
