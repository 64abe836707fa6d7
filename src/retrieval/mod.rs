//! Retrieval & Ranking (§3): turns a codebase into searchable, embedded chunks
//! and assembles token-budgeted context for LLM prompts.
//!
//! Grounded in `original_source/ryx_pkg/rag/{code_embeddings,semantic_search,
//! context_ranker,incremental_indexer}.py`, re-expressed with the teacher's
//! embedding stack (`memory::vector`) and an embedding cache that reuses
//! `PersistentStore` rather than a second SQLite database.

pub mod chunk;
pub mod embed;
pub mod index;
pub mod rank;

use std::path::Path;
use std::sync::{Arc, RwLock};

use rayon::prelude::*;
use tracing::instrument;

use embed::{cosine_similarity, EmbeddedChunk, SharedEmbedder};
use index::IncrementalIndexer;
use rank::SearchResult;

use crate::store::PersistentStore;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub top_k: usize,
    pub min_score: f64,
    pub file_filter: Option<String>,
    pub language_filter: Option<String>,
}

impl SearchOptions {
    pub fn new(top_k: usize, min_score: f64) -> Self {
        Self { top_k, min_score, file_filter: None, language_filter: None }
    }
}

/// Ties the chunker, embedder, incremental indexer, and ranker together behind a
/// single `search` / `index_directory` surface.
pub struct RetrievalEngine {
    indexer: IncrementalIndexer,
    embedder: SharedEmbedder,
    index: RwLock<Vec<EmbeddedChunk>>,
}

impl RetrievalEngine {
    pub fn new(store: Arc<PersistentStore>, embedder: SharedEmbedder) -> Self {
        Self { indexer: IncrementalIndexer::new(store, embedder.clone()), embedder, index: RwLock::new(Vec::new()) }
    }

    #[instrument(skip(self), fields(root = %root.display()))]
    pub async fn index_directory(&self, root: &Path) -> index::IndexStatus {
        let (embedded, status) = self.indexer.index_directory(root).await;
        *self.index.write().expect("retrieval index lock poisoned") = embedded;
        status
    }

    pub fn forget_file(&self, file_path: &str) -> anyhow::Result<()> {
        self.indexer.forget_file(file_path)?;
        self.index.write().expect("retrieval index lock poisoned").retain(|e| e.chunk.file_path != file_path);
        Ok(())
    }

    /// Semantic search against the in-memory index, falling back to keyword
    /// matching whenever the embedder cannot be reached.
    #[instrument(skip(self, query))]
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Vec<SearchResult> {
        let candidates: Vec<EmbeddedChunk> = {
            let index = self.index.read().expect("retrieval index lock poisoned");
            index
                .iter()
                .filter(|e| options.file_filter.as_ref().map(|f| e.chunk.file_path.contains(f.as_str())).unwrap_or(true))
                .filter(|e| options.language_filter.as_ref().map(|l| &e.chunk.language == l).unwrap_or(true))
                .cloned()
                .collect()
        };

        match self.embedder.embed(&[query.to_string()]).await {
            Ok(embeddings) if !embeddings.is_empty() => {
                let query_vec = &embeddings[0];
                // Cosine scoring is pure CPU work over an index that can run into the
                // thousands of chunks; fan it across rayon's pool rather than the
                // async executor.
                let mut scored: Vec<SearchResult> = candidates
                    .into_par_iter()
                    .map(|e| {
                        let score = cosine_similarity(query_vec, &e.embedding) as f64;
                        (e, score)
                    })
                    .filter(|(_, score)| *score >= options.min_score)
                    .map(|(e, score)| to_search_result(e, score))
                    .collect();
                scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                scored.truncate(options.top_k.max(1));
                scored
            }
            _ => keyword_search(&candidates, query, options),
        }
    }

    /// Semantic and keyword results merged by weighted score, deduped by chunk id.
    #[instrument(skip(self, query))]
    pub async fn hybrid_search(&self, query: &str, top_k: usize, semantic_weight: f64) -> Vec<SearchResult> {
        let wide = SearchOptions::new(top_k * 2, 0.0);
        let semantic = self.search(query, &wide).await;

        let candidates: Vec<EmbeddedChunk> = self.index.read().expect("retrieval index lock poisoned").clone();
        let keyword = keyword_search(&candidates, query, &SearchOptions::new(top_k * 2, 0.0));

        let mut combined: std::collections::HashMap<String, (SearchResult, f64, f64)> = std::collections::HashMap::new();
        for r in semantic {
            let id = chunk_id(&r);
            combined.insert(id, (r.clone(), r.score, 0.0));
        }
        for r in keyword {
            let id = chunk_id(&r);
            combined
                .entry(id)
                .and_modify(|(_, _, kw)| *kw = r.score)
                .or_insert_with(|| (r.clone(), 0.0, r.score));
        }

        let mut final_results: Vec<SearchResult> = combined
            .into_values()
            .map(|(mut r, sem, kw)| {
                r.score = semantic_weight * sem + (1.0 - semantic_weight) * kw;
                r
            })
            .collect();
        final_results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        final_results.truncate(top_k.max(1));
        final_results
    }
}

fn chunk_id(r: &SearchResult) -> String {
    format!("{}:{}:{}", r.file_path, r.start_line, r.end_line)
}

fn to_search_result(e: EmbeddedChunk, score: f64) -> SearchResult {
    SearchResult {
        content: e.chunk.content,
        file_path: e.chunk.file_path,
        start_line: e.chunk.start_line,
        end_line: e.chunk.end_line,
        language: e.chunk.language,
        score,
    }
}

fn keyword_search(candidates: &[EmbeddedChunk], query: &str, options: &SearchOptions) -> Vec<SearchResult> {
    let keywords: Vec<String> = query.to_lowercase().split_whitespace().map(String::from).collect();
    if keywords.is_empty() {
        return Vec::new();
    }

    let mut results: Vec<SearchResult> = candidates
        .iter()
        .filter_map(|e| {
            let content_lower = e.chunk.content.to_lowercase();
            let matches = keywords.iter().filter(|k| content_lower.contains(k.as_str())).count();
            let score = matches as f64 / keywords.len() as f64;
            (score > 0.0).then(|| to_search_result(e.clone(), score))
        })
        .collect();

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(options.top_k.max(1));
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::embed::StubEmbedder;
    use std::fs;

    async fn engine_with_index(dir: &std::path::Path) -> RetrievalEngine {
        let store = Arc::new(PersistentStore::open_in_memory().unwrap());
        let engine = RetrievalEngine::new(store, Arc::new(StubEmbedder));
        engine.index_directory(dir).await;
        engine
    }

    #[tokio::test]
    async fn search_ranks_matching_chunk_above_unrelated_one() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("auth.rs"), "fn login(user: &str) {\n    authenticate(user);\n}\n").unwrap();
        fs::write(dir.path().join("math.rs"), "fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n").unwrap();

        let engine = engine_with_index(dir.path()).await;
        let results = engine.search("authenticate user login", &SearchOptions::new(5, 0.0)).await;
        assert!(!results.is_empty());
        assert!(results[0].file_path.ends_with("auth.rs"));
    }

    #[tokio::test]
    async fn forget_file_removes_it_from_the_live_index() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn a() {\n    1\n}\n").unwrap();
        let engine = engine_with_index(dir.path()).await;
        let file_path = dir.path().join("a.rs").to_string_lossy().to_string();
        engine.forget_file(&file_path).unwrap();
        let results = engine.search("a", &SearchOptions::new(5, 0.0)).await;
        assert!(results.iter().all(|r| r.file_path != file_path));
    }

    #[tokio::test]
    async fn hybrid_search_merges_semantic_and_keyword_scores() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("auth.rs"), "fn login(user: &str) {\n    authenticate(user);\n}\n").unwrap();
        let engine = engine_with_index(dir.path()).await;
        let results = engine.hybrid_search("login", 5, 0.7).await;
        assert!(!results.is_empty());
        assert!(results[0].score > 0.0);
    }
}
