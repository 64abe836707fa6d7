//! Incremental codebase indexing (§3.1), grounded in
//! `original_source/ryx_pkg/rag/incremental_indexer.py`: walk a root directory,
//! skip files whose content hash matches what is already cached, chunk and embed
//! anything new or changed, and drop stale chunks for deleted files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{instrument, warn};

use crate::store::PersistentStore;

use super::chunk::{self, CodeChunk};
use super::embed::{EmbeddedChunk, SharedEmbedder};

#[derive(Debug, Clone, Default)]
pub struct IndexStatus {
    pub files_scanned: usize,
    pub files_skipped_unchanged: usize,
    pub chunks_embedded: usize,
    pub chunks_reused: usize,
    pub errors: Vec<String>,
}

/// Recursive directory walk; vendored/build directories are pruned by
/// `chunk::is_ignored` before descending so they never get read at all.
fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if chunk::is_ignored(&path) {
            continue;
        }
        if path.is_dir() {
            walk(&path, out);
        } else {
            out.push(path);
        }
    }
}

pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct IncrementalIndexer {
    store: Arc<PersistentStore>,
    embedder: SharedEmbedder,
}

impl IncrementalIndexer {
    pub fn new(store: Arc<PersistentStore>, embedder: SharedEmbedder) -> Self {
        Self { store, embedder }
    }

    /// Walks `root`, embedding new or changed chunks and reusing cached vectors for
    /// unchanged ones. Returns the full set of embedded chunks produced plus a
    /// summary of what was done.
    #[instrument(skip(self), fields(root = %root.display()))]
    pub async fn index_directory(&self, root: &Path) -> (Vec<EmbeddedChunk>, IndexStatus) {
        let mut status = IndexStatus::default();
        let mut embedded = Vec::new();

        let mut files = Vec::new();
        walk(root, &mut files);
        let files: Vec<PathBuf> = files.into_iter().filter(|p| chunk::is_indexable(p)).collect();

        for path in files {
            status.files_scanned += 1;
            let path_str = path.to_string_lossy().to_string();
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    status.errors.push(format!("{path_str}: {e}"));
                    continue;
                }
            };

            let chunks = chunk::chunk_file(&path_str, &content);
            let mut file_changed = false;

            for ck in &chunks {
                let hash = content_hash(&ck.content);
                match self.store.get_embedding(&ck.id, &hash) {
                    Ok(Some(vector)) => {
                        status.chunks_reused += 1;
                        embedded.push(EmbeddedChunk { chunk: ck.clone(), embedding: vector, hash });
                    }
                    Ok(None) => {
                        file_changed = true;
                        match self.embed_and_store(ck, &hash).await {
                            Ok(ec) => {
                                status.chunks_embedded += 1;
                                embedded.push(ec);
                            }
                            Err(e) => status.errors.push(format!("{}: {e}", ck.id)),
                        }
                    }
                    Err(e) => {
                        warn!(chunk = %ck.id, error = %e, "embedding cache lookup failed");
                        status.errors.push(format!("{}: {e}", ck.id));
                    }
                }
            }

            if !file_changed {
                status.files_skipped_unchanged += 1;
            }
        }

        (embedded, status)
    }

    async fn embed_and_store(&self, ck: &CodeChunk, hash: &str) -> anyhow::Result<EmbeddedChunk> {
        let vectors = self.embedder.embed(std::slice::from_ref(&ck.content)).await?;
        let vector = vectors.into_iter().next().unwrap_or_default();
        self.store.store_embedding(&ck.id, hash, &vector)?;
        Ok(EmbeddedChunk { chunk: ck.clone(), embedding: vector, hash: hash.to_string() })
    }

    /// Drops every cached embedding belonging to a file that no longer exists under
    /// the indexed roots, keyed by the `file_path:start:end` chunk id prefix.
    pub fn forget_file(&self, file_path: &str) -> anyhow::Result<()> {
        self.store.remove_embeddings_for_prefix(file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::embed::StubEmbedder;
    use crate::store::PersistentStore;
    use std::fs;

    fn setup() -> (tempfile::TempDir, IncrementalIndexer) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PersistentStore::open_in_memory().unwrap());
        let indexer = IncrementalIndexer::new(store, Arc::new(StubEmbedder));
        (dir, indexer)
    }

    #[tokio::test]
    async fn indexes_new_files_and_embeds_every_chunk() {
        let (dir, indexer) = setup();
        fs::write(dir.path().join("a.rs"), "fn a() {\n    1\n}\n").unwrap();
        let (embedded, status) = indexer.index_directory(dir.path()).await;
        assert_eq!(embedded.len(), 1);
        assert_eq!(status.chunks_embedded, 1);
        assert_eq!(status.chunks_reused, 0);
    }

    #[tokio::test]
    async fn re_indexing_unchanged_file_reuses_cached_embeddings() {
        let (dir, indexer) = setup();
        fs::write(dir.path().join("a.rs"), "fn a() {\n    1\n}\n").unwrap();
        let _ = indexer.index_directory(dir.path()).await;
        let (embedded, status) = indexer.index_directory(dir.path()).await;
        assert_eq!(embedded.len(), 1);
        assert_eq!(status.chunks_reused, 1);
        assert_eq!(status.chunks_embedded, 0);
        assert_eq!(status.files_skipped_unchanged, 1);
    }

    #[tokio::test]
    async fn changed_file_content_triggers_re_embedding() {
        let (dir, indexer) = setup();
        let path = dir.path().join("a.rs");
        fs::write(&path, "fn a() {\n    1\n}\n").unwrap();
        let _ = indexer.index_directory(dir.path()).await;
        fs::write(&path, "fn a() {\n    2\n}\n").unwrap();
        let (_, status) = indexer.index_directory(dir.path()).await;
        assert_eq!(status.chunks_embedded, 1);
    }

    #[tokio::test]
    async fn ignored_directories_are_skipped_entirely() {
        let (dir, indexer) = setup();
        fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/left_pad.js"), "function a() {}\n").unwrap();
        let (embedded, status) = indexer.index_directory(dir.path()).await;
        assert!(embedded.is_empty());
        assert_eq!(status.files_scanned, 0);
    }
}
