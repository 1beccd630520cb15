//! Storage abstraction for chunk rows and their embeddings.
//!
//! The indexing pipeline and the search service only talk to [`VectorStore`];
//! [`sqlite_store::SqliteStore`] is the default backend, sharing the database
//! of [`crate::retrieval::file_index::FileIndex`].
//!
//! ## Architecture
//!
//! ```text
//! IndexingEngine ──┐
//!                  ├─ VectorStore ── SqliteStore ── FileIndex (sqlx pool)
//! SearchService ───┘
//! ```

use anyhow::Result;
use async_trait::async_trait;
use half::f16;
use serde::Serialize;
use std::collections::HashMap;

pub mod sqlite_store;

/// Stable chunk key: re-processing identical content upserts the same rows.
pub fn chunk_id(path: &str, page: usize, offset: usize) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(path.as_bytes());
    hasher.update(&[0]);
    hasher.update(page.to_string().as_bytes());
    hasher.update(&[0]);
    hasher.update(offset.to_string().as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Embedding-cache key of a chunk text, independent of where the text came from.
pub fn text_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// A chunk of one file page with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRow {
    pub id: String,
    pub path: String,
    /// Modification time of the file when the chunk was produced, unix ms.
    pub mtime: i64,
    pub page: usize,
    /// Byte offset of the chunk inside its page.
    pub offset: usize,
    pub text: String,
    #[serde(skip)]
    pub vector: Vec<f16>,
    pub source_type: String,
    pub title: Option<String>,
}

impl ChunkRow {
    /// Vector as f32, the form embeddings and queries use.
    pub fn vector_f32(&self) -> Vec<f32> {
        self.vector.iter().map(|v| v.to_f32()).collect()
    }
}

/// A store row and its cosine similarity to the query vector.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub row: ChunkRow,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert rows, replacing any row with the same id.
    async fn upsert_by_key(&self, rows: &[ChunkRow]) -> Result<()>;

    /// Delete every row of `path`; returns the number of rows removed.
    async fn delete_by_path(&self, path: &str) -> Result<u64>;

    /// Delete rows of `path` whose id is not in `keep_ids`.
    async fn delete_by_path_except(&self, path: &str, keep_ids: &[String]) -> Result<u64>;

    /// Make `rows` the complete set of rows for `path` in one step: upsert them
    /// and delete every other row of the path. Returns how many rows were
    /// deleted. Readers see either the old set or the new one.
    async fn replace_path(&self, path: &str, rows: &[ChunkRow]) -> Result<u64>;

    /// The `k` rows most similar to `vector`, best first.
    async fn nearest_neighbors(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    async fn count_rows(&self) -> Result<u64>;

    /// Rows of one path ordered by page and offset.
    async fn chunks_for_path(&self, path: &str) -> Result<Vec<ChunkRow>>;

    /// Cached vectors produced by `model`, keyed by [`text_hash`]. Hashes with
    /// no entry are absent from the map.
    async fn cached_embeddings(
        &self,
        model: &str,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f16>>>;

    /// Remember vectors produced by `model`, keyed by [`text_hash`].
    async fn cache_embeddings(&self, model: &str, entries: &[(String, Vec<f16>)]) -> Result<()>;

    /// Drop every cached vector; returns how many were removed.
    async fn clear_embedding_cache(&self) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_is_deterministic() {
        let a = chunk_id("/docs/a.md", 0, 120);
        assert_eq!(a, chunk_id("/docs/a.md", 0, 120));
        assert_eq!(a.len(), 64);
        assert_ne!(a, chunk_id("/docs/a.md", 1, 120));
        assert_ne!(a, chunk_id("/docs/a.md", 0, 121));
        // The separator keeps "1" + "20" apart from "12" + "0".
        assert_ne!(chunk_id("/d", 1, 20), chunk_id("/d", 12, 0));
    }

    #[test]
    fn test_text_hash_depends_only_on_text() {
        assert_eq!(text_hash("same words"), text_hash("same words"));
        assert_ne!(text_hash("same words"), text_hash("same words."));
    }
}
