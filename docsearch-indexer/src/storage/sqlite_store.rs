//! SQLite implementation of [`VectorStore`].
//!
//! Rows live in the `chunks` table of the [`FileIndex`] database. Vectors are
//! stored as little-endian f16 blobs and searched by brute-force cosine
//! similarity, which is adequate for personal document collections.
//!
//! The `embedding_cache` table maps `(text_hash, model)` to a vector so text
//! that was embedded once, in any file, is not sent to the workers again.

use super::{ChunkRow, Neighbor, VectorStore};
use crate::retrieval::file_index::FileIndex;
use anyhow::Result;
use async_trait::async_trait;
use half::f16;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

const CHUNK_COLUMNS: &str = "id, path, mtime, page, byte_offset, text, vector, source_type, title";

/// SQLite-backed vector store. Cheap to clone.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    file_index: FileIndex,
}

impl SqliteStore {
    pub fn new(file_index: FileIndex) -> Self {
        Self { file_index }
    }

    fn row_to_chunk(row: &SqliteRow) -> Result<ChunkRow> {
        let blob: Vec<u8> = row.try_get("vector")?;
        Ok(ChunkRow {
            id: row.try_get("id")?,
            path: row.try_get("path")?,
            mtime: row.try_get("mtime")?,
            page: row.try_get::<i64, _>("page")? as usize,
            offset: row.try_get::<i64, _>("byte_offset")? as usize,
            text: row.try_get("text")?,
            vector: decode_vector(&blob),
            source_type: row.try_get("source_type")?,
            title: row.try_get("title")?,
        })
    }
}

async fn upsert_rows(conn: &mut SqliteConnection, rows: &[ChunkRow]) -> Result<()> {
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, path, mtime, page, byte_offset, text, vector, source_type, title)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                mtime = excluded.mtime,
                text = excluded.text,
                vector = excluded.vector,
                source_type = excluded.source_type,
                title = excluded.title,
                created_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&row.id)
        .bind(&row.path)
        .bind(row.mtime)
        .bind(row.page as i64)
        .bind(row.offset as i64)
        .bind(&row.text)
        .bind(encode_vector(&row.vector))
        .bind(&row.source_type)
        .bind(&row.title)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn prune_rows(conn: &mut SqliteConnection, path: &str, keep_ids: &HashSet<&str>) -> Result<u64> {
    let existing = sqlx::query_scalar::<_, String>("SELECT id FROM chunks WHERE path = ?1")
        .bind(path)
        .fetch_all(&mut *conn)
        .await?;

    let mut removed = 0;
    for id in existing.iter().filter(|id| !keep_ids.contains(id.as_str())) {
        removed += sqlx::query("DELETE FROM chunks WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(removed)
}

/// Blob bytes are not guaranteed to be 2-byte aligned, so copy rather than cast.
fn decode_vector(bytes: &[u8]) -> Vec<f16> {
    bytemuck::pod_collect_to_vec(&bytes[..bytes.len() - bytes.len() % 2])
}

fn encode_vector(vector: &[f16]) -> &[u8] {
    bytemuck::cast_slice(vector)
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert_by_key(&self, rows: &[ChunkRow]) -> Result<()> {
        let mut tx = self.file_index.pool().begin().await?;
        upsert_rows(&mut *tx, rows).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_path(&self, path: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE path = ?1")
            .bind(path)
            .execute(self.file_index.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_path_except(&self, path: &str, keep_ids: &[String]) -> Result<u64> {
        let keep: HashSet<&str> = keep_ids.iter().map(String::as_str).collect();
        let mut tx = self.file_index.pool().begin().await?;
        let removed = prune_rows(&mut *tx, path, &keep).await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn replace_path(&self, path: &str, rows: &[ChunkRow]) -> Result<u64> {
        let keep: HashSet<&str> = rows.iter().map(|row| row.id.as_str()).collect();
        let mut tx = self.file_index.pool().begin().await?;
        upsert_rows(&mut *tx, rows).await?;
        let removed = prune_rows(&mut *tx, path, &keep).await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn nearest_neighbors(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if k == 0 || vector.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!("SELECT {CHUNK_COLUMNS} FROM chunks"))
            .fetch_all(self.file_index.pool())
            .await?;

        let mut neighbors = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = Self::row_to_chunk(row)?;
            let score = cosine_similarity(vector, &chunk.vector);
            neighbors.push(Neighbor { row: chunk, score });
        }

        neighbors.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.row.path.cmp(&b.row.path))
                .then_with(|| a.row.page.cmp(&b.row.page))
                .then_with(|| a.row.offset.cmp(&b.row.offset))
        });
        neighbors.truncate(k);
        Ok(neighbors)
    }

    async fn count_rows(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(self.file_index.pool())
            .await?;
        Ok(count as u64)
    }

    async fn chunks_for_path(&self, path: &str) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE path = ?1 ORDER BY page, byte_offset"
        ))
        .bind(path)
        .fetch_all(self.file_index.pool())
        .await?;
        rows.iter().map(Self::row_to_chunk).collect()
    }

    async fn cached_embeddings(
        &self,
        model: &str,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f16>>> {
        let mut found = HashMap::new();
        for hash in hashes {
            if found.contains_key(hash) {
                continue;
            }
            let blob: Option<Vec<u8>> = sqlx::query_scalar(
                "SELECT vector FROM embedding_cache WHERE text_hash = ?1 AND model = ?2",
            )
            .bind(hash)
            .bind(model)
            .fetch_optional(self.file_index.pool())
            .await?;
            if let Some(blob) = blob {
                found.insert(hash.clone(), decode_vector(&blob));
            }
        }
        Ok(found)
    }

    async fn cache_embeddings(&self, model: &str, entries: &[(String, Vec<f16>)]) -> Result<()> {
        let mut tx = self.file_index.pool().begin().await?;
        for (hash, vector) in entries {
            sqlx::query(
                r#"
                INSERT INTO embedding_cache (text_hash, model, vector)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(text_hash, model) DO UPDATE SET vector = excluded.vector
                "#,
            )
            .bind(hash)
            .bind(model)
            .bind(encode_vector(vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear_embedding_cache(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM embedding_cache")
            .execute(self.file_index.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

/// Cosine similarity between a query and a stored vector. Mismatched lengths
/// and zero vectors score 0.
fn cosine_similarity(query: &[f32], stored: &[f16]) -> f32 {
    if query.len() != stored.len() {
        return 0.0;
    }

    let mut dot_product = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (a, b) in query.iter().zip(stored) {
        let b = b.to_f32();
        dot_product += a * b;
        norm_a += a * a;
        norm_b += b * b;
    }

    let norm_a = norm_a.sqrt();
    let norm_b = norm_b.sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{chunk_id, text_hash};

    fn row(path: &str, offset: usize, vector: &[f32]) -> ChunkRow {
        ChunkRow {
            id: chunk_id(path, 0, offset),
            path: path.to_string(),
            mtime: 1,
            page: 0,
            offset,
            text: format!("{path}@{offset}"),
            vector: vector.iter().copied().map(f16::from_f32).collect(),
            source_type: "text".to_string(),
            title: None,
        }
    }

    async fn store() -> Result<SqliteStore> {
        Ok(SqliteStore::new(FileIndex::open_memory().await?))
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_key() -> Result<()> {
        let store = store().await?;
        store.upsert_by_key(&[row("/a.md", 0, &[1.0, 0.0])]).await?;

        let mut changed = row("/a.md", 0, &[0.0, 1.0]);
        changed.text = "rewritten".to_string();
        store.upsert_by_key(&[changed]).await?;

        assert_eq!(store.count_rows().await?, 1);
        let rows = store.chunks_for_path("/a.md").await?;
        assert_eq!(rows[0].text, "rewritten");
        assert_eq!(rows[0].vector_f32(), vec![0.0, 1.0]);
        Ok(())
    }

    #[tokio::test]
    async fn test_nearest_neighbors_ranked_by_cosine() -> Result<()> {
        let store = store().await?;
        store
            .upsert_by_key(&[
                row("/a.md", 0, &[1.0, 0.0, 0.0]),
                row("/b.md", 0, &[0.6, 0.8, 0.0]),
                row("/c.md", 0, &[0.0, 0.0, 1.0]),
            ])
            .await?;

        let hits = store.nearest_neighbors(&[1.0, 0.1, 0.0], 2).await?;
        let paths: Vec<_> = hits.iter().map(|n| n.row.path.as_str()).collect();
        assert_eq!(paths, vec!["/a.md", "/b.md"]);
        assert!(hits[0].score > hits[1].score);

        assert!(store.nearest_neighbors(&[1.0, 0.0, 0.0], 0).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_by_path_except_prunes_stale_rows() -> Result<()> {
        let store = store().await?;
        store
            .upsert_by_key(&[
                row("/a.md", 0, &[1.0]),
                row("/a.md", 10, &[1.0]),
                row("/a.md", 20, &[1.0]),
                row("/b.md", 0, &[1.0]),
            ])
            .await?;

        let keep = vec![chunk_id("/a.md", 0, 0)];
        assert_eq!(store.delete_by_path_except("/a.md", &keep).await?, 2);
        assert_eq!(store.chunks_for_path("/a.md").await?.len(), 1);

        assert_eq!(store.delete_by_path("/a.md").await?, 1);
        assert_eq!(store.count_rows().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_replace_path_swaps_the_whole_set() -> Result<()> {
        let store = store().await?;
        store
            .upsert_by_key(&[
                row("/a.md", 0, &[1.0]),
                row("/a.md", 10, &[1.0]),
                row("/b.md", 0, &[1.0]),
            ])
            .await?;

        let mut rewritten = row("/a.md", 0, &[0.5]);
        rewritten.text = "new text".to_string();
        let removed = store
            .replace_path("/a.md", &[rewritten, row("/a.md", 30, &[0.5])])
            .await?;

        assert_eq!(removed, 1);
        let rows = store.chunks_for_path("/a.md").await?;
        let offsets: Vec<_> = rows.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 30]);
        assert_eq!(rows[0].text, "new text");
        assert_eq!(store.chunks_for_path("/b.md").await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_embedding_cache_is_per_model() -> Result<()> {
        let store = store().await?;
        let hash = text_hash("cached words");
        let vector: Vec<f16> = [0.25f32, -1.0].into_iter().map(f16::from_f32).collect();
        store
            .cache_embeddings("model-a", &[(hash.clone(), vector.clone())])
            .await?;

        let hits = store
            .cached_embeddings("model-a", &[hash.clone(), text_hash("unknown")])
            .await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[&hash], vector);
        assert!(store.cached_embeddings("model-b", &[hash.clone()]).await?.is_empty());

        assert_eq!(store.clear_embedding_cache().await?, 1);
        assert!(store.cached_embeddings("model-a", &[hash]).await?.is_empty());
        Ok(())
    }

    #[test]
    fn test_cosine_similarity() {
        let h = |v: &[f32]| v.iter().copied().map(f16::from_f32).collect::<Vec<_>>();

        assert_eq!(cosine_similarity(&[1.0, 0.0], &h(&[1.0, 0.0])), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &h(&[0.0, 1.0])), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &h(&[-1.0, 0.0])), -1.0);
        assert!((cosine_similarity(&[0.6, 0.8], &h(&[0.8, 0.6])) - 0.96).abs() < 0.01);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &h(&[1.0, 1.0])), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &h(&[1.0, 2.0, 3.0])), 0.0);
    }

    #[test]
    fn test_decode_tolerates_unaligned_blob() {
        let vector = vec![f16::from_f32(0.5), f16::from_f32(-2.0)];
        let mut padded = vec![0u8];
        padded.extend_from_slice(encode_vector(&vector));
        assert_eq!(decode_vector(&padded[1..]), vector);
    }
}
