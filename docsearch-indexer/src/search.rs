//! Semantic search over indexed chunks.
//!
//! A query is embedded with the `query` role, the store is asked for
//! `k * oversample` nearest chunks, and the hits are grouped per file. Files
//! rank by their best chunk; ties go to the shorter path, then the
//! lexicographically smaller one.

use crate::config::IndexerConfig;
use crate::retrieval::change_tracker::path_key;
use crate::storage::{Neighbor, VectorStore};
use anyhow::{Context, Result, anyhow, bail};
use docsearch_embed::{EmbedError, EmbedRole, Embedder};
use docsearch_retry::RetryExecutor;
use itertools::Itertools;
use serde::Serialize;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// One matching chunk inside a result file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkMatch {
    pub text: String,
    pub score: f32,
    pub page: usize,
    pub offset: usize,
}

/// One file in a result list, with its best chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub path: String,
    /// Text of the best chunk.
    pub text: String,
    pub score: f32,
    /// Page of the best chunk.
    pub page: usize,
    pub title: Option<String>,
    /// Best chunks of this file, best first.
    pub matches: Vec<ChunkMatch>,
}

pub struct SearchService {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    retry: RetryExecutor<EmbedError>,
    oversample: usize,
    max_chunks_per_file: usize,
}

impl SearchService {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: &IndexerConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            retry: config.query_retry_profile.executor("query"),
            oversample: config.search_oversample(),
            max_chunks_per_file: config.max_chunks_per_file.max(1),
        }
    }

    /// The `k` files most similar to `query`. An empty query finds nothing.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let texts = vec![query.to_string()];
        let embedder = &self.embedder;
        let query_texts = &texts;
        let vector = self
            .retry
            .execute(move |_| embedder.embed(query_texts, EmbedRole::Query))
            .await
            .context("Failed to embed query")?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Embedder returned no vector for the query"))?;

        let neighbors = self
            .store
            .nearest_neighbors(&vector, k.saturating_mul(self.oversample))
            .await?;
        debug!("Query {query:?}: {} candidate chunks", neighbors.len());
        Ok(self.rank(neighbors, k, None))
    }

    /// Files similar to an indexed file, using the stored vectors of its first
    /// chunks as queries. The file itself is excluded.
    pub async fn similar(&self, path: &Path, k: usize) -> Result<Vec<SearchResult>> {
        let key = match tokio::fs::canonicalize(path).await {
            Ok(path) => path_key(&path),
            Err(_) => path_key(path),
        };
        let rows = self.store.chunks_for_path(&key).await?;
        if rows.is_empty() {
            bail!("{key} is not indexed");
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut neighbors = Vec::new();
        for row in rows.iter().take(self.max_chunks_per_file) {
            neighbors.extend(
                self.store
                    .nearest_neighbors(
                        &row.vector_f32(),
                        k.saturating_add(1).saturating_mul(self.oversample),
                    )
                    .await?,
            );
        }

        // The same chunk can answer several probes; keep its best score.
        let neighbors = neighbors
            .into_iter()
            .sorted_by(|a, b| compare_scores(b.score, a.score))
            .unique_by(|n| n.row.id.clone())
            .collect();
        Ok(self.rank(neighbors, k, Some(&key)))
    }

    fn rank(&self, neighbors: Vec<Neighbor>, k: usize, exclude: Option<&str>) -> Vec<SearchResult> {
        neighbors
            .into_iter()
            .filter(|n| exclude != Some(n.row.path.as_str()))
            .into_group_map_by(|n| n.row.path.clone())
            .into_iter()
            .map(|(path, hits)| {
                let mut hits: Vec<Neighbor> = hits
                    .into_iter()
                    .sorted_by(|a, b| {
                        compare_scores(b.score, a.score)
                            .then_with(|| a.row.page.cmp(&b.row.page))
                            .then_with(|| a.row.offset.cmp(&b.row.offset))
                    })
                    .take(self.max_chunks_per_file)
                    .collect();
                let best = hits.remove(0);
                let matches = std::iter::once(&best)
                    .chain(&hits)
                    .map(|n| ChunkMatch {
                        text: n.row.text.clone(),
                        score: n.score,
                        page: n.row.page,
                        offset: n.row.offset,
                    })
                    .collect();
                SearchResult {
                    path,
                    text: best.row.text,
                    score: best.score,
                    page: best.row.page,
                    title: best.row.title,
                    matches,
                }
            })
            .sorted_by(|a, b| {
                compare_scores(b.score, a.score)
                    .then_with(|| a.path.len().cmp(&b.path.len()))
                    .then_with(|| a.path.cmp(&b.path))
            })
            .take(k)
            .collect()
    }
}

fn compare_scores(a: f32, b: f32) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}
