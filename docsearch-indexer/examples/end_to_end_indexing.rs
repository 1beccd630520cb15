//! End-to-end example: index a small folder of notes and search it.
//!
//! Uses the hashing model with in-process workers, so nothing is downloaded.
//! Swap in `EmbedConfig::fastembed(...)` for real semantic search.

use anyhow::Result;
use docsearch_embed::EmbedConfig;
use docsearch_indexer::{DocSearch, FileEvent, IndexerConfig};
use std::path::Path;
use tempfile::tempdir;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let data_dir = tempdir()?;
    let docs_dir = tempdir()?;
    create_notes(docs_dir.path())?;

    let config = IndexerConfig::default()
        .with_model(EmbedConfig::hashing(256))
        .with_in_process_workers(true);
    let docsearch = DocSearch::open(data_dir.path(), config).await?;
    docsearch.start_embedder().await?;
    docsearch.start()?;

    let mut events = docsearch.engine().subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let FileEvent::Transition { path, status } = event {
                println!("  {status:<10} {path}");
            }
        }
    });

    let summary = docsearch.index_folder(docs_dir.path()).await?;
    println!("Queued {} of {} files", summary.queued, summary.new);
    docsearch.wait_until_idle().await;

    for query in ["how often should I water tomatoes", "rotating log files"] {
        println!("\nQuery: {query}");
        for hit in docsearch.search(query, 3).await? {
            println!("  {:.3} {}", hit.score, hit.path);
        }
    }

    println!("\n{}", docsearch.status().await?);
    docsearch.shutdown().await?;
    printer.abort();
    Ok(())
}

fn create_notes(dir: &Path) -> Result<()> {
    std::fs::write(
        dir.join("garden.md"),
        "# Garden\n\nTomatoes need full sun. Water them deeply twice a week, \
         more often during a heat wave.\n",
    )?;
    std::fs::write(
        dir.join("ops.md"),
        "# Operations\n\nLog files are rotated nightly by logrotate and kept for \
         fourteen days before deletion.\n",
    )?;
    std::fs::write(
        dir.join("recipes.txt"),
        "Roast the tomatoes with garlic and olive oil for forty minutes.\n",
    )?;
    Ok(())
}
