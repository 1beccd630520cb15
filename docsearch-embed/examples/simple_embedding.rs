//! Start a small pool, embed a few texts, and print pool statistics.
//!
//! Runs the hashing model in-process by default. Pass a FastEmbed model name
//! as the first argument to use a real model instead.

use docsearch_embed::{
    EmbedConfig, EmbedRole, EmbedderPool, InProcessLauncher, PoolConfig, WorkerServer,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(model) => EmbedConfig::fastembed(model),
        None => EmbedConfig::hashing(384),
    };
    let pool = EmbedderPool::new(
        config.with_batch_size(2),
        PoolConfig::default().with_pool_size(2),
        Arc::new(InProcessLauncher::new(WorkerServer::new())),
    );
    pool.initialize(2).await?;

    let texts = vec![
        "The quick brown fox jumps over the lazy dog".to_string(),
        "A fast auburn fox leaps above a sleepy hound".to_string(),
        "Quarterly tax payments are due in April".to_string(),
    ];
    let vectors = pool.embed(&texts, EmbedRole::Passage).await?;

    for (text, vector) in texts.iter().zip(&vectors) {
        let preview: Vec<String> = vector.iter().take(4).map(|v| format!("{v:.3}")).collect();
        println!("{text:<45} [{}, ...] ({} dims)", preview.join(", "), vector.len());
    }

    let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
    println!("\nfox vs fox: {:.3}", dot(&vectors[0], &vectors[1]));
    println!("fox vs tax: {:.3}", dot(&vectors[0], &vectors[2]));

    let stats = pool.get_stats();
    println!(
        "\n{} workers ready, {} embeds served, model {:?}",
        stats.ready_workers, stats.embeds_served, stats.model
    );
    pool.dispose().await?;
    Ok(())
}
