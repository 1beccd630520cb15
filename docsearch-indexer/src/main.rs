use anyhow::Result;
use clap::{Parser, Subcommand};
use docsearch_indexer::{
    DocSearch, FileStatus, IndexStatus, IndexerConfig, SearchResult, TrackedFile,
    storage::sqlite_store::SqliteStore,
};
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

/// Index folders of documents and search them by meaning.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the .docsearch.db database file
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,

    /// Config file (default: <data-dir>/docsearch.toml, if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Files indexed at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Run embedding workers inside this process instead of as subprocesses
    #[arg(long)]
    in_process: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index one or more directories
    Index {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
        /// Keep running and index changes as they happen
        #[arg(short, long)]
        watch: bool,
    },
    /// Search indexed documents
    Search {
        query: String,
        /// Maximum number of files
        #[arg(short, default_value_t = 10)]
        k: usize,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Find documents similar to an indexed file
    Similar {
        path: PathBuf,
        #[arg(short, default_value_t = 10)]
        k: usize,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// List tracked files
    Files {
        /// Only files with this status (queued, processing, indexed, failed, error, outdated)
        #[arg(short, long)]
        status: Option<FileStatus>,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show index status
    Status {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Remove a file, or everything under a directory, from the index
    Remove { path: PathBuf },
    /// Re-index files processed by an older parser version
    ReindexOutdated,
    /// Delete every tracked file, chunk and folder
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" | "text" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<IndexerConfig> {
    let mut config = match &args.config {
        Some(path) => IndexerConfig::load(path)?,
        None => IndexerConfig::load_or_default(&args.data_dir.join("docsearch.toml"))?,
    };
    if let Some(concurrency) = args.concurrency {
        config = config.with_concurrency(concurrency);
    }
    if args.in_process {
        config = config.with_in_process_workers(true);
    }
    config.validate()?;
    Ok(config)
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Commands::Index { dirs, watch } => {
            let docsearch = DocSearch::open(&args.data_dir, config).await?;
            docsearch.start_embedder().await?;
            docsearch.start()?;

            for dir in &dirs {
                let summary = docsearch.index_folder(dir).await?;
                println!(
                    "{}: {} new, {} modified, {} unchanged, {} deleted ({} queued, {} deferred)",
                    summary.root.display(),
                    summary.new,
                    summary.modified,
                    summary.unchanged,
                    summary.deleted,
                    summary.queued,
                    summary.deferred
                );
            }
            docsearch.wait_until_idle().await;
            let progress = docsearch.engine().progress();
            println!(
                "Indexed {} files, {} failed, {} errors, {} unchanged",
                progress.done, progress.failed, progress.errors, progress.skipped
            );

            if watch {
                let mut watchers = Vec::new();
                for dir in &dirs {
                    watchers.push(docsearch.watch(dir).await?);
                }
                println!("Watching for changes, press Ctrl-C to stop");
                tokio::signal::ctrl_c().await?;
                for watcher in watchers {
                    watcher.close().await?;
                }
            }
            docsearch.shutdown().await
        }
        Commands::Search { query, k, format } => {
            let docsearch = DocSearch::open(&args.data_dir, config).await?;
            docsearch.start_embedder().await?;
            let results = docsearch.search(&query, k).await;
            docsearch.shutdown().await?;
            print_results(&results?, format)
        }
        Commands::Similar { path, k, format } => {
            // Stored vectors are compared directly; no workers are needed.
            let docsearch = open_without_workers(&args.data_dir, config).await?;
            let results = docsearch.similar(&path, k).await?;
            print_results(&results, format)
        }
        Commands::Files { status, format } => {
            let docsearch = open_without_workers(&args.data_dir, config).await?;
            let files = docsearch.files(status).await?;
            print_files(&files, format)
        }
        Commands::Status { format } => {
            let docsearch = open_without_workers(&args.data_dir, config).await?;
            let index = docsearch.file_index();
            let status = IndexStatus::collect(
                index,
                &SqliteStore::new(index.clone()),
                docsearch.config().parser_version,
            )
            .await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
                OutputFormat::Summary => print!("{status}"),
            }
            Ok(())
        }
        Commands::Remove { path } => {
            let docsearch = open_without_workers(&args.data_dir, config).await?;
            let removed = docsearch.remove(&path).await?;
            println!("Removed {removed} files from the index");
            Ok(())
        }
        Commands::ReindexOutdated => {
            let docsearch = DocSearch::open(&args.data_dir, config).await?;
            docsearch.start_embedder().await?;
            docsearch.start()?;
            let queued = docsearch.reindex_outdated().await?;
            println!("Re-indexing {queued} outdated files");
            docsearch.wait_until_idle().await;
            docsearch.shutdown().await
        }
        Commands::Clear => {
            let docsearch = open_without_workers(&args.data_dir, config).await?;
            docsearch.clear().await?;
            println!("Index cleared");
            Ok(())
        }
    }
}

/// For commands that never embed: the pool is built but its workers are never
/// started, so the worker binary need not be present.
async fn open_without_workers(data_dir: &Path, config: IndexerConfig) -> Result<DocSearch> {
    DocSearch::open(data_dir, config.with_in_process_workers(true)).await
}

fn print_results(results: &[SearchResult], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(results)?),
        OutputFormat::Summary => {
            if results.is_empty() {
                println!("No matches");
            }
            for (rank, result) in results.iter().enumerate() {
                let title = result.title.as_deref().unwrap_or("");
                println!("{:>2}. {:.3} {} {}", rank + 1, result.score, result.path, title);
                println!(
                    "    p.{}: {}",
                    result.page + 1,
                    preview(&result.text, 160)
                );
            }
        }
    }
    Ok(())
}

fn print_files(files: &[TrackedFile], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(files)?),
        OutputFormat::Summary => {
            println!("Found {} files:", files.len());
            for file in files {
                match &file.error_message {
                    Some(message) => println!("  {:<10} {} ({})", file.status, file.path, message),
                    None => println!(
                        "  {:<10} {} ({} chunks)",
                        file.status, file.path, file.chunk_count
                    ),
                }
            }
        }
    }
    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        format!("{}...", flat.chars().take(max_chars).collect::<String>())
    }
}
