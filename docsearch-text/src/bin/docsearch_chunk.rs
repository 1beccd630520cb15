use clap::Parser;
use docsearch_text::sentence::{DEFAULT_OVERLAP, DEFAULT_TARGET_SIZE, chunk_text};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};

/// Split a text file into overlapping chunks and print them as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input text file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Target chunk size in estimated tokens (one token per four characters).
    #[arg(short, long, default_value_t = DEFAULT_TARGET_SIZE)]
    target_size: usize,

    /// Overlap between consecutive chunks in estimated tokens.
    #[arg(short, long, default_value_t = DEFAULT_OVERLAP)]
    overlap: usize,
}

#[derive(Serialize)]
struct ChunkOutput<'a> {
    sequence: usize,
    offset: usize,
    estimated_tokens: usize,
    text: &'a str,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let content = if let Some(input_path) = args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let chunks = chunk_text(&content, args.target_size, args.overlap);
    let output: Vec<ChunkOutput> = chunks
        .iter()
        .map(|c| ChunkOutput {
            sequence: c.sequence,
            offset: c.offset,
            estimated_tokens: c.estimated_tokens(),
            text: &c.text,
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
