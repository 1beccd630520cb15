//! Text chunking for the docsearch indexer.
//!
//! Extracted document text is split into overlapping, size-bounded passages by
//! [`sentence::chunk_text`] before it is embedded. Chunk offsets are stable byte
//! positions in the source, which the indexer uses to derive chunk identifiers.
pub mod sentence;

pub use sentence::{Chunker, TextChunk, chunk_text, estimate_tokens};
