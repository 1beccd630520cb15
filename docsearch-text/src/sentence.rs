//! Sentence-aware chunking of extracted document text.
//!
//! Text is split into sentences, then sentences are packed greedily into chunks
//! whose estimated token count stays under a target size. Consecutive chunks share
//! a few trailing sentences so that a passage cut at a chunk boundary is still
//! retrievable from either side.
//!
//! Sentences tile the input exactly (each one keeps its trailing whitespace), so
//! every chunk is a verbatim slice of the source and its `offset` is the byte
//! position of that slice. Offsets always fall on `char` boundaries.
//!
//! ```
//! use docsearch_text::sentence::chunk_text;
//!
//! let text = "Sentence one. Sentence two. Sentence three.";
//! let chunks = chunk_text(text, 6, 2);
//!
//! assert!(chunks.len() >= 2);
//! assert_eq!(chunks[0].offset, 0);
//! assert!(chunks.windows(2).all(|w| w[0].offset < w[1].offset));
//! ```
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::LazyLock;

/// Default target chunk size, in estimated tokens.
pub const DEFAULT_TARGET_SIZE: usize = 256;

/// Default overlap between consecutive chunks, in estimated tokens.
pub const DEFAULT_OVERLAP: usize = 32;

/// Sentence terminators: Latin punctuation followed by whitespace or end of text,
/// CJK full-width punctuation, or a blank line.
static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[.!?]+(?:\s+|$)|[。！？]+\s*|\n[ \t]*\n\s*")
        .expect("sentence terminator pattern is valid")
});

/// A contiguous slice of the source text produced by [`chunk_text`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Zero-based position of the chunk in the output.
    pub sequence: usize,
    /// Byte offset of `text` within the source.
    pub offset: usize,
    pub text: String,
}

impl TextChunk {
    /// Byte offset one past the end of this chunk in the source.
    pub fn end(&self) -> usize {
        self.offset + self.text.len()
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.text)
    }
}

/// Rough token estimate: one token per four Unicode scalar values, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Chunking parameters, both expressed in estimated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunker {
    pub target_size: usize,
    pub overlap: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            target_size: DEFAULT_TARGET_SIZE,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

impl Chunker {
    pub fn new(target_size: usize, overlap: usize) -> Self {
        Self {
            target_size,
            overlap,
        }
    }

    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        chunk_text(text, self.target_size, self.overlap)
    }
}

struct Sentence {
    range: Range<usize>,
    tokens: usize,
}

/// Split `text` into byte ranges that tile it completely.
///
/// Whitespace-only pieces (a leading blank line, for example) are folded into a
/// neighbouring sentence so that every sentence carries some content.
fn sentence_ranges(text: &str) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(text) {
        if m.end() > start {
            ranges.push(start..m.end());
            start = m.end();
        }
    }
    if start < text.len() {
        ranges.push(start..text.len());
    }

    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    let mut pending_start: Option<usize> = None;
    for range in ranges {
        if text[range.clone()].trim().is_empty() {
            match merged.last_mut() {
                Some(last) => last.end = range.end,
                None => {
                    pending_start.get_or_insert(range.start);
                }
            }
            continue;
        }
        let start = pending_start.take().unwrap_or(range.start);
        merged.push(start..range.end);
    }
    merged
}

/// Split `text` into overlapping chunks of roughly `target_size` estimated tokens.
///
/// Empty or whitespace-only input yields no chunks; input shorter than the
/// target yields exactly one. A single sentence larger than the target becomes
/// a chunk of its own. After each emitted chunk, trailing sentences are carried
/// into the next one until they cover `overlap` tokens, but never the whole
/// previous chunk, so offsets strictly increase.
pub fn chunk_text(text: &str, target_size: usize, overlap: usize) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let target = target_size.max(1);

    let sentences: Vec<Sentence> = sentence_ranges(text)
        .into_iter()
        .map(|range| Sentence {
            tokens: estimate_tokens(&text[range.clone()]),
            range,
        })
        .collect();

    let mut chunks = Vec::new();
    let mut emit = |window: Range<usize>| {
        let start = sentences[window.start].range.start;
        let end = sentences[window.end - 1].range.end;
        chunks.push(TextChunk {
            sequence: chunks.len(),
            offset: start,
            text: text[start..end].to_string(),
        });
    };

    let mut first = 0;
    let mut buffered = 0;
    for (i, sentence) in sentences.iter().enumerate() {
        if i > first && buffered + sentence.tokens > target {
            emit(first..i);

            let mut keep_from = i;
            let mut kept = 0;
            while keep_from > first + 1 && kept < overlap {
                keep_from -= 1;
                kept += sentences[keep_from].tokens;
            }
            while keep_from < i && kept + sentence.tokens > target {
                kept -= sentences[keep_from].tokens;
                keep_from += 1;
            }
            first = keep_from;
            buffered = kept;
        }
        buffered += sentence.tokens;
    }
    emit(first..sentences.len());

    chunks
}

/// Rebuild the source text from chunks by dropping each chunk's overlap with its
/// predecessor.
pub fn reconstruct(chunks: &[TextChunk]) -> String {
    let mut out = String::new();
    let mut end: usize = 0;
    for chunk in chunks {
        let skip = end.saturating_sub(chunk.offset).min(chunk.text.len());
        out.push_str(&chunk.text[skip..]);
        end = end.max(chunk.end());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_well_formed(text: &str, chunks: &[TextChunk]) {
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i);
            assert_eq!(&text[chunk.offset..chunk.end()], chunk.text);
        }
        assert!(chunks.windows(2).all(|w| w[0].offset < w[1].offset));
        assert!(chunks.windows(2).all(|w| w[1].offset <= w[0].end()));
        assert_eq!(reconstruct(chunks), text);
    }

    #[test]
    fn test_three_sentences_split_into_multiple_chunks() {
        let text = "Sentence one. Sentence two. Sentence three.";
        let chunks = chunk_text(text, 6, 2);

        assert!(chunks.len() >= 2, "got {chunks:?}");
        assert_eq!(chunks[0].offset, 0);
        assert_well_formed(text, &chunks);
    }

    #[test]
    fn test_empty_and_whitespace_input() {
        assert!(chunk_text("", 100, 10).is_empty());
        assert!(chunk_text("   \n\n\t ", 100, 10).is_empty());
    }

    #[test]
    fn test_short_input_is_single_chunk() {
        let text = "A very short document.";
        let chunks = chunk_text(text, 100, 10);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].offset, 0);
    }

    #[test]
    fn test_overlap_carries_trailing_sentences() {
        let text = (0..40)
            .map(|i| format!("This is sentence number {i}. "))
            .collect::<String>();
        let chunks = chunk_text(&text, 40, 10);

        assert!(chunks.len() > 2);
        assert_well_formed(&text, &chunks);
        for pair in chunks.windows(2) {
            assert!(
                pair[1].offset < pair[0].end(),
                "chunk {} should overlap its predecessor",
                pair[1].sequence
            );
        }
        for chunk in &chunks {
            assert!(chunk.estimated_tokens() <= 40);
        }
    }

    #[test]
    fn test_zero_overlap_tiles_input() {
        let text = (0..30).map(|_| "Short one. ").collect::<String>();
        let chunks = chunk_text(&text, 12, 0);

        assert_well_formed(&text, &chunks);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end(), pair[1].offset);
        }
    }

    #[test]
    fn test_oversized_sentence_stands_alone() {
        let long = "word ".repeat(200);
        let text = format!("Intro sentence. {}. Outro sentence.", long.trim_end());
        let chunks = chunk_text(&text, 20, 5);

        assert!(chunks.iter().any(|c| c.text.contains("word word word")));
        assert_well_formed(&text, &chunks);
    }

    #[test]
    fn test_multibyte_text_offsets_are_char_boundaries() {
        let text = "Größe zählt nicht. 日本語の文です。もう一つの文。 Ünïcödé ēnds hérè! Ещё одно предложение?";
        let chunks = chunk_text(text, 4, 2);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(text.is_char_boundary(chunk.offset));
            assert!(text.is_char_boundary(chunk.end()));
        }
        assert_well_formed(text, &chunks);
    }

    #[test]
    fn test_blank_lines_end_sentences() {
        let text = "\n\nHeading without period\n\nParagraph text follows here\n\nLast line";
        let chunks = chunk_text(text, 3, 0);

        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].text.starts_with("\n\nHeading"));
        assert_well_formed(text, &chunks);
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let text = "Alpha beta. Gamma delta! Epsilon zeta? Eta theta. Iota kappa.";
        assert_eq!(chunk_text(text, 5, 3), chunk_text(text, 5, 3));
    }

    #[test]
    fn test_estimate_tokens_counts_chars() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("日本語の"), 1);
    }
}
