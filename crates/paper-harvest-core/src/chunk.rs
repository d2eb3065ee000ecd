//! Paragraph-boundary text chunker.
//!
//! Splits extracted paper text into [`TextChunk`]s that respect a
//! configurable `max_tokens` limit. Splitting happens on paragraph
//! boundaries (`\n\n`) when possible; oversized paragraphs are hard-split on
//! the nearest newline or space. When `overlap_tokens` is set, each chunk
//! after the first starts with the tail of the previous one.
//!
//! Chunk ids are `<document id>#<index>`, so re-processing the same document
//! replaces its chunks instead of adding new ones.
//!
//! ```rust
//! use paper_harvest_core::chunk::{chunk_text, ChunkingStrategy};
//!
//! let chunks = chunk_text("arxiv:2401.00001", "Abstract.\n\nIntroduction.", &ChunkingStrategy::default());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].id, "arxiv:2401.00001#0");
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::TextChunk;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingStrategy {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self {
            max_tokens: 700,
            overlap_tokens: 0,
        }
    }
}

/// Split text into chunks on paragraph boundaries.
///
/// Guarantees contiguous indices starting at 0 and at least one chunk for
/// non-empty text. Empty or whitespace-only text yields no chunks.
pub fn chunk_text(document_id: &str, text: &str, strategy: &ChunkingStrategy) -> Vec<TextChunk> {
    let max_chars = strategy.max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = (strategy.overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, max_chars);
                let actual = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[actual..];
            }
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    let mut chunks = Vec::with_capacity(pieces.len());
    for (index, piece) in pieces.iter().enumerate() {
        let body = if index > 0 && overlap_chars > 0 {
            let prev = &pieces[index - 1];
            let start = ceil_char_boundary(prev, prev.len().saturating_sub(overlap_chars));
            format!("{}\n\n{}", prev[start..].trim_start(), piece)
        } else {
            piece.clone()
        };
        chunks.push(make_chunk(document_id, index, &body));
    }
    chunks
}

fn make_chunk(document_id: &str, index: usize, text: &str) -> TextChunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    TextChunk {
        id: format!("{}#{}", document_id, index),
        document_id: document_id.to_string(),
        index,
        text: text.to_string(),
        hash,
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
