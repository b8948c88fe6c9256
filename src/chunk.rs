//! Paragraph-boundary text chunker.
//!
//! Splits extracted resource text into [`Chunk`]s of at most `max_tokens`
//! (approximated as characters / 4). Splits happen on blank lines first,
//! then on newlines or spaces inside oversized paragraphs.
//!
//! Sequence numbers are contiguous and start at 0 for every source;
//! context expansion relies on `sequence ± 1` addressing the adjacent
//! chunk of the same source.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
///
/// Whitespace-only text yields no chunks.
pub fn chunk_text(source: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut chunks = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            push_chunk(&mut chunks, source, &current_buf);
            current_buf.clear();
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, max_chars);
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    push_chunk(&mut chunks, source, piece);
                }
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        push_chunk(&mut chunks, source, &current_buf);
    }

    chunks
}

/// SHA-256 hex digest of a chunk's text.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn push_chunk(chunks: &mut Vec<Chunk>, source: &str, text: &str) {
    chunks.push(Chunk {
        source: source.to_string(),
        sequence: chunks.len(),
        text: text.to_string(),
        hash: hash_text(text),
    });
}

/// Largest index `<= max` that lies on a char boundary, never 0 for non-empty input.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    if idx == 0 {
        s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
    } else {
        idx
    }
}
