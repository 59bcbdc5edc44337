//! Line-bounded, overlapping chunking.
//!
//! Token counts are approximated as `chars / 4`. Lines are never split, so a
//! single line longer than the target still becomes exactly one chunk.

use crate::{config::ChunkConfig, hash::sha256_hex};

/// Characters per approximate token.
pub const CHARS_PER_TOKEN: usize = 4;

/// A chunk of text with its 1-indexed, inclusive line range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Split `text` into overlapping windows of whole lines.
///
/// A window is emitted once its character count reaches the target size.
/// The next window is then seeded with the longest suffix of the emitted
/// lines that fits in the overlap budget (never the whole window), so the
/// next `start_line` is `previous end_line - carried lines + 1`.
pub fn chunk_text(text: &str, config: &ChunkConfig) -> Vec<RawChunk> {
    let max_chars = config.target_tokens.saturating_mul(CHARS_PER_TOKEN).max(1);
    let overlap_chars = config.overlap_tokens.saturating_mul(CHARS_PER_TOKEN);

    let mut chunks = Vec::new();
    let mut window: Vec<(usize, &str)> = Vec::new();
    let mut window_chars = 0usize;
    // Lines added since the last emit; a trailing window made only of
    // carried-over lines is already covered by the previous chunk.
    let mut fresh = 0usize;

    for (idx, line) in text.lines().enumerate() {
        window.push((idx + 1, line));
        window_chars += line_weight(line);
        fresh += 1;

        if window_chars >= max_chars {
            emit(&window, &mut chunks);
            let carried = overlap_len(&window, overlap_chars);
            window.drain(..window.len() - carried);
            window_chars = window.iter().map(|(_, l)| line_weight(l)).sum();
            fresh = 0;
        }
    }

    if fresh > 0 {
        emit(&window, &mut chunks);
    }

    chunks
}

/// Line length plus its newline.
fn line_weight(line: &str) -> usize {
    line.chars().count() + 1
}

/// Number of trailing lines to carry into the next window.
fn overlap_len(window: &[(usize, &str)], overlap_chars: usize) -> usize {
    let mut acc = 0usize;
    let mut kept = 0usize;
    for (_, line) in window.iter().rev().take(window.len().saturating_sub(1)) {
        let weight = line_weight(line);
        if acc + weight > overlap_chars {
            break;
        }
        acc += weight;
        kept += 1;
    }
    kept
}

fn emit(window: &[(usize, &str)], chunks: &mut Vec<RawChunk>) {
    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        return;
    };
    let joined = window
        .iter()
        .map(|(_, line)| *line)
        .collect::<Vec<_>>()
        .join("\n");
    let text = joined.trim();
    if text.is_empty() {
        return;
    }
    chunks.push(RawChunk {
        start_line: first.0,
        end_line: last.0,
        text: text.to_string(),
        hash: sha256_hex(text),
    });
}
