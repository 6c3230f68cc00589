//! Generic text chunkers for channels without their own.
//!
//! Both chunkers are lossless: concatenating the chunks yields the input.
//! Limits are counted in `char`s and cuts always land on char boundaries.

use crate::types::ChunkMode;

/// Split `text` with the chunker for `mode`.
#[must_use]
pub fn chunk_by_mode(text: &str, limit: usize, mode: ChunkMode) -> Vec<String> {
    match mode {
        ChunkMode::Text => chunk_text(text, limit),
        ChunkMode::Markdown => chunk_markdown(text, limit),
    }
}

/// Fixed-width chunking that prefers newline, then whitespace breaks.
///
/// `limit == 0` disables chunking. Empty input yields no chunks.
#[must_use]
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let Some(window) = window_end(rest, limit) else {
            chunks.push(rest.to_string());
            break;
        };
        let cut = plain_break(&rest[..window]);
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    chunks
}

/// Markdown-aware chunking.
///
/// Prefers paragraph breaks, then line breaks, and never cuts inside a
/// ```` ``` ```` or `~~~` fenced block unless the block alone exceeds the
/// limit.
#[must_use]
pub fn chunk_markdown(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let boundaries = markdown_boundaries(text);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let rest = &text[start..];
        let Some(window) = window_end(rest, limit) else {
            chunks.push(rest.to_string());
            break;
        };
        let end = start + window;
        let candidates = || {
            boundaries
                .iter()
                .filter(move |b| b.offset > start && b.offset <= end)
        };
        let cut = candidates()
            .filter(|b| b.paragraph)
            .map(|b| b.offset)
            .last()
            .or_else(|| candidates().map(|b| b.offset).last())
            .unwrap_or_else(|| start + plain_break(&rest[..window]));
        chunks.push(text[start..cut].to_string());
        start = cut;
    }
    chunks
}

/// Byte offset just past `limit` chars, or `None` when `rest` fits.
fn window_end(rest: &str, limit: usize) -> Option<usize> {
    if limit == 0 {
        return None;
    }
    rest.char_indices().nth(limit).map(|(i, _)| i)
}

/// Best cut inside a non-empty window: after the last newline, else after
/// the last whitespace, else the whole window.
fn plain_break(window: &str) -> usize {
    if let Some(i) = window.rfind('\n') {
        return i + 1;
    }
    window
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map_or(window.len(), |(i, c)| i + c.len_utf8())
}

#[derive(Debug, Clone, Copy)]
struct Boundary {
    /// Byte offset of a line start.
    offset: usize,
    /// The preceding line is blank.
    paragraph: bool,
}

/// Line starts that are outside any fenced block.
fn markdown_boundaries(text: &str) -> Vec<Boundary> {
    let mut out = Vec::new();
    let mut fence: Option<&'static str> = None;
    let mut offset = 0;
    let mut prev_blank = false;
    for line in text.split_inclusive('\n') {
        if offset > 0 && fence.is_none() {
            out.push(Boundary {
                offset,
                paragraph: prev_blank,
            });
        }
        let trimmed = line.trim_start();
        for marker in ["```", "~~~"] {
            if trimmed.starts_with(marker) {
                match fence {
                    None => fence = Some(marker),
                    Some(open) if open == marker => fence = None,
                    Some(_) => {},
                }
                break;
            }
        }
        prev_blank = line.trim().is_empty();
        offset += line.len();
    }
    out
}
