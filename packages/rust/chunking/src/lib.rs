//! Size-bounded text chunking.
//!
//! Two independent policies:
//! - [`chunk`]: character windows with overlap, snapped back to whitespace so
//!   words are not split.
//! - [`chunk_bytes`]: non-overlapping byte windows that never split a UTF-8
//!   character.
//!
//! Both return slices borrowed from the input.

use tracing::debug;

use pdfpipe_shared::{PipelineError, Result};

/// Default characters per overlapping chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1600;

/// Default characters shared by consecutive chunks.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Default bytes per markdown chunk.
pub const DEFAULT_CHUNK_BYTES: usize = 200_000;

/// Share of the window (in tenths) that must precede a whitespace snap point.
const SNAP_WINDOW_TENTHS: usize = 6;

// ---------------------------------------------------------------------------
// Params
// ---------------------------------------------------------------------------

/// Validated size/overlap pair for [`chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    size: usize,
    overlap: usize,
}

impl ChunkParams {
    /// Validate `size > 0` and `overlap < size`.
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            return Err(PipelineError::chunk_params("chunkSize must be positive"));
        }
        if overlap >= size {
            return Err(PipelineError::chunk_params(format!(
                "chunkOverlap ({overlap}) must be < chunkSize ({size})"
            )));
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

// ---------------------------------------------------------------------------
// Word-safe overlapping chunks
// ---------------------------------------------------------------------------

/// Split `text` into overlapping windows of at most `size` characters.
///
/// A window that stops short of the end is pulled back to the last whitespace
/// in its final 40%, as long as the next window would still move forward.
/// Each window is trimmed; empty windows are dropped.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Result<Vec<&str>> {
    let params = ChunkParams::new(size, overlap)?;
    Ok(chunk_with(text, params))
}

/// [`chunk`] with pre-validated params.
pub fn chunk_with(text: &str, params: ChunkParams) -> Vec<&str> {
    let ChunkParams { size, overlap } = params;

    // Byte offset of every char start, plus the end of the text.
    let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    offsets.push(text.len());
    let len = offsets.len() - 1;

    let is_space_at = |idx: usize| {
        text[offsets[idx]..]
            .chars()
            .next()
            .is_some_and(char::is_whitespace)
    };

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < len {
        let mut end = (start + size).min(len);

        if end < len {
            let window_start = start + size * SNAP_WINDOW_TENTHS / 10;
            let snap = (window_start + 1..end).rev().find(|&i| is_space_at(i));
            if let Some(snapped) = snap.filter(|&s| s > start + overlap) {
                end = snapped;
            }
        }

        let piece = text[offsets[start]..offsets[end]].trim();
        if !piece.is_empty() {
            chunks.push(piece);
        }

        if end >= len {
            break;
        }
        start = next_start(start, end, overlap, &is_space_at);
    }

    debug!(chars = len, chunks = chunks.len(), size, overlap, "chunked text");
    chunks
}

/// Start of the window after `[start, end)`.
///
/// The overlap is measured back from the last non-space char of the window, and
/// a start on whitespace moves back to the preceding non-space char, so the
/// trimmed chunks still share at least `overlap` chars.
fn next_start(start: usize, end: usize, overlap: usize, is_space_at: impl Fn(usize) -> bool) -> usize {
    let plain = end.saturating_sub(overlap);
    if overlap == 0 {
        return plain;
    }

    let mut trimmed_end = end;
    while trimmed_end > start && is_space_at(trimmed_end - 1) {
        trimmed_end -= 1;
    }

    let mut next = trimmed_end.saturating_sub(overlap);
    while next > start && is_space_at(next) {
        next -= 1;
    }

    // Keep moving forward on whitespace-heavy windows.
    if next > start { next } else { plain }
}

// ---------------------------------------------------------------------------
// Byte-safe chunks
// ---------------------------------------------------------------------------

/// Split `text` into consecutive slices of at most `byte_size` bytes.
///
/// Boundaries that fall inside a multi-byte character move back to its start.
/// A character wider than `byte_size` is emitted whole. Concatenating the
/// result reproduces `text` exactly.
pub fn chunk_bytes(text: &str, byte_size: usize) -> Result<Vec<&str>> {
    if byte_size == 0 {
        return Err(PipelineError::chunk_params("chunk byte size must be positive"));
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + byte_size).min(text.len());
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            let width = text[start..].chars().next().map_or(1, char::len_utf8);
            end = start + width;
        }
        chunks.push(&text[start..end]);
        start = end;
    }

    debug!(bytes = text.len(), chunks = chunks.len(), byte_size, "chunked bytes");
    Ok(chunks)
}

// ---------------------------------------------------------------------------
// Whitespace
// ---------------------------------------------------------------------------

/// Collapse whitespace runs to single spaces and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
