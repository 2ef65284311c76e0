//! Word-respecting chunking of generated text.
//!
//! A piece is one word plus the whitespace that follows it, so concatenating the
//! chunks of a text in order reproduces it exactly. Sizes and offsets count
//! characters, not bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default chunk target size in characters
pub const DEFAULT_CHUNK_SIZE: usize = 8;

/// Provenance attached to chunks when metadata is enabled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub provider: String,
    pub model: String,
    pub timestamp: DateTime<Utc>,
}

/// One delivered fragment of a generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    /// Character offset of the first character within the generation
    pub position: usize,
    /// Length in characters
    pub length: usize,
    pub is_word_boundary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChunkMetadata>,
}

impl StreamChunk {
    /// Offset one past the last character
    pub fn end(&self) -> usize {
        self.position + self.length
    }
}

/// Split `text` into word + trailing-whitespace pieces.
fn pieces(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_space = false;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_space = true;
        } else if in_space {
            out.push(&text[start..idx]);
            start = idx;
            in_space = false;
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

/// Chunk a complete fragment starting at `running_offset`.
///
/// Pieces accumulate until the next one would push the chunk past `max_size`.
/// A word longer than `max_size` becomes one oversized chunk; it is never split.
/// The last chunk is emitted even when undersized and counts as a word boundary.
pub fn chunk(text: &str, max_size: usize, running_offset: usize) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    let mut position = running_offset;

    for piece in pieces(text) {
        let piece_len = piece.chars().count();
        if !current.is_empty() && current_len + piece_len > max_size {
            chunks.push(StreamChunk {
                content: std::mem::take(&mut current),
                position,
                length: current_len,
                is_word_boundary: true,
                metadata: None,
            });
            position += current_len;
            current_len = 0;
        }
        current.push_str(piece);
        current_len += piece_len;
    }

    if !current.is_empty() {
        chunks.push(StreamChunk {
            content: current,
            position,
            length: current_len,
            is_word_boundary: true,
            metadata: None,
        });
    }
    chunks
}

/// Stateful chunker for one generation.
///
/// Provider fragments may end mid-word. The unfinished word is carried into the
/// next [`Chunker::push`] so every chunk ends on a word boundary; [`Chunker::finish`]
/// flushes whatever is left.
#[derive(Debug, Clone)]
pub struct Chunker {
    max_size: usize,
    offset: usize,
    carry: String,
    provenance: Option<(String, String)>,
}

impl Chunker {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            offset: 0,
            carry: String::new(),
            provenance: None,
        }
    }

    /// Stamp every emitted chunk with provider, model and emission time
    pub fn with_metadata(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provenance = Some((provider.into(), model.into()));
        self
    }

    /// Characters emitted so far
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn push(&mut self, fragment: &str) -> Vec<StreamChunk> {
        self.carry.push_str(fragment);
        let split = match self.carry.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
            Some((idx, ch)) => idx + ch.len_utf8(),
            None => return Vec::new(),
        };
        let tail = self.carry.split_off(split);
        let complete = std::mem::replace(&mut self.carry, tail);
        self.emit(&complete)
    }

    pub fn finish(&mut self) -> Vec<StreamChunk> {
        let rest = std::mem::take(&mut self.carry);
        self.emit(&rest)
    }

    fn emit(&mut self, text: &str) -> Vec<StreamChunk> {
        let mut chunks = chunk(text, self.max_size, self.offset);
        if let Some(last) = chunks.last() {
            self.offset = last.end();
        }
        if let Some((provider, model)) = &self.provenance {
            let timestamp = Utc::now();
            for c in &mut chunks {
                c.metadata = Some(ChunkMetadata {
                    provider: provider.clone(),
                    model: model.clone(),
                    timestamp,
                });
            }
        }
        chunks
    }
}
