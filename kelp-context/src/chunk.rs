//! Line-oriented blob chunking with stable content-addressed identifiers.
//!
//! A blob is split into chunks of at most [`ChunkerConfig::chunk_lines`]
//! lines, consecutive chunks overlapping by
//! [`ChunkerConfig::overlap_lines`] lines so that a declaration sitting on
//! a boundary is still embedded with some of its surroundings. The chunk id
//! is `blake3(path \0 start_line \0 text)` rendered as lowercase hex.
//!
//! Decoding is lossy in a single well-defined mode: invalid UTF-8 sequences
//! become U+FFFD before hashing. Blobs containing NUL bytes are treated as
//! binary and rejected with [`ChunkError::UnreadableBlob`].

use serde::{Deserialize, Serialize};

/// Errors produced while chunking a blob.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// The blob is not text (contains NUL bytes) and cannot be indexed.
    #[error("unreadable blob for {path}")]
    UnreadableBlob { path: String },
}

/// How a blob is sliced into chunks.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    /// Maximum number of lines per chunk.
    pub chunk_lines: usize,
    /// Number of trailing lines repeated at the start of the next chunk.
    /// Must be smaller than `chunk_lines`.
    pub overlap_lines: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_lines: 40,
            overlap_lines: 8,
        }
    }
}

impl ChunkerConfig {
    pub fn new(chunk_lines: usize, overlap_lines: usize) -> Self {
        assert!(chunk_lines > 0, "chunk_lines must be positive");
        assert!(
            overlap_lines < chunk_lines,
            "overlap must leave a positive stride"
        );
        Self {
            chunk_lines,
            overlap_lines,
        }
    }

    fn stride(&self) -> usize {
        self.chunk_lines - self.overlap_lines
    }
}

/// An ordered range of lines cut from one blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    /// Repository-relative path of the owning file.
    pub path: String,
    /// 1-based line number of the first line in this chunk.
    pub start_line: u32,
    /// The chunk text, lines joined with `\n`.
    pub text: String,
    /// Content address: `blake3(path \0 start_line \0 text)` in hex.
    pub id: String,
    /// Git object id of the blob this chunk was cut from.
    pub blob_id: String,
}

impl Chunk {
    /// Number of lines covered by this chunk.
    pub fn line_count(&self) -> usize {
        self.text.split('\n').count()
    }

    /// 1-based line number of the last line in this chunk.
    pub fn end_line(&self) -> u32 {
        self.start_line + self.line_count() as u32 - 1
    }
}

/// Compute the stable content address for a chunk.
pub fn chunk_id(path: &str, start_line: u32, text: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(path.as_bytes());
    hasher.update(b"\0");
    hasher.update(start_line.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(text.as_bytes());
    hasher.finalize().to_hex().to_string()
}

impl ChunkerConfig {
    /// Split a blob's raw bytes into chunks.
    ///
    /// Empty blobs produce zero chunks. A blob shorter than `chunk_lines`
    /// produces exactly one chunk covering the whole file. Trailing blank
    /// lines are retained; the artifact of a final `\n` terminator is not
    /// counted as a line of its own.
    pub fn split_blob(
        &self,
        path: &str,
        blob_id: &str,
        bytes: &[u8],
    ) -> Result<Vec<Chunk>, ChunkError> {
        if bytes.contains(&0) {
            return Err(ChunkError::UnreadableBlob {
                path: path.to_string(),
            });
        }
        let text = String::from_utf8_lossy(bytes);
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let mut lines: Vec<&str> = text.split('\n').collect();
        if text.ends_with('\n') {
            lines.pop();
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;
        loop {
            let end = (start + self.chunk_lines).min(lines.len());
            let chunk_text = lines[start..end].join("\n");
            let start_line = (start + 1) as u32;
            chunks.push(Chunk {
                id: chunk_id(path, start_line, &chunk_text),
                path: path.to_string(),
                start_line,
                text: chunk_text,
                blob_id: blob_id.to_string(),
            });
            if end == lines.len() {
                break;
            }
            start += self.stride();
        }
        Ok(chunks)
    }
}
