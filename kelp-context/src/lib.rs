//! kelp-context: content-addressed chunking for the kelp search engine
//!
//! This crate turns a committed file blob into a sequence of overlapping,
//! line-aligned chunks suitable for embedding and line-addressed search.
//! Chunk identifiers are content addresses: a stable digest of the owning
//! path, the starting line and the chunk text, so re-chunking identical
//! input always reproduces identical ids, on every platform.

pub mod chunk;

pub use chunk::{chunk_id, Chunk, ChunkError, ChunkerConfig};
