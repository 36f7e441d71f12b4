//! kelp-retriever: query engine and index maintainer for kelp
//!
//! This crate is the core of the search engine: it discovers committed
//! files from Git, slices them into content-addressed chunks, and keeps
//! two heterogeneous index sources in step: an embedding database and a
//! line-addressed regex corpus. Queries fan out to both sources
//! concurrently and merge into ranked, context-bearing blocks.
//!
//! ## Modules
//!
//! - [`repository`]: Git scanner: tracked files, blob contents, frecency
//! - [`cache`]: durable analysis state, versioned per repository
//! - [`embedding`]: embedding provider abstraction and registry
//! - [`sources`]: the vector and regex sources behind one capability trait
//! - [`merge`]: hit merging, context expansion, bridging, ranking
//! - [`engine`]: orchestration of scanner → chunker → sources → cache
//! - [`task_queue`]: the single worker that serializes all engine calls
//!
//! ## Architecture
//!
//! ```text
//! Git HEAD → Repository → Chunker → VectorSource ─┐
//!                │                  RegexSource  ─┼→ merge → blocks
//!                └── frecency ────────────────────┘
//!          (all mutation serialized by the task queue's single worker)
//! ```

pub mod cache;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod merge;
pub mod repository;
pub mod sources;
pub mod task_queue;

pub use engine::{CancelToken, Engine, EngineConfig, QueryOptions};
pub use error::{Result, RetrieverError};
pub use merge::{MergeConfig, SearchResult};
pub use task_queue::{spawn_worker, QueueHandle, TaskQueueConfig, TaskRequest};
