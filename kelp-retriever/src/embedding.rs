//! Embedding providers.
//!
//! The engine treats the embedding model as an opaque, deterministic
//! function from text to a fixed-dimension vector. Providers are resolved
//! by name from configuration; the built-in `hashed` provider keeps the
//! whole engine local and reproducible, which is also what the test suite
//! runs against.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, RetrieverError};

/// Name of the built-in deterministic provider.
pub const HASHED_PROVIDER: &str = "hashed";

/// Default vector dimension for the hashed provider.
pub const DEFAULT_DIMENSION: usize = 256;

/// A deterministic function from text to a fixed-dimension vector.
///
/// Implementations must return the same vector for the same text on every
/// call; the staleness protocol depends on chunk ids, not embeddings, but
/// query scoring assumes embeddings do not drift between analyze and query.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per input, in order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Dimension of every vector this provider produces.
    fn dimension(&self) -> usize;

    /// Provider name as it appears in configuration.
    fn name(&self) -> &str;
}

impl std::fmt::Debug for dyn EmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingProvider")
            .field("name", &self.name())
            .field("dimension", &self.dimension())
            .finish()
    }
}

/// Resolve a provider by its configured name.
pub fn provider_for_name(name: &str) -> Result<Arc<dyn EmbeddingProvider>> {
    match name {
        HASHED_PROVIDER => Ok(Arc::new(HashedEmbedder::new(DEFAULT_DIMENSION))),
        other => Err(RetrieverError::internal(format!(
            "unknown embedding function {other:?}"
        ))),
    }
}

/// Feature-hashed bag-of-tokens embedder.
///
/// Each lowercase alphanumeric token is hashed into a bucket with a sign
/// bit; the accumulated vector is L2-normalized. Texts sharing vocabulary
/// land near each other under cosine similarity, and the output depends on
/// nothing but the input text.
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    pub fn new(dimension: usize) -> Self {
        assert!(dimension > 0);
        Self { dimension }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokens(text) {
            let digest = blake3::hash(token.as_bytes());
            let bytes = digest.as_bytes();
            let bucket =
                u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize % self.dimension;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashedEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        HASHED_PROVIDER
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
}
