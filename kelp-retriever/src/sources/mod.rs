//! Heterogeneous index sources.
//!
//! Both sources satisfy the same capability set (upsert chunks, query for
//! hits, delete by chunk id) and the engine and merger consume only that
//! capability, never a concrete source. The vector source answers
//! similarity queries from an embedding database; the regex source answers
//! pattern queries from a line-addressed in-memory corpus.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use kelp_context::Chunk;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod regex;
pub mod vector;

pub use self::regex::{LineCorpus, RegexSource};
pub use self::vector::VectorSource;

/// Which source produced a hit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Vector,
    Regex,
}

/// A single match returned by a source.
///
/// `score` is the source's similarity in [0, 1]: vector distance already
/// converted, regex matches always 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub path: String,
    pub line: u32,
    pub score: f32,
    pub source: SourceKind,
}

/// Capability set shared by every index source.
#[async_trait]
pub trait SearchSource: Send + Sync {
    /// Add or replace chunks, keyed by chunk id.
    async fn upsert(&self, chunks: &[Chunk]) -> Result<()>;

    /// Return up to `limit` hits for the query text.
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<Hit>>;

    /// Remove chunks by id.
    async fn delete(&self, chunk_ids: &[String]) -> Result<()>;
}

/// Attempts per failing backend call before the error surfaces.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Run a backend call, retrying transient failures with exponential
/// backoff. Non-transient errors surface immediately.
pub(crate) async fn with_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 1..=RETRY_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                tracing::warn!("{what} failed (attempt {attempt}/{RETRY_ATTEMPTS}): {err}");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("retry loop always returns")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetrieverError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry("flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RetrieverError::backend("transient"))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("down", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RetrieverError::backend("still down")) }
        })
        .await;
        assert_eq!(result.unwrap_err().code(), "BackendUnavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("bad-input", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RetrieverError::EmptyQuery) }
        })
        .await;
        assert_eq!(result.unwrap_err().code(), "EmptyQuery");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
