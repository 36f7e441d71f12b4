//! Error types for the retriever.

/// Result type used throughout the retriever crate.
pub type Result<T> = std::result::Result<T, RetrieverError>;

/// Every failure the engine can surface to a caller.
///
/// The engine never exits the process; each variant maps to one of the
/// documented error policies. [`RetrieverError::code`] gives the stable
/// wire identifier used by transports and logs.
#[derive(Debug, thiserror::Error)]
pub enum RetrieverError {
    /// The query text was empty after trimming whitespace.
    #[error("query text is empty")]
    EmptyQuery,

    /// The regex side of a query could not compile the pattern. The vector
    /// side still proceeds; callers see a partial result.
    #[error("invalid regex pattern {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },

    /// A blob was not decodable as text. The file is skipped, the analyze
    /// pass continues.
    #[error("unreadable blob for {path}")]
    UnreadableBlob { path: String },

    /// A cache payload was present but structurally invalid. The engine
    /// discards it and rebuilds from scratch.
    #[error("cache payload is corrupt: {message}")]
    CacheCorrupt { message: String },

    /// The submission queue was full.
    #[error("task queue is at capacity")]
    Overloaded,

    /// The task's deadline passed before execution, or it was cancelled at
    /// a yield point.
    #[error("task was cancelled")]
    Cancelled,

    /// A source adapter failed after exhausting its retries.
    #[error("backend unavailable: {message}")]
    BackendUnavailable { message: String },

    /// An invariant was violated. Nothing is persisted for the failed
    /// operation.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RetrieverError {
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        Self::BackendUnavailable {
            message: err.to_string(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn cache_corrupt<S: Into<String>>(message: S) -> Self {
        Self::CacheCorrupt {
            message: message.into(),
        }
    }

    /// Stable identifier for wire signaling and log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyQuery => "EmptyQuery",
            Self::InvalidRegex { .. } => "InvalidRegex",
            Self::UnreadableBlob { .. } => "UnreadableBlob",
            Self::CacheCorrupt { .. } => "CacheCorrupt",
            Self::Overloaded => "Overloaded",
            Self::Cancelled => "Cancelled",
            Self::BackendUnavailable { .. } => "BackendUnavailable",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Whether this failure is worth retrying at the call site.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. } | Self::Overloaded)
    }
}

impl From<kelp_context::ChunkError> for RetrieverError {
    fn from(err: kelp_context::ChunkError) -> Self {
        match err {
            kelp_context::ChunkError::UnreadableBlob { path } => Self::UnreadableBlob { path },
        }
    }
}

impl From<sqlx::Error> for RetrieverError {
    fn from(err: sqlx::Error) -> Self {
        Self::backend(err)
    }
}
