//! Error taxonomy.
//!
//! Pipeline errors ([`FetchError`], [`ExtractError`], [`BuildError`],
//! [`SwapError`]) stay inside the sync orchestrator, which records them as its
//! last error. [`EngineError`] is the only error a query caller sees.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("timed out after {secs}s fetching {url}")]
    Timeout { url: String, secs: u64 },

    #[error("origin not allowed: {0}")]
    OriginNotAllowed(String),

    #[error("file extension not allowed: {0}")]
    ExtensionNotAllowed(String),

    #[error("{file_id} is {size} bytes, limit is {limit}")]
    TooLarge {
        file_id: String,
        size: u64,
        limit: u64,
    },

    #[error("path escapes staging directory: {}", .0.display())]
    PathTraversal(PathBuf),

    #[error("invalid content version: {0}")]
    InvalidVersion(String),

    #[error("malformed upstream response: {0}")]
    Malformed(String),

    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// True for errors raised by provenance or bounds checks rather than the
    /// transfer itself.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            FetchError::OriginNotAllowed(_)
                | FetchError::ExtensionNotAllowed(_)
                | FetchError::TooLarge { .. }
                | FetchError::PathTraversal(_)
                | FetchError::InvalidVersion(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no exported object found in {0}")]
    NoObject(String),

    #[error("malformed source in {file}: {message}")]
    Malformed { file: String, message: String },

    #[error("{file}: missing required key '{key}'")]
    MissingKey { file: String, key: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no documents to build")]
    Empty,

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("embedding service returned {got} vectors for {expected} texts")]
    VectorCount { expected: usize, got: usize },

    #[error("invalid index: {0}")]
    Index(String),

    #[error("storage write failed: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for BuildError {
    fn from(e: sqlx::Error) -> Self {
        BuildError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for BuildError {
    fn from(e: std::io::Error) -> Self {
        BuildError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(e: serde_json::Error) -> Self {
        BuildError::Storage(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("failed to promote staging generation: {source}")]
    Promote {
        #[source]
        source: std::io::Error,
    },
}

/// Errors visible to read-API callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("knowledge base not ready: {0}")]
    NotReady(String),

    #[error("knowledge base temporarily unavailable, retry in {retry_after_secs}s")]
    TemporarilyUnavailable { retry_after_secs: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("embedding failed: {0}")]
    Embedding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_distinguished() {
        assert!(FetchError::OriginNotAllowed("evil.example".into()).is_validation());
        assert!(FetchError::TooLarge {
            file_id: "model.js".into(),
            size: 11,
            limit: 10
        }
        .is_validation());
        assert!(!FetchError::Status {
            url: "https://raw.githubusercontent.com/x".into(),
            status: 500
        }
        .is_validation());
    }

    #[test]
    fn test_engine_error_messages() {
        let e = EngineError::TemporarilyUnavailable {
            retry_after_secs: 5,
        };
        assert!(e.to_string().contains("retry in 5s"));
    }
}
