//! Error types for indexing and retrieval.

use thiserror::Error;

use crate::manifest::ManifestError;
use crate::model::{EdgeType, NodeType};

/// Errors raised while building or mutating the index.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Malformed or unparseable file. The file is skipped, the pass continues.
    #[error("Failed to parse {path}: {reason}")]
    ParseFailure { path: String, reason: String },

    /// The embedding provider failed after all retries.
    #[error("Embedding failed after {attempts} attempt(s): {reason}")]
    EmbeddingFailure { attempts: u32, reason: String },

    /// Durable storage rejected a write. Fatal to the current pass.
    #[error("Store write failed: {0}")]
    StoreWriteFailure(String),

    /// An edge pointed at a node that does not exist.
    #[error("Edge {from} -[{edge_type}]-> {to} references missing node {missing}")]
    ReferentialIntegrityViolation {
        from: String,
        to: String,
        edge_type: EdgeType,
        missing: String,
    },

    #[error("Node {id} has type {existing}; refusing to change it to {requested}")]
    NodeTypeChange {
        id: String,
        existing: NodeType,
        requested: NodeType,
    },

    #[error("Vector has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("An indexing pass is already in progress for this workspace")]
    PassInProgress,

    #[error("Indexing pass cancelled")]
    Cancelled,

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IndexError {
    /// Whether this error must abort the running pass.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StoreWriteFailure(_) | Self::VectorStore(_) | Self::Manifest(_) | Self::Io(_)
        )
    }
}

/// Result alias for indexing operations.
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors surfaced synchronously by the retriever. No partial results accompany them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrievalError {
    #[error("Unknown retrieval strategy: {0:?} (expected hybrid, semantic, keyword or graph)")]
    InvalidStrategy(String),

    #[error("Query text is empty")]
    EmptyQuery,

    #[error("Invalid weights: {0}")]
    InvalidWeights(String),

    #[error("Failed to embed query: {0}")]
    Embedding(String),

    #[error("Vector search failed: {0}")]
    VectorStore(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(IndexError::StoreWriteFailure("disk full".into()).is_fatal());
        assert!(!IndexError::ParseFailure {
            path: "a.rs".into(),
            reason: "binary".into()
        }
        .is_fatal());
        assert!(!IndexError::EmbeddingFailure {
            attempts: 3,
            reason: "timeout".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = IndexError::ReferentialIntegrityViolation {
            from: "a".into(),
            to: "b".into(),
            edge_type: EdgeType::Calls,
            missing: "b".into(),
        };
        assert_eq!(
            err.to_string(),
            "Edge a -[calls]-> b references missing node b"
        );
        assert_eq!(RetrievalError::EmptyQuery.to_string(), "Query text is empty");
    }
}
