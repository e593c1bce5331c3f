//! Incremental graph and vector indexing with hybrid retrieval.
//!
//! This crate provides:
//! - Change detection against a persisted manifest of file hashes
//! - Structural chunking using tree-sitter, with windowed fallback
//! - Embedding generation via an OpenAI-compatible API or a local hashing embedder
//! - Vector storage in a local JSON store or Qdrant
//! - A typed graph of sources, chunks and cross-chunk relationships
//! - Hybrid retrieval (vector + BM25 + graph traversal)

pub mod category;
pub mod chunker;
pub mod embeddings;
pub mod error;
pub mod graph;
pub mod indexer;
pub mod integrity;
pub mod linker;
pub mod manifest;
pub mod model;
pub mod scanner;
pub mod search;
pub mod traverser;
pub mod vector;
pub mod workspace;

// Re-exports
pub use category::{CategoryRule, CategoryRules};
pub use chunker::{ChunkDescriptor, ChunkKind, ContentParser, WindowConfig};
pub use embeddings::{EmbeddingProvider, HashingEmbeddings, OpenAiEmbeddings, RetryPolicy};
pub use error::{IndexError, Result, RetrievalError};
pub use graph::{GraphStats, GraphStore, PropertyFilter};
pub use indexer::{IndexReport, Indexer, IndexerConfig, PassError, RecordKind};
pub use integrity::IntegrityReport;
pub use linker::{LinkStats, Linker, SimilarEdges};
pub use manifest::{ChangeSet, IndexManifest};
pub use model::{Direction, Edge, EdgeType, Node, NodeType, SourceCategory, Span};
pub use scanner::{ScannedFile, Scanner};
pub use search::{
    BM25Index, HybridRetriever, RetrievalOptions, RetrievalResult, SourceWeights, Strategy,
    StrategyMix,
};
pub use traverser::{GraphTraverser, TraversalConfig, TraversalResult};
pub use vector::{
    LocalVectorStore, MetadataFilter, QdrantConfig, QdrantVectorStore, VectorHit, VectorRecord,
    VectorStore,
};
pub use workspace::Workspace;

/// Default Qdrant collection name
pub const DEFAULT_COLLECTION: &str = "ctxgraph";

/// Default embedding dimensions
pub const DEFAULT_DIMENSIONS: usize = 384;
