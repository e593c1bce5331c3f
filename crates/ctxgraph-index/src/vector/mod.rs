//! Vector store abstraction over chunk embeddings.
//!
//! Records are keyed by chunk id and carry a denormalised metadata subset
//! used for filtering. Filters are applied before ranking, so a restrictive
//! filter never shrinks the result below `k` while matching records remain.

mod local;
mod qdrant;

pub use local::{LocalVectorStore, VECTORS_FILE};
pub use qdrant::{QdrantConfig, QdrantVectorStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::chunker::ChunkKind;
use crate::model::{Node, NodeType, SourceCategory};

/// Metadata stored alongside each embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub category: String,
    pub source_category: SourceCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Unix seconds when the chunk was written
    pub timestamp: u64,
}

impl VectorMetadata {
    /// Metadata derived from a stored chunk node.
    pub fn for_chunk(node: &Node) -> Self {
        let kind = node.properties.kind.unwrap_or(ChunkKind::Window);
        Self {
            node_type: NodeType::for_chunk_kind(kind),
            kind: Some(kind.as_str().to_string()),
            category: node
                .properties
                .category
                .clone()
                .unwrap_or_else(|| crate::category::FALLBACK_CATEGORY.to_string()),
            source_category: node.properties.source_category.unwrap_or(SourceCategory::Doc),
            path: node.properties.path.clone(),
            timestamp: node.timestamp(),
        }
    }
}

/// An embedding with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub embedding: Vec<f32>,
    pub metadata: VectorMetadata,
}

/// A similarity search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    /// Cosine similarity in [-1, 1]
    pub similarity: f32,
}

/// Metadata predicate. Empty lists match everything; non-empty lists match any member.
///
/// `path_prefix` matches whole path components, see [`path_has_prefix`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    pub node_types: Vec<NodeType>,
    pub categories: Vec<String>,
    pub source_categories: Vec<SourceCategory>,
    pub path_prefix: Option<String>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node_types(mut self, types: Vec<NodeType>) -> Self {
        self.node_types = types;
        self
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_source_categories(mut self, categories: Vec<SourceCategory>) -> Self {
        self.source_categories = categories;
        self
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.node_types.is_empty()
            && self.categories.is_empty()
            && self.source_categories.is_empty()
            && self.path_prefix.is_none()
    }

    pub fn matches(&self, metadata: &VectorMetadata) -> bool {
        (self.node_types.is_empty() || self.node_types.contains(&metadata.node_type))
            && (self.categories.is_empty() || self.categories.contains(&metadata.category))
            && (self.source_categories.is_empty()
                || self.source_categories.contains(&metadata.source_category))
            && self.path_prefix.as_ref().map_or(true, |prefix| {
                metadata
                    .path
                    .as_deref()
                    .map_or(false, |p| path_has_prefix(p, prefix))
            })
    }
}

/// Whether `path` is `prefix` itself or lies under the directory `prefix`.
///
/// Matching stops at `/` boundaries: `src/auth` matches `src/auth/login.ts`
/// but not `src/auth.ts`. A trailing `/` on the prefix is ignored.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Nearest-neighbour index over chunk embeddings.
///
/// Only the indexer writes; the retriever calls `search`.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the record for `chunk_id`.
    async fn upsert(&self, record: VectorRecord) -> Result<()>;

    /// Insert or replace several records.
    async fn upsert_batch(&self, records: Vec<VectorRecord>) -> Result<()> {
        for record in records {
            self.upsert(record).await?;
        }
        Ok(())
    }

    /// Remove a record. Removing an absent id is not an error.
    async fn delete(&self, chunk_id: &str) -> Result<()>;

    async fn delete_many(&self, chunk_ids: &[String]) -> Result<()> {
        for id in chunk_ids {
            self.delete(id).await?;
        }
        Ok(())
    }

    /// Top `k` records by cosine similarity, descending, ties by chunk id.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorHit>>;

    async fn contains(&self, chunk_id: &str) -> Result<bool>;

    /// Every stored chunk id.
    async fn ids(&self) -> Result<Vec<String>>;

    async fn len(&self) -> Result<usize>;

    /// Make pending writes durable.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Cosine similarity. Zero when either vector has zero norm or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(category: &str, path: &str) -> VectorMetadata {
        VectorMetadata {
            node_type: NodeType::Chunk,
            kind: Some("function".into()),
            category: category.into(),
            source_category: SourceCategory::Code,
            path: Some(path.into()),
            timestamp: 0,
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        // Scale invariant
        assert!((cosine_similarity(&[2.0, 2.0], &[1.0, 1.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_filter_matching() {
        let m = metadata("auth", "src/auth/login.ts");
        assert!(MetadataFilter::new().matches(&m));
        assert!(MetadataFilter::new()
            .with_categories(vec!["auth".into(), "api".into()])
            .matches(&m));
        assert!(!MetadataFilter::new().with_categories(vec!["ui".into()]).matches(&m));
        assert!(MetadataFilter::new().with_path_prefix("src/auth").matches(&m));
        assert!(MetadataFilter::new().with_path_prefix("src/auth/").matches(&m));
        assert!(!MetadataFilter::new().with_path_prefix("src/au").matches(&m));
        assert!(!MetadataFilter::new().with_path_prefix("docs/").matches(&m));
        assert!(!MetadataFilter::new()
            .with_source_categories(vec![SourceCategory::Doc])
            .matches(&m));
        assert!(!MetadataFilter::new()
            .with_node_types(vec![NodeType::Task])
            .matches(&m));
    }

    #[test]
    fn test_path_prefix_stops_at_components() {
        assert!(path_has_prefix("src/auth/login.ts", "src"));
        assert!(path_has_prefix("src/auth/login.ts", "src/auth/login.ts"));
        assert!(path_has_prefix("src/auth.ts", "/"));
        assert!(!path_has_prefix("src/auth.ts", "src/a"));
        assert!(!path_has_prefix("src/auth.ts", "src/auth"));
        assert!(!path_has_prefix("src", "src/auth"));
    }
}
