//! Structural checks run after every indexing pass.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::graph::GraphStore;
use crate::model::{EdgeType, NodeType};
use crate::vector::VectorStore;

/// Findings of an integrity check. Every list is sorted by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Source nodes with content but no outgoing `contains` edge
    pub sources_without_chunks: Vec<String>,
    /// Chunks no source node contains
    pub chunks_without_source: Vec<String>,
    /// Chunks the linking pass has not visited
    pub unvisited_chunks: Vec<String>,
    /// Vector records whose chunk node is gone
    pub dangling_vectors: Vec<String>,
    /// Chunks that are neither embedded nor marked pending
    pub missing_vectors: Vec<String>,
    /// Linked chunks with no relationship besides `contains`
    pub orphan_chunks: Vec<String>,
}

impl IntegrityReport {
    /// Run every check against the current store state.
    pub async fn check(graph: &GraphStore, vectors: &dyn VectorStore) -> Result<Self> {
        let mut report = Self::default();
        let vector_ids: BTreeSet<String> = vectors.ids().await?.into_iter().collect();

        for node in graph.nodes() {
            if node.node_type.is_source() {
                let has_content = !node.text().trim().is_empty();
                if has_content && graph.outgoing_count(&node.id, Some(EdgeType::Contains)) == 0 {
                    report.sources_without_chunks.push(node.id.clone());
                }
                continue;
            }
            if node.node_type != NodeType::Chunk {
                continue;
            }

            if graph.incoming_count(&node.id, Some(EdgeType::Contains)) == 0 {
                report.chunks_without_source.push(node.id.clone());
            }
            if !node.properties.linked {
                report.unvisited_chunks.push(node.id.clone());
            } else if graph.incoming_count(&node.id, None)
                + graph.outgoing_count(&node.id, None)
                - graph.incoming_count(&node.id, Some(EdgeType::Contains))
                == 0
            {
                report.orphan_chunks.push(node.id.clone());
            }
            if !node.properties.embedding_pending && !vector_ids.contains(&node.id) {
                report.missing_vectors.push(node.id.clone());
            }
        }

        report.dangling_vectors = vector_ids
            .into_iter()
            .filter(|id| {
                graph
                    .get_node(id)
                    .map_or(true, |n| n.node_type != NodeType::Chunk)
            })
            .collect();

        Ok(report)
    }

    /// True when no invariant is broken. Orphans alone do not count.
    pub fn is_consistent(&self) -> bool {
        self.sources_without_chunks.is_empty()
            && self.chunks_without_source.is_empty()
            && self.unvisited_chunks.is_empty()
            && self.dangling_vectors.is_empty()
            && self.missing_vectors.is_empty()
    }

    /// Emit a warning per non-empty finding.
    pub fn log(&self) {
        let findings = [
            ("sources without chunks", &self.sources_without_chunks),
            ("chunks without source", &self.chunks_without_source),
            ("unvisited chunks", &self.unvisited_chunks),
            ("dangling vectors", &self.dangling_vectors),
            ("missing vectors", &self.missing_vectors),
            ("orphan chunks", &self.orphan_chunks),
        ];
        for (label, ids) in findings {
            if !ids.is_empty() {
                warn!(count = ids.len(), first = %ids[0], "Integrity check: {}", label);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Edge, Node, SourceCategory};
    use crate::vector::{LocalVectorStore, VectorMetadata, VectorRecord};

    fn record(id: &str) -> VectorRecord {
        VectorRecord {
            chunk_id: id.into(),
            embedding: vec![1.0, 0.0],
            metadata: VectorMetadata {
                node_type: NodeType::Chunk,
                kind: None,
                category: "general".into(),
                source_category: SourceCategory::Code,
                path: None,
                timestamp: 0,
            },
        }
    }

    fn chunk(id: &str, linked: bool) -> Node {
        let mut node = Node::new(id, NodeType::Chunk).with_text("x");
        node.properties.linked = linked;
        node
    }

    #[tokio::test]
    async fn test_clean_graph() {
        let mut g = GraphStore::in_memory();
        g.put_node(Node::new("file:a.rs", NodeType::File).with_text("fn a")).unwrap();
        g.put_node(chunk("c1", true)).unwrap();
        g.put_node(chunk("c2", true)).unwrap();
        g.put_edge(Edge::new("file:a.rs", "c1", EdgeType::Contains)).unwrap();
        g.put_edge(Edge::new("file:a.rs", "c2", EdgeType::Contains)).unwrap();
        g.put_edge(Edge::new("c1", "c2", EdgeType::Calls)).unwrap();

        let vectors = LocalVectorStore::in_memory(2);
        vectors.upsert(record("c1")).await.unwrap();
        vectors.upsert(record("c2")).await.unwrap();

        let report = IntegrityReport::check(&g, &vectors).await.unwrap();
        assert!(report.is_consistent());
        assert!(report.orphan_chunks.is_empty());
    }

    #[tokio::test]
    async fn test_detects_every_violation() {
        let mut g = GraphStore::in_memory();
        g.put_node(Node::new("file:a.rs", NodeType::File).with_text("fn a")).unwrap();
        g.put_node(Node::new("file:empty.rs", NodeType::File)).unwrap();
        g.put_node(chunk("loose", true)).unwrap();
        g.put_node(chunk("unvisited", false)).unwrap();
        let mut pending = chunk("pending", true);
        pending.properties.embedding_pending = true;
        g.put_node(pending).unwrap();
        g.put_node(Node::new("file:b.rs", NodeType::File).with_text("fn b")).unwrap();
        g.put_edge(Edge::new("file:b.rs", "unvisited", EdgeType::Contains)).unwrap();
        g.put_edge(Edge::new("file:b.rs", "pending", EdgeType::Contains)).unwrap();

        let vectors = LocalVectorStore::in_memory(2);
        vectors.upsert(record("ghost")).await.unwrap();
        vectors.upsert(record("unvisited")).await.unwrap();

        let report = IntegrityReport::check(&g, &vectors).await.unwrap();
        assert_eq!(report.sources_without_chunks, vec!["file:a.rs"]);
        assert_eq!(report.chunks_without_source, vec!["loose"]);
        assert_eq!(report.unvisited_chunks, vec!["unvisited"]);
        assert_eq!(report.dangling_vectors, vec!["ghost"]);
        assert_eq!(report.missing_vectors, vec!["loose"]);
        assert_eq!(report.orphan_chunks, vec!["loose", "pending"]);
        assert!(!report.is_consistent());
    }
}
