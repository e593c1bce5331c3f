//! Bounded breadth-first traversal over the graph store.

use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::graph::GraphStore;
use crate::model::{Direction, EdgeType, NodeType};

/// A node reached during traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalResult {
    pub node_id: String,
    pub node_type: NodeType,
    /// Hops from the nearest start node
    pub distance: usize,
}

/// Configuration for graph traversal.
#[derive(Debug, Clone)]
pub struct TraversalConfig {
    /// Maximum depth for traversal
    pub max_depth: usize,
    /// Edge types to follow; empty follows every type
    pub edge_types: Vec<EdgeType>,
    pub direction: Direction,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            edge_types: vec![
                EdgeType::Calls,
                EdgeType::References,
                EdgeType::Imports,
                EdgeType::Documents,
                EdgeType::SimilarTo,
                EdgeType::Follows,
                EdgeType::Contains,
            ],
            direction: Direction::Both,
        }
    }
}

impl TraversalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_edge_types(mut self, types: Vec<EdgeType>) -> Self {
        self.edge_types = types;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
}

/// Graph traverser.
#[derive(Debug, Clone, Default)]
pub struct GraphTraverser {
    config: TraversalConfig,
}

impl GraphTraverser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TraversalConfig) -> Self {
        Self { config }
    }

    /// Multi-source BFS. Each reachable node is reported once with its shortest distance.
    ///
    /// Results are ordered by distance, then id. Unknown start ids are ignored.
    pub fn bfs(&self, graph: &GraphStore, start_ids: &[String]) -> Vec<TraversalResult> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        let mut reached: BTreeMap<(usize, String), NodeType> = BTreeMap::new();

        for id in start_ids {
            if graph.contains_node(id) && visited.insert(id.clone()) {
                queue.push_back((id.clone(), 0));
            }
        }

        while let Some((current, distance)) = queue.pop_front() {
            if let Some(node) = graph.get_node(&current) {
                reached.insert((distance, current.clone()), node.node_type);
            }
            if distance >= self.config.max_depth {
                continue;
            }

            let follow: Vec<Option<EdgeType>> = if self.config.edge_types.is_empty() {
                vec![None]
            } else {
                self.config.edge_types.iter().copied().map(Some).collect()
            };

            for edge_type in follow {
                for next in graph.neighbors(&current, edge_type, self.config.direction) {
                    if visited.insert(next.id.clone()) {
                        queue.push_back((next.id.clone(), distance + 1));
                    }
                }
            }
        }

        reached
            .into_iter()
            .map(|((distance, node_id), node_type)| TraversalResult {
                node_id,
                node_type,
                distance,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Edge, Node};

    fn chain() -> GraphStore {
        let mut g = GraphStore::in_memory();
        for id in ["a", "b", "c", "d"] {
            g.put_node(Node::new(id, NodeType::Chunk)).unwrap();
        }
        g.put_edge(Edge::new("a", "b", EdgeType::Calls)).unwrap();
        g.put_edge(Edge::new("b", "c", EdgeType::Calls)).unwrap();
        g.put_edge(Edge::new("c", "d", EdgeType::Calls)).unwrap();
        g.put_edge(Edge::new("c", "a", EdgeType::References)).unwrap();
        g
    }

    #[test]
    fn test_bfs_respects_depth() {
        let g = chain();
        let traverser = GraphTraverser::with_config(
            TraversalConfig::new()
                .with_max_depth(2)
                .with_direction(Direction::Outgoing)
                .with_edge_types(vec![EdgeType::Calls]),
        );
        let results = traverser.bfs(&g, &["a".to_string()]);
        let ids: Vec<(&str, usize)> = results
            .iter()
            .map(|r| (r.node_id.as_str(), r.distance))
            .collect();
        assert_eq!(ids, vec![("a", 0), ("b", 1), ("c", 2)]);
    }

    #[test]
    fn test_bfs_terminates_on_cycles_with_shortest_distance() {
        let g = chain();
        let traverser = GraphTraverser::with_config(TraversalConfig::new().with_max_depth(10));
        let results = traverser.bfs(&g, &["a".to_string()]);
        assert_eq!(results.len(), 4);
        // c is one hop away through the reverse `references` edge
        let c = results.iter().find(|r| r.node_id == "c").unwrap();
        assert_eq!(c.distance, 1);
    }

    #[test]
    fn test_bfs_multiple_starts_and_unknown_ids() {
        let g = chain();
        let traverser = GraphTraverser::with_config(TraversalConfig::new().with_max_depth(0));
        let results = traverser.bfs(&g, &["d".to_string(), "missing".to_string(), "a".to_string()]);
        let ids: Vec<&str> = results.iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);
    }
}
