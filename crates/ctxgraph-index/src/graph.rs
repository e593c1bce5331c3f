//! Durable graph store of typed nodes and typed edges.
//!
//! Nodes are keyed by id and edges are unique per `(from_id, to_id, type)`.
//! Both tables live in memory and are persisted as JSON (`nodes.json`,
//! `edges.json`) with atomic file replacement on [`GraphStore::flush`].
//! Adjacency indexes and structural metrics (in-degree, connected
//! components) are derived from the edge table, never persisted.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{IndexError, Result};
use crate::model::{Direction, Edge, EdgeType, Node, NodeProperties, NodeType};

/// Node table file name.
pub const NODES_FILE: &str = "nodes.json";

/// Edge table file name.
pub const EDGES_FILE: &str = "edges.json";

/// A property predicate for [`GraphStore::query`].
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyFilter {
    /// Property equals the given JSON value
    Equals(String, serde_json::Value),
    /// String property starts with the given prefix
    Prefix(String, String),
}

impl PropertyFilter {
    pub fn equals(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::Equals(key.into(), value.into())
    }

    pub fn prefix(key: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::Prefix(key.into(), prefix.into())
    }

    pub fn matches(&self, properties: &NodeProperties) -> bool {
        match self {
            Self::Equals(key, value) => properties.get(key).as_ref() == Some(value),
            Self::Prefix(key, prefix) => properties
                .get(key)
                .and_then(|v| v.as_str().map(|s| s.starts_with(prefix.as_str())))
                .unwrap_or(false),
        }
    }
}

/// Counts describing the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub nodes_by_type: BTreeMap<String, usize>,
    pub edges_by_type: BTreeMap<String, usize>,
    pub component_count: usize,
    /// Nodes with the most incoming non-`contains` edges
    pub most_referenced: Vec<(String, usize)>,
}

#[derive(Serialize, Deserialize)]
struct NodeRow {
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    properties: NodeProperties,
}

/// Graph store.
#[derive(Debug, Default)]
pub struct GraphStore {
    dir: Option<PathBuf>,
    nodes: BTreeMap<String, Node>,
    edges: BTreeSet<Edge>,
    outgoing: HashMap<String, BTreeSet<(EdgeType, String)>>,
    incoming: HashMap<String, BTreeSet<(EdgeType, String)>>,
    dirty: bool,
}

impl GraphStore {
    /// Create a store that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the store in `dir`, loading existing tables if present.
    ///
    /// Edges whose endpoints are missing from the node table are dropped with a warning.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let mut store = Self {
            dir: Some(dir.to_path_buf()),
            ..Self::default()
        };

        let nodes_path = dir.join(NODES_FILE);
        let edges_path = dir.join(EDGES_FILE);

        if nodes_path.exists() {
            let rows: BTreeMap<String, NodeRow> =
                serde_json::from_str(&fs::read_to_string(&nodes_path)?)?;
            for (id, row) in rows {
                store.nodes.insert(
                    id.clone(),
                    Node {
                        id,
                        node_type: row.node_type,
                        properties: row.properties,
                    },
                );
            }
        }

        if edges_path.exists() {
            let edges: Vec<Edge> = serde_json::from_str(&fs::read_to_string(&edges_path)?)?;
            for edge in edges {
                if let Err(e) = store.put_edge(edge) {
                    warn!("Dropping stored edge: {}", e);
                }
            }
        }

        store.dirty = false;
        info!(
            "Opened graph store at {}: {} nodes, {} edges",
            dir.display(),
            store.nodes.len(),
            store.edges.len()
        );
        Ok(store)
    }

    /// Insert or update a node. Returns true when the stored node changed.
    ///
    /// # Errors
    /// `NodeTypeChange` when the id exists with a different type.
    pub fn put_node(&mut self, node: Node) -> Result<bool> {
        match self.nodes.get(&node.id) {
            Some(existing) if existing.node_type != node.node_type => {
                Err(IndexError::NodeTypeChange {
                    id: node.id,
                    existing: existing.node_type,
                    requested: node.node_type,
                })
            }
            Some(existing) if *existing == node => Ok(false),
            _ => {
                self.nodes.insert(node.id.clone(), node);
                self.dirty = true;
                Ok(true)
            }
        }
    }

    /// Insert an edge. Returns false when the triple already exists.
    ///
    /// # Errors
    /// `ReferentialIntegrityViolation` when either endpoint is missing.
    pub fn put_edge(&mut self, edge: Edge) -> Result<bool> {
        for endpoint in [&edge.from_id, &edge.to_id] {
            if !self.nodes.contains_key(endpoint) {
                return Err(IndexError::ReferentialIntegrityViolation {
                    from: edge.from_id.clone(),
                    to: edge.to_id.clone(),
                    edge_type: edge.edge_type,
                    missing: endpoint.clone(),
                });
            }
        }

        if self.edges.contains(&edge) {
            return Ok(false);
        }

        self.outgoing
            .entry(edge.from_id.clone())
            .or_default()
            .insert((edge.edge_type, edge.to_id.clone()));
        self.incoming
            .entry(edge.to_id.clone())
            .or_default()
            .insert((edge.edge_type, edge.from_id.clone()));
        self.edges.insert(edge);
        self.dirty = true;
        Ok(true)
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn has_edge(&self, edge: &Edge) -> bool {
        self.edges.contains(edge)
    }

    /// Apply `update` to a node's properties. Returns false if the node does not exist.
    pub fn update_properties<F>(&mut self, id: &str, update: F) -> bool
    where
        F: FnOnce(&mut NodeProperties),
    {
        match self.nodes.get_mut(id) {
            Some(node) => {
                let before = node.properties.clone();
                update(&mut node.properties);
                if node.properties != before {
                    self.dirty = true;
                }
                true
            }
            None => false,
        }
    }

    /// Neighbouring nodes, sorted by id and deduplicated.
    pub fn neighbors(
        &self,
        id: &str,
        edge_type: Option<EdgeType>,
        direction: Direction,
    ) -> Vec<&Node> {
        let ids: BTreeSet<&str> = self
            .adjacent(id, direction)
            .filter(|(t, _)| edge_type.map_or(true, |wanted| *t == wanted))
            .map(|(_, other)| other)
            .collect();
        ids.into_iter().filter_map(|i| self.nodes.get(i)).collect()
    }

    /// Edges touching a node.
    pub fn edges_of(&self, id: &str, direction: Direction) -> Vec<Edge> {
        let mut edges = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            if let Some(out) = self.outgoing.get(id) {
                edges.extend(out.iter().map(|(t, to)| Edge::new(id, to.clone(), *t)));
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            if let Some(inc) = self.incoming.get(id) {
                edges.extend(inc.iter().map(|(t, from)| Edge::new(from.clone(), id, *t)));
            }
        }
        edges
    }

    fn adjacent<'a>(
        &'a self,
        id: &str,
        direction: Direction,
    ) -> impl Iterator<Item = (EdgeType, &'a str)> + 'a {
        let out = match direction {
            Direction::Outgoing | Direction::Both => self.outgoing.get(id),
            Direction::Incoming => None,
        };
        let inc = match direction {
            Direction::Incoming | Direction::Both => self.incoming.get(id),
            Direction::Outgoing => None,
        };
        out.into_iter()
            .flatten()
            .chain(inc.into_iter().flatten())
            .map(|(t, other)| (*t, other.as_str()))
    }

    /// Ids reachable from `root` along outgoing `edge_type` edges, including `root`.
    ///
    /// Terminates on cycles. Empty when `root` does not exist.
    pub fn subtree_ids(&self, root: &str, edge_type: EdgeType) -> BTreeSet<String> {
        let mut visited = BTreeSet::new();
        if !self.nodes.contains_key(root) {
            return visited;
        }

        let mut queue = VecDeque::from([root.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(out) = self.outgoing.get(&current) {
                for (t, child) in out {
                    if *t == edge_type && !visited.contains(child) {
                        queue.push_back(child.clone());
                    }
                }
            }
        }
        visited
    }

    /// Delete `root` and everything reachable from it along `edge_type`, with all their edges.
    pub fn delete_subtree(&mut self, root: &str, edge_type: EdgeType) -> BTreeSet<String> {
        let ids = self.subtree_ids(root, edge_type);
        self.remove_nodes(&ids);
        ids
    }

    /// Delete the nodes reachable from `root` along `edge_type`, keeping `root` itself.
    pub fn delete_descendants(&mut self, root: &str, edge_type: EdgeType) -> BTreeSet<String> {
        let mut ids = self.subtree_ids(root, edge_type);
        ids.remove(root);
        self.remove_nodes(&ids);
        ids
    }

    /// Remove nodes and every edge touching them. Returns the number of edges removed.
    pub fn remove_nodes(&mut self, ids: &BTreeSet<String>) -> usize {
        let mut removed_edges = 0;
        for id in ids {
            if self.nodes.remove(id).is_none() {
                continue;
            }
            for edge in self.edges_of(id, Direction::Both) {
                if self.remove_edge(&edge) {
                    removed_edges += 1;
                }
            }
            self.outgoing.remove(id);
            self.incoming.remove(id);
            self.dirty = true;
        }
        if !ids.is_empty() {
            debug!("Removed {} nodes and {} edges", ids.len(), removed_edges);
        }
        removed_edges
    }

    /// Remove a single edge. Returns false if it did not exist.
    pub fn remove_edge(&mut self, edge: &Edge) -> bool {
        if !self.edges.remove(edge) {
            return false;
        }
        if let Some(out) = self.outgoing.get_mut(&edge.from_id) {
            out.remove(&(edge.edge_type, edge.to_id.clone()));
        }
        if let Some(inc) = self.incoming.get_mut(&edge.to_id) {
            inc.remove(&(edge.edge_type, edge.from_id.clone()));
        }
        self.dirty = true;
        true
    }

    /// Remove every outgoing edge of `edge_type` from `id`. Returns how many were removed.
    pub fn remove_outgoing(&mut self, id: &str, edge_type: EdgeType) -> usize {
        let edges: Vec<Edge> = self
            .edges_of(id, Direction::Outgoing)
            .into_iter()
            .filter(|e| e.edge_type == edge_type)
            .collect();
        edges.iter().filter(|e| self.remove_edge(e)).count()
    }

    /// Nodes matching an optional type and all property filters, in id order.
    pub fn query(&self, node_type: Option<NodeType>, filters: &[PropertyFilter]) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|n| node_type.map_or(true, |t| n.node_type == t))
            .filter(|n| filters.iter().all(|f| f.matches(&n.properties)))
            .collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of incoming edges, optionally restricted to one type.
    pub fn incoming_count(&self, id: &str, edge_type: Option<EdgeType>) -> usize {
        self.incoming
            .get(id)
            .map(|inc| {
                inc.iter()
                    .filter(|(t, _)| edge_type.map_or(true, |wanted| *t == wanted))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of outgoing edges, optionally restricted to one type.
    pub fn outgoing_count(&self, id: &str, edge_type: Option<EdgeType>) -> usize {
        self.outgoing
            .get(id)
            .map(|out| {
                out.iter()
                    .filter(|(t, _)| edge_type.map_or(true, |wanted| *t == wanted))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Weakly connected components, each sorted, ordered by their smallest id.
    pub fn connected_components(&self) -> Vec<BTreeSet<String>> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut components = Vec::new();

        for id in self.nodes.keys() {
            if seen.contains(id.as_str()) {
                continue;
            }
            let mut component = BTreeSet::new();
            let mut queue = VecDeque::from([id.as_str()]);
            while let Some(current) = queue.pop_front() {
                if !seen.insert(current) {
                    continue;
                }
                component.insert(current.to_string());
                for (_, other) in self.adjacent(current, Direction::Both) {
                    if !seen.contains(other) {
                        queue.push_back(other);
                    }
                }
            }
            components.push(component);
        }
        components
    }

    /// Summary statistics computed from the current tables.
    pub fn stats(&self, top: usize) -> GraphStats {
        let mut stats = GraphStats {
            node_count: self.nodes.len(),
            edge_count: self.edges.len(),
            component_count: self.connected_components().len(),
            ..GraphStats::default()
        };
        for node in self.nodes.values() {
            *stats
                .nodes_by_type
                .entry(node.node_type.as_str().to_string())
                .or_default() += 1;
        }
        for edge in &self.edges {
            *stats
                .edges_by_type
                .entry(edge.edge_type.as_str().to_string())
                .or_default() += 1;
        }

        let mut referenced: Vec<(String, usize)> = self
            .nodes
            .keys()
            .map(|id| {
                let count = self
                    .incoming
                    .get(id)
                    .map(|inc| inc.iter().filter(|(t, _)| *t != EdgeType::Contains).count())
                    .unwrap_or(0);
                (id.clone(), count)
            })
            .filter(|(_, count)| *count > 0)
            .collect();
        referenced.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        referenced.truncate(top);
        stats.most_referenced = referenced;
        stats
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Persist both tables if anything changed since the last flush.
    ///
    /// # Errors
    /// `StoreWriteFailure` when either table cannot be written.
    pub fn flush(&mut self) -> Result<()> {
        let Some(dir) = self.dir.clone() else {
            self.dirty = false;
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        let rows: BTreeMap<&str, NodeRow> = self
            .nodes
            .values()
            .map(|n| {
                (
                    n.id.as_str(),
                    NodeRow {
                        node_type: n.node_type,
                        properties: n.properties.clone(),
                    },
                )
            })
            .collect();
        let edges: Vec<&Edge> = self.edges.iter().collect();

        write_atomic(&dir.join(NODES_FILE), &rows)?;
        write_atomic(&dir.join(EDGES_FILE), &edges)?;

        self.dirty = false;
        debug!(
            "Flushed graph store: {} nodes, {} edges",
            self.nodes.len(),
            self.edges.len()
        );
        Ok(())
    }
}

/// Serialize to a temporary file and rename it over `path`.
pub(crate) fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec(value).map_err(|e| {
        IndexError::StoreWriteFailure(format!("serializing {}: {}", path.display(), e))
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|e| IndexError::StoreWriteFailure(format!("writing {}: {}", path.display(), e)))
}
