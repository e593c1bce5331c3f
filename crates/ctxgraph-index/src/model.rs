//! Node and edge types shared by the graph store, vector store and retriever.
//!
//! Node properties are a closed set of optional fields plus an `extra`
//! map for extension data that has no dedicated field.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chunker::ChunkKind;

/// Type of a node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    File,
    Chunk,
    Function,
    Class,
    DocSection,
    Task,
    PreventionRule,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Chunk => "chunk",
            Self::Function => "function",
            Self::Class => "class",
            Self::DocSection => "doc-section",
            Self::Task => "task",
            Self::PreventionRule => "prevention-rule",
        }
    }

    /// Nodes that own chunks through `contains` edges.
    pub fn is_source(&self) -> bool {
        matches!(self, Self::File | Self::Task | Self::PreventionRule)
    }

    /// Symbol type a chunk of `kind` stands for, used for type filters on retrieval.
    pub fn for_chunk_kind(kind: ChunkKind) -> Self {
        match kind {
            ChunkKind::Function | ChunkKind::Method => Self::Function,
            k if k.is_type() => Self::Class,
            ChunkKind::Section => Self::DocSection,
            _ => Self::Chunk,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "chunk" => Ok(Self::Chunk),
            "function" => Ok(Self::Function),
            "class" => Ok(Self::Class),
            "doc-section" => Ok(Self::DocSection),
            "task" => Ok(Self::Task),
            "prevention-rule" => Ok(Self::PreventionRule),
            other => Err(format!("unknown node type: {}", other)),
        }
    }
}

/// Type of a directed relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeType {
    Contains,
    Imports,
    Calls,
    References,
    Documents,
    SimilarTo,
    Follows,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::Imports => "imports",
            Self::Calls => "calls",
            Self::References => "references",
            Self::Documents => "documents",
            Self::SimilarTo => "similar-to",
            Self::Follows => "follows",
        }
    }

    pub fn all() -> [EdgeType; 7] {
        [
            Self::Contains,
            Self::Imports,
            Self::Calls,
            Self::References,
            Self::Documents,
            Self::SimilarTo,
            Self::Follows,
        ]
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edge direction relative to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

/// Where a chunk's source comes from. Drives per-source weighting at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceCategory {
    Code,
    Doc,
    Prevention,
    History,
}

impl SourceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Doc => "doc",
            Self::Prevention => "prevention",
            Self::History => "history",
        }
    }
}

impl fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source location of a chunk. Lines are 1-indexed and inclusive, bytes are a half-open range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub line_start: usize,
    pub line_end: usize,
    pub byte_start: usize,
    pub byte_end: usize,
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.line_start, self.line_end)
    }
}

/// Typed node properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ChunkKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Full chunk text, or an excerpt for source nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_category: Option<SourceCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Unix seconds of the last write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
    /// Set once the linking pass has visited this chunk.
    #[serde(default, skip_serializing_if = "is_false")]
    pub linked: bool,
    /// Node exists but has no vector yet.
    #[serde(default, skip_serializing_if = "is_false")]
    pub embedding_pending: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl NodeProperties {
    /// Look up a property by name, falling back to `extra`.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        use serde_json::Value;
        match key {
            "path" => self.path.clone().map(Value::from),
            "title" => self.title.clone().map(Value::from),
            "kind" => self.kind.map(|k| Value::from(k.as_str())),
            "language" => self.language.clone().map(Value::from),
            "text" => self.text.clone().map(Value::from),
            "category" => self.category.clone().map(Value::from),
            "source_category" => self.source_category.map(|c| Value::from(c.as_str())),
            "content_hash" => self.content_hash.clone().map(Value::from),
            "updated_at" => self.updated_at.map(Value::from),
            "linked" => Some(Value::from(self.linked)),
            "embedding_pending" => Some(Value::from(self.embedding_pending)),
            other => self.extra.get(other).cloned(),
        }
    }
}

/// A typed entity in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub properties: NodeProperties,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            properties: NodeProperties::default(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.properties.path = Some(path.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.properties.title = Some(title.into());
        self
    }

    pub fn with_kind(mut self, kind: ChunkKind) -> Self {
        self.properties.kind = Some(kind);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.properties.language = Some(language.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.properties.text = Some(text.into());
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.properties.span = Some(span);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.properties.category = Some(category.into());
        self
    }

    pub fn with_source_category(mut self, source_category: SourceCategory) -> Self {
        self.properties.source_category = Some(source_category);
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.properties.content_hash = Some(hash.into());
        self
    }

    pub fn with_updated_at(mut self, ts: u64) -> Self {
        self.properties.updated_at = Some(ts);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.extra.insert(key.into(), value);
        self
    }

    pub fn text(&self) -> &str {
        self.properties.text.as_deref().unwrap_or("")
    }

    pub fn title(&self) -> &str {
        self.properties.title.as_deref().unwrap_or("")
    }

    pub fn timestamp(&self) -> u64 {
        self.properties.updated_at.unwrap_or(0)
    }
}

/// A typed directed relationship. Unique per `(from_id, to_id, edge_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from_id: String,
    pub to_id: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
}

impl Edge {
    pub fn new(from_id: impl Into<String>, to_id: impl Into<String>, edge_type: EdgeType) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            edge_type,
        }
    }
}

/// Node id for a workspace file.
pub fn file_node_id(path: &str) -> String {
    format!("file:{}", path)
}

/// Node id for a task or prevention-rule record.
pub fn record_node_id(node_type: NodeType, record_id: &str) -> String {
    match node_type {
        NodeType::PreventionRule => format!("rule:{}", record_id),
        _ => format!("task:{}", record_id),
    }
}

/// Content-derived chunk id.
///
/// Span is deliberately left out so a chunk keeps its id when code above it moves.
pub fn chunk_node_id(source_id: &str, kind: ChunkKind, title: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update([0]);
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(title.as_bytes());
    hasher.update([0]);
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("chunk:{}", &digest[..32])
}

/// SHA-256 of content, hex encoded.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Current Unix timestamp in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_roundtrip_str() {
        for t in [
            NodeType::File,
            NodeType::Chunk,
            NodeType::DocSection,
            NodeType::PreventionRule,
        ] {
            assert_eq!(t.as_str().parse::<NodeType>().unwrap(), t);
        }
        assert!("widget".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_serde_names() {
        let edge = Edge::new("a", "b", EdgeType::SimilarTo);
        let json = serde_json::to_string(&edge).unwrap();
        assert_eq!(json, r#"{"from_id":"a","to_id":"b","type":"similar-to"}"#);

        let node = Node::new("rule:1", NodeType::PreventionRule);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "prevention-rule");
    }

    #[test]
    fn test_properties_skip_empty_fields() {
        let node = Node::new("file:a.rs", NodeType::File).with_path("a.rs");
        let json = serde_json::to_value(&node).unwrap();
        let props = json["properties"].as_object().unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props["path"], "a.rs");
    }

    #[test]
    fn test_property_lookup() {
        let node = Node::new("x", NodeType::Chunk)
            .with_category("auth")
            .with_kind(ChunkKind::Function)
            .with_extra("owner", serde_json::json!("team-a"));
        assert_eq!(node.properties.get("category"), Some(serde_json::json!("auth")));
        assert_eq!(node.properties.get("kind"), Some(serde_json::json!("function")));
        assert_eq!(node.properties.get("owner"), Some(serde_json::json!("team-a")));
        assert_eq!(node.properties.get("linked"), Some(serde_json::json!(false)));
        assert_eq!(node.properties.get("missing"), None);
    }

    #[test]
    fn test_chunk_id_ignores_position() {
        let a = chunk_node_id("file:a.ts", ChunkKind::Function, "login", "function login() {}");
        let b = chunk_node_id("file:a.ts", ChunkKind::Function, "login", "function login() {}");
        let c = chunk_node_id("file:a.ts", ChunkKind::Function, "login", "function login() { x }");
        let d = chunk_node_id("file:b.ts", ChunkKind::Function, "login", "function login() {}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.starts_with("chunk:"));
    }

    #[test]
    fn test_record_ids() {
        assert_eq!(record_node_id(NodeType::Task, "42"), "task:42");
        assert_eq!(record_node_id(NodeType::PreventionRule, "7"), "rule:7");
        assert_eq!(file_node_id("src/lib.rs"), "file:src/lib.rs");
    }
}
