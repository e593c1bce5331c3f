//! Cross-reference linking between chunks.
//!
//! After the per-file writes of a pass, every chunk is visited once. Its
//! derived outgoing edges (`calls`, `references`, `imports`, `documents`,
//! `follows`) are recomputed from the current chunk set and diffed against
//! the stored ones, so an unchanged workspace produces no writes.
//! `similar-to` edges are only recomputed for chunks whose embedding changed
//! in this pass; their vector searches run in [`Linker::similar_to`] before
//! the graph is borrowed for writing. Each visited chunk is marked `linked`.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::chunker::ChunkKind;
use crate::error::Result;
use crate::graph::GraphStore;
use crate::model::{Direction, Edge, EdgeType, NodeType, SourceCategory, Span};
use crate::vector::VectorStore;

/// Symbols with more candidates than this are treated as ambiguous and not linked.
const MAX_CANDIDATES: usize = 5;

/// Neighbours examined per chunk when computing `similar-to` edges.
const SIMILAR_NEIGHBOURS: usize = 6;

const DERIVED_EDGES: [EdgeType; 5] = [
    EdgeType::Calls,
    EdgeType::References,
    EdgeType::Imports,
    EdgeType::Documents,
    EdgeType::Follows,
];

/// Wanted `similar-to` edges per chunk id.
pub type SimilarEdges = BTreeMap<String, BTreeSet<Edge>>;

/// Outcome of a linking run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub chunks_visited: usize,
    pub edges_written: usize,
    pub edges_removed: usize,
}

#[derive(Debug, Clone)]
struct ChunkInfo {
    id: String,
    source_id: Option<String>,
    kind: ChunkKind,
    title: String,
    text: String,
    span: Option<Span>,
    is_code: bool,
}

/// Builds relationship edges between chunks.
#[derive(Debug, Clone)]
pub struct Linker {
    similarity_threshold: f32,
}

impl Default for Linker {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.9,
        }
    }
}

impl Linker {
    pub fn new(similarity_threshold: f32) -> Self {
        Self {
            similarity_threshold,
        }
    }

    /// Source of every chunk in the graph, keyed by chunk id.
    pub fn chunk_sources(graph: &GraphStore) -> BTreeMap<String, Option<String>> {
        collect_chunks(graph)
            .into_iter()
            .map(|c| (c.id, c.source_id))
            .collect()
    }

    /// Nearest neighbours of each freshly embedded chunk, as `similar-to` edges.
    ///
    /// Reads only `sources` and the vector store, so no graph lock is needed
    /// while the searches run. Every fresh chunk present in `sources` gets an
    /// entry, possibly empty.
    pub async fn similar_to(
        &self,
        sources: &BTreeMap<String, Option<String>>,
        vectors: &dyn VectorStore,
        fresh_embeddings: &BTreeMap<String, Vec<f32>>,
    ) -> Result<SimilarEdges> {
        let mut similar = SimilarEdges::new();
        for (id, embedding) in fresh_embeddings {
            let Some(own_source) = sources.get(id) else {
                continue;
            };
            let hits = vectors.search(embedding, SIMILAR_NEIGHBOURS, None).await?;
            let edges = hits
                .into_iter()
                .filter(|h| h.chunk_id != *id && h.similarity >= self.similarity_threshold)
                .filter(|h| match sources.get(&h.chunk_id) {
                    Some(source) => source != own_source,
                    None => false,
                })
                .map(|h| Edge::new(id, h.chunk_id, EdgeType::SimilarTo))
                .collect();
            similar.insert(id.clone(), edges);
        }
        Ok(similar)
    }

    /// Link every chunk in the graph.
    ///
    /// Derived edges are recomputed for all chunks. `similar-to` edges are
    /// replaced only for the chunks named in `similar`.
    pub fn link(&self, graph: &mut GraphStore, similar: &SimilarEdges) -> LinkStats {
        let chunks = collect_chunks(graph);
        let symbols = SymbolTable::build(graph, &chunks);
        let mut stats = LinkStats::default();

        let followers = follow_pairs(&chunks);

        for chunk in &chunks {
            let mut desired: BTreeSet<Edge> = BTreeSet::new();

            if chunk.is_code {
                self.code_edges(chunk, &symbols, &mut desired);
            } else {
                for ident in identifiers(&chunk.text)
                    .into_iter()
                    .map(|(ident, _)| ident)
                    .filter(|i| i.len() >= 3)
                {
                    for target in symbols.symbol(ident, chunk) {
                        desired.insert(Edge::new(&chunk.id, target, EdgeType::Documents));
                    }
                }
            }
            if let Some(previous) = followers.get(&chunk.id) {
                desired.insert(Edge::new(&chunk.id, previous.clone(), EdgeType::Follows));
            }

            let existing: BTreeSet<Edge> = graph
                .edges_of(&chunk.id, Direction::Outgoing)
                .into_iter()
                .filter(|e| DERIVED_EDGES.contains(&e.edge_type))
                .collect();
            apply_diff(graph, &existing, &desired, &mut stats);

            if let Some(wanted) = similar.get(&chunk.id) {
                let existing: BTreeSet<Edge> = graph
                    .edges_of(&chunk.id, Direction::Outgoing)
                    .into_iter()
                    .filter(|e| e.edge_type == EdgeType::SimilarTo)
                    .collect();
                apply_diff(graph, &existing, wanted, &mut stats);
            }

            graph.update_properties(&chunk.id, |p| p.linked = true);
            stats.chunks_visited += 1;
        }

        debug!(
            "Linked {} chunks: {} edges written, {} removed",
            stats.chunks_visited, stats.edges_written, stats.edges_removed
        );
        stats
    }

    fn code_edges(&self, chunk: &ChunkInfo, symbols: &SymbolTable, desired: &mut BTreeSet<Edge>) {
        for (ident, is_call) in identifiers(&chunk.text) {
            if is_call {
                for target in symbols.callable(ident, chunk) {
                    desired.insert(Edge::new(&chunk.id, target, EdgeType::Calls));
                }
            }
            for target in symbols.type_named(ident, chunk) {
                desired.insert(Edge::new(&chunk.id, target, EdgeType::References));
            }
        }

        for line in chunk.text.lines().filter(|l| is_import_line(l)) {
            for (ident, _) in identifiers(line) {
                for file_id in symbols.file_with_stem(ident, chunk.source_id.as_deref()) {
                    desired.insert(Edge::new(&chunk.id, file_id, EdgeType::Imports));
                }
            }
        }
    }
}

fn apply_diff(
    graph: &mut GraphStore,
    existing: &BTreeSet<Edge>,
    desired: &BTreeSet<Edge>,
    stats: &mut LinkStats,
) {
    for stale in existing.difference(desired) {
        if graph.remove_edge(stale) {
            stats.edges_removed += 1;
        }
    }
    for edge in desired.difference(existing) {
        match graph.put_edge(edge.clone()) {
            Ok(true) => stats.edges_written += 1,
            Ok(false) => {}
            Err(e) => warn!("{}", e),
        }
    }
}

fn collect_chunks(graph: &GraphStore) -> Vec<ChunkInfo> {
    graph
        .query(Some(NodeType::Chunk), &[])
        .into_iter()
        .map(|node| {
            let source = graph
                .neighbors(&node.id, Some(EdgeType::Contains), Direction::Incoming)
                .into_iter()
                .next();
            ChunkInfo {
                id: node.id.clone(),
                source_id: source.map(|s| s.id.clone()),
                kind: node.properties.kind.unwrap_or(ChunkKind::Window),
                title: node.title().to_string(),
                text: node.text().to_string(),
                span: node.properties.span,
                is_code: node.properties.source_category == Some(SourceCategory::Code),
            }
        })
        .collect()
}

/// Maps a chunk to its predecessor for consecutive windows or sections of one source.
fn follow_pairs(chunks: &[ChunkInfo]) -> BTreeMap<String, String> {
    let mut by_source: BTreeMap<&str, Vec<&ChunkInfo>> = BTreeMap::new();
    for chunk in chunks {
        if let (Some(source), Some(_)) = (chunk.source_id.as_deref(), chunk.span) {
            by_source.entry(source).or_default().push(chunk);
        }
    }

    let mut pairs = BTreeMap::new();
    for siblings in by_source.values_mut() {
        siblings.sort_by_key(|c| c.span.map(|s| (s.byte_start, s.byte_end)));
        for pair in siblings.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            let textual = |k: ChunkKind| matches!(k, ChunkKind::Window | ChunkKind::Section);
            if textual(prev.kind) && textual(next.kind) {
                pairs.insert(next.id.clone(), prev.id.clone());
            }
        }
    }
    pairs
}

struct SymbolTable {
    callables: BTreeMap<String, Vec<(String, Option<String>)>>,
    types: BTreeMap<String, Vec<(String, Option<String>)>>,
    file_stems: BTreeMap<String, Vec<String>>,
}

impl SymbolTable {
    fn build(graph: &GraphStore, chunks: &[ChunkInfo]) -> Self {
        let mut callables: BTreeMap<String, Vec<(String, Option<String>)>> = BTreeMap::new();
        let mut types: BTreeMap<String, Vec<(String, Option<String>)>> = BTreeMap::new();
        for chunk in chunks.iter().filter(|c| c.is_code && !c.title.is_empty()) {
            let entry = (chunk.id.clone(), chunk.source_id.clone());
            if chunk.kind.is_callable() {
                callables.entry(chunk.title.clone()).or_default().push(entry);
            } else if chunk.kind.is_type() {
                types.entry(chunk.title.clone()).or_default().push(entry);
            }
        }

        let mut file_stems: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for file in graph
            .query(Some(NodeType::File), &[])
            .into_iter()
            .filter(|f| f.properties.source_category == Some(SourceCategory::Code))
        {
            if let Some(stem) = file.properties.path.as_deref().and_then(module_stem) {
                file_stems.entry(stem).or_default().push(file.id.clone());
            }
        }

        Self {
            callables,
            types,
            file_stems,
        }
    }

    fn callable<'a>(&'a self, name: &str, from: &ChunkInfo) -> Vec<&'a str> {
        resolve(self.callables.get(name), from)
    }

    fn type_named<'a>(&'a self, name: &str, from: &ChunkInfo) -> Vec<&'a str> {
        resolve(self.types.get(name), from)
    }

    fn symbol<'a>(&'a self, name: &str, from: &ChunkInfo) -> Vec<&'a str> {
        let mut targets = self.callable(name, from);
        targets.extend(self.type_named(name, from));
        targets
    }

    fn file_with_stem<'a>(&'a self, ident: &str, own_file: Option<&str>) -> Vec<&'a str> {
        match self.file_stems.get(&ident.to_lowercase()) {
            Some(files) if files.len() <= MAX_CANDIDATES => files
                .iter()
                .map(String::as_str)
                .filter(|f| Some(*f) != own_file)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Prefer candidates from the same source; skip ambiguous names.
fn resolve<'a>(candidates: Option<&'a Vec<(String, Option<String>)>>, from: &ChunkInfo) -> Vec<&'a str> {
    let Some(candidates) = candidates else {
        return Vec::new();
    };
    let others: Vec<&'a (String, Option<String>)> =
        candidates.iter().filter(|(id, _)| *id != from.id).collect();

    let local: Vec<&'a str> = others
        .iter()
        .copied()
        .filter(|(_, source)| source.is_some() && *source == from.source_id)
        .map(|(id, _)| id.as_str())
        .collect();
    if !local.is_empty() {
        return local;
    }
    if others.len() > MAX_CANDIDATES {
        return Vec::new();
    }
    others.into_iter().map(|(id, _)| id.as_str()).collect()
}

/// Module name a file is imported by: `src/auth.ts` is `auth`, `src/auth/mod.rs` is also `auth`.
fn module_stem(path: &str) -> Option<String> {
    let mut parts = path.rsplit('/');
    let file = parts.next()?;
    let stem = file.split('.').next().unwrap_or(file);
    let stem = match stem {
        "mod" | "index" | "__init__" | "lib" => parts.next()?,
        other => other,
    };
    (!stem.is_empty()).then(|| stem.to_lowercase())
}

fn is_import_line(line: &str) -> bool {
    let line = line.trim_start();
    ["use ", "pub use ", "import ", "from ", "mod ", "#include", "export * from", "export {"]
        .iter()
        .any(|p| line.starts_with(p))
        || line.contains("require(")
}

/// Identifiers in `text`, each with whether it is immediately followed by `(`.
fn identifiers(text: &str) -> Vec<(&str, bool)> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_alphabetic() || b == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let mut j = i;
            while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
                j += 1;
            }
            let is_call = j < bytes.len() && bytes[j] == b'(';
            out.push((&text[start..i], is_call));
        } else if b.is_ascii_digit() {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
        } else {
            i += 1;
        }
    }
    out
}
