//! Hybrid retrieval combining vector similarity, BM25 and graph traversal.
//!
//! Each strategy yields per-chunk scores in [0, 1]:
//!
//! - **semantic**: cosine similarity of the embedded query, clamped at 0
//! - **keyword**: BM25 normalised by the best hit, times query term coverage
//! - **graph**: keyword hits expanded through the graph, `1 / (1 + hops)`
//!
//! `hybrid` fuses the three with a fixed mix and scales the result by the
//! normalised weight of the chunk's source category. Metadata filters are
//! applied to the candidate set before any scoring.

pub mod bm25;

pub use bm25::{BM25Index, KeywordHit};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunker::ChunkKind;
use crate::embeddings::EmbeddingProvider;
use crate::error::RetrievalError;
use crate::graph::GraphStore;
use crate::model::{Direction, EdgeType, Node, NodeType, SourceCategory, Span};
use crate::traverser::{GraphTraverser, TraversalConfig};
use crate::vector::{MetadataFilter, VectorMetadata};
use crate::workspace::Workspace;

/// Tokenize text into lowercase terms.
///
/// Splits on anything but alphanumerics and `_`; single-character terms are dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| s.chars().count() > 1)
        .map(String::from)
        .collect()
}

/// Retrieval strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Hybrid,
    Semantic,
    Keyword,
    Graph,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Semantic => "semantic",
            Self::Keyword => "keyword",
            Self::Graph => "graph",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "semantic" => Ok(Self::Semantic),
            "keyword" => Ok(Self::Keyword),
            "graph" => Ok(Self::Graph),
            _ => Err(RetrievalError::InvalidStrategy(s.to_string())),
        }
    }
}

fn check_weight(name: &str, value: f32) -> Result<(), RetrievalError> {
    if !value.is_finite() || value < 0.0 {
        return Err(RetrievalError::InvalidWeights(format!(
            "{} must be a non-negative number, got {}",
            name, value
        )));
    }
    Ok(())
}

/// Relative importance of each source category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceWeights {
    pub code: f32,
    pub doc: f32,
    pub prevention: f32,
    pub history: f32,
}

impl Default for SourceWeights {
    fn default() -> Self {
        Self {
            code: 0.4,
            doc: 0.3,
            prevention: 0.2,
            history: 0.1,
        }
    }
}

impl SourceWeights {
    pub fn new(code: f32, doc: f32, prevention: f32, history: f32) -> Self {
        Self {
            code,
            doc,
            prevention,
            history,
        }
    }

    pub fn validate(&self) -> Result<(), RetrievalError> {
        check_weight("code", self.code)?;
        check_weight("doc", self.doc)?;
        check_weight("prevention", self.prevention)?;
        check_weight("history", self.history)
    }

    /// Weights scaled to sum to 1. All-zero weights become equal weights.
    pub fn normalized(&self) -> Self {
        let sum = self.code + self.doc + self.prevention + self.history;
        if sum <= 0.0 {
            return Self::new(0.25, 0.25, 0.25, 0.25);
        }
        Self::new(
            self.code / sum,
            self.doc / sum,
            self.prevention / sum,
            self.history / sum,
        )
    }

    pub fn weight(&self, category: SourceCategory) -> f32 {
        match category {
            SourceCategory::Code => self.code,
            SourceCategory::Doc => self.doc,
            SourceCategory::Prevention => self.prevention,
            SourceCategory::History => self.history,
        }
    }
}

/// Share of each strategy in a hybrid score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyMix {
    pub semantic: f32,
    pub keyword: f32,
    pub graph: f32,
}

impl Default for StrategyMix {
    fn default() -> Self {
        Self {
            semantic: 0.5,
            keyword: 0.3,
            graph: 0.2,
        }
    }
}

impl StrategyMix {
    pub fn validate(&self) -> Result<(), RetrievalError> {
        check_weight("semantic", self.semantic)?;
        check_weight("keyword", self.keyword)?;
        check_weight("graph", self.graph)
    }

    fn normalized(&self) -> Self {
        let sum = self.semantic + self.keyword + self.graph;
        if sum <= 0.0 {
            let third = 1.0 / 3.0;
            return Self {
                semantic: third,
                keyword: third,
                graph: third,
            };
        }
        Self {
            semantic: self.semantic / sum,
            keyword: self.keyword / sum,
            graph: self.graph / sum,
        }
    }
}

/// Options for a retrieval query.
#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub strategy: Strategy,
    pub max_results: usize,
    pub min_score: f32,
    /// Restrict to these categories; empty means all
    pub categories: Vec<String>,
    /// Restrict to these symbol types (`function`, `class`, `doc-section`, `chunk`)
    pub node_types: Vec<NodeType>,
    pub source_categories: Vec<SourceCategory>,
    pub path_prefix: Option<String>,
    pub weights: SourceWeights,
    pub mix: StrategyMix,
    /// Hops explored from keyword seeds by the graph strategy
    pub graph_depth: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::Hybrid,
            max_results: 10,
            min_score: 0.0,
            categories: Vec::new(),
            node_types: Vec::new(),
            source_categories: Vec::new(),
            path_prefix: None,
            weights: SourceWeights::default(),
            mix: StrategyMix::default(),
            graph_depth: 2,
        }
    }
}

impl RetrievalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }

    pub fn with_node_types(mut self, types: Vec<NodeType>) -> Self {
        self.node_types = types;
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

    pub fn with_weights(mut self, weights: SourceWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_mix(mut self, mix: StrategyMix) -> Self {
        self.mix = mix;
        self
    }

    pub fn with_graph_depth(mut self, depth: usize) -> Self {
        self.graph_depth = depth;
        self
    }

    fn filter(&self) -> MetadataFilter {
        MetadataFilter {
            node_types: self.node_types.clone(),
            categories: self.categories.clone(),
            source_categories: self.source_categories.clone(),
            path_prefix: self.path_prefix.clone(),
        }
    }
}

/// A ranked chunk reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    /// File, task or prevention-rule node that contains the chunk
    pub source_node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
    pub score: f32,
    pub source_type: NodeType,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ChunkKind>,
    pub category: String,
}

/// Read-only query engine over a workspace.
pub struct HybridRetriever {
    workspace: Arc<Workspace>,
    embeddings: Arc<dyn EmbeddingProvider>,
}

impl HybridRetriever {
    pub fn new(workspace: Arc<Workspace>, embeddings: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            workspace,
            embeddings,
        }
    }

    /// Rank chunks for `query`.
    ///
    /// Results are ordered by score descending, then most recent timestamp,
    /// then chunk id. Identical inputs over an identical store give identical
    /// output. `semantic` asks the vector store for the top `max_results`
    /// only; `hybrid` scores every filtered candidate against the query.
    ///
    /// # Errors
    /// `EmptyQuery` for blank text and `InvalidWeights` for negative or
    /// non-finite weights, before any work is done.
    pub async fn retrieve(
        &self,
        query: &str,
        options: &RetrievalOptions,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        if query.trim().is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        options.weights.validate()?;
        options.mix.validate()?;
        if options.max_results == 0 {
            return Ok(Vec::new());
        }

        let filter = options.filter();
        let strategy = options.strategy;

        let semantic = match strategy {
            Strategy::Semantic => {
                self.semantic_scores(query, options.max_results, &filter)
                    .await?
            }
            Strategy::Hybrid => {
                // Fused scores need the similarity of every candidate, not just the nearest
                let stored = self
                    .workspace
                    .vectors()
                    .len()
                    .await
                    .map_err(|e| RetrievalError::VectorStore(e.to_string()))?;
                self.semantic_scores(query, stored, &filter).await?
            }
            Strategy::Keyword | Strategy::Graph => BTreeMap::new(),
        };

        let graph = self.workspace.graph().await;
        let candidates = candidate_chunks(&graph, &filter);

        let keyword = if strategy == Strategy::Semantic {
            BTreeMap::new()
        } else {
            keyword_scores(query, &candidates)
        };
        let graph_scores = if matches!(strategy, Strategy::Graph | Strategy::Hybrid) {
            graph_scores(&graph, &keyword, &candidates, options)
        } else {
            BTreeMap::new()
        };

        let weights = options.weights.normalized();
        let mix = options.mix.normalized();
        let mut scored: Vec<(f32, u64, &Node)> = Vec::new();

        for (id, node) in &candidates {
            let sem = semantic.get(*id).copied().unwrap_or(0.0);
            let kw = keyword.get(*id).copied().unwrap_or(0.0);
            let gr = graph_scores.get(*id).copied().unwrap_or(0.0);

            let score = match strategy {
                Strategy::Semantic => sem,
                Strategy::Keyword => kw,
                Strategy::Graph => gr,
                Strategy::Hybrid => {
                    let source = node.properties.source_category.unwrap_or(SourceCategory::Doc);
                    (mix.semantic * sem + mix.keyword * kw + mix.graph * gr)
                        * weights.weight(source)
                }
            };

            if score > 0.0 && score >= options.min_score {
                scored.push((score, node.timestamp(), *node));
            }
        }

        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.id.cmp(&b.2.id))
        });
        scored.truncate(options.max_results);

        debug!(
            strategy = %strategy,
            candidates = candidates.len(),
            results = scored.len(),
            "Retrieved"
        );

        Ok(scored
            .into_iter()
            .map(|(score, _, node)| to_result(&graph, node, score))
            .collect())
    }

    async fn semantic_scores(
        &self,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<BTreeMap<String, f32>, RetrievalError> {
        let embedding = self
            .embeddings
            .embed(query)
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;
        let filter = (!filter.is_empty()).then_some(filter);
        let hits = self
            .workspace
            .vectors()
            .search(&embedding, k, filter)
            .await
            .map_err(|e| RetrievalError::VectorStore(e.to_string()))?;

        Ok(hits
            .into_iter()
            .map(|h| (h.chunk_id, h.similarity.clamp(0.0, 1.0)))
            .collect())
    }
}

/// Chunk nodes passing the filter, keyed by id.
fn candidate_chunks<'a>(graph: &'a GraphStore, filter: &MetadataFilter) -> BTreeMap<&'a str, &'a Node> {
    graph
        .query(Some(NodeType::Chunk), &[])
        .into_iter()
        .filter(|node| filter.matches(&VectorMetadata::for_chunk(node)))
        .map(|node| (node.id.as_str(), node))
        .collect()
}

fn keyword_scores(query: &str, candidates: &BTreeMap<&str, &Node>) -> BTreeMap<String, f32> {
    let mut index = BM25Index::new();
    for (id, node) in candidates {
        index.add_document(*id, &format!("{}\n{}", node.title(), node.text()));
    }

    let hits = index.search(query, candidates.len());
    let best = hits.first().map(|h| h.score).unwrap_or(0.0);
    if best <= 0.0 {
        return BTreeMap::new();
    }
    hits.into_iter()
        .map(|h| (h.id, ((h.score / best) * h.coverage) as f32))
        .collect()
}

fn graph_scores(
    graph: &GraphStore,
    keyword: &BTreeMap<String, f32>,
    candidates: &BTreeMap<&str, &Node>,
    options: &RetrievalOptions,
) -> BTreeMap<String, f32> {
    let mut seeds: Vec<(&String, f32)> = keyword.iter().map(|(id, s)| (id, *s)).collect();
    seeds.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let seeds: Vec<String> = seeds
        .into_iter()
        .take(options.max_results)
        .map(|(id, _)| id.clone())
        .collect();

    let traverser = GraphTraverser::with_config(
        TraversalConfig::new()
            .with_max_depth(options.graph_depth)
            .with_edge_types(EdgeType::all().to_vec())
            .with_direction(Direction::Both),
    );

    traverser
        .bfs(graph, &seeds)
        .into_iter()
        .filter(|r| candidates.contains_key(r.node_id.as_str()))
        .map(|r| (r.node_id, 1.0 / (1.0 + r.distance as f32)))
        .collect()
}

fn to_result(graph: &GraphStore, node: &Node, score: f32) -> RetrievalResult {
    let source = graph
        .neighbors(&node.id, Some(EdgeType::Contains), Direction::Incoming)
        .into_iter()
        .next();
    RetrievalResult {
        chunk_id: node.id.clone(),
        source_node_id: source.map(|s| s.id.clone()).unwrap_or_default(),
        path: node.properties.path.clone(),
        span: node.properties.span,
        score,
        source_type: source.map(|s| s.node_type).unwrap_or(NodeType::File),
        title: node.title().to_string(),
        kind: node.properties.kind,
        category: node
            .properties
            .category
            .clone()
            .unwrap_or_else(|| crate::category::FALLBACK_CATEGORY.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbeddings;
    use crate::indexer::{Indexer, IndexerConfig};
    use crate::scanner::ScannedFile;
    use tokio_util::sync::CancellationToken;

    const DIM: usize = 128;

    async fn indexed() -> HybridRetriever {
        let workspace = Arc::new(Workspace::in_memory(DIM));
        let embeddings: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbeddings::new(DIM));
        let indexer =
            Indexer::new(workspace.clone(), embeddings.clone(), IndexerConfig::default()).unwrap();
        indexer
            .reindex(
                vec![
                    ScannedFile::new(
                        "src/auth.ts",
                        "export function login(user: string) {\n  return validateToken(user);\n}\n\nexport function validateToken(token: string) {\n  return token.length > 0;\n}\n",
                    ),
                    ScannedFile::new(
                        "src/render.ts",
                        "export function renderPage(title: string) {\n  return `<h1>${title}</h1>`;\n}\n",
                    ),
                    ScannedFile::new("docs/auth.md", "# Login flow\n\nCall login, which checks the token.\n"),
                ],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        HybridRetriever::new(workspace, embeddings)
    }

    #[test]
    fn test_tokenize() {
        let tokens = tokenize("Hello, World! This is a test_function.");
        assert!(tokens.contains(&"hello".to_string()));
        assert!(tokens.contains(&"test_function".to_string()));
        assert!(!tokens.contains(&"a".to_string()));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("Keyword".parse::<Strategy>().unwrap(), Strategy::Keyword);
        assert_eq!(
            "fuzzy".parse::<Strategy>().unwrap_err(),
            RetrievalError::InvalidStrategy("fuzzy".into())
        );
    }

    #[test]
    fn test_weights_normalize() {
        let a = SourceWeights::new(2.0, 2.0, 0.0, 0.0).normalized();
        let b = SourceWeights::new(0.5, 0.5, 0.0, 0.0).normalized();
        assert_eq!(a, b);
        assert!((a.code - 0.5).abs() < 1e-6);

        let zero = SourceWeights::new(0.0, 0.0, 0.0, 0.0).normalized();
        assert_eq!(zero.history, 0.25);

        assert!(matches!(
            SourceWeights::new(-1.0, 0.0, 0.0, 0.0).validate(),
            Err(RetrievalError::InvalidWeights(_))
        ));
        assert!(SourceWeights::new(f32::NAN, 0.0, 0.0, 0.0).validate().is_err());
    }

    #[tokio::test]
    async fn test_empty_query_and_bad_weights_fail_fast() {
        let retriever = indexed().await;
        let err = retriever.retrieve("   ", &RetrievalOptions::new()).await.unwrap_err();
        assert_eq!(err, RetrievalError::EmptyQuery);

        let options = RetrievalOptions::new().with_weights(SourceWeights::new(1.0, -0.5, 0.0, 0.0));
        assert!(matches!(
            retriever.retrieve("login", &options).await,
            Err(RetrievalError::InvalidWeights(_))
        ));
    }

    #[tokio::test]
    async fn test_keyword_strategy_finds_symbol() {
        let retriever = indexed().await;
        let options = RetrievalOptions::new().with_strategy(Strategy::Keyword);
        let results = retriever.retrieve("validateToken", &options).await.unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].title, "validateToken");
        assert_eq!(results[0].source_node_id, "file:src/auth.ts");
        assert_eq!(results[0].source_type, NodeType::File);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_graph_strategy_reaches_neighbours() {
        let retriever = indexed().await;
        let options = RetrievalOptions::new()
            .with_strategy(Strategy::Graph)
            .with_max_results(20);
        let results = retriever.retrieve("renderPage", &options).await.unwrap();
        // Seed at distance 0 ranks first
        assert_eq!(results[0].title, "renderPage");
        assert_eq!(results[0].score, 1.0);
        assert!(results.iter().all(|r| r.score <= 1.0));
    }

    #[tokio::test]
    async fn test_filters_apply_before_ranking() {
        let retriever = indexed().await;
        let options = RetrievalOptions::new()
            .with_category("auth")
            .with_max_results(5);
        let results = retriever.retrieve("auth", &options).await.unwrap();
        assert!(!results.is_empty());
        assert!(results.len() <= 5);
        assert!(results.iter().all(|r| r.category == "auth"));
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));

        let docs_only = RetrievalOptions::new()
            .with_source_categories(vec![SourceCategory::Doc])
            .with_strategy(Strategy::Semantic);
        let results = retriever.retrieve("login token", &docs_only).await.unwrap();
        assert!(results.iter().all(|r| r.path.as_deref() == Some("docs/auth.md")));
    }

    #[tokio::test]
    async fn test_retrieval_is_deterministic() {
        let retriever = indexed().await;
        let options = RetrievalOptions::new();
        let first = retriever.retrieve("login token", &options).await.unwrap();
        let second = retriever.retrieve("login token", &options).await.unwrap();
        assert_eq!(first, second);

        let json_a = serde_json::to_string(&first).unwrap();
        let json_b = serde_json::to_string(&second).unwrap();
        assert_eq!(json_a, json_b);
    }

    #[tokio::test]
    async fn test_min_score_and_max_results() {
        let retriever = indexed().await;
        let options = RetrievalOptions::new().with_max_results(1);
        assert_eq!(retriever.retrieve("login", &options).await.unwrap().len(), 1);

        let strict = RetrievalOptions::new().with_min_score(2.0);
        assert!(retriever.retrieve("login", &strict).await.unwrap().is_empty());
    }
}
