//! Indexing pass orchestration.
//!
//! The Indexer coordinates the change detector, the content parser and the
//! embedding provider, and is the only writer of the graph and vector
//! stores. A pass:
//!
//! 1. re-embeds chunks left `embedding_pending` by earlier passes,
//! 2. diffs the file set against the manifest,
//! 3. cascades deletes for removed files,
//! 4. parses and embeds added/modified files concurrently, committing them
//!    one at a time in path order,
//! 5. links every chunk, checks integrity and flushes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::category::CategoryRules;
use crate::chunker::{ChunkDescriptor, ChunkKind, ContentParser, WindowConfig};
use crate::embeddings::{embed_with_retry, EmbeddingProvider, RetryPolicy};
use crate::error::{IndexError, Result};
use crate::graph::{GraphStore, PropertyFilter};
use crate::integrity::IntegrityReport;
use crate::linker::Linker;
use crate::model::{
    chunk_node_id, content_hash, file_node_id, now, record_node_id, Edge, EdgeType, Node,
    NodeType, SourceCategory, Span,
};
use crate::scanner::ScannedFile;
use crate::vector::{VectorMetadata, VectorRecord};
use crate::workspace::Workspace;

/// Characters of a source kept as its node excerpt.
const EXCERPT_CHARS: usize = 200;

/// Configuration for the indexer.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub window: WindowConfig,
    /// Files parsed and embedded at the same time
    pub concurrency: usize,
    /// Upper bound on texts per embedding request
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Minimum cosine similarity for `similar-to` edges
    pub similarity_threshold: f32,
    pub categories: CategoryRules,
    /// Flush the stores after this many committed files
    pub checkpoint_every: usize,
    /// Embedding input is cut to this many characters
    pub max_embed_chars: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            concurrency: 4,
            batch_size: 32,
            retry: RetryPolicy::default(),
            similarity_threshold: 0.9,
            categories: CategoryRules::default(),
            checkpoint_every: 50,
            max_embed_chars: 8000,
        }
    }
}

/// A non-fatal problem recorded during a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassError {
    /// File path or record id
    pub source: String,
    pub message: String,
}

/// Statistics about an indexing pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub pass_id: String,
    pub files_indexed: usize,
    pub files_removed: usize,
    pub files_unchanged: usize,
    pub nodes_written: usize,
    pub nodes_removed: usize,
    pub edges_written: usize,
    pub vectors_written: usize,
    /// Chunks re-embedded from an earlier pass
    pub pending_retried: usize,
    /// Chunks still waiting for an embedding after this pass
    pub pending_embeddings: usize,
    pub errors: Vec<PassError>,
    pub integrity: IntegrityReport,
    pub duration_ms: u64,
}

impl IndexReport {
    /// True when the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.nodes_written == 0
            && self.nodes_removed == 0
            && self.edges_written == 0
            && self.vectors_written == 0
    }
}

/// Kind of a non-file source record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Task,
    PreventionRule,
}

impl RecordKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Task => NodeType::Task,
            Self::PreventionRule => NodeType::PreventionRule,
        }
    }

    fn source_category(&self) -> SourceCategory {
        match self {
            Self::Task => SourceCategory::History,
            Self::PreventionRule => SourceCategory::Prevention,
        }
    }
}

/// One unit of indexing: a file or a record.
#[derive(Debug, Clone)]
struct SourceDoc {
    source_id: String,
    node_type: NodeType,
    /// Workspace-relative path for files
    path: Option<String>,
    title: String,
    content: String,
    hash: String,
    language: Option<&'static str>,
    source_category: SourceCategory,
    /// Fixed category for every chunk; rules apply when unset
    category: Option<String>,
}

impl SourceDoc {
    fn from_file(file: ScannedFile) -> Self {
        let language = ContentParser::detect_language(&file.path);
        let source_category = match language {
            Some(lang) if ContentParser::is_code_language(lang) => SourceCategory::Code,
            _ => SourceCategory::Doc,
        };
        Self {
            source_id: file_node_id(&file.path),
            node_type: NodeType::File,
            title: file.path.rsplit('/').next().unwrap_or(&file.path).to_string(),
            path: Some(file.path),
            content: file.content,
            hash: file.hash,
            language,
            source_category,
            category: None,
        }
    }

    fn label(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.source_id)
    }

    fn source_node(&self) -> Node {
        let mut node = Node::new(&self.source_id, self.node_type)
            .with_title(&self.title)
            .with_text(excerpt(&self.content))
            .with_content_hash(&self.hash)
            .with_source_category(self.source_category)
            .with_updated_at(now());
        if let Some(path) = &self.path {
            node = node.with_path(path);
        }
        if let Some(lang) = self.language {
            node = node.with_language(lang);
        }
        if let Some(category) = &self.category {
            node = node.with_category(category);
        }
        node
    }
}

struct PreparedChunk {
    node: Node,
    metadata: VectorMetadata,
    embedding: Option<Vec<f32>>,
}

struct Prepared {
    doc: SourceDoc,
    chunks: Vec<PreparedChunk>,
    errors: Vec<PassError>,
}

/// Main indexer that orchestrates workspace indexing.
pub struct Indexer {
    workspace: Arc<Workspace>,
    embeddings: Arc<dyn EmbeddingProvider>,
    parser: ContentParser,
    linker: Linker,
    config: IndexerConfig,
}

impl Indexer {
    /// Create a new indexer with the given configuration.
    pub fn new(
        workspace: Arc<Workspace>,
        embeddings: Arc<dyn EmbeddingProvider>,
        config: IndexerConfig,
    ) -> Result<Self> {
        let parser = ContentParser::new(config.window)?;
        if config.concurrency == 0 {
            return Err(IndexError::InvalidConfig("concurrency must be positive".into()));
        }
        Ok(Self {
            workspace,
            embeddings,
            parser,
            linker: Linker::new(config.similarity_threshold),
            config,
        })
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// Bring the stores in line with `files`, the complete current file set.
    ///
    /// # Errors
    /// `PassInProgress` when another pass holds the workspace, `Cancelled`
    /// when `cancel` fires (committed files stay committed), and
    /// `StoreWriteFailure` or other fatal errors from the stores.
    pub async fn reindex(
        &self,
        files: Vec<ScannedFile>,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        let _pass = self.workspace.begin_pass()?;
        let pass_id = Uuid::new_v4().to_string();
        let span = info_span!("reindex", pass_id = %pass_id);
        self.run_pass(pass_id, files, cancel).instrument(span).await
    }

    async fn run_pass(
        &self,
        pass_id: String,
        files: Vec<ScannedFile>,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        let start = Instant::now();
        let mut report = IndexReport {
            pass_id,
            ..IndexReport::default()
        };
        let mut fresh: BTreeMap<String, Vec<f32>> = BTreeMap::new();

        report.pending_retried = self.embed_pending(&mut report, &mut fresh).await?;

        let files: BTreeMap<String, ScannedFile> =
            files.into_iter().map(|f| (f.path.clone(), f)).collect();
        let current: BTreeMap<String, String> = files
            .iter()
            .map(|(path, f)| (path.clone(), f.hash.clone()))
            .collect();

        let mut changes = self.workspace.manifest().await.diff(&current);
        {
            // Manifest entries whose nodes are gone are indexed again
            let graph = self.workspace.graph().await;
            let manifest = self.workspace.manifest().await;
            for path in current.keys() {
                let tracked = manifest.files.contains_key(path)
                    && !changes.modified.contains(path);
                if tracked && !graph.contains_node(&file_node_id(path)) {
                    changes.added.push(path.clone());
                    changes.unchanged -= 1;
                }
            }
            changes.added.sort();
        }
        report.files_unchanged = changes.unchanged;
        info!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            removed = changes.removed.len(),
            unchanged = changes.unchanged,
            "Starting indexing pass"
        );

        for path in &changes.removed {
            if cancel.is_cancelled() {
                return self.cancelled(&report).await;
            }
            let removed = self.remove_source(&file_node_id(path)).await?;
            self.workspace.manifest_mut().await.remove_file(path);
            report.nodes_removed += removed;
            report.files_removed += 1;
            debug!(path = %path, nodes = removed, "Removed file");
        }

        let mut files = files;
        let docs: Vec<SourceDoc> = changes
            .to_index()
            .into_iter()
            .filter_map(|path| files.remove(&path))
            .map(SourceDoc::from_file)
            .collect();

        let mut prepared = stream::iter(docs.into_iter().map(|doc| self.prepare(doc)))
            .buffered(self.config.concurrency);
        let mut committed = 0usize;

        while let Some(result) = prepared.next().await {
            if cancel.is_cancelled() {
                drop(prepared);
                return self.cancelled(&report).await;
            }

            let unit = match result {
                Ok(unit) => unit,
                Err(e) => {
                    warn!("{}", e);
                    report.errors.push(pass_error(&e));
                    continue;
                }
            };

            if let Err(e) = self.commit(unit, &mut report, &mut fresh).await {
                if e.is_fatal() {
                    error!("Aborting pass: {}", e);
                    if let Err(flush_err) = self.workspace.flush().await {
                        error!("Flush after failed pass also failed: {}", flush_err);
                    }
                    return Err(e);
                }
                warn!("{}", e);
                report.errors.push(pass_error(&e));
                continue;
            }

            report.files_indexed += 1;
            committed += 1;
            if self.config.checkpoint_every > 0 && committed % self.config.checkpoint_every == 0 {
                self.workspace.flush().await?;
                debug!("Checkpoint after {} files", committed);
            }
        }
        drop(prepared);

        self.finish(&mut report, &fresh).await?;
        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            files = report.files_indexed,
            removed = report.files_removed,
            nodes_written = report.nodes_written,
            nodes_removed = report.nodes_removed,
            edges_written = report.edges_written,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "Indexing pass complete"
        );
        Ok(report)
    }

    /// Index a task or prevention-rule record.
    ///
    /// The record body is chunked like a Markdown document and linked like
    /// any other chunk. Re-indexing an unchanged record writes nothing.
    pub async fn index_record(
        &self,
        kind: RecordKind,
        record_id: &str,
        title: &str,
        body: &str,
        category: Option<&str>,
    ) -> Result<IndexReport> {
        let _pass = self.workspace.begin_pass()?;
        let pass_id = Uuid::new_v4().to_string();
        let span = info_span!("index_record", pass_id = %pass_id, record = %record_id);

        async {
            let mut report = IndexReport {
                pass_id,
                ..IndexReport::default()
            };
            let source_id = record_node_id(kind.node_type(), record_id);
            let hash = content_hash(format!("{}\0{}\0{:?}", title, body, category).as_bytes());

            let unchanged = self
                .workspace
                .graph()
                .await
                .get_node(&source_id)
                .and_then(|n| n.properties.content_hash.clone())
                .map_or(false, |stored| stored == hash);
            if unchanged {
                debug!("Record {} unchanged", source_id);
                return Ok(report);
            }

            let doc = SourceDoc {
                source_id,
                node_type: kind.node_type(),
                path: None,
                title: title.to_string(),
                content: body.to_string(),
                hash,
                language: Some("markdown"),
                source_category: kind.source_category(),
                category: category.map(str::to_string),
            };

            let mut fresh = BTreeMap::new();
            match self.prepare(doc).await {
                Ok(unit) => self.commit(unit, &mut report, &mut fresh).await?,
                Err(e) => {
                    warn!("{}", e);
                    report.errors.push(pass_error(&e));
                    return Ok(report);
                }
            }
            self.finish(&mut report, &fresh).await?;
            Ok::<IndexReport, IndexError>(report)
        }
        .instrument(span)
        .await
    }

    /// Delete a record and its chunks. Returns the number of nodes removed.
    pub async fn remove_record(&self, kind: RecordKind, record_id: &str) -> Result<usize> {
        let _pass = self.workspace.begin_pass()?;
        let removed = self
            .remove_source(&record_node_id(kind.node_type(), record_id))
            .await?;
        self.workspace.flush().await?;
        info!("Removed record {} ({} nodes)", record_id, removed);
        Ok(removed)
    }

    /// Re-embed chunks whose embedding failed in an earlier pass.
    pub async fn retry_pending(&self) -> Result<IndexReport> {
        let _pass = self.workspace.begin_pass()?;
        let mut report = IndexReport {
            pass_id: Uuid::new_v4().to_string(),
            ..IndexReport::default()
        };
        let mut fresh = BTreeMap::new();
        report.pending_retried = self.embed_pending(&mut report, &mut fresh).await?;
        self.finish(&mut report, &fresh).await?;
        Ok(report)
    }

    /// Parse a source and embed its chunks.
    async fn prepare(&self, doc: SourceDoc) -> Result<Prepared> {
        let descriptors = self.chunk(&doc)?;
        let timestamp = now();

        let mut seen: BTreeMap<String, usize> = BTreeMap::new();
        let mut chunks = Vec::with_capacity(descriptors.len());
        let mut texts = Vec::with_capacity(descriptors.len());

        for desc in &descriptors {
            let mut id = chunk_node_id(&doc.source_id, desc.kind, &desc.title, &desc.text);
            let n = seen.entry(id.clone()).or_insert(0);
            *n += 1;
            if *n > 1 {
                id = format!("{}#{}", id, n);
            }

            let category = doc
                .category
                .clone()
                .unwrap_or_else(|| self.config.categories.categorize(doc.path.as_deref(), &desc.title));

            let mut node = Node::new(&id, NodeType::Chunk)
                .with_kind(desc.kind)
                .with_title(&desc.title)
                .with_text(&desc.text)
                .with_span(desc.span)
                .with_category(&category)
                .with_source_category(doc.source_category)
                .with_updated_at(timestamp);
            if let Some(path) = &doc.path {
                node = node.with_path(path);
            }
            if let Some(lang) = doc.language {
                node = node.with_language(lang);
            }
            if let Some(scope) = &desc.scope {
                node = node.with_extra("scope", serde_json::Value::from(scope.as_str()));
            }

            texts.push(truncate_chars(
                &ContentParser::embedding_text(desc, doc.label()),
                self.config.max_embed_chars,
            ));
            chunks.push(PreparedChunk {
                metadata: VectorMetadata {
                    node_type: NodeType::for_chunk_kind(desc.kind),
                    kind: Some(desc.kind.as_str().to_string()),
                    category,
                    source_category: doc.source_category,
                    path: doc.path.clone(),
                    timestamp,
                },
                node,
                embedding: None,
            });
        }

        let mut errors = Vec::new();
        let batch_size = self
            .config
            .batch_size
            .min(self.embeddings.max_batch_size())
            .max(1);

        for (batch_index, batch) in texts.chunks(batch_size).enumerate() {
            let offset = batch_index * batch_size;
            match embed_with_retry(self.embeddings.as_ref(), batch, self.config.retry).await {
                Ok(vectors) => {
                    for (i, vector) in vectors.into_iter().enumerate() {
                        chunks[offset + i].embedding = Some(vector);
                    }
                }
                Err((attempts, e)) => {
                    let err = IndexError::EmbeddingFailure {
                        attempts,
                        reason: e.to_string(),
                    };
                    warn!(source = %doc.label(), "{}; marking {} chunks pending", err, batch.len());
                    errors.push(PassError {
                        source: doc.label().to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }

        Ok(Prepared { doc, chunks, errors })
    }

    fn chunk(&self, doc: &SourceDoc) -> Result<Vec<ChunkDescriptor>> {
        let mut descriptors: Vec<ChunkDescriptor> = self
            .parser
            .parse(doc.label(), &doc.content, doc.language)?
            .collect();

        // Content the parser found no boundary in still gets one chunk
        if descriptors.is_empty() && !doc.content.trim().is_empty() {
            let title = doc
                .content
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or_default();
            descriptors.push(ChunkDescriptor {
                span: Span {
                    line_start: 1,
                    line_end: doc.content.lines().count().max(1),
                    byte_start: 0,
                    byte_end: doc.content.len(),
                },
                kind: ChunkKind::Window,
                title: truncate_chars(title, 80),
                text: doc.content.clone(),
                scope: None,
            });
        }
        Ok(descriptors)
    }

    /// Replace one source's subtree in both stores.
    ///
    /// Runs to completion or rolls the source back entirely: on a graph or
    /// vector write failure the source node and its chunks are removed and
    /// its manifest entry dropped, so the next pass indexes it from scratch.
    async fn commit(
        &self,
        unit: Prepared,
        report: &mut IndexReport,
        fresh: &mut BTreeMap<String, Vec<f32>>,
    ) -> Result<()> {
        let Prepared { doc, chunks, errors } = unit;
        report.errors.extend(errors);
        let vectors = self.workspace.vectors();

        let old_ids: Vec<String> = {
            let graph = self.workspace.graph().await;
            let mut ids = graph.subtree_ids(&doc.source_id, EdgeType::Contains);
            ids.remove(&doc.source_id);
            ids.into_iter().collect()
        };
        if let Err(e) = vectors.delete_many(&old_ids).await {
            if let Some(path) = &doc.path {
                self.workspace.manifest_mut().await.remove_file(path);
            }
            return Err(IndexError::StoreWriteFailure(format!(
                "deleting vectors of {}: {}",
                doc.label(),
                e
            )));
        }

        let chunk_ids: Vec<String> = chunks.iter().map(|c| c.node.id.clone()).collect();
        let staged = {
            let mut graph = self.workspace.graph_mut().await;
            write_subtree(&mut graph, &doc, chunks, report, fresh)
        };
        let records = match staged {
            Ok(records) => records,
            Err(e) => {
                error!(source = %doc.label(), "Graph write failed, rolling back: {}", e);
                self.roll_back(&doc, &chunk_ids, fresh).await;
                return Err(e);
            }
        };

        let written = records.len();
        if let Err(e) = vectors.upsert_batch(records).await {
            error!(source = %doc.label(), "Vector write failed, rolling back: {}", e);
            self.roll_back(&doc, &chunk_ids, fresh).await;
            return Err(IndexError::StoreWriteFailure(format!(
                "writing vectors of {}: {}",
                doc.label(),
                e
            )));
        }
        report.vectors_written += written;

        if let Some(path) = &doc.path {
            self.workspace
                .manifest_mut()
                .await
                .record_indexed(path.clone(), doc.hash.clone(), chunk_ids);
        }
        debug!(source = %doc.label(), vectors = written, "Committed");
        Ok(())
    }

    /// Undo a partially committed source.
    ///
    /// Removes the source's subtree and any of `chunk_ids` already written as
    /// chunks, their vectors and the manifest entry. Nodes of another type
    /// that share an id are left alone.
    async fn roll_back(
        &self,
        doc: &SourceDoc,
        chunk_ids: &[String],
        fresh: &mut BTreeMap<String, Vec<f32>>,
    ) {
        {
            let mut guard = self.workspace.graph_mut().await;
            let graph: &mut GraphStore = &mut guard;
            let owned = |graph: &GraphStore, id: &str, node_type: NodeType| {
                graph.get_node(id).map_or(false, |n| n.node_type == node_type)
            };
            let mut ids = if owned(&*graph, doc.source_id.as_str(), doc.node_type) {
                graph.subtree_ids(&doc.source_id, EdgeType::Contains)
            } else {
                BTreeSet::new()
            };
            ids.extend(
                chunk_ids
                    .iter()
                    .filter(|id| owned(&*graph, id.as_str(), NodeType::Chunk))
                    .cloned(),
            );
            graph.remove_nodes(&ids);
        }
        if let Err(cleanup) = self.workspace.vectors().delete_many(chunk_ids).await {
            warn!("Rollback could not delete vectors: {}", cleanup);
        }
        for id in chunk_ids {
            fresh.remove(id);
        }
        if let Some(path) = &doc.path {
            self.workspace.manifest_mut().await.remove_file(path);
        }
    }

    /// Delete a source node, its chunks and their vectors. Returns the node count.
    async fn remove_source(&self, source_id: &str) -> Result<usize> {
        let ids = self
            .workspace
            .graph()
            .await
            .subtree_ids(source_id, EdgeType::Contains);
        if ids.is_empty() {
            return Ok(0);
        }

        let chunk_ids: Vec<String> = ids.iter().filter(|id| *id != source_id).cloned().collect();
        self.workspace
            .vectors()
            .delete_many(&chunk_ids)
            .await
            .map_err(|e| {
                IndexError::StoreWriteFailure(format!("deleting vectors of {}: {}", source_id, e))
            })?;
        self.workspace.graph_mut().await.remove_nodes(&ids);
        Ok(ids.len())
    }

    /// Embed every `embedding_pending` chunk. Returns how many got a vector.
    async fn embed_pending(
        &self,
        report: &mut IndexReport,
        fresh: &mut BTreeMap<String, Vec<f32>>,
    ) -> Result<usize> {
        let pending: Vec<Node> = self
            .workspace
            .graph()
            .await
            .query(
                Some(NodeType::Chunk),
                &[PropertyFilter::equals("embedding_pending", true)],
            )
            .into_iter()
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        info!("Retrying {} chunks with pending embeddings", pending.len());

        let batch_size = self
            .config
            .batch_size
            .min(self.embeddings.max_batch_size())
            .max(1);
        let mut retried = 0;

        for batch in pending.chunks(batch_size) {
            let texts: Vec<String> = batch
                .iter()
                .map(|node| {
                    let mut text = String::new();
                    if let Some(path) = &node.properties.path {
                        text.push_str(&format!("# File: {}\n", path));
                    }
                    if let Some(scope) = node.properties.extra.get("scope").and_then(|v| v.as_str()) {
                        text.push_str(&format!("# Scope: {}\n", scope));
                    }
                    text.push('\n');
                    text.push_str(node.text());
                    truncate_chars(&text, self.config.max_embed_chars)
                })
                .collect();

            let vectors = match embed_with_retry(self.embeddings.as_ref(), &texts, self.config.retry).await {
                Ok(vectors) => vectors,
                Err((attempts, e)) => {
                    let err = IndexError::EmbeddingFailure {
                        attempts,
                        reason: e.to_string(),
                    };
                    warn!("Pending chunks still failing: {}", err);
                    report.errors.push(pass_error(&err));
                    continue;
                }
            };

            let records: Vec<VectorRecord> = batch
                .iter()
                .zip(vectors)
                .map(|(node, embedding)| VectorRecord {
                    chunk_id: node.id.clone(),
                    metadata: VectorMetadata::for_chunk(node),
                    embedding,
                })
                .collect();
            for record in &records {
                fresh.insert(record.chunk_id.clone(), record.embedding.clone());
            }
            self.workspace
                .vectors()
                .upsert_batch(records)
                .await
                .map_err(|e| IndexError::StoreWriteFailure(format!("writing pending vectors: {}", e)))?;

            let mut graph = self.workspace.graph_mut().await;
            for node in batch {
                graph.update_properties(&node.id, |p| p.embedding_pending = false);
            }
            retried += batch.len();
            report.vectors_written += batch.len();
        }
        Ok(retried)
    }

    /// Link, sweep stale vectors, check integrity and flush.
    async fn finish(
        &self,
        report: &mut IndexReport,
        fresh: &BTreeMap<String, Vec<f32>>,
    ) -> Result<()> {
        let vectors = self.workspace.vectors();
        let sources = Linker::chunk_sources(&*self.workspace.graph().await);
        let similar = self.linker.similar_to(&sources, vectors.as_ref(), fresh).await?;
        {
            let mut graph = self.workspace.graph_mut().await;
            let stats = self.linker.link(&mut graph, &similar);
            report.edges_written += stats.edges_written;
        }

        let dangling: Vec<String> = {
            let graph = self.workspace.graph().await;
            vectors
                .ids()
                .await?
                .into_iter()
                .filter(|id| !graph.contains_node(id))
                .collect()
        };
        if !dangling.is_empty() {
            warn!("Deleting {} vectors without a chunk", dangling.len());
            vectors.delete_many(&dangling).await?;
        }

        {
            let graph = self.workspace.graph().await;
            report.integrity = IntegrityReport::check(&graph, vectors.as_ref()).await?;
            report.pending_embeddings = graph
                .query(
                    Some(NodeType::Chunk),
                    &[PropertyFilter::equals("embedding_pending", true)],
                )
                .len();
        }
        if !report.integrity.is_consistent() {
            report.integrity.log();
        }

        self.workspace.flush().await
    }

    async fn cancelled(&self, report: &IndexReport) -> Result<IndexReport> {
        info!(
            files = report.files_indexed,
            removed = report.files_removed,
            "Pass cancelled, keeping committed files"
        );
        self.workspace.flush().await?;
        Err(IndexError::Cancelled)
    }
}

/// Replace a source's chunks in the graph. Returns the vector records to write.
fn write_subtree(
    graph: &mut GraphStore,
    doc: &SourceDoc,
    chunks: Vec<PreparedChunk>,
    report: &mut IndexReport,
    fresh: &mut BTreeMap<String, Vec<f32>>,
) -> Result<Vec<VectorRecord>> {
    let removed = graph.delete_descendants(&doc.source_id, EdgeType::Contains);
    report.nodes_removed += removed.len();

    if graph.put_node(doc.source_node())? {
        report.nodes_written += 1;
    }

    let mut records = Vec::new();
    for PreparedChunk {
        mut node,
        metadata,
        embedding,
    } in chunks
    {
        node.properties.embedding_pending = embedding.is_none();
        let id = node.id.clone();
        if graph.put_node(node)? {
            report.nodes_written += 1;
        }
        if graph.put_edge(Edge::new(&doc.source_id, &id, EdgeType::Contains))? {
            report.edges_written += 1;
        }
        if let Some(embedding) = embedding {
            fresh.insert(id.clone(), embedding.clone());
            records.push(VectorRecord {
                chunk_id: id,
                embedding,
                metadata,
            });
        }
    }
    Ok(records)
}

fn pass_error(e: &IndexError) -> PassError {
    let source = match e {
        IndexError::ParseFailure { path, .. } => path.clone(),
        _ => String::new(),
    };
    PassError {
        source,
        message: e.to_string(),
    }
}

fn excerpt(content: &str) -> String {
    truncate_chars(content.trim(), EXCERPT_CHARS)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbeddings;
    use crate::graph::GraphStore;
    use crate::vector::VectorStore;

    const DIM: usize = 64;

    fn indexer() -> Indexer {
        let workspace = Arc::new(Workspace::in_memory(DIM));
        Indexer::new(
            workspace,
            Arc::new(HashingEmbeddings::new(DIM)),
            IndexerConfig::default(),
        )
        .unwrap()
    }

    fn contains_count(graph: &GraphStore, source: &str) -> usize {
        graph.outgoing_count(source, Some(EdgeType::Contains))
    }

    #[tokio::test]
    async fn test_reindex_then_noop() {
        let indexer = indexer();
        let cancel = CancellationToken::new();
        let files = vec![
            ScannedFile::new("src/lib.rs", "pub fn alpha() -> u32 { beta() }\n\npub fn beta() -> u32 { 1 }\n"),
            ScannedFile::new("README.md", "# Readme\n\nCall alpha to start.\n"),
        ];

        let first = indexer.reindex(files.clone(), &cancel).await.unwrap();
        assert_eq!(first.files_indexed, 2);
        assert!(first.nodes_written >= 5);
        assert!(first.integrity.is_consistent(), "{:?}", first.integrity);

        let second = indexer.reindex(files, &cancel).await.unwrap();
        assert!(second.is_noop(), "{:?}", second);
        assert_eq!(second.files_unchanged, 2);
    }

    #[tokio::test]
    async fn test_removed_file_cascades() {
        let indexer = indexer();
        let cancel = CancellationToken::new();
        let a = ScannedFile::new("a.rs", "fn a() {}\n");
        let b = ScannedFile::new("b.rs", "fn b() {}\n");
        indexer.reindex(vec![a.clone(), b], &cancel).await.unwrap();

        let report = indexer.reindex(vec![a], &cancel).await.unwrap();
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.nodes_removed, 2);

        let ws = indexer.workspace();
        let graph = ws.graph().await;
        assert!(!graph.contains_node("file:b.rs"));
        assert_eq!(contains_count(&graph, "file:a.rs"), 1);
        assert_eq!(ws.vectors().len().await.unwrap(), 1);
        assert!(!ws.manifest().await.files.contains_key("b.rs"));
    }

    #[tokio::test]
    async fn test_blank_and_boundaryless_files() {
        let indexer = indexer();
        let cancel = CancellationToken::new();
        let report = indexer
            .reindex(
                vec![
                    ScannedFile::new("empty.md", "  \n"),
                    ScannedFile::new("punct.rs", ";\n"),
                ],
                &cancel,
            )
            .await
            .unwrap();
        assert!(report.integrity.is_consistent(), "{:?}", report.integrity);

        let graph = indexer.workspace().graph().await;
        assert_eq!(contains_count(&graph, "file:empty.md"), 0);
        assert_eq!(contains_count(&graph, "file:punct.rs"), 1);
    }

    #[tokio::test]
    async fn test_parse_failure_is_skipped() {
        let indexer = indexer();
        let cancel = CancellationToken::new();
        let report = indexer
            .reindex(
                vec![
                    ScannedFile::new("bad.rs", "fn a() {}\0"),
                    ScannedFile::new("good.rs", "fn good() {}\n"),
                ],
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(report.files_indexed, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].source, "bad.rs");
        assert!(!indexer.workspace().manifest().await.files.contains_key("bad.rs"));
    }

    #[tokio::test]
    async fn test_records_are_indexed_and_removed() {
        let indexer = indexer();
        let report = indexer
            .index_record(
                RecordKind::PreventionRule,
                "r1",
                "Token expiry",
                "Never trust an expired token in validateToken.",
                Some("auth"),
            )
            .await
            .unwrap();
        assert!(report.nodes_written >= 2);

        let again = indexer
            .index_record(
                RecordKind::PreventionRule,
                "r1",
                "Token expiry",
                "Never trust an expired token in validateToken.",
                Some("auth"),
            )
            .await
            .unwrap();
        assert!(again.is_noop());

        {
            let graph = indexer.workspace().graph().await;
            let rule = graph.get_node("rule:r1").unwrap();
            assert_eq!(rule.node_type, NodeType::PreventionRule);
            let chunks = graph.neighbors("rule:r1", Some(EdgeType::Contains), crate::model::Direction::Outgoing);
            assert!(!chunks.is_empty());
            assert!(chunks.iter().all(|c| c.properties.category.as_deref() == Some("auth")));
            assert!(chunks
                .iter()
                .all(|c| c.properties.source_category == Some(SourceCategory::Prevention)));
        }

        let removed = indexer
            .remove_record(RecordKind::PreventionRule, "r1")
            .await
            .unwrap();
        assert!(removed >= 2);
        assert!(indexer.workspace().graph().await.is_empty());
        assert_eq!(indexer.workspace().vectors().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_graph_write_failure_rolls_back_source() {
        let indexer = indexer();
        let ws = indexer.workspace().clone();
        let cancel = CancellationToken::new();
        let v1 = ScannedFile::new("src/lib.rs", "pub fn alpha() -> u32 { 1 }\n\npub fn beta() -> u32 { 2 }\n");
        let v2 = ScannedFile::new("src/lib.rs", "pub fn alpha() -> u32 { 1 }\n\npub fn beta() -> u32 { 3 }\n");
        indexer.reindex(vec![v1], &cancel).await.unwrap();
        assert_eq!(ws.vectors().len().await.unwrap(), 2);

        // Occupy the id of the edited chunk with a node of another type
        let prepared = indexer.prepare(SourceDoc::from_file(v2.clone())).await.unwrap();
        let taken = {
            let graph = ws.graph().await;
            prepared
                .chunks
                .iter()
                .map(|c| c.node.id.clone())
                .find(|id| !graph.contains_node(id))
                .unwrap()
        };
        ws.graph_mut()
            .await
            .put_node(Node::new(&taken, NodeType::Task).with_title("occupied"))
            .unwrap();

        let report = indexer.reindex(vec![v2.clone()], &cancel).await.unwrap();
        assert_eq!(report.files_indexed, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].message.contains(&taken));

        {
            let graph = ws.graph().await;
            assert!(!graph.contains_node("file:src/lib.rs"));
            assert!(graph.query(Some(NodeType::Chunk), &[]).is_empty());
            assert_eq!(graph.get_node(&taken).unwrap().node_type, NodeType::Task);
        }
        assert_eq!(ws.vectors().len().await.unwrap(), 0);
        assert!(!ws.manifest().await.files.contains_key("src/lib.rs"));

        // Once the id is free the file is indexed from scratch
        ws.graph_mut()
            .await
            .remove_nodes(&BTreeSet::from([taken]));
        let report = indexer.reindex(vec![v2], &cancel).await.unwrap();
        assert_eq!(report.files_indexed, 1);
        assert!(report.integrity.is_consistent(), "{:?}", report.integrity);
        assert_eq!(ws.vectors().len().await.unwrap(), 2);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
