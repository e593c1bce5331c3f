//! Qdrant-backed vector store.
//!
//! Chunk ids are mapped to deterministic UUID point ids; the original id is
//! kept in the payload. Path prefix filtering uses a `path_prefixes` keyword
//! array holding every directory ancestor of the chunk's path, so only
//! prefixes ending at a `/` boundary (or the full path) can match.

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, Condition, CreateCollectionBuilder,
    DeletePointsBuilder, Distance, Filter, GetPointsBuilder, ListValue, PointId, PointStruct,
    PointsIdsList, ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, Value,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use super::{MetadataFilter, VectorHit, VectorRecord, VectorStore};
use crate::error::{IndexError, Result};

/// Configuration for connecting to Qdrant.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    /// Qdrant server URL
    pub url: String,

    /// API key (optional)
    pub api_key: Option<String>,

    /// Collection name
    pub collection_name: String,

    /// Vector dimensions
    pub dimensions: usize,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            collection_name: crate::DEFAULT_COLLECTION.to_string(),
            dimensions: crate::DEFAULT_DIMENSIONS,
        }
    }
}

/// Vector store backed by a Qdrant collection.
pub struct QdrantVectorStore {
    client: Qdrant,
    collection_name: String,
    dimensions: usize,
}

fn store_err(context: &str, e: impl std::fmt::Display) -> IndexError {
    IndexError::VectorStore(format!("{}: {}", context, e))
}

impl QdrantVectorStore {
    /// Connect and create the collection if it does not exist.
    pub async fn connect(config: &QdrantConfig) -> Result<Self> {
        let mut builder = Qdrant::from_url(&config.url).skip_compatibility_check();
        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| store_err("Failed to connect to Qdrant", e))?;

        info!("Connected to Qdrant at {}", config.url);

        let store = Self {
            client,
            collection_name: config.collection_name.clone(),
            dimensions: config.dimensions,
        };
        store.ensure_collection().await?;
        Ok(store)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let collections = self
            .client
            .list_collections()
            .await
            .map_err(|e| store_err("Failed to list collections", e))?;
        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection_name);

        if exists {
            debug!("Collection {} already exists", self.collection_name);
            return Ok(());
        }

        info!(
            "Creating collection: {} with {} dimensions",
            self.collection_name, self.dimensions
        );
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection_name).vectors_config(
                    VectorParamsBuilder::new(self.dimensions as u64, Distance::Cosine),
                ),
            )
            .await
            .map_err(|e| store_err("Failed to create collection", e))?;
        Ok(())
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    fn build_filter(filter: &MetadataFilter) -> Option<Filter> {
        let mut conditions: Vec<Condition> = Vec::new();

        if !filter.node_types.is_empty() {
            let types: Vec<String> = filter
                .node_types
                .iter()
                .map(|t| t.as_str().to_string())
                .collect();
            conditions.push(Condition::matches("node_type", types));
        }
        if !filter.categories.is_empty() {
            conditions.push(Condition::matches("category", filter.categories.clone()));
        }
        if !filter.source_categories.is_empty() {
            let sources: Vec<String> = filter
                .source_categories
                .iter()
                .map(|c| c.as_str().to_string())
                .collect();
            conditions.push(Condition::matches("source_category", sources));
        }
        // Same component rule as `path_has_prefix`; an empty prefix matches everything
        let prefix = filter
            .path_prefix
            .as_deref()
            .map(|p| p.trim_end_matches('/'))
            .filter(|p| !p.is_empty());
        if let Some(prefix) = prefix {
            conditions.push(Condition::matches("path_prefixes", prefix.to_string()));
        }

        if conditions.is_empty() {
            None
        } else {
            Some(Filter::must(conditions))
        }
    }
}

/// Deterministic UUID for a chunk id.
pub(crate) fn point_uuid(chunk_id: &str) -> String {
    let digest = Sha256::digest(chunk_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

/// `src/auth/login.ts` yields `src`, `src/auth`, `src/auth/login.ts`.
pub(crate) fn path_prefixes(path: &str) -> Vec<String> {
    let mut prefixes: Vec<String> = path
        .match_indices('/')
        .map(|(i, _)| path[..i].to_string())
        .filter(|p| !p.is_empty())
        .collect();
    prefixes.push(path.to_string());
    prefixes
}

fn record_to_payload(record: &VectorRecord) -> HashMap<String, Value> {
    let meta = &record.metadata;
    let mut map = HashMap::new();
    map.insert("chunk_id".to_string(), Value::from(record.chunk_id.clone()));
    map.insert("node_type".to_string(), Value::from(meta.node_type.as_str().to_string()));
    map.insert("category".to_string(), Value::from(meta.category.clone()));
    map.insert(
        "source_category".to_string(),
        Value::from(meta.source_category.as_str().to_string()),
    );
    map.insert("timestamp".to_string(), Value::from(meta.timestamp as i64));
    if let Some(kind) = &meta.kind {
        map.insert("kind".to_string(), Value::from(kind.clone()));
    }
    if let Some(path) = &meta.path {
        map.insert("path".to_string(), Value::from(path.clone()));
        let values = path_prefixes(path).into_iter().map(Value::from).collect();
        map.insert(
            "path_prefixes".to_string(),
            Value {
                kind: Some(Kind::ListValue(ListValue { values })),
            },
        );
    }
    map
}

fn payload_chunk_id(payload: &HashMap<String, Value>) -> Option<String> {
    match payload.get("chunk_id").and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => Some(s.clone()),
        _ => None,
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert(&self, record: VectorRecord) -> Result<()> {
        self.upsert_batch(vec![record]).await
    }

    async fn upsert_batch(&self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if let Some(bad) = records.iter().find(|r| r.embedding.len() != self.dimensions) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: bad.embedding.len(),
            });
        }

        debug!("Upserting {} points", records.len());
        let points: Vec<PointStruct> = records
            .into_iter()
            .map(|r| {
                let payload = record_to_payload(&r);
                PointStruct::new(point_uuid(&r.chunk_id), r.embedding, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await
            .map_err(|e| store_err("Failed to upsert points", e))?;
        Ok(())
    }

    async fn delete(&self, chunk_id: &str) -> Result<()> {
        self.delete_many(&[chunk_id.to_string()]).await
    }

    async fn delete_many(&self, chunk_ids: &[String]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<PointId> = chunk_ids
            .iter()
            .map(|id| PointId::from(point_uuid(id)))
            .collect();

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await
            .map_err(|e| store_err("Failed to delete points", e))?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut builder =
            SearchPointsBuilder::new(&self.collection_name, query.to_vec(), k as u64)
                .with_payload(true);
        if let Some(f) = filter.and_then(Self::build_filter) {
            builder = builder.filter(f);
        }

        let response = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| store_err("Failed to search points", e))?;

        let mut hits: Vec<VectorHit> = response
            .result
            .into_iter()
            .filter_map(|p| {
                payload_chunk_id(&p.payload).map(|chunk_id| VectorHit {
                    chunk_id,
                    similarity: p.score,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        Ok(hits)
    }

    async fn contains(&self, chunk_id: &str) -> Result<bool> {
        let response = self
            .client
            .get_points(GetPointsBuilder::new(
                &self.collection_name,
                vec![PointId::from(point_uuid(chunk_id))],
            ))
            .await
            .map_err(|e| store_err("Failed to get point", e))?;
        Ok(!response.result.is_empty())
    }

    async fn ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let mut builder = ScrollPointsBuilder::new(&self.collection_name)
                .limit(512)
                .with_payload(true)
                .with_vectors(false);
            if let Some(o) = offset.take() {
                builder = builder.offset(o);
            }

            let page = self
                .client
                .scroll(builder)
                .await
                .map_err(|e| store_err("Failed to scroll points", e))?;

            ids.extend(page.result.iter().filter_map(|p| payload_chunk_id(&p.payload)));

            match page.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn len(&self) -> Result<usize> {
        let info = self
            .client
            .collection_info(&self.collection_name)
            .await
            .map_err(|e| store_err("Failed to get collection info", e))?;
        Ok(info
            .result
            .map(|r| r.points_count.unwrap_or(0) as usize)
            .unwrap_or(0))
    }
}
