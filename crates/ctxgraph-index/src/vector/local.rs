//! Brute-force vector store persisted as JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{cosine_similarity, MetadataFilter, VectorHit, VectorRecord, VectorStore};
use crate::error::{IndexError, Result};
use crate::graph::write_atomic;

/// Vector table file name.
pub const VECTORS_FILE: &str = "vectors.json";

/// In-process vector store with exact cosine search.
///
/// Suitable for workspaces up to a few hundred thousand chunks.
pub struct LocalVectorStore {
    path: Option<PathBuf>,
    dimensions: usize,
    records: RwLock<BTreeMap<String, VectorRecord>>,
    dirty: AtomicBool,
}

impl LocalVectorStore {
    /// Create a store that is never persisted.
    pub fn in_memory(dimensions: usize) -> Self {
        Self {
            path: None,
            dimensions,
            records: RwLock::new(BTreeMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Open the store in `dir`, loading `vectors.json` if present.
    pub fn open<P: AsRef<Path>>(dir: P, dimensions: usize) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(VECTORS_FILE);

        let mut records = BTreeMap::new();
        if path.exists() {
            let stored: Vec<VectorRecord> =
                serde_json::from_str(&std::fs::read_to_string(&path)?)?;
            for record in stored {
                if record.embedding.len() != dimensions {
                    return Err(IndexError::DimensionMismatch {
                        expected: dimensions,
                        actual: record.embedding.len(),
                    });
                }
                records.insert(record.chunk_id.clone(), record);
            }
            info!("Loaded {} vectors from {}", records.len(), path.display());
        }

        Ok(Self {
            path: Some(path),
            dimensions,
            records: RwLock::new(records),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub async fn get(&self, chunk_id: &str) -> Option<VectorRecord> {
        self.records.read().await.get(chunk_id).cloned()
    }
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn upsert(&self, record: VectorRecord) -> Result<()> {
        if record.embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: record.embedding.len(),
            });
        }
        self.records
            .write()
            .await
            .insert(record.chunk_id.clone(), record);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, chunk_id: &str) -> Result<()> {
        if self.records.write().await.remove(chunk_id).is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorHit>> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }

        let records = self.records.read().await;
        let mut hits: Vec<VectorHit> = records
            .values()
            .filter(|r| filter.map_or(true, |f| f.matches(&r.metadata)))
            .map(|r| VectorHit {
                chunk_id: r.chunk_id.clone(),
                similarity: cosine_similarity(query, &r.embedding),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);

        debug!("Vector search returned {} hits", hits.len());
        Ok(hits)
    }

    async fn contains(&self, chunk_id: &str) -> Result<bool> {
        Ok(self.records.read().await.contains_key(chunk_id))
    }

    async fn ids(&self) -> Result<Vec<String>> {
        Ok(self.records.read().await.keys().cloned().collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }

    async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }

        let records = self.records.read().await;
        let rows: Vec<&VectorRecord> = records.values().collect();
        write_atomic(path, &rows)?;
        self.dirty.store(false, Ordering::SeqCst);
        debug!("Flushed {} vectors to {}", rows.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeType, SourceCategory};
    use crate::vector::VectorMetadata;
    use tempfile::TempDir;

    fn record(id: &str, embedding: Vec<f32>, category: &str) -> VectorRecord {
        VectorRecord {
            chunk_id: id.to_string(),
            embedding,
            metadata: VectorMetadata {
                node_type: NodeType::Chunk,
                kind: None,
                category: category.to_string(),
                source_category: SourceCategory::Code,
                path: Some(format!("src/{}.rs", category)),
                timestamp: 1,
            },
        }
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let store = LocalVectorStore::in_memory(2);
        store.upsert(record("far", vec![0.0, 1.0], "ui")).await.unwrap();
        store.upsert(record("near", vec![1.0, 0.1], "auth")).await.unwrap();
        store.upsert(record("exact", vec![2.0, 0.0], "auth")).await.unwrap();

        let hits = store.search(&[1.0, 0.0], 2, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "near"]);
        assert!(hits[0].similarity >= hits[1].similarity);
    }

    #[tokio::test]
    async fn test_filter_applies_before_top_k() {
        let store = LocalVectorStore::in_memory(2);
        // Many better-scoring records outside the filter
        for i in 0..10 {
            store
                .upsert(record(&format!("ui{}", i), vec![1.0, 0.0], "ui"))
                .await
                .unwrap();
        }
        store.upsert(record("auth1", vec![0.0, 1.0], "auth")).await.unwrap();
        store.upsert(record("auth2", vec![0.5, 1.0], "auth")).await.unwrap();

        let filter = MetadataFilter::new().with_categories(vec!["auth".into()]);
        let hits = store.search(&[1.0, 0.0], 5, Some(&filter)).await.unwrap();
        // Fewer matches than k: all of them, no error
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "auth2");
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_delete_removes() {
        let store = LocalVectorStore::in_memory(2);
        store.upsert(record("a", vec![1.0, 0.0], "x")).await.unwrap();
        store.upsert(record("a", vec![0.0, 1.0], "x")).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.get("a").await.unwrap().embedding, vec![0.0, 1.0]);

        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert!(!store.contains("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let store = LocalVectorStore::in_memory(3);
        let err = store.upsert(record("a", vec![1.0], "x")).await.unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { expected: 3, actual: 1 }));
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        tokio_test::block_on(async {
            let store = LocalVectorStore::open(dir.path(), 2).unwrap();
            store.upsert(record("a", vec![1.0, 0.0], "auth")).await.unwrap();
            store.flush().await.unwrap();

            let reopened = LocalVectorStore::open(dir.path(), 2).unwrap();
            assert_eq!(reopened.ids().await.unwrap(), vec!["a".to_string()]);

            let err = LocalVectorStore::open(dir.path(), 4).err().unwrap();
            assert!(matches!(err, IndexError::DimensionMismatch { .. }));
        });
    }
}
