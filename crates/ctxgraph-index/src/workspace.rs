//! Store handle shared by the indexer and the retriever.
//!
//! A `Workspace` owns the graph store, the vector store and the manifest of
//! one indexed tree. Open it at scan start, pass it to [`crate::Indexer`]
//! and [`crate::HybridRetriever`], and [`Workspace::close`] it at shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::error::{IndexError, Result};
use crate::graph::GraphStore;
use crate::manifest::IndexManifest;
use crate::vector::{LocalVectorStore, VectorStore};

/// Manifest file name inside the state directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Open stores for one workspace.
pub struct Workspace {
    state_dir: Option<PathBuf>,
    graph: RwLock<GraphStore>,
    vectors: Arc<dyn VectorStore>,
    manifest: Mutex<IndexManifest>,
    pass_lock: Mutex<()>,
}

impl Workspace {
    /// Open the stores under `state_dir` with the given vector backend.
    pub fn open(state_dir: impl AsRef<Path>, vectors: Arc<dyn VectorStore>) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        std::fs::create_dir_all(state_dir)?;

        let graph = GraphStore::open(state_dir)?;
        let manifest = IndexManifest::load_or_default(&state_dir.join(MANIFEST_FILE));
        info!(
            "Opened workspace state at {} ({} files in manifest)",
            state_dir.display(),
            manifest.files.len()
        );

        Ok(Self {
            state_dir: Some(state_dir.to_path_buf()),
            graph: RwLock::new(graph),
            vectors,
            manifest: Mutex::new(manifest),
            pass_lock: Mutex::new(()),
        })
    }

    /// Open the stores under `state_dir` with the local JSON vector store.
    pub fn open_local(state_dir: impl AsRef<Path>, dimensions: usize) -> Result<Self> {
        let vectors = LocalVectorStore::open(state_dir.as_ref(), dimensions)?;
        Self::open(state_dir, Arc::new(vectors))
    }

    /// A workspace that never touches disk.
    pub fn in_memory(dimensions: usize) -> Self {
        Self {
            state_dir: None,
            graph: RwLock::new(GraphStore::in_memory()),
            vectors: Arc::new(LocalVectorStore::in_memory(dimensions)),
            manifest: Mutex::new(IndexManifest::new()),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn state_dir(&self) -> Option<&Path> {
        self.state_dir.as_deref()
    }

    /// Read access to the graph.
    pub async fn graph(&self) -> RwLockReadGuard<'_, GraphStore> {
        self.graph.read().await
    }

    pub(crate) async fn graph_mut(&self) -> RwLockWriteGuard<'_, GraphStore> {
        self.graph.write().await
    }

    pub fn vectors(&self) -> &Arc<dyn VectorStore> {
        &self.vectors
    }

    /// Snapshot of the manifest.
    pub async fn manifest(&self) -> IndexManifest {
        self.manifest.lock().await.clone()
    }

    pub(crate) async fn manifest_mut(&self) -> MutexGuard<'_, IndexManifest> {
        self.manifest.lock().await
    }

    /// Claim the single writer slot, failing fast when a pass is running.
    pub(crate) fn begin_pass(&self) -> Result<MutexGuard<'_, ()>> {
        self.pass_lock
            .try_lock()
            .map_err(|_| IndexError::PassInProgress)
    }

    /// Persist vectors, then the graph, then the manifest.
    pub async fn flush(&self) -> Result<()> {
        self.vectors.flush().await?;
        self.graph.write().await.flush()?;

        if let Some(dir) = &self.state_dir {
            self.manifest.lock().await.save(&dir.join(MANIFEST_FILE))?;
        }
        debug!("Workspace flushed");
        Ok(())
    }

    /// Flush and release the stores.
    pub async fn close(self) -> Result<()> {
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Node, NodeType};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::open_local(dir.path(), 4).unwrap();
        ws.graph_mut()
            .await
            .put_node(Node::new("file:a.rs", NodeType::File))
            .unwrap();
        ws.manifest_mut()
            .await
            .record_indexed("a.rs".into(), "h".into(), vec![]);
        ws.close().await.unwrap();

        let reopened = Workspace::open_local(dir.path(), 4).unwrap();
        assert!(reopened.graph().await.contains_node("file:a.rs"));
        assert!(reopened.manifest().await.files.contains_key("a.rs"));
        assert!(dir.path().join(MANIFEST_FILE).exists());
    }

    #[tokio::test]
    async fn test_single_writer() {
        let ws = Workspace::in_memory(4);
        let guard = ws.begin_pass().unwrap();
        assert!(matches!(ws.begin_pass(), Err(IndexError::PassInProgress)));
        drop(guard);
        assert!(ws.begin_pass().is_ok());
    }
}
