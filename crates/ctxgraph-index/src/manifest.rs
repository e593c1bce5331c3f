//! Index manifest and change detection.
//!
//! The manifest persists the content hash of every indexed file. Diffing it
//! against the current file set classifies files as added, modified,
//! removed or unchanged so a re-scan only touches what changed.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::now;

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Manifest tracking the state of indexed files, keyed by workspace-relative path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    /// Version of the manifest format
    pub version: u32,

    /// Unix seconds of the last change
    pub last_updated: Option<u64>,

    /// Map of relative file path to file state
    pub files: BTreeMap<String, FileState>,
}

/// State of an indexed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    /// SHA256 hash of the file content
    pub content_hash: String,

    /// Unix seconds when the file was last indexed
    pub indexed_at: u64,

    /// IDs of the chunks produced for this file
    pub chunk_ids: Vec<String>,
}

/// Result of diffing the current file set against the manifest.
///
/// `added`, `modified` and `removed` are disjoint and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
}

impl ChangeSet {
    /// True when nothing needs to be written.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Files that must be parsed, in path order.
    pub fn to_index(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .added
            .iter()
            .chain(self.modified.iter())
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

impl Default for IndexManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexManifest {
    /// Create a new empty manifest.
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            last_updated: None,
            files: BTreeMap::new(),
        }
    }

    /// Load manifest from a file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path).map_err(ManifestError::Io)?;
        serde_json::from_str(&content).map_err(ManifestError::Parse)
    }

    /// Load the manifest, starting fresh when it is missing or unreadable.
    ///
    /// A fresh manifest classifies every file as added, which re-indexes the
    /// workspace from scratch.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::new();
        }
        match Self::load(path) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Discarding unreadable manifest {}: {}", path.display(), e);
                Self::new()
            }
        }
    }

    /// Save manifest to a file, replacing it atomically.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let content = serde_json::to_string_pretty(self).map_err(ManifestError::Serialize)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(ManifestError::Io)?;
        fs::rename(&tmp, path).map_err(ManifestError::Io)
    }

    /// Classify `current` (path to content hash) against the recorded state.
    pub fn diff(&self, current: &BTreeMap<String, String>) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for (path, hash) in current {
            match self.files.get(path) {
                None => changes.added.push(path.clone()),
                Some(state) if state.content_hash != *hash => changes.modified.push(path.clone()),
                Some(_) => changes.unchanged += 1,
            }
        }

        changes.removed = self
            .files
            .keys()
            .filter(|p| !current.contains_key(*p))
            .cloned()
            .collect();

        changes
    }

    /// Record that a file was indexed.
    pub fn record_indexed(&mut self, path: String, content_hash: String, chunk_ids: Vec<String>) {
        self.files.insert(
            path,
            FileState {
                content_hash,
                indexed_at: now(),
                chunk_ids,
            },
        );
        self.last_updated = Some(now());
    }

    /// Remove a file from the manifest.
    pub fn remove_file(&mut self, path: &str) -> Option<FileState> {
        let state = self.files.remove(path)?;
        self.last_updated = Some(now());
        Some(state)
    }

    /// Total number of chunks across all recorded files.
    pub fn total_chunks(&self) -> usize {
        self.files.values().map(|s| s.chunk_ids.len()).sum()
    }
}

/// Errors that can occur when working with manifests.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest IO error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to parse manifest: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[source] serde_json::Error),
}
