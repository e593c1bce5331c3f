//! Workspace file enumeration.
//!
//! Walks the workspace honouring `.gitignore` and `.ctxgraphignore` and
//! yields `(path, content, hash)` for every indexable text file.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::chunker::ContentParser;
use crate::model::content_hash;

/// Ignore file read in addition to `.gitignore`.
pub const IGNORE_FILE: &str = ".ctxgraphignore";

/// A file ready for indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Path relative to the workspace root with `/` separators
    pub path: String,
    pub content: String,
    /// SHA-256 of the content
    pub hash: String,
}

impl ScannedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            hash: content_hash(content.as_bytes()),
            content,
        }
    }
}

/// Enumerates indexable files under a root directory.
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    /// Extensions to include; empty means every extension with a known language
    extensions: Vec<String>,
    max_file_size: u64,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: Vec::new(),
            max_file_size: 1024 * 1024,
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn wants(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        if self.extensions.is_empty() {
            ContentParser::detect_language(&path.to_string_lossy()).is_some()
        } else {
            self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
        }
    }

    /// Collect every indexable file, sorted by path.
    ///
    /// Unreadable, oversized and non-UTF-8 files are logged and skipped.
    pub fn scan(&self) -> Vec<ScannedFile> {
        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .git_global(false)
            .require_git(false)
            .add_custom_ignore_filename(IGNORE_FILE)
            .build();

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().map_or(false, |t| t.is_file()) || !self.wants(path) {
                continue;
            }

            if let Ok(meta) = entry.metadata() {
                if meta.len() > self.max_file_size {
                    debug!(path = %path.display(), size = meta.len(), "Skipping large file");
                    continue;
                }
            }

            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), "Failed to read file: {}", e);
                    continue;
                }
            };
            let content = match String::from_utf8(bytes) {
                Ok(content) => content,
                Err(_) => {
                    warn!(path = %path.display(), "Skipping non-UTF-8 file");
                    continue;
                }
            };

            files.push(ScannedFile::new(self.relative(path), content));
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!("Scanned {} files under {}", files.len(), self.root.display());
        files
    }

    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_scan_honours_ignore_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "src/main.rs", b"fn main() {}");
        write(root, "src/gen/out.rs", b"fn generated() {}");
        write(root, "docs/guide.md", b"# Guide");
        write(root, "build/tmp.rs", b"fn tmp() {}");
        write(root, "notes.bin", b"\x00\x01");
        write(root, ".gitignore", b"build/\n");
        write(root, IGNORE_FILE, b"src/gen/\n");

        let files = Scanner::new(root).scan();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["docs/guide.md", "src/main.rs"]);
        assert_eq!(files[1].hash, content_hash(b"fn main() {}"));
    }

    #[test]
    fn test_scan_extension_filter_and_non_utf8() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "a.rs", b"fn a() {}");
        write(root, "b.py", b"def b(): pass");
        write(root, "c.rs", &[0xff, 0xfe, 0x00]);

        let files = Scanner::new(root)
            .with_extensions(vec![".rs".into()])
            .scan();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.rs"]);
    }

    #[test]
    fn test_scan_skips_hidden_state_dir() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, ".ctxgraph/notes.md", b"# state");
        write(root, "README.md", b"# Readme");

        let files = Scanner::new(root).scan();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "README.md");
    }
}
