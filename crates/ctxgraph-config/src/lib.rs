//! Layered configuration for ctxgraph.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. `<user config dir>/ctxgraph/config.toml`
//! 3. `<workspace>/ctxgraph.toml`
//! 4. an explicit file passed on the command line
//! 5. environment variables `CTXGRAPH__SECTION__KEY`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Workspace-local config file name.
pub const WORKSPACE_CONFIG_FILE: &str = "ctxgraph.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CTXGRAPH";

const STRATEGIES: [&str; 4] = ["hybrid", "semantic", "keyword", "graph"];

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than 0")]
    NotPositive { field: &'static str },

    #[error("chunking.window_overlap ({overlap}) must be smaller than chunking.window_size ({size})")]
    OverlapTooLarge { overlap: usize, size: usize },

    #[error("{field} must be between 0 and 1, got {value}")]
    OutOfRange { field: &'static str, value: f32 },

    #[error("{field} must be a non-negative number, got {value}")]
    NegativeWeight { field: String, value: f32 },

    #[error("Unknown retrieval strategy {0:?} (expected hybrid, semantic, keyword or graph)")]
    UnknownStrategy(String),

    #[error("Category rule {0:?} has no keywords")]
    EmptyCategory(String),

    #[error("vector_store.qdrant_url is required for the qdrant backend")]
    MissingQdrantUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Deterministic feature hashing, no network
    #[default]
    Hashing,
    /// Any OpenAI-compatible `/embeddings` endpoint
    OpenAi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub provider: EmbeddingProviderKind,
    pub model: Option<String>,
    pub dimensions: usize,
    /// Literal key or `${VAR}` reference
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub batch_size: usize,
    pub max_retries: u32,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Hashing,
            model: None,
            dimensions: 384,
            api_key: Some("${OPENAI_API_KEY}".to_string()),
            base_url: None,
            batch_size: 32,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    /// JSON file in the state directory
    #[default]
    Local,
    Qdrant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub backend: VectorBackend,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub collection_name: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Local,
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_api_key: None,
            collection_name: "ctxgraph".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Characters per window
    pub window_size: usize,
    pub window_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            window_overlap: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub concurrency: usize,
    pub similarity_threshold: f32,
    /// Extensions to index, without the dot. Empty indexes every file with a known language.
    pub extensions: Vec<String>,
    /// Files larger than this are skipped
    pub max_file_size: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            similarity_threshold: 0.9,
            extensions: [
                "rs", "py", "js", "jsx", "ts", "tsx", "go", "md", "markdown", "txt", "toml",
                "yaml", "yml", "json",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_file_size: 1024 * 1024,
        }
    }
}

/// A keyword rule mapping chunks to a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsConfig {
    pub code: f32,
    pub doc: f32,
    pub prevention: f32,
    pub history: f32,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            code: 0.4,
            doc: 0.3,
            prevention: 0.2,
            history: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixConfig {
    pub semantic: f32,
    pub keyword: f32,
    pub graph: f32,
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            semantic: 0.5,
            keyword: 0.3,
            graph: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub strategy: String,
    pub max_results: usize,
    pub min_score: f32,
    pub graph_depth: usize,
    pub weights: WeightsConfig,
    pub mix: MixConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            strategy: "hybrid".to_string(),
            max_results: 10,
            min_score: 0.0,
            graph_depth: 2,
            weights: WeightsConfig::default(),
            mix: MixConfig::default(),
        }
    }
}

/// Complete ctxgraph configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Index state directory, relative to the workspace root unless absolute
    pub state_dir: String,
    pub embeddings: EmbeddingsConfig,
    pub vector_store: VectorStoreConfig,
    pub chunking: ChunkingConfig,
    pub indexer: IndexerConfig,
    /// Ordered category rules. Empty keeps the built-in rules.
    pub categories: Vec<CategoryConfig>,
    pub retrieval: RetrievalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: ".ctxgraph".to_string(),
            embeddings: EmbeddingsConfig::default(),
            vector_store: VectorStoreConfig::default(),
            chunking: ChunkingConfig::default(),
            indexer: IndexerConfig::default(),
            categories: Vec::new(),
            retrieval: RetrievalConfig::default(),
        }
    }
}

impl Config {
    /// Load every layer for `workspace`, then validate.
    pub fn load(workspace: &Path, explicit: Option<&Path>) -> Result<Self> {
        let user = dirs::config_dir().map(|dir| dir.join("ctxgraph").join("config.toml"));
        Self::load_layers(user.as_deref(), workspace, explicit)
    }

    fn load_layers(user: Option<&Path>, workspace: &Path, explicit: Option<&Path>) -> Result<Self> {
        let defaults = Self::default_toml()?;
        let mut builder =
            config::Config::builder().add_source(File::from_str(&defaults, FileFormat::Toml));

        if let Some(user) = user {
            builder = builder.add_source(File::from(user).format(FileFormat::Toml).required(false));
        }
        builder = builder.add_source(
            File::from(workspace.join(WORKSPACE_CONFIG_FILE))
                .format(FileFormat::Toml)
                .required(false),
        );
        if let Some(path) = explicit {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a single TOML document on top of the defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// The built-in defaults as a TOML document.
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&Self::default()).context("Failed to serialize default config")
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.embeddings.dimensions == 0 {
            return Err(ConfigError::NotPositive {
                field: "embeddings.dimensions",
            });
        }
        if self.embeddings.batch_size == 0 {
            return Err(ConfigError::NotPositive {
                field: "embeddings.batch_size",
            });
        }
        if self.chunking.window_size == 0 {
            return Err(ConfigError::NotPositive {
                field: "chunking.window_size",
            });
        }
        if self.chunking.window_overlap >= self.chunking.window_size {
            return Err(ConfigError::OverlapTooLarge {
                overlap: self.chunking.window_overlap,
                size: self.chunking.window_size,
            });
        }
        if self.indexer.concurrency == 0 {
            return Err(ConfigError::NotPositive {
                field: "indexer.concurrency",
            });
        }
        let threshold = self.indexer.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::OutOfRange {
                field: "indexer.similarity_threshold",
                value: threshold,
            });
        }
        if self.vector_store.backend == VectorBackend::Qdrant
            && self.vector_store.qdrant_url.trim().is_empty()
        {
            return Err(ConfigError::MissingQdrantUrl);
        }
        for rule in &self.categories {
            if rule.keywords.is_empty() {
                return Err(ConfigError::EmptyCategory(rule.name.clone()));
            }
        }

        let retrieval = &self.retrieval;
        if !STRATEGIES.contains(&retrieval.strategy.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::UnknownStrategy(retrieval.strategy.clone()));
        }
        if retrieval.max_results == 0 {
            return Err(ConfigError::NotPositive {
                field: "retrieval.max_results",
            });
        }
        let w = &retrieval.weights;
        let m = &retrieval.mix;
        for (name, value) in [
            ("weights.code", w.code),
            ("weights.doc", w.doc),
            ("weights.prevention", w.prevention),
            ("weights.history", w.history),
            ("mix.semantic", m.semantic),
            ("mix.keyword", m.keyword),
            ("mix.graph", m.graph),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::NegativeWeight {
                    field: format!("retrieval.{}", name),
                    value,
                });
            }
        }
        Ok(())
    }

    /// Absolute state directory for `workspace`, with `~` and `${VAR}` expanded.
    pub fn state_path(&self, workspace: &Path) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.state_dir)
            .with_context(|| format!("Failed to expand state_dir {:?}", self.state_dir))?;
        let path = PathBuf::from(expanded.as_ref());
        Ok(if path.is_absolute() {
            path
        } else {
            workspace.join(path)
        })
    }

    /// Embedding API key with environment references resolved.
    pub fn embeddings_api_key(&self) -> Option<String> {
        resolve_secret(self.embeddings.api_key.as_deref())
    }

    pub fn qdrant_api_key(&self) -> Option<String> {
        resolve_secret(self.vector_store.qdrant_api_key.as_deref())
    }
}

/// Expand `~` and `${VAR}` in a secret. Unset variables and blank values resolve to `None`.
fn resolve_secret(value: Option<&str>) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    shellexpand::full(value)
        .ok()
        .map(|v| v.into_owned())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.state_dir, ".ctxgraph");
        assert_eq!(config.embeddings.provider, EmbeddingProviderKind::Hashing);
        assert_eq!(config.retrieval.weights.code, 0.4);
    }

    #[test]
    fn test_default_toml_round_trips() {
        let text = Config::default_toml().unwrap();
        assert!(text.contains("[embeddings]"));
        assert_eq!(Config::from_toml(&text).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [chunking]
            window_size = 500

            [[categories]]
            name = "billing"
            keywords = ["invoice", "payment"]
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.window_size, 500);
        assert_eq!(config.chunking.window_overlap, 200);
        assert_eq!(config.categories[0].name, "billing");
        assert_eq!(config.indexer.concurrency, 4);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.embeddings.dimensions = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive {
                field: "embeddings.dimensions"
            })
        );

        let mut config = Config::default();
        config.chunking.window_overlap = 1000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OverlapTooLarge { .. })
        ));

        let mut config = Config::default();
        config.retrieval.strategy = "fuzzy".into();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownStrategy(_))));

        let mut config = Config::default();
        config.retrieval.weights.doc = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::NegativeWeight { .. })));
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let err = Config::from_toml("[embeddings]\nprovider = \"cohere\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("cohere"));
    }

    #[test]
    fn test_layer_precedence() {
        let dir = TempDir::new().unwrap();
        let user = dir.path().join("user.toml");
        std::fs::write(&user, "[indexer]\nconcurrency = 2\nsimilarity_threshold = 0.8\n").unwrap();
        std::fs::write(
            dir.path().join(WORKSPACE_CONFIG_FILE),
            "[indexer]\nconcurrency = 8\n",
        )
        .unwrap();
        let explicit = dir.path().join("explicit.toml");
        std::fs::write(&explicit, "[retrieval]\nmax_results = 3\n").unwrap();

        let config = Config::load_layers(Some(&user), dir.path(), Some(&explicit)).unwrap();
        assert_eq!(config.indexer.concurrency, 8);
        assert_eq!(config.indexer.similarity_threshold, 0.8);
        assert_eq!(config.retrieval.max_results, 3);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load_layers(None, dir.path(), Some(&missing)).is_err());
    }

    #[test]
    fn test_state_path_resolution() {
        let config = Config::default();
        let root = Path::new("/work/project");
        assert_eq!(
            config.state_path(root).unwrap(),
            PathBuf::from("/work/project/.ctxgraph")
        );

        let absolute = Config {
            state_dir: "/var/lib/ctxgraph".into(),
            ..Config::default()
        };
        assert_eq!(
            absolute.state_path(root).unwrap(),
            PathBuf::from("/var/lib/ctxgraph")
        );
    }

    #[test]
    fn test_resolve_secret() {
        assert_eq!(resolve_secret(None), None);
        assert_eq!(resolve_secret(Some("  ")), None);
        assert_eq!(resolve_secret(Some("sk-literal")), Some("sk-literal".into()));
        assert_eq!(
            resolve_secret(Some("${CTXGRAPH_TEST_SURELY_UNSET_VAR}")),
            None
        );
    }
}
