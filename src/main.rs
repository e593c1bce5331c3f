//! # ctxgraph CLI
//!
//! Indexes a workspace into a graph + vector store and answers hybrid queries.
//!
//! - `ctxgraph index [--path DIR]` - run an incremental indexing pass
//! - `ctxgraph query <TEXT>` - rank chunks for a query
//! - `ctxgraph check` - run the integrity check without indexing
//! - `ctxgraph stats` - print graph statistics
//! - `ctxgraph config --print-default` - print the default configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctxgraph_config::{Config, EmbeddingProviderKind, VectorBackend};
use ctxgraph_index::{
    CategoryRule, CategoryRules, EmbeddingProvider, HashingEmbeddings, HybridRetriever,
    IndexError, Indexer, IndexerConfig, IntegrityReport, LocalVectorStore, OpenAiEmbeddings,
    QdrantConfig, QdrantVectorStore, RetrievalOptions, RetryPolicy, Scanner, SourceWeights,
    Strategy, StrategyMix, VectorStore, WindowConfig, Workspace,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ctxgraph")]
#[command(about = "Incremental graph and vector index with hybrid retrieval")]
#[command(version)]
struct Cli {
    /// Workspace root
    #[arg(short, long, global = true, default_value = ".")]
    path: PathBuf,

    /// Extra config file, applied over user and workspace config
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index new, changed and removed files
    Index,

    /// Query the index
    Query {
        /// Query text
        text: String,

        /// hybrid, semantic, keyword or graph
        #[arg(short, long)]
        strategy: Option<String>,

        #[arg(short = 'n', long)]
        max_results: Option<usize>,

        #[arg(long)]
        min_score: Option<f32>,

        /// Only return chunks in this category
        #[arg(long)]
        category: Option<String>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check graph and vector store consistency
    Check,

    /// Show graph statistics
    Stats {
        /// Number of most-referenced nodes to list
        #[arg(long, default_value = "10")]
        top: usize,
    },

    /// Configuration helpers
    Config {
        /// Print the built-in defaults as TOML
        #[arg(long)]
        print_default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Config { print_default } = &cli.command {
        if *print_default {
            print!("{}", Config::default_toml()?);
        } else {
            let config = Config::load(&cli.path, cli.config.as_deref())?;
            print!(
                "{}",
                toml_preview(&config).context("Failed to render configuration")?
            );
        }
        return Ok(());
    }

    let root = cli
        .path
        .canonicalize()
        .with_context(|| format!("Workspace not found: {}", cli.path.display()))?;
    let config = Config::load(&root, cli.config.as_deref())?;
    let workspace = Arc::new(open_workspace(&config, &root).await?);
    let embeddings = build_embeddings(&config);

    let outcome = match cli.command {
        Commands::Index => run_index(&config, &root, workspace.clone(), embeddings).await,
        Commands::Query {
            text,
            strategy,
            max_results,
            min_score,
            category,
            json,
        } => {
            let mut options = retrieval_options(&config)?;
            if let Some(strategy) = strategy {
                options.strategy = strategy.parse::<Strategy>()?;
            }
            if let Some(n) = max_results {
                options.max_results = n;
            }
            if let Some(score) = min_score {
                options.min_score = score;
            }
            if let Some(category) = category {
                options = options.with_category(category);
            }
            run_query(workspace.clone(), embeddings, &text, &options, json).await
        }
        Commands::Check => {
            let graph = workspace.graph().await;
            let report = IntegrityReport::check(&graph, workspace.vectors().as_ref()).await?;
            report.log();
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_consistent() {
                anyhow::bail!("Integrity check found problems");
            }
            Ok(())
        }
        Commands::Stats { top } => {
            let stats = workspace.graph().await.stats(top);
            println!("{}", serde_json::to_string_pretty(&stats)?);
            println!("vectors: {}", workspace.vectors().len().await?);
            let manifest = workspace.manifest().await;
            println!(
                "manifest: {} files, {} chunks",
                manifest.files.len(),
                manifest.total_chunks()
            );
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    };

    match Arc::try_unwrap(workspace) {
        Ok(workspace) => workspace.close().await?,
        Err(shared) => shared.flush().await?,
    }
    outcome
}

fn toml_preview(config: &Config) -> Result<String> {
    let mut shown = config.clone();
    if shown.embeddings.api_key.is_some() {
        shown.embeddings.api_key = Some("<redacted>".into());
    }
    if shown.vector_store.qdrant_api_key.is_some() {
        shown.vector_store.qdrant_api_key = Some("<redacted>".into());
    }
    Ok(toml::to_string_pretty(&shown)?)
}

async fn open_workspace(config: &Config, root: &Path) -> Result<Workspace> {
    let state_dir = config.state_path(root)?;
    let dimensions = config.embeddings.dimensions;

    let vectors: Arc<dyn VectorStore> = match config.vector_store.backend {
        VectorBackend::Local => Arc::new(
            LocalVectorStore::open(&state_dir, dimensions)
                .context("Failed to open local vector store")?,
        ),
        VectorBackend::Qdrant => {
            let qdrant = QdrantConfig {
                url: config.vector_store.qdrant_url.clone(),
                api_key: config.qdrant_api_key(),
                collection_name: config.vector_store.collection_name.clone(),
                dimensions,
            };
            Arc::new(
                QdrantVectorStore::connect(&qdrant)
                    .await
                    .context("Failed to connect to Qdrant")?,
            )
        }
    };

    Workspace::open(&state_dir, vectors)
        .with_context(|| format!("Failed to open index state at {}", state_dir.display()))
}

fn build_embeddings(config: &Config) -> Arc<dyn EmbeddingProvider> {
    let settings = &config.embeddings;
    match settings.provider {
        EmbeddingProviderKind::Hashing => Arc::new(HashingEmbeddings::new(settings.dimensions)),
        EmbeddingProviderKind::OpenAi => {
            let mut provider = OpenAiEmbeddings::new(
                config.embeddings_api_key(),
                settings.model.clone(),
                settings.dimensions,
            )
            .with_batch_size(settings.batch_size);
            if let Some(url) = &settings.base_url {
                provider = provider.with_base_url(url.clone());
            }
            Arc::new(provider)
        }
    }
}

fn indexer_config(config: &Config) -> IndexerConfig {
    let categories = if config.categories.is_empty() {
        CategoryRules::default()
    } else {
        CategoryRules::new(
            config
                .categories
                .iter()
                .map(|c| CategoryRule {
                    name: c.name.clone(),
                    keywords: c.keywords.clone(),
                })
                .collect(),
        )
    };

    IndexerConfig {
        window: WindowConfig::new(config.chunking.window_size, config.chunking.window_overlap),
        concurrency: config.indexer.concurrency,
        batch_size: config.embeddings.batch_size,
        retry: RetryPolicy {
            max_attempts: config.embeddings.max_retries.max(1),
            base_delay: Duration::from_millis(500),
        },
        similarity_threshold: config.indexer.similarity_threshold,
        categories,
        ..IndexerConfig::default()
    }
}

fn retrieval_options(config: &Config) -> Result<RetrievalOptions> {
    let r = &config.retrieval;
    Ok(RetrievalOptions::new()
        .with_strategy(r.strategy.parse()?)
        .with_max_results(r.max_results)
        .with_min_score(r.min_score)
        .with_graph_depth(r.graph_depth)
        .with_weights(SourceWeights::new(
            r.weights.code,
            r.weights.doc,
            r.weights.prevention,
            r.weights.history,
        ))
        .with_mix(StrategyMix {
            semantic: r.mix.semantic,
            keyword: r.mix.keyword,
            graph: r.mix.graph,
        }))
}

async fn run_index(
    config: &Config,
    root: &Path,
    workspace: Arc<Workspace>,
    embeddings: Arc<dyn EmbeddingProvider>,
) -> Result<()> {
    let scanner = Scanner::new(root)
        .with_extensions(config.indexer.extensions.clone())
        .with_max_file_size(config.indexer.max_file_size);
    let files = tokio::task::spawn_blocking(move || scanner.scan())
        .await
        .context("File scan panicked")?;
    info!("Scanned {} files under {}", files.len(), root.display());

    let indexer = Indexer::new(workspace, embeddings, indexer_config(config))?;
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current file");
                cancel.cancel();
            }
        })
    };

    let result = indexer.reindex(files, &cancel).await;
    interrupt.abort();

    match result {
        Ok(report) => {
            println!(
                "Indexed {} files ({} removed, {} unchanged) in {} ms",
                report.files_indexed,
                report.files_removed,
                report.files_unchanged,
                report.duration_ms
            );
            for error in &report.errors {
                println!("  skipped {}: {}", error.source, error.message);
            }
            if report.pending_embeddings > 0 {
                println!("  {} chunks waiting for embeddings", report.pending_embeddings);
            }
            Ok(())
        }
        Err(IndexError::Cancelled) => anyhow::bail!("Indexing cancelled; committed files were kept"),
        Err(e) => Err(e).context("Indexing pass failed"),
    }
}

async fn run_query(
    workspace: Arc<Workspace>,
    embeddings: Arc<dyn EmbeddingProvider>,
    text: &str,
    options: &RetrievalOptions,
    json: bool,
) -> Result<()> {
    let retriever = HybridRetriever::new(workspace, embeddings);
    let results = retriever.retrieve(text, options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No results");
        return Ok(());
    }
    for (rank, r) in results.iter().enumerate() {
        let location = match (&r.path, &r.span) {
            (Some(path), Some(span)) => format!("{}:{}", path, span),
            (Some(path), None) => path.clone(),
            _ => r.source_node_id.clone(),
        };
        println!(
            "{:>2}. {:.3}  {}  {} [{}]",
            rank + 1,
            r.score,
            location,
            r.title,
            r.category
        );
    }
    Ok(())
}
