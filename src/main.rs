//! # SmartSQL CLI
//!
//! The `smartsql` binary serves the HTTP API and provides one-shot access
//! to the pipeline for scripting and debugging.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `smartsql serve` | Start the JSON HTTP API server |
//! | `smartsql query "<question>"` | Run one question through the pipeline |
//! | `smartsql search "<query>"` | Semantic search over the schema index |
//! | `smartsql index build` | Build and persist the index snapshot |
//! | `smartsql index info` | Show the persisted snapshot's metadata |
//! | `smartsql schema` | Print the live schema mapping as JSON |
//!
//! All commands accept `--config` pointing to a TOML configuration file;
//! see `smartsql.example.toml`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use smartsql::agent::ChatCompletionsAgent;
use smartsql::config::{self, Config};
use smartsql::db;
use smartsql::embedding;
use smartsql::index::SemanticSearchIndex;
use smartsql::pipeline::QueryEnrichmentPipeline;
use smartsql::schema;
use smartsql::server;

/// SmartSQL: chat with a relational database in natural language.
#[derive(Parser)]
#[command(
    name = "smartsql",
    about = "Natural-language-to-SQL assistant with schema-aware semantic retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./smartsql.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the JSON HTTP API server.
    Serve,

    /// Run one natural-language question through the full pipeline and
    /// print the structured result.
    Query {
        /// The question to ask.
        question: String,
    },

    /// Semantic search: print the schema items most similar to a query.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results (defaults to retrieval.top_k).
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Manage the persisted semantic-search index snapshot.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Print the live database schema mapping as JSON.
    Schema,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Build the index from the live schema and persist the snapshot.
    Build {
        /// Discard any existing snapshot first, even if it is still fresh.
        #[arg(long)]
        force: bool,
    },

    /// Show item count, dimension, fingerprint, and build time of the
    /// persisted snapshot.
    Info,
}

/// Wire the full service context: database pool, embedding provider, and
/// agent client.
async fn build_pipeline(config: &Arc<Config>) -> anyhow::Result<Arc<QueryEnrichmentPipeline>> {
    let pool = db::connect(config).await?;
    let provider: Arc<dyn embedding::EmbeddingProvider> =
        Arc::from(embedding::create_provider(&config.embedding)?);
    let agent = Arc::new(ChatCompletionsAgent::new(&config.agent, pool.clone())?);

    Ok(Arc::new(QueryEnrichmentPipeline::new(
        config.clone(),
        pool,
        provider,
        agent,
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Arc::new(config::load_config(&cli.config)?);

    match cli.command {
        Commands::Serve => {
            let pipeline = build_pipeline(&cfg).await?;
            server::run_server(cfg, pipeline).await?;
        }
        Commands::Query { question } => {
            let pipeline = build_pipeline(&cfg).await?;
            let result = pipeline.process(&question).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Search { query, top_k } => {
            let pipeline = build_pipeline(&cfg).await?;
            let results = pipeline.semantic_search(&query, top_k).await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (i, result) in results.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {}",
                    i + 1,
                    result.similarity_score,
                    result.item.describe()
                );
            }
        }
        Commands::Index { action } => match action {
            IndexAction::Build { force } => {
                if force && cfg.index.dir.exists() {
                    std::fs::remove_dir_all(&cfg.index.dir)?;
                }
                let pipeline = build_pipeline(&cfg).await?;
                let index = pipeline.ensure_index().await?;
                println!(
                    "Indexed {} schema items ({} dimensions) at {}",
                    index.len(),
                    index.dimension(),
                    cfg.index.dir.display()
                );
            }
            IndexAction::Info => {
                let index = SemanticSearchIndex::load(&cfg.index.dir)?;
                println!("path:        {}", cfg.index.dir.display());
                println!("items:       {}", index.len());
                println!("dimension:   {}", index.dimension());
                println!(
                    "fingerprint: {}",
                    index.fingerprint().unwrap_or("(none)")
                );
                println!(
                    "built at:    {}",
                    index
                        .built_at()
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "(unknown)".to_string())
                );
            }
        },
        Commands::Schema => {
            let pool = db::connect(&cfg).await?;
            let live_schema = schema::get_schema(&pool).await?;
            println!("{}", serde_json::to_string_pretty(&live_schema)?);
        }
    }

    Ok(())
}
