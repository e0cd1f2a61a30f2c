//! Query enrichment pipeline.
//!
//! Turns a raw natural-language question into an enriched agent invocation
//! and normalizes the agent's output:
//!
//! 1. fetch the live schema,
//! 2. ensure a semantic-search index exists for it (cached → persisted
//!    snapshot → rebuild),
//! 3. embed the question,
//! 4. retrieve the top-K most similar schema items,
//! 5. append them to the question as context,
//! 6. invoke the agent and parse whatever comes back.
//!
//! Failures in steps 1-4 are reported to the caller; there is no fallback
//! to an unenriched query, schema context is mandatory. An agent-raised
//! parse failure in step 6 is NOT fatal: its message is routed through the
//! parser as degraded input, because agents regularly embed a usable answer
//! inside a malformed reply.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::sqlite::SqlitePool;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::agent::{AgentError, SqlAgent};
use crate::config::Config;
use crate::embedding::{self, EmbeddingError, EmbeddingProvider};
use crate::index::{schema_fingerprint, IndexError, SemanticSearchIndex};
use crate::models::{DatabaseSchema, SchemaItem, SearchResult, StructuredQueryResult};
use crate::parser;
use crate::schema;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

// ============ TTL index cache ============

struct CachedIndex {
    value: Arc<SemanticSearchIndex>,
    created_at: Instant,
}

/// Explicitly owned TTL cache for the built index: one slot, checked on
/// every access, rebuilt on expiry or invalidation.
pub struct IndexCache {
    ttl: Duration,
    slot: RwLock<Option<CachedIndex>>,
}

impl IndexCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> Option<Arc<SemanticSearchIndex>> {
        let slot = self.slot.read().await;
        slot.as_ref()
            .filter(|cached| cached.created_at.elapsed() < self.ttl)
            .map(|cached| cached.value.clone())
    }

    pub async fn put(&self, value: Arc<SemanticSearchIndex>) {
        let mut slot = self.slot.write().await;
        *slot = Some(CachedIndex {
            value,
            created_at: Instant::now(),
        });
    }

    pub async fn invalidate(&self) {
        let mut slot = self.slot.write().await;
        *slot = None;
    }
}

// ============ Snapshot write lock ============

/// Single-writer discipline for the snapshot directory: a `create_new` lock
/// file beside it, removed on drop. A second writer fails to acquire and
/// keeps its freshly built index in memory instead of racing the save.
struct SnapshotLock {
    path: PathBuf,
}

impl SnapshotLock {
    fn acquire(snapshot_dir: &Path) -> std::io::Result<Self> {
        let path = snapshot_dir.with_extension("lock");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self { path })
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ============ Pipeline ============

/// Service context for query handling: owns the database pool, the
/// embedding provider, the agent, and the index cache. Shared across
/// request handlers behind `Arc`.
pub struct QueryEnrichmentPipeline {
    config: Arc<Config>,
    pool: SqlitePool,
    provider: Arc<dyn EmbeddingProvider>,
    agent: Arc<dyn SqlAgent>,
    cache: IndexCache,
}

impl QueryEnrichmentPipeline {
    pub fn new(
        config: Arc<Config>,
        pool: SqlitePool,
        provider: Arc<dyn EmbeddingProvider>,
        agent: Arc<dyn SqlAgent>,
    ) -> Self {
        let cache = IndexCache::new(Duration::from_secs(config.index.ttl_secs));
        Self {
            config,
            pool,
            provider,
            agent,
            cache,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Drop the cached index so the next request re-checks the live schema.
    pub async fn invalidate(&self) {
        self.cache.invalidate().await;
    }

    /// Return a search-ready index for the current schema: the TTL-fresh
    /// cached one, the persisted snapshot when its fingerprint still
    /// matches the live schema, or a fresh build (persisted best-effort
    /// under the writer lock). A corrupt snapshot is logged and rebuilt,
    /// never fatal.
    pub async fn ensure_index(&self) -> Result<Arc<SemanticSearchIndex>, PipelineError> {
        if let Some(index) = self.cache.get().await {
            return Ok(index);
        }

        let live_schema = schema::get_schema(&self.pool)
            .await
            .map_err(|e| PipelineError::Upstream(e.to_string()))?;
        let fingerprint = schema_fingerprint(&live_schema);
        let dir = &self.config.index.dir;

        if dir.exists() {
            match SemanticSearchIndex::load(dir) {
                Ok(index)
                    if index.fingerprint() == Some(fingerprint.as_str())
                        && index.dimension() == self.provider.dims() =>
                {
                    let index = Arc::new(index);
                    self.cache.put(index.clone()).await;
                    return Ok(index);
                }
                Ok(_) => {
                    info!(path = %dir.display(), "index snapshot is stale, rebuilding");
                }
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "failed to load index snapshot, rebuilding");
                }
            }
        }

        let index = Arc::new(self.build_index(&live_schema, fingerprint).await?);
        self.cache.put(index.clone()).await;
        Ok(index)
    }

    async fn build_index(
        &self,
        live_schema: &DatabaseSchema,
        fingerprint: String,
    ) -> Result<SemanticSearchIndex, PipelineError> {
        let items = schema_items(live_schema);
        let texts: Vec<String> = items.iter().map(SchemaItem::describe).collect();
        let vectors = self.provider.embed(&texts).await?;

        let mut index = SemanticSearchIndex::new(self.provider.dims());
        for (item, vector) in items.into_iter().zip(vectors) {
            index.add_schema_item(item, vector)?;
        }
        index.set_fingerprint(fingerprint);
        info!(items = index.len(), "built semantic-search index");

        let dir = &self.config.index.dir;
        match SnapshotLock::acquire(dir) {
            Ok(_lock) => {
                if let Err(e) = index.save(dir) {
                    warn!(path = %dir.display(), error = %e, "failed to persist index snapshot");
                }
            }
            Err(_) => {
                warn!(path = %dir.display(), "snapshot writer lock held elsewhere, keeping index in memory");
            }
        }

        Ok(index)
    }

    /// Run one question through the full pipeline.
    pub async fn process(&self, query: &str) -> Result<StructuredQueryResult, PipelineError> {
        let index = self.ensure_index().await?;
        let query_vector = embedding::embed_query(self.provider.as_ref(), query).await?;
        let relevant_schema = index.search(&query_vector, self.config.retrieval.top_k)?;
        let enriched = enrich_query(query, &relevant_schema);

        match self.agent.invoke(&enriched).await {
            Ok(raw) => {
                let parsed = parser::parse_agent_output(&raw);
                Ok(StructuredQueryResult {
                    sql: parsed.sql,
                    result: parsed.result,
                    raw_output: raw,
                    error: None,
                    relevant_schema,
                })
            }
            Err(AgentError::OutputParse(message)) => {
                let parsed = parser::parse_agent_error(&message);
                Ok(StructuredQueryResult {
                    sql: parsed.sql,
                    result: parsed.result,
                    raw_output: message,
                    error: Some("agent output parsing error (handled)".to_string()),
                    relevant_schema,
                })
            }
            Err(err @ AgentError::Unavailable(_)) => Ok(StructuredQueryResult {
                sql: String::new(),
                result: String::new(),
                raw_output: String::new(),
                error: Some(err.to_string()),
                relevant_schema,
            }),
        }
    }

    /// Retrieval only: top-K schema items for a query.
    pub async fn semantic_search(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<SearchResult>, PipelineError> {
        let index = self.ensure_index().await?;
        let query_vector = embedding::embed_query(self.provider.as_ref(), query).await?;
        let k = top_k.unwrap_or(self.config.retrieval.top_k);
        Ok(index.search(&query_vector, k)?)
    }
}

/// Flatten the schema mapping into catalog items, tables in mapping order
/// and columns in declared order.
fn schema_items(live_schema: &DatabaseSchema) -> Vec<SchemaItem> {
    let mut items = Vec::new();
    for (table, info) in live_schema {
        for column in &info.columns {
            items.push(SchemaItem {
                table_name: table.clone(),
                column_name: column.clone(),
                data_type: info
                    .types
                    .get(column)
                    .cloned()
                    .unwrap_or_default(),
                is_view: info.is_view,
            });
        }
    }
    items
}

/// The original question followed by the retrieved `(table, column, type)`
/// triples, one per line.
pub fn enrich_query(query: &str, relevant: &[SearchResult]) -> String {
    let context: Vec<String> = relevant.iter().map(|r| r.item.describe()).collect();
    format!(
        "{query}\n\nRelevant schema information:\n{}",
        context.join("\n")
    )
}
