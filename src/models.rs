//! Core data types shared across the index, pipeline, and HTTP surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One indexed schema element: a `(table, column, declared type)` triple
/// from the live database schema.
///
/// Items are identified by their position in the catalog; the position must
/// stay aligned with the parallel vector sequence in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaItem {
    pub table_name: String,
    pub column_name: String,
    /// Raw textual type as reported by the database (e.g. `VARCHAR(50)`).
    pub data_type: String,
    #[serde(default)]
    pub is_view: bool,
}

impl SchemaItem {
    /// Human-readable rendering used both as embedding input and as a line
    /// of enrichment context, so retrieval and prompting share one
    /// vocabulary.
    pub fn describe(&self) -> String {
        format!(
            "Table: {}, Column: {}, Type: {}",
            self.table_name, self.column_name, self.data_type
        )
    }
}

/// A schema item with its query-time similarity score. Produced by
/// [`search`](crate::index::SemanticSearchIndex::search), never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub item: SchemaItem,
    /// `1 / (1 + distance)` — monotonically decreasing in L2 distance,
    /// exactly `1.0` at distance zero.
    pub similarity_score: f64,
}

/// Structured outcome of one natural-language query through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredQueryResult {
    /// Best-effort extracted SQL statement; empty when none was found.
    pub sql: String,
    /// Best-effort final answer text.
    pub result: String,
    /// The raw agent output (or the agent error message, on the degraded
    /// path) that extraction ran against.
    pub raw_output: String,
    pub error: Option<String>,
    pub relevant_schema: Vec<SearchResult>,
}

/// Column-level description of one table or view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Column names in declared order.
    pub columns: Vec<String>,
    /// Declared type per column.
    pub types: BTreeMap<String, String>,
    pub is_view: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreign_keys: Option<Vec<ForeignKey>>,
}

/// One foreign-key constraint, grouped across its columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub constrained_columns: Vec<String>,
    pub referred_table: String,
    pub referred_columns: Vec<String>,
}

/// Live schema snapshot keyed by table/view name. `BTreeMap` keeps the wire
/// shape and the fingerprint deterministic.
pub type DatabaseSchema = BTreeMap<String, TableInfo>;
