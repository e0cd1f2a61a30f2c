//! Schema semantic-search index.
//!
//! [`VectorIndex`] stores fixed-dimension embedding vectors and answers
//! exact k-nearest-neighbor queries by L2 distance. Brute force is the
//! right trade for a small, mostly-static schema corpus where correctness
//! beats scale.
//!
//! [`SemanticSearchIndex`] binds a [`SchemaItem`] catalog 1:1 to the vector
//! store (position `i` in one is position `i` in the other) and persists
//! both as a snapshot directory:
//!
//! | File | Contents |
//! |------|----------|
//! | `schema.index` | the vector structure (bincode) |
//! | `schema_data.json` | ordered schema items + parallel raw vectors |
//!
//! The raw vectors are duplicated in the JSON half on purpose: the catalog
//! artifact fully reconstructs the index without depending on the binary
//! artifact's encoding.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::models::{DatabaseSchema, SchemaItem, SearchResult};

const SNAPSHOT_INDEX_FILE: &str = "schema.index";
const SNAPSHOT_DATA_FILE: &str = "schema_data.json";

/// Errors raised by index operations. `DimensionMismatch` is fatal to the
/// single operation, never to the index; `CorruptIndex` surfaces an
/// internally inconsistent snapshot so callers can rebuild from the live
/// schema.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("corrupt index snapshot: {0}")]
    CorruptIndex(String),

    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding failed: {0}")]
    Encode(String),

    #[error("snapshot decoding failed: {0}")]
    Decode(String),
}

// ============ VectorIndex ============

/// Flat store of `N` vectors of fixed dimension `D` with exact
/// nearest-neighbor search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndex {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Append a vector. No deduplication; O(1) amortized.
    pub fn add(&mut self, vector: Vec<f32>) -> Result<(), IndexError> {
        self.check_dimension(&vector)?;
        self.vectors.push(vector);
        Ok(())
    }

    /// Return up to `k` `(position, distance)` pairs, ascending by exact L2
    /// distance, ties broken by insertion order. Fewer than `k` stored
    /// vectors is not an error; every stored vector is returned.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>, IndexError> {
        self.check_dimension(query)?;

        let mut hits: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, l2_distance(query, v)))
            .collect();

        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// Exact Euclidean distance. Callers guarantee equal lengths.
fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

// ============ SemanticSearchIndex ============

/// Serialized form of the catalog half of a snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotData {
    schema_items: Vec<SchemaItem>,
    vectors: Vec<Vec<f32>>,
    dimension: usize,
    #[serde(default)]
    fingerprint: Option<String>,
    #[serde(default)]
    built_at: Option<DateTime<Utc>>,
}

/// A [`SchemaItem`] catalog paired 1:1 with a [`VectorIndex`], persistable
/// as one unit.
///
/// The pairing invariant (`items.len() == vectors.len()` at all times) is
/// maintained by appending to both sequences inside a single
/// [`add_schema_item`](Self::add_schema_item) call, after validation.
#[derive(Debug, Clone)]
pub struct SemanticSearchIndex {
    items: Vec<SchemaItem>,
    vectors: VectorIndex,
    fingerprint: Option<String>,
    built_at: Option<DateTime<Utc>>,
}

impl SemanticSearchIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            items: Vec::new(),
            vectors: VectorIndex::new(dimension),
            fingerprint: None,
            built_at: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[SchemaItem] {
        &self.items
    }

    /// Fingerprint of the schema this index was built from, if recorded.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    /// Record the schema fingerprint and stamp the build time.
    pub fn set_fingerprint(&mut self, fingerprint: String) {
        self.fingerprint = Some(fingerprint);
        self.built_at = Some(Utc::now());
    }

    /// Append a schema item and its vector atomically. The dimension is
    /// validated before either sequence is touched, so a failed add leaves
    /// the index exactly as it was.
    pub fn add_schema_item(
        &mut self,
        item: SchemaItem,
        vector: Vec<f32>,
    ) -> Result<(), IndexError> {
        self.vectors.add(vector)?;
        self.items.push(item);
        Ok(())
    }

    /// Top-`k` schema items nearest to `query`, scored `1 / (1 + distance)`.
    ///
    /// Positions beyond the catalog length (possible only if the two halves
    /// ever desynced) are skipped rather than panicking.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, IndexError> {
        let hits = self.vectors.search(query, k)?;
        Ok(hits
            .into_iter()
            .filter_map(|(position, distance)| {
                self.items.get(position).map(|item| SearchResult {
                    item: item.clone(),
                    similarity_score: 1.0 / (1.0 + f64::from(distance)),
                })
            })
            .collect())
    }

    // ============ Persistence ============

    /// Write the snapshot to `dir`: both artifacts go into a temporary
    /// sibling directory which is renamed into place, so a concurrent
    /// loader never observes a half-written snapshot.
    pub fn save(&self, dir: &Path) -> Result<(), IndexError> {
        let index_bytes =
            bincode::serialize(&self.vectors).map_err(|e| IndexError::Encode(e.to_string()))?;

        let data = SnapshotData {
            schema_items: self.items.clone(),
            vectors: self.vectors.vectors.clone(),
            dimension: self.vectors.dimension,
            fingerprint: self.fingerprint.clone(),
            built_at: self.built_at,
        };
        let data_json =
            serde_json::to_string(&data).map_err(|e| IndexError::Encode(e.to_string()))?;

        if let Some(parent) = dir.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = dir.with_extension("tmp");
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)?;
        }
        std::fs::create_dir_all(&tmp)?;
        std::fs::write(tmp.join(SNAPSHOT_INDEX_FILE), index_bytes)?;
        std::fs::write(tmp.join(SNAPSHOT_DATA_FILE), data_json)?;

        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::rename(&tmp, dir)?;

        debug!(path = %dir.display(), items = self.items.len(), "saved index snapshot");
        Ok(())
    }

    /// Reconstruct an index from a snapshot directory. The result's
    /// `search` behavior is indistinguishable from the index that was
    /// saved.
    ///
    /// Fails with [`IndexError::CorruptIndex`] when the two artifacts
    /// disagree on length or dimension.
    pub fn load(dir: &Path) -> Result<Self, IndexError> {
        let index_bytes = std::fs::read(dir.join(SNAPSHOT_INDEX_FILE))?;
        let vectors: VectorIndex =
            bincode::deserialize(&index_bytes).map_err(|e| IndexError::Decode(e.to_string()))?;

        let data_json = std::fs::read_to_string(dir.join(SNAPSHOT_DATA_FILE))?;
        let data: SnapshotData =
            serde_json::from_str(&data_json).map_err(|e| IndexError::Decode(e.to_string()))?;

        if data.schema_items.len() != vectors.len() {
            return Err(IndexError::CorruptIndex(format!(
                "{} schema items but {} indexed vectors",
                data.schema_items.len(),
                vectors.len()
            )));
        }
        if data.vectors.len() != data.schema_items.len() {
            return Err(IndexError::CorruptIndex(format!(
                "{} schema items but {} raw vectors",
                data.schema_items.len(),
                data.vectors.len()
            )));
        }
        if data.dimension != vectors.dimension {
            return Err(IndexError::CorruptIndex(format!(
                "catalog dimension {} but vector structure dimension {}",
                data.dimension, vectors.dimension
            )));
        }

        debug!(path = %dir.display(), items = data.schema_items.len(), "loaded index snapshot");
        Ok(Self {
            items: data.schema_items,
            vectors,
            fingerprint: data.fingerprint,
            built_at: data.built_at,
        })
    }
}

// ============ Schema fingerprint ============

/// SHA-256 over the canonical `(table, column, type, is_view)` sequence of
/// a schema snapshot, hex-encoded. `DatabaseSchema` is a `BTreeMap`, so the
/// sequence and therefore the fingerprint is deterministic.
pub fn schema_fingerprint(schema: &DatabaseSchema) -> String {
    let mut hasher = Sha256::new();
    for (table, info) in schema {
        for column in &info.columns {
            let data_type = info.types.get(column).map(String::as_str).unwrap_or("");
            hasher.update(table.as_bytes());
            hasher.update([0]);
            hasher.update(column.as_bytes());
            hasher.update([0]);
            hasher.update(data_type.as_bytes());
            hasher.update([0]);
            hasher.update([u8::from(info.is_view)]);
            hasher.update([b'\n']);
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::models::TableInfo;

    fn item(table: &str, column: &str) -> SchemaItem {
        SchemaItem {
            table_name: table.to_string(),
            column_name: column.to_string(),
            data_type: "INTEGER".to_string(),
            is_view: false,
        }
    }

    fn unit_vec(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_exact_vector_is_first_with_score_one() {
        let mut index = SemanticSearchIndex::new(4);
        index.add_schema_item(item("STUDENT", "STUDENT_ID"), unit_vec(4, 0)).unwrap();
        index.add_schema_item(item("STUDENT", "NAME"), unit_vec(4, 1)).unwrap();
        index.add_schema_item(item("COURSE", "COURSE_ID"), unit_vec(4, 2)).unwrap();

        let results = index.search(&unit_vec(4, 1), 3).unwrap();
        assert_eq!(results[0].item.column_name, "NAME");
        assert_eq!(results[0].similarity_score, 1.0);
        assert!(results[1].similarity_score < 1.0);
    }

    #[test]
    fn test_length_invariant_holds_after_adds() {
        let mut index = SemanticSearchIndex::new(3);
        for i in 0..7 {
            index.add_schema_item(item("T", &format!("C{i}")), unit_vec(3, i % 3)).unwrap();
            assert_eq!(index.len(), index.vectors.len());
        }
        assert_eq!(index.len(), 7);
    }

    #[test]
    fn test_k_larger_than_store_returns_all() {
        let mut index = SemanticSearchIndex::new(2);
        index.add_schema_item(item("T", "A"), vec![1.0, 0.0]).unwrap();
        index.add_schema_item(item("T", "B"), vec![0.0, 1.0]).unwrap();

        let results = index.search(&[1.0, 0.0], 50).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_search_empty_index_returns_nothing() {
        let index = SemanticSearchIndex::new(2);
        assert!(index.search(&[0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_mismatch_leaves_index_unchanged() {
        let mut index = SemanticSearchIndex::new(3);
        index.add_schema_item(item("T", "A"), unit_vec(3, 0)).unwrap();

        let err = index.add_schema_item(item("T", "B"), vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch { expected: 3, actual: 2 }
        ));
        assert_eq!(index.len(), 1);
        assert_eq!(index.vectors.len(), 1);

        let err = index.search(&[1.0], 5).unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let mut index = VectorIndex::new(2);
        index.add(vec![1.0, 0.0]).unwrap();
        index.add(vec![1.0, 0.0]).unwrap();
        index.add(vec![0.0, 1.0]).unwrap();

        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        assert_eq!(hits[0].0, 0);
        assert_eq!(hits[1].0, 1);
        assert_eq!(hits[2].0, 2);
    }

    #[test]
    fn test_results_ascending_by_distance() {
        let mut index = VectorIndex::new(1);
        index.add(vec![5.0]).unwrap();
        index.add(vec![1.0]).unwrap();
        index.add(vec![3.0]).unwrap();

        let hits = index.search(&[0.0], 3).unwrap();
        let distances: Vec<f32> = hits.iter().map(|h| h.1).collect();
        assert_eq!(distances, vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_save_load_round_trip_preserves_search() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("schema_index");

        let mut index = SemanticSearchIndex::new(4);
        index.add_schema_item(item("STUDENT", "STUDENT_ID"), unit_vec(4, 0)).unwrap();
        index.add_schema_item(item("STUDENT", "NAME"), unit_vec(4, 1)).unwrap();
        index.add_schema_item(item("COURSE", "NAME"), unit_vec(4, 2)).unwrap();
        index.set_fingerprint("abc123".to_string());
        index.save(&snapshot).unwrap();

        let loaded = SemanticSearchIndex::load(&snapshot).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.fingerprint(), Some("abc123"));
        assert!(loaded.built_at().is_some());

        let query = unit_vec(4, 1);
        for k in 1..=3 {
            let before = index.search(&query, k).unwrap();
            let after = loaded.search(&query, k).unwrap();
            assert_eq!(before.len(), after.len());
            for (a, b) in before.iter().zip(after.iter()) {
                assert_eq!(a.item, b.item);
                assert_eq!(a.similarity_score, b.similarity_score);
            }
        }
    }

    #[test]
    fn test_save_overwrites_existing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("schema_index");

        let mut first = SemanticSearchIndex::new(2);
        first.add_schema_item(item("T", "A"), vec![1.0, 0.0]).unwrap();
        first.save(&snapshot).unwrap();

        let mut second = SemanticSearchIndex::new(2);
        second.add_schema_item(item("T", "A"), vec![1.0, 0.0]).unwrap();
        second.add_schema_item(item("T", "B"), vec![0.0, 1.0]).unwrap();
        second.save(&snapshot).unwrap();

        assert_eq!(SemanticSearchIndex::load(&snapshot).unwrap().len(), 2);
    }

    #[test]
    fn test_mismatched_halves_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("schema_index");

        let mut index = SemanticSearchIndex::new(2);
        index.add_schema_item(item("T", "A"), vec![1.0, 0.0]).unwrap();
        index.add_schema_item(item("T", "B"), vec![0.0, 1.0]).unwrap();
        index.save(&snapshot).unwrap();

        // Drop one item from the catalog half only.
        let data_path = snapshot.join("schema_data.json");
        let mut data: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&data_path).unwrap()).unwrap();
        data["schema_items"].as_array_mut().unwrap().pop();
        data["vectors"].as_array_mut().unwrap().pop();
        std::fs::write(&data_path, serde_json::to_string(&data).unwrap()).unwrap();

        let err = SemanticSearchIndex::load(&snapshot).unwrap_err();
        assert!(matches!(err, IndexError::CorruptIndex(_)), "got {err:?}");
    }

    #[test]
    fn test_load_missing_snapshot_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SemanticSearchIndex::load(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, IndexError::Io(_)));
    }

    #[test]
    fn test_fingerprint_changes_with_schema() {
        let table = |cols: &[(&str, &str)]| TableInfo {
            columns: cols.iter().map(|(c, _)| c.to_string()).collect(),
            types: cols
                .iter()
                .map(|(c, t)| (c.to_string(), t.to_string()))
                .collect(),
            is_view: false,
            foreign_keys: None,
        };

        let mut a: DatabaseSchema = BTreeMap::new();
        a.insert("STUDENT".to_string(), table(&[("ID", "INTEGER")]));

        let mut b = a.clone();
        b.insert("COURSE".to_string(), table(&[("ID", "INTEGER")]));

        let mut c: DatabaseSchema = BTreeMap::new();
        c.insert("STUDENT".to_string(), table(&[("ID", "TEXT")]));

        assert_eq!(schema_fingerprint(&a), schema_fingerprint(&a.clone()));
        assert_ne!(schema_fingerprint(&a), schema_fingerprint(&b));
        assert_ne!(schema_fingerprint(&a), schema_fingerprint(&c));
    }
}
