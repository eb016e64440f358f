//! In-memory searchable view of a collection, built by the indexer from the
//! operation log. Only state that has passed through the indexer is here.

use crate::index::oplog::OpLogEntry;
use crate::types::{OperationKind, RecordId, SeqNo};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A record as it exists in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRecord {
    pub id: RecordId,
    pub embedding: Option<Vec<f32>>,
    pub document: Option<String>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    /// Log entry that last wrote this record.
    pub seq: SeqNo,
}

/// A decoded log entry, ready to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedOp {
    Insert { record: IndexedRecord, replace: bool },
    Remove { id: RecordId, seq: SeqNo },
}

impl PreparedOp {
    /// Decode an entry's opaque payload. Errors describe why the entry can
    /// never be applied.
    pub fn decode(entry: &OpLogEntry) -> Result<Self, String> {
        if entry.record_id.is_empty() {
            return Err("empty record id".to_string());
        }
        if entry.kind == OperationKind::Delete {
            return Ok(PreparedOp::Remove {
                id: entry.record_id.clone(),
                seq: entry.seq,
            });
        }

        let obj = match &entry.payload {
            serde_json::Value::Null => serde_json::Map::new(),
            serde_json::Value::Object(obj) => obj.clone(),
            other => return Err(format!("payload must be an object, got {}", json_kind(other))),
        };

        let embedding = match obj.get("embedding") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Array(values)) => {
                let mut vec = Vec::with_capacity(values.len());
                for (i, v) in values.iter().enumerate() {
                    let f = v
                        .as_f64()
                        .filter(|f| f.is_finite())
                        .ok_or_else(|| format!("embedding[{}] is not a finite number", i))?;
                    vec.push(f as f32);
                }
                if vec.is_empty() {
                    return Err("embedding is empty".to_string());
                }
                Some(vec)
            }
            Some(other) => {
                return Err(format!("embedding must be an array, got {}", json_kind(other)))
            }
        };

        let document = match obj.get("document") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(format!("document must be a string, got {}", json_kind(other)))
            }
        };

        let metadata = match obj.get("metadata") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Object(m)) => Some(m.clone()),
            Some(other) => {
                return Err(format!("metadata must be an object, got {}", json_kind(other)))
            }
        };

        Ok(PreparedOp::Insert {
            record: IndexedRecord {
                id: entry.record_id.clone(),
                embedding,
                document,
                metadata,
                seq: entry.seq,
            },
            replace: entry.kind == OperationKind::Upsert,
        })
    }

    fn embedding_len(&self) -> Option<usize> {
        match self {
            PreparedOp::Insert { record, .. } => record.embedding.as_ref().map(|e| e.len()),
            PreparedOp::Remove { .. } => None,
        }
    }
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Records keyed by id, in first-insert order. The embedding dimension is
/// fixed by the first embedding the collection ever indexes.
#[derive(Debug, Default)]
pub struct RecordIndex {
    records: IndexMap<RecordId, IndexedRecord>,
    dimensions: Option<usize>,
}

impl RecordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    pub fn get(&self, id: &str) -> Option<&IndexedRecord> {
        self.records.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.records.keys()
    }

    /// Check a batch against the current dimension without mutating.
    /// Returns the position and reason of the first op that cannot apply.
    pub fn validate(&self, ops: &[PreparedOp]) -> Result<(), (usize, String)> {
        let mut dims = self.dimensions;
        for (pos, op) in ops.iter().enumerate() {
            if let Some(len) = op.embedding_len() {
                match dims {
                    Some(expected) if expected != len => {
                        return Err((
                            pos,
                            format!("dimension mismatch: expected {}, got {}", expected, len),
                        ));
                    }
                    Some(_) => {}
                    None => dims = Some(len),
                }
            }
        }
        Ok(())
    }

    /// Apply one validated op.
    pub fn apply(&mut self, op: PreparedOp) {
        match op {
            PreparedOp::Insert { record, replace } => {
                if let Some(len) = record.embedding.as_ref().map(|e| e.len()) {
                    self.dimensions.get_or_insert(len);
                }
                if !replace && self.records.contains_key(&record.id) {
                    tracing::debug!("add of existing record '{}' ignored", record.id);
                    return;
                }
                self.records.insert(record.id.clone(), record);
            }
            PreparedOp::Remove { id, .. } => {
                self.records.shift_remove(&id);
            }
        }
    }
}
