use serde::{Deserialize, Serialize};

/// Collection identifier. Stable across renames and reused names.
pub type CollectionId = uuid::Uuid;
/// Record identifier, as supplied by the client.
pub type RecordId = String;
/// Position in a collection's operation log. The first entry is 1.
pub type SeqNo = u64;

/// Lifecycle of a collection. Transitions only go forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionState {
    Active,
    SoftDeleted,
    Deleted,
}

impl CollectionState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            CollectionState::Active => 0,
            CollectionState::SoftDeleted => 1,
            CollectionState::Deleted => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CollectionState::Active,
            1 => CollectionState::SoftDeleted,
            _ => CollectionState::Deleted,
        }
    }
}

/// Snapshot of a collection's identity and lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    pub state: CollectionState,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Kind of mutation recorded in the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Add,
    Upsert,
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationKind::Add => "add",
            OperationKind::Upsert => "upsert",
            OperationKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for OperationKind {
    type Err = crate::error::OpdexError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(OperationKind::Add),
            "upsert" => Ok(OperationKind::Upsert),
            "delete" => Ok(OperationKind::Delete),
            other => Err(crate::error::OpdexError::InvalidMutation(format!(
                "unknown operation kind '{}'",
                other
            ))),
        }
    }
}

/// One record touched by a mutation. The payload is opaque to the log;
/// the indexer interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMutation {
    pub id: RecordId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RecordMutation {
    /// An add/upsert record carrying only an embedding.
    pub fn with_embedding(id: impl Into<RecordId>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            payload: serde_json::json!({ "embedding": embedding }),
        }
    }

    /// A record with no payload: used for deletes, and for adds that only
    /// register an id.
    pub fn id_only(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn delete(id: impl Into<RecordId>) -> Self {
        Self::id_only(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// A log entry the indexer could not apply after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingFailure {
    pub seq: SeqNo,
    pub record_id: RecordId,
    pub kind: OperationKind,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

/// Health signal for a collection's indexer. Failures surface here rather
/// than through status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionHealth {
    pub status: HealthStatus,
    /// Entries skipped as unrecoverable, oldest first.
    pub skipped: Vec<IndexingFailure>,
    /// Most recent transient error, cleared by the next successful batch.
    pub last_error: Option<String>,
}

impl Default for CollectionHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            skipped: Vec::new(),
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_kind_roundtrips_lowercase() {
        let json = serde_json::to_string(&OperationKind::Upsert).unwrap();
        assert_eq!(json, "\"upsert\"");
        assert_eq!("DELETE".parse::<OperationKind>().unwrap(), OperationKind::Delete);
        assert!("merge".parse::<OperationKind>().is_err());
    }

    #[test]
    fn state_u8_mapping_is_stable() {
        for state in [
            CollectionState::Active,
            CollectionState::SoftDeleted,
            CollectionState::Deleted,
        ] {
            assert_eq!(CollectionState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn record_mutation_helpers() {
        let add = RecordMutation::with_embedding("id1", vec![1.0, 2.0]);
        assert_eq!(add.payload["embedding"], serde_json::json!([1.0, 2.0]));
        let del = RecordMutation::delete("id1");
        assert!(del.payload.is_null());
    }
}
