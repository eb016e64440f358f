use crate::error::Result;
use crate::index::collection::CollectionHandle;
use crate::index::registry::CollectionRegistry;
use crate::types::CollectionId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How much of a collection's operation log has been indexed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexingStatus {
    pub num_indexed_ops: u64,
    pub num_unindexed_ops: u64,
    pub total_ops: u64,
    /// 1.0 when nothing is pending (including an empty log), otherwise
    /// `num_indexed_ops / total_ops`, strictly below 1.0.
    pub indexing_progress: f64,
}

impl IndexingStatus {
    pub fn from_counts(indexed: u64, total: u64) -> Self {
        let indexed = indexed.min(total);
        let indexing_progress = if total == 0 || indexed == total {
            1.0
        } else {
            // Large counts can round up to 1.0; keep "complete" exact.
            (indexed as f64 / total as f64).min(1.0 - f64::EPSILON)
        };
        Self {
            num_indexed_ops: indexed,
            num_unindexed_ops: total - indexed,
            total_ops: total,
            indexing_progress,
        }
    }

    pub fn is_caught_up(&self) -> bool {
        self.num_unindexed_ops == 0
    }

    /// Read live counters. The cursor is loaded before the log length so a
    /// concurrent append + index can never yield indexed > total.
    pub fn of(handle: &CollectionHandle) -> Self {
        let indexed = handle.cursor.get();
        let total = handle.oplog.len();
        Self::from_counts(indexed, total)
    }
}

/// Answers status queries against the registry. Nothing is cached: every
/// call reads the cursor and log length afresh.
pub struct StatusReporter {
    registry: Arc<CollectionRegistry>,
}

impl StatusReporter {
    pub fn new(registry: Arc<CollectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn get_status(&self, collection_id: &CollectionId) -> Result<IndexingStatus> {
        let handle = self.registry.resolve(collection_id)?;
        Ok(IndexingStatus::of(&handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationKind, RecordMutation};

    #[test]
    fn empty_log_is_fully_indexed() {
        let s = IndexingStatus::from_counts(0, 0);
        assert_eq!(s.total_ops, 0);
        assert_eq!(s.num_unindexed_ops, 0);
        assert_eq!(s.indexing_progress, 1.0);
        assert!(s.is_caught_up());
    }

    #[test]
    fn nothing_indexed_is_zero_progress() {
        let s = IndexingStatus::from_counts(0, 300);
        assert_eq!(s.num_indexed_ops, 0);
        assert_eq!(s.num_unindexed_ops, 300);
        assert_eq!(s.indexing_progress, 0.0);
    }

    #[test]
    fn partial_progress_is_a_fraction() {
        let s = IndexingStatus::from_counts(1, 4);
        assert_eq!(s.num_indexed_ops + s.num_unindexed_ops, s.total_ops);
        assert_eq!(s.indexing_progress, 0.25);
    }

    #[test]
    fn progress_below_one_until_complete() {
        let total = u64::MAX / 2;
        let s = IndexingStatus::from_counts(total - 1, total);
        assert!(s.indexing_progress < 1.0);
        assert_eq!(IndexingStatus::from_counts(total, total).indexing_progress, 1.0);
    }

    #[test]
    fn indexed_is_clamped_to_total() {
        let s = IndexingStatus::from_counts(10, 5);
        assert_eq!(s.num_indexed_ops, 5);
        assert_eq!(s.num_unindexed_ops, 0);
    }

    #[test]
    fn serializes_with_expected_field_names() {
        let v = serde_json::to_value(IndexingStatus::from_counts(0, 0)).unwrap();
        assert_eq!(v["num_indexed_ops"], 0);
        assert_eq!(v["num_unindexed_ops"], 0);
        assert_eq!(v["total_ops"], 0);
        assert!(v["indexing_progress"].is_f64());
    }

    #[test]
    fn reporter_reads_live_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(CollectionRegistry::new(tmp.path()));
        let handle = registry.create("docs").unwrap();
        let reporter = StatusReporter::new(Arc::clone(&registry));

        assert_eq!(reporter.get_status(&handle.id()).unwrap().total_ops, 0);

        handle
            .oplog
            .append_batch(
                OperationKind::Add,
                vec![
                    RecordMutation::with_embedding("a", vec![1.0]),
                    RecordMutation::with_embedding("b", vec![2.0]),
                ],
            )
            .unwrap();
        let s = reporter.get_status(&handle.id()).unwrap();
        assert_eq!((s.num_indexed_ops, s.total_ops), (0, 2));

        handle.cursor.advance_to(1).unwrap();
        let s = reporter.get_status(&handle.id()).unwrap();
        assert_eq!((s.num_indexed_ops, s.num_unindexed_ops), (1, 1));
        assert_eq!(s.indexing_progress, 0.5);
    }

    #[test]
    fn reporter_rejects_soft_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(CollectionRegistry::new(tmp.path()));
        let handle = registry.create("temp").unwrap();
        registry.soft_delete("temp").unwrap();

        let reporter = StatusReporter::new(registry);
        let err = reporter.get_status(&handle.id()).unwrap_err();
        assert!(err.to_string().to_lowercase().contains("soft deleted"));
    }
}
