//! Per-collection state: the log, the index built from it, and the
//! counters that describe how far indexing has got.

use crate::error::{OpdexError, Result};
use crate::index::cursor::IndexCursor;
use crate::index::oplog::OpLog;
use crate::index::record_index::{PreparedOp, RecordIndex};
use crate::index::utils::write_atomic;
use crate::index::version::VersionCounter;
use crate::types::{
    Collection, CollectionHealth, CollectionId, CollectionState, HealthStatus, IndexingFailure,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;

pub(crate) const META_FILE: &str = "meta.json";
pub(crate) const DELETED_MARKER: &str = "deleted";
const OPLOG_DIR: &str = "oplog";

/// What `meta.json` holds. Lifecycle state is not stored here; a
/// `deleted` marker file next to it means the collection was soft deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CollectionMeta {
    pub id: CollectionId,
    pub name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl CollectionMeta {
    pub fn load(dir: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(dir.join(META_FILE))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        write_atomic(&dir.join(META_FILE), &serde_json::to_vec_pretty(self)?)
    }
}

pub struct CollectionHandle {
    meta: CollectionMeta,
    state: AtomicU8,
    pub(crate) dir: PathBuf,
    pub(crate) oplog: Arc<OpLog>,
    pub(crate) cursor: IndexCursor,
    pub(crate) version: VersionCounter,
    /// std lock: held only for short, non-async sections. The indexer takes
    /// it with `try_write` so readers never stall a batch indefinitely.
    pub(crate) index: RwLock<RecordIndex>,
    health: Mutex<CollectionHealth>,
    /// Signalled on every append and on lifecycle changes.
    pub(crate) wake: Notify,
}

impl std::fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("id", &self.meta.id)
            .field("name", &self.meta.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CollectionHandle {
    /// Create the on-disk layout for a brand new collection.
    pub(crate) fn create(base_path: &Path, name: &str) -> Result<Self> {
        let meta = CollectionMeta {
            id: uuid::Uuid::new_v4(),
            name: name.to_string(),
            created_at: chrono::Utc::now(),
        };
        let dir = base_path.join(meta.id.to_string());
        std::fs::create_dir_all(&dir)?;
        meta.save(&dir)?;
        Self::open_with_meta(dir, meta, CollectionState::Active)
    }

    /// Reopen an existing collection directory.
    pub(crate) fn open(dir: &Path) -> Result<Self> {
        let meta = CollectionMeta::load(dir)?;
        let state = if dir.join(DELETED_MARKER).exists() {
            CollectionState::SoftDeleted
        } else {
            CollectionState::Active
        };
        Self::open_with_meta(dir.to_path_buf(), meta, state)
    }

    fn open_with_meta(dir: PathBuf, meta: CollectionMeta, state: CollectionState) -> Result<Self> {
        let oplog = Arc::new(OpLog::open(&dir.join(OPLOG_DIR), meta.id)?);
        let cursor = IndexCursor::open(&dir, meta.id)?;
        let version = VersionCounter::open(&dir)?;

        if cursor.get() > oplog.current_seq() {
            return Err(OpdexError::CorruptLog(format!(
                "collection {}: committed_seq {} is past the end of the log ({})",
                meta.name,
                cursor.get(),
                oplog.current_seq()
            )));
        }

        let handle = Self {
            meta,
            state: AtomicU8::new(state.as_u8()),
            dir,
            oplog,
            cursor,
            version,
            index: RwLock::new(RecordIndex::new()),
            health: Mutex::new(CollectionHealth::default()),
            wake: Notify::new(),
        };
        if state == CollectionState::Active {
            handle.rebuild_index();
        }
        Ok(handle)
    }

    /// Replay every entry up to the cursor into a fresh index. The version
    /// is not touched: these entries were already counted when first indexed.
    fn rebuild_index(&self) {
        let committed = self.cursor.get();
        if committed == 0 {
            return;
        }
        let mut index = RecordIndex::new();
        let mut skipped = 0usize;
        for entry in self.oplog.read_from(1).take(committed as usize) {
            let op = match PreparedOp::decode(&entry) {
                Ok(op) => op,
                Err(reason) => {
                    self.note_recovered_skip(&entry, reason);
                    skipped += 1;
                    continue;
                }
            };
            if let Err((_, reason)) = index.validate(std::slice::from_ref(&op)) {
                self.note_recovered_skip(&entry, reason);
                skipped += 1;
                continue;
            }
            index.apply(op);
        }
        tracing::info!(
            "[RECOVERY {}] rebuilt index from {} committed ops ({} records, {} skipped)",
            self.meta.name,
            committed,
            index.len(),
            skipped
        );
        if let Ok(mut guard) = self.index.write() {
            *guard = index;
        }
    }

    fn note_recovered_skip(&self, entry: &crate::index::oplog::OpLogEntry, reason: String) {
        tracing::warn!(
            "[RECOVERY {}] seq {} ({} '{}') was skipped when first indexed: {}",
            self.meta.name,
            entry.seq,
            entry.kind,
            entry.record_id,
            reason
        );
        self.record_skip(IndexingFailure {
            seq: entry.seq,
            record_id: entry.record_id.clone(),
            kind: entry.kind,
            reason,
            attempts: 0,
            failed_at: chrono::Utc::now(),
        });
    }

    pub fn id(&self) -> CollectionId {
        self.meta.id
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn state(&self) -> CollectionState {
        CollectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == CollectionState::Active
    }

    pub fn snapshot(&self) -> Collection {
        Collection {
            id: self.meta.id,
            name: self.meta.name.clone(),
            state: self.state(),
            created_at: self.meta.created_at,
        }
    }

    /// Active -> SoftDeleted. Returns false if the collection was not Active.
    pub(crate) fn mark_soft_deleted(&self) -> bool {
        let moved = self
            .state
            .compare_exchange(
                CollectionState::Active.as_u8(),
                CollectionState::SoftDeleted.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if moved {
            // Wake the indexer so it notices and exits.
            self.wake.notify_one();
        }
        moved
    }

    pub(crate) fn mark_deleted(&self) {
        self.state
            .store(CollectionState::Deleted.as_u8(), Ordering::Release);
    }

    pub fn health(&self) -> CollectionHealth {
        match self.health.lock() {
            Ok(h) => h.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn record_skip(&self, failure: IndexingFailure) {
        let mut health = match self.health.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        health.skipped.push(failure);
        health.status = HealthStatus::Degraded;
    }

    pub(crate) fn record_transient(&self, error: String) {
        let mut health = match self.health.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        health.last_error = Some(error);
        health.status = HealthStatus::Degraded;
    }

    /// Called after a committed batch: transient trouble is over. Skipped
    /// entries keep the collection Degraded.
    pub(crate) fn clear_transient(&self) {
        let mut health = match self.health.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        health.last_error = None;
        if health.skipped.is_empty() {
            health.status = HealthStatus::Healthy;
        }
    }
}
