//! Background indexer: one task per collection, draining the operation log
//! into the collection's [`RecordIndex`] in batches.
//!
//! Each committed batch advances the cursor to its last entry and bumps the
//! collection version once. A batch that fails is retried with backoff; the
//! cursor never moves past an entry that was not applied, except for an
//! entry that stays malformed through every retry, which is recorded in the
//! collection health and skipped.
//!
//! Progress is persisted before anything is published or applied: the
//! version file first, then `committed_seq`. A failed write leaves the index
//! and both counters untouched, and the batch is retried. A crash between
//! the two writes replays the batch on restart with one extra version bump.

use crate::config::IndexerConfig;
use crate::error::Result;
use crate::index::collection::CollectionHandle;
use crate::index::oplog::OpLogEntry;
use crate::index::record_index::{PreparedOp, RecordIndex};
use crate::types::{IndexingFailure, SeqNo};
use std::sync::{Arc, RwLockWriteGuard, TryLockError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Why a batch attempt did not commit.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApplyError {
    #[error("index is busy")]
    Contended,

    #[error("seq {seq}: {reason}")]
    Malformed { seq: SeqNo, reason: String },

    #[error("failed to persist progress: {0}")]
    Persist(String),

    #[error("collection is no longer active")]
    Cancelled,
}

/// Result of one drain pass.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Nothing past the cursor.
    Idle,
    Committed {
        entries: usize,
        last_seq: SeqNo,
        version: u64,
    },
    /// Retries exhausted on a transient error; cursor unchanged.
    Stalled,
    /// The collection left Active; the batch was dropped.
    Cancelled,
}

pub(crate) fn spawn_indexer(
    handle: Arc<CollectionHandle>,
    config: IndexerConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<()>> {
    tracing::info!(
        "[IDX {}] starting, cursor={} total={} version={}",
        handle.name(),
        handle.cursor.get(),
        handle.oplog.len(),
        handle.version.get()
    );
    tokio::spawn(async move { process_log(handle, config, shutdown).await })
}

async fn process_log(
    handle: Arc<CollectionHandle>,
    config: IndexerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if !handle.is_active() {
            tracing::info!("[IDX {}] collection no longer active, stopping", handle.name());
            return Ok(());
        }
        if *shutdown.borrow() {
            flush_on_shutdown(&handle, &config).await;
            return Ok(());
        }

        match drain_once(&handle, &config).await {
            BatchOutcome::Committed { .. } if handle.cursor.get() < handle.oplog.len() => {
                // More work queued behind this batch; don't wait.
                tokio::task::yield_now().await;
                continue;
            }
            BatchOutcome::Cancelled => continue,
            _ => {}
        }

        tracing::trace!(
            "[IDX {}] idle, cursor={} total={}",
            handle.name(),
            handle.cursor.get(),
            handle.oplog.len()
        );
        tokio::select! {
            _ = handle.wake.notified() => {}
            _ = tokio::time::sleep(config.poll_interval()) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Sender gone: the service was dropped without a shutdown.
                    return Ok(());
                }
            }
        }
    }
}

async fn flush_on_shutdown(handle: &CollectionHandle, config: &IndexerConfig) {
    let pending = handle.oplog.len() - handle.cursor.get();
    tracing::info!("[IDX {}] shutdown, flushing {} pending", handle.name(), pending);
    loop {
        match drain_once(handle, config).await {
            BatchOutcome::Committed { .. } => continue,
            BatchOutcome::Stalled => {
                tracing::warn!(
                    "[IDX {}] shutdown with {} ops still unindexed",
                    handle.name(),
                    handle.oplog.len() - handle.cursor.get()
                );
                return;
            }
            BatchOutcome::Idle | BatchOutcome::Cancelled => return,
        }
    }
}

/// Read one batch past the cursor and try to commit it, retrying up to
/// `max_retries` times. Failures end up in the collection health, never in
/// the return value.
pub(crate) async fn drain_once(handle: &CollectionHandle, config: &IndexerConfig) -> BatchOutcome {
    let cursor = handle.cursor.get();
    let entries: Vec<Arc<OpLogEntry>> = handle
        .oplog
        .read_from(cursor + 1)
        .take(config.batch_size)
        .collect();
    if entries.is_empty() {
        return BatchOutcome::Idle;
    }

    tracing::debug!(
        "[IDX {}] batch of {} entries, seq {}..={}",
        handle.name(),
        entries.len(),
        entries[0].seq,
        entries[entries.len() - 1].seq
    );

    let mut attempt = 1u32;
    loop {
        let final_attempt = attempt >= config.max_retries;
        match apply_batch(handle, &entries, attempt, final_attempt) {
            Ok(outcome) => return outcome,
            Err(ApplyError::Cancelled) => {
                tracing::info!("[IDX {}] batch dropped, collection deleted", handle.name());
                return BatchOutcome::Cancelled;
            }
            Err(e) if !final_attempt => {
                tracing::warn!(
                    "[IDX {}] attempt {}/{} failed: {}",
                    handle.name(),
                    attempt,
                    config.max_retries,
                    e
                );
                tokio::time::sleep(config.backoff(attempt)).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    "[IDX {}] batch at seq {} failed after {} attempts: {}",
                    handle.name(),
                    entries[0].seq,
                    attempt,
                    e
                );
                handle.record_transient(format!(
                    "batch at seq {} failed after {} attempts: {}",
                    entries[0].seq, attempt, e
                ));
                return BatchOutcome::Stalled;
            }
        }
    }
}

/// Decode, validate, persist and apply `entries` under the index write lock.
///
/// On the final attempt a malformed entry is skipped: the entries before it
/// are applied, it is recorded as a failure, and the committed seq includes
/// it.
fn apply_batch(
    handle: &CollectionHandle,
    entries: &[Arc<OpLogEntry>],
    attempt: u32,
    final_attempt: bool,
) -> std::result::Result<BatchOutcome, ApplyError> {
    let mut ops = Vec::with_capacity(entries.len());
    let mut bad: Option<(usize, String)> = None;
    for (pos, entry) in entries.iter().enumerate() {
        match PreparedOp::decode(entry) {
            Ok(op) => ops.push(op),
            Err(reason) => {
                bad = Some((pos, reason));
                break;
            }
        }
    }

    let mut index = lock_index(handle)?;
    if let Err((pos, reason)) = index.validate(&ops) {
        ops.truncate(pos);
        bad = Some((pos, reason));
    }

    let mut skipped = None;
    let last_seq = match bad {
        Some((pos, reason)) => {
            let entry = &entries[pos];
            if !final_attempt {
                return Err(ApplyError::Malformed {
                    seq: entry.seq,
                    reason,
                });
            }
            skipped = Some(IndexingFailure {
                seq: entry.seq,
                record_id: entry.record_id.clone(),
                kind: entry.kind,
                reason,
                attempts: attempt,
                failed_at: chrono::Utc::now(),
            });
            entry.seq
        }
        None => entries[entries.len() - 1].seq,
    };

    if !handle.is_active() {
        return Err(ApplyError::Cancelled);
    }
    let version = persist_progress(handle, last_seq)?;

    for op in ops {
        index.apply(op);
    }
    // Cursor before version: a caller that sees the version move also sees
    // the cursor that caused it.
    handle.cursor.publish(last_seq);
    handle.version.publish(version);
    drop(index);

    if let Some(failure) = skipped {
        tracing::error!(
            "[IDX {}] skipping seq {} ({} '{}') after {} attempts: {}",
            handle.name(),
            failure.seq,
            failure.kind,
            failure.record_id,
            failure.attempts,
            failure.reason
        );
        handle.record_skip(failure);
    }
    handle.clear_transient();

    let applied = entries.iter().take_while(|e| e.seq <= last_seq).count();
    tracing::debug!(
        "[IDX {}] committed {} entries, cursor={} version={}",
        handle.name(),
        applied,
        last_seq,
        version
    );
    Ok(BatchOutcome::Committed {
        entries: applied,
        last_seq,
        version,
    })
}

fn lock_index(
    handle: &CollectionHandle,
) -> std::result::Result<RwLockWriteGuard<'_, RecordIndex>, ApplyError> {
    match handle.index.try_write() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::WouldBlock) => Err(ApplyError::Contended),
        Err(TryLockError::Poisoned(poisoned)) => {
            tracing::warn!("[IDX {}] index lock poisoned, continuing", handle.name());
            Ok(poisoned.into_inner())
        }
    }
}

/// Write the next version, then the cursor. Nothing is published here.
fn persist_progress(
    handle: &CollectionHandle,
    last_seq: SeqNo,
) -> std::result::Result<u64, ApplyError> {
    let version = handle
        .version
        .persist_next()
        .map_err(|e| ApplyError::Persist(e.to_string()))?;
    handle
        .cursor
        .persist(last_seq)
        .map_err(|e| ApplyError::Persist(e.to_string()))?;
    Ok(version)
}
