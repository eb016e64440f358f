use crate::config::ServiceConfig;
use crate::error::{OpdexError, Result};
use crate::index::collection::CollectionHandle;
use crate::index::indexer::spawn_indexer;
use crate::index::record_index::IndexedRecord;
use crate::index::registry::CollectionRegistry;
use crate::index::status::{IndexingStatus, StatusReporter};
use crate::index::utils::remove_dir_all_with_retry;
use crate::types::{
    Collection, CollectionHealth, CollectionId, OperationKind, RecordMutation, SeqNo,
};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const MAX_RECORDS_PER_MUTATION: usize = 100_000;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Collection service: the entry point for mutations and status queries.
///
/// `CollectionService` owns the [`CollectionRegistry`], one background
/// indexer task per active collection, and the cleanup tasks that finish
/// collection deletes. It is `Send + Sync` and designed to be shared behind
/// the `Arc` that [`CollectionService::open`] returns.
///
/// Must be opened from inside a tokio runtime: indexers are spawned
/// immediately.
///
/// # Examples
///
/// ```rust,no_run
/// use opdex::{CollectionService, RecordMutation, ServiceConfig};
///
/// # async fn run() -> opdex::Result<()> {
/// let service = CollectionService::open(ServiceConfig::load("./data"))?;
/// let collection = service.create_collection("docs")?;
/// let records = vec![RecordMutation::with_embedding("id1", vec![1.0, 2.0])];
/// service.add_records(&collection.id, records)?;
/// let status = service.get_indexing_status(&collection.id)?;
/// assert_eq!(status.total_ops, 1);
/// # Ok(())
/// # }
/// ```
pub struct CollectionService {
    config: ServiceConfig,
    registry: Arc<CollectionRegistry>,
    reporter: StatusReporter,
    indexer_handles: Arc<DashMap<CollectionId, JoinHandle<Result<()>>>>,
    cleanup_handles: DashMap<CollectionId, JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl CollectionService {
    /// Load every collection under `config.data_dir`, start an indexer for
    /// each active one, and resume cleanup of any that were soft deleted
    /// before the last shutdown.
    pub fn open(config: ServiceConfig) -> Result<Arc<Self>> {
        let registry = Arc::new(CollectionRegistry::load(&config.data_dir)?);
        let (shutdown_tx, _) = watch::channel(false);
        let service = Arc::new(Self {
            reporter: StatusReporter::new(Arc::clone(&registry)),
            registry,
            indexer_handles: Arc::new(DashMap::new()),
            cleanup_handles: DashMap::new(),
            shutdown_tx,
            config,
        });

        for handle in service.registry.handles() {
            if handle.is_active() {
                service.start_indexer(&handle);
            } else {
                tracing::info!(
                    "[RECOVERY {}] resuming cleanup of soft-deleted collection",
                    handle.name()
                );
                service.schedule_cleanup(handle);
            }
        }
        Ok(service)
    }

    fn start_indexer(&self, handle: &Arc<CollectionHandle>) {
        let task = spawn_indexer(
            Arc::clone(handle),
            self.config.indexer.clone(),
            self.shutdown_tx.subscribe(),
        );
        self.indexer_handles.insert(handle.id(), task);
    }

    pub fn create_collection(&self, name: &str) -> Result<Collection> {
        let handle = self.registry.create(name)?;
        self.start_indexer(&handle);
        Ok(handle.snapshot())
    }

    pub fn get_collection(&self, name: &str) -> Result<Collection> {
        Ok(self.registry.resolve_name(name)?.snapshot())
    }

    pub fn list_collections(&self) -> Vec<Collection> {
        self.registry.list()
    }

    /// Soft delete now; the data is removed in the background once the
    /// collection's indexer has stopped.
    pub fn delete_collection(&self, name: &str) -> Result<()> {
        let handle = self.registry.soft_delete(name)?;
        self.schedule_cleanup(handle);
        Ok(())
    }

    fn schedule_cleanup(&self, handle: Arc<CollectionHandle>) {
        let registry = Arc::clone(&self.registry);
        let indexers = Arc::clone(&self.indexer_handles);
        let id = handle.id();
        let task = tokio::spawn(async move {
            if let Some((_, indexer)) = indexers.remove(&id) {
                match indexer.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!("[IDX {}] exited with error: {}", handle.name(), e)
                    }
                    Err(e) => tracing::error!("[IDX {}] task failed: {}", handle.name(), e),
                }
            }
            let dir = handle.dir.clone();
            let removed =
                tokio::task::spawn_blocking(move || remove_dir_all_with_retry(&dir)).await;
            match removed {
                Ok(Ok(())) => registry.finish_delete(&id),
                Ok(Err(e)) => tracing::error!(
                    "[REGISTRY] failed to remove data for '{}': {}",
                    handle.name(),
                    e
                ),
                Err(e) => tracing::error!("[REGISTRY] cleanup task failed: {}", e),
            }
        });
        self.cleanup_handles.insert(id, task);
    }

    /// Append one log entry per record. Returns the last sequence number
    /// assigned; `total_ops` already includes the new entries when this
    /// returns.
    pub fn append_mutation(
        &self,
        collection_id: &CollectionId,
        kind: OperationKind,
        records: Vec<RecordMutation>,
    ) -> Result<SeqNo> {
        let handle = self.registry.resolve(collection_id)?;
        validate_records(&records)?;
        let receipt = handle.oplog.append_batch(kind, records)?;
        handle.wake.notify_one();
        Ok(receipt.last_seq)
    }

    pub fn add_records(
        &self,
        collection_id: &CollectionId,
        records: Vec<RecordMutation>,
    ) -> Result<SeqNo> {
        self.append_mutation(collection_id, OperationKind::Add, records)
    }

    pub fn upsert_records(
        &self,
        collection_id: &CollectionId,
        records: Vec<RecordMutation>,
    ) -> Result<SeqNo> {
        self.append_mutation(collection_id, OperationKind::Upsert, records)
    }

    pub fn delete_records(&self, collection_id: &CollectionId, ids: Vec<String>) -> Result<SeqNo> {
        let records = ids.into_iter().map(RecordMutation::delete).collect();
        self.append_mutation(collection_id, OperationKind::Delete, records)
    }

    pub fn get_indexing_status(&self, collection_id: &CollectionId) -> Result<IndexingStatus> {
        self.reporter.get_status(collection_id)
    }

    pub fn get_version(&self, collection_id: &CollectionId) -> Result<u64> {
        Ok(self.registry.resolve(collection_id)?.version.get())
    }

    pub fn get_collection_health(&self, collection_id: &CollectionId) -> Result<CollectionHealth> {
        Ok(self.registry.resolve(collection_id)?.health())
    }

    /// Look up a record in the indexed view. Records whose log entries are
    /// still pending are not visible here yet.
    pub fn get_record(
        &self,
        collection_id: &CollectionId,
        record_id: &str,
    ) -> Result<Option<IndexedRecord>> {
        let handle = self.registry.resolve(collection_id)?;
        let index = match handle.index.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(index.get(record_id).cloned())
    }

    /// Number of records currently in the indexed view.
    pub fn indexed_record_count(&self, collection_id: &CollectionId) -> Result<usize> {
        let handle = self.registry.resolve(collection_id)?;
        let index = match handle.index.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(index.len())
    }

    /// Poll until the collection version exceeds `initial`.
    pub async fn wait_for_version_increase(
        &self,
        collection_id: &CollectionId,
        initial: u64,
        timeout: Duration,
    ) -> Result<u64> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let version = self.get_version(collection_id)?;
            if version > initial {
                return Ok(version);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OpdexError::Timeout(format!(
                    "version of {} still {} after {:?}",
                    collection_id, version, timeout
                )));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Poll until every logged op is indexed.
    pub async fn wait_for_indexing(
        &self,
        collection_id: &CollectionId,
        timeout: Duration,
    ) -> Result<IndexingStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.get_indexing_status(collection_id)?;
            if status.is_caught_up() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OpdexError::Timeout(format!(
                    "{} of {} ops of {} still unindexed after {:?}",
                    status.num_unindexed_ops, status.total_ops, collection_id, timeout
                )));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Stop all indexers after a final drain, and let pending cleanups finish.
    pub async fn graceful_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let ids: Vec<CollectionId> = self.indexer_handles.iter().map(|r| *r.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.indexer_handles.remove(&id) {
                match handle.await {
                    Ok(Ok(())) => tracing::info!("[shutdown] indexer for {} drained", id),
                    Ok(Err(e)) => {
                        tracing::error!("[shutdown] indexer for {} exited with error: {}", id, e)
                    }
                    Err(e) => tracing::error!("[shutdown] indexer task for {} failed: {}", id, e),
                }
            }
        }

        let ids: Vec<CollectionId> = self.cleanup_handles.iter().map(|r| *r.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.cleanup_handles.remove(&id) {
                if let Err(e) = handle.await {
                    tracing::error!("[shutdown] cleanup for {} failed: {}", id, e);
                }
            }
        }
    }
}

fn validate_records(records: &[RecordMutation]) -> Result<()> {
    if records.is_empty() {
        return Err(OpdexError::InvalidMutation(
            "mutation must name at least one record".to_string(),
        ));
    }
    if records.len() > MAX_RECORDS_PER_MUTATION {
        return Err(OpdexError::InvalidMutation(format!(
            "{} records exceeds the limit of {} per mutation",
            records.len(),
            MAX_RECORDS_PER_MUTATION
        )));
    }
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if record.id.is_empty() {
            return Err(OpdexError::InvalidMutation("record id must not be empty".to_string()));
        }
        if !seen.insert(record.id.as_str()) {
            return Err(OpdexError::InvalidMutation(format!(
                "duplicate record id '{}' in one mutation",
                record.id
            )));
        }
    }
    Ok(())
}

impl Drop for CollectionService {
    /// Abort background tasks when the service is dropped without
    /// `graceful_shutdown()`. Dropping a tokio JoinHandle only detaches.
    fn drop(&mut self) {
        for entry in self.indexer_handles.iter() {
            entry.value().abort();
        }
        for entry in self.cleanup_handles.iter() {
            entry.value().abort();
        }
    }
}
