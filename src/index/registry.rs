use crate::error::{OpdexError, Result};
use crate::index::collection::{CollectionHandle, DELETED_MARKER, META_FILE};
use crate::types::{Collection, CollectionId, CollectionState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MAX_NAME_LEN: usize = 512;

/// Tracks which collections exist and what lifecycle state they are in.
///
/// Active collections are reachable by id and by name. Soft-deleted ones
/// stay reachable by id (so queries can say "soft deleted") until cleanup
/// finishes, after which only a tombstone remains.
pub struct CollectionRegistry {
    base_path: PathBuf,
    by_id: DashMap<CollectionId, Arc<CollectionHandle>>,
    /// Active collections only; a soft delete frees the name immediately.
    by_name: DashMap<String, CollectionId>,
    tombstones: DashMap<CollectionId, String>,
}

impl CollectionRegistry {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            by_id: DashMap::new(),
            by_name: DashMap::new(),
            tombstones: DashMap::new(),
        }
    }

    /// Load every collection directory under `base_path`. Directories that
    /// cannot be opened are logged and left alone.
    pub fn load<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let registry = Self::new(base_path);
        std::fs::create_dir_all(&registry.base_path)?;

        for entry in std::fs::read_dir(&registry.base_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            if !dir.join(META_FILE).exists() {
                continue;
            }
            let handle = match CollectionHandle::open(&dir) {
                Ok(h) => Arc::new(h),
                Err(e) => {
                    tracing::error!("[REGISTRY] failed to open {}: {}", dir.display(), e);
                    continue;
                }
            };
            if handle.is_active() {
                if let Some(existing) = registry.by_name.get(handle.name()) {
                    tracing::error!(
                        "[REGISTRY] duplicate active name '{}' ({} and {}), skipping {}",
                        handle.name(),
                        *existing,
                        handle.id(),
                        handle.id()
                    );
                    continue;
                }
                registry
                    .by_name
                    .insert(handle.name().to_string(), handle.id());
            }
            registry.by_id.insert(handle.id(), handle);
        }

        tracing::info!(
            "[REGISTRY] loaded {} collections ({} active)",
            registry.by_id.len(),
            registry.by_name.len()
        );
        Ok(registry)
    }

    /// Create a new Active collection. Fails if an Active collection
    /// already uses `name`.
    pub fn create(&self, name: &str) -> Result<Arc<CollectionHandle>> {
        validate_name(name)?;
        match self.by_name.entry(name.to_string()) {
            Entry::Occupied(_) => Err(OpdexError::CollectionAlreadyExists(name.to_string())),
            Entry::Vacant(slot) => {
                let handle = Arc::new(CollectionHandle::create(&self.base_path, name)?);
                self.by_id.insert(handle.id(), Arc::clone(&handle));
                slot.insert(handle.id());
                tracing::info!("[REGISTRY] created collection '{}' ({})", name, handle.id());
                Ok(handle)
            }
        }
    }

    /// Resolve an id to an Active collection. The error names which
    /// not-found case applies.
    pub fn resolve(&self, id: &CollectionId) -> Result<Arc<CollectionHandle>> {
        if let Some(handle) = self.by_id.get(id) {
            return match handle.state() {
                CollectionState::Active => Ok(Arc::clone(&handle)),
                CollectionState::SoftDeleted => {
                    Err(OpdexError::CollectionSoftDeleted(handle.name().to_string()))
                }
                CollectionState::Deleted => {
                    Err(OpdexError::CollectionDeleted(handle.name().to_string()))
                }
            };
        }
        if let Some(name) = self.tombstones.get(id) {
            return Err(OpdexError::CollectionDeleted(name.clone()));
        }
        Err(OpdexError::CollectionNotFound(id.to_string()))
    }

    pub fn resolve_name(&self, name: &str) -> Result<Arc<CollectionHandle>> {
        let id = self
            .by_name
            .get(name)
            .map(|r| *r)
            .ok_or_else(|| OpdexError::CollectionNotFound(name.to_string()))?;
        self.resolve(&id)
    }

    /// Active collections, sorted by name.
    pub fn list(&self) -> Vec<Collection> {
        let mut out: Vec<Collection> = self
            .by_id
            .iter()
            .filter(|h| h.is_active())
            .map(|h| h.snapshot())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Every handle, whatever its state. Used at startup to spawn indexers
    /// and resume cleanups.
    pub(crate) fn handles(&self) -> Vec<Arc<CollectionHandle>> {
        self.by_id.iter().map(|h| Arc::clone(h.value())).collect()
    }

    /// Active -> SoftDeleted. Synchronous: once this returns, appends and
    /// status queries for the collection fail. The `deleted` marker is
    /// written first; if that fails the collection stays Active.
    pub fn soft_delete(&self, name: &str) -> Result<Arc<CollectionHandle>> {
        let (_, id) = self
            .by_name
            .remove(name)
            .ok_or_else(|| OpdexError::CollectionNotFound(name.to_string()))?;
        let handle = self
            .by_id
            .get(&id)
            .map(|h| Arc::clone(&h))
            .ok_or_else(|| OpdexError::CollectionNotFound(name.to_string()))?;

        if let Err(e) = std::fs::write(handle.dir.join(DELETED_MARKER), b"") {
            tracing::error!("[REGISTRY] failed to persist delete marker for '{}': {}", name, e);
            self.by_name.entry(name.to_string()).or_insert(id);
            return Err(e.into());
        }
        if !handle.mark_soft_deleted() {
            return Err(OpdexError::CollectionSoftDeleted(name.to_string()));
        }
        tracing::info!("[REGISTRY] soft deleted collection '{}' ({})", name, id);
        Ok(handle)
    }

    /// SoftDeleted -> Deleted: drop the handle and leave a tombstone.
    pub(crate) fn finish_delete(&self, id: &CollectionId) {
        if let Some((_, handle)) = self.by_id.remove(id) {
            handle.mark_deleted();
            self.tombstones.insert(*id, handle.name().to_string());
            tracing::info!("[REGISTRY] collection '{}' ({}) deleted", handle.name(), id);
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(OpdexError::InvalidMutation(
            "collection name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(OpdexError::InvalidMutation(format!(
            "collection name longer than {} bytes",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_and_resolve() {
        let tmp = TempDir::new().unwrap();
        let registry = CollectionRegistry::new(tmp.path());
        let handle = registry.create("docs").unwrap();

        assert_eq!(registry.resolve(&handle.id()).unwrap().name(), "docs");
        assert_eq!(registry.resolve_name("docs").unwrap().id(), handle.id());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn duplicate_active_name_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let registry = CollectionRegistry::new(tmp.path());
        registry.create("docs").unwrap();
        let err = registry.create("docs").unwrap_err();
        assert!(matches!(err, OpdexError::CollectionAlreadyExists(ref n) if n == "docs"));
    }

    #[test]
    fn empty_name_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let registry = CollectionRegistry::new(tmp.path());
        assert!(matches!(
            registry.create("  "),
            Err(OpdexError::InvalidMutation(_))
        ));
    }

    #[test]
    fn unknown_id_does_not_exist() {
        let tmp = TempDir::new().unwrap();
        let registry = CollectionRegistry::new(tmp.path());
        let err = registry.resolve(&uuid::Uuid::new_v4()).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn soft_delete_then_finish_delete() {
        let tmp = TempDir::new().unwrap();
        let registry = CollectionRegistry::new(tmp.path());
        let handle = registry.create("temp").unwrap();
        let id = handle.id();

        registry.soft_delete("temp").unwrap();
        let err = registry.resolve(&id).unwrap_err();
        assert!(matches!(err, OpdexError::CollectionSoftDeleted(_)));
        assert!(err.to_string().contains("soft deleted"));
        assert!(registry.resolve_name("temp").is_err());
        assert!(registry.list().is_empty());
        assert!(handle.dir.join(DELETED_MARKER).exists());

        registry.finish_delete(&id);
        let err = registry.resolve(&id).unwrap_err();
        assert!(matches!(err, OpdexError::CollectionDeleted(_)));
        assert!(err.to_string().contains("not found"));
        assert_eq!(handle.state(), CollectionState::Deleted);
    }

    #[test]
    fn name_is_reusable_after_soft_delete() {
        let tmp = TempDir::new().unwrap();
        let registry = CollectionRegistry::new(tmp.path());
        let old = registry.create("temp").unwrap();
        registry.soft_delete("temp").unwrap();

        let new = registry.create("temp").unwrap();
        assert_ne!(old.id(), new.id());
        assert!(registry.resolve(&old.id()).is_err());
        assert!(registry.resolve(&new.id()).is_ok());
    }

    #[test]
    fn failed_marker_write_keeps_collection_active() {
        let tmp = TempDir::new().unwrap();
        let registry = CollectionRegistry::new(tmp.path());
        let handle = registry.create("docs").unwrap();
        let marker = handle.dir.join(DELETED_MARKER);
        std::fs::create_dir(&marker).unwrap();

        let err = registry.soft_delete("docs").unwrap_err();
        assert!(matches!(err, OpdexError::Io(_)));
        assert_eq!(handle.state(), CollectionState::Active);
        assert!(registry.resolve(&handle.id()).is_ok());
        assert_eq!(registry.resolve_name("docs").unwrap().id(), handle.id());
        assert_eq!(registry.list().len(), 1);

        std::fs::remove_dir(&marker).unwrap();
        registry.soft_delete("docs").unwrap();
        assert!(marker.is_file());
        assert!(matches!(
            registry.resolve(&handle.id()),
            Err(OpdexError::CollectionSoftDeleted(_))
        ));
    }

    #[test]
    fn soft_delete_unknown_name_fails() {
        let tmp = TempDir::new().unwrap();
        let registry = CollectionRegistry::new(tmp.path());
        let err = registry.soft_delete("nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn load_restores_active_and_soft_deleted() {
        let tmp = TempDir::new().unwrap();
        let (kept, dropped) = {
            let registry = CollectionRegistry::new(tmp.path());
            let kept = registry.create("kept").unwrap().id();
            let dropped = registry.create("dropped").unwrap().id();
            registry.soft_delete("dropped").unwrap();
            (kept, dropped)
        };
        // Stray files and non-collection dirs are ignored
        std::fs::write(tmp.path().join("indexer.json"), "{}").unwrap();
        std::fs::create_dir(tmp.path().join("scratch")).unwrap();

        let registry = CollectionRegistry::load(tmp.path()).unwrap();
        assert!(registry.resolve(&kept).is_ok());
        assert!(matches!(
            registry.resolve(&dropped),
            Err(OpdexError::CollectionSoftDeleted(_))
        ));
        assert_eq!(registry.handles().len(), 2);
        let names: Vec<String> = registry.list().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["kept"]);
    }
}
