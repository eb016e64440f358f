use crate::error::Result;
use crate::index::utils::{read_counter, write_counter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const VERSION_FILE: &str = "version";

/// Per-collection version. Bumped once per committed indexer batch and
/// never decremented, so callers can poll it to detect indexing progress.
#[derive(Debug)]
pub struct VersionCounter {
    path: PathBuf,
    value: AtomicU64,
}

impl VersionCounter {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(VERSION_FILE);
        let value = read_counter(&path)?;
        Ok(Self {
            path,
            value: AtomicU64::new(value),
        })
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Write `get() + 1` to disk without publishing it. Until `publish`
    /// runs, repeated calls write the same value.
    pub(crate) fn persist_next(&self) -> Result<u64> {
        let next = self.get() + 1;
        write_counter(&self.path, next)?;
        Ok(next)
    }

    pub(crate) fn publish(&self, value: u64) {
        self.value.fetch_max(value, Ordering::AcqRel);
    }
}
