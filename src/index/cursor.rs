use crate::error::{OpdexError, Result};
use crate::index::utils::{read_counter, write_counter};
use crate::types::{CollectionId, SeqNo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const CURSOR_FILE: &str = "committed_seq";

/// Highest log sequence number applied to the index. Entries with
/// `seq <= get()` are indexed. Written by the collection's indexer only.
#[derive(Debug)]
pub struct IndexCursor {
    collection_id: CollectionId,
    path: PathBuf,
    last_indexed: AtomicU64,
}

impl IndexCursor {
    pub fn open(dir: &Path, collection_id: CollectionId) -> Result<Self> {
        let path = dir.join(CURSOR_FILE);
        let last_indexed = read_counter(&path)?;
        Ok(Self {
            collection_id,
            path,
            last_indexed: AtomicU64::new(last_indexed),
        })
    }

    pub fn get(&self) -> SeqNo {
        self.last_indexed.load(Ordering::Acquire)
    }

    /// Write a new position to disk without publishing it. Moving backwards
    /// is refused.
    pub(crate) fn persist(&self, seq: SeqNo) -> Result<()> {
        let current = self.get();
        if seq < current {
            return Err(OpdexError::CorruptLog(format!(
                "cursor for {} cannot move back from {} to {}",
                self.collection_id, current, seq
            )));
        }
        if seq == current {
            return Ok(());
        }
        write_counter(&self.path, seq)
    }

    /// Make a persisted position visible to readers.
    pub(crate) fn publish(&self, seq: SeqNo) {
        self.last_indexed.fetch_max(seq, Ordering::AcqRel);
    }

    #[cfg(test)]
    pub(crate) fn advance_to(&self, seq: SeqNo) -> Result<()> {
        self.persist(seq)?;
        self.publish(seq);
        Ok(())
    }
}
