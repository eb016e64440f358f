//! Durable, append-only operation log for one collection.
//!
//! Entries live in `{dir}/ops.jsonl`, one JSON object per line, and are
//! mirrored in memory so readers never touch the file. Every record of a
//! mutation becomes its own entry, which is what makes `total_ops` count
//! records rather than requests.

use crate::error::{OpdexError, Result};
use crate::types::{CollectionId, OperationKind, RecordId, RecordMutation, SeqNo};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

const LOG_FILE: &str = "ops.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpLogEntry {
    pub seq: SeqNo,
    pub timestamp_ms: u64,
    pub collection_id: CollectionId,
    pub kind: OperationKind,
    pub record_id: RecordId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Sequence range assigned to one `append_batch` call (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReceipt {
    pub first_seq: SeqNo,
    pub last_seq: SeqNo,
}

impl AppendReceipt {
    pub fn count(&self) -> u64 {
        self.last_seq - self.first_seq + 1
    }
}

struct LogWriter {
    file: File,
    /// Byte length of the file after the last successful append.
    len: u64,
}

pub struct OpLog {
    collection_id: CollectionId,
    path: PathBuf,
    writer: Mutex<LogWriter>,
    entries: RwLock<Vec<Arc<OpLogEntry>>>,
    /// Last assigned sequence number, published after the entry is readable.
    seq: AtomicU64,
}

impl std::fmt::Debug for OpLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpLog")
            .field("collection_id", &self.collection_id)
            .field("path", &self.path)
            .field("seq", &self.current_seq())
            .finish()
    }
}

impl OpLog {
    /// Open (or create) the log in `dir`, replaying existing entries.
    ///
    /// A partial trailing line left by a crash mid-append is cut off. Any
    /// other unreadable line, or a gap in sequence numbers, is reported as
    /// [`OpdexError::CorruptLog`].
    pub fn open(dir: &Path, collection_id: CollectionId) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        let mut valid_len = 0usize;
        while offset < raw.len() {
            let line_end = raw[offset..].iter().position(|b| *b == b'\n');
            let (line, next) = match line_end {
                Some(pos) => (&raw[offset..offset + pos], offset + pos + 1),
                None => (&raw[offset..], raw.len()),
            };
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                offset = next;
                valid_len = next;
                continue;
            }
            match serde_json::from_slice::<OpLogEntry>(line) {
                Ok(entry) => {
                    let expected = entries.len() as u64 + 1;
                    if entry.seq != expected {
                        return Err(OpdexError::CorruptLog(format!(
                            "{}: expected seq {}, found {}",
                            path.display(),
                            expected,
                            entry.seq
                        )));
                    }
                    if line_end.is_none() {
                        // Complete JSON but no terminator: keep it, and fix the file
                        // so the next append starts on a fresh line.
                        file.write_all(b"\n")?;
                        valid_len = raw.len() + 1;
                    } else {
                        valid_len = next;
                    }
                    entries.push(Arc::new(entry));
                }
                Err(e) if line_end.is_none() => {
                    tracing::warn!(
                        "[OPLOG {}] dropping torn trailing entry ({} bytes): {}",
                        collection_id,
                        line.len(),
                        e
                    );
                    file.set_len(valid_len as u64)?;
                    break;
                }
                Err(e) => {
                    return Err(OpdexError::CorruptLog(format!(
                        "{} at byte {}: {}",
                        path.display(),
                        offset,
                        e
                    )));
                }
            }
            offset = next;
        }

        let seq = entries.len() as u64;
        if seq > 0 {
            tracing::info!("[OPLOG {}] opened with {} entries", collection_id, seq);
        }

        Ok(Self {
            collection_id,
            path,
            writer: Mutex::new(LogWriter {
                file,
                len: valid_len as u64,
            }),
            entries: RwLock::new(entries),
            seq: AtomicU64::new(seq),
        })
    }

    /// Last assigned sequence number; equals the number of entries.
    pub fn current_seq(&self) -> SeqNo {
        self.seq.load(Ordering::Acquire)
    }

    /// Number of entries in the log (`total_ops`).
    pub fn len(&self) -> u64 {
        self.current_seq()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one entry per record, all of the same kind.
    ///
    /// The batch is written and synced before any entry becomes visible, so
    /// a successful return means `len()` already includes every record.
    /// Appends are serialized; concurrent callers get disjoint, ordered ranges.
    pub fn append_batch(
        &self,
        kind: OperationKind,
        records: Vec<RecordMutation>,
    ) -> Result<AppendReceipt> {
        if records.is_empty() {
            return Err(OpdexError::InvalidMutation(
                "mutation must name at least one record".to_string(),
            ));
        }

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| {
                OpdexError::Io(format!("oplog writer poisoned: {}", self.path.display()))
            })?;

        let first_seq = self.current_seq() + 1;
        let timestamp_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;

        let mut batch = Vec::with_capacity(records.len());
        let mut buf = Vec::new();
        for (i, record) in records.into_iter().enumerate() {
            let entry = OpLogEntry {
                seq: first_seq + i as u64,
                timestamp_ms,
                collection_id: self.collection_id,
                kind,
                record_id: record.id,
                payload: record.payload,
            };
            serde_json::to_writer(&mut buf, &entry)?;
            buf.push(b'\n');
            batch.push(Arc::new(entry));
        }

        let written = writer
            .file
            .write_all(&buf)
            .and_then(|_| writer.file.sync_data());
        if let Err(e) = written {
            tracing::error!("[OPLOG {}] append failed: {}", self.collection_id, e);
            // Roll the file back so a retry doesn't follow a partial line.
            let len = writer.len;
            if let Err(trunc) = writer.file.set_len(len) {
                tracing::error!(
                    "[OPLOG {}] rollback to {} bytes failed: {}",
                    self.collection_id,
                    len,
                    trunc
                );
            }
            return Err(e.into());
        }
        writer.len += buf.len() as u64;

        let last_seq = first_seq + batch.len() as u64 - 1;
        {
            let mut entries = self
                .entries
                .write()
                .map_err(|_| OpdexError::Io("oplog entries poisoned".to_string()))?;
            entries.extend(batch);
        }
        self.seq.store(last_seq, Ordering::Release);

        tracing::debug!(
            "[OPLOG {}] appended {} {} entries, seq {}..={}",
            self.collection_id,
            last_seq - first_seq + 1,
            kind,
            first_seq,
            last_seq
        );

        Ok(AppendReceipt {
            first_seq,
            last_seq,
        })
    }

    /// Lazily iterate entries with `seq >= from`, up to the log length at the
    /// time of this call. Entries appended afterwards are not included, so the
    /// reader is finite; a new reader from the same `from` yields the same
    /// entries.
    pub fn read_from(self: &Arc<Self>, from: SeqNo) -> LogReader {
        LogReader {
            log: Arc::clone(self),
            next: from.max(1),
            end: self.current_seq(),
        }
    }

    /// Fetch a single entry.
    pub fn get(&self, seq: SeqNo) -> Option<Arc<OpLogEntry>> {
        if seq == 0 || seq > self.current_seq() {
            return None;
        }
        let entries = self.entries.read().ok()?;
        entries.get((seq - 1) as usize).cloned()
    }
}

/// Finite, restartable view over a log range. See [`OpLog::read_from`].
pub struct LogReader {
    log: Arc<OpLog>,
    next: SeqNo,
    end: SeqNo,
}

impl Iterator for LogReader {
    type Item = Arc<OpLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.end {
            return None;
        }
        let entry = self.log.get(self.next)?;
        self.next += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.end + 1).saturating_sub(self.next) as usize;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn records(ids: &[&str]) -> Vec<RecordMutation> {
        ids.iter()
            .map(|id| RecordMutation::with_embedding(*id, vec![1.0, 2.0, 3.0]))
            .collect()
    }

    fn open(tmp: &TempDir) -> Arc<OpLog> {
        Arc::new(OpLog::open(tmp.path(), uuid::Uuid::nil()).unwrap())
    }

    #[test]
    fn empty_log_has_zero_len() {
        let tmp = TempDir::new().unwrap();
        let log = open(&tmp);
        assert_eq!(log.len(), 0);
        assert!(log.is_empty());
        assert_eq!(log.read_from(1).count(), 0);
    }

    #[test]
    fn append_assigns_one_seq_per_record() {
        let tmp = TempDir::new().unwrap();
        let log = open(&tmp);

        let r1 = log.append_batch(OperationKind::Add, records(&["a", "b", "c"])).unwrap();
        assert_eq!(r1, AppendReceipt { first_seq: 1, last_seq: 3 });
        assert_eq!(r1.count(), 3);
        assert_eq!(log.len(), 3);

        let r2 = log
            .append_batch(
                OperationKind::Delete,
                vec![RecordMutation::delete("a"), RecordMutation::delete("b")],
            )
            .unwrap();
        assert_eq!(r2.first_seq, 4);
        assert_eq!(r2.last_seq, 5);
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn empty_batch_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let log = open(&tmp);
        let err = log.append_batch(OperationKind::Add, vec![]).unwrap_err();
        assert!(matches!(err, OpdexError::InvalidMutation(_)));
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn read_from_is_bounded_and_restartable() {
        let tmp = TempDir::new().unwrap();
        let log = open(&tmp);
        log.append_batch(OperationKind::Add, records(&["a", "b", "c", "d"])).unwrap();

        let reader = log.read_from(2);
        assert_eq!(reader.size_hint(), (3, Some(3)));

        // Appends after the reader was created are not visible to it
        log.append_batch(OperationKind::Upsert, records(&["e"])).unwrap();
        let seqs: Vec<u64> = reader.map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);

        let again: Vec<u64> = log.read_from(2).map(|e| e.seq).collect();
        assert_eq!(again, vec![2, 3, 4, 5]);

        let ids: Vec<String> = log.read_from(0).map(|e| e.record_id.clone()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn reopen_replays_entries() {
        let tmp = TempDir::new().unwrap();
        {
            let log = open(&tmp);
            log.append_batch(OperationKind::Add, records(&["a", "b"])).unwrap();
            log.append_batch(OperationKind::Delete, vec![RecordMutation::delete("a")])
                .unwrap();
        }
        let log = open(&tmp);
        assert_eq!(log.len(), 3);
        let last = log.get(3).unwrap();
        assert_eq!(last.kind, OperationKind::Delete);
        assert_eq!(last.record_id, "a");

        let r = log.append_batch(OperationKind::Add, records(&["z"])).unwrap();
        assert_eq!(r.first_seq, 4);
    }

    #[test]
    fn torn_trailing_line_is_dropped() {
        let tmp = TempDir::new().unwrap();
        {
            let log = open(&tmp);
            log.append_batch(OperationKind::Add, records(&["a", "b"])).unwrap();
        }
        let path = tmp.path().join(LOG_FILE);
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"seq":3,"timestamp_ms":1,"coll"#).unwrap();
        drop(f);

        let log = open(&tmp);
        assert_eq!(log.len(), 2);
        log.append_batch(OperationKind::Add, records(&["c"])).unwrap();

        let reopened = open(&tmp);
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.get(3).unwrap().record_id, "c");
    }

    #[test]
    fn corrupt_middle_line_is_an_error() {
        let tmp = TempDir::new().unwrap();
        {
            let log = open(&tmp);
            log.append_batch(OperationKind::Add, records(&["a"])).unwrap();
        }
        let path = tmp.path().join(LOG_FILE);
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.insert_str(0, "garbage\n");
        std::fs::write(&path, content).unwrap();

        let err = OpLog::open(tmp.path(), uuid::Uuid::nil()).unwrap_err();
        assert!(matches!(err, OpdexError::CorruptLog(_)));
    }

    #[test]
    fn concurrent_appends_get_distinct_ordered_seqs() {
        let tmp = TempDir::new().unwrap();
        let log = open(&tmp);

        let mut handles = Vec::new();
        for t in 0..8 {
            let log = Arc::clone(&log);
            handles.push(std::thread::spawn(move || {
                let mut receipts = Vec::new();
                for i in 0..10 {
                    let id = format!("t{}_{}", t, i);
                    receipts.push(
                        log.append_batch(OperationKind::Upsert, records(&[id.as_str(), "shared"]))
                            .unwrap(),
                    );
                }
                receipts
            }));
        }
        let mut all: Vec<AppendReceipt> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread should not panic"))
            .collect();
        all.sort_by_key(|r| r.first_seq);

        assert_eq!(log.len(), 160);
        let mut expected = 1;
        for r in all {
            assert_eq!(r.first_seq, expected);
            assert_eq!(r.count(), 2);
            expected = r.last_seq + 1;
        }
        let seqs: Vec<u64> = log.read_from(1).map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=160).collect::<Vec<_>>());
    }
}
