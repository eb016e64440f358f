use crate::error::{OpdexError, Result};
use std::io::Write;
use std::path::Path;

/// Replace `path` with `contents` via a synced temp file in the same
/// directory, so readers see either the old or the new value.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| OpdexError::Io(format!("no parent directory for {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new().prefix(".tmp").tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_data()?;
    tmp.persist(path)?;
    Ok(())
}

/// Read a counter sidecar (`committed_seq`, `version`). A missing file is 0.
pub fn read_counter(path: &Path) -> Result<u64> {
    match std::fs::read_to_string(path) {
        Ok(raw) => raw.trim().parse::<u64>().map_err(|e| {
            OpdexError::CorruptLog(format!(
                "{}: {:?} is not a counter ({})",
                path.display(),
                raw,
                e
            ))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

pub fn write_counter(path: &Path, value: u64) -> Result<()> {
    write_atomic(path, value.to_string().as_bytes())
}

/// Remove a directory tree, retrying briefly while another handle still
/// has files open inside it.
pub fn remove_dir_all_with_retry(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut last_err = None;
    for _ in 0..10 {
        match std::fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
        }
    }
    match last_err {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
