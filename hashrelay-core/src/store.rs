//! File-backed queue of pending records.
//!
//! The queue is a single JSON array on disk. Every write goes to a temporary
//! file in the same directory, is fsynced, and is renamed over the queue file,
//! so a crash mid-write leaves the previously committed queue intact.
//!
//! A queue file that cannot be parsed is copied to `<file>.bak` before the
//! queue is reset, so unreadable bytes are never thrown away.

use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::record::PendingRecord;

/// Prefix of in-flight temporary files; never read as queue content.
const TEMP_PREFIX: &str = ".pending-";

/// Crash-safe append-only store of [`PendingRecord`]s.
///
/// All operations take one store-wide lock, so readers never observe a
/// half-applied write from another thread.
pub struct RecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RecordStore {
    /// Open (or create) the queue at `path`.
    ///
    /// A missing file is created as an empty queue. A file that does not
    /// parse as a list of records is backed up and reinitialized.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let store = Self {
            path,
            lock: Mutex::new(()),
        };

        {
            let _guard = store.guard();
            if store.path.exists() {
                let records = store.load_locked()?;
                tracing::debug!(
                    path = %store.path.display(),
                    pending = records.len(),
                    "Opened queue"
                );
            } else {
                store.write_locked(&[])?;
                tracing::info!(path = %store.path.display(), "Initialized new queue file");
            }
        }

        Ok(store)
    }

    /// Path of the queue file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where a corrupt queue file is preserved
    pub fn backup_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Durably append one record.
    pub fn append(&self, record: PendingRecord) -> Result<()> {
        record.validate()?;

        let _guard = self.guard();
        let mut records = self.load_locked()?;
        records.push(record);
        self.write_locked(&records)?;

        tracing::debug!(
            hash = %records[records.len() - 1].hash,
            pending = records.len(),
            "Appended record"
        );
        Ok(())
    }

    /// Current batch; empty if the file is missing, corrupt, or empty.
    pub fn read_all(&self) -> Result<Vec<PendingRecord>> {
        let _guard = self.guard();
        self.load_locked()
    }

    /// Atomically replace the queue with an empty one.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.guard();
        self.write_locked(&[])?;
        tracing::info!(path = %self.path.display(), "Cleared queue");
        Ok(())
    }

    /// Remove a batch that was delivered, keeping anything appended since.
    ///
    /// The file is re-read under the lock. When the queue still starts with
    /// `delivered` that prefix is dropped; otherwise each delivered record is
    /// removed once, wherever it now sits. Returns how many were removed.
    pub fn remove_delivered(&self, delivered: &[PendingRecord]) -> Result<usize> {
        let _guard = self.guard();
        let current = self.load_locked()?;

        let remaining: Vec<PendingRecord> = if current.starts_with(delivered) {
            current[delivered.len()..].to_vec()
        } else {
            let mut unsent = delivered.to_vec();
            current
                .iter()
                .filter(|record| match unsent.iter().position(|d| d == *record) {
                    Some(i) => {
                        unsent.remove(i);
                        false
                    }
                    None => true,
                })
                .cloned()
                .collect()
        };

        let removed = current.len() - remaining.len();
        if removed > 0 {
            self.write_locked(&remaining)?;
        }

        tracing::info!(
            removed,
            remaining = remaining.len(),
            path = %self.path.display(),
            "Removed delivered records"
        );
        Ok(removed)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read_all()?.is_empty())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read_all()?.len())
    }

    /// Take the whole batch and leave an empty queue behind, in one locked step.
    pub fn pop_all(&self) -> Result<Vec<PendingRecord>> {
        let _guard = self.guard();
        let records = self.load_locked()?;
        if !records.is_empty() {
            self.write_locked(&[])?;
            tracing::debug!(count = records.len(), "Popped all records");
        }
        Ok(records)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // The guarded data is the file, which a panicking holder cannot tear.
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_locked(&self) -> Result<Vec<PendingRecord>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        match serde_json::from_slice::<Vec<PendingRecord>>(&bytes) {
            Ok(records) => Ok(records),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Queue file is not a list of records"
                );
                self.quarantine_locked()?;
                Ok(Vec::new())
            }
        }
    }

    /// Copy the current file aside, then reset to an empty queue.
    ///
    /// If the copy fails the corrupt file is left in place.
    fn quarantine_locked(&self) -> Result<()> {
        let backup = self.backup_path();
        fs::copy(&self.path, &backup)?;
        tracing::warn!(backup = %backup.display(), "Backed up unreadable queue file");

        self.write_locked(&[])?;
        tracing::info!(path = %self.path.display(), "Reinitialized queue file");
        Ok(())
    }

    fn write_locked(&self, records: &[PendingRecord]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut contents = serde_json::to_vec_pretty(records)?;
        contents.push(b'\n');

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        sync_dir(dir);
        Ok(())
    }
}

/// Make the rename itself durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), error = %e, "Directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn queue_in(dir: &TempDir) -> PathBuf {
        dir.path().join("queue").join("pending.json")
    }

    fn record(hash: &str) -> PendingRecord {
        PendingRecord::new(hash).with_label("Trojan.X")
    }

    #[test]
    fn test_open_creates_empty_queue() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(queue_in(&dir)).unwrap();

        assert!(store.path().exists());
        assert!(store.is_empty().unwrap());
        let raw = fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw.trim(), "[]");
    }

    #[test]
    fn test_appends_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = queue_in(&dir);

        {
            let store = RecordStore::open(&path).unwrap();
            store.append(record("a1")).unwrap();
            store.append(record("b2")).unwrap();
        }
        {
            let store = RecordStore::open(&path).unwrap();
            store.append(record("c3")).unwrap();
        }

        let store = RecordStore::open(&path).unwrap();
        let hashes: Vec<_> = store
            .read_all()
            .unwrap()
            .into_iter()
            .map(|r| r.hash)
            .collect();
        assert_eq!(hashes, vec!["a1", "b2", "c3"]);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(queue_in(&dir)).unwrap();

        store.clear().unwrap();
        assert!(store.read_all().unwrap().is_empty());

        store.append(record("a1")).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_append_rejects_empty_hash() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(queue_in(&dir)).unwrap();

        let err = store.append(PendingRecord::new("")).unwrap_err();
        assert!(matches!(err, Error::InvalidRecord(_)));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_corrupt_file_is_backed_up_on_open() {
        let dir = TempDir::new().unwrap();
        let path = queue_in(&dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"[{\"hash\": \"abc\", trunc").unwrap();

        let store = RecordStore::open(&path).unwrap();

        assert!(store.is_empty().unwrap());
        let backup = fs::read(store.backup_path()).unwrap();
        assert_eq!(backup, b"[{\"hash\": \"abc\", trunc");
    }

    #[test]
    fn test_non_list_json_is_backed_up() {
        let dir = TempDir::new().unwrap();
        let path = queue_in(&dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, br#"{"hash": "abc"}"#).unwrap();

        let store = RecordStore::open(&path).unwrap();

        assert!(store.is_empty().unwrap());
        assert!(store.backup_path().exists());
    }

    #[test]
    fn test_corruption_after_open_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(queue_in(&dir)).unwrap();
        store.append(record("a1")).unwrap();

        fs::write(store.path(), b"not json").unwrap();

        assert!(store.read_all().unwrap().is_empty());
        assert_eq!(fs::read(store.backup_path()).unwrap(), b"not json");

        // The queue keeps working after recovery
        store.append(record("b2")).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_whitespace_file_is_empty_without_backup() {
        let dir = TempDir::new().unwrap();
        let path = queue_in(&dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"\n").unwrap();

        let store = RecordStore::open(&path).unwrap();

        assert!(store.is_empty().unwrap());
        assert!(!store.backup_path().exists());
    }

    #[test]
    fn test_interrupted_write_is_never_observed() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(queue_in(&dir)).unwrap();
        store.append(record("a1")).unwrap();

        // A crash between writing the temp file and renaming it leaves this behind
        let leftover = store
            .path()
            .parent()
            .unwrap()
            .join(format!("{}crash.tmp", TEMP_PREFIX));
        fs::write(&leftover, b"[{\"hash\": \"half").unwrap();

        let records = store.read_all().unwrap();
        assert_eq!(records, vec![record("a1")]);
        assert!(!store.backup_path().exists());
    }

    #[test]
    fn test_pop_all_drains_queue() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(queue_in(&dir)).unwrap();
        store.append(record("a1")).unwrap();
        store.append(record("b2")).unwrap();

        let popped = store.pop_all().unwrap();
        assert_eq!(popped.len(), 2);
        assert!(store.is_empty().unwrap());
        assert!(store.pop_all().unwrap().is_empty());
    }

    #[test]
    fn test_remove_delivered_keeps_later_appends() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(queue_in(&dir)).unwrap();
        store.append(record("a1")).unwrap();
        store.append(record("b2")).unwrap();

        let batch = store.read_all().unwrap();
        store.append(record("late")).unwrap();

        assert_eq!(store.remove_delivered(&batch).unwrap(), 2);
        assert_eq!(store.read_all().unwrap(), vec![record("late")]);
    }

    #[test]
    fn test_remove_delivered_after_reorder_removes_each_once() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(queue_in(&dir)).unwrap();
        store.append(record("a1")).unwrap();
        let batch = store.read_all().unwrap();

        // Queue rewritten by another writer: new record first, duplicate hash later
        store.clear().unwrap();
        store.append(record("new")).unwrap();
        store.append(record("a1")).unwrap();
        store.append(record("a1")).unwrap();

        assert_eq!(store.remove_delivered(&batch).unwrap(), 1);
        let hashes: Vec<_> = store
            .read_all()
            .unwrap()
            .into_iter()
            .map(|r| r.hash)
            .collect();
        assert_eq!(hashes, vec!["new", "a1"]);
    }

    #[test]
    fn test_remove_delivered_on_empty_queue_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(queue_in(&dir)).unwrap();

        assert_eq!(store.remove_delivered(&[record("gone")]).unwrap(), 0);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_concurrent_appends_are_serialized() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RecordStore::open(queue_in(&dir)).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..10 {
                        store.append(record(&format!("t{}-{}", t, i))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len().unwrap(), 40);
    }
}
