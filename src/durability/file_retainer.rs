use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct RetainerInner {
    locked: HashMap<PathBuf, usize>,
    pending_delete: HashSet<PathBuf>,
}

/// Reference-counted registry that keeps snapshot and WAL files on disk
/// while a replication catch-up or an external backup still reads them.
/// Deletion of a locked file is deferred until the last locker drops.
#[derive(Debug, Default)]
pub struct FileRetainer {
    inner: Mutex<RetainerInner>,
}

impl FileRetainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_locker(self: &Arc<Self>) -> FileLocker {
        FileLocker {
            retainer: Arc::clone(self),
            files: Vec::new(),
        }
    }

    /// Removes the file now, or once every locker referencing it is gone.
    pub fn delete_or_defer(&self, path: &Path) {
        let mut inner = self.inner.lock();
        if inner.locked.contains_key(path) {
            inner.pending_delete.insert(path.to_owned());
            debug!(path = %path.display(), "file delete deferred");
            return;
        }
        drop(inner);
        let _ = std::fs::remove_file(path);
    }

    fn lock_file(&self, path: PathBuf) {
        *self.inner.lock().locked.entry(path).or_insert(0) += 1;
    }

    fn release(&self, files: &[PathBuf]) {
        let mut to_delete = Vec::new();
        {
            let mut inner = self.inner.lock();
            for path in files {
                let remove = match inner.locked.get_mut(path) {
                    Some(count) if *count > 1 => {
                        *count -= 1;
                        false
                    }
                    Some(_) => true,
                    None => false,
                };
                if remove {
                    inner.locked.remove(path);
                    if inner.pending_delete.remove(path) {
                        to_delete.push(path.clone());
                    }
                }
            }
        }
        for path in to_delete {
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// A scoped set of pinned files. Dropping the locker releases the pins and
/// performs any deferred deletions.
#[derive(Debug)]
pub struct FileLocker {
    retainer: Arc<FileRetainer>,
    files: Vec<PathBuf>,
}

impl FileLocker {
    pub fn add_file(&mut self, path: PathBuf) {
        self.retainer.lock_file(path.clone());
        self.files.push(path);
    }
}

impl Drop for FileLocker {
    fn drop(&mut self) {
        self.retainer.release(&self.files);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn locked_files_survive_until_release() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("segment.wal");
        std::fs::write(&path, b"payload").unwrap();

        let retainer = Arc::new(FileRetainer::new());
        let mut locker = retainer.add_locker();
        locker.add_file(path.clone());

        retainer.delete_or_defer(&path);
        assert!(path.exists(), "locked file must not be deleted");

        drop(locker);
        assert!(!path.exists(), "deferred delete runs on release");
    }

    #[test]
    fn shared_locks_count_references() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("snap.snapshot");
        std::fs::write(&path, b"payload").unwrap();

        let retainer = Arc::new(FileRetainer::new());
        let mut first = retainer.add_locker();
        first.add_file(path.clone());
        let mut second = retainer.add_locker();
        second.add_file(path.clone());

        retainer.delete_or_defer(&path);
        drop(first);
        assert!(path.exists(), "second locker still pins the file");
        drop(second);
        assert!(!path.exists());
    }

    #[test]
    fn unlocked_files_are_deleted_immediately() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("old.snapshot");
        std::fs::write(&path, b"payload").unwrap();
        let retainer = Arc::new(FileRetainer::new());
        retainer.delete_or_defer(&path);
        assert!(!path.exists());
    }
}
