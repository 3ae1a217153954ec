use crate::StoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Exclusive advisory lock on a store data directory.
///
/// Two processes sharing one snapshot file would each believe they hold the
/// only copy of the object set, which breaks every uniqueness guarantee.
pub struct DataDirLock {
    lock_file: File,
}

impl DataDirLock {
    /// Take the lock without blocking. `None` means another holder has it.
    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, StoreError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File, StoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    Ok(file)
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("store.lock");

        {
            let _lock = DataDirLock::try_acquire(&lock_path).unwrap().unwrap();
            assert!(lock_path.exists());
        }
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("store.lock");

        let _lock = DataDirLock::try_acquire(&lock_path).unwrap().unwrap();
        let result = DataDirLock::try_acquire(&lock_path).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("nested").join("store.lock");

        {
            let _lock = DataDirLock::try_acquire(&lock_path).unwrap().unwrap();
        }

        let lock2 = DataDirLock::try_acquire(&lock_path).unwrap();
        assert!(lock2.is_some());
    }
}
