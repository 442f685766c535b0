//! Key-value persistence
//!
//! The engine only needs `get`/`put`/`delete` over byte keys. [`MemoryStorage`]
//! is an ordered in-process implementation for tests and throwaway nodes;
//! [`FileStorage`] keeps one file per key in a data directory.

use crate::{CoreError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Durable key-value store capability
pub trait Storage: Send + Sync {
    /// Fetch the value stored under `key`, if any
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove `key`; removing an absent key is not an error
    fn delete(&self, key: &[u8]) -> Result<()>;
}

/// Ordered in-memory store
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Keys beginning with `prefix`, in order
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.entries
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Directory-backed store, one file per key named by the key's hex encoding.
///
/// Writes go to a temporary file that is then renamed over the old value, so
/// a crash leaves either the previous or the new value in place.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Open the store in `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            std::fs::create_dir_all(&root)
                .map_err(|e| CoreError::StorageError(format!("Failed to create storage directory: {}", e)))?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &[u8]) -> PathBuf {
        self.root.join(format!("{}.dat", hex::encode(key)))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.key_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::StorageError(format!("Failed to read {}: {}", hex::encode(key), e))),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let path = self.key_path(key);
        let staging = path.with_extension("tmp");
        let _guard = self.write_lock.lock();
        std::fs::write(&staging, value)
            .map_err(|e| CoreError::StorageError(format!("Failed to write {}: {}", hex::encode(key), e)))?;
        std::fs::rename(&staging, &path)
            .map_err(|e| CoreError::StorageError(format!("Failed to replace {}: {}", hex::encode(key), e)))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        match std::fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::StorageError(format!("Failed to delete {}: {}", hex::encode(key), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStorage::new();
        assert!(store.get(b"a").unwrap().is_none());

        store.put(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));

        store.put(b"a", b"2").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));

        store.delete(b"a").unwrap();
        store.delete(b"a").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_prefix_scan_is_ordered() {
        let store = MemoryStorage::new();
        store.put(b"block/b", b"").unwrap();
        store.put(b"block/a", b"").unwrap();
        store.put(b"tail", b"").unwrap();
        assert_eq!(
            store.keys_with_prefix(b"block/"),
            vec![b"block/a".to_vec(), b"block/b".to_vec()]
        );
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("chain");
        {
            let store = FileStorage::open(&data_dir).unwrap();
            store.put(b"tail", &[7u8; 32]).unwrap();
            store.put(b"block/a", b"first").unwrap();
            store.put(b"block/a", b"second").unwrap();
            store.put(b"lib", b"x").unwrap();
            store.delete(b"lib").unwrap();
            store.delete(b"lib").unwrap();
        }

        let store = FileStorage::open(&data_dir).unwrap();
        assert_eq!(store.root(), data_dir.as_path());
        assert_eq!(store.get(b"tail").unwrap(), Some(vec![7u8; 32]));
        assert_eq!(store.get(b"block/a").unwrap(), Some(b"second".to_vec()));
        assert!(store.get(b"lib").unwrap().is_none());
        // No staging files are left behind.
        let leftovers = std::fs::read_dir(&data_dir)
            .unwrap()
            .filter(|entry| entry.as_ref().unwrap().path().extension().map_or(false, |e| e == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
