//! File-based blob storage

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::blob::{BlobStore, ReadSeek};
use crate::error::{ArchiveError, Result};

/// File-based blob storage
///
/// Directory structure (keys are percent-encoded into file names):
/// ```text
/// blobs/
///   18/
///     18c2f0a1b2.1.bin      # attachment part 1 of message 18c2f0a1b2
///     18c2f0a1b2.2.bin
///   19/
///     19ab77d3e0.1.bin
/// ```
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Create a new file blob store at the given path
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            ArchiveError::storage(format!(
                "failed to create blob directory {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    /// Get the shard directory (first 2 chars of the encoded key)
    fn shard(encoded: &str) -> &str {
        match encoded.get(..2) {
            Some(prefix) if prefix.bytes().all(|b| b.is_ascii_alphanumeric()) => prefix,
            _ => "xx",
        }
    }

    /// Get the file path for a blob key
    fn blob_path(&self, key: &str) -> PathBuf {
        let encoded = urlencoding::encode(key);
        self.root
            .join(Self::shard(&encoded))
            .join(format!("{}.bin", encoded))
    }

    fn unavailable(&self, key: &str, e: io::Error) -> ArchiveError {
        ArchiveError::unavailable(format!(
            "blob {} under {}: {}",
            key,
            self.root.display(),
            e
        ))
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(key);
        let write = || -> io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            // Write atomically (write to temp, then rename)
            let temp_path = path.with_extension("tmp");
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        };

        write().map_err(|e| ArchiveError::storage(format!("failed to write blob {}: {}", key, e)))
    }

    fn open(&self, key: &str) -> Result<Option<Box<dyn ReadSeek>>> {
        if !self.root.is_dir() {
            return Err(self.unavailable(
                key,
                io::Error::new(io::ErrorKind::NotFound, "blob root missing"),
            ));
        }

        match File::open(self.blob_path(key)) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.unavailable(key, e)),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.blob_path(key);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| ArchiveError::storage(format!("failed to delete blob {}: {}", key, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use tempfile::tempdir;

    #[test]
    fn test_put_open() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();

        store.put("abc123.1", b"Hello, world!").unwrap();
        let mut reader = store.open("abc123.1").unwrap().unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out, b"Hello, world!");
    }

    #[test]
    fn test_open_is_seekable() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();
        store.put("k", b"0123456789").unwrap();

        let mut reader = store.open("k").unwrap().unwrap();
        let mut head = [0u8; 4];
        reader.read_exact(&mut head).unwrap();
        reader.seek(SeekFrom::Start(0)).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out, b"0123456789");
    }

    #[test]
    fn test_open_nonexistent() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();
        assert!(store.open("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_missing_root_is_unavailable() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("blobs");
        let store = FileBlobStore::new(&root).unwrap();
        fs::remove_dir_all(&root).unwrap();

        let err = store.open("k").err().unwrap();
        assert!(matches!(err, ArchiveError::StorageUnavailable { .. }));
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();

        store.put("k", b"data").unwrap();
        store.delete("k").unwrap();
        assert!(store.open("k").unwrap().is_none());
        store.delete("k").unwrap();
    }

    #[test]
    fn test_keys_are_escaped() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();

        store.put("../escape", b"x").unwrap();
        assert!(dir.path().join("blobs/xx/..%2Fescape.bin").exists());
        assert!(store.open("../escape").unwrap().is_some());
    }
}
