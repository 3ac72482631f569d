//! Blob storage trait for large attachment payloads

use std::io::{Read, Seek};

use crate::error::Result;

/// A readable, seekable payload stream
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Trait for blob storage operations
///
/// Blobs are stored uncompressed so readers can seek; payloads routed here
/// are large and usually already compressed (PDF, images, archives).
pub trait BlobStore: Send + Sync {
    /// Store blob content, replacing any previous content for `key`
    ///
    /// Failures are `ArchiveError::Storage`.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Open a blob for streaming
    ///
    /// Returns `None` if the blob doesn't exist. Failures to reach the
    /// backend are `ArchiveError::StorageUnavailable`.
    fn open(&self, key: &str) -> Result<Option<Box<dyn ReadSeek>>>;

    /// Delete a blob; deleting a missing blob is not an error
    fn delete(&self, key: &str) -> Result<()>;
}
