//! Size-based attachment placement over a record store and a blob store

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;

use chrono::Utc;

use super::sniff::{SNIFF_LEN, sniff_content_type};
use crate::error::{ArchiveError, Result};
use crate::models::{Attachment, AttachmentId, MessageId, StorageKind};
use crate::storage::{AttachmentRecord, AttachmentRecords, BlobStore, ReadSeek};

/// Metadata of an attachment about to be stored
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub id: AttachmentId,
    pub owner: String,
    pub message_id: MessageId,
    pub filename: String,
    pub headers: BTreeMap<String, String>,
}

/// An opened attachment: metadata plus a stream positioned at byte 0
pub struct AttachmentDownload {
    pub attachment: Attachment,
    /// Stored Content-Type header, else the type detected from the payload
    /// and filename
    pub content_type: String,
    pub stream: Box<dyn Read + Send>,
}

impl std::fmt::Debug for AttachmentDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentDownload")
            .field("attachment", &self.attachment)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Persists attachment payloads under one of two placements
///
/// Payloads smaller than `inline_threshold` bytes are zstd-compressed into
/// the attachment record (`Inline`). Anything at or above it is written raw
/// to the blob store under the attachment ID (`LargeObject`). Attachments are
/// write-once: storing an ID that already exists is a no-op.
pub struct AttachmentStore {
    records: Arc<dyn AttachmentRecords>,
    blobs: Arc<dyn BlobStore>,
    inline_threshold: u64,
}

impl AttachmentStore {
    pub fn new(
        records: Arc<dyn AttachmentRecords>,
        blobs: Arc<dyn BlobStore>,
        inline_threshold: u64,
    ) -> Self {
        Self {
            records,
            blobs,
            inline_threshold,
        }
    }

    pub fn inline_threshold(&self) -> u64 {
        self.inline_threshold
    }

    /// Placement chosen for a payload of `size` bytes
    pub fn placement_for(&self, size: u64) -> StorageKind {
        if size < self.inline_threshold {
            StorageKind::Inline
        } else {
            StorageKind::LargeObject
        }
    }

    /// Whether an attachment with this ID has already been stored
    pub fn contains(&self, id: &AttachmentId) -> Result<bool> {
        Ok(self.records.get_attachment(id)?.is_some())
    }

    /// Store a payload and return where it was placed
    ///
    /// If the ID already exists the stored placement is returned and the
    /// payload is discarded.
    pub fn put(&self, new: NewAttachment, payload: &[u8]) -> Result<StorageKind> {
        if let Some(existing) = self.records.get_attachment(&new.id)? {
            log::debug!("[ATTACH] {} already stored, skipping", new.id);
            return Ok(existing.storage_kind);
        }

        let size = payload.len() as u64;
        let storage_kind = self.placement_for(size);

        let inline_payload = match storage_kind {
            StorageKind::Inline => Some(
                zstd::encode_all(payload, 3)
                    .map_err(|e| ArchiveError::storage(format!("compress {}: {}", new.id, e)))?,
            ),
            StorageKind::LargeObject => {
                self.blobs.put(new.id.as_str(), payload)?;
                None
            }
        };

        let attachment = Attachment {
            id: new.id,
            owner: new.owner,
            message_id: new.message_id,
            filename: new.filename,
            headers: new.headers,
            size,
            storage_kind,
            stored_at: Utc::now(),
        };
        let id = attachment.id.clone();

        let inserted = self.records.insert_attachment(AttachmentRecord {
            attachment,
            inline_payload,
        });
        if let Err(e) = inserted {
            // No record will ever point at the blob
            if storage_kind == StorageKind::LargeObject
                && let Err(cleanup) = self.blobs.delete(id.as_str())
            {
                log::warn!("[ATTACH] Could not remove orphaned blob {}: {}", id, cleanup);
            }
            return Err(e);
        }

        log::debug!(
            "[ATTACH] Stored {} ({} bytes, {})",
            id,
            size,
            storage_kind.as_str()
        );
        Ok(storage_kind)
    }

    /// Attachment metadata; `NotFound` for an unknown ID
    pub fn get(&self, id: &AttachmentId) -> Result<Attachment> {
        self.records
            .get_attachment(id)?
            .ok_or_else(|| ArchiveError::not_found(format!("attachment {}", id)))
    }

    /// Open an attachment for reading from the first byte
    ///
    /// Large objects are never read into memory: only a `SNIFF_LEN` prefix is
    /// read to sniff the content type, then the reader seeks back to 0.
    pub fn open_stream(&self, id: &AttachmentId) -> Result<AttachmentDownload> {
        let attachment = self.get(id)?;

        let (head, stream): (Vec<u8>, Box<dyn Read + Send>) = match attachment.storage_kind {
            StorageKind::Inline => {
                let compressed = self.records.get_inline_payload(id)?.ok_or_else(|| {
                    ArchiveError::storage(format!("inline payload of {} missing", id))
                })?;
                let data = zstd::decode_all(compressed.as_slice())
                    .map_err(|e| ArchiveError::storage(format!("decompress {}: {}", id, e)))?;
                let head = data[..data.len().min(SNIFF_LEN)].to_vec();
                (head, Box::new(Cursor::new(data)) as Box<dyn Read + Send>)
            }
            StorageKind::LargeObject => {
                let mut reader = self.blobs.open(id.as_str())?.ok_or_else(|| {
                    ArchiveError::unavailable(format!("blob for {} is missing", id))
                })?;
                let head = read_head(&mut reader)
                    .map_err(|e| ArchiveError::unavailable(format!("read head of {}: {}", id, e)))?;
                reader
                    .seek(SeekFrom::Start(0))
                    .map_err(|e| ArchiveError::unavailable(format!("rewind {}: {}", id, e)))?;
                (head, Box::new(reader) as Box<dyn Read + Send>)
            }
        };

        let content_type = match attachment.content_type() {
            Some(stored) => stored.to_string(),
            None => sniff_content_type(&head, &attachment.filename),
        };

        Ok(AttachmentDownload {
            attachment,
            content_type,
            stream,
        })
    }
}

/// Read up to `SNIFF_LEN` bytes, tolerating short reads
fn read_head(reader: &mut Box<dyn ReadSeek>) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    reader.take(SNIFF_LEN as u64).read_to_end(&mut head)?;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileBlobStore, InMemoryArchive};
    use tempfile::tempdir;

    fn new_attachment(id: &str, headers: &[(&str, &str)]) -> NewAttachment {
        NewAttachment {
            id: AttachmentId::new(id),
            owner: "alice@example.com".to_string(),
            message_id: MessageId::new("m1"),
            filename: "file.bin".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn create_store(threshold: u64) -> (AttachmentStore, Arc<FileBlobStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(FileBlobStore::new(dir.path().join("blobs")).unwrap());
        let store = AttachmentStore::new(Arc::new(InMemoryArchive::new()), blobs.clone(), threshold);
        (store, blobs, dir)
    }

    fn read_all(download: AttachmentDownload) -> Vec<u8> {
        let mut out = Vec::new();
        let mut stream = download.stream;
        stream.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_small_payload_is_inline() {
        let (store, blobs, _dir) = create_store(16);
        let payload = b"fifteen bytes!!".to_vec();
        let kind = store.put(new_attachment("m1.1", &[]), &payload).unwrap();
        assert_eq!(kind, StorageKind::Inline);
        assert!(blobs.open("m1.1").unwrap().is_none());

        let download = store.open_stream(&AttachmentId::new("m1.1")).unwrap();
        assert_eq!(download.attachment.size, 15);
        assert_eq!(read_all(download), payload);
    }

    #[test]
    fn test_threshold_boundary_is_large_object() {
        let (store, blobs, _dir) = create_store(16);
        let payload = vec![7u8; 16];
        let kind = store.put(new_attachment("m1.2", &[]), &payload).unwrap();
        assert_eq!(kind, StorageKind::LargeObject);
        assert!(blobs.open("m1.2").unwrap().is_some());
        assert_eq!(
            store.get(&AttachmentId::new("m1.2")).unwrap().storage_kind,
            StorageKind::LargeObject
        );
    }

    #[test]
    fn test_large_object_sniff_does_not_shift_stream() {
        let (store, _blobs, _dir) = create_store(1024);
        let mut payload = b"%PDF-1.4\n".to_vec();
        payload.extend((0..5000u32).map(|i| (i % 251) as u8));

        store.put(new_attachment("m1.3", &[]), &payload).unwrap();
        let download = store.open_stream(&AttachmentId::new("m1.3")).unwrap();
        assert_eq!(download.content_type, "application/pdf");
        assert_eq!(read_all(download), payload);
    }

    #[test]
    fn test_stored_content_type_wins() {
        let (store, _blobs, _dir) = create_store(1024);
        store
            .put(
                new_attachment("m1.4", &[("Content-Type", "text/plain; name=a.txt")]),
                b"%PDF-not really",
            )
            .unwrap();
        let download = store.open_stream(&AttachmentId::new("m1.4")).unwrap();
        assert_eq!(download.content_type, "text/plain; name=a.txt");

        let mut unlabelled = new_attachment("m1.5", &[]);
        unlabelled.filename = "notes.csv".to_string();
        store.put(unlabelled, b"day,count\nmon,3\n").unwrap();
        let download = store.open_stream(&AttachmentId::new("m1.5")).unwrap();
        assert_eq!(download.content_type, "text/csv");
    }

    #[test]
    fn test_write_once() {
        let (store, _blobs, _dir) = create_store(1024);
        store.put(new_attachment("m1.6", &[]), b"first").unwrap();
        let kind = store
            .put(new_attachment("m1.6", &[]), &vec![0u8; 4096])
            .unwrap();
        assert_eq!(kind, StorageKind::Inline);

        let download = store.open_stream(&AttachmentId::new("m1.6")).unwrap();
        assert_eq!(read_all(download), b"first");
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let (store, _blobs, _dir) = create_store(1024);
        let id = AttachmentId::new("nonexistent-id");
        assert!(store.get(&id).unwrap_err().is_not_found());
        assert!(store.open_stream(&id).unwrap_err().is_not_found());
    }

    /// Records backend whose inserts always fail
    struct RejectingRecords;

    impl AttachmentRecords for RejectingRecords {
        fn insert_attachment(&self, _record: AttachmentRecord) -> Result<bool> {
            Err(ArchiveError::storage("disk full"))
        }

        fn get_attachment(&self, _id: &AttachmentId) -> Result<Option<Attachment>> {
            Ok(None)
        }

        fn get_inline_payload(&self, _id: &AttachmentId) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    #[test]
    fn test_failed_record_insert_removes_blob() {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(FileBlobStore::new(dir.path().join("blobs")).unwrap());
        let store = AttachmentStore::new(Arc::new(RejectingRecords), blobs.clone(), 4);

        let err = store
            .put(new_attachment("m1.8", &[]), b"large enough")
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Storage { .. }));
        assert!(blobs.open("m1.8").unwrap().is_none());
    }

    #[test]
    fn test_missing_blob_is_unavailable() {
        let (store, blobs, _dir) = create_store(4);
        store.put(new_attachment("m1.7", &[]), b"large enough").unwrap();
        blobs.delete("m1.7").unwrap();

        let err = store.open_stream(&AttachmentId::new("m1.7")).unwrap_err();
        assert!(matches!(err, ArchiveError::StorageUnavailable { .. }));
    }
}
