//! Attachment model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::MessageId;

/// Archive identifier for an attachment
///
/// Derived from the owning message and MIME part so that re-syncing the same
/// message resolves to the same attachment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentId(pub String);

impl AttachmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// ID of the attachment carried by `part_id` of `message_id`
    pub fn for_part(message_id: &MessageId, part_id: &str) -> Self {
        Self(format!("{}.{}", message_id.as_str(), part_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AttachmentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an attachment's payload lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// Compressed payload kept in the attachment record
    Inline,
    /// Payload kept in the blob namespace, read by streaming
    LargeObject,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Inline => "inline",
            StorageKind::LargeObject => "large_object",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inline" => Some(StorageKind::Inline),
            "large_object" => Some(StorageKind::LargeObject),
            _ => None,
        }
    }
}

/// Attachment metadata
///
/// The payload itself is never part of this struct; it is read through
/// `AttachmentStore::open_stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    /// Mailbox the attachment was archived from
    pub owner: String,
    pub message_id: MessageId,
    pub filename: String,
    /// MIME headers of the part (header name -> value)
    pub headers: BTreeMap<String, String>,
    /// Payload size in bytes
    pub size: u64,
    pub storage_kind: StorageKind,
    pub stored_at: DateTime<Utc>,
}

impl Attachment {
    /// Content-Type header, if the part carried one
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Type"))
            .map(|(_, v)| v.as_str())
    }
}
