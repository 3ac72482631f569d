//! Mail provider contract
//!
//! The sync engine only talks to the remote mailbox through [`MailProvider`].
//! [`crate::gmail::GmailClient`] is the production implementation;
//! [`StaticProvider`] serves canned data for tests and demos.

mod memory;

pub use memory::{ProviderGate, StaticProvider};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::models::{Header, MessageBody, MessageId, ThreadId};

/// One page of a thread enumeration
#[derive(Debug, Clone, Default)]
pub struct ThreadPage {
    pub threads: Vec<ThreadId>,
    /// Token for the following page; `None` when the enumeration is exhausted
    pub next_page_token: Option<String>,
}

/// A thread with its full message set, as returned by the provider
#[derive(Debug, Clone)]
pub struct RemoteThread {
    pub id: ThreadId,
    /// Messages in provider order (typically chronological)
    pub messages: Vec<RemoteMessage>,
}

/// A provider message before archival
#[derive(Debug, Clone)]
pub struct RemoteMessage {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub headers: Vec<Header>,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub label_ids: Vec<String>,
    pub body: MessageBody,
    pub attachments: Vec<RemoteAttachment>,
}

/// Where an attachment's payload can be obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSource {
    /// Must be fetched with [`MailProvider::get_attachment`] using this id
    Remote(String),
    /// Payload already delivered with the message
    Embedded(Vec<u8>),
}

/// Reference to an attachment part of a message
#[derive(Debug, Clone)]
pub struct RemoteAttachment {
    /// MIME part identifier, stable for a given message
    pub part_id: String,
    pub filename: String,
    /// MIME headers of the part
    pub headers: BTreeMap<String, String>,
    /// Size announced by the provider
    pub size: u64,
    pub source: AttachmentSource,
}

/// Attachment payload bytes
#[derive(Debug, Clone)]
pub struct AttachmentPayload {
    pub data: Vec<u8>,
    pub size: u64,
}

impl AttachmentPayload {
    pub fn new(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self { data, size }
    }
}

/// Remote mailbox access consumed by the sync engine
///
/// Every failure is reported as `ArchiveError::Provider`; an expired or
/// invalid credential is a provider failure too.
pub trait MailProvider: Send + Sync {
    /// Enumerate threads matching `query` (empty = all mail), one page at a time
    fn list_threads(&self, owner: &str, query: &str, page_token: Option<&str>)
    -> Result<ThreadPage>;

    /// Fetch a thread with all of its messages and attachment references
    fn get_thread(&self, owner: &str, thread_id: &ThreadId) -> Result<RemoteThread>;

    /// Fetch an attachment payload
    fn get_attachment(
        &self,
        owner: &str,
        message_id: &MessageId,
        attachment_id: &str,
    ) -> Result<AttachmentPayload>;
}
