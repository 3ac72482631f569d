//! Archive crate - mailbox backup and archive browsing
//!
//! This crate provides:
//! - Domain models (Thread, ThreadMessage, Attachment, SyncRun)
//! - The mail provider contract and a Gmail API implementation
//! - Two-tier attachment storage (inline records, large-object blobs)
//! - Archive repository traits with SQLite and in-memory implementations
//! - Resumable sync runs supervised per mailbox owner
//! - Query API for the browsing interface

pub mod attachments;
pub mod error;
pub mod gmail;
pub mod models;
pub mod provider;
pub mod query;
pub mod service;
pub mod settings;
pub mod storage;
pub mod sync;

pub use attachments::{AttachmentDownload, AttachmentStore, NewAttachment};
pub use error::{ArchiveError, ProviderFailure, Result};
pub use gmail::{GmailClient, StaticToken, TokenFile, TokenProvider};
pub use models::{
    Attachment, AttachmentId, EmailAddress, MailboxStats, MessageId, PageWindow, StorageKind,
    SyncRun, SyncRunId, SyncStatus, Thread, ThreadId, ThreadMessage, parse_page,
};
pub use provider::{MailProvider, StaticProvider};
pub use query::{Browse, ThreadDetail, browse, open_attachment, thread_detail};
pub use service::ArchiveService;
pub use settings::{ArchiveSettings, DEFAULT_INLINE_THRESHOLD, PAGE_SIZE};
pub use storage::{
    ArchiveRepository, AttachmentRecords, BlobStore, FileBlobStore, InMemoryArchive,
    SqliteArchive, ThreadFilter, ThreadListing,
};
pub use sync::{CancelToken, SyncJob, SyncSupervisor};
