//! Storage trait definitions

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    Attachment, AttachmentId, MailboxStats, PageWindow, SyncRun, SyncRunId, Thread, ThreadId,
    ThreadMessage,
};

/// Which threads a listing selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadFilter {
    /// Every thread of the owner
    All,
    /// Threads carrying the label
    Label(String),
    /// Threads whose subject, snippet or message content contains the text
    /// (ASCII case-insensitive)
    Search(String),
}

impl ThreadFilter {
    /// Resolve a browsing request into a filter
    ///
    /// A non-empty `search` wins over `label`. With both empty the first
    /// label of `labels` (lexicographic inventory) is used, or every thread
    /// when the owner has no labels.
    pub fn resolve(label: &str, search: &str, labels: &[String]) -> Self {
        if !search.is_empty() {
            return ThreadFilter::Search(search.to_string());
        }
        if !label.is_empty() {
            return ThreadFilter::Label(label.to_string());
        }
        match labels.first() {
            Some(first) => ThreadFilter::Label(first.clone()),
            None => ThreadFilter::All,
        }
    }
}

/// One window of a filtered thread listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadListing {
    /// Size of the filtered set before windowing
    pub total_count: usize,
    /// Threads inside the window, most recent first (ties by ID)
    pub threads: Vec<Thread>,
}

/// Attachment record as persisted: metadata plus the inline payload, if any
#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub attachment: Attachment,
    /// zstd-compressed payload for `StorageKind::Inline`
    pub inline_payload: Option<Vec<u8>>,
}

/// Trait for archive storage operations
///
/// Every thread and message operation is scoped to exactly one owner.
/// `upsert_thread` replaces a thread and its messages as one atomic unit;
/// readers never observe a partially written message list.
pub trait ArchiveRepository: Send + Sync {
    /// Insert or replace a thread and its full message list
    fn upsert_thread(&self, owner: &str, thread: Thread, messages: Vec<ThreadMessage>)
    -> Result<()>;

    /// Get a thread; `NotFound` if absent
    fn get_thread(&self, owner: &str, id: &ThreadId) -> Result<Thread>;

    /// Messages of a thread in provider order (empty if the thread is absent)
    fn get_thread_messages(&self, owner: &str, id: &ThreadId) -> Result<Vec<ThreadMessage>>;

    /// A thread and its messages from the same committed version
    ///
    /// `NotFound` if the thread is absent.
    fn get_thread_with_messages(
        &self,
        owner: &str,
        id: &ThreadId,
    ) -> Result<(Thread, Vec<ThreadMessage>)>;

    /// Check if a thread exists
    fn has_thread(&self, owner: &str, id: &ThreadId) -> Result<bool>;

    /// Union of labels across the owner's threads, in lexicographic order
    fn list_labels(&self, owner: &str) -> Result<Vec<String>>;

    /// Filter, order and window the owner's threads
    fn list_threads(
        &self,
        owner: &str,
        filter: &ThreadFilter,
        window: &PageWindow,
    ) -> Result<ThreadListing>;

    /// Aggregate statistics for the owner
    fn stats(&self, owner: &str) -> Result<MailboxStats>;

    /// List threads for a raw browsing request (label/search/page)
    fn list_threads_for_request(
        &self,
        owner: &str,
        label: &str,
        search: &str,
        page: i64,
    ) -> Result<ThreadListing> {
        let labels = if label.is_empty() && search.is_empty() {
            self.list_labels(owner)?
        } else {
            Vec::new()
        };
        let filter = ThreadFilter::resolve(label, search, &labels);
        self.list_threads(owner, &filter, &PageWindow::for_page(page))
    }

    // === Sync runs ===

    /// Persist a new run and return it with its assigned ID
    ///
    /// A Pending or Running run claims its owner: creating a second one
    /// while another is active fails with `SyncInProgress`, also when the
    /// active run belongs to another process sharing the storage.
    fn create_sync_run(&self, run: SyncRun) -> Result<SyncRun>;

    /// Save the current state of an existing run and refresh its heartbeat
    fn save_sync_run(&self, run: &SyncRun) -> Result<()>;

    /// Move a Failed or Cancelled run back to Pending, claiming its owner
    ///
    /// `NotFound` if absent, `InvalidInput` if the run is not resumable,
    /// `SyncInProgress` if the owner already has an active run.
    fn reopen_sync_run(&self, id: SyncRunId) -> Result<SyncRun>;

    /// Refresh the heartbeat of an active run
    fn touch_sync_run(&self, id: SyncRunId) -> Result<()>;

    /// Get a run; `NotFound` if absent
    fn get_sync_run(&self, id: SyncRunId) -> Result<SyncRun>;

    /// Runs of an owner, newest first
    fn list_sync_runs(&self, owner: &str) -> Result<Vec<SyncRun>>;

    /// Mark Pending/Running runs whose heartbeat is older than
    /// `stale_before` as Failed
    ///
    /// Runs kept alive by a live process are left alone. Returns the number
    /// of runs updated.
    fn fail_interrupted_runs(&self, stale_before: DateTime<Utc>) -> Result<usize>;
}

/// Trait for attachment record persistence
pub trait AttachmentRecords: Send + Sync {
    /// Insert a record unless one with the same ID exists
    ///
    /// Returns `false` when a record already existed (write-once).
    fn insert_attachment(&self, record: AttachmentRecord) -> Result<bool>;

    /// Get attachment metadata
    fn get_attachment(&self, id: &AttachmentId) -> Result<Option<Attachment>>;

    /// Get the compressed inline payload of an Inline attachment
    fn get_inline_payload(&self, id: &AttachmentId) -> Result<Option<Vec<u8>>>;
}
