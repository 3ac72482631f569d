//! Browsing, single-thread and attachment queries

use serde::{Deserialize, Serialize};

use crate::attachments::{AttachmentDownload, AttachmentStore};
use crate::error::Result;
use crate::models::{AttachmentId, MailboxStats, PageWindow, Thread, ThreadId, ThreadMessage};
use crate::storage::{ArchiveRepository, ThreadFilter};

/// One page of the browsing view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Browse {
    /// Size of the filtered set before windowing
    pub total_count: usize,
    pub window: PageWindow,
    pub threads: Vec<Thread>,
    /// The owner's label inventory, lexicographic
    pub labels: Vec<String>,
    pub stats: MailboxStats,
    /// Requested label, or the default label when neither label nor search
    /// was given
    pub label: String,
    /// Requested search text, unchanged
    pub search: String,
}

/// A thread with all of its messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadDetail {
    pub thread: Thread,
    /// Messages in provider order
    pub messages: Vec<ThreadMessage>,
    /// The owner's label inventory, lexicographic
    pub labels: Vec<String>,
}

/// Answer a browsing request
///
/// A non-empty `search` filters on subject, snippet and body text and
/// ignores `label`. With neither given, the first label of the inventory is
/// used. Negative pages are treated as page 0.
pub fn browse(
    repo: &dyn ArchiveRepository,
    owner: &str,
    label: &str,
    search: &str,
    page: i64,
) -> Result<Browse> {
    let labels = repo.list_labels(owner)?;
    let filter = ThreadFilter::resolve(label, search, &labels);
    let window = PageWindow::for_page(page);

    let listing = repo.list_threads(owner, &filter, &window)?;
    let stats = repo.stats(owner)?;

    let label = match (&filter, label.is_empty()) {
        (ThreadFilter::Label(resolved), true) => resolved.clone(),
        _ => label.to_string(),
    };
    log::debug!(
        "[QUERY] Browse {} label={:?} search={:?} page={}: {} of {}",
        owner,
        label,
        search,
        window.next_page - 1,
        listing.threads.len(),
        listing.total_count
    );

    Ok(Browse {
        total_count: listing.total_count,
        window,
        threads: listing.threads,
        labels,
        stats,
        label,
        search: search.to_string(),
    })
}

/// Load a thread and its messages; `NotFound` if the owner has no such thread
pub fn thread_detail(
    repo: &dyn ArchiveRepository,
    owner: &str,
    thread_id: &ThreadId,
) -> Result<ThreadDetail> {
    let (thread, messages) = repo.get_thread_with_messages(owner, thread_id)?;
    let labels = repo.list_labels(owner)?;
    Ok(ThreadDetail {
        thread,
        messages,
        labels,
    })
}

/// Open an attachment for download
///
/// `NotFound` for an unknown ID, `StorageUnavailable` when the blob backend
/// cannot be read.
pub fn open_attachment(store: &AttachmentStore, id: &AttachmentId) -> Result<AttachmentDownload> {
    store.open_stream(id)
}
