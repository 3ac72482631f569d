//! In-memory mail provider
//!
//! Serves a fixed set of threads split into pages. Used by tests to drive
//! the sync engine without network access; supports injected failures and a
//! gate that holds provider calls until released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use super::{AttachmentPayload, MailProvider, RemoteThread, ThreadPage};
use crate::error::{ArchiveError, ProviderFailure, Result};
use crate::models::{MessageId, ThreadId};

/// Blocks provider calls while closed
#[derive(Default)]
pub struct ProviderGate {
    closed: Mutex<bool>,
    changed: Condvar,
}

impl ProviderGate {
    /// Hold subsequent provider calls
    pub fn close(&self) {
        if let Ok(mut closed) = self.closed.lock() {
            *closed = true;
        }
    }

    /// Let held and subsequent provider calls proceed
    pub fn open(&self) {
        if let Ok(mut closed) = self.closed.lock() {
            *closed = false;
        }
        self.changed.notify_all();
    }

    fn wait(&self) {
        let Ok(mut closed) = self.closed.lock() else {
            return;
        };
        while *closed {
            closed = match self.changed.wait(closed) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
    }
}

/// In-memory implementation of MailProvider
pub struct StaticProvider {
    /// Thread IDs per page; page `i > 0` is requested with token `page-{i}`
    pages: RwLock<Vec<Vec<ThreadId>>>,
    threads: RwLock<HashMap<String, RemoteThread>>,
    /// (message id, provider attachment id) -> payload
    attachments: RwLock<HashMap<(String, String), Vec<u8>>>,
    failing_threads: RwLock<HashSet<String>>,
    gate: Arc<ProviderGate>,
    thread_fetches: AtomicUsize,
    attachment_fetches: AtomicUsize,
}

impl StaticProvider {
    /// Create a provider with no threads
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(Vec::new()),
            threads: RwLock::new(HashMap::new()),
            attachments: RwLock::new(HashMap::new()),
            failing_threads: RwLock::new(HashSet::new()),
            gate: Arc::new(ProviderGate::default()),
            thread_fetches: AtomicUsize::new(0),
            attachment_fetches: AtomicUsize::new(0),
        }
    }

    /// Add a page holding the given threads; pages are served in insertion order
    pub fn push_page(&self, threads: Vec<RemoteThread>) {
        let ids = threads.iter().map(|t| t.id.clone()).collect();
        if let Ok(mut map) = self.threads.write() {
            for thread in threads {
                map.insert(thread.id.0.clone(), thread);
            }
        }
        if let Ok(mut pages) = self.pages.write() {
            pages.push(ids);
        }
    }

    /// Register a payload for `get_attachment`
    pub fn put_attachment(&self, message_id: &str, attachment_id: &str, data: Vec<u8>) {
        if let Ok(mut map) = self.attachments.write() {
            map.insert((message_id.to_string(), attachment_id.to_string()), data);
        }
    }

    /// Make `get_thread` fail for this thread until [`Self::clear_failures`]
    pub fn fail_thread(&self, thread_id: &str) {
        if let Ok(mut set) = self.failing_threads.write() {
            set.insert(thread_id.to_string());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut set) = self.failing_threads.write() {
            set.clear();
        }
    }

    /// Gate consulted before every `get_thread` call
    pub fn gate(&self) -> Arc<ProviderGate> {
        self.gate.clone()
    }

    /// Number of `get_thread` calls served so far
    pub fn thread_fetches(&self) -> usize {
        self.thread_fetches.load(Ordering::SeqCst)
    }

    /// Number of `get_attachment` calls served so far
    pub fn attachment_fetches(&self) -> usize {
        self.attachment_fetches.load(Ordering::SeqCst)
    }

    fn page_index(token: Option<&str>) -> Result<usize> {
        match token {
            None => Ok(0),
            Some(token) => token
                .strip_prefix("page-")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| {
                    ArchiveError::provider(
                        ProviderFailure::Malformed,
                        format!("unknown page token {}", token),
                    )
                }),
        }
    }
}

impl Default for StaticProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MailProvider for StaticProvider {
    fn list_threads(
        &self,
        _owner: &str,
        _query: &str,
        page_token: Option<&str>,
    ) -> Result<ThreadPage> {
        let index = Self::page_index(page_token)?;
        let pages = self.pages.read()?;

        let threads = pages.get(index).cloned().unwrap_or_default();
        let next_page_token = (index + 1 < pages.len()).then(|| format!("page-{}", index + 1));

        Ok(ThreadPage {
            threads,
            next_page_token,
        })
    }

    fn get_thread(&self, _owner: &str, thread_id: &ThreadId) -> Result<RemoteThread> {
        self.gate.wait();
        self.thread_fetches.fetch_add(1, Ordering::SeqCst);

        if self.failing_threads.read()?.contains(thread_id.as_str()) {
            return Err(ArchiveError::provider(
                ProviderFailure::Network,
                format!("injected failure for thread {}", thread_id),
            ));
        }

        self.threads
            .read()?
            .get(thread_id.as_str())
            .cloned()
            .ok_or_else(|| {
                ArchiveError::provider(
                    ProviderFailure::Malformed,
                    format!("thread {} vanished", thread_id),
                )
            })
    }

    fn get_attachment(
        &self,
        _owner: &str,
        message_id: &MessageId,
        attachment_id: &str,
    ) -> Result<AttachmentPayload> {
        self.attachment_fetches.fetch_add(1, Ordering::SeqCst);

        let key = (message_id.0.clone(), attachment_id.to_string());
        self.attachments
            .read()?
            .get(&key)
            .cloned()
            .map(AttachmentPayload::new)
            .ok_or_else(|| {
                ArchiveError::provider(
                    ProviderFailure::Malformed,
                    format!("attachment {} of {} missing", attachment_id, message_id.as_str()),
                )
            })
    }
}
