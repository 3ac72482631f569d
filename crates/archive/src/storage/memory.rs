//! In-memory archive implementation
//!
//! Used by tests and by callers that want an ephemeral archive. Behaves like
//! `SqliteArchive`, including ASCII case-insensitive search.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use super::stats_cache::StatsCache;
use super::traits::{
    ArchiveRepository, AttachmentRecord, AttachmentRecords, ThreadFilter, ThreadListing,
};
use crate::error::{ArchiveError, Result};
use crate::models::{
    Attachment, AttachmentId, LabelCount, MailboxStats, PageWindow, SyncRun, SyncRunId, Thread,
    ThreadId, ThreadMessage,
};

/// A thread and its message list, replaced together
struct StoredThread {
    thread: Thread,
    messages: Vec<ThreadMessage>,
}

impl StoredThread {
    fn matches(&self, filter: &ThreadFilter) -> bool {
        match filter {
            ThreadFilter::All => true,
            ThreadFilter::Label(label) => self.thread.has_label(label),
            ThreadFilter::Search(search) => {
                let needle = search.to_ascii_lowercase();
                let hit = |text: &str| text.to_ascii_lowercase().contains(&needle);
                hit(&self.thread.subject)
                    || hit(&self.thread.snippet)
                    || self.messages.iter().any(|m| {
                        hit(&m.subject)
                            || hit(&m.snippet)
                            || m.body.text.as_deref().is_some_and(hit)
                    })
            }
        }
    }
}

#[derive(Default)]
struct State {
    /// owner -> thread ID -> stored thread
    threads: HashMap<String, BTreeMap<ThreadId, StoredThread>>,
    runs: BTreeMap<SyncRunId, SyncRun>,
    heartbeats: HashMap<SyncRunId, DateTime<Utc>>,
    next_run_id: i64,
    attachments: HashMap<AttachmentId, AttachmentRecord>,
}

/// In-memory implementation of `ArchiveRepository` and `AttachmentRecords`
///
/// One lock guards all state, so a thread and its messages are always
/// replaced together.
#[derive(Default)]
pub struct InMemoryArchive {
    state: RwLock<State>,
    stats_cache: StatsCache,
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

impl State {
    fn active_run(&self, owner: &str) -> Option<SyncRunId> {
        self.runs
            .values()
            .find(|run| run.owner == owner && !run.status.is_finished())
            .map(|run| run.id)
    }
}

impl ArchiveRepository for InMemoryArchive {
    fn upsert_thread(
        &self,
        owner: &str,
        thread: Thread,
        messages: Vec<ThreadMessage>,
    ) -> Result<()> {
        {
            let mut state = self.state.write()?;
            state
                .threads
                .entry(owner.to_string())
                .or_default()
                .insert(thread.id.clone(), StoredThread { thread, messages });
        }
        self.stats_cache.invalidate(owner);
        Ok(())
    }

    fn get_thread(&self, owner: &str, id: &ThreadId) -> Result<Thread> {
        let state = self.state.read()?;
        state
            .threads
            .get(owner)
            .and_then(|threads| threads.get(id))
            .map(|stored| stored.thread.clone())
            .ok_or_else(|| ArchiveError::not_found(format!("thread {}", id)))
    }

    fn get_thread_messages(&self, owner: &str, id: &ThreadId) -> Result<Vec<ThreadMessage>> {
        let state = self.state.read()?;
        Ok(state
            .threads
            .get(owner)
            .and_then(|threads| threads.get(id))
            .map(|stored| stored.messages.clone())
            .unwrap_or_default())
    }

    fn get_thread_with_messages(
        &self,
        owner: &str,
        id: &ThreadId,
    ) -> Result<(Thread, Vec<ThreadMessage>)> {
        let state = self.state.read()?;
        state
            .threads
            .get(owner)
            .and_then(|threads| threads.get(id))
            .map(|stored| (stored.thread.clone(), stored.messages.clone()))
            .ok_or_else(|| ArchiveError::not_found(format!("thread {}", id)))
    }

    fn has_thread(&self, owner: &str, id: &ThreadId) -> Result<bool> {
        let state = self.state.read()?;
        Ok(state
            .threads
            .get(owner)
            .is_some_and(|threads| threads.contains_key(id)))
    }

    fn list_labels(&self, owner: &str) -> Result<Vec<String>> {
        let state = self.state.read()?;
        let labels: BTreeSet<&String> = state
            .threads
            .get(owner)
            .into_iter()
            .flat_map(|threads| threads.values())
            .flat_map(|stored| stored.thread.labels.iter())
            .collect();
        Ok(labels.into_iter().cloned().collect())
    }

    fn list_threads(
        &self,
        owner: &str,
        filter: &ThreadFilter,
        window: &PageWindow,
    ) -> Result<ThreadListing> {
        let state = self.state.read()?;
        let mut matched: Vec<&Thread> = state
            .threads
            .get(owner)
            .into_iter()
            .flat_map(|threads| threads.values())
            .filter(|stored| stored.matches(filter))
            .map(|stored| &stored.thread)
            .collect();

        matched.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(ThreadListing {
            total_count: matched.len(),
            threads: matched
                .into_iter()
                .skip(window.offset())
                .take(window.limit())
                .cloned()
                .collect(),
        })
    }

    fn stats(&self, owner: &str) -> Result<MailboxStats> {
        if let Some(stats) = self.stats_cache.get(owner) {
            return Ok(stats);
        }

        let state = self.state.read()?;
        let mut stats = MailboxStats::default();
        let mut labels: BTreeMap<&str, usize> = BTreeMap::new();
        for stored in state.threads.get(owner).into_iter().flat_map(|t| t.values()) {
            stats.total_threads += 1;
            stats.total_messages += stored.messages.len();
            for label in &stored.thread.labels {
                *labels.entry(label).or_default() += 1;
            }
        }
        stats.labels = labels
            .into_iter()
            .map(|(label, threads)| LabelCount {
                label: label.to_string(),
                threads,
            })
            .collect();

        self.stats_cache.put(owner, stats.clone());
        Ok(stats)
    }

    fn create_sync_run(&self, mut run: SyncRun) -> Result<SyncRun> {
        let mut state = self.state.write()?;
        if !run.status.is_finished()
            && let Some(active) = state.active_run(&run.owner)
        {
            return Err(ArchiveError::SyncInProgress {
                owner: run.owner,
                run_id: active,
            });
        }
        state.next_run_id += 1;
        run.id = SyncRunId(state.next_run_id);
        state.runs.insert(run.id, run.clone());
        state.heartbeats.insert(run.id, Utc::now());
        Ok(run)
    }

    fn save_sync_run(&self, run: &SyncRun) -> Result<()> {
        let mut state = self.state.write()?;
        if !state.runs.contains_key(&run.id) {
            return Err(ArchiveError::not_found(format!("sync run {}", run.id)));
        }
        if !run.status.is_finished()
            && let Some(active) = state.active_run(&run.owner)
            && active != run.id
        {
            return Err(ArchiveError::SyncInProgress {
                owner: run.owner.clone(),
                run_id: active,
            });
        }
        state.runs.insert(run.id, run.clone());
        state.heartbeats.insert(run.id, Utc::now());
        Ok(())
    }

    fn reopen_sync_run(&self, id: SyncRunId) -> Result<SyncRun> {
        let mut state = self.state.write()?;
        let mut run = state
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| ArchiveError::not_found(format!("sync run {}", id)))?;
        if !run.status.is_resumable() {
            return Err(ArchiveError::InvalidInput {
                message: format!("sync run {} is {} and cannot be resumed", id, run.status.as_str()),
            });
        }
        if let Some(active) = state.active_run(&run.owner) {
            return Err(ArchiveError::SyncInProgress {
                owner: run.owner,
                run_id: active,
            });
        }

        run.reopen();
        state.runs.insert(id, run.clone());
        state.heartbeats.insert(id, Utc::now());
        Ok(run)
    }

    fn touch_sync_run(&self, id: SyncRunId) -> Result<()> {
        let mut state = self.state.write()?;
        if !state.runs.contains_key(&id) {
            return Err(ArchiveError::not_found(format!("sync run {}", id)));
        }
        state.heartbeats.insert(id, Utc::now());
        Ok(())
    }

    fn get_sync_run(&self, id: SyncRunId) -> Result<SyncRun> {
        let state = self.state.read()?;
        state
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| ArchiveError::not_found(format!("sync run {}", id)))
    }

    fn list_sync_runs(&self, owner: &str) -> Result<Vec<SyncRun>> {
        let state = self.state.read()?;
        Ok(state
            .runs
            .values()
            .rev()
            .filter(|run| run.owner == owner)
            .cloned()
            .collect())
    }

    fn fail_interrupted_runs(&self, stale_before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write()?;
        let State {
            runs, heartbeats, ..
        } = &mut *state;
        let mut count = 0;
        for run in runs.values_mut() {
            let stale = heartbeats
                .get(&run.id)
                .is_none_or(|beat| *beat < stale_before);
            if !run.status.is_finished() && stale {
                run.mark_failed("interrupted");
                count += 1;
            }
        }
        Ok(count)
    }
}

impl AttachmentRecords for InMemoryArchive {
    fn insert_attachment(&self, record: AttachmentRecord) -> Result<bool> {
        let mut state = self.state.write()?;
        if state.attachments.contains_key(&record.attachment.id) {
            return Ok(false);
        }
        state
            .attachments
            .insert(record.attachment.id.clone(), record);
        Ok(true)
    }

    fn get_attachment(&self, id: &AttachmentId) -> Result<Option<Attachment>> {
        let state = self.state.read()?;
        Ok(state.attachments.get(id).map(|r| r.attachment.clone()))
    }

    fn get_inline_payload(&self, id: &AttachmentId) -> Result<Option<Vec<u8>>> {
        let state = self.state.read()?;
        Ok(state
            .attachments
            .get(id)
            .and_then(|r| r.inline_payload.clone()))
    }
}
