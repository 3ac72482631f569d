//! One backup run: paginate the provider and ingest every thread

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use super::cancel::CancelToken;
use crate::attachments::{AttachmentStore, NewAttachment};
use crate::error::{ArchiveError, Result};
use crate::models::{
    AttachmentId, EmailAddress, SyncRun, SyncStats, Thread, ThreadId, ThreadMessage,
};
use crate::provider::{AttachmentSource, MailProvider, RemoteMessage};
use crate::storage::ArchiveRepository;

/// Collaborators and limits for a single sync run
pub struct SyncJob<'a> {
    pub provider: &'a dyn MailProvider,
    pub repo: &'a dyn ArchiveRepository,
    pub attachments: &'a AttachmentStore,
    pub cancel: &'a CancelToken,
    /// Maximum wall time for the run; `None` disables the check
    pub deadline: Option<Duration>,
}

impl SyncJob<'_> {
    /// Ingest every thread matching `run.query`, starting at `run.page_token`
    ///
    /// The run record is saved after each fully ingested page with
    /// `page_token` set to the next page, so a failed run can resume from the
    /// first page it did not finish. Returns on the first provider or storage
    /// error, on cancellation, or when the deadline passes; the caller decides
    /// the final status.
    pub fn run(&self, run: &mut SyncRun) -> Result<()> {
        let started = Instant::now();
        let mut page_token = run.page_token.clone();

        loop {
            self.check_continue(started)?;

            let page = self
                .provider
                .list_threads(&run.owner, &run.query, page_token.as_deref())?;
            log::debug!(
                "[SYNC] Run {}: page {} lists {} threads",
                run.id,
                run.stats.pages_completed + 1,
                page.threads.len()
            );

            for thread_id in &page.threads {
                self.check_continue(started)?;
                self.ingest_thread(&run.owner, thread_id, &mut run.stats)?;
            }

            run.stats.pages_completed += 1;
            run.page_token = page.next_page_token;
            self.repo.save_sync_run(run)?;

            match &run.page_token {
                Some(token) => page_token = Some(token.clone()),
                None => return Ok(()),
            }
        }
    }

    fn check_continue(&self, started: Instant) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && started.elapsed() >= deadline
        {
            return Err(ArchiveError::DeadlineExceeded {
                secs: deadline.as_secs(),
            });
        }
        Ok(())
    }

    /// Fetch one thread, store its attachments, then upsert it as a unit
    fn ingest_thread(&self, owner: &str, thread_id: &ThreadId, stats: &mut SyncStats) -> Result<()> {
        let remote = self.provider.get_thread(owner, thread_id)?;
        if remote.messages.is_empty() {
            log::warn!("[SYNC] Thread {} has no messages, skipping", remote.id);
            return Ok(());
        }

        let mut messages = Vec::with_capacity(remote.messages.len());
        for message in remote.messages {
            let refs = self.store_attachments(owner, &message, stats)?;
            messages.push(archive_message(message, refs));
        }

        let thread = build_thread(&remote.id, &messages);
        let message_count = messages.len();
        self.repo.upsert_thread(owner, thread, messages)?;

        stats.threads_synced += 1;
        stats.messages_synced += message_count;
        Ok(())
    }

    /// Store every attachment of a message; already stored IDs are not refetched
    fn store_attachments(
        &self,
        owner: &str,
        message: &RemoteMessage,
        stats: &mut SyncStats,
    ) -> Result<Vec<AttachmentId>> {
        let mut refs = Vec::with_capacity(message.attachments.len());

        for part in &message.attachments {
            let id = AttachmentId::for_part(&message.id, &part.part_id);
            if self.attachments.contains(&id)? {
                stats.attachments_skipped += 1;
                refs.push(id);
                continue;
            }

            let fetched;
            let (payload, announced): (&[u8], u64) = match &part.source {
                AttachmentSource::Embedded(data) => (data, part.size),
                AttachmentSource::Remote(attachment_id) => {
                    fetched = self
                        .provider
                        .get_attachment(owner, &message.id, attachment_id)?;
                    let announced = if fetched.size > 0 { fetched.size } else { part.size };
                    (&fetched.data, announced)
                }
            };
            // Zero means the provider did not announce a size
            if announced > 0 && announced != payload.len() as u64 {
                log::warn!(
                    "[SYNC] Attachment {} ({}): announced {} bytes, received {}",
                    id,
                    part.filename,
                    announced,
                    payload.len()
                );
                stats.size_mismatches += 1;
            }

            self.attachments.put(
                NewAttachment {
                    id: id.clone(),
                    owner: owner.to_string(),
                    message_id: message.id.clone(),
                    filename: part.filename.clone(),
                    headers: part.headers.clone(),
                },
                payload,
            )?;
            stats.attachments_stored += 1;
            refs.push(id);
        }

        Ok(refs)
    }
}

/// Convert a provider message into its archived form
pub fn archive_message(message: RemoteMessage, attachment_refs: Vec<AttachmentId>) -> ThreadMessage {
    let header = |name: &str| {
        message
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    };
    let from = header("From").map(|v| EmailAddress::parse(&v));
    let subject = header("Subject").unwrap_or_default();

    let mut builder = ThreadMessage::builder(message.id, message.thread_id)
        .subject(subject)
        .snippet(message.snippet)
        .received_at(message.received_at)
        .label_ids(message.label_ids)
        .body_text(message.body.text)
        .body_html(message.body.html)
        .attachment_refs(attachment_refs);
    if let Some(from) = from {
        builder = builder.from(from);
    }
    builder.headers(message.headers).build()
}

/// Derive thread fields from its messages (in provider order)
///
/// Subject and sender come from the first message, the snippet from the
/// most recent one; labels are the union over all messages.
pub fn build_thread(id: &ThreadId, messages: &[ThreadMessage]) -> Thread {
    let first = messages.first();
    let latest = messages.iter().max_by_key(|m| m.received_at);

    let subject = match first {
        Some(m) if !m.subject.is_empty() => m.subject.clone(),
        _ => "(no subject)".to_string(),
    };
    let snippet = latest.map(|m| m.snippet.clone()).unwrap_or_default();
    let last_message_at = latest.map(|m| m.received_at).unwrap_or_default();
    let labels: BTreeSet<&str> = messages
        .iter()
        .flat_map(|m| m.label_ids.iter().map(String::as_str))
        .collect();

    let thread = Thread::new(id.clone(), subject, snippet, last_message_at, messages.len())
        .with_labels(labels);
    match first {
        Some(m) => thread.with_sender(m.from.name.clone(), m.from.email.clone()),
        None => thread,
    }
}
