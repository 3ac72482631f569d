//! Wiring of the on-disk archive

use std::sync::Arc;

use crate::attachments::{AttachmentDownload, AttachmentStore};
use crate::error::Result;
use crate::models::{AttachmentId, ThreadId};
use crate::provider::MailProvider;
use crate::query::{self, Browse, ThreadDetail};
use crate::settings::ArchiveSettings;
use crate::storage::{ArchiveRepository, FileBlobStore, SqliteArchive};
use crate::sync::SyncSupervisor;

/// The archive under `settings.data_dir`: SQLite repository, blob directory
/// and the attachment store over both
pub struct ArchiveService {
    repo: Arc<SqliteArchive>,
    attachments: Arc<AttachmentStore>,
    settings: ArchiveSettings,
}

impl ArchiveService {
    pub fn open(settings: ArchiveSettings) -> Result<Self> {
        let repo = Arc::new(SqliteArchive::open(settings.database_path())?);
        let blobs = Arc::new(FileBlobStore::new(settings.blob_path())?);
        let attachments = Arc::new(AttachmentStore::new(
            repo.clone(),
            blobs,
            settings.inline_threshold_bytes,
        ));
        log::info!("[STORE] Archive opened at {}", settings.data_dir.display());
        Ok(Self {
            repo,
            attachments,
            settings,
        })
    }

    pub fn settings(&self) -> &ArchiveSettings {
        &self.settings
    }

    pub fn repository(&self) -> Arc<dyn ArchiveRepository> {
        self.repo.clone()
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    /// Supervisor running sync jobs against `provider` into this archive
    pub fn supervisor(&self, provider: Arc<dyn MailProvider>) -> SyncSupervisor {
        SyncSupervisor::new(
            provider,
            self.repo.clone(),
            self.attachments.clone(),
            self.settings.job_deadline(),
        )
        .with_run_lease(self.settings.run_lease())
    }

    pub fn browse(&self, owner: &str, label: &str, search: &str, page: i64) -> Result<Browse> {
        query::browse(self.repo.as_ref(), owner, label, search, page)
    }

    pub fn thread(&self, owner: &str, thread_id: &ThreadId) -> Result<ThreadDetail> {
        query::thread_detail(self.repo.as_ref(), owner, thread_id)
    }

    pub fn attachment(&self, id: &AttachmentId) -> Result<AttachmentDownload> {
        query::open_attachment(&self.attachments, id)
    }
}
