//! Sync engine: backup runs against a mail provider
//!
//! A run paginates the provider's thread list for a query, stores each
//! thread's attachments, then upserts the thread and its messages as one
//! unit. Runs are checkpointed per page and can be resumed.

mod cancel;
mod job;
mod supervisor;

pub use cancel::CancelToken;
pub use job::{SyncJob, archive_message, build_thread};
pub use supervisor::SyncSupervisor;
