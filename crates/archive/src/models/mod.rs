//! Domain models for archive entities

mod attachment;
mod message;
mod paging;
mod stats;
mod sync_run;
mod thread;

pub use attachment::{Attachment, AttachmentId, StorageKind};
pub use message::{EmailAddress, Header, MessageBody, MessageId, ThreadMessage, ThreadMessageBuilder};
pub use paging::{PageWindow, parse_page};
pub use stats::{LabelCount, MailboxStats};
pub use sync_run::{SyncRun, SyncRunId, SyncStats, SyncStatus};
pub use thread::{Thread, ThreadId};
