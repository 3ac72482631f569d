//! Attachment store: two-tier placement and streaming reads

mod sniff;
mod store;

pub use sniff::{SNIFF_LEN, sniff_content_type};
pub use store::{AttachmentDownload, AttachmentStore, NewAttachment};
