//! Query API for the browsing interface
//!
//! Read-only composition over the archive repository and attachment store.
//! Never touches the mail provider.

mod threads;

pub use threads::{Browse, ThreadDetail, browse, open_attachment, thread_detail};
