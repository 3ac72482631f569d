//! Storage traits and implementations
//!
//! `ArchiveRepository` holds threads, messages and sync runs;
//! `AttachmentRecords` holds attachment metadata and inline payloads;
//! `BlobStore` holds large attachment payloads.

mod blob;
mod blob_file;
mod memory;
mod sqlite;
mod stats_cache;
mod traits;

pub use blob::{BlobStore, ReadSeek};
pub use blob_file::FileBlobStore;
pub use memory::InMemoryArchive;
pub use sqlite::SqliteArchive;
pub use stats_cache::StatsCache;
pub use traits::{
    ArchiveRepository, AttachmentRecord, AttachmentRecords, ThreadFilter, ThreadListing,
};
