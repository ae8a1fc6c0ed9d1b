//! Blob storage for uploaded files.
//!
//! Uploaded files are opaque ciphertext stored flat under one directory with
//! relay-generated names. Files older than the retention window are removed by
//! a periodic sweep, except while a download of that file is in progress.

mod disk;

pub use disk::{BlobBatch, BlobStore, Download, DownloadGuard, UploadWriter};

/// A blob written to the storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Generated name, also the download path segment.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Files examined.
    pub scanned: u64,
    /// Expired files removed.
    pub deleted: u64,
    /// Expired files kept because a download was in progress.
    pub deferred: u64,
    /// Files that could not be inspected or removed.
    pub errors: u64,
}
