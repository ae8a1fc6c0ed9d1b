//! Filesystem blob store.

use super::{StoredBlob, SweepReport};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use axum::body::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::Stream;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

/// Suffix of files still being written.
const PART_SUFFIX: &str = ".part";

/// Read size for streamed downloads.
const READ_CHUNK_SIZE: usize = 64 * 1024;

const MAX_NAME_LEN: usize = 255;

/// Blob directory plus the download reference counts that keep the
/// retention sweep away from files being served.
#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
    max_file_size: u64,
    retention: Duration,
    downloads: DashMap<String, usize>,
}

impl BlobStore {
    /// Open (and create if needed) the blob directory.
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.upload_dir)?;
        let root = std::fs::canonicalize(&config.upload_dir)?;
        tracing::info!("Blob storage at {}", root.display());

        Ok(Self {
            root,
            max_file_size: config.max_file_size,
            retention: config.retention(),
            downloads: DashMap::new(),
        })
    }

    /// Canonical storage directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Largest accepted single file.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Age after which a blob may be swept.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Map a blob name to its path.
    ///
    /// The name must be a single plain path segment. Anything that could
    /// address a file outside the root (separators, `..`, hidden names) is
    /// rejected with `Forbidden`.
    pub fn resolve(&self, name: &str) -> StorageResult<PathBuf> {
        let forbidden = || StorageError::Forbidden {
            name: name.to_string(),
        };

        if name.is_empty()
            || name.len() > MAX_NAME_LEN
            || name.starts_with('.')
            || name.contains(['/', '\\', '\0'])
        {
            return Err(forbidden());
        }

        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(segment)), None) if segment.to_str() == Some(name) => {
                Ok(self.root.join(name))
            }
            _ => Err(forbidden()),
        }
    }

    /// Start writing a new blob under a generated name.
    pub async fn begin_upload(&self) -> StorageResult<UploadWriter> {
        let name = Uuid::new_v4().simple().to_string();
        let final_path = self.root.join(&name);
        let part_path = self.root.join(format!("{name}{PART_SUFFIX}"));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await?;

        Ok(UploadWriter {
            name,
            part_path,
            final_path,
            file,
            written: 0,
            limit: self.max_file_size,
            finished: false,
        })
    }

    /// Empty batch for the blobs of one message.
    pub fn batch(&self) -> BlobBatch {
        BlobBatch {
            root: self.root.clone(),
            blobs: Vec::new(),
            committed: false,
        }
    }

    /// Open a blob for streaming.
    ///
    /// The returned download holds a reference count on the name until it is
    /// dropped, which defers any retention deletion of that file.
    pub async fn open_download(self: &Arc<Self>, name: &str) -> StorageResult<Download> {
        let path = self.resolve(name)?;
        let not_found = || StorageError::NotFound {
            name: name.to_string(),
        };
        if name.ends_with(PART_SUFFIX) {
            return Err(not_found());
        }

        // Count first: a sweep that runs after this point sees the reference,
        // one that ran before has already removed the file and the open fails.
        let guard = DownloadGuard::acquire(Arc::clone(self), name);

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };

        let canonical = tokio::fs::canonicalize(&path).await?;
        if !canonical.starts_with(&self.root) {
            tracing::warn!("Blob {} resolves outside storage root", name);
            return Err(StorageError::Forbidden {
                name: name.to_string(),
            });
        }

        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(not_found());
        }

        Ok(Download {
            file,
            size: metadata.len(),
            done: false,
            _guard: guard,
        })
    }

    /// Downloads currently streaming `name`.
    pub fn active_downloads(&self, name: &str) -> usize {
        self.downloads.get(name).map(|count| *count).unwrap_or(0)
    }

    /// Run a retention sweep on the blocking pool.
    pub async fn sweep_expired(self: &Arc<Self>) -> SweepReport {
        let store = Arc::clone(self);
        match tokio::task::spawn_blocking(move || store.sweep_expired_at(SystemTime::now())).await
        {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Retention sweep task failed: {}", e);
                SweepReport {
                    errors: 1,
                    ..SweepReport::default()
                }
            }
        }
    }

    /// Delete every file whose age at `now` reaches the retention window.
    ///
    /// A file with an active download is skipped and picked up by a later
    /// sweep. The download count is checked and the file deleted under the
    /// same map entry lock, so no download can start in between. Failures on
    /// one file are logged and do not stop the sweep.
    pub fn sweep_expired_at(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("Failed to read {}: {}", self.root.display(), e);
                report.errors += 1;
                return report;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Failed to read directory entry: {}", e);
                    report.errors += 1;
                    continue;
                }
            };
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };

            let modified = match entry.metadata().and_then(|m| {
                if m.is_file() {
                    m.modified().map(Some)
                } else {
                    Ok(None)
                }
            }) {
                Ok(Some(modified)) => modified,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Failed to stat {}: {}", name, e);
                    report.errors += 1;
                    continue;
                }
            };

            report.scanned += 1;
            let age = now.duration_since(modified).unwrap_or_default();
            if age < self.retention {
                continue;
            }

            match self.downloads.entry(name.clone()) {
                Entry::Occupied(active) => {
                    tracing::debug!(
                        "Deferring deletion of {} ({} active downloads)",
                        name,
                        active.get()
                    );
                    report.deferred += 1;
                }
                Entry::Vacant(_slot) => match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        tracing::debug!("Deleted expired blob {}", name);
                        report.deleted += 1;
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!("Failed to delete {}: {}", name, e);
                        report.errors += 1;
                    }
                },
            }
        }

        report
    }
}

/// Reference count on one blob for the lifetime of a download.
#[derive(Debug)]
pub struct DownloadGuard {
    store: Arc<BlobStore>,
    name: String,
}

impl DownloadGuard {
    fn acquire(store: Arc<BlobStore>, name: &str) -> Self {
        *store.downloads.entry(name.to_string()).or_insert(0) += 1;
        Self {
            store,
            name: name.to_string(),
        }
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        if let Entry::Occupied(mut active) = self.store.downloads.entry(self.name.clone()) {
            *active.get_mut() -= 1;
            if *active.get() == 0 {
                active.remove();
            }
        }
    }
}

/// An open blob ready to stream.
#[derive(Debug)]
pub struct Download {
    file: File,
    size: u64,
    done: bool,
    _guard: DownloadGuard,
}

impl Download {
    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Stream the file in chunks.
    ///
    /// The reference count is released when the stream finishes or is
    /// dropped, e.g. because the client disconnected.
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        futures_util::stream::unfold(self, |mut download| async move {
            if download.done {
                return None;
            }
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            match download.file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), download))
                }
                Err(e) => {
                    download.done = true;
                    Some((Err(e), download))
                }
            }
        })
    }
}

/// In-progress upload of one blob.
///
/// Bytes go to `<name>.part`; [`UploadWriter::finish`] renames it into place.
/// Dropping an unfinished writer removes the partial file.
#[derive(Debug)]
pub struct UploadWriter {
    name: String,
    part_path: PathBuf,
    final_path: PathBuf,
    file: File,
    written: u64,
    limit: u64,
    finished: bool,
}

impl UploadWriter {
    /// Generated blob name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append a chunk, failing with `TooLarge` once the file cap is passed.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> StorageResult<()> {
        let total = self.written + chunk.len() as u64;
        if total > self.limit {
            return Err(StorageError::TooLarge { limit: self.limit });
        }
        self.file.write_all(chunk).await?;
        self.written = total;
        Ok(())
    }

    /// Flush and move the blob to its final name.
    pub async fn finish(mut self) -> StorageResult<StoredBlob> {
        self.file.flush().await?;
        tokio::fs::rename(&self.part_path, &self.final_path).await?;
        self.finished = true;
        Ok(StoredBlob {
            name: self.name.clone(),
            size: self.written,
        })
    }
}

impl Drop for UploadWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match std::fs::remove_file(&self.part_path) {
            Ok(()) => tracing::debug!("Discarded partial upload {}", self.name),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove partial upload {}: {}", self.name, e),
        }
    }
}

/// Blobs written for one message.
///
/// Unless [`BlobBatch::commit`] is called, dropping the batch deletes every
/// blob in it. A send that fails or is cancelled after some files were
/// written leaves nothing behind.
#[derive(Debug)]
pub struct BlobBatch {
    root: PathBuf,
    blobs: Vec<StoredBlob>,
    committed: bool,
}

impl BlobBatch {
    /// Add a finished blob.
    pub fn push(&mut self, blob: StoredBlob) {
        self.blobs.push(blob);
    }

    /// Blobs in upload order.
    pub fn blobs(&self) -> &[StoredBlob] {
        &self.blobs
    }

    /// Number of blobs.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether no blob was written.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Keep the blobs.
    pub fn commit(mut self) -> Vec<StoredBlob> {
        self.committed = true;
        std::mem::take(&mut self.blobs)
    }
}

impl Drop for BlobBatch {
    fn drop(&mut self) {
        if self.committed || self.blobs.is_empty() {
            return;
        }
        for blob in &self.blobs {
            if let Err(e) = std::fs::remove_file(self.root.join(&blob.name)) {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!("Failed to remove orphaned blob {}: {}", blob.name, e);
                }
            }
        }
        tracing::debug!("Discarded {} uncommitted blobs", self.blobs.len());
    }
}
