//! Content-addressed blob storage
//!
//! Stores blobs in a sharded directory tree using the content hash as the
//! filename:
//!
//! ```text
//! <root>/
//! ├── 2c/
//! │   └── 2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824
//! └── tmp/
//!     └── k3v9x0q2m8a1c7d4   # staging file of an in-flight upload
//! ```
//!
//! Uploads stream into a staging file while being hashed, then get published
//! under their final name in one atomic filesystem step. A shard directory
//! exists only while it holds at least one blob.

use crate::error::StorageError;
use crate::identifier::{BlobId, HashAlgorithm, SHARD_PREFIX_LEN};
use crate::publish_lock::PublishLocks;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, warn};

/// Default read/write chunk size (1MB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Name of the staging directory under the store root
pub const STAGING_DIR: &str = "tmp";

/// Length of a random staging file name
const STAGING_NAME_LEN: usize = 16;

const STAGING_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Attempts at publishing when a concurrent delete removes the shard directory
const PUBLISH_ATTEMPTS: usize = 3;

/// How a finished staging file becomes visible under its final name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStrategy {
    /// `link(2)` into place: fails atomically if the final name exists
    #[default]
    HardLink,
    /// Existence check plus rename, serialized by a per-identifier lock
    LockedRename,
}

/// Blob store settings
#[derive(Debug, Clone)]
pub struct BlobStoreConfig {
    pub root_dir: PathBuf,
    pub chunk_size: usize,
    pub hash_algorithm: HashAlgorithm,
    pub publish_strategy: PublishStrategy,
}

impl BlobStoreConfig {
    pub fn new<P: AsRef<Path>>(root_dir: P) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_path_buf(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            hash_algorithm: HashAlgorithm::default(),
            publish_strategy: PublishStrategy::default(),
        }
    }
}

/// Result of storing a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Published a new blob
    Stored(BlobId),
    /// Identical content was already present; the upload was discarded
    AlreadyExists(BlobId),
}

impl StoreOutcome {
    pub fn id(&self) -> &BlobId {
        match self {
            StoreOutcome::Stored(id) | StoreOutcome::AlreadyExists(id) => id,
        }
    }
}

/// Result of deleting a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Storage statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub total_blobs: u64,
    pub total_bytes: u64,
    pub shard_dirs: u64,
    pub suppressed_cleanup_errors: u64,
}

/// An opened blob, ready to stream
///
/// Holds the file handle, so on POSIX filesystems the bytes stay readable
/// even if the blob is deleted mid-read. Filesystems that refuse to unlink
/// open files (Windows) make the concurrent delete fail instead; that
/// failure is absorbed by the best-effort delete policy.
#[derive(Debug)]
pub struct BlobReader {
    file: File,
    len: u64,
}

impl BlobReader {
    /// Exact payload size in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the whole blob into memory
    pub async fn read_to_vec(mut self) -> Result<Vec<u8>, StorageError> {
        let mut data = Vec::with_capacity(self.len as usize);
        self.file.read_to_end(&mut data).await?;
        Ok(data)
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

/// In-flight upload buffer under `<root>/tmp`
///
/// Removed on drop unless disarmed, so every early return or error path
/// cleans up after itself.
struct StagingFile {
    path: PathBuf,
    file: Option<File>,
    armed: bool,
}

impl StagingFile {
    async fn create(staging_dir: &Path) -> Result<Self, StorageError> {
        loop {
            let path = staging_dir.join(random_staging_name());
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    return Ok(Self {
                        path,
                        file: Some(file),
                        armed: true,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn write_all(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        match self.file.as_mut() {
            Some(file) => Ok(file.write_all(chunk).await?),
            None => Err(io::Error::new(io::ErrorKind::Other, "staging file already closed").into()),
        }
    }

    /// Flush to disk and close the handle before publishing
    async fn finish(&mut self) -> Result<(), StorageError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// The file now lives under another name; nothing left to clean up
    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Remove the staging name unless it was renamed into place
    async fn discard(&mut self) {
        self.file.take();
        if !self.armed {
            return;
        }
        self.armed = false;

        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove staging file");
            }
        }
    }
}

/// Only reached when a store future is dropped before `discard` ran
impl Drop for StagingFile {
    fn drop(&mut self) {
        self.file.take();
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove staging file");
                }
            }
        }
    }
}

/// Removes a shard directory created for a publish that was cancelled
///
/// `remove_dir` refuses non-empty directories, so a shard that a concurrent
/// store filled in the meantime survives.
struct ShardCleanup<'a> {
    dir: &'a Path,
    armed: bool,
}

impl Drop for ShardCleanup<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_dir(self.dir) {
            Ok(()) => debug!(path = %self.dir.display(), "Removed shard of cancelled publish"),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::DirectoryNotEmpty
                ) => {}
            Err(e) => {
                warn!(path = %self.dir.display(), error = %e, "Failed to remove shard directory")
            }
        }
    }
}

fn random_staging_name() -> String {
    let mut rng = rand::thread_rng();
    (0..STAGING_NAME_LEN)
        .map(|_| STAGING_CHARSET[rng.gen_range(0..STAGING_CHARSET.len())] as char)
        .collect()
}

/// Blob storage manager
///
/// Safe to share across tasks; all synchronization is pushed down to atomic
/// filesystem operations, plus [`PublishLocks`] in the rename fallback.
pub struct BlobStore {
    /// Root directory for blob storage
    root_dir: PathBuf,
    staging_dir: PathBuf,
    chunk_size: usize,
    algorithm: HashAlgorithm,
    publish_strategy: PublishStrategy,
    /// Flipped once the filesystem refuses hard links
    link_unsupported: AtomicBool,
    publish_locks: PublishLocks,
    suppressed_errors: AtomicU64,
}

impl BlobStore {
    /// Open (or create) a blob store
    ///
    /// Leftover staging files from a previous run are removed.
    pub async fn open(config: BlobStoreConfig) -> Result<Self, StorageError> {
        if config.chunk_size == 0 {
            return Err(StorageError::Config("chunk_size must be greater than zero".into()));
        }

        let root_dir = config.root_dir;
        let staging_dir = root_dir.join(STAGING_DIR);

        fs::create_dir_all(&staging_dir).await?;

        let store = Self {
            root_dir,
            staging_dir,
            chunk_size: config.chunk_size,
            algorithm: config.hash_algorithm,
            publish_strategy: config.publish_strategy,
            link_unsupported: AtomicBool::new(false),
            publish_locks: PublishLocks::new(),
            suppressed_errors: AtomicU64::new(0),
        };

        store.sweep_staging().await?;

        info!(
            path = %store.root_dir.display(),
            algorithm = %store.algorithm,
            chunk_size = store.chunk_size,
            "Initialized blob store"
        );

        Ok(store)
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Validate an externally supplied identifier against this store's hash format
    pub fn parse_id(&self, raw: &str) -> Result<BlobId, StorageError> {
        BlobId::parse(raw, self.algorithm)
    }

    fn shard_dir(&self, id: &BlobId) -> PathBuf {
        self.root_dir.join(id.shard())
    }

    fn blob_path(&self, id: &BlobId) -> PathBuf {
        self.shard_dir(id).join(id.as_str())
    }

    /// Remove staging files left behind by a crashed run
    async fn sweep_staging(&self) -> Result<(), StorageError> {
        let mut entries = fs::read_dir(&self.staging_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => warn!(path = %path.display(), "Removed stale staging file"),
                Err(e) => self.suppress(&path, "remove stale staging file", &e),
            }
        }
        Ok(())
    }

    /// Open a blob for reading
    ///
    /// Returns `None` if no regular file exists under `id`.
    pub async fn fetch(&self, id: &BlobId) -> Result<Option<BlobReader>, StorageError> {
        let blob_path = self.blob_path(id);

        let file = match File::open(&blob_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Length comes from the open handle, not the path
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Ok(None);
        }

        debug!(id = %id, size = metadata.len(), "Opened blob");

        Ok(Some(BlobReader {
            file,
            len: metadata.len(),
        }))
    }

    /// Check if a blob exists
    pub async fn exists(&self, id: &BlobId) -> bool {
        fs::metadata(self.blob_path(id))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Store exactly `declared_len` bytes read from `reader`
    ///
    /// Bytes are hashed and written to a staging file in chunks of
    /// `chunk_size`. A reader that ends early yields
    /// [`StorageError::ShortRead`]; no staging file survives any error.
    pub async fn store<R>(&self, reader: R, declared_len: u64) -> Result<StoreOutcome, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let mut staging = StagingFile::create(&self.staging_dir).await?;
        let result = self.stage_and_publish(&mut staging, reader, declared_len).await;
        staging.discard().await;
        let outcome = result?;

        match &outcome {
            StoreOutcome::Stored(id) => info!(id = %id, size = declared_len, "Stored blob"),
            StoreOutcome::AlreadyExists(id) => debug!(id = %id, "Blob already exists"),
        }

        Ok(outcome)
    }

    async fn stage_and_publish<R>(
        &self,
        staging: &mut StagingFile,
        mut reader: R,
        declared_len: u64,
    ) -> Result<StoreOutcome, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let mut hasher = self.algorithm.hasher();

        let buf_len = (self.chunk_size as u64).min(declared_len).max(1) as usize;
        let mut buf = vec![0u8; buf_len];
        let mut remaining = declared_len;

        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                let received = declared_len - remaining;
                warn!(
                    expected = declared_len,
                    received,
                    "Upload ended early, discarding staging file"
                );
                return Err(StorageError::ShortRead {
                    expected: declared_len,
                    received,
                });
            }

            hasher.update(&buf[..n]);
            staging.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }

        staging.finish().await?;
        let id = hasher.finalize();

        self.publish(staging, id).await
    }

    /// Store an in-memory payload
    pub async fn store_bytes(&self, data: &[u8]) -> Result<StoreOutcome, StorageError> {
        self.store(data, data.len() as u64).await
    }

    /// Move a finished staging file under its final name
    ///
    /// A publish that fails leaves no empty shard directory behind.
    async fn publish(
        &self,
        staging: &mut StagingFile,
        id: BlobId,
    ) -> Result<StoreOutcome, StorageError> {
        let shard_dir = self.shard_dir(&id);
        let mut cleanup = ShardCleanup {
            dir: &shard_dir,
            armed: true,
        };

        let result = self.place(staging, &id, &shard_dir).await;
        if result.is_err() {
            self.remove_shard_if_empty(&shard_dir).await;
        }
        cleanup.armed = false;

        Ok(if result? {
            StoreOutcome::Stored(id)
        } else {
            StoreOutcome::AlreadyExists(id)
        })
    }

    /// Returns `Ok(false)` when identical content already sits at the final name
    async fn place(
        &self,
        staging: &mut StagingFile,
        id: &BlobId,
        shard_dir: &Path,
    ) -> io::Result<bool> {
        let blob_path = shard_dir.join(id.as_str());
        let mut use_link = self.use_hard_link();
        let mut attempt = 0;

        loop {
            fs::create_dir_all(shard_dir).await?;

            let result = if use_link {
                self.publish_link(staging, id, &blob_path).await
            } else {
                self.publish_rename(staging, id, &blob_path).await
            };
            let err = match result {
                Ok(published) => return Ok(published),
                Err(e) => e,
            };

            if use_link {
                match link_fallback(&err) {
                    Some(LinkFallback::Permanent) => {
                        warn!(
                            path = %self.root_dir.display(),
                            error = %err,
                            "Hard links unsupported, falling back to locked rename"
                        );
                        self.link_unsupported.store(true, Ordering::Relaxed);
                        use_link = false;
                        continue;
                    }
                    Some(LinkFallback::ThisPublish) => {
                        warn!(id = %id, error = %err, "Hard link refused, using locked rename");
                        use_link = false;
                        continue;
                    }
                    None => {}
                }
            }

            attempt += 1;
            // With the staging file still in place, NotFound means the shard
            // directory was collected by a concurrent delete
            if err.kind() == io::ErrorKind::NotFound
                && attempt < PUBLISH_ATTEMPTS
                && matches!(occupied(staging.path()).await, Ok(true))
            {
                debug!(id = %id, attempt, "Shard directory vanished, retrying publish");
                continue;
            }

            return Err(err);
        }
    }

    fn use_hard_link(&self) -> bool {
        self.publish_strategy == PublishStrategy::HardLink
            && !self.link_unsupported.load(Ordering::Relaxed)
    }

    /// Returns `Ok(false)` when the final name is already taken
    async fn publish_link(
        &self,
        staging: &StagingFile,
        id: &BlobId,
        blob_path: &Path,
    ) -> io::Result<bool> {
        match fs::hard_link(staging.path(), blob_path).await {
            // The staging name is discarded by `store`
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(id = %id, "Lost publish race to identical upload");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn publish_rename(
        &self,
        staging: &mut StagingFile,
        id: &BlobId,
        blob_path: &Path,
    ) -> io::Result<bool> {
        let _guard = self.publish_locks.lock(id).await;

        if occupied(blob_path).await? {
            return Ok(false);
        }

        fs::rename(staging.path(), blob_path).await?;
        staging.disarm();
        Ok(true)
    }

    /// Delete a blob and, if it was the last one in its shard, the shard directory
    ///
    /// Once the blob is confirmed present the call reports `Deleted`; failures
    /// while removing the file or the directory are logged and counted, not
    /// returned.
    pub async fn delete(&self, id: &BlobId) -> Result<DeleteOutcome, StorageError> {
        let shard_dir = self.shard_dir(id);
        let blob_path = self.blob_path(id);

        match fs::metadata(&blob_path).await {
            Ok(m) if m.is_file() => {}
            Ok(_) => return Ok(DeleteOutcome::NotFound),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DeleteOutcome::NotFound),
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = fs::remove_file(&blob_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                self.suppress(&blob_path, "remove blob", &e);
            }
        }

        self.remove_shard_if_empty(&shard_dir).await;

        info!(id = %id, "Deleted blob");
        Ok(DeleteOutcome::Deleted)
    }

    /// Best-effort removal of an empty shard directory
    ///
    /// A concurrent store may refill or recreate the directory at any point,
    /// so "not empty" and "already gone" are both normal outcomes.
    async fn remove_shard_if_empty(&self, shard_dir: &Path) {
        let is_empty = match fs::read_dir(shard_dir).await {
            Ok(mut entries) => match entries.next_entry().await {
                Ok(next) => next.is_none(),
                Err(e) => {
                    self.suppress(shard_dir, "list shard directory", &e);
                    return;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                self.suppress(shard_dir, "list shard directory", &e);
                return;
            }
        };

        if !is_empty {
            return;
        }

        match fs::remove_dir(shard_dir).await {
            Ok(()) => debug!(path = %shard_dir.display(), "Removed empty shard directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            // Refilled between listing and removal
            Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => {}
            Err(e) => self.suppress(shard_dir, "remove shard directory", &e),
        }
    }

    /// Degrade a cleanup failure to a diagnostic
    fn suppress(&self, path: &Path, action: &str, error: &io::Error) {
        self.suppressed_errors.fetch_add(1, Ordering::Relaxed);
        warn!(path = %path.display(), action, error = %error, "Suppressed cleanup error");
    }

    /// Number of cleanup errors swallowed since the store was opened
    pub fn suppressed_errors(&self) -> u64 {
        self.suppressed_errors.load(Ordering::Relaxed)
    }

    /// Get storage statistics
    pub async fn stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats {
            suppressed_cleanup_errors: self.suppressed_errors(),
            ..Default::default()
        };

        let mut entries = fs::read_dir(&self.root_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let is_shard = name
                .to_str()
                .map(|n| n.len() == SHARD_PREFIX_LEN && n.bytes().all(|b| b.is_ascii_hexdigit()))
                .unwrap_or(false);
            if !is_shard || !entry.file_type().await?.is_dir() {
                continue;
            }

            stats.shard_dirs += 1;

            // Shards can disappear mid-walk
            let Ok(mut blobs) = fs::read_dir(entry.path()).await else {
                continue;
            };
            while let Ok(Some(blob)) = blobs.next_entry().await {
                if let Ok(metadata) = blob.metadata().await {
                    if metadata.is_file() {
                        stats.total_blobs += 1;
                        stats.total_bytes += metadata.len();
                    }
                }
            }
        }

        Ok(stats)
    }
}

/// How far a refused hard link pushes publishing onto locked rename
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkFallback {
    /// The filesystem has no hard links at all
    Permanent,
    /// EPERM: FAT and some FUSE mounts, but also a permission problem on one shard
    ThisPublish,
}

fn link_fallback(e: &io::Error) -> Option<LinkFallback> {
    match e.kind() {
        io::ErrorKind::Unsupported => Some(LinkFallback::Permanent),
        io::ErrorKind::PermissionDenied => Some(LinkFallback::ThisPublish),
        _ => None,
    }
}

/// Whether anything, even a dangling symlink, sits at `path`
async fn occupied(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
