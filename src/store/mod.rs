pub mod backend;
pub mod layout;
mod txn;

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::hash::ObjectId;
use crate::quota::{NoopQuotaManager, QuotaManager};

use self::backend::{BackendResult, PosixBackend, StorageBackend};
use self::layout::CacheLayout;

pub use self::txn::Transaction;

/// From this size on, an object is considered big and a transaction cleans
/// up the cache opportunistically before staging it.
pub const BIG_FILE_THRESHOLD: u64 = 25 * 1024 * 1024;

/// Poll interval while draining in-flight transactions.
const DRAIN_POLL: Duration = Duration::from_millis(50);

const MODE_READ_WRITE: u8 = 0;
const MODE_READ_ONLY: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    ReadWrite,
    ReadOnly,
}

/// Advisory classification forwarded to the quota manager at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Regular,
    /// File catalog; implies pinned.
    Catalog,
    Pinned,
    Volatile,
}

impl ObjectType {
    pub fn is_pinned(self) -> bool {
        matches!(self, ObjectType::Pinned | ObjectType::Catalog)
    }
}

/// Content-addressed object store over a cache directory.
///
/// Provides virtual file descriptors to content-addressed objects.  A
/// descriptor stays readable until closed, no matter whether the backing
/// object is evicted in the meantime (POSIX semantics).  Writing is streamed
/// and transactional: bytes go to a staging file from [`start_txn`], and the
/// object becomes visible only when [`commit_txn`] renames it into its
/// content-hash name.  Commit is the single point where backing-store and
/// quota state are jointly mutated; every error path restores consistency
/// before returning.
///
/// [`start_txn`]: CacheManager::start_txn
/// [`commit_txn`]: CacheManager::commit_txn
pub struct CacheManager {
    layout: CacheLayout,
    backend: Arc<dyn StorageBackend>,
    quota: RwLock<Arc<dyn QuotaManager>>,
    mode: AtomicU8,
    /// Started but not yet committed or aborted transactions.  The cache can
    /// only degrade to read-only once this reaches zero.
    inflight_txns: Arc<AtomicI32>,
    alien: bool,
    reports_correct_filesize: bool,
    liveness_marker: Option<PathBuf>,
}

impl CacheManager {
    /// Initialize the cache directory and return a manager backed by the
    /// local POSIX file system.  Detects whether a shared cache root lives
    /// on network storage and switches publishing to link-then-unlink.
    pub fn create(config: CacheConfig) -> Result<Self> {
        let layout = CacheLayout::new(&config.root);
        layout.create_all(config.alien)?;

        let alien_on_network = config.alien && root_is_network_fs(layout.root());
        if alien_on_network {
            info!("alien cache is on a network file system");
        }
        Ok(Self::assemble(
            config,
            layout,
            Arc::new(PosixBackend::new(alien_on_network)),
        ))
    }

    /// Like [`create`](CacheManager::create), with a caller-provided storage
    /// backend.
    pub fn with_backend(config: CacheConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let layout = CacheLayout::new(&config.root);
        layout.create_all(config.alien)?;
        Ok(Self::assemble(config, layout, backend))
    }

    fn assemble(
        config: CacheConfig,
        layout: CacheLayout,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        CacheManager {
            layout,
            backend,
            quota: RwLock::new(Arc::new(NoopQuotaManager)),
            mode: AtomicU8::new(MODE_READ_WRITE),
            inflight_txns: Arc::new(AtomicI32::new(0)),
            alien: config.alien,
            reports_correct_filesize: config.reports_correct_filesize,
            liveness_marker: config.liveness_marker,
        }
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// The quota manager currently bound to this cache.  Defaults to the
    /// Noop manager.
    pub fn quota(&self) -> Arc<dyn QuotaManager> {
        self.quota.read().clone()
    }

    pub fn set_quota(&self, quota: Arc<dyn QuotaManager>) {
        *self.quota.write() = quota;
    }

    pub fn mode(&self) -> CacheMode {
        match self.mode.load(Ordering::SeqCst) {
            MODE_READ_WRITE => CacheMode::ReadWrite,
            _ => CacheMode::ReadOnly,
        }
    }

    /// Number of transactions started but not yet committed or aborted.
    pub fn inflight_transactions(&self) -> i32 {
        self.inflight_txns.load(Ordering::SeqCst)
    }

    // ==================== Reader operations ====================

    /// Open the object `id` read-only.  A hit bumps the quota recency.
    pub fn open(&self, id: &ObjectId) -> Result<RawFd> {
        let path = self.layout.object_path(id);
        match self.backend.open_readonly(&path) {
            Ok(fd) => {
                debug!("hit {}", path.display());
                self.quota().touch(id);
                Ok(fd)
            }
            Err(errno) => {
                debug!("miss {} ({})", path.display(), errno);
                Err(errno.into())
            }
        }
    }

    pub fn get_size(&self, fd: RawFd) -> Result<u64> {
        Ok(self.backend.fstat_size(fd)?)
    }

    /// Positional read; does not advance any shared offset.  May return
    /// short counts at end of file.
    pub fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(self.backend.pread(fd, buf, offset)?)
    }

    /// Duplicate a descriptor so another owner can read independently.
    pub fn dup(&self, fd: RawFd) -> Result<RawFd> {
        Ok(self.backend.dup(fd)?)
    }

    pub fn close(&self, fd: RawFd) -> Result<()> {
        Ok(self.backend.close(fd)?)
    }

    /// Open `id` and copy its full contents into memory.
    pub fn open_to_mem(&self, id: &ObjectId) -> Result<Vec<u8>> {
        let fd = self.open(id)?;
        let result = (|| {
            let size = self.get_size(fd)? as usize;
            let mut buf = vec![0u8; size];
            if size > 0 {
                let n = self.pread(fd, &mut buf, 0)?;
                if n != size {
                    return Err(CacheError::Io(Errno::EIO));
                }
            }
            Ok(buf)
        })();
        let _ = self.close(fd);
        result
    }

    /// Commit a memory blob under `id`.  No checking: the hash and the blob
    /// need to match.
    pub fn commit_from_mem(&self, id: &ObjectId, buf: &[u8], description: &str) -> Result<()> {
        let mut txn = self.start_txn(id, Some(buf.len() as u64))?;
        txn.ctrl(description, ObjectType::Regular, 0);
        if let Err(e) = txn.write(buf) {
            let _ = self.abort_txn(txn);
            return Err(e);
        }
        self.commit_txn(txn)
    }

    // ==================== Transactions ====================

    /// Start a staged write for `id`.  `size` is the expected object size,
    /// or `None` if unknown.
    pub fn start_txn(&self, id: &ObjectId, size: Option<u64>) -> Result<Transaction> {
        self.inflight_txns.fetch_add(1, Ordering::SeqCst);
        if self.mode() == CacheMode::ReadOnly {
            self.inflight_txns.fetch_sub(1, Ordering::SeqCst);
            return Err(CacheError::ReadOnly);
        }

        if let Some(size) = size {
            let quota = self.quota();
            if size > quota.max_file_size() {
                debug!(
                    "object too big for the cache ({} requested, at most {} admitted)",
                    size,
                    quota.max_file_size()
                );
                self.inflight_txns.fetch_sub(1, Ordering::SeqCst);
                return Err(CacheError::QuotaExceeded);
            }
            if size >= BIG_FILE_THRESHOLD {
                debug_assert!(quota.capacity() >= size);
                quota.cleanup(quota.capacity().saturating_sub(size));
            }
        }

        let (fd, staging_path) = match self.backend.create_unique(&self.layout.txn_template()) {
            Ok(created) => created,
            Err(errno) => {
                self.inflight_txns.fetch_sub(1, Ordering::SeqCst);
                return Err(errno.into());
            }
        };
        debug!(
            "start transaction on {} (fd {})",
            staging_path.display(),
            fd
        );
        Ok(Transaction::new(
            *id,
            self.layout.object_path(id),
            staging_path,
            fd,
            size,
            Arc::clone(&self.backend),
            Arc::clone(&self.inflight_txns),
        ))
    }

    /// Abort a staged write and remove its staging file.
    pub fn abort_txn(&self, mut txn: Transaction) -> Result<()> {
        debug!("abort {}", txn.staging_path.display());
        let _ = self.backend.close(txn.fd);
        let unlinked = self.backend.unlink(&txn.staging_path);
        self.finish(&mut txn);
        unlinked.map_err(CacheError::from)
    }

    /// Publish a staged write under its content-hash name.
    ///
    /// Sequence: flush, close, size check (with quarantine), quota pin for
    /// pinned types, rename into the final path, quota insert notification.
    /// Every error path unlinks the staging file, undoes a speculative pin,
    /// and restores the inflight counter before surfacing the error.
    pub fn commit_txn(&self, mut txn: Transaction) -> Result<()> {
        debug!(
            "commit {} {}",
            txn.final_path.display(),
            txn.staging_path.display()
        );

        if let Err(e) = txn.flush() {
            let _ = self.backend.close(txn.fd);
            let _ = self.backend.unlink(&txn.staging_path);
            self.finish(&mut txn);
            return Err(e);
        }
        let _ = self.backend.close(txn.fd);

        if !self.size_acceptable(txn.expected_size, txn.size) {
            warn!(
                "size check failure for {}, expected {}, got {}",
                txn.id,
                txn.expected_size.unwrap_or(0),
                txn.size
            );
            self.quarantine_txn(&txn);
            let _ = self.backend.unlink(&txn.staging_path);
            self.finish(&mut txn);
            return Err(CacheError::SizeMismatch);
        }

        let quota = self.quota();
        let pinned = txn.object_type.is_pinned();
        if pinned {
            let is_catalog = txn.object_type == ObjectType::Catalog;
            if !quota.pin(&txn.id, txn.size, &txn.description, is_catalog) {
                debug!("commit failed: cannot pin {}", txn.id);
                let _ = self.backend.unlink(&txn.staging_path);
                self.finish(&mut txn);
                return Err(CacheError::QuotaExceeded);
            }
        }

        let published = self.publish(&txn);
        if let Err(errno) = published {
            warn!("commit failed for {}: {}", txn.id, errno);
            let _ = self.backend.unlink(&txn.staging_path);
            if pinned {
                quota.remove(&txn.id);
            }
            self.finish(&mut txn);
            return Err(errno.into());
        }

        match txn.object_type {
            ObjectType::Regular => quota.insert(&txn.id, txn.size, &txn.description),
            ObjectType::Volatile => quota.insert_volatile(&txn.id, txn.size, &txn.description),
            ObjectType::Pinned | ObjectType::Catalog => {}
        }
        self.finish(&mut txn);
        Ok(())
    }

    fn publish(&self, txn: &Transaction) -> BackendResult<()> {
        if self.alien {
            self.backend.chmod(&txn.staging_path, 0o660)?;
        }
        self.backend.rename(&txn.staging_path, &txn.final_path)
    }

    fn finish(&self, txn: &mut Transaction) {
        txn.finished = true;
        self.inflight_txns.fetch_sub(1, Ordering::SeqCst);
    }

    /// Whether an observed staged size passes the commit check against the
    /// expected size.  Stores that report sizes lazily get a pass for
    /// observed zero.
    pub(crate) fn size_acceptable(&self, expected: Option<u64>, observed: u64) -> bool {
        match expected {
            None => true,
            Some(expected) if observed == expected => true,
            Some(_) => !self.reports_correct_filesize && observed == 0,
        }
    }

    /// Retain a verbatim copy of the staging file for diagnosis.
    pub(crate) fn quarantine_txn(&self, txn: &Transaction) {
        let target = self.layout.quarantine_path(&txn.id);
        if let Err(errno) = self.backend.copy(&txn.staging_path, &target) {
            warn!(
                "failed to quarantine {}: {}",
                txn.staging_path.display(),
                errno
            );
        }
    }

    // ==================== Mode controller ====================

    /// Downgrade the cache to read-only.
    ///
    /// Blocks until every in-flight transaction has committed or aborted;
    /// new transactions are rejected as soon as the mode flips.  Open
    /// descriptors and reads keep working.  After the drain, the quota
    /// manager is replaced by the Noop manager and the liveness marker, if
    /// any, is removed.
    pub fn downgrade_to_readonly(&self) {
        self.mode.store(MODE_READ_ONLY, Ordering::SeqCst);
        while self.inflight_txns.load(Ordering::SeqCst) != 0 {
            std::thread::sleep(DRAIN_POLL);
        }

        *self.quota.write() = Arc::new(NoopQuotaManager);
        if let Some(marker) = &self.liveness_marker {
            let _ = self.backend.unlink(marker);
        }
        info!("switched to read-only cache mode");
    }
}

#[cfg(target_os = "linux")]
fn root_is_network_fs(root: &Path) -> bool {
    use nix::sys::statfs::{statfs, NFS_SUPER_MAGIC};
    statfs(root)
        .map(|fs| fs.filesystem_type() == NFS_SUPER_MAGIC)
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn root_is_network_fs(_root: &Path) -> bool {
    false
}
