//! Mediates between the cache manager, the quota manager and the download
//! manager: a fetch returns a read-only descriptor for the requested object,
//! downloading and committing it first if it is not cached.
//!
//! Concurrent downloads of the same id are collapsed.  The first thread
//! becomes the leader and performs the download; the others park on their
//! wake channel and receive a duplicated descriptor (or the leader's error)
//! when it finishes.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::download::{DownloadJob, DownloadManager};
use crate::error::{CacheError, Result};
use crate::hash::ObjectId;
use crate::store::{CacheManager, CacheMode, ObjectType, Transaction, BIG_FILE_THRESHOLD};

/// Outcome broadcast from a download leader to its waiters.  A descriptor
/// received through a wake channel is owned by the receiving thread.
type FetchOutcome = Result<RawFd>;

thread_local! {
    /// Per-thread wake channel, created on first use.  The sender end is
    /// what a thread registers in the inflight table while it waits.
    static WAKE_CHANNEL: (Sender<FetchOutcome>, Receiver<FetchOutcome>) = mpsc::channel();
}

pub struct Fetcher {
    cache: Arc<CacheManager>,
    download_mgr: Arc<dyn DownloadManager>,
    /// Ids currently being downloaded, mapped to the wake-channel senders of
    /// the threads waiting on each download.  An entry exists iff exactly
    /// one thread is downloading that id.
    inflight: Mutex<HashMap<ObjectId, Vec<Sender<FetchOutcome>>>>,
    num_downloads: AtomicI64,
    drainout: AtomicBool,
    inflight_calls: AtomicI32,
}

impl Fetcher {
    pub fn new(cache: Arc<CacheManager>, download_mgr: Arc<dyn DownloadManager>) -> Self {
        Fetcher {
            cache,
            download_mgr,
            inflight: Mutex::new(HashMap::new()),
            num_downloads: AtomicI64::new(0),
            drainout: AtomicBool::new(false),
            inflight_calls: AtomicI32::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Downloads performed so far (coalesced waiters not counted).
    pub fn download_count(&self) -> i64 {
        self.num_downloads.load(Ordering::Relaxed)
    }

    /// Return a read-only descriptor for `id`, downloading and committing
    /// the object first if it is not in the cache.
    ///
    /// `size` is the expected object size (`None` if unknown), `name` a
    /// provenance string forwarded to quota and transport diagnostics.
    pub fn fetch(
        &self,
        id: &ObjectId,
        size: Option<u64>,
        name: &str,
        object_type: ObjectType,
    ) -> Result<RawFd> {
        let _guard = CallGuard::new(self);

        if let Ok(fd) = self.cache.open(id) {
            debug!("hit: {}", name);
            return Ok(fd);
        }
        if self.cache.mode() == CacheMode::ReadOnly {
            return Err(CacheError::ReadOnly);
        }
        if let Some(size) = size {
            let quota = self.cache.quota();
            if size > quota.max_file_size() {
                debug!(
                    "object too big for the cache ({} requested, at most {} admitted)",
                    size,
                    quota.max_file_size()
                );
                return Err(CacheError::QuotaExceeded);
            }
            // Opportunistically make room for big objects.
            if size >= BIG_FILE_THRESHOLD && quota.capacity() >= size {
                quota.cleanup(quota.capacity() - size);
            }
        }

        self.coalesce_or_elect(id, name, || self.download(id, size, name, object_type))
    }

    /// Either enqueue behind the thread already downloading `id`, or become
    /// the leader and run `leader_body`.
    ///
    /// The leader fans its result out under the table lock: every waiter
    /// gets a duplicated descriptor on success or the error code on failure,
    /// and the table entry is removed exactly once.  Waiters block to
    /// completion; there is no mid-wait cancellation.
    fn coalesce_or_elect<F>(&self, id: &ObjectId, name: &str, leader_body: F) -> Result<RawFd>
    where
        F: FnOnce() -> Result<RawFd>,
    {
        WAKE_CHANNEL.with(|(sender, receiver)| {
            let mut inflight = self.inflight.lock();
            if let Some(waiters) = inflight.get_mut(id) {
                waiters.push(sender.clone());
                drop(inflight);
                debug!("waiting for download of {}", name);
                let outcome = receiver
                    .recv()
                    .unwrap_or(Err(CacheError::Io(Errno::EIO)));
                debug!("received outcome {:?} for {}", outcome, name);
                return outcome;
            }

            inflight.insert(*id, Vec::new());
            drop(inflight);

            let result = leader_body();

            let mut inflight = self.inflight.lock();
            let waiters = inflight.remove(id).unwrap_or_default();
            for waiter in waiters {
                let outcome = result.and_then(|fd| self.cache.dup(fd));
                if waiter.send(outcome).is_err() {
                    // Receiver is gone; do not leak the duplicate.
                    if let Ok(fd) = outcome {
                        let _ = self.cache.close(fd);
                    }
                }
            }
            drop(inflight);
            result
        })
    }

    /// Leader path: stage, download, verify, commit, and hand back a reader
    /// descriptor obtained before the commit rename.
    fn download(
        &self,
        id: &ObjectId,
        size: Option<u64>,
        name: &str,
        object_type: ObjectType,
    ) -> Result<RawFd> {
        // The object may have been committed between the fast-path probe and
        // taking the inflight lock.
        if let Ok(fd) = self.cache.open(id) {
            return Ok(fd);
        }

        debug!("downloading {}", name);
        self.num_downloads.fetch_add(1, Ordering::Relaxed);

        let mut txn = self.cache.start_txn(id, size)?;
        txn.ctrl(name, object_type, 0);

        let url = format!("/data/{}", id.url_path());
        let code = {
            let mut sink = TxnSink { txn: &mut txn };
            let mut job = DownloadJob {
                url: url.clone(),
                expected_hash: id,
                extra_info: name,
                compressed: true,
                probe_hosts: true,
                destination: &mut sink,
            };
            self.download_mgr.fetch(&mut job)
        };
        if !code.is_ok() {
            warn!("failed to fetch {} (hash {}, error {:?})", name, id, code);
            let _ = self.cache.abort_txn(txn);
            return Err(CacheError::Download(code));
        }
        debug!("finished downloading {}", url);

        // Cross-check the bytes that actually reached the staging file.
        let observed = match txn.staged_size() {
            Ok(observed) => observed,
            Err(e) => {
                let _ = self.cache.abort_txn(txn);
                return Err(e);
            }
        };
        if !self.cache.size_acceptable(size, observed) {
            warn!(
                "size check failure for {}, expected {}, got {}",
                url,
                size.unwrap_or(0),
                observed
            );
            self.cache.quarantine_txn(&txn);
            let _ = self.cache.abort_txn(txn);
            return Err(CacheError::SizeMismatch);
        }

        // Take the reader descriptor before the rename so it stays valid no
        // matter what happens to the final path afterwards.
        let fd = match txn.open_reader() {
            Ok(fd) => fd,
            Err(e) => {
                let _ = self.cache.abort_txn(txn);
                return Err(e);
            }
        };
        match self.cache.commit_txn(txn) {
            Ok(()) => Ok(fd),
            Err(e) => {
                let _ = self.cache.close(fd);
                Err(e)
            }
        }
    }

    /// Drain in-flight fetch calls, then downgrade the cache manager.
    /// Blocks until both the call counter and the transaction counter reach
    /// zero.  Fetches of cached objects keep working afterwards; misses
    /// report the read-only mode.
    pub fn downgrade_to_readonly(&self) {
        self.drainout.store(true, Ordering::SeqCst);
        self.cache.downgrade_to_readonly();
        while self.inflight_calls.load(Ordering::SeqCst) != 0 {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
    }
}

/// io::Write adapter that streams a download payload through a transaction,
/// so commit-time size accounting sees the transferred bytes.
struct TxnSink<'a> {
    txn: &'a mut Transaction,
}

impl io::Write for TxnSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.txn
            .write(buf)
            .map_err(|e| io::Error::from_raw_os_error(e.errno() as i32))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Counts fetch calls in flight so a mode downgrade can wait for the calls
/// made before it started.  Calls arriving during the drain are not counted
/// and run against the already read-only cache.
struct CallGuard<'a> {
    fetcher: &'a Fetcher,
    counted: bool,
}

impl<'a> CallGuard<'a> {
    fn new(fetcher: &'a Fetcher) -> Self {
        let counted = !fetcher.drainout.load(Ordering::SeqCst);
        if counted {
            fetcher.inflight_calls.fetch_add(1, Ordering::SeqCst);
        }
        CallGuard { fetcher, counted }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.counted {
            self.fetcher.inflight_calls.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
