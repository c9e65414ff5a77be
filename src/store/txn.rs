use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::hash::ObjectId;
use crate::store::backend::StorageBackend;
use crate::store::ObjectType;

pub(crate) const WRITE_BUFFER_BYTES: usize = 4096;

/// A staged write: bytes accumulate in a uniquely named file under `txn/`
/// until the transaction is committed or aborted by the cache manager.
///
/// The record is owned by the thread that started it.  Dropping it without
/// commit or abort aborts it, so the inflight-transaction counter stays
/// consistent on early-return and panic paths.
pub struct Transaction {
    pub(crate) id: ObjectId,
    pub(crate) final_path: PathBuf,
    pub(crate) staging_path: PathBuf,
    pub(crate) fd: RawFd,
    buffer: [u8; WRITE_BUFFER_BYTES],
    buf_pos: usize,
    pub(crate) size: u64,
    pub(crate) expected_size: Option<u64>,
    pub(crate) object_type: ObjectType,
    pub(crate) description: String,
    backend: Arc<dyn StorageBackend>,
    inflight_txns: Arc<AtomicI32>,
    pub(crate) finished: bool,
}

impl Transaction {
    pub(crate) fn new(
        id: ObjectId,
        final_path: PathBuf,
        staging_path: PathBuf,
        fd: RawFd,
        expected_size: Option<u64>,
        backend: Arc<dyn StorageBackend>,
        inflight_txns: Arc<AtomicI32>,
    ) -> Self {
        Transaction {
            id,
            final_path,
            staging_path,
            fd,
            buffer: [0; WRITE_BUFFER_BYTES],
            buf_pos: 0,
            size: 0,
            expected_size,
            object_type: ObjectType::Regular,
            description: String::new(),
            backend,
            inflight_txns,
            finished: false,
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Bytes accepted so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Set the advisory fields forwarded to the quota manager at commit.
    /// No I/O.  `flags` is reserved and must be zero.
    pub fn ctrl(&mut self, description: &str, object_type: ObjectType, flags: u32) {
        assert_eq!(flags, 0, "transaction flags are reserved");
        self.description = description.to_string();
        self.object_type = object_type;
    }

    /// Append `buf` to the staged object.  Returns the number of bytes
    /// accepted, which is `buf.len()` unless an error occurs.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if let Some(expected) = self.expected_size {
            if self.size + buf.len() as u64 > expected {
                return Err(CacheError::QuotaExceeded);
            }
        }

        let mut written = 0;
        while written < buf.len() {
            if self.buf_pos == WRITE_BUFFER_BYTES {
                if let Err(e) = self.flush() {
                    self.size += written as u64;
                    return Err(e);
                }
            }
            let space = WRITE_BUFFER_BYTES - self.buf_pos;
            let batch = space.min(buf.len() - written);
            self.buffer[self.buf_pos..self.buf_pos + batch]
                .copy_from_slice(&buf[written..written + batch]);
            self.buf_pos += batch;
            written += batch;
        }
        self.size += written as u64;
        Ok(written)
    }

    /// Write the buffered tail to the staging descriptor.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.buf_pos == 0 {
            return Ok(());
        }
        let n = self.backend.write(self.fd, &self.buffer[..self.buf_pos])?;
        if n != self.buf_pos {
            // Short write: keep the unflushed tail at the front of the buffer.
            self.buffer.copy_within(n..self.buf_pos, 0);
            self.buf_pos -= n;
            return Err(CacheError::Io(Errno::EIO));
        }
        self.buf_pos = 0;
        Ok(())
    }

    /// Rewind the transaction to an empty staged object, discarding
    /// everything written so far.  Used by downloaders that retry after a
    /// partial transfer.
    pub fn reset(&mut self) -> Result<()> {
        self.buf_pos = 0;
        self.size = 0;
        self.backend.lseek_start(self.fd)?;
        self.backend.ftruncate_zero(self.fd)?;
        Ok(())
    }

    /// Flush and open a second, read-only descriptor on the staging file.
    ///
    /// The descriptor stays valid across the commit rename, so a reader
    /// obtained here is immune to the final-path file being replaced or
    /// unlinked afterwards.
    pub fn open_reader(&mut self) -> Result<RawFd> {
        self.flush()?;
        Ok(self.backend.open_readonly(&self.staging_path)?)
    }

    /// Flush and report the size of the staging file as the backing store
    /// observes it.
    pub fn staged_size(&mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.backend.fstat_size(self.fd)?)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!("abort {}", self.staging_path.display());
        let _ = self.backend.close(self.fd);
        let _ = self.backend.unlink(&self.staging_path);
        self.inflight_txns.fetch_sub(1, Ordering::SeqCst);
    }
}
