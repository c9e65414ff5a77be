use nix::errno::Errno;
use thiserror::Error;

use crate::download::DownloadCode;

/// Errors surfaced by the cache core.
///
/// The enum is `Copy` so a download leader can broadcast one result to every
/// coalesced waiter. `errno()` projects each variant onto the POSIX code that
/// descriptor-based callers expect.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache is in read-only mode")]
    ReadOnly,

    #[error("object does not fit in the cache quota")]
    QuotaExceeded,

    #[error("staged object failed the size check and was quarantined")]
    SizeMismatch,

    #[error("download failed: {0:?}")]
    Download(DownloadCode),

    #[error("{0}")]
    Io(Errno),
}

impl CacheError {
    pub fn errno(self) -> Errno {
        match self {
            CacheError::ReadOnly => Errno::EROFS,
            CacheError::QuotaExceeded => Errno::ENOSPC,
            CacheError::SizeMismatch => Errno::EIO,
            CacheError::Download(_) => Errno::EIO,
            CacheError::Io(errno) => errno,
        }
    }
}

impl From<Errno> for CacheError {
    fn from(errno: Errno) -> Self {
        CacheError::Io(errno)
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io(e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
