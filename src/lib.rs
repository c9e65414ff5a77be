//! Content-addressed local object cache.
//!
//! Objects are identified by their content hash.  [`CacheManager`] hands out
//! read-only virtual file descriptors into a cache directory and turns
//! streamed writes into atomically committed, hash-named artifacts.
//! [`Fetcher`] sits in front of it and a remote [`DownloadManager`]: a miss
//! is downloaded exactly once even under high concurrency, verified, and
//! fanned out to every waiting thread.  A [`QuotaManager`] observes commits
//! and hits so it can evict; the cache itself keeps no quota state.

pub mod config;
pub mod download;
pub mod error;
pub mod fetch;
pub mod hash;
pub mod quota;
pub mod store;

pub use config::CacheConfig;
pub use download::{DownloadCode, DownloadJob, DownloadManager};
pub use error::{CacheError, Result};
pub use fetch::Fetcher;
pub use hash::{ObjectId, Suffix};
pub use quota::{NoopQuotaManager, QuotaManager};
pub use store::{CacheManager, CacheMode, ObjectType, Transaction, BIG_FILE_THRESHOLD};
