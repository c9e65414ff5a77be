use crate::hash::ObjectId;

/// Interface to the quota bookkeeping engine.
///
/// The quota manager keeps per-object metadata the cache itself does not
/// track: whether an object is volatile, whether it is pinned against
/// eviction, and a description string (usually the path the object
/// corresponds to).  The cache core never caches quota state; the quota
/// manager is the source of truth.
pub trait QuotaManager: Send + Sync {
    /// Largest single object the cache admits.
    fn max_file_size(&self) -> u64;

    /// Total managed capacity in bytes.
    fn capacity(&self) -> u64;

    /// Evict unpinned objects until usage drops to at most `target_bytes`.
    /// Returns false if that level could not be reached.
    fn cleanup(&self, target_bytes: u64) -> bool;

    /// Protect `id` from eviction.  Returns false on quota exhaustion.
    fn pin(&self, id: &ObjectId, size: u64, description: &str, is_catalog: bool) -> bool;

    fn insert(&self, id: &ObjectId, size: u64, description: &str);

    fn insert_volatile(&self, id: &ObjectId, size: u64, description: &str);

    /// Advisory recency bump for `id`.
    fn touch(&self, id: &ObjectId);

    fn remove(&self, id: &ObjectId);

    fn unpin(&self, id: &ObjectId);
}

/// Quota manager that admits everything and tracks nothing.
pub struct NoopQuotaManager;

impl QuotaManager for NoopQuotaManager {
    fn max_file_size(&self) -> u64 {
        u64::MAX
    }

    fn capacity(&self) -> u64 {
        u64::MAX
    }

    fn cleanup(&self, _target_bytes: u64) -> bool {
        true
    }

    fn pin(&self, _id: &ObjectId, _size: u64, _description: &str, _is_catalog: bool) -> bool {
        true
    }

    fn insert(&self, _id: &ObjectId, _size: u64, _description: &str) {}

    fn insert_volatile(&self, _id: &ObjectId, _size: u64, _description: &str) {}

    fn touch(&self, _id: &ObjectId) {}

    fn remove(&self, _id: &ObjectId) {}

    fn unpin(&self, _id: &ObjectId) {}
}
