#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use nix::errno::Errno;

use cachet::store::backend::{BackendResult, PosixBackend, StorageBackend};
use cachet::{
    CacheConfig, CacheManager, DownloadCode, DownloadJob, DownloadManager, ObjectId, QuotaManager,
};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A cache rooted in a tempdir with a recording quota manager attached.
pub struct TestCache {
    pub root: tempfile::TempDir,
    pub cache: Arc<CacheManager>,
    pub quota: Arc<RecordingQuota>,
}

impl TestCache {
    pub fn new() -> Self {
        Self::with_config_fn(|root| CacheConfig::new(root))
    }

    pub fn alien() -> Self {
        Self::with_config_fn(|root| CacheConfig::new(root).alien())
    }

    fn with_config_fn(make_config: impl FnOnce(&std::path::Path) -> CacheConfig) -> Self {
        init_logging();
        let root = tempfile::tempdir().expect("failed to create cache root");
        let config = make_config(root.path());
        let cache = Arc::new(CacheManager::create(config).expect("failed to create cache"));
        let quota = Arc::new(RecordingQuota::new());
        cache.set_quota(quota.clone());
        TestCache { root, cache, quota }
    }

    /// Like `new`, but with a caller-provided storage backend.
    pub fn with_backend(backend: Arc<dyn StorageBackend>) -> Self {
        init_logging();
        let root = tempfile::tempdir().expect("failed to create cache root");
        let config = CacheConfig::new(root.path());
        let cache =
            Arc::new(CacheManager::with_backend(config, backend).expect("failed to create cache"));
        let quota = Arc::new(RecordingQuota::new());
        cache.set_quota(quota.clone());
        TestCache { root, cache, quota }
    }

    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.root.path().join(id.path_name())
    }

    pub fn quarantine_path(&self, id: &ObjectId) -> PathBuf {
        self.root.path().join("quarantine").join(id.to_string())
    }
}

/// Read the full contents behind a virtual descriptor with pread.
pub fn read_all(cache: &CacheManager, fd: RawFd) -> Vec<u8> {
    let size = cache.get_size(fd).expect("get_size failed") as usize;
    let mut buf = vec![0u8; size];
    let mut off = 0;
    while off < size {
        let n = cache
            .pread(fd, &mut buf[off..], off as u64)
            .expect("pread failed");
        assert!(n > 0, "unexpected end of file at offset {}", off);
        off += n;
    }
    buf
}

/// Everything the cache tells the quota manager, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaEvent {
    Insert(ObjectId, u64, String),
    InsertVolatile(ObjectId, u64, String),
    Pin {
        id: ObjectId,
        size: u64,
        description: String,
        is_catalog: bool,
    },
    Touch(ObjectId),
    Remove(ObjectId),
    Unpin(ObjectId),
    Cleanup(u64),
}

pub struct RecordingQuota {
    events: Mutex<Vec<QuotaEvent>>,
    pin_succeeds: AtomicBool,
    capacity: u64,
    max_file_size: u64,
}

impl RecordingQuota {
    pub fn new() -> Self {
        Self::with_limits(u64::MAX, u64::MAX)
    }

    pub fn with_limits(capacity: u64, max_file_size: u64) -> Self {
        RecordingQuota {
            events: Mutex::new(Vec::new()),
            pin_succeeds: AtomicBool::new(true),
            capacity,
            max_file_size,
        }
    }

    pub fn refuse_pins(&self) {
        self.pin_succeeds.store(false, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<QuotaEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn touches(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, QuotaEvent::Touch(_)))
            .count()
    }

    fn record(&self, event: QuotaEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl QuotaManager for RecordingQuota {
    fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn cleanup(&self, target_bytes: u64) -> bool {
        self.record(QuotaEvent::Cleanup(target_bytes));
        true
    }

    fn pin(&self, id: &ObjectId, size: u64, description: &str, is_catalog: bool) -> bool {
        self.record(QuotaEvent::Pin {
            id: *id,
            size,
            description: description.to_string(),
            is_catalog,
        });
        self.pin_succeeds.load(Ordering::SeqCst)
    }

    fn insert(&self, id: &ObjectId, size: u64, description: &str) {
        self.record(QuotaEvent::Insert(*id, size, description.to_string()));
    }

    fn insert_volatile(&self, id: &ObjectId, size: u64, description: &str) {
        self.record(QuotaEvent::InsertVolatile(*id, size, description.to_string()));
    }

    fn touch(&self, id: &ObjectId) {
        self.record(QuotaEvent::Touch(*id));
    }

    fn remove(&self, id: &ObjectId) {
        self.record(QuotaEvent::Remove(*id));
    }

    fn unpin(&self, id: &ObjectId) {
        self.record(QuotaEvent::Unpin(*id));
    }
}

/// In-memory transport serving registered payloads, with optional delivery
/// delay and failure injection.
pub struct MockDownloader {
    objects: Mutex<HashMap<ObjectId, Vec<u8>>>,
    delay: Duration,
    failure: Mutex<Option<DownloadCode>>,
    fetches: AtomicUsize,
}

impl MockDownloader {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(MockDownloader {
            objects: Mutex::new(HashMap::new()),
            delay,
            failure: Mutex::new(None),
            fetches: AtomicUsize::new(0),
        })
    }

    /// Register a payload and return its content hash.
    pub fn put(&self, content: &[u8]) -> ObjectId {
        let id = ObjectId::hash_of(content);
        self.objects.lock().unwrap().insert(id, content.to_vec());
        id
    }

    /// Register a payload under an arbitrary id, e.g. one whose declared
    /// size will not match the delivered bytes.
    pub fn put_as(&self, id: ObjectId, content: &[u8]) {
        self.objects.lock().unwrap().insert(id, content.to_vec());
    }

    pub fn set_failure(&self, code: Option<DownloadCode>) {
        *self.failure.lock().unwrap() = code;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl DownloadManager for MockDownloader {
    fn fetch(&self, job: &mut DownloadJob<'_>) -> DownloadCode {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some(code) = *self.failure.lock().unwrap() {
            return code;
        }
        let content = self.objects.lock().unwrap().get(job.expected_hash).cloned();
        match content {
            Some(content) => {
                if job.destination.write_all(&content).is_err() {
                    // Local write failures surface as transport errors.
                    return DownloadCode::HostConnection;
                }
                DownloadCode::Ok
            }
            None => DownloadCode::BadUrl,
        }
    }
}

/// Posix backend wrapper that can be told to fail renames, for rollback
/// tests.
pub struct FlakyBackend {
    inner: PosixBackend,
    pub fail_renames: AtomicBool,
}

impl FlakyBackend {
    pub fn new() -> Self {
        FlakyBackend {
            inner: PosixBackend::new(false),
            fail_renames: AtomicBool::new(false),
        }
    }
}

impl StorageBackend for FlakyBackend {
    fn open_readonly(&self, path: &std::path::Path) -> BackendResult<RawFd> {
        self.inner.open_readonly(path)
    }

    fn create_unique(&self, template: &std::path::Path) -> BackendResult<(RawFd, PathBuf)> {
        self.inner.create_unique(template)
    }

    fn rename(&self, old: &std::path::Path, new: &std::path::Path) -> BackendResult<()> {
        if self.fail_renames.load(Ordering::SeqCst) {
            return Err(Errno::EPERM);
        }
        self.inner.rename(old, new)
    }

    fn unlink(&self, path: &std::path::Path) -> BackendResult<()> {
        self.inner.unlink(path)
    }

    fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        self.inner.pread(fd, buf, offset)
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> BackendResult<usize> {
        self.inner.write(fd, buf)
    }

    fn lseek_start(&self, fd: RawFd) -> BackendResult<()> {
        self.inner.lseek_start(fd)
    }

    fn ftruncate_zero(&self, fd: RawFd) -> BackendResult<()> {
        self.inner.ftruncate_zero(fd)
    }

    fn fstat_size(&self, fd: RawFd) -> BackendResult<u64> {
        self.inner.fstat_size(fd)
    }

    fn chmod(&self, path: &std::path::Path, mode: u32) -> BackendResult<()> {
        self.inner.chmod(path, mode)
    }

    fn dup(&self, fd: RawFd) -> BackendResult<RawFd> {
        self.inner.dup(fd)
    }

    fn close(&self, fd: RawFd) -> BackendResult<()> {
        self.inner.close(fd)
    }

    fn copy(&self, from: &std::path::Path, to: &std::path::Path) -> BackendResult<()> {
        self.inner.copy(from, to)
    }
}
