use std::path::PathBuf;

/// Static configuration for one cache instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the content-addressed store.
    pub root: PathBuf,
    /// The cache directory is shared with other hosts.
    pub alien: bool,
    /// Marker file removed when the cache downgrades to read-only.
    pub liveness_marker: Option<PathBuf>,
    /// Whether the backing store reports final file sizes immediately.
    /// Eventually consistent shared stores report 0 for a while; for those,
    /// a zero observed size passes the commit size check.
    pub reports_correct_filesize: bool,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CacheConfig {
            root: root.into(),
            alien: false,
            liveness_marker: None,
            reports_correct_filesize: true,
        }
    }

    /// Mark the cache as shared between hosts.  Shared stores do not reliably
    /// report file sizes, so the zero-size exemption is enabled as well.
    pub fn alien(mut self) -> Self {
        self.alien = true;
        self.reports_correct_filesize = false;
        self
    }

    pub fn liveness_marker(mut self, path: impl Into<PathBuf>) -> Self {
        self.liveness_marker = Some(path.into());
        self
    }
}
