use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::hash::ObjectId;

/// Maps content hashes to canonical locations under the cache root.
///
/// Committed objects live in 256 fan-out directories (`00/` .. `ff/`) named
/// by the remaining hex of their hash.  Staged writes accumulate under
/// `txn/`; artifacts that fail verification are retained under
/// `quarantine/` for diagnosis.
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CacheLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical backing-store path for `id`.
    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.root.join(id.path_name())
    }

    pub fn txn_dir(&self) -> PathBuf {
        self.root.join("txn")
    }

    /// Template for the unique-name allocator of staging files.
    pub fn txn_template(&self) -> PathBuf {
        self.txn_dir().join("fetchXXXXXX")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join("quarantine")
    }

    /// Quarantine entries are named by the display form of the id.
    pub fn quarantine_path(&self, id: &ObjectId) -> PathBuf {
        self.quarantine_dir().join(id.to_string())
    }

    /// Create the root, the 256 fan-out directories, `txn/` and
    /// `quarantine/`.  Mode 0700 for a private cache, 0770 for a shared one.
    pub fn create_all(&self, alien: bool) -> io::Result<()> {
        let mode = if alien { 0o770 } else { 0o700 };
        make_dir(&self.root, mode)?;
        for prefix in 0..=0xffu32 {
            make_dir(&self.root.join(format!("{:02x}", prefix)), mode)?;
        }
        make_dir(&self.txn_dir(), mode)?;
        make_dir(&self.quarantine_dir(), mode)?;
        Ok(())
    }
}

/// mkdir -p followed by an explicit chmod, so the requested mode survives
/// the process umask and pre-existing directories.
fn make_dir(path: &Path, mode: u32) -> io::Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}
