use std::io;

use crate::hash::ObjectId;

/// Result of a transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadCode {
    Ok,
    /// Could not reach any host.
    HostConnection,
    /// Transfer started but timed out.
    Timeout,
    /// Malformed or unresolvable URL.
    BadUrl,
    /// Payload did not match the expected content hash.
    BadData,
}

impl DownloadCode {
    pub fn is_ok(self) -> bool {
        self == DownloadCode::Ok
    }

    pub fn is_integrity_failure(self) -> bool {
        self == DownloadCode::BadData
    }
}

/// One transfer request.  The destination receives the decompressed payload;
/// the download manager verifies it against `expected_hash`.
pub struct DownloadJob<'a> {
    pub url: String,
    pub expected_hash: &'a ObjectId,
    /// Free-form provenance string, forwarded for diagnostics.
    pub extra_info: &'a str,
    pub compressed: bool,
    pub probe_hosts: bool,
    pub destination: &'a mut dyn io::Write,
}

/// Remote transport.  Implementations own retry, host selection, and
/// timeout policy; failures surface as a [`DownloadCode`].
pub trait DownloadManager: Send + Sync {
    fn fetch(&self, job: &mut DownloadJob<'_>) -> DownloadCode;
}
