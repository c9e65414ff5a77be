/// Byte-level passthrough to the backing store.
/// These wrap the raw syscalls and convert failures to errno values.
use std::ffi::CString;
use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tracing::debug;

pub type BackendResult<T> = Result<T, Errno>;

/// Primitive operations on the backing store.
///
/// Everything the cache core does to disk goes through this surface; a
/// wrapper implementation can intercept single operations.
pub trait StorageBackend: Send + Sync {
    fn open_readonly(&self, path: &Path) -> BackendResult<RawFd>;

    /// Create a file from a `mkstemp`-style template.  The file must not
    /// pre-exist; returns the descriptor and the resolved path.
    fn create_unique(&self, template: &Path) -> BackendResult<(RawFd, PathBuf)>;

    /// Atomically replace `new` with `old`.
    fn rename(&self, old: &Path, new: &Path) -> BackendResult<()>;

    fn unlink(&self, path: &Path) -> BackendResult<()>;

    fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> BackendResult<usize>;

    fn write(&self, fd: RawFd, buf: &[u8]) -> BackendResult<usize>;

    fn lseek_start(&self, fd: RawFd) -> BackendResult<()>;

    fn ftruncate_zero(&self, fd: RawFd) -> BackendResult<()>;

    fn fstat_size(&self, fd: RawFd) -> BackendResult<u64>;

    fn chmod(&self, path: &Path, mode: u32) -> BackendResult<()>;

    fn dup(&self, fd: RawFd) -> BackendResult<RawFd>;

    fn close(&self, fd: RawFd) -> BackendResult<()>;

    fn copy(&self, from: &Path, to: &Path) -> BackendResult<()>;
}

/// Production backend on a POSIX file system.
///
/// With `alien_on_network` set, rename is performed as link-then-unlink and
/// an existing target counts as success: another node may have already
/// materialized the same object.
pub struct PosixBackend {
    alien_on_network: bool,
}

impl PosixBackend {
    pub fn new(alien_on_network: bool) -> Self {
        PosixBackend { alien_on_network }
    }
}

impl StorageBackend for PosixBackend {
    fn open_readonly(&self, path: &Path) -> BackendResult<RawFd> {
        let c_path = path_to_cstring(path)?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY) };
        if fd < 0 {
            return Err(Errno::last());
        }
        Ok(fd)
    }

    fn create_unique(&self, template: &Path) -> BackendResult<(RawFd, PathBuf)> {
        let mut template = template.as_os_str().as_bytes().to_vec();
        template.push(0);
        let fd = unsafe { libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char) };
        if fd < 0 {
            return Err(Errno::last());
        }
        template.pop();
        Ok((fd, PathBuf::from(OsString::from_vec(template))))
    }

    fn rename(&self, old: &Path, new: &Path) -> BackendResult<()> {
        let c_old = path_to_cstring(old)?;
        let c_new = path_to_cstring(new)?;

        if !self.alien_on_network {
            return check(unsafe { libc::rename(c_old.as_ptr(), c_new.as_ptr()) });
        }

        if unsafe { libc::link(c_old.as_ptr(), c_new.as_ptr()) } != 0 {
            let errno = Errno::last();
            if errno == Errno::EEXIST {
                debug!("{} already existed, ignoring", new.display());
            } else {
                return Err(errno);
            }
        }
        check(unsafe { libc::unlink(c_old.as_ptr()) })
    }

    fn unlink(&self, path: &Path) -> BackendResult<()> {
        let c_path = path_to_cstring(path)?;
        check(unsafe { libc::unlink(c_path.as_ptr()) })
    }

    fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        let n = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(Errno::last());
        }
        Ok(n as usize)
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> BackendResult<usize> {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(Errno::last());
        }
        Ok(n as usize)
    }

    fn lseek_start(&self, fd: RawFd) -> BackendResult<()> {
        if unsafe { libc::lseek(fd, 0, libc::SEEK_SET) } < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    fn ftruncate_zero(&self, fd: RawFd) -> BackendResult<()> {
        check(unsafe { libc::ftruncate(fd, 0) })
    }

    fn fstat_size(&self, fd: RawFd) -> BackendResult<u64> {
        unsafe {
            let mut st: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut st) != 0 {
                return Err(Errno::last());
            }
            Ok(st.st_size as u64)
        }
    }

    fn chmod(&self, path: &Path, mode: u32) -> BackendResult<()> {
        let c_path = path_to_cstring(path)?;
        check(unsafe { libc::chmod(c_path.as_ptr(), mode as libc::mode_t) })
    }

    fn dup(&self, fd: RawFd) -> BackendResult<RawFd> {
        let new_fd = unsafe { libc::dup(fd) };
        if new_fd < 0 {
            return Err(Errno::last());
        }
        Ok(new_fd)
    }

    fn close(&self, fd: RawFd) -> BackendResult<()> {
        check(unsafe { libc::close(fd) })
    }

    fn copy(&self, from: &Path, to: &Path) -> BackendResult<()> {
        std::fs::copy(from, to)
            .map(|_| ())
            .map_err(|e| e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO))
    }
}

fn path_to_cstring(path: &Path) -> BackendResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

fn check(ret: libc::c_int) -> BackendResult<()> {
    if ret != 0 {
        return Err(Errno::last());
    }
    Ok(())
}
