//! Process-wide single-instance guard.
//!
//! A second engine on the same host would fight over the screen, the input
//! devices, and the signaling session id, so startup acquires an exclusive
//! lock and exits 0 if another instance already holds it.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Held for the process lifetime; dropping it releases the lock.
pub struct InstanceLock {
    #[cfg(unix)]
    _fd: std::os::fd::OwnedFd,
    #[cfg(not(unix))]
    _file: std::fs::File,
}

fn lock_path() -> PathBuf {
    std::env::temp_dir().join("AiRan.lock")
}

/// Try to become the single instance. Returns `Ok(None)` when another
/// process already holds the lock.
#[cfg(unix)]
pub fn acquire() -> Result<Option<InstanceLock>> {
    use std::os::fd::{FromRawFd, OwnedFd};

    let path = lock_path();
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .context("lock path contains a NUL byte")?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o644) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("opening {}", path.display()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let ret = unsafe {
        libc::flock(
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            libc::LOCK_EX | libc::LOCK_NB,
        )
    };
    if ret != 0 {
        // Locked by another instance.
        return Ok(None);
    }
    Ok(Some(InstanceLock { _fd: fd }))
}

/// Fallback for platforms without flock: exclusive lock-file creation. The
/// desktop build uses a `Global\AiRan` named mutex on Windows; a create-new
/// lock file gives the same single-winner behavior without extra deps.
#[cfg(not(unix))]
pub fn acquire() -> Result<Option<InstanceLock>> {
    let path = lock_path();
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => Ok(Some(InstanceLock { _file: file })),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e).with_context(|| format!("creating {}", path.display())),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// flock is per open-file-description, so a second acquire in the same
    /// process behaves exactly like a second process: it loses.
    #[test]
    fn second_acquire_fails_while_held() {
        let first = acquire().unwrap();
        if first.is_none() {
            // Another test binary on this machine holds the lock; nothing
            // meaningful to assert.
            return;
        }
        let second = acquire().unwrap();
        assert!(second.is_none());

        drop(first);
        let third = acquire().unwrap();
        assert!(third.is_some());
    }
}
