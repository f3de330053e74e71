// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX advisory byte-range locking over HMA "slots".
//!
//! Each slot is a single byte at offset `slot * 4` in the HMA file (the
//! first byte of the corresponding 32-bit word). This is the only place
//! that translates OS errno values into [`crate::Error`].
//!
//! Locks are taken with the open-file-description variants (`F_OFD_SETLK`
//! / `F_OFD_SETLKW`) rather than classic `F_SETLK`/`F_SETLKW`: ownership
//! of a plain POSIX record lock is the *process*, so a second `open()` of
//! the same file from the same process would silently merge with a lock
//! the process already held instead of conflicting with it. OFD locks are
//! owned by the open file description, giving each `open()` (whether from
//! another process or another connection within this one) independent
//! lock ownership, which is what a peer-liveness probe needs.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// The kind of advisory lock to request on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Release any lock this process holds on the slot.
    None,
    /// A shared (read) lock.
    Read,
    /// An exclusive (write) lock.
    Write,
}

/// Whether a lock request should block until it can be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking {
    No,
    Yes,
}

/// Request `mode` on advisory-lock slot `slot` of `fd`.
///
/// # Errors
///
/// - [`Error::BusyDeadlock`] if the OS reports a deadlock on a blocking request.
/// - [`Error::Busy`] on non-blocking contention.
/// - [`Error::Io`] on any other unexpected OS failure.
pub fn lock(fd: RawFd, slot: u32, mode: LockMode, blocking: Blocking) -> Result<()> {
    let l_type = match mode {
        LockMode::None => libc::F_UNLCK,
        LockMode::Read => libc::F_RDLCK,
        LockMode::Write => libc::F_WRLCK,
    };

    let mut flock: libc::flock = unsafe { std::mem::zeroed() };
    flock.l_type = l_type as libc::c_short;
    flock.l_whence = libc::SEEK_SET as libc::c_short;
    flock.l_start = (slot as libc::off_t) * 4;
    flock.l_len = 1;

    let cmd = match blocking {
        Blocking::No => libc::F_OFD_SETLK,
        Blocking::Yes => libc::F_OFD_SETLKW,
    };

    // SAFETY: `fd` is a valid, open file descriptor supplied by the
    // caller and owned for the duration of this call; `flock` is a
    // fully-initialized `libc::flock` describing a single-byte
    // byte-range lock within the file.
    let res = unsafe { libc::fcntl(fd, cmd, &flock) };
    if res == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EDEADLK) if blocking == Blocking::Yes => Err(Error::BusyDeadlock),
        Some(libc::EACCES) | Some(libc::EAGAIN) => Err(Error::Busy),
        _ => Err(Error::Io(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    fn tmp_fd() -> (tempfile::NamedTempFile, RawFd) {
        let f = tempfile::NamedTempFile::new().unwrap();
        f.as_file().set_len(64).unwrap();
        let fd = f.as_file().as_raw_fd();
        (f, fd)
    }

    #[test]
    fn read_lock_then_read_lock_same_process_succeeds() {
        let (_f, fd) = tmp_fd();
        lock(fd, 0, LockMode::Read, Blocking::No).unwrap();
        lock(fd, 0, LockMode::Read, Blocking::No).unwrap();
    }

    #[test]
    fn write_lock_excludes_other_fd_non_blocking() {
        let (f, fd) = tmp_fd();
        lock(fd, 0, LockMode::Write, Blocking::No).unwrap();

        let other = OpenOptions::new().write(true).open(f.path()).unwrap();
        let other_fd = other.as_raw_fd();
        let res = lock(other_fd, 0, LockMode::Write, Blocking::No);
        assert!(matches!(res, Err(Error::Busy)));
    }

    #[test]
    fn non_blocking_write_lock_probe_fails_when_peer_alive() {
        let (f, fd) = tmp_fd();
        lock(fd, 0, LockMode::Read, Blocking::No).unwrap();

        let other = OpenOptions::new().write(true).open(f.path()).unwrap();
        let other_fd = other.as_raw_fd();
        let res = lock(other_fd, 0, LockMode::Write, Blocking::No);
        assert!(matches!(res, Err(Error::Busy)));
    }

    #[test]
    fn non_blocking_write_lock_probe_succeeds_when_peer_dead() {
        let (_f, fd) = tmp_fd();
        lock(fd, 0, LockMode::Write, Blocking::No).unwrap();
        lock(fd, 0, LockMode::None, Blocking::No).unwrap();
        lock(fd, 0, LockMode::Write, Blocking::No).unwrap();
    }
}
