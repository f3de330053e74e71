// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A single open, memory-mapped HMA coordination file shared by every
//! in-process connection pointed at the same underlying database.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::AtomicU32;
use std::sync::{Mutex, Weak};

use crate::config::HmaLayout;
use crate::connection::ConnectionShared;
use crate::error::{Error, Result};
use crate::lockfile::{self, Blocking, LockMode};
use crate::registry;

/// A memory-mapped HMA file plus the bookkeeping this process needs to
/// adopt, recover, and release client slots on it.
///
/// Dropped (unmapped, closed, and removed from the process registry)
/// when the last [`crate::Connection`] referencing it goes away.
pub struct HmaFile {
    path: PathBuf,
    fd: RawFd,
    map: *mut u8,
    layout: HmaLayout,
    pub(crate) dev: u64,
    pub(crate) ino: u64,
    /// In-process connections occupying each client slot, indexed by
    /// client id. Guarded by its own mutex (distinct from the registry's
    /// map mutex): the registry mutex governs *which* `HmaFile` exists
    /// for a given database, this one governs *who* occupies its slots.
    clients: Mutex<Vec<Option<Weak<ConnectionShared>>>>,
}

// SAFETY: `map` points at a `MAP_SHARED` mapping; all access to the
// words within it goes through atomic operations (see `word`), so
// sharing `&HmaFile` across threads is sound.
unsafe impl Send for HmaFile {}
unsafe impl Sync for HmaFile {}

impl HmaFile {
    /// Open (creating if necessary) the HMA file at `hma_path` and map
    /// it. If this process is the first to write-lock the DMS slot, it
    /// initializes the file's contents and rolls back every client
    /// index's journal (a prior crash may have left any of them dirty).
    /// Always returns with a blocking read-lock held on the DMS slot.
    pub(crate) fn open(
        hma_path: &Path,
        dev: u64,
        ino: u64,
        layout: HmaLayout,
        pager: &dyn crate::pager::PagerHandle,
    ) -> Result<Self> {
        let c_path = CString::new(hma_path.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::CantOpen(io::Error::from(io::ErrorKind::InvalidInput)))?;

        // SAFETY: `c_path` is a valid NUL-terminated path; `open` with
        // O_CREAT|O_RDWR is the standard "open or create" idiom.
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o644) };
        if fd < 0 {
            return Err(Error::CantOpen(io::Error::last_os_error()));
        }

        let init_result = lockfile::lock(fd, layout.dms_lock_slot(), LockMode::Write, Blocking::No);
        let is_initializer = match init_result {
            Ok(()) => true,
            Err(Error::Busy) => false,
            Err(e) => {
                // SAFETY: `fd` is open and not used again on this path.
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        if is_initializer {
            // SAFETY: `fd` is valid and open for writing.
            let rc = unsafe { libc::ftruncate(fd, layout.file_size() as libc::off_t) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                // SAFETY: `fd` is valid and not reused after this error path.
                unsafe { libc::close(fd) };
                return Err(Error::CantOpen(err));
            }
        }

        // SAFETY: ptr::null_mut lets the kernel pick an address; `fd` is
        // valid and sized to at least `layout.file_size()` bytes by the
        // truncate above (or by a prior initializer in another process).
        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                layout.file_size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            // SAFETY: `fd` is valid and not reused after this error path.
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }
        let map = map as *mut u8;

        if is_initializer {
            // SAFETY: `map` is valid for `layout.file_size()` bytes from the mmap above.
            unsafe { ptr::write_bytes(map, 0, layout.file_size()) };
            for client_id in 0..layout.client_slots {
                if let Err(e) = pager.rollback_journal(client_id) {
                    // SAFETY: `map`/`fd` were obtained above and are not
                    // used again on this error path; no `HmaFile` was
                    // ever constructed, so nothing else will unmap/close
                    // them for us.
                    unsafe {
                        libc::munmap(map as *mut libc::c_void, layout.file_size());
                        libc::close(fd);
                    }
                    return Err(Error::Io(e));
                }
            }
        }

        // Downgrade (or, for a non-initializer, simply take) a blocking
        // read-lock on the DMS slot. This persists until this process
        // has no clients left on the HMA.
        if let Err(e) = lockfile::lock(fd, layout.dms_lock_slot(), LockMode::Read, Blocking::Yes) {
            // SAFETY: same as above — no `HmaFile` exists yet to clean
            // this up on our behalf.
            unsafe {
                libc::munmap(map as *mut libc::c_void, layout.file_size());
                libc::close(fd);
            }
            return Err(e);
        }

        Ok(Self {
            path: hma_path.to_path_buf(),
            fd,
            map,
            layout,
            dev,
            ino,
            clients: Mutex::new(vec![None; layout.client_slots as usize]),
        })
    }

    #[must_use]
    pub fn layout(&self) -> HmaLayout {
        self.layout
    }

    #[must_use]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    #[must_use]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Atomic view of word `idx` of the mapped file.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds for this file's layout.
    pub(crate) fn word(&self, idx: usize) -> &AtomicU32 {
        let word_count = self.layout.file_size() / 4;
        assert!(idx < word_count, "word index {idx} out of bounds");
        // SAFETY: `self.map` is a `MAP_SHARED` mapping of at least
        // `word_count * 4` bytes, 4-byte aligned (mmap returns
        // page-aligned memory), and every access to it is atomic, which
        // is what makes the mapping safe to share across threads and
        // processes in the first place.
        unsafe { &*(self.map as *const AtomicU32).add(idx) }
    }

    pub(crate) fn client_word(&self, client_id: u32) -> &AtomicU32 {
        self.word(self.layout.client_word(client_id))
    }

    pub(crate) fn page_lock_word(&self, page: u32) -> &AtomicU32 {
        self.word(self.layout.page_lock_word(page))
    }

    /// Lock the in-process client table (`aClient[]`) and return the
    /// guard. Every connect, disconnect, and recovery attempt must hold
    /// this guard across its *entire* critical section (spec.md §5:
    /// "protected by a single process-wide mutex. Every connect,
    /// disconnect, and recovery attempt takes it") — not just around the
    /// individual reads/writes of `aClient[]`, since the OFD
    /// advisory-lock probe on a client slot only serializes against
    /// *other processes* (it shares this `HmaFile`'s one `fd`, so two
    /// in-process callers never conflict on it). Callers bind the guard
    /// for the lifetime of their claim/recovery logic instead of
    /// re-acquiring it per field access.
    pub(crate) fn clients_lock(&self) -> std::sync::MutexGuard<'_, Vec<Option<Weak<ConnectionShared>>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for HmaFile {
    fn drop(&mut self) {
        // SAFETY: `self.map` was obtained from a successful mmap above
        // with exactly `self.layout.file_size()` bytes, and this is the
        // only place it is ever unmapped.
        unsafe {
            libc::munmap(self.map as *mut libc::c_void, self.layout.file_size());
        }
        // SAFETY: `self.fd` is open and not used again after Drop runs.
        unsafe {
            libc::close(self.fd);
        }
        registry::forget(self.dev, self.ino);
    }
}

/// Derive a path's `(dev, ino)` pair, used as the registry key (the
/// database file's identity, per spec.md §4.2, not the HMA file's).
pub(crate) fn stat_dev_ino(path: &Path) -> Result<(u64, u64)> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::CantOpen(io::Error::from(io::ErrorKind::InvalidInput)))?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: `c_path` is a valid NUL-terminated path and `st` is a
    // properly sized, zero-initialized `libc::stat` the kernel fills in.
    let rc = unsafe { libc::stat(c_path.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(Error::CantOpen(io::Error::last_os_error()));
    }
    Ok((st.st_dev as u64, st.st_ino as u64))
}

/// `X` -> `X-hma`.
pub(crate) fn hma_path_for(db_path: &Path) -> PathBuf {
    let mut s = db_path.as_os_str().to_os_string();
    s.push("-hma");
    PathBuf::from(s)
}
