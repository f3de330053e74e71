// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The page-lock engine: per-page SHARED/RESERVED/EXCLUSIVE acquisition
//! and release via atomic CAS on page-lock slot words (spec.md §4.4).

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::lockfile::{self, Blocking, LockMode};
use crate::recovery;
use crate::wordcodec::{
    clear_write_field, has_reader_bit, read_conflicts, with_reader_bit, with_write_field,
    without_reader_bit, write_conflicts, write_field,
};

impl Connection {
    /// Begin a transaction: take the blocking WRITER token on this
    /// connection's own client slot (serializing this connection's own
    /// transactions against itself across threads), then take SHARED on
    /// page 0.
    pub fn begin(&self) -> Result<()> {
        let fd = self.inner.hma.fd();
        let slot = self
            .inner
            .hma
            .layout()
            .client_lock_slot(self.inner.client_id);
        lockfile::lock(fd, slot, LockMode::Write, Blocking::Yes)?;
        self.lock(0, false, true)
    }

    /// End a transaction: release every page recorded in this
    /// connection's lock-history, fold WRITER hold time if page 0 was
    /// among them, then release this connection's own WRITER token back
    /// to a reader-lock.
    pub fn end(&self) -> Result<()> {
        let conn = &self.inner;
        let client_id = conn.client_id;

        let pages = {
            let mut history = conn.history.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut history.pages)
        };

        for page in pages {
            let word = conn.hma.page_lock_word(page);
            loop {
                let v = word.load(Ordering::SeqCst);
                let mut n = v;
                if write_field(v) == Some(client_id) {
                    n = clear_write_field(n);
                }
                n = without_reader_bit(n, client_id);
                if n == v {
                    break;
                }
                match word.compare_exchange(v, n, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => break,
                    Err(_) => continue,
                }
            }

            if page == 0 {
                let mut history = conn.history.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(started) = history.write_started.take() {
                    let elapsed_us = started.elapsed().as_micros() as i64;
                    let before_secs = history.write_us_cumulative / 1_000_000;
                    history.write_us_cumulative += elapsed_us;
                    if before_secs != history.write_us_cumulative / 1_000_000 {
                        log::info!(
                            "cumulative WRITER time: {}ms",
                            history.write_us_cumulative / 1000
                        );
                    }
                }
            }
        }

        let fd = conn.hma.fd();
        let slot = conn.hma.layout().client_lock_slot(client_id);
        lockfile::lock(fd, slot, LockMode::Read, Blocking::No)
    }

    /// Acquire SHARED (`write = false`) or RESERVED/EXCLUSIVE
    /// (`write = true`) on `page`.
    pub fn lock(&self, page: u32, write: bool, blocking: bool) -> Result<()> {
        let result = self.lock_inner(page, write, blocking);

        if result.is_ok() && page == 0 {
            let mut history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
            history.write_started = Some(Instant::now());
        }

        debug_assert!(result.is_err() || self.has_lock(page, write));
        result
    }

    fn lock_inner(&self, page: u32, write: bool, blocking: bool) -> Result<()> {
        let conn = &self.inner;
        let client_id = conn.client_id;
        let word = conn.hma.page_lock_word(page);

        let mut v = word.load(Ordering::SeqCst);
        let already_held = if write {
            write_field(v) == Some(client_id)
        } else {
            has_reader_bit(v, client_id)
        };
        if already_held {
            return Ok(());
        }

        {
            let mut history = conn.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.pages.len() == history.pages.capacity() {
                let additional = history.pages.len().max(128);
                history.pages.try_reserve(additional).map_err(|_| Error::NoMem)?;
            }
            history.pages.push(page);
        }

        let mut reserved = false;

        'retry: loop {
            loop {
                let conflict = if write {
                    write_conflicts(v, client_id)
                } else {
                    read_conflicts(v, client_id)
                };
                if !conflict {
                    break;
                }

                if write && blocking && write_field(v).is_none() {
                    let n = with_write_field(v, client_id);
                    match word.compare_exchange(v, n, Ordering::SeqCst, Ordering::SeqCst) {
                        Ok(_) => {
                            v = n;
                            reserved = true;
                            continue;
                        }
                        Err(actual) => {
                            v = actual;
                            continue;
                        }
                    }
                }

                match recovery::overcome_lock(conn, blocking, v) {
                    Ok(true) => {
                        v = word.load(Ordering::SeqCst);
                        continue;
                    }
                    Ok(false) => {
                        log::warn!("conflict at page {page}");
                        if reserved {
                            restore_reserved(conn, word, client_id);
                        }
                        return Err(Error::BusyDeadlock);
                    }
                    Err(e) => {
                        if reserved {
                            restore_reserved(conn, word, client_id);
                        }
                        return Err(e);
                    }
                }
            }

            let mut n = with_reader_bit(v, client_id);
            if write {
                n = with_write_field(n, client_id);
            }
            match word.compare_exchange(v, n, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break 'retry,
                Err(actual) => {
                    v = actual;
                    continue 'retry;
                }
            }
        }

        Ok(())
    }

    /// Read-only inspection of whether this connection holds `write`
    /// (RESERVED/EXCLUSIVE) or shared access on `page`. No atomic
    /// read-modify-write is needed for the answer itself.
    #[must_use]
    pub fn has_lock(&self, page: u32, write: bool) -> bool {
        let v = self.inner.hma.page_lock_word(page).load(Ordering::SeqCst);
        if write {
            write_field(v) == Some(self.inner.client_id)
        } else {
            has_reader_bit(v, self.inner.client_id)
        }
    }
}

/// Undo a RESERVED install this call made, on an error exit: clear the
/// write field while leaving the reader bitmask untouched.
fn restore_reserved(
    conn: &crate::connection::ConnectionShared,
    word: &std::sync::atomic::AtomicU32,
    client_id: u32,
) {
    debug_assert_eq!(conn.client_id, client_id);
    loop {
        let v = word.load(Ordering::SeqCst);
        debug_assert_eq!(write_field(v), Some(client_id));
        let n = clear_write_field(v);
        match word.compare_exchange(v, n, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HmaLayout;
    use crate::testing::support::FakePager;
    use std::sync::Arc;

    fn small_layout() -> HmaLayout {
        HmaLayout {
            client_slots: 4,
            page_lock_slots: 8,
        }
    }

    fn connected_pair() -> (tempfile::TempDir, Arc<FakePager>, Connection, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::fs::write(&db_path, b"").unwrap();
        let pager = Arc::new(FakePager::new(&db_path));
        let layout = small_layout();
        let a = Connection::connect_with_layout(pager.clone(), layout).unwrap();
        let b = Connection::connect_with_layout(pager.clone(), layout).unwrap();
        (dir, pager, a, b)
    }

    /// Scenario 2 of spec.md §8: two connections share SHARED on one page.
    #[test]
    fn two_readers_share_a_page() {
        let (_dir, _pager, a, b) = connected_pair();

        a.lock(42, false, true).unwrap();
        b.lock(42, false, true).unwrap();
        assert!(a.has_lock(42, false));
        assert!(b.has_lock(42, false));

        a.end().unwrap();
        assert!(!a.has_lock(42, false));
        assert!(b.has_lock(42, false));
        b.end().unwrap();
        assert!(!b.has_lock(42, false));
    }

    /// Idempotence law from spec.md §8: repeating a SHARED request is a
    /// no-op on shared state; only the first call extends the history.
    #[test]
    fn repeated_shared_lock_is_idempotent() {
        let (_dir, _pager, a, _b) = connected_pair();
        a.lock(5, false, true).unwrap();
        a.lock(5, false, true).unwrap();
        assert_eq!(a.inner.history.lock().unwrap().pages, vec![5]);
    }

    /// Scenario 3 of spec.md §8: a write request against a page another
    /// *live local* connection holds SHARED surfaces `BusyDeadlock`
    /// rather than blocking, per the open question in spec.md §9
    /// resolved in DESIGN.md (a live local peer can never be recovered
    /// from, so non-blocking and blocking requests alike have no
    /// progress to make).
    #[test]
    fn write_against_live_local_reader_is_deadlock() {
        let (_dir, _pager, a, b) = connected_pair();

        a.lock(100, false, true).unwrap();
        let err = b.lock(100, true, false).unwrap_err();
        assert!(matches!(err, Error::BusyDeadlock));
        assert!(!b.has_lock(100, true));

        a.end().unwrap();
        b.lock(100, true, false).unwrap();
        assert!(b.has_lock(100, true));
    }

    /// Scenario 5 of spec.md §8: RESERVED is installed while the other
    /// reader's bit is still set, and is rolled back on the
    /// `BusyDeadlock` exit so a later retry starts from a clean slot.
    #[test]
    fn reserved_is_installed_then_rolled_back_on_deadlock() {
        let (_dir, _pager, a, b) = connected_pair();

        a.lock(0, false, true).unwrap();
        let err = b.lock(0, true, true).unwrap_err();
        assert!(matches!(err, Error::BusyDeadlock));

        // RESERVED must have been rolled back: A's reader bit survives
        // untouched and B holds neither the reader bit nor the write field.
        assert!(a.has_lock(0, false));
        assert!(!b.has_lock(0, true));
        let word = a.inner.hma.page_lock_word(0).load(Ordering::SeqCst);
        assert_eq!(write_field(word), None);

        a.end().unwrap();
        b.lock(0, true, true).unwrap();
        assert!(b.has_lock(0, true));
    }

    /// `begin`/`end` is a no-op on shared state modulo WRITER timing
    /// (round-trip law from spec.md §8).
    #[test]
    fn begin_end_round_trip_releases_page_zero() {
        let (_dir, _pager, a, _b) = connected_pair();
        a.begin().unwrap();
        assert!(a.has_lock(0, false));
        a.end().unwrap();
        assert!(!a.has_lock(0, false));
    }

    /// Scenario 4 of spec.md §8: a connection that crashes while holding
    /// EXCLUSIVE is recovered through `overcome_lock` the next time a
    /// live peer's `lock()` conflicts with it, not merely on `connect`.
    ///
    /// The crash is simulated by releasing the dead connection's own
    /// client-slot OS lock directly (as process exit would) while
    /// dropping its in-process handle, without clearing its HMA client
    /// word — leaving the same "dirty slot, no live holder" state
    /// `overcome_lock` is specified to detect.
    #[test]
    fn overcome_lock_recovers_dead_writer_and_retries() {
        let (_dir, pager, a, b) = connected_pair();
        assert_eq!(a.client_id(), 0);
        assert_eq!(b.client_id(), 1);

        a.lock(7, true, false).unwrap();
        assert!(a.has_lock(7, true));

        let fd = a.inner.hma.fd();
        let slot0 = a.inner.hma.layout().client_lock_slot(0);
        drop(a);
        lockfile::lock(fd, slot0, LockMode::None, Blocking::No).unwrap();

        b.lock(7, true, false).unwrap();
        assert!(b.has_lock(7, true));
        assert_eq!(pager.rollback_calls.lock().unwrap().last(), Some(&0));
    }
}
