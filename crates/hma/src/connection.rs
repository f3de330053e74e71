// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection lifecycle: joining a HMA (claiming a client slot), leaving
//! it cleanly, and detecting/recovering from dead peers on entry.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::HmaLayout;
use crate::error::{Error, Result};
use crate::hma_file::HmaFile;
use crate::lockfile::{self, Blocking, LockMode};
use crate::pager::{DbLockHandle, PagerHandle};
use crate::recovery;
use crate::registry;

/// Append-only per-connection lock bookkeeping (spec.md §3,
/// "Per-connection state").
#[derive(Default)]
pub(crate) struct LockHistory {
    /// Pages for which this connection has (or may have, modulo an
    /// in-flight CAS) a bit set in the HMA.
    pub(crate) pages: Vec<u32>,
    /// Time the WRITER (page 0) lock was last taken.
    pub(crate) write_started: Option<Instant>,
    /// Cumulative microseconds this connection has held the WRITER lock.
    pub(crate) write_us_cumulative: i64,
}

/// Shared (refcounted) state behind a live [`Connection`]. The HMA's
/// in-process client table stores a [`std::sync::Weak`] to this, not to
/// `Connection` itself, so recovery can inspect a peer without keeping it
/// alive.
pub(crate) struct ConnectionShared {
    pub(crate) hma: Arc<HmaFile>,
    pub(crate) client_id: u32,
    pub(crate) pager: Arc<dyn PagerHandle>,
    pub(crate) history: Mutex<LockHistory>,
}

/// A connection to one database's HMA, occupying one client slot.
pub struct Connection {
    pub(crate) inner: Arc<ConnectionShared>,
}

impl Connection {
    /// Join the HMA coordinating `pager.filename()`, claiming a free
    /// client slot.
    ///
    /// Scans client slots for one this process can write-lock
    /// non-blockingly (meaning no live peer currently occupies it). If
    /// the slot's stored word is nonzero, the previous holder exited
    /// abnormally and is recovered before the slot is claimed.
    pub fn connect(pager: Arc<dyn PagerHandle>) -> Result<Self> {
        Self::connect_with_layout(pager, HmaLayout::PRODUCTION)
    }

    /// As [`Connection::connect`], but with an explicit (possibly
    /// reduced) layout. Used by tests that want a small HMA file.
    pub(crate) fn connect_with_layout(
        pager: Arc<dyn PagerHandle>,
        layout: HmaLayout,
    ) -> Result<Self> {
        let hma = registry::open(pager.filename(), layout, pager.as_ref())?;
        let fd = hma.fd();

        for client_id in 0..layout.client_slots {
            // Held across the whole check-OFD-probe-store-publish
            // sequence below: the OFD write-lock probe only serializes
            // against *other processes* (every in-process caller shares
            // this `HmaFile`'s one `fd`, so two local threads never
            // conflict on it), so `aClient[]` must be the authoritative,
            // mutex-held gate for same-process callers (spec.md §5).
            let mut clients = hma.clients_lock();
            if clients[client_id as usize].is_some() {
                continue;
            }

            let slot = layout.client_lock_slot(client_id);
            match lockfile::lock(fd, slot, LockMode::Write, Blocking::No) {
                Ok(()) => {
                    let word = hma.client_word(client_id);
                    if word.load(Ordering::SeqCst) != 0 {
                        if let Err(e) = recovery::rollback_and_scrub(&hma, pager.as_ref(), client_id)
                        {
                            let _ = lockfile::lock(fd, slot, LockMode::None, Blocking::No);
                            return Err(e);
                        }
                    }

                    lockfile::lock(fd, slot, LockMode::Read, Blocking::No)?;
                    word.store(1, Ordering::SeqCst);

                    let shared = Arc::new(ConnectionShared {
                        hma: hma.clone(),
                        client_id,
                        pager,
                        history: Mutex::new(LockHistory::default()),
                    });
                    clients[client_id as usize] = Some(Arc::downgrade(&shared));
                    return Ok(Self { inner: shared });
                }
                Err(Error::Busy) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(Error::Busy)
    }

    /// This connection's claimed client id.
    #[must_use]
    pub fn client_id(&self) -> u32 {
        self.inner.client_id
    }

    /// Leave the HMA, releasing this connection's client slot.
    ///
    /// If this is the last in-process connection referencing the HMA
    /// and `db` is supplied and can be exclusively OS-locked, the HMA
    /// file is unlinked from disk (last-closer cleanup). Either way, the
    /// shared HMA mapping itself is only torn down once every process
    /// connection referencing it has gone away.
    pub fn disconnect(self, db: Option<&dyn DbLockHandle>) {
        let Self { inner } = self;
        let hma = &inner.hma;
        let fd = hma.fd();
        let layout = hma.layout();
        let client_id = inner.client_id;

        {
            // Held across the whole zero-clear-release sequence, same
            // as `connect`'s claim loop (spec.md §5).
            let mut clients = hma.clients_lock();
            hma.client_word(client_id).store(0, Ordering::SeqCst);
            clients[client_id as usize] = None;
            let _ = lockfile::lock(
                fd,
                layout.client_lock_slot(client_id),
                LockMode::None,
                Blocking::No,
            );
        }

        if Arc::strong_count(hma) == 1 {
            if let Some(db) = db {
                if matches!(db.lock_exclusive(), Ok(true)) {
                    let _ = std::fs::remove_file(hma.path());
                }
            }
        }

        drop(inner);
    }

    /// Exposed for API symmetry with the original design; not yet
    /// assigned semantics (see spec.md §9, "`release_write_locks` stub").
    pub fn release_write_locks(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::support::{AlwaysExclusive, FakePager};

    fn small_layout() -> HmaLayout {
        HmaLayout {
            client_slots: 4,
            page_lock_slots: 8,
        }
    }

    #[test]
    fn first_connect_claims_slot_zero() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::fs::write(&db_path, b"").unwrap();
        let pager = Arc::new(FakePager::new(&db_path));

        let conn = Connection::connect_with_layout(pager, small_layout()).unwrap();
        assert_eq!(conn.client_id(), 0);
        assert_eq!(
            conn.inner.hma.client_word(0).load(Ordering::SeqCst),
            1
        );
        conn.disconnect(None);
    }

    #[test]
    fn two_connections_claim_distinct_slots() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::fs::write(&db_path, b"").unwrap();
        let pager = Arc::new(FakePager::new(&db_path));

        let a = Connection::connect_with_layout(pager.clone(), small_layout()).unwrap();
        let b = Connection::connect_with_layout(pager, small_layout()).unwrap();
        assert_ne!(a.client_id(), b.client_id());

        a.disconnect(None);
        b.disconnect(None);
    }

    /// Regression test for a data race where two threads racing
    /// `connect` on the same HMA could both pass the `aClient[]` check
    /// before either published into it (the OFD write-lock probe alone
    /// cannot catch this: every in-process caller shares one `fd`, so
    /// two local `F_OFD_SETLK` WRLCK requests on the same slot never
    /// conflict). Every claimed `client_id` must be distinct.
    #[test]
    fn concurrent_connects_claim_distinct_slots() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::fs::write(&db_path, b"").unwrap();
        let pager = Arc::new(FakePager::new(&db_path));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let pager = pager.clone();
                std::thread::spawn(move || {
                    Connection::connect_with_layout(pager, small_layout()).unwrap()
                })
            })
            .collect();

        let conns: Vec<Connection> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        let mut ids: Vec<u32> = conns.iter().map(Connection::client_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        for conn in conns {
            conn.disconnect(None);
        }
    }

    #[test]
    fn disconnect_zeroes_client_word_and_frees_slot() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::fs::write(&db_path, b"").unwrap();
        let pager = Arc::new(FakePager::new(&db_path));

        let a = Connection::connect_with_layout(pager.clone(), small_layout()).unwrap();
        let id = a.client_id();
        a.disconnect(None);

        let b = Connection::connect_with_layout(pager, small_layout()).unwrap();
        assert_eq!(b.client_id(), id);
        assert_eq!(
            b.inner.hma.client_word(id).load(Ordering::SeqCst),
            1
        );
        b.disconnect(None);
    }

    #[test]
    fn last_disconnect_unmaps_and_forgets_registry_entry() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::fs::write(&db_path, b"").unwrap();
        let pager = Arc::new(FakePager::new(&db_path));

        let (dev, ino) = crate::hma_file::stat_dev_ino(&db_path).unwrap();
        assert!(!registry::has_live_entry(dev, ino));
        let a = Connection::connect_with_layout(pager, small_layout()).unwrap();
        assert!(registry::has_live_entry(dev, ino));
        a.disconnect(None);
        assert!(!registry::has_live_entry(dev, ino));
    }

    /// Scenario 1 of spec.md §8: last-closer cleanup unlinks the HMA
    /// file once the final in-process client disconnects and the
    /// database file can be exclusively OS-locked.
    #[test]
    fn last_closer_with_exclusive_db_lock_unlinks_hma_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::fs::write(&db_path, b"").unwrap();
        let pager = Arc::new(FakePager::new(&db_path));

        let hma_path = crate::hma_file::hma_path_for(&db_path);
        let a = Connection::connect_with_layout(pager, small_layout()).unwrap();
        assert!(hma_path.exists());

        a.disconnect(Some(&AlwaysExclusive));
        assert!(!hma_path.exists());
    }
}
