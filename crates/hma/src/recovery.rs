// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rolling back a client's journal and scrubbing its lock bits, either
//! because it was found dirty on connect (spec.md §4.3 step 3) or
//! because `overcome_lock` determined it is dead (spec.md §4.5).

use std::sync::atomic::Ordering;
use std::sync::Weak;

use crate::connection::ConnectionShared;
use crate::error::{Error, Result};
use crate::hma_file::HmaFile;
use crate::lockfile::{self, Blocking, LockMode};
use crate::pager::PagerHandle;
use crate::wordcodec::{clear_write_field, without_reader_bit, write_field};

/// Roll back `client_id`'s journal and clear every bit it holds across
/// every page-lock slot in `hma`.
pub(crate) fn rollback_and_scrub(
    hma: &HmaFile,
    pager: &dyn PagerHandle,
    client_id: u32,
) -> Result<()> {
    log::warn!("rolling back failed client {client_id}");
    pager.rollback_journal(client_id).map_err(Error::Io)?;

    let layout = hma.layout();
    for slot in 0..layout.page_lock_slots {
        let word = hma.page_lock_word(slot);
        loop {
            let v = word.load(Ordering::SeqCst);
            let mut n = without_reader_bit(v, client_id);
            if write_field(v) == Some(client_id) {
                n = clear_write_field(n);
            }
            if n == v {
                break;
            }
            match word.compare_exchange(v, n, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(_) => continue,
            }
        }
    }
    Ok(())
}

/// Try to make progress past a conflicting page-lock slot whose observed
/// value was `v`. Returns `Ok(true)` if the caller should reread the
/// slot and retry its CAS loop, `Ok(false)` if no progress is currently
/// possible (the caller should surface `BusyDeadlock`).
pub(crate) fn overcome_lock(conn: &ConnectionShared, blocking: bool, v: u32) -> Result<bool> {
    let client_id = conn.client_id;
    let layout = conn.hma.layout();

    let blocker = match write_field(v) {
        Some(w) if w != client_id => w,
        _ => (0..layout.client_slots)
            .find(|&b| b != client_id && (v & (1 << b)) != 0)
            .expect("overcome_lock called on a slot with no conflicting holder"),
    };

    // Held for the entire function, matching the original's
    // `serverEnterMutex()` scope (server.c:398-430): the `aClient[]`
    // check below is only authoritative while nothing else can publish
    // into it concurrently, and the OFD write-lock probe that follows
    // shares this process's one `fd` with every local connection, so it
    // cannot by itself distinguish "a local peer is mid-claim of this
    // slot" from "the peer is dead" (spec.md §5). Held across the
    // blocking read-lock wait too: that wait is one of the blocking
    // advisory-lock calls spec.md §5 explicitly allows inside the
    // mutex-held section.
    let clients = conn.hma.clients_lock();

    if clients[blocker as usize].as_ref().and_then(Weak::upgrade).is_some() {
        // A live local peer: no recovery is possible from here. The
        // caller either blocks (and will eventually see the peer
        // release) or surfaces BusyDeadlock. See spec.md §9's open
        // question on local-peer deadlock, resolved in DESIGN.md.
        return Ok(false);
    }

    let fd = conn.hma.fd();
    let slot = layout.client_lock_slot(blocker);

    match lockfile::lock(fd, slot, LockMode::Write, Blocking::No) {
        Ok(()) => {
            let rc = rollback_and_scrub(&conn.hma, conn.pager.as_ref(), blocker);
            let _ = lockfile::lock(fd, slot, LockMode::None, Blocking::No);
            rc?;
            Ok(true)
        }
        Err(Error::Busy) => {
            if blocking {
                lockfile::lock(fd, slot, LockMode::Read, Blocking::Yes)?;
                let _ = lockfile::lock(fd, slot, LockMode::None, Blocking::No);
                Ok(true)
            } else {
                Ok(false)
            }
        }
        Err(e) => Err(e),
    }
}
