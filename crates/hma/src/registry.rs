// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide table of open HMA files, keyed by the database's
//! `(device, inode)`.
//!
//! Grounded on `hdds::dds::domain_registry::DomainRegistry`: a single
//! lazily-initialized, mutex-guarded `HashMap` of weak references, where
//! `get_or_create` upgrades an existing weak entry or builds a fresh one
//! under the lock. The only difference here is that building a fresh
//! entry does real (but quick, non-blocking-by-default) file I/O, which
//! spec.md §5 explicitly allows inside the lock-holding section.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::config::HmaLayout;
use crate::error::Result;
use crate::hma_file::{self, HmaFile};
use crate::pager::PagerHandle;

struct Registry {
    entries: HashMap<(u64, u64), Weak<HmaFile>>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            entries: HashMap::new(),
        })
    })
}

/// Open (or join) the HMA file coordinating access to `db_path`.
///
/// Looks up an existing entry by the database's `(device, inode)`; if
/// none exists, this call performs the HMA file's open-or-create and
/// mmap dance itself while still holding the process mutex, so a
/// concurrent `open` for the same database observes a fully-initialized
/// entry rather than a half-built one.
pub(crate) fn open(
    db_path: &Path,
    layout: HmaLayout,
    pager: &dyn PagerHandle,
) -> Result<Arc<HmaFile>> {
    let (dev, ino) = hma_file::stat_dev_ino(db_path)?;

    let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());

    if let Some(existing) = reg.entries.get(&(dev, ino)).and_then(Weak::upgrade) {
        return Ok(existing);
    }

    let hma_path = hma_file::hma_path_for(db_path);
    let file = HmaFile::open(&hma_path, dev, ino, layout, pager)?;
    let shared = Arc::new(file);
    reg.entries.insert((dev, ino), Arc::downgrade(&shared));
    Ok(shared)
}

/// Called from [`HmaFile::drop`] to remove a stale entry once its last
/// reference has gone away. A no-op if another connection raced in and
/// reconnected to this database in the meantime (common when a process's
/// last local client disconnects and immediately reconnects).
pub(crate) fn forget(dev: u64, ino: u64) {
    let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(weak) = reg.entries.get(&(dev, ino)) {
        if weak.strong_count() == 0 {
            reg.entries.remove(&(dev, ino));
        }
    }
}

#[cfg(test)]
pub(crate) fn has_live_entry(dev: u64, ino: u64) -> bool {
    let reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    reg.entries
        .get(&(dev, ino))
        .is_some_and(|w| w.strong_count() > 0)
}
