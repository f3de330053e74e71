// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the HMA lock manager.

use std::fmt;
use std::io;

/// Errors that can occur while operating the HMA lock manager.
#[derive(Debug)]
pub enum Error {
    /// Non-blocking contention, or no free client slot was available.
    Busy,

    /// The OS reported a deadlock on a blocking request, or this module
    /// determined a lock is blocked by a live local peer with no possible
    /// recovery.
    BusyDeadlock,

    /// Allocation failure growing the lock-history buffer or the HMA
    /// registry entry.
    NoMem,

    /// The HMA file could not be stat'd, opened, or truncated.
    CantOpen(io::Error),

    /// An unexpected OS failure (mmap, unexpected fcntl error, ...).
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "resource busy"),
            Self::BusyDeadlock => write!(f, "deadlock detected"),
            Self::NoMem => write!(f, "allocation failure"),
            Self::CantOpen(e) => write!(f, "cannot open HMA file: {e}"),
            Self::Io(e) => write!(f, "unexpected I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CantOpen(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type used throughout the HMA lock manager.
pub type Result<T> = std::result::Result<T, Error>;
