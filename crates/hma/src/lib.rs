// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HMA: a multi-process, page-granularity lock manager over a
//! memory-mapped coordination file.
//!
//! A database file `X` is coordinated by a sibling file `X-hma`, mapped
//! `MAP_SHARED` by every process with a [`Connection`] open against `X`.
//! The coordination file is carved into three regions: a single DMS
//! ("database mapping state") word, `CLIENT_SLOTS` client liveness
//! words, and `PAGE_LOCK_SLOTS` page-lock words, each updated via atomic
//! compare-and-swap and backed by a POSIX advisory byte-range lock used
//! to detect whether the process that last touched a slot is still
//! alive.
//!
//! Call [`Connection::connect`] to join a database's HMA, [`Connection::begin`]
//! and [`Connection::end`] to bracket a transaction, [`Connection::lock`]
//! to acquire SHARED or RESERVED/EXCLUSIVE access to a page, and
//! [`Connection::disconnect`] to leave cleanly.

mod config;
mod connection;
mod error;
mod hma_file;
mod lock;
mod lockfile;
mod pager;
mod recovery;
mod registry;
mod testing;
mod wordcodec;

pub use config::{HmaLayout, CLIENT_SLOTS, PAGE_LOCK_SLOTS};
pub use connection::Connection;
pub use error::{Error, Result};
pub use pager::{DbLockHandle, PagerHandle};
