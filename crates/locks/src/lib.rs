// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 rzlock contributors
//
// This file is part of rzlock.
//
// rzlock is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// rzlock is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with rzlock. If not, see <https://www.gnu.org/licenses/>.

//! # rzlock Distributed Reader/Writer Locks
//!
//! ## Purpose
//! Coordinates mutual exclusion across independent processes with read and
//! write leases on opaque string keys, layered over a sharded Redis-class
//! key/value store ([`rzlock_store`]).
//!
//! ## Architecture Context
//! The storage side keeps two keys per lock name (a write slot and a read
//! set) and mutates them only through atomic per-shard routines. This
//! crate is the client side: it generates comparable holder tokens,
//! retries with randomized exponential backoff until the routines grant
//! the lease, keeps the lease alive with a heartbeat task, and releases it
//! symmetrically.
//!
//! ## Key Components
//!
//! - [`Locker`]: entry point; owns the shard set, the token generator,
//!   and the configured defaults
//! - [`Lock`]: an owned lease (read or write, single-shard or a
//!   distributed composite over every shard)
//! - [`LockSet`]: aggregates handles by key with reference counting,
//!   dependent sets, and bulk operations
//! - [`Locking`]: the capability set shared by [`Locker`] and [`LockSet`]
//! - [`LockOptions`] / [`LockerConfig`]: typed options with documented
//!   defaults
//!
//! ## Coherence Rules
//! Readers share; a writer excludes everyone. A writer that finds readers
//! claims the write slot first (blocking new readers) and then polls until
//! the readers drain. With `resolve_conflicts`, two competing writers
//! settle deterministically: the lexicographically lower token wins and
//! the other fails fast, so callers can back out and retry instead of
//! deadlocking across keys.
//!
//! ## Examples
//!
//! ```rust
//! use rzlock_locks::{Locker, Locking, LockOptions};
//! use rzlock_store::ShardSet;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let locker = Locker::new(ShardSet::memory(4));
//!
//! let lock = locker.write_lock("account:42", LockOptions::default()).await?;
//! // ... mutate the account ...
//! lock.release().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::fmt;

pub mod error;
pub mod handle;
pub mod lockset;
pub mod locker;
pub mod options;
pub mod token;

mod distributed;
mod engine;

pub use error::{LockError, LockResult, LockedReason, ResourceLocked};
pub use handle::Lock;
pub use locker::{Locker, Locking};
pub use lockset::LockSet;
pub use options::{
    Distributed, LockOptions, LockerConfig, OnUpgradeError, WarnCallback,
    DEFAULT_LOCK_TIMEOUT_SECS, DEFAULT_MAX_WAIT_TIME_SECS, DEFAULT_PREFIX,
};
pub use token::{core_token, TokenGenerator, DEBUG_SENTINEL};

// Re-export the store surface callers need to construct a locker.
pub use rzlock_store::{LockStore, ShardSet, StoreConfig, StoreError};

/// Which side of the reader/writer coherence a lease is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRole {
    /// Shared read lease (a read-set member).
    Read,
    /// Exclusive write lease (the write-slot holder).
    Write,
}

impl fmt::Display for LockRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockRole::Read => write!(f, "read"),
            LockRole::Write => write!(f, "write"),
        }
    }
}
