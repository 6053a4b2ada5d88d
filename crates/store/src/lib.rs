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

//! # rzlock Sharded Lock-State Store
//!
//! ## Purpose
//! Provides the storage side of the rzlock distributed reader/writer lock
//! engine: per-shard atomic lock primitives (write slot, read set,
//! distributed flag) plus the shard-of-key router that addresses them.
//!
//! ## Architecture Context
//! Each lock name maps to two keys on its shard: a write slot holding at
//! most one holder token, and a read set holding the tokens of current
//! readers. Every state transition goes through one of the atomic routines
//! on [`LockStore`]; the routine runs to completion on the shard without
//! interleaving, so the client never observes a half-applied transition.
//!
//! ## Backend Support
//!
//! - **Memory**: sharded in-memory backend (always available, the test
//!   backend). Atomicity comes from holding the shard's write lock across
//!   the whole routine.
//! - **Redis**: one connection manager per shard (feature: `redis-backend`,
//!   default-on). The routines are embedded Lua scripts evaluated in a
//!   single round trip; Lua execution is single-threaded on the server.
//!
//! ## Examples
//!
//! ```rust
//! use rzlock_store::{AcquireReply, LockStore, ShardSet};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = ShardSet::memory(4);
//! let shard = store.shard(store.shard_for_key("account:42"))?;
//!
//! let reply = shard
//!     .write_lock_acquire("rzlock:write:account:42", "rzlock:read:account:42", "50abc1", 60)
//!     .await?;
//! assert!(matches!(reply, AcquireReply::Acquired { .. }));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use async_trait::async_trait;
use std::sync::Arc;

pub mod config;
pub mod error;
pub mod memory;

#[cfg(feature = "redis-backend")]
pub mod redis;

pub use config::{BackendType, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryLockStore;

#[cfg(feature = "redis-backend")]
pub use redis::{RedisLockStore, RedisStoreConfig};

/// Outcome of an acquisition routine.
///
/// The write slot and read set for a lock name move through these states
/// atomically; `Draining` is the only intermediate state and can occur
/// only for writers (slot claimed, readers still present).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireReply {
    /// Another holder owns the write slot; `holder` is its token.
    Conflict {
        /// Token of the current write-slot holder
        holder: String,
    },
    /// Lock granted. For read locks `readers` is the read set after the
    /// grant (including the caller's token); for write locks it is empty.
    Acquired {
        /// Read-set members after the grant
        readers: Vec<String>,
    },
    /// Write slot claimed but readers remain; the caller must poll with
    /// `write_lock_retry` until the read set drains.
    Draining {
        /// Read-set members still holding the lock
        readers: Vec<String>,
    },
}

/// Outcome of a heartbeat routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatReply {
    /// Lease extended; the caller is still the holder.
    Extended,
    /// The write slot now belongs to another token (writers only).
    Conflict {
        /// Token of the usurping holder
        holder: String,
    },
    /// The caller's token is gone (expired or force-released elsewhere).
    Lost,
}

/// Per-shard atomic lock-state operations.
///
/// ## Atomicity
/// Every method is a single atomic routine on the target shard: it runs to
/// completion without interleaving with any other routine on that shard.
/// A `ttl_secs` of 0 means "no expiry" throughout.
///
/// ## Errors
/// [`StoreError::ShardUnavailable`] marks a transient outage the caller
/// should treat as a retryable miss; everything else is a hard failure.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Try to join the read set.
    ///
    /// Returns `Conflict` if the write slot is held, otherwise adds
    /// `token` to the read set, applies the TTL, and returns `Acquired`
    /// with the members after the add.
    async fn read_lock_acquire(
        &self,
        write_key: &str,
        read_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<AcquireReply>;

    /// First write attempt: claim the write slot.
    ///
    /// Returns `Conflict` if another token holds the slot. Otherwise the
    /// slot is set to `token` (with TTL); if readers remain the reply is
    /// `Draining` with their tokens, else `Acquired`.
    async fn write_lock_acquire(
        &self,
        write_key: &str,
        read_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<AcquireReply>;

    /// Subsequent write attempt after a claim.
    ///
    /// Re-asserts the slot and refreshes the TTL when the slot is unset or
    /// already ours; returns `Conflict` when another writer preempted us.
    async fn write_lock_retry(
        &self,
        write_key: &str,
        read_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<AcquireReply>;

    /// Remove `token` from the read set; returns the remaining members.
    async fn read_lock_release(&self, read_key: &str, token: &str) -> StoreResult<Vec<String>>;

    /// Delete the write slot if `token` holds it; returns whether it did.
    async fn write_lock_release(&self, write_key: &str, token: &str) -> StoreResult<bool>;

    /// Extend the read set's TTL if `token` is still a member.
    async fn read_lock_heartbeat(
        &self,
        read_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<HeartbeatReply>;

    /// Extend the write slot's TTL if `token` still holds it.
    async fn write_lock_heartbeat(
        &self,
        write_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<HeartbeatReply>;

    /// Remaining TTL of a distributed flag in seconds.
    ///
    /// `None` means the flag is absent; `Some(-1)` means present without
    /// expiry.
    async fn flag_ttl_secs(&self, flag_key: &str) -> StoreResult<Option<i64>>;

    /// Set a distributed flag with the given expiry.
    async fn flag_set(&self, flag_key: &str, ttl_secs: u64) -> StoreResult<()>;

    /// Current write-slot holder, if any (introspection).
    async fn write_holder(&self, write_key: &str) -> StoreResult<Option<String>>;

    /// Current read-set members (introspection).
    async fn read_holders(&self, read_key: &str) -> StoreResult<Vec<String>>;
}

/// Shard-of-key router over a fixed set of [`LockStore`] shards.
///
/// Key placement uses a crc32 of the key modulo the shard count, so every
/// process addressing the same store maps a key to the same shard.
#[derive(Clone)]
pub struct ShardSet {
    shards: Vec<Arc<dyn LockStore>>,
}

impl ShardSet {
    /// Build a shard set from pre-constructed shards.
    ///
    /// ## Errors
    /// [`StoreError::Config`] if `shards` is empty.
    pub fn new(shards: Vec<Arc<dyn LockStore>>) -> StoreResult<Self> {
        if shards.is_empty() {
            return Err(StoreError::Config("shard set must not be empty".into()));
        }
        Ok(Self { shards })
    }

    /// Build an in-memory store with `num_shards` shards.
    pub fn memory(num_shards: usize) -> Self {
        let n = num_shards.max(1);
        let shards = (0..n)
            .map(|i| Arc::new(MemoryLockStore::new(i)) as Arc<dyn LockStore>)
            .collect();
        Self { shards }
    }

    /// Number of shards in the store.
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Shard index a key is placed on.
    pub fn shard_for_key(&self, key: &str) -> usize {
        (crc32fast::hash(key.as_bytes()) as usize) % self.shards.len()
    }

    /// Shard at `index`.
    ///
    /// ## Errors
    /// [`StoreError::InvalidShard`] if `index` is out of range.
    pub fn shard(&self, index: usize) -> StoreResult<&Arc<dyn LockStore>> {
        self.shards.get(index).ok_or(StoreError::InvalidShard {
            index,
            num_shards: self.shards.len(),
        })
    }

    /// All shards, in shard order.
    pub fn shards(&self) -> &[Arc<dyn LockStore>] {
        &self.shards
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_for_key_is_stable() {
        let a = ShardSet::memory(8);
        let b = ShardSet::memory(8);
        for key in ["alpha", "beta", "gamma", "delta", ""] {
            assert_eq!(a.shard_for_key(key), b.shard_for_key(key));
        }
    }

    #[test]
    fn test_shard_for_key_in_range() {
        let set = ShardSet::memory(3);
        for i in 0..100 {
            let key = format!("key-{}", i);
            assert!(set.shard_for_key(&key) < 3);
        }
    }

    #[test]
    fn test_shard_for_key_spreads_keys() {
        let set = ShardSet::memory(4);
        let mut seen = [false; 4];
        for i in 0..64 {
            seen[set.shard_for_key(&format!("key-{}", i))] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_empty_shard_set_rejected() {
        assert!(matches!(
            ShardSet::new(Vec::new()),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_shard_out_of_range() {
        let set = ShardSet::memory(2);
        assert!(set.shard(1).is_ok());
        assert!(matches!(
            set.shard(2),
            Err(StoreError::InvalidShard { index: 2, num_shards: 2 })
        ));
    }
}
