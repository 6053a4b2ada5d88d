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

//! In-memory lock-state shard (for testing and single-process use).
//!
//! ## Purpose
//! Implements [`LockStore`] against a plain map. Each routine holds the
//! shard's write lock for its whole duration, which gives the same
//! run-to-completion atomicity the Redis backend gets from Lua.
//!
//! ## Limitations
//! - Not persistent, not distributed.
//! - Expiry is lazy: an expired entry is dropped the next time a routine
//!   touches its key.

use crate::{AcquireReply, HeartbeatReply, LockStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

fn expiry(ttl_secs: u64) -> Option<Instant> {
    (ttl_secs > 0).then(|| Instant::now() + Duration::from_secs(ttl_secs))
}

fn sorted(members: &HashSet<String>) -> Vec<String> {
    let mut out: Vec<String> = members.iter().cloned().collect();
    out.sort();
    out
}

/// In-memory [`LockStore`] shard.
///
/// ## Example
/// ```rust
/// use rzlock_store::{AcquireReply, LockStore, MemoryLockStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let shard = MemoryLockStore::new(0);
/// let reply = shard.read_lock_acquire("w:k", "r:k", "50abc1", 60).await?;
/// assert!(matches!(reply, AcquireReply::Acquired { .. }));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryLockStore {
    index: usize,
    data: Arc<RwLock<HashMap<String, Entry>>>,
    down: Arc<AtomicBool>,
}

impl MemoryLockStore {
    /// Create an in-memory shard with the given shard index.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            data: Arc::new(RwLock::new(HashMap::new())),
            down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fault injection: while down, every routine fails with
    /// [`StoreError::ShardUnavailable`].
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check_up(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::ShardUnavailable {
                shard: self.index,
                reason: "shard marked down".into(),
            });
        }
        Ok(())
    }
}

/// Drop the entry if expired, then return it if still present.
fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(Entry::is_expired) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn live_holder(map: &mut HashMap<String, Entry>, write_key: &str) -> Option<String> {
    match live(map, write_key).map(|e| &e.value) {
        Some(Value::Str(holder)) => Some(holder.clone()),
        _ => None,
    }
}

fn live_readers(map: &mut HashMap<String, Entry>, read_key: &str) -> HashSet<String> {
    match live(map, read_key).map(|e| &e.value) {
        Some(Value::Set(members)) => members.clone(),
        _ => HashSet::new(),
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn read_lock_acquire(
        &self,
        write_key: &str,
        read_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<AcquireReply> {
        self.check_up()?;
        let mut map = self.data.write().await;
        if let Some(holder) = live_holder(&mut map, write_key) {
            return Ok(AcquireReply::Conflict { holder });
        }
        if map.get(read_key).is_some_and(Entry::is_expired) {
            map.remove(read_key);
        }
        let entry = map.entry(read_key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        let Value::Set(members) = &mut entry.value else {
            return Err(StoreError::BadReply(format!(
                "read key {} holds a non-set value",
                read_key
            )));
        };
        members.insert(token.to_string());
        let snapshot = sorted(members);
        if ttl_secs > 0 {
            entry.expires_at = expiry(ttl_secs);
        }
        Ok(AcquireReply::Acquired { readers: snapshot })
    }

    async fn write_lock_acquire(
        &self,
        write_key: &str,
        read_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<AcquireReply> {
        self.check_up()?;
        let mut map = self.data.write().await;
        if let Some(holder) = live_holder(&mut map, write_key) {
            return Ok(AcquireReply::Conflict { holder });
        }
        map.insert(
            write_key.to_string(),
            Entry {
                value: Value::Str(token.to_string()),
                expires_at: expiry(ttl_secs),
            },
        );
        let readers = live_readers(&mut map, read_key);
        if readers.is_empty() {
            Ok(AcquireReply::Acquired { readers: Vec::new() })
        } else {
            Ok(AcquireReply::Draining {
                readers: sorted(&readers),
            })
        }
    }

    async fn write_lock_retry(
        &self,
        write_key: &str,
        read_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<AcquireReply> {
        self.check_up()?;
        let mut map = self.data.write().await;
        if let Some(holder) = live_holder(&mut map, write_key) {
            if holder != token {
                return Ok(AcquireReply::Conflict { holder });
            }
        }
        map.insert(
            write_key.to_string(),
            Entry {
                value: Value::Str(token.to_string()),
                expires_at: expiry(ttl_secs),
            },
        );
        let readers = live_readers(&mut map, read_key);
        if readers.is_empty() {
            Ok(AcquireReply::Acquired { readers: Vec::new() })
        } else {
            Ok(AcquireReply::Draining {
                readers: sorted(&readers),
            })
        }
    }

    async fn read_lock_release(&self, read_key: &str, token: &str) -> StoreResult<Vec<String>> {
        self.check_up()?;
        let mut map = self.data.write().await;
        let remaining = match live(&mut map, read_key) {
            Some(e) => {
                if let Value::Set(members) = &mut e.value {
                    members.remove(token);
                    members.clone()
                } else {
                    HashSet::new()
                }
            }
            None => HashSet::new(),
        };
        if remaining.is_empty() {
            map.remove(read_key);
        }
        Ok(sorted(&remaining))
    }

    async fn write_lock_release(&self, write_key: &str, token: &str) -> StoreResult<bool> {
        self.check_up()?;
        let mut map = self.data.write().await;
        if live_holder(&mut map, write_key).as_deref() == Some(token) {
            map.remove(write_key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn read_lock_heartbeat(
        &self,
        read_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<HeartbeatReply> {
        self.check_up()?;
        let mut map = self.data.write().await;
        match live(&mut map, read_key) {
            Some(e) => {
                let is_member = matches!(&e.value, Value::Set(members) if members.contains(token));
                if !is_member {
                    return Ok(HeartbeatReply::Lost);
                }
                if ttl_secs > 0 {
                    e.expires_at = expiry(ttl_secs);
                }
                Ok(HeartbeatReply::Extended)
            }
            None => Ok(HeartbeatReply::Lost),
        }
    }

    async fn write_lock_heartbeat(
        &self,
        write_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<HeartbeatReply> {
        self.check_up()?;
        let mut map = self.data.write().await;
        match live_holder(&mut map, write_key) {
            Some(holder) if holder == token => {
                if ttl_secs > 0 {
                    if let Some(e) = map.get_mut(write_key) {
                        e.expires_at = expiry(ttl_secs);
                    }
                }
                Ok(HeartbeatReply::Extended)
            }
            Some(holder) => Ok(HeartbeatReply::Conflict { holder }),
            None => Ok(HeartbeatReply::Lost),
        }
    }

    async fn flag_ttl_secs(&self, flag_key: &str) -> StoreResult<Option<i64>> {
        self.check_up()?;
        let mut map = self.data.write().await;
        Ok(live(&mut map, flag_key).map(|e| match e.expires_at {
            None => -1,
            Some(exp) => exp.saturating_duration_since(Instant::now()).as_secs() as i64,
        }))
    }

    async fn flag_set(&self, flag_key: &str, ttl_secs: u64) -> StoreResult<()> {
        self.check_up()?;
        let mut map = self.data.write().await;
        map.insert(
            flag_key.to_string(),
            Entry {
                value: Value::Str("1".to_string()),
                expires_at: expiry(ttl_secs),
            },
        );
        Ok(())
    }

    async fn write_holder(&self, write_key: &str) -> StoreResult<Option<String>> {
        self.check_up()?;
        let mut map = self.data.write().await;
        Ok(live_holder(&mut map, write_key))
    }

    async fn read_holders(&self, read_key: &str) -> StoreResult<Vec<String>> {
        self.check_up()?;
        let mut map = self.data.write().await;
        let members = live_readers(&mut map, read_key);
        Ok(sorted(&members))
    }
}
