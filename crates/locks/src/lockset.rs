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

//! Lock sets: reference-counted aggregation of handles by key.
//!
//! A set holds at most one handle per key; re-requesting a key bumps the
//! shared handle's reference count instead of acquiring again. Insertion
//! order is the release order, reversed: the last lock acquired is the
//! first released, and dependent child sets release after (and in reverse
//! order of) the set's own locks. Dependents are an owned, ordered
//! sequence; children never back-link to their parent.
//!
//! Every writer in a set shares the set's token base, so conflict
//! resolution treats them as one identity.

use crate::engine;
use crate::error::{LockError, LockResult, LockedReason, ResourceLocked};
use crate::handle::Lock;
use crate::locker::{self, LockerInner, Locking};
use crate::options::{LockOptions, OnUpgradeError};
use crate::token;
use crate::LockRole;
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct LockSetState {
    locks: Vec<(String, Lock)>,
    dependents: Vec<LockSet>,
}

struct LockSetInner {
    locker: Arc<LockerInner>,
    token_base: String,
    state: Mutex<LockSetState>,
}

/// A reference-counted collection of locks released together, in reverse
/// insertion order.
///
/// Created by [`Locking::create_lock_set`]; implements the same
/// [`Locking`] capability set as the locker itself.
#[derive(Clone)]
pub struct LockSet {
    inner: Arc<LockSetInner>,
}

impl std::fmt::Debug for LockSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSet").field("token_base", &self.inner.token_base).finish()
    }
}

impl LockSet {
    pub(crate) fn new(locker: Arc<LockerInner>) -> Self {
        Self {
            inner: Arc::new(LockSetInner {
                locker,
                token_base: token::random_base(),
                state: Mutex::new(LockSetState::default()),
            }),
        }
    }

    /// The token base shared by this set's writers.
    pub fn token_base(&self) -> &str {
        &self.inner.token_base
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LockSetState) -> R) -> R {
        match self.inner.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// The set's handle for `key`, if present.
    pub fn get_lock(&self, key: &str) -> Option<Lock> {
        self.with_state(|state| {
            state
                .locks
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, lock)| lock.clone())
        })
    }

    /// Number of keys currently held in the set.
    pub fn len(&self) -> usize {
        self.with_state(|state| state.locks.len())
    }

    /// Whether the set holds no locks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an externally-acquired handle to the set.
    ///
    /// ## Errors
    /// [`LockError::ResourceLocked`] if the key is already present.
    pub async fn add_lock(&self, lock: Lock) -> LockResult<()> {
        let key = lock.key().to_string();
        let role = lock.role().await;
        let token = lock.token().await;
        let inserted = self.with_state(|state| {
            if state.locks.iter().any(|(k, _)| *k == key) {
                return false;
            }
            state.locks.push((key.clone(), lock));
            true
        });
        if inserted {
            return Ok(());
        }
        Err(LockError::locked(ResourceLocked {
            key,
            role,
            reason: LockedReason::AlreadyInSet,
            max_wait_time: 0,
            token: Some(token),
            token_base: self.inner.token_base.clone(),
            observed_holder: None,
            holder_changes: 0,
            elapsed_ms: 0,
        }))
    }

    /// Register an existing set as a dependent of this one.
    pub fn add_dependent_lock_set(&self, set: LockSet) {
        self.with_state(|state| state.dependents.push(set));
    }

    /// Release every owned handle in reverse insertion order, then every
    /// dependent set in reverse insertion order. Repeating a release is a
    /// no-op after the first.
    pub async fn release(&self) -> LockResult<()> {
        while let Some((_, lock)) = self.with_state(|state| state.locks.pop()) {
            lock.release().await?;
        }
        while let Some(set) = self.with_state(|state| state.dependents.pop()) {
            Box::pin(set.release()).await?;
        }
        Ok(())
    }

    /// Same as [`release`](Self::release), but dropping leases regardless
    /// of reference counts.
    pub async fn force_release(&self) -> LockResult<()> {
        while let Some((_, lock)) = self.with_state(|state| state.locks.pop()) {
            lock.force_release().await?;
        }
        while let Some(set) = self.with_state(|state| state.dependents.pop()) {
            Box::pin(set.force_release()).await?;
        }
        Ok(())
    }

    /// Upgrade every read handle to a writer, in reverse insertion order.
    ///
    /// `options.on_error` picks the policy: `Stop` rethrows at the first
    /// failure, `Release` rethrows after force-releasing the whole set,
    /// `Ignore` collects the failed handles and returns them (empty when
    /// everything upgraded).
    pub async fn upgrade(&self, options: LockOptions) -> LockResult<Vec<Lock>> {
        let mut options = options;
        if options.token_base.is_none() {
            options.token_base = Some(self.inner.token_base.clone());
        }
        let handles: Vec<Lock> = self.with_state(|state| {
            state
                .locks
                .iter()
                .rev()
                .map(|(_, lock)| lock.clone())
                .collect()
        });
        let mut failed = Vec::new();
        for lock in handles {
            if !lock.is_locked().await || lock.role().await == LockRole::Write {
                continue;
            }
            if let Err(e) = lock.upgrade(options.clone()).await {
                match options.on_error {
                    OnUpgradeError::Stop => return Err(e),
                    OnUpgradeError::Release => {
                        self.force_release().await?;
                        return Err(e);
                    }
                    OnUpgradeError::Ignore => failed.push(lock),
                }
            }
        }
        Ok(failed)
    }

    /// Run `f` under a read lease held in this set; the lease is released
    /// before the result or error is returned.
    pub async fn read_lock_wrap<T, F, Fut>(
        &self,
        key: &str,
        options: LockOptions,
        f: F,
    ) -> LockResult<T>
    where
        F: FnOnce(Lock) -> Fut,
        Fut: Future<Output = LockResult<T>>,
    {
        let lock = self.read_lock(key, options).await?;
        let fut = f(lock.clone());
        locker::wrap_with_lock(lock, fut).await
    }

    /// Run `f` under a write lease held in this set; the lease is released
    /// before the result or error is returned.
    pub async fn write_lock_wrap<T, F, Fut>(
        &self,
        key: &str,
        options: LockOptions,
        f: F,
    ) -> LockResult<T>
    where
        F: FnOnce(Lock) -> Fut,
        Fut: Future<Output = LockResult<T>>,
    {
        let lock = self.write_lock(key, options).await?;
        let fut = f(lock.clone());
        locker::wrap_with_lock(lock, fut).await
    }

    /// Drop a stale (already released) entry so the key can be re-acquired.
    fn evict(&self, key: &str) {
        self.with_state(|state| state.locks.retain(|(k, _)| k != key));
    }

    /// Insert a fresh handle, or fold into a handle a concurrent caller
    /// inserted first.
    async fn insert_or_merge(&self, key: &str, lock: Lock) -> LockResult<Lock> {
        let existing = self.get_lock(key);
        match existing {
            Some(current) if current.is_locked().await => {
                current.relock().await?;
                let _ = lock.release().await;
                Ok(current)
            }
            Some(_) => {
                self.with_state(|state| {
                    state.locks.retain(|(k, _)| k != key);
                    state.locks.push((key.to_string(), lock.clone()));
                });
                Ok(lock)
            }
            None => {
                self.with_state(|state| state.locks.push((key.to_string(), lock.clone())));
                Ok(lock)
            }
        }
    }

    async fn bulk(&self, keys: &[&str], options: &LockOptions, role: LockRole) -> LockResult<()> {
        let mut acquired: Vec<(String, Lock)> = Vec::new();
        for key in keys {
            if self.get_lock(key).is_some() {
                continue;
            }
            let result = match role {
                LockRole::Read => engine::acquire_read(&self.inner.locker, key, options).await,
                LockRole::Write => {
                    locker::write_lock_dispatch(&self.inner.locker, key, options).await
                }
            };
            match result {
                Ok(lock) => {
                    self.with_state(|state| state.locks.push((key.to_string(), lock.clone())));
                    acquired.push((key.to_string(), lock));
                }
                Err(e) => {
                    // Roll back only what this call acquired.
                    for (key, lock) in acquired.iter().rev() {
                        self.evict(key);
                        let _ = lock.release().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Locking for LockSet {
    async fn read_lock(&self, key: &str, options: LockOptions) -> LockResult<Lock> {
        if let Some(existing) = self.get_lock(key) {
            if existing.is_locked().await {
                existing.relock().await?;
                return Ok(existing);
            }
            self.evict(key);
        }
        let lock = engine::acquire_read(&self.inner.locker, key, &options).await?;
        self.insert_or_merge(key, lock).await
    }

    async fn write_lock(&self, key: &str, options: LockOptions) -> LockResult<Lock> {
        let mut options = options;
        if options.token_base.is_none() {
            options.token_base = Some(self.inner.token_base.clone());
        }
        if let Some(existing) = self.get_lock(key) {
            if existing.is_locked().await {
                if existing.role().await == LockRole::Read {
                    existing.upgrade(options).await?;
                }
                existing.relock().await?;
                return Ok(existing);
            }
            self.evict(key);
        }
        let lock = locker::write_lock_dispatch(&self.inner.locker, key, &options).await?;
        self.insert_or_merge(key, lock).await
    }

    async fn read_lock_set(&self, keys: &[&str], options: LockOptions) -> LockResult<LockSet> {
        self.bulk(keys, &options, LockRole::Read).await?;
        Ok(self.clone())
    }

    async fn write_lock_set(&self, keys: &[&str], options: LockOptions) -> LockResult<LockSet> {
        let mut options = options;
        if options.token_base.is_none() {
            options.token_base = Some(self.inner.token_base.clone());
        }
        self.bulk(keys, &options, LockRole::Write).await?;
        Ok(self.clone())
    }

    fn create_lock_set(&self) -> LockSet {
        let child = LockSet::new(self.inner.locker.clone());
        self.with_state(|state| state.dependents.push(child.clone()));
        child
    }
}
