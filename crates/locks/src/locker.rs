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

//! The locker: entry point for acquisitions, and the capability set it
//! shares with lock sets.

use crate::distributed;
use crate::engine;
use crate::error::LockResult;
use crate::handle::Lock;
use crate::lockset::LockSet;
use crate::options::{Distributed, LockOptions, LockerConfig};
use crate::token::TokenGenerator;
use crate::LockRole;
use async_trait::async_trait;
use rzlock_store::ShardSet;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Shared state behind a [`Locker`] and every handle it produces.
pub(crate) struct LockerInner {
    pub(crate) store: ShardSet,
    pub(crate) config: LockerConfig,
    pub(crate) tokens: TokenGenerator,
}

impl LockerInner {
    pub(crate) fn write_key(&self, key: &str) -> String {
        format!("{}write:{}", self.config.prefix, key)
    }

    pub(crate) fn read_key(&self, key: &str) -> String {
        format!("{}read:{}", self.config.prefix, key)
    }

    pub(crate) fn flag_key(&self, key: &str) -> String {
        format!("{}dflag:{}", self.config.prefix, key)
    }

    pub(crate) fn next_token(&self, opts: &LockOptions, key: &str, role: LockRole) -> String {
        match &opts.token_base {
            Some(base) => self
                .tokens
                .next_with_base(base, opts.conflict_priority, key, role),
            None => self.tokens.next(opts.conflict_priority, key, role),
        }
    }

    pub(crate) fn effective_base(&self, opts: &LockOptions) -> String {
        opts.token_base
            .clone()
            .unwrap_or_else(|| self.tokens.base().to_string())
    }

    pub(crate) fn warn_waiting(&self, key: &str, elapsed_ms: u64) {
        warn!(key, elapsed_ms, "lock acquisition wait crossed warn threshold");
        if let Some(callback) = &self.config.on_warn {
            callback(key, elapsed_ms);
        }
    }
}

/// Route a write acquisition by distribution mode.
pub(crate) async fn write_lock_dispatch(
    inner: &Arc<LockerInner>,
    key: &str,
    options: &LockOptions,
) -> LockResult<Lock> {
    match options.distributed {
        Distributed::Off => engine::acquire_write(inner, key, options, None).await,
        Distributed::On => distributed::acquire_distributed_write(inner, key, options).await,
        Distributed::Auto => distributed::acquire_write_auto(inner, key, options).await,
    }
}

/// Run a wrapped future, releasing the lock before the result (or the
/// error) leaves the wrapper.
pub(crate) async fn wrap_with_lock<T, Fut>(lock: Lock, fut: Fut) -> LockResult<T>
where
    Fut: Future<Output = LockResult<T>>,
{
    match fut.await {
        Ok(value) => {
            lock.release().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(release_err) = lock.release().await {
                warn!(key = %lock.key(), error = %release_err, "release failed while unwinding a wrapped call");
            }
            Err(e)
        }
    }
}

/// The capability set shared by [`Locker`] and [`LockSet`]: anything that
/// can hand out locks can also hand out lock sets, and bulk operations
/// work the same on either.
#[async_trait]
pub trait Locking {
    /// Acquire a read lease on `key`.
    async fn read_lock(&self, key: &str, options: LockOptions) -> LockResult<Lock>;

    /// Acquire a write lease on `key` (single-shard, distributed, or auto
    /// depending on `options.distributed`).
    async fn write_lock(&self, key: &str, options: LockOptions) -> LockResult<Lock>;

    /// Acquire read leases on all of `keys`, rolling back the ones this
    /// call acquired if any of them fails.
    async fn read_lock_set(&self, keys: &[&str], options: LockOptions) -> LockResult<LockSet>;

    /// Acquire write leases on all of `keys`, rolling back the ones this
    /// call acquired if any of them fails.
    async fn write_lock_set(&self, keys: &[&str], options: LockOptions) -> LockResult<LockSet>;

    /// A new, empty lock set (registered as a dependent when created from
    /// another set).
    fn create_lock_set(&self) -> LockSet;
}

/// Entry point for lock acquisitions.
///
/// Owns the shard set, the token generator (one base per locker instance),
/// and the configured defaults. Cheap to clone; all clones share state.
///
/// ## Example
/// ```rust
/// use rzlock_locks::{Locker, Locking, LockOptions};
/// use rzlock_store::ShardSet;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let locker = Locker::new(ShardSet::memory(4));
/// let guard = locker.read_lock("report:7", locker.options()).await?;
/// // ... read the report ...
/// guard.release().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Locker {
    inner: Arc<LockerInner>,
}

impl Locker {
    /// Locker with default configuration.
    pub fn new(store: ShardSet) -> Self {
        Self::with_config(store, LockerConfig::default())
    }

    /// Locker with explicit configuration.
    pub fn with_config(store: ShardSet, config: LockerConfig) -> Self {
        let tokens = TokenGenerator::new(config.debug_tokens);
        Self {
            inner: Arc::new(LockerInner {
                store,
                config,
                tokens,
            }),
        }
    }

    /// A copy of the configured default options, for struct-literal
    /// overriding.
    pub fn options(&self) -> LockOptions {
        self.inner.config.defaults.clone()
    }

    /// This locker's token base.
    pub fn token_base(&self) -> &str {
        self.inner.tokens.base()
    }

    /// Number of shards in the underlying store.
    pub fn num_shards(&self) -> usize {
        self.inner.store.num_shards()
    }

    pub(crate) fn inner(&self) -> &Arc<LockerInner> {
        &self.inner
    }

    /// Run `f` under a read lease on `key`; the lease is released before
    /// the result or error is returned.
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
        wrap_with_lock(lock, fut).await
    }

    /// Run `f` under a write lease on `key`; the lease is released before
    /// the result or error is returned.
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
        wrap_with_lock(lock, fut).await
    }
}

#[async_trait]
impl Locking for Locker {
    async fn read_lock(&self, key: &str, options: LockOptions) -> LockResult<Lock> {
        engine::acquire_read(&self.inner, key, &options).await
    }

    async fn write_lock(&self, key: &str, options: LockOptions) -> LockResult<Lock> {
        write_lock_dispatch(&self.inner, key, &options).await
    }

    async fn read_lock_set(&self, keys: &[&str], options: LockOptions) -> LockResult<LockSet> {
        let set = self.create_lock_set();
        set.read_lock_set(keys, options).await
    }

    async fn write_lock_set(&self, keys: &[&str], options: LockOptions) -> LockResult<LockSet> {
        let set = self.create_lock_set();
        set.write_lock_set(keys, options).await
    }

    fn create_lock_set(&self) -> LockSet {
        LockSet::new(self.inner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockError;
    use crate::token::TOKEN_BASE_LEN;

    #[tokio::test]
    async fn test_locker_defaults() {
        let locker = Locker::new(ShardSet::memory(2));
        assert_eq!(locker.num_shards(), 2);
        assert_eq!(locker.token_base().len(), TOKEN_BASE_LEN);
        assert_eq!(locker.options().lock_timeout, 60);
    }

    #[tokio::test]
    async fn test_wrap_releases_on_success() {
        let locker = Locker::new(ShardSet::memory(1));
        let value = locker
            .write_lock_wrap("k", LockOptions::default(), |lock| async move {
                assert!(lock.is_locked().await);
                Ok(41 + 1)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);

        // The lease is gone, so a fail-fast writer gets straight in.
        let options = LockOptions {
            max_wait_time: 0,
            ..Default::default()
        };
        let lock = locker.write_lock("k", options).await.unwrap();
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrap_releases_on_error() {
        let locker = Locker::new(ShardSet::memory(1));
        let result: LockResult<()> = locker
            .write_lock_wrap("k", LockOptions::default(), |_| async {
                Err(LockError::Internal("boom".to_string()))
            })
            .await;
        assert!(matches!(result, Err(LockError::Internal(_))));

        let options = LockOptions {
            max_wait_time: 0,
            ..Default::default()
        };
        let lock = locker.write_lock("k", options).await.unwrap();
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_warn_callback_fires_once() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let config = LockerConfig {
            on_warn: Some(Arc::new(move |_key, _elapsed| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let store = ShardSet::memory(1);
        let locker = Locker::with_config(store, config);

        let holder = locker.write_lock("k", LockOptions::default()).await.unwrap();
        let options = LockOptions {
            max_wait_time: 2,
            warn_time: Some(1),
            ..Default::default()
        };
        let result = locker.write_lock("k", options).await;
        assert!(result.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        holder.release().await.unwrap();
    }
}
