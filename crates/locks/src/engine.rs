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

//! Acquisition engine: the retry loop around the atomic store routines.
//!
//! One loop iteration is one store round trip. Misses (conflicts, drains,
//! shard outages) sleep on a randomized exponential backoff; observing a
//! different holder than last time resets the backoff to its initial
//! value without resetting the accumulated wait. Writers track whether
//! they hold a claim so every exit path can clean it up.

use crate::distributed;
use crate::error::{LockError, LockResult, LockedReason, ResourceLocked};
use crate::handle::Lock;
use crate::locker::LockerInner;
use crate::options::{Distributed, LockOptions};
use crate::token::core_token;
use crate::LockRole;
use rand::{thread_rng, Rng};
use rzlock_store::{AcquireReply, LockStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// First miss waits this long.
const INITIAL_WAIT_MS: u64 = 5;
/// Per-miss wait cap.
const MAX_WAIT_STEP_MS: u64 = 1000;
const WAIT_MULTIPLIER: u64 = 3;

/// What the last miss showed us about the current holder(s).
///
/// Reader sets compare as unordered sets of core tokens, so a reordered
/// member list never counts as a holder change.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Observed {
    Writer(String),
    Readers(BTreeSet<String>),
}

impl Observed {
    fn render(&self) -> String {
        match self {
            Observed::Writer(token) => token.clone(),
            Observed::Readers(tokens) => tokens.iter().cloned().collect::<Vec<_>>().join(","),
        }
    }
}

fn normalize(readers: &[String]) -> BTreeSet<String> {
    readers.iter().map(|t| core_token(t).to_string()).collect()
}

struct RetryState<'a> {
    locker: &'a LockerInner,
    key: &'a str,
    role: LockRole,
    opts: &'a LockOptions,
    token: &'a str,
    token_base: &'a str,
    wait_ms: u64,
    total_ms: u64,
    observed: Option<Observed>,
    holder_changes: u32,
    warned: bool,
}

impl<'a> RetryState<'a> {
    fn new(
        locker: &'a LockerInner,
        key: &'a str,
        role: LockRole,
        opts: &'a LockOptions,
        token: &'a str,
        token_base: &'a str,
    ) -> Self {
        Self {
            locker,
            key,
            role,
            opts,
            token,
            token_base,
            wait_ms: INITIAL_WAIT_MS,
            total_ms: 0,
            observed: None,
            holder_changes: 0,
            warned: false,
        }
    }

    /// Record what the miss showed; a holder change resets the backoff.
    fn observe(&mut self, next: Observed) {
        if let Some(prev) = &self.observed {
            if *prev != next {
                self.holder_changes += 1;
                self.wait_ms = INITIAL_WAIT_MS;
            }
        }
        self.observed = Some(next);
    }

    fn locked_err(&self, reason: LockedReason) -> LockError {
        LockError::locked(ResourceLocked {
            key: self.key.to_string(),
            role: self.role,
            reason,
            max_wait_time: self.opts.max_wait_time,
            token: Some(self.token.to_string()),
            token_base: self.token_base.to_string(),
            observed_holder: self.observed.as_ref().map(Observed::render),
            holder_changes: self.holder_changes,
            elapsed_ms: self.total_ms,
        })
    }

    /// Sleep out the next backoff step, or fail when the budget is gone.
    async fn wait_or_timeout(&mut self) -> LockResult<()> {
        if self.opts.max_wait_time == 0 {
            return Err(self.locked_err(LockedReason::FastFail));
        }
        if self.total_ms / 1000 >= self.opts.max_wait_time {
            return Err(self.locked_err(LockedReason::Timeout));
        }
        let wait = self.wait_ms;
        self.wait_ms =
            (WAIT_MULTIPLIER * wait + thread_rng().gen_range(0..3)).min(MAX_WAIT_STEP_MS);
        sleep(Duration::from_millis(wait)).await;
        self.total_ms += wait;
        if let Some(warn_time) = self.opts.warn_time {
            if !self.warned && self.total_ms / 1000 >= warn_time {
                self.warned = true;
                self.locker.warn_waiting(self.key, self.total_ms);
            }
        }
        Ok(())
    }
}

/// Acquire a read lease.
///
/// Distributed reads land on a uniform-random shard and keep the
/// distributed flag alive for auto writers.
pub(crate) async fn acquire_read(
    locker: &Arc<LockerInner>,
    key: &str,
    opts: &LockOptions,
) -> LockResult<Lock> {
    let is_distributed = opts.distributed != Distributed::Off;
    let shard_index = if is_distributed {
        thread_rng().gen_range(0..locker.store.num_shards())
    } else {
        locker.store.shard_for_key(key)
    };
    let shard = locker.store.shard(shard_index)?.clone();
    let write_key = locker.write_key(key);
    let read_key = locker.read_key(key);
    let token = locker.next_token(opts, key, LockRole::Read);
    let token_base = locker.effective_base(opts);
    let mut retry = RetryState::new(locker, key, LockRole::Read, opts, &token, &token_base);

    loop {
        if is_distributed && opts.enable_distributed_auto {
            if let Err(e) = distributed::ensure_flag(locker, key).await {
                debug!(key, error = %e, "distributed flag upkeep failed; will retry");
            }
        }
        match shard
            .read_lock_acquire(&write_key, &read_key, &token, opts.lock_timeout)
            .await
        {
            Ok(AcquireReply::Acquired { .. }) => {
                let lock = Lock::new_single(
                    locker.clone(),
                    key,
                    shard_index,
                    token,
                    LockRole::Read,
                    is_distributed,
                    opts,
                );
                lock.start_background(opts).await;
                return Ok(lock);
            }
            Ok(AcquireReply::Conflict { holder }) => {
                retry.observe(Observed::Writer(core_token(&holder).to_string()));
            }
            Ok(AcquireReply::Draining { readers }) => {
                // A read grant never drains; treat it as a plain miss.
                retry.observe(Observed::Readers(normalize(&readers)));
            }
            Err(e) if e.is_shard_unavailable() => {
                debug!(key, shard = shard_index, error = %e, "shard unavailable, retrying");
            }
            Err(e) => return Err(e.into()),
        }
        retry.wait_or_timeout().await?;
    }
}

/// Acquire a write lease on one shard (the key's shard, or a forced index
/// during distributed fan-out).
pub(crate) async fn acquire_write(
    locker: &Arc<LockerInner>,
    key: &str,
    opts: &LockOptions,
    forced_shard: Option<usize>,
) -> LockResult<Lock> {
    let shard_index = match forced_shard {
        Some(index) => index,
        None => locker.store.shard_for_key(key),
    };
    let shard = locker.store.shard(shard_index)?.clone();
    let write_key = locker.write_key(key);
    let read_key = locker.read_key(key);
    let token = locker.next_token(opts, key, LockRole::Write);
    let token_base = locker.effective_base(opts);
    let mut retry = RetryState::new(locker, key, LockRole::Write, opts, &token, &token_base);
    let mut claimed = false;

    loop {
        let reply = if claimed {
            shard
                .write_lock_retry(&write_key, &read_key, &token, opts.lock_timeout)
                .await
        } else {
            shard
                .write_lock_acquire(&write_key, &read_key, &token, opts.lock_timeout)
                .await
        };
        match reply {
            Ok(AcquireReply::Acquired { .. }) => {
                let lock = Lock::new_single(
                    locker.clone(),
                    key,
                    shard_index,
                    token,
                    LockRole::Write,
                    false,
                    opts,
                );
                lock.start_background(opts).await;
                return Ok(lock);
            }
            Ok(AcquireReply::Draining { readers }) => {
                claimed = true;
                retry.observe(Observed::Readers(normalize(&readers)));
            }
            Ok(AcquireReply::Conflict { holder }) => {
                // Our claim, if any, has been preempted.
                let was_claimed = std::mem::take(&mut claimed);
                let holder_core = core_token(&holder).to_string();
                if opts.resolve_conflicts && core_token(&token) > holder_core.as_str() {
                    if was_claimed {
                        release_claim(&shard, &write_key, &token).await;
                    }
                    return Err(retry.locked_err(LockedReason::ConflictResolution {
                        winner: holder_core,
                    }));
                }
                retry.observe(Observed::Writer(holder_core));
            }
            Err(e) if e.is_shard_unavailable() => {
                debug!(key, shard = shard_index, error = %e, "shard unavailable, retrying");
            }
            Err(e) => {
                if claimed {
                    release_claim(&shard, &write_key, &token).await;
                }
                return Err(e.into());
            }
        }
        if let Err(e) = retry.wait_or_timeout().await {
            if claimed {
                release_claim(&shard, &write_key, &token).await;
            }
            return Err(e);
        }
    }
}

/// Best-effort cleanup of a write claim whose drain never completed.
async fn release_claim(shard: &Arc<dyn LockStore>, write_key: &str, token: &str) {
    if let Err(e) = shard.write_lock_release(write_key, token).await {
        warn!(write_key, error = %e, "failed to clean up write claim");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locker::Locker;
    use rzlock_store::ShardSet;

    fn retry_fixture(locker: &Locker, opts: &LockOptions) -> RetryState<'static> {
        // Tests only: leak to satisfy the borrow without threading lifetimes.
        let inner: &'static Arc<LockerInner> = Box::leak(Box::new(locker.inner().clone()));
        let opts: &'static LockOptions = Box::leak(Box::new(opts.clone()));
        RetryState::new(inner, "k", LockRole::Write, opts, "50a0", "a")
    }

    #[test]
    fn test_holder_change_resets_backoff() {
        let locker = Locker::new(ShardSet::memory(1));
        let opts = LockOptions::default();
        let mut retry = retry_fixture(&locker, &opts);

        retry.wait_ms = 800;
        retry.observe(Observed::Writer("50a1".into()));
        assert_eq!(retry.wait_ms, 800);
        assert_eq!(retry.holder_changes, 0);

        retry.observe(Observed::Writer("50b1".into()));
        assert_eq!(retry.wait_ms, INITIAL_WAIT_MS);
        assert_eq!(retry.holder_changes, 1);
    }

    #[test]
    fn test_reader_set_order_is_not_a_holder_change() {
        let locker = Locker::new(ShardSet::memory(1));
        let opts = LockOptions::default();
        let mut retry = retry_fixture(&locker, &opts);

        retry.observe(Observed::Readers(normalize(&[
            "50a1".to_string(),
            "50b1".to_string(),
        ])));
        retry.wait_ms = 400;
        retry.observe(Observed::Readers(normalize(&[
            "50b1".to_string(),
            "50a1".to_string(),
        ])));
        assert_eq!(retry.holder_changes, 0);
        assert_eq!(retry.wait_ms, 400);
    }

    #[tokio::test]
    async fn test_fail_fast_returns_without_sleeping() {
        let locker = Locker::new(ShardSet::memory(1));
        let opts = LockOptions {
            max_wait_time: 0,
            ..Default::default()
        };
        let mut retry = retry_fixture(&locker, &opts);

        let started = std::time::Instant::now();
        let err = retry.wait_or_timeout().await.unwrap_err();
        assert!(started.elapsed().as_millis() < 5);
        let context = err.as_resource_locked().unwrap();
        assert_eq!(context.reason, LockedReason::FastFail);
    }

    #[tokio::test]
    async fn test_backoff_grows_and_caps() {
        let locker = Locker::new(ShardSet::memory(1));
        let opts = LockOptions::default();
        let mut retry = retry_fixture(&locker, &opts);

        assert_eq!(retry.wait_ms, INITIAL_WAIT_MS);
        for _ in 0..10 {
            retry.wait_or_timeout().await.unwrap();
        }
        assert_eq!(retry.wait_ms, MAX_WAIT_STEP_MS);
        assert!(retry.total_ms > 0);
    }
}
