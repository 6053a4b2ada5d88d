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

//! Distributed mode: flag upkeep, write fan-out, and auto promotion.
//!
//! Distributed reads park their token on a random shard instead of the
//! key's shard, so a writer can only exclude them by holding the write
//! slot on *every* shard. The short-lived distributed flag (one marker per
//! key, on all shards) tells auto-mode writers that such readers were
//! recently active.

use crate::engine;
use crate::error::LockResult;
use crate::handle::Lock;
use crate::locker::LockerInner;
use crate::options::LockOptions;
use futures::future::try_join_all;
use rand::{thread_rng, Rng};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Make sure the distributed flag for `key` is alive on every shard.
///
/// Checks the TTL on the key's natural shard; when the flag is missing or
/// expiring within `min_distributed_flag_expire`, rewrites it on all
/// shards with `max_distributed_flag_expire`. Returns the flag's expiry
/// horizon in seconds.
pub(crate) async fn ensure_flag(locker: &Arc<LockerInner>, key: &str) -> LockResult<u64> {
    let flag_key = locker.flag_key(key);
    let min = locker.config.min_distributed_flag_expire;
    let max = locker.config.max_distributed_flag_expire;
    let natural = locker.store.shard_for_key(key);
    let ttl = locker.store.shard(natural)?.flag_ttl_secs(&flag_key).await?;
    match ttl {
        Some(secs) if secs < 0 => return Ok(max),
        Some(secs) if secs as u64 >= min => return Ok(secs as u64),
        _ => {}
    }
    try_join_all(
        locker
            .store
            .shards()
            .iter()
            .map(|shard| shard.flag_set(&flag_key, max)),
    )
    .await?;
    Ok(max)
}

/// Whether the distributed flag for `key` currently exists.
pub(crate) async fn flag_present(locker: &Arc<LockerInner>, key: &str) -> LockResult<bool> {
    let flag_key = locker.flag_key(key);
    let natural = locker.store.shard_for_key(key);
    Ok(locker
        .store
        .shard(natural)?
        .flag_ttl_secs(&flag_key)
        .await?
        .is_some())
}

/// Delay until the next flag check: `exp − U(min, max(min, window, exp−min))`
/// seconds, so renewals from many readers spread out instead of herding.
fn next_check_delay(exp_secs: u64, min: u64, window: u64) -> Duration {
    let min = min.max(1);
    let upper = min.max(window).max(exp_secs.saturating_sub(min));
    let jitter = thread_rng().gen_range(min..=upper);
    Duration::from_secs(exp_secs.saturating_sub(jitter).max(1))
}

/// Keep the distributed flag alive for the lifetime of a distributed read
/// lease.
pub(crate) async fn start_flag_refresher(lock: &Lock) {
    let weak = Arc::downgrade(&lock.inner);
    let locker = lock.inner.locker.clone();
    let key = lock.inner.key.clone();
    let task = tokio::spawn(async move {
        loop {
            let exp = match ensure_flag(&locker, &key).await {
                Ok(exp) => exp,
                Err(e) => {
                    debug!(key = %key, error = %e, "distributed flag refresh failed; will retry");
                    locker.config.min_distributed_flag_expire
                }
            };
            let delay = next_check_delay(
                exp,
                locker.config.min_distributed_flag_expire,
                locker.config.distributed_flag_timer_window,
            );
            sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if !inner.state.lock().await.is_locked {
                break;
            }
        }
    });
    lock.set_flag_refresher(task).await;
}

/// Acquire the write lock on every shard, in shard order, under one token
/// base so conflict resolution treats the fan-out as a single writer.
///
/// Any per-shard failure force-releases the partial acquisition in
/// reverse order and propagates.
pub(crate) async fn acquire_distributed_write(
    locker: &Arc<LockerInner>,
    key: &str,
    opts: &LockOptions,
) -> LockResult<Lock> {
    let mut shard_opts = opts.clone();
    if shard_opts.token_base.is_none() {
        shard_opts.token_base = Some(locker.tokens.base().to_string());
    }
    let mut children: Vec<Lock> = Vec::with_capacity(locker.store.num_shards());
    for index in 0..locker.store.num_shards() {
        match engine::acquire_write(locker, key, &shard_opts, Some(index)).await {
            Ok(lock) => children.push(lock),
            Err(e) => {
                for acquired in children.iter().rev() {
                    let _ = acquired.force_release().await;
                }
                return Err(e);
            }
        }
    }
    let token = match children.first() {
        Some(first) => first.token().await,
        None => String::new(),
    };
    Ok(Lock::new_distributed(locker.clone(), key, children, token))
}

/// Auto mode: consult the distributed flag to decide the write shape.
///
/// Flag absent: take a normal single-shard write lock, then re-check; if
/// the flag appeared in the meantime, back out and go distributed. Flag
/// present: go straight to the fan-out.
pub(crate) async fn acquire_write_auto(
    locker: &Arc<LockerInner>,
    key: &str,
    opts: &LockOptions,
) -> LockResult<Lock> {
    if flag_is_present_lenient(locker, key).await {
        return acquire_distributed_write(locker, key, opts).await;
    }
    let single = engine::acquire_write(locker, key, opts, None).await?;
    if flag_is_present_lenient(locker, key).await {
        let _ = single.force_release().await;
        return acquire_distributed_write(locker, key, opts).await;
    }
    Ok(single)
}

/// Flag lookup that treats a shard outage as "absent" (the single-shard
/// path still holds correct state; distributed readers will re-assert the
/// flag once the shard returns).
async fn flag_is_present_lenient(locker: &Arc<LockerInner>, key: &str) -> bool {
    match flag_present(locker, key).await {
        Ok(present) => present,
        Err(e) => {
            debug!(key, error = %e, "distributed flag lookup failed; assuming absent");
            false
        }
    }
}
