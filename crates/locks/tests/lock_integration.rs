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

//! Lock engine integration tests against the in-memory sharded store.
//!
//! These tests verify:
//! - Reader/writer coherence (write blocks read, read blocks write)
//! - Acquisition after release, fail-fast, and timeout behavior
//! - Deterministic conflict resolution and priority override
//! - Heartbeats keeping leases alive, loss detection, TTL expiry
//! - Distributed reads, write fan-out, and auto promotion
//! - Remote state hygiene (acquire then release leaves nothing behind)

use rzlock_locks::{Distributed, LockOptions, LockRole, Locker, LockedReason, Locking};
use rzlock_store::{LockStore, MemoryLockStore, ShardSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};

fn fail_fast() -> LockOptions {
    LockOptions {
        max_wait_time: 0,
        ..Default::default()
    }
}

/// A store whose single memory shard stays reachable for fault injection.
fn store_with_handle() -> (ShardSet, Arc<MemoryLockStore>) {
    let shard = Arc::new(MemoryLockStore::new(0));
    let store = ShardSet::new(vec![shard.clone() as Arc<dyn LockStore>]).unwrap();
    (store, shard)
}

#[tokio::test]
async fn test_write_release_relock() {
    let locker = Locker::new(ShardSet::memory(1));

    let lock = locker.write_lock("k", LockOptions::default()).await.unwrap();
    assert!(lock.token().await.starts_with("50"));
    assert_eq!(lock.role().await, LockRole::Write);
    lock.release().await.unwrap();

    // Immediately re-acquirable without any waiting.
    let lock = locker.write_lock("k", fail_fast()).await.unwrap();
    lock.release().await.unwrap();
}

#[tokio::test]
async fn test_write_blocks_read_and_read_blocks_write() {
    let locker = Locker::new(ShardSet::memory(1));

    let writer = locker
        .write_lock(
            "k",
            LockOptions {
                lock_timeout: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = locker.read_lock("k", fail_fast()).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "A lock cannot be acquired on the resource: k"
    );
    writer.release().await.unwrap();

    let reader = locker.read_lock("k", LockOptions::default()).await.unwrap();
    let err = locker.write_lock("k", fail_fast()).await.unwrap_err();
    assert!(err.is_resource_locked());
    reader.release().await.unwrap();

    let writer = locker.write_lock("k", fail_fast()).await.unwrap();
    writer.release().await.unwrap();
}

#[tokio::test]
async fn test_readers_share() {
    let locker = Locker::new(ShardSet::memory(1));

    let first = locker.read_lock("k", LockOptions::default()).await.unwrap();
    let second = locker.read_lock("k", fail_fast()).await.unwrap();
    first.release().await.unwrap();
    second.release().await.unwrap();
}

#[tokio::test]
async fn test_writer_waits_for_reader_drain() {
    let locker = Locker::new(ShardSet::memory(1));

    let reader = locker.read_lock("k", LockOptions::default()).await.unwrap();
    let contender = {
        let locker = locker.clone();
        tokio::spawn(async move {
            locker
                .write_lock(
                    "k",
                    LockOptions {
                        max_wait_time: 10,
                        ..Default::default()
                    },
                )
                .await
        })
    };
    sleep(Duration::from_millis(100)).await;

    // The claim is in place: new readers are already refused.
    let err = locker.read_lock("k", fail_fast()).await.unwrap_err();
    assert!(err.is_resource_locked());

    reader.release().await.unwrap();
    let writer = contender.await.unwrap().unwrap();
    writer.release().await.unwrap();
}

#[tokio::test]
async fn test_conflict_resolution_lower_token_wins() {
    let store = ShardSet::memory(1);
    let locker1 = Locker::new(store.clone());
    let locker2 = Locker::new(store.clone());

    let base_a = LockOptions {
        token_base: Some("a".to_string()),
        resolve_conflicts: true,
        ..Default::default()
    };
    let holder = locker1.write_lock("foo", base_a).await.unwrap();

    // The higher base loses immediately, without waiting out the holder.
    let base_b = LockOptions {
        token_base: Some("b".to_string()),
        resolve_conflicts: true,
        ..Default::default()
    };
    let started = Instant::now();
    let err = locker2.write_lock("foo", base_b).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(err.to_string().contains("conflict resolution"));
    let context = err.as_resource_locked().unwrap();
    assert!(matches!(
        context.reason,
        LockedReason::ConflictResolution { .. }
    ));

    // A better priority flips the comparison: no conflict-resolution loss,
    // just a normal wait that times out while the holder persists.
    let priority_b = LockOptions {
        token_base: Some("b".to_string()),
        resolve_conflicts: true,
        conflict_priority: 1,
        max_wait_time: 1,
        ..Default::default()
    };
    let err = locker2.write_lock("foo", priority_b).await.unwrap_err();
    let context = err.as_resource_locked().unwrap();
    assert_eq!(context.reason, LockedReason::Timeout);

    holder.release().await.unwrap();
    let winner = locker2
        .write_lock(
            "foo",
            LockOptions {
                token_base: Some("b".to_string()),
                resolve_conflicts: true,
                conflict_priority: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(winner.token().await.starts_with("01b"));
    winner.release().await.unwrap();
}

#[tokio::test]
async fn test_acquire_release_leaves_no_remote_state() {
    let (store, shard) = store_with_handle();
    let locker = Locker::new(store);

    let write = locker.write_lock("k", LockOptions::default()).await.unwrap();
    assert!(shard.write_holder("rzlock:write:k").await.unwrap().is_some());
    write.release().await.unwrap();
    assert!(shard.write_holder("rzlock:write:k").await.unwrap().is_none());

    let read = locker.read_lock("k", LockOptions::default()).await.unwrap();
    assert_eq!(shard.read_holders("rzlock:read:k").await.unwrap().len(), 1);
    read.release().await.unwrap();
    assert!(shard.read_holders("rzlock:read:k").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_force_release_is_idempotent() {
    let locker = Locker::new(ShardSet::memory(1));
    let lock = locker.write_lock("k", LockOptions::default()).await.unwrap();
    lock.relock().await.unwrap();

    lock.force_release().await.unwrap();
    assert!(!lock.is_locked().await);
    assert_eq!(lock.ref_count().await, 0);
    lock.force_release().await.unwrap();

    let lock = locker.write_lock("k", fail_fast()).await.unwrap();
    lock.release().await.unwrap();
}

#[tokio::test]
async fn test_fail_fast_returns_immediately() {
    let locker = Locker::new(ShardSet::memory(1));
    let holder = locker.write_lock("k", LockOptions::default()).await.unwrap();

    let started = Instant::now();
    let err = locker.write_lock("k", fail_fast()).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(50));
    let context = err.as_resource_locked().unwrap();
    assert_eq!(context.reason, LockedReason::FastFail);
    assert!(context.observed_holder.is_some());

    holder.release().await.unwrap();
}

#[tokio::test]
async fn test_timeout_carries_diagnostics() {
    let locker = Locker::new(ShardSet::memory(1));
    let holder = locker.write_lock("k", LockOptions::default()).await.unwrap();

    let err = locker
        .write_lock(
            "k",
            LockOptions {
                max_wait_time: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    let context = err.as_resource_locked().unwrap();
    assert_eq!(context.reason, LockedReason::Timeout);
    assert_eq!(context.key, "k");
    assert_eq!(context.role, LockRole::Write);
    assert_eq!(context.max_wait_time, 1);
    assert!(context.elapsed_ms >= 1000);
    assert!(context.token.is_some());
    assert_eq!(
        context.observed_holder.as_deref(),
        Some(holder.token().await.as_str())
    );

    holder.release().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_keeps_lock_alive_past_lock_timeout() {
    let locker = Locker::new(ShardSet::memory(1));

    let holder = locker
        .write_lock(
            "k",
            LockOptions {
                lock_timeout: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    sleep(Duration::from_secs(2)).await;

    // Still held: the heartbeat refreshed the lease past its TTL.
    let err = locker
        .write_lock(
            "k",
            LockOptions {
                max_wait_time: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_resource_locked());
    assert!(!holder.is_lost());

    holder.release().await.unwrap();
    let lock = locker.write_lock("k", fail_fast()).await.unwrap();
    lock.release().await.unwrap();
}

#[tokio::test]
async fn test_no_heartbeat_lets_lock_expire() {
    let locker = Locker::new(ShardSet::memory(1));

    let _stale = locker
        .write_lock(
            "k",
            LockOptions {
                lock_timeout: 1,
                heartbeat_enabled: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    sleep(Duration::from_millis(1200)).await;

    let lock = locker.write_lock("k", fail_fast()).await.unwrap();
    lock.release().await.unwrap();
}

#[tokio::test]
async fn test_zero_lock_timeout_never_expires() {
    let locker = Locker::new(ShardSet::memory(1));

    let holder = locker
        .write_lock(
            "k",
            LockOptions {
                lock_timeout: 0,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    sleep(Duration::from_millis(300)).await;

    let err = locker.write_lock("k", fail_fast()).await.unwrap_err();
    assert!(err.is_resource_locked());
    holder.release().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_detects_lost_lease() {
    let (store, shard) = store_with_handle();
    let locker = Locker::new(store);

    let holder = locker
        .write_lock(
            "k",
            LockOptions {
                heartbeat_interval: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let token = holder.token().await;

    // Yank the lease out from under the holder.
    assert!(shard
        .write_lock_release("rzlock:write:k", &token)
        .await
        .unwrap());
    sleep(Duration::from_millis(400)).await;

    assert!(holder.is_lost());
    // The handle still releases cleanly (no remote state left to remove).
    holder.release().await.unwrap();
}

#[tokio::test]
async fn test_shard_outage_is_a_retryable_miss() {
    let (store, shard) = store_with_handle();
    let locker = Locker::new(store);

    shard.set_down(true);
    let acquisition = {
        let locker = locker.clone();
        tokio::spawn(async move {
            locker
                .write_lock(
                    "k",
                    LockOptions {
                        max_wait_time: 10,
                        ..Default::default()
                    },
                )
                .await
        })
    };
    sleep(Duration::from_millis(300)).await;
    shard.set_down(false);

    let lock = acquisition.await.unwrap().unwrap();
    lock.release().await.unwrap();
}

#[tokio::test]
async fn test_upgrade_then_release_equals_release() {
    let (store, shard) = store_with_handle();
    let locker = Locker::new(store);

    let lock = locker.read_lock("k", LockOptions::default()).await.unwrap();
    lock.upgrade(LockOptions::default()).await.unwrap();
    assert_eq!(lock.role().await, LockRole::Write);
    assert!(shard.write_holder("rzlock:write:k").await.unwrap().is_some());
    assert!(shard.read_holders("rzlock:read:k").await.unwrap().is_empty());

    lock.release().await.unwrap();
    assert!(shard.write_holder("rzlock:write:k").await.unwrap().is_none());
}

#[tokio::test]
async fn test_upgrade_failure_stop_keeps_remote_writer() {
    let store = ShardSet::memory(1);
    let locker = Locker::new(store.clone());
    let other = Locker::new(store);

    let reader = locker.read_lock("k", LockOptions::default()).await.unwrap();
    // Upgrade has to give up its read lease first; an interloping writer
    // then beats the reacquisition.
    let interloper = {
        let other = other.clone();
        tokio::spawn(async move {
            other
                .write_lock(
                    "k",
                    LockOptions {
                        max_wait_time: 10,
                        ..Default::default()
                    },
                )
                .await
        })
    };
    sleep(Duration::from_millis(100)).await;

    let err = reader
        .upgrade(LockOptions {
            max_wait_time: 0,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.is_resource_locked());
    assert!(!reader.is_locked().await);

    let writer = interloper.await.unwrap().unwrap();
    writer.release().await.unwrap();
}

#[tokio::test]
async fn test_distributed_read_flags_every_shard() {
    let store = ShardSet::memory(4);
    let locker = Locker::new(store.clone());

    let reader = locker
        .read_lock(
            "k",
            LockOptions {
                distributed: Distributed::On,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    for index in 0..store.num_shards() {
        let ttl = store
            .shard(index)
            .unwrap()
            .flag_ttl_secs("rzlock:dflag:k")
            .await
            .unwrap();
        assert!(ttl.is_some(), "flag missing on shard {}", index);
    }

    // Exactly one shard holds the reader token.
    let mut reader_shards = 0;
    for index in 0..store.num_shards() {
        if !store
            .shard(index)
            .unwrap()
            .read_holders("rzlock:read:k")
            .await
            .unwrap()
            .is_empty()
        {
            reader_shards += 1;
        }
    }
    assert_eq!(reader_shards, 1);

    reader.release().await.unwrap();
}

#[tokio::test]
async fn test_distributed_write_fans_out_to_all_shards() {
    let store = ShardSet::memory(3);
    let locker = Locker::new(store.clone());

    let writer = locker
        .write_lock(
            "k",
            LockOptions {
                distributed: Distributed::On,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(writer.is_distributed());
    assert_eq!(writer.per_shard().unwrap().len(), 3);

    for index in 0..store.num_shards() {
        assert!(
            store
                .shard(index)
                .unwrap()
                .write_holder("rzlock:write:k")
                .await
                .unwrap()
                .is_some(),
            "write slot empty on shard {}",
            index
        );
    }

    writer.release().await.unwrap();
    for index in 0..store.num_shards() {
        assert!(store
            .shard(index)
            .unwrap()
            .write_holder("rzlock:write:k")
            .await
            .unwrap()
            .is_none());
    }
}

#[tokio::test]
async fn test_distributed_write_rolls_back_partial_fanout() {
    let store = ShardSet::memory(3);
    let locker = Locker::new(store.clone());
    let other = Locker::new(store.clone());

    // Park a single-shard writer on the key's natural shard so the fan-out
    // fails there.
    let natural = store.shard_for_key("k");
    let blocker = other.write_lock("k", LockOptions::default()).await.unwrap();

    let err = locker
        .write_lock(
            "k",
            LockOptions {
                distributed: Distributed::On,
                max_wait_time: 0,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_resource_locked());

    // Nothing from the failed fan-out survives on any other shard.
    for index in 0..store.num_shards() {
        let holder = store
            .shard(index)
            .unwrap()
            .write_holder("rzlock:write:k")
            .await
            .unwrap();
        if index == natural {
            assert_eq!(holder, Some(blocker.token().await));
        } else {
            assert!(holder.is_none(), "stale claim left on shard {}", index);
        }
    }

    blocker.release().await.unwrap();
}

#[tokio::test]
async fn test_distributed_auto_promotes_after_distributed_read() {
    let store = ShardSet::memory(4);
    let locker = Locker::new(store.clone());

    // A distributed read leaves the flag behind for its TTL.
    let reader = locker
        .read_lock(
            "k",
            LockOptions {
                distributed: Distributed::On,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    reader.release().await.unwrap();

    let writer = locker
        .write_lock(
            "k",
            LockOptions {
                distributed: Distributed::Auto,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(writer.is_distributed());
    assert_eq!(writer.per_shard().unwrap().len(), 4);
    writer.release().await.unwrap();

    // No prior distributed read on this key: auto stays single-shard.
    let writer = locker
        .write_lock(
            "quiet",
            LockOptions {
                distributed: Distributed::Auto,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!writer.is_distributed());
    assert!(writer.per_shard().is_none());
    writer.release().await.unwrap();
}

#[tokio::test]
async fn test_debug_tokens_strip_to_core_for_comparison() {
    use rzlock_locks::{core_token, LockerConfig};

    let store = ShardSet::memory(1);
    let config = LockerConfig {
        debug_tokens: true,
        ..Default::default()
    };
    let locker = Locker::with_config(store.clone(), config);

    let lock = locker.write_lock("k", LockOptions::default()).await.unwrap();
    let token = lock.token().await;
    assert!(token.contains(" !!DEBUG!! "));
    assert!(core_token(&token).starts_with("50"));

    // The full token (metadata included) is what the store holds.
    let shard = store.shard(store.shard_for_key("k")).unwrap();
    assert_eq!(
        shard.write_holder("rzlock:write:k").await.unwrap(),
        Some(token)
    );
    lock.release().await.unwrap();
}
