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

//! Lock handles: owned leases with heartbeats, reference counting, and
//! upgrades.
//!
//! A [`Lock`] is either a single-shard lease or the composite handle a
//! distributed write produces (one child per shard, released together in
//! reverse shard order). Handles clone cheaply and share state, which is
//! how lock sets hand the same lease out more than once.

use crate::engine;
use crate::error::{LockError, LockResult};
use crate::locker::LockerInner;
use crate::options::{Distributed, LockOptions, OnUpgradeError};
use crate::LockRole;
use rzlock_store::HeartbeatReply;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};

pub(crate) enum Shape {
    Single { shard_index: usize },
    Distributed { children: Vec<Lock> },
}

pub(crate) struct HandleState {
    pub(crate) token: String,
    pub(crate) role: LockRole,
    pub(crate) ref_count: u32,
    pub(crate) is_locked: bool,
    heartbeat: Option<JoinHandle<()>>,
    flag_refresher: Option<JoinHandle<()>>,
    heartbeat_params: Option<(u64, u64)>,
}

pub(crate) struct LockInner {
    pub(crate) key: String,
    pub(crate) shape: Shape,
    pub(crate) distributed_read: bool,
    pub(crate) locker: Arc<LockerInner>,
    lost: AtomicBool,
    pub(crate) state: Mutex<HandleState>,
}

/// An owned lease on a lock key.
///
/// Created by acquisition; lives until the final [`release`](Lock::release)
/// (reference count reaching 0) or a [`force_release`](Lock::force_release).
/// While alive, a heartbeat task periodically refreshes the lease TTL.
#[derive(Clone)]
pub struct Lock {
    pub(crate) inner: Arc<LockInner>,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock").field("key", &self.inner.key).finish()
    }
}

impl Lock {
    pub(crate) fn new_single(
        locker: Arc<LockerInner>,
        key: &str,
        shard_index: usize,
        token: String,
        role: LockRole,
        distributed_read: bool,
        opts: &LockOptions,
    ) -> Self {
        Self {
            inner: Arc::new(LockInner {
                key: key.to_string(),
                shape: Shape::Single { shard_index },
                distributed_read,
                locker,
                lost: AtomicBool::new(false),
                state: Mutex::new(HandleState {
                    token,
                    role,
                    ref_count: 1,
                    is_locked: true,
                    heartbeat: None,
                    flag_refresher: None,
                    heartbeat_params: opts.heartbeat_params(),
                }),
            }),
        }
    }

    pub(crate) fn new_distributed(
        locker: Arc<LockerInner>,
        key: &str,
        children: Vec<Lock>,
        token: String,
    ) -> Self {
        Self {
            inner: Arc::new(LockInner {
                key: key.to_string(),
                shape: Shape::Distributed { children },
                distributed_read: false,
                locker,
                lost: AtomicBool::new(false),
                state: Mutex::new(HandleState {
                    token,
                    role: LockRole::Write,
                    ref_count: 1,
                    is_locked: true,
                    heartbeat: None,
                    flag_refresher: None,
                    heartbeat_params: None,
                }),
            }),
        }
    }

    /// The lock key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Our holder token (the first per-shard token for composites).
    pub async fn token(&self) -> String {
        self.inner.state.lock().await.token.clone()
    }

    /// Current role of the lease.
    pub async fn role(&self) -> LockRole {
        self.inner.state.lock().await.role
    }

    /// Whether the lease is still held locally.
    pub async fn is_locked(&self) -> bool {
        self.inner.state.lock().await.is_locked
    }

    /// Current reference count.
    pub async fn ref_count(&self) -> u32 {
        self.inner.state.lock().await.ref_count
    }

    /// Whether a heartbeat observed that the lease is gone remotely. The
    /// handle still behaves as locked locally until released, but any
    /// mutual-exclusion assumption after this point is suspect.
    pub fn is_lost(&self) -> bool {
        if self.inner.lost.load(Ordering::SeqCst) {
            return true;
        }
        match &self.inner.shape {
            Shape::Single { .. } => false,
            Shape::Distributed { children } => children.iter().any(Lock::is_lost),
        }
    }

    /// Whether `other` is a clone of this same handle (lock sets hand the
    /// same handle out for repeated requests on one key).
    pub fn is_same_handle(&self, other: &Lock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether this is a distributed composite over every shard.
    pub fn is_distributed(&self) -> bool {
        matches!(self.inner.shape, Shape::Distributed { .. })
    }

    /// Per-shard child handles of a distributed composite.
    pub fn per_shard(&self) -> Option<&[Lock]> {
        match &self.inner.shape {
            Shape::Single { .. } => None,
            Shape::Distributed { children } => Some(children),
        }
    }

    /// Decrement the reference count; the final holder releases remotely.
    ///
    /// Releasing an already-released handle is a warned no-op.
    pub async fn release(&self) -> LockResult<()> {
        let mut state = self.inner.state.lock().await;
        if !state.is_locked {
            warn!(key = %self.inner.key, "release on an already-released lock");
            return Ok(());
        }
        if state.ref_count > 1 {
            state.ref_count -= 1;
            return Ok(());
        }
        self.force_release_with(&mut state).await
    }

    /// Drop the lease regardless of reference count. Idempotent.
    pub async fn force_release(&self) -> LockResult<()> {
        let mut state = self.inner.state.lock().await;
        if !state.is_locked {
            return Ok(());
        }
        self.force_release_with(&mut state).await
    }

    async fn force_release_with(&self, state: &mut HandleState) -> LockResult<()> {
        if let Some(task) = state.heartbeat.take() {
            task.abort();
        }
        if let Some(task) = state.flag_refresher.take() {
            task.abort();
        }
        state.is_locked = false;
        state.ref_count = 0;
        match &self.inner.shape {
            Shape::Single { shard_index } => {
                let shard = self.inner.locker.store.shard(*shard_index)?.clone();
                let result = match state.role {
                    LockRole::Write => shard
                        .write_lock_release(&self.inner.locker.write_key(&self.inner.key), &state.token)
                        .await
                        .map(|_| ()),
                    LockRole::Read => shard
                        .read_lock_release(&self.inner.locker.read_key(&self.inner.key), &state.token)
                        .await
                        .map(|_| ()),
                };
                match result {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_shard_unavailable() || e.is_backend() => {
                        warn!(key = %self.inner.key, error = %e, "release script suppressed on unreachable shard");
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Shape::Distributed { children } => {
                for child in children.iter().rev() {
                    Box::pin(child.force_release()).await?;
                }
                Ok(())
            }
        }
    }

    /// Take another reference on a held lease.
    ///
    /// ## Errors
    /// [`LockError::Internal`] if the lease was already released.
    pub async fn relock(&self) -> LockResult<()> {
        let mut state = self.inner.state.lock().await;
        if !state.is_locked {
            return Err(LockError::Internal(format!(
                "relock after release on key {}",
                self.inner.key
            )));
        }
        state.ref_count += 1;
        Ok(())
    }

    /// Upgrade a held read lease to a write lease on the same key.
    ///
    /// The read lease is force-released, a single-shard write lease is
    /// acquired with `options`, and its token, role, and heartbeat
    /// parameters are adopted into this handle (preserving the reference
    /// count). `options.on_error` decides what happens when the
    /// reacquisition fails: `Stop` rethrows, `Release` force-releases this
    /// handle first.
    ///
    /// ## Errors
    /// [`LockError::InvalidArgument`] on a released handle, a write
    /// handle, a distributed composite, or distributed options.
    pub async fn upgrade(&self, options: LockOptions) -> LockResult<()> {
        if self.is_distributed() {
            return Err(LockError::InvalidArgument(
                "cannot upgrade a distributed lock".to_string(),
            ));
        }
        if options.distributed != Distributed::Off {
            return Err(LockError::InvalidArgument(
                "upgrade reacquires as a single-shard writer".to_string(),
            ));
        }
        let saved_ref_count = {
            let mut state = self.inner.state.lock().await;
            if !state.is_locked {
                return Err(LockError::InvalidArgument(format!(
                    "upgrade on a released lock for key {}",
                    self.inner.key
                )));
            }
            if state.role == LockRole::Write {
                return Err(LockError::InvalidArgument(format!(
                    "upgrade on a write lock for key {}",
                    self.inner.key
                )));
            }
            let saved = state.ref_count;
            self.force_release_with(&mut state).await?;
            saved
        };

        match engine::acquire_write(&self.inner.locker, &self.inner.key, &options, None).await {
            Ok(new_lock) => {
                // Adopt the new lease and neutralize the temporary handle
                // so it never double-releases or double-heartbeats.
                let (token, heartbeat_params) = {
                    let mut new_state = new_lock.inner.state.lock().await;
                    if let Some(task) = new_state.heartbeat.take() {
                        task.abort();
                    }
                    new_state.is_locked = false;
                    new_state.ref_count = 0;
                    (new_state.token.clone(), new_state.heartbeat_params)
                };
                {
                    let mut state = self.inner.state.lock().await;
                    state.token = token;
                    state.role = LockRole::Write;
                    state.heartbeat_params = heartbeat_params;
                    state.is_locked = true;
                    state.ref_count = saved_ref_count.max(1);
                }
                self.inner.lost.store(false, Ordering::SeqCst);
                self.start_heartbeat().await;
                Ok(())
            }
            Err(e) => {
                match options.on_error {
                    OnUpgradeError::Release => {
                        // The read lease is already gone; make sure the
                        // handle itself is fully released too.
                        let _ = self.force_release().await;
                    }
                    OnUpgradeError::Stop | OnUpgradeError::Ignore => {}
                }
                Err(e)
            }
        }
    }

    /// Start the background tasks a fresh lease needs.
    pub(crate) async fn start_background(&self, opts: &LockOptions) {
        self.start_heartbeat().await;
        if self.inner.distributed_read && opts.enable_distributed_auto {
            crate::distributed::start_flag_refresher(self).await;
        }
    }

    pub(crate) async fn set_flag_refresher(&self, task: JoinHandle<()>) {
        let mut state = self.inner.state.lock().await;
        if let Some(previous) = state.flag_refresher.replace(task) {
            previous.abort();
        }
    }

    /// Spawn the heartbeat task, if this lease runs one.
    pub(crate) async fn start_heartbeat(&self) {
        let mut state = self.inner.state.lock().await;
        if !state.is_locked || state.heartbeat.is_some() {
            return;
        }
        let shard_index = match &self.inner.shape {
            Shape::Single { shard_index } => *shard_index,
            Shape::Distributed { .. } => return,
        };
        let Some((interval_ms, ttl_secs)) = state.heartbeat_params else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        state.heartbeat = Some(tokio::spawn(async move {
            heartbeat_loop(weak, shard_index, interval_ms, ttl_secs).await;
        }));
    }
}

async fn heartbeat_loop(weak: Weak<LockInner>, shard_index: usize, interval_ms: u64, ttl_secs: u64) {
    let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let (token, role, is_locked) = {
            let state = inner.state.lock().await;
            (state.token.clone(), state.role, state.is_locked)
        };
        if !is_locked {
            break;
        }
        let shard = match inner.locker.store.shard(shard_index) {
            Ok(shard) => shard.clone(),
            Err(_) => break,
        };
        let reply = match role {
            LockRole::Write => {
                shard
                    .write_lock_heartbeat(&inner.locker.write_key(&inner.key), &token, ttl_secs)
                    .await
            }
            LockRole::Read => {
                shard
                    .read_lock_heartbeat(&inner.locker.read_key(&inner.key), &token, ttl_secs)
                    .await
            }
        };
        match reply {
            Ok(HeartbeatReply::Extended) => {}
            Ok(HeartbeatReply::Conflict { holder }) => {
                warn!(key = %inner.key, holder, "heartbeat found another holder; lease lost");
                inner.lost.store(true, Ordering::SeqCst);
                break;
            }
            Ok(HeartbeatReply::Lost) => {
                warn!(key = %inner.key, "heartbeat found no lease; lease lost");
                inner.lost.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                // Transport trouble is not a verdict on the lease.
                debug!(key = %inner.key, error = %e, "heartbeat round trip failed; will retry");
            }
        }
    }
}
