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

//! Typed options for lock acquisition and locker configuration.

use std::fmt;
use std::sync::Arc;

/// Default lease TTL applied to lock entries, in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;

/// Default acquisition ceiling, in seconds.
pub const DEFAULT_MAX_WAIT_TIME_SECS: u64 = 86_400;

/// Default conflict priority (middle of the 00–99 range).
pub const DEFAULT_CONFLICT_PRIORITY: u8 = 50;

/// Default key prefix for all lock state.
pub const DEFAULT_PREFIX: &str = "rzlock:";

/// Renew the distributed flag when its TTL falls below this, in seconds.
pub const DEFAULT_MIN_FLAG_EXPIRE_SECS: u64 = 5;

/// TTL written when the distributed flag is renewed, in seconds.
pub const DEFAULT_MAX_FLAG_EXPIRE_SECS: u64 = 60;

/// Spread for the randomized flag-renewal schedule, in seconds.
pub const DEFAULT_FLAG_TIMER_WINDOW_SECS: u64 = 15;

/// Writer/reader distribution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distributed {
    /// Single-shard placement by key (the normal mode).
    #[default]
    Off,
    /// Readers pick a random shard; writers fan out to every shard.
    On,
    /// Writers consult the distributed flag to choose; readers behave
    /// as in `On`.
    Auto,
}

/// Error policy for upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnUpgradeError {
    /// Rethrow at the first failure.
    #[default]
    Stop,
    /// Force-release (the handle, or the whole set) before rethrowing.
    Release,
    /// Collect the failed handles and keep going (lock sets only).
    Ignore,
}

/// Per-acquisition options.
///
/// Start from [`LockOptions::default`] (or a locker's configured defaults)
/// and override fields struct-literal style:
///
/// ```rust
/// use rzlock_locks::LockOptions;
///
/// let options = LockOptions {
///     max_wait_time: 0,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// TTL applied to KV entries, in seconds; 0 means no expiry.
    pub lock_timeout: u64,
    /// Acquisition ceiling in seconds; 0 means fail fast.
    pub max_wait_time: u64,
    /// Whether the handle runs a heartbeat at all.
    pub heartbeat_enabled: bool,
    /// Heartbeat period override in milliseconds
    /// (default: `lock_timeout * 1000 / 3`).
    pub heartbeat_interval: Option<u64>,
    /// TTL written by each heartbeat, in seconds
    /// (default: `ceil(3 * interval / 1000)`).
    pub heartbeat_timeout: Option<u64>,
    /// Elapsed-wait threshold for a single warning, in seconds.
    pub warn_time: Option<u64>,
    /// Enable the deterministic loser short-circuit.
    pub resolve_conflicts: bool,
    /// Per-request priority, 0–99; lower wins.
    pub conflict_priority: u8,
    /// Override the token base (lock sets inject theirs for writers).
    pub token_base: Option<String>,
    /// Distribution mode.
    pub distributed: Distributed,
    /// On distributed reads, maintain the distributed flag for auto
    /// writers.
    pub enable_distributed_auto: bool,
    /// Upgrade error policy.
    pub on_error: OnUpgradeError,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT_SECS,
            max_wait_time: DEFAULT_MAX_WAIT_TIME_SECS,
            heartbeat_enabled: true,
            heartbeat_interval: None,
            heartbeat_timeout: None,
            warn_time: None,
            resolve_conflicts: false,
            conflict_priority: DEFAULT_CONFLICT_PRIORITY,
            token_base: None,
            distributed: Distributed::Off,
            enable_distributed_auto: true,
            on_error: OnUpgradeError::Stop,
        }
    }
}

impl LockOptions {
    /// Resolved heartbeat parameters: `(interval_ms, ttl_secs)`, or `None`
    /// when heartbeats are disabled or meaningless (no lease TTL and no
    /// explicit interval).
    pub(crate) fn heartbeat_params(&self) -> Option<(u64, u64)> {
        if !self.heartbeat_enabled {
            return None;
        }
        let interval_ms = self
            .heartbeat_interval
            .unwrap_or(self.lock_timeout * 1000 / 3);
        if interval_ms == 0 {
            return None;
        }
        let ttl_secs = self
            .heartbeat_timeout
            .unwrap_or_else(|| (3 * interval_ms).div_ceil(1000));
        Some((interval_ms, ttl_secs))
    }
}

/// Callback fired once per acquisition when the wait crosses `warn_time`;
/// receives the key and the elapsed wait in milliseconds.
pub type WarnCallback = Arc<dyn Fn(&str, u64) + Send + Sync>;

/// Locker-level configuration.
#[derive(Clone)]
pub struct LockerConfig {
    /// Key prefix for all lock state.
    pub prefix: String,
    /// Embed per-token diagnostics after the debug sentinel.
    pub debug_tokens: bool,
    /// Defaults handed out by [`crate::Locker::options`].
    pub defaults: LockOptions,
    /// Renew the distributed flag when its TTL falls below this (seconds).
    pub min_distributed_flag_expire: u64,
    /// TTL written when the distributed flag is renewed (seconds).
    pub max_distributed_flag_expire: u64,
    /// Spread for the randomized flag-renewal schedule (seconds).
    pub distributed_flag_timer_window: u64,
    /// Warning callback for long waits.
    pub on_warn: Option<WarnCallback>,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            debug_tokens: false,
            defaults: LockOptions::default(),
            min_distributed_flag_expire: DEFAULT_MIN_FLAG_EXPIRE_SECS,
            max_distributed_flag_expire: DEFAULT_MAX_FLAG_EXPIRE_SECS,
            distributed_flag_timer_window: DEFAULT_FLAG_TIMER_WINDOW_SECS,
            on_warn: None,
        }
    }
}

impl fmt::Debug for LockerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockerConfig")
            .field("prefix", &self.prefix)
            .field("debug_tokens", &self.debug_tokens)
            .field("defaults", &self.defaults)
            .field("min_distributed_flag_expire", &self.min_distributed_flag_expire)
            .field("max_distributed_flag_expire", &self.max_distributed_flag_expire)
            .field("distributed_flag_timer_window", &self.distributed_flag_timer_window)
            .field("on_warn", &self.on_warn.as_ref().map(|_| "<callback>"))
            .finish()
    }
}
