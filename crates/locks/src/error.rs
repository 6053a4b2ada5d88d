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

//! Error types for lock operations.

use crate::LockRole;
use rzlock_store::StoreError;
use std::fmt;
use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Why an acquisition gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockedReason {
    /// The accumulated wait reached `max_wait_time`.
    Timeout,
    /// `max_wait_time` was 0 and the resource was held.
    FastFail,
    /// Deterministic conflict resolution: the holder's token won.
    ConflictResolution {
        /// Core token of the winning holder
        winner: String,
    },
    /// A lock for this key is already present in the lock set.
    AlreadyInSet,
}

/// Diagnostic context attached to every failed acquisition.
#[derive(Debug, Clone)]
pub struct ResourceLocked {
    /// Lock key
    pub key: String,
    /// Requested role
    pub role: LockRole,
    /// Why the acquisition gave up
    pub reason: LockedReason,
    /// Acquisition ceiling in seconds (0 = fail fast)
    pub max_wait_time: u64,
    /// Our own token, if one was generated
    pub token: Option<String>,
    /// Token base used for this acquisition
    pub token_base: String,
    /// Last observed holder (writer token, or joined reader tokens)
    pub observed_holder: Option<String>,
    /// How many times the observed holder changed while waiting
    pub holder_changes: u32,
    /// Accumulated wait in milliseconds
    pub elapsed_ms: u64,
}

impl ResourceLocked {
    /// Full diagnostic line for logs.
    pub fn details(&self) -> String {
        format!(
            "key={} role={} reason={:?} max_wait_time={}s elapsed={}ms token={:?} token_base={} holder={:?} holder_changes={}",
            self.key,
            self.role,
            self.reason,
            self.max_wait_time,
            self.elapsed_ms,
            self.token,
            self.token_base,
            self.observed_holder,
            self.holder_changes,
        )
    }
}

impl fmt::Display for ResourceLocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A lock cannot be acquired on the resource: {}", self.key)?;
        if let LockedReason::ConflictResolution { winner } = &self.reason {
            write!(f, " (lost conflict resolution to holder {})", winner)?;
        }
        Ok(())
    }
}

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Acquisition gave up: timeout, fail-fast miss, conflict-resolution
    /// loss, or duplicate key in a lock set.
    #[error("{0}")]
    ResourceLocked(Box<ResourceLocked>),

    /// API misuse (upgrade on a released or write handle, duplicate
    /// `add_lock`, distributed upgrade).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invariant violation (relock after release).
    #[error("internal error: {0}")]
    Internal(String),

    /// Store-layer error that the engine could not absorb.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LockError {
    pub(crate) fn locked(context: ResourceLocked) -> Self {
        Self::ResourceLocked(Box::new(context))
    }

    /// Whether this is an acquisition failure (as opposed to misuse or a
    /// store error).
    pub fn is_resource_locked(&self) -> bool {
        matches!(self, LockError::ResourceLocked(_))
    }

    /// Diagnostic context of an acquisition failure, if that is what this is.
    pub fn as_resource_locked(&self) -> Option<&ResourceLocked> {
        match self {
            LockError::ResourceLocked(context) => Some(context),
            _ => None,
        }
    }
}
