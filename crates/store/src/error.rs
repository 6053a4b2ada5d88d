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

//! Error types for the sharded lock-state store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Shard is temporarily unreachable; callers may retry.
    #[error("shard {shard} unavailable: {reason}")]
    ShardUnavailable {
        /// Index of the affected shard
        shard: usize,
        /// Transport-level failure description
        reason: String,
    },

    /// Backend (KV-layer) error: the server answered but the operation failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// An atomic routine returned a reply the client cannot interpret.
    #[error("malformed script reply: {0}")]
    BadReply(String),

    /// Shard index out of range.
    #[error("invalid shard index {index} (store has {num_shards} shards)")]
    InvalidShard {
        /// Requested index
        index: usize,
        /// Number of shards in the store
        num_shards: usize,
    },

    /// Configuration error (bad environment variable, empty shard list).
    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether this error is a transient shard outage that callers should
    /// treat as a retryable miss rather than a hard failure.
    pub fn is_shard_unavailable(&self) -> bool {
        matches!(self, StoreError::ShardUnavailable { .. })
    }

    /// Whether this error originated in the KV layer itself (as opposed to
    /// a malformed reply or misconfiguration on the client side).
    pub fn is_backend(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}
