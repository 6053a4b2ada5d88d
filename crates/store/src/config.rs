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

//! Configuration support for store backends.
//!
//! ## Environment Variables
//!
//! - `RZLOCK_STORE_BACKEND`: "memory" (default) or "redis"
//! - `RZLOCK_SHARDS`: shard count for the memory backend (default: 1)
//! - `RZLOCK_REDIS_URLS`: comma-separated Redis URLs, one per shard
//!   (default: "redis://localhost:6379")

use crate::{ShardSet, StoreError, StoreResult};

/// Backend type configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendType {
    /// Sharded in-memory backend (default, always available).
    Memory {
        /// Number of shards
        shards: usize,
    },
    /// Redis backend, one node per shard (requires `redis-backend` feature).
    Redis {
        /// Redis URL per shard, in shard order
        urls: Vec<String>,
    },
}

impl Default for BackendType {
    fn default() -> Self {
        Self::Memory { shards: 1 }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Backend type
    pub backend: BackendType,
}

impl StoreConfig {
    /// Create configuration from environment variables.
    ///
    /// ## Errors
    /// [`StoreError::Config`] on an unknown backend name or an unparsable
    /// shard count.
    pub fn from_env() -> StoreResult<Self> {
        let backend = std::env::var("RZLOCK_STORE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase();
        match backend.as_str() {
            "memory" | "in-memory" => {
                let shards = match std::env::var("RZLOCK_SHARDS") {
                    Ok(raw) => raw.parse::<usize>().map_err(|e| {
                        StoreError::Config(format!("invalid RZLOCK_SHARDS {:?}: {}", raw, e))
                    })?,
                    Err(_) => 1,
                };
                Ok(Self {
                    backend: BackendType::Memory { shards },
                })
            }
            "redis" => {
                let urls = std::env::var("RZLOCK_REDIS_URLS")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>();
                if urls.is_empty() {
                    return Err(StoreError::Config("RZLOCK_REDIS_URLS is empty".into()));
                }
                Ok(Self {
                    backend: BackendType::Redis { urls },
                })
            }
            other => Err(StoreError::Config(format!(
                "unknown store backend {:?} (expected \"memory\" or \"redis\")",
                other
            ))),
        }
    }

    /// Build a [`ShardSet`] for this configuration.
    pub async fn build(&self) -> StoreResult<ShardSet> {
        match &self.backend {
            BackendType::Memory { shards } => Ok(ShardSet::memory(*shards)),
            #[cfg(feature = "redis-backend")]
            BackendType::Redis { urls } => {
                use crate::redis::{RedisLockStore, RedisStoreConfig};
                use std::sync::Arc;

                let mut shards: Vec<Arc<dyn crate::LockStore>> = Vec::with_capacity(urls.len());
                for (index, url) in urls.iter().enumerate() {
                    let shard =
                        RedisLockStore::new(url, index, RedisStoreConfig::default()).await?;
                    shards.push(Arc::new(shard));
                }
                ShardSet::new(shards)
            }
            #[cfg(not(feature = "redis-backend"))]
            BackendType::Redis { .. } => Err(StoreError::Config(
                "redis backend requested but the redis-backend feature is disabled".into(),
            )),
        }
    }
}
