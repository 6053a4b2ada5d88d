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

//! Redis lock-state shard.
//!
//! ## Purpose
//! Implements [`LockStore`] against one Redis node per shard. Every atomic
//! routine is an embedded Lua script evaluated via [`redis::Script`] in a
//! single round trip; Lua execution is single-threaded on the server, which
//! gives the run-to-completion atomicity the routines rely on.
//!
//! ## Script replies
//! Each script returns an array whose first element is an outcome code:
//! 0 = conflict, 1 = success, 2 = claimed-pending-drain, 3 = lost. The
//! remaining elements carry the conflicting holder or the read-set members.
//!
//! ## Down-node handling
//! Transport failures (connection refused, broken pipe, timeouts) are
//! reported as [`StoreError::ShardUnavailable`] for the duration of the
//! configured `down_node_expiry` grace window, after which they harden
//! into [`StoreError::Backend`].

use crate::{AcquireReply, HeartbeatReply, LockStore, StoreError, StoreResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script, Value};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// If the write slot is held, report its holder; otherwise join the read
/// set and apply the TTL.
const READ_LOCK_ACQUIRE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return {0, redis.call('GET', KEYS[1])}
end
redis.call('SADD', KEYS[2], ARGV[1])
if tonumber(ARGV[2]) > 0 then
  redis.call('EXPIRE', KEYS[2], ARGV[2])
end
return {1, redis.call('SMEMBERS', KEYS[2])}
"#;

/// Claim the write slot unless another token holds it; report remaining
/// readers so the client can poll for the drain.
const WRITE_LOCK_ACQUIRE: &str = r#"
local holder = redis.call('GET', KEYS[1])
if holder then
  return {0, holder}
end
if tonumber(ARGV[2]) > 0 then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
else
  redis.call('SET', KEYS[1], ARGV[1])
end
if redis.call('SCARD', KEYS[2]) > 0 then
  return {2, redis.call('SMEMBERS', KEYS[2])}
end
return {1}
"#;

/// Re-assert an existing claim (refreshing the TTL) unless another writer
/// preempted it.
const WRITE_LOCK_RETRY: &str = r#"
local holder = redis.call('GET', KEYS[1])
if holder and holder ~= ARGV[1] then
  return {0, holder}
end
if tonumber(ARGV[2]) > 0 then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
else
  redis.call('SET', KEYS[1], ARGV[1])
end
if redis.call('SCARD', KEYS[2]) > 0 then
  return {2, redis.call('SMEMBERS', KEYS[2])}
end
return {1}
"#;

const READ_LOCK_RELEASE: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
return {1, redis.call('SMEMBERS', KEYS[1])}
"#;

const WRITE_LOCK_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1])
  return {1}
end
return {0}
"#;

const READ_LOCK_HEARTBEAT: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
  if tonumber(ARGV[2]) > 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
  end
  return {1}
end
return {3}
"#;

const WRITE_LOCK_HEARTBEAT: &str = r#"
local holder = redis.call('GET', KEYS[1])
if holder == ARGV[1] then
  if tonumber(ARGV[2]) > 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
  end
  return {1}
end
if holder then
  return {0, holder}
end
return {3}
"#;

/// Configuration for a Redis-backed shard.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Grace window during which a failing shard reports
    /// [`StoreError::ShardUnavailable`] (retryable) instead of a hard
    /// backend error.
    pub down_node_expiry: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            down_node_expiry: Duration::from_secs(60),
        }
    }
}

struct Scripts {
    read_acquire: Script,
    write_acquire: Script,
    write_retry: Script,
    read_release: Script,
    write_release: Script,
    read_heartbeat: Script,
    write_heartbeat: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            read_acquire: Script::new(READ_LOCK_ACQUIRE),
            write_acquire: Script::new(WRITE_LOCK_ACQUIRE),
            write_retry: Script::new(WRITE_LOCK_RETRY),
            read_release: Script::new(READ_LOCK_RELEASE),
            write_release: Script::new(WRITE_LOCK_RELEASE),
            read_heartbeat: Script::new(READ_LOCK_HEARTBEAT),
            write_heartbeat: Script::new(WRITE_LOCK_HEARTBEAT),
        }
    }
}

/// Redis-backed [`LockStore`] shard.
///
/// Holds one [`ConnectionManager`] (pooled, auto-reconnecting) per shard,
/// as the surrounding stack does for its Redis stores.
pub struct RedisLockStore {
    conn: ConnectionManager,
    shard_index: usize,
    down_node_expiry: Duration,
    down_since: Mutex<Option<Instant>>,
    scripts: Scripts,
}

impl RedisLockStore {
    /// Connect a shard to the given Redis URL.
    ///
    /// ## Errors
    /// [`StoreError::Backend`] if the client cannot be created or the
    /// initial connection fails.
    pub async fn new(url: &str, shard_index: usize, config: RedisStoreConfig) -> StoreResult<Self> {
        let client = Client::open(url)
            .map_err(|e| StoreError::Backend(format!("failed to create redis client: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect redis: {}", e)))?;
        Ok(Self {
            conn,
            shard_index,
            down_node_expiry: config.down_node_expiry,
            down_since: Mutex::new(None),
            scripts: Scripts::new(),
        })
    }

    fn mark_up(&self) {
        if let Ok(mut down) = self.down_since.lock() {
            *down = None;
        }
    }

    fn map_err(&self, err: redis::RedisError) -> StoreError {
        let transient = err.is_io_error()
            || err.is_timeout()
            || err.is_connection_refusal()
            || err.is_connection_dropped();
        if !transient {
            return StoreError::Backend(format!("redis error: {}", err));
        }
        let within_grace = match self.down_since.lock() {
            Ok(mut down) => {
                if down.is_none() {
                    warn!(shard = self.shard_index, error = %err, "shard marked down");
                }
                let since = *down.get_or_insert_with(Instant::now);
                since.elapsed() <= self.down_node_expiry
            }
            Err(_) => true,
        };
        if within_grace {
            StoreError::ShardUnavailable {
                shard: self.shard_index,
                reason: err.to_string(),
            }
        } else {
            StoreError::Backend(format!("shard down past grace window: {}", err))
        }
    }

    async fn run_script(
        &self,
        script: &Script,
        keys: &[&str],
        args: &[String],
    ) -> StoreResult<Value> {
        let mut conn = self.conn.clone();
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }
        match invocation.invoke_async::<Value>(&mut conn).await {
            Ok(value) => {
                self.mark_up();
                Ok(value)
            }
            Err(e) => Err(self.map_err(e)),
        }
    }
}

fn reply_array(value: Value) -> StoreResult<Vec<Value>> {
    match value {
        Value::Array(items) if !items.is_empty() => Ok(items),
        other => Err(StoreError::BadReply(format!(
            "expected non-empty array, got {:?}",
            other
        ))),
    }
}

fn reply_code(items: &[Value]) -> StoreResult<i64> {
    match items.first() {
        Some(Value::Int(code)) => Ok(*code),
        other => Err(StoreError::BadReply(format!(
            "expected integer outcome code, got {:?}",
            other
        ))),
    }
}

fn reply_string(value: &Value) -> StoreResult<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| StoreError::BadReply(format!("non-utf8 token: {}", e))),
        Value::SimpleString(s) => Ok(s.clone()),
        other => Err(StoreError::BadReply(format!(
            "expected string, got {:?}",
            other
        ))),
    }
}

fn reply_members(items: &[Value]) -> StoreResult<Vec<String>> {
    match items.get(1) {
        None => Ok(Vec::new()),
        Some(Value::Array(values)) => values.iter().map(reply_string).collect(),
        Some(other) => Err(StoreError::BadReply(format!(
            "expected member array, got {:?}",
            other
        ))),
    }
}

fn parse_acquire(value: Value) -> StoreResult<AcquireReply> {
    let items = reply_array(value)?;
    match reply_code(&items)? {
        0 => {
            let holder = items
                .get(1)
                .ok_or_else(|| StoreError::BadReply("conflict reply without holder".into()))
                .and_then(reply_string)?;
            Ok(AcquireReply::Conflict { holder })
        }
        1 => Ok(AcquireReply::Acquired {
            readers: reply_members(&items)?,
        }),
        2 => Ok(AcquireReply::Draining {
            readers: reply_members(&items)?,
        }),
        code => Err(StoreError::BadReply(format!(
            "unexpected acquire outcome code {}",
            code
        ))),
    }
}

fn parse_heartbeat(value: Value) -> StoreResult<HeartbeatReply> {
    let items = reply_array(value)?;
    match reply_code(&items)? {
        1 => Ok(HeartbeatReply::Extended),
        0 => {
            let holder = items
                .get(1)
                .ok_or_else(|| StoreError::BadReply("conflict reply without holder".into()))
                .and_then(reply_string)?;
            Ok(HeartbeatReply::Conflict { holder })
        }
        3 => Ok(HeartbeatReply::Lost),
        code => Err(StoreError::BadReply(format!(
            "unexpected heartbeat outcome code {}",
            code
        ))),
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn read_lock_acquire(
        &self,
        write_key: &str,
        read_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<AcquireReply> {
        let value = self
            .run_script(
                &self.scripts.read_acquire,
                &[write_key, read_key],
                &[token.to_string(), ttl_secs.to_string()],
            )
            .await?;
        parse_acquire(value)
    }

    async fn write_lock_acquire(
        &self,
        write_key: &str,
        read_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<AcquireReply> {
        let value = self
            .run_script(
                &self.scripts.write_acquire,
                &[write_key, read_key],
                &[token.to_string(), ttl_secs.to_string()],
            )
            .await?;
        parse_acquire(value)
    }

    async fn write_lock_retry(
        &self,
        write_key: &str,
        read_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<AcquireReply> {
        let value = self
            .run_script(
                &self.scripts.write_retry,
                &[write_key, read_key],
                &[token.to_string(), ttl_secs.to_string()],
            )
            .await?;
        parse_acquire(value)
    }

    async fn read_lock_release(&self, read_key: &str, token: &str) -> StoreResult<Vec<String>> {
        let value = self
            .run_script(&self.scripts.read_release, &[read_key], &[token.to_string()])
            .await?;
        let items = reply_array(value)?;
        reply_members(&items)
    }

    async fn write_lock_release(&self, write_key: &str, token: &str) -> StoreResult<bool> {
        let value = self
            .run_script(
                &self.scripts.write_release,
                &[write_key],
                &[token.to_string()],
            )
            .await?;
        let items = reply_array(value)?;
        Ok(reply_code(&items)? == 1)
    }

    async fn read_lock_heartbeat(
        &self,
        read_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<HeartbeatReply> {
        let value = self
            .run_script(
                &self.scripts.read_heartbeat,
                &[read_key],
                &[token.to_string(), ttl_secs.to_string()],
            )
            .await?;
        parse_heartbeat(value)
    }

    async fn write_lock_heartbeat(
        &self,
        write_key: &str,
        token: &str,
        ttl_secs: u64,
    ) -> StoreResult<HeartbeatReply> {
        let value = self
            .run_script(
                &self.scripts.write_heartbeat,
                &[write_key],
                &[token.to_string(), ttl_secs.to_string()],
            )
            .await?;
        parse_heartbeat(value)
    }

    async fn flag_ttl_secs(&self, flag_key: &str) -> StoreResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let ttl: i64 = conn.ttl(flag_key).await.map_err(|e| self.map_err(e))?;
        self.mark_up();
        match ttl {
            -2 => Ok(None),
            secs => Ok(Some(secs)),
        }
    }

    async fn flag_set(&self, flag_key: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(flag_key, "1", ttl_secs)
            .await
            .map_err(|e| self.map_err(e))?;
        self.mark_up();
        Ok(())
    }

    async fn write_holder(&self, write_key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = conn.get(write_key).await.map_err(|e| self.map_err(e))?;
        self.mark_up();
        Ok(holder)
    }

    async fn read_holders(&self, read_key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> =
            conn.smembers(read_key).await.map_err(|e| self.map_err(e))?;
        self.mark_up();
        members.sort();
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Requires a running Redis instance on the default port.
    async fn create_test_shard() -> RedisLockStore {
        RedisLockStore::new("redis://localhost:6379", 0, RedisStoreConfig::default())
            .await
            .expect("Failed to connect to Redis (ensure Redis is running)")
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_redis_write_then_read_conflict() {
        let shard = create_test_shard().await;
        let w = "rzlock-test:write:redis-1";
        let r = "rzlock-test:read:redis-1";

        let reply = shard.write_lock_acquire(w, r, "50a1", 10).await.unwrap();
        assert_eq!(reply, AcquireReply::Acquired { readers: Vec::new() });

        let reply = shard.read_lock_acquire(w, r, "50b1", 10).await.unwrap();
        assert_eq!(
            reply,
            AcquireReply::Conflict {
                holder: "50a1".to_string()
            }
        );

        // Cleanup
        assert!(shard.write_lock_release(w, "50a1").await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_redis_claim_and_drain() {
        let shard = create_test_shard().await;
        let w = "rzlock-test:write:redis-2";
        let r = "rzlock-test:read:redis-2";

        shard.read_lock_acquire(w, r, "50a1", 10).await.unwrap();
        let reply = shard.write_lock_acquire(w, r, "50b1", 10).await.unwrap();
        assert_eq!(
            reply,
            AcquireReply::Draining {
                readers: vec!["50a1".to_string()]
            }
        );

        shard.read_lock_release(r, "50a1").await.unwrap();
        let reply = shard.write_lock_retry(w, r, "50b1", 10).await.unwrap();
        assert_eq!(reply, AcquireReply::Acquired { readers: Vec::new() });

        // Cleanup
        assert!(shard.write_lock_release(w, "50b1").await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_redis_heartbeat_outcomes() {
        let shard = create_test_shard().await;
        let w = "rzlock-test:write:redis-3";
        let r = "rzlock-test:read:redis-3";

        shard.write_lock_acquire(w, r, "50a1", 10).await.unwrap();
        assert_eq!(
            shard.write_lock_heartbeat(w, "50a1", 10).await.unwrap(),
            HeartbeatReply::Extended
        );
        shard.write_lock_release(w, "50a1").await.unwrap();
        assert_eq!(
            shard.write_lock_heartbeat(w, "50a1", 10).await.unwrap(),
            HeartbeatReply::Lost
        );
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_redis_flag_roundtrip() {
        let shard = create_test_shard().await;
        let flag = "rzlock-test:dflag:redis-4";

        shard.flag_set(flag, 30).await.unwrap();
        let ttl = shard.flag_ttl_secs(flag).await.unwrap().unwrap();
        assert!(ttl > 0 && ttl <= 30);
    }
}
