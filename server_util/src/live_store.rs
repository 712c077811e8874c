// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Every operation is bounded by this; an overrun surfaces as [`StoreError::Timeout`].
const OP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("live store unavailable: {0}")]
    Unavailable(String),
    #[error("live store operation timed out")]
    Timeout,
}

/// The KV surface the core needs from its live store: hashes with TTL,
/// sorted sets, and two atomic primitives (set-if-absent claim, scripted
/// multi-member removal). No ordering guarantees across keys.
#[async_trait]
pub trait LiveStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    /// The claim primitive: set only if absent, with TTL. Returns whether claimed.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;
    /// Atomic per-field flip; the finalization guard. Returns whether the field was set.
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;
    /// Members with score in `[min, max]`, ascending by score.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError>;
    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;
    /// Atomically remove every member iff all are currently present.
    /// Returns false (and removes nothing) if any is missing.
    async fn zrem_all_if_members(&self, key: &str, members: &[&str])
        -> Result<bool, StoreError>;

    /// Keys matching a glob pattern, for startup reconciliation sweeps.
    /// Scan-based; not a consistent snapshot under concurrent writes.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

/// Removes all ARGV members from the sorted set iff every one is present.
const ZREM_ALL_IF_MEMBERS: &str = r#"
for i, member in ipairs(ARGV) do
    if redis.call('ZSCORE', KEYS[1], member) == false then
        return 0
    end
end
for i, member in ipairs(ARGV) do
    redis.call('ZREM', KEYS[1], member)
end
return 1
"#;

/// Redis-backed live store, one multiplexed connection per process.
pub struct RedisLiveStore {
    conn: ConnectionManager,
    zrem_all_script: Script,
}

impl RedisLiveStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            Client::open(redis_url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn,
            zrem_all_script: Script::new(ZREM_ALL_IF_MEMBERS),
        })
    }

    async fn op<T, F>(fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(OP_TIMEOUT, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Unavailable(e.to_string())),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

#[async_trait]
impl LiveStore for RedisLiveStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Self::op(async move { conn.get(key).await }).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        Self::op(async move { conn.set_ex(key, value, seconds).await }).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let millis = ttl.as_millis() as u64;
        Self::op(async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(millis)
                .query_async(&mut conn)
                .await?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        Self::op(async move { conn.del(key).await }).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1) as i64;
        Self::op(async move { conn.expire(key, seconds).await }).await
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        Self::op(async move { conn.hgetall(key).await }).await
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let fields = fields.to_vec();
        Self::op(async move { conn.hset_multiple(key, &fields).await }).await
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Self::op(async move { conn.hset_nx(key, field, value).await }).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        Self::op(async move { conn.hdel(key, field).await }).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        Self::op(async move { conn.zadd(key, member, score).await }).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Self::op(async move {
            let removed: u32 = conn.zrem(key, member).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let mut conn = self.conn.clone();
        Self::op(async move { conn.zscore(key, member).await }).await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let mut conn = self.conn.clone();
        Self::op(async move { conn.zrangebyscore_withscores(key, min, max).await }).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        Self::op(async move { conn.zcard(key).await }).await
    }

    async fn zrem_all_if_members(
        &self,
        key: &str,
        members: &[&str],
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.zrem_all_script.key(key);
        for member in members {
            invocation.arg(*member);
        }
        Self::op(async move {
            let removed: u32 = invocation.invoke_async(&mut conn).await?;
            Ok(removed == 1)
        })
        .await
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Self::op(async move {
            let mut keys = Vec::new();
            let mut iter = conn.scan_match::<_, String>(pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            Ok(keys)
        })
        .await
    }
}

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, (HashMap<String, String>, Option<Instant>)>,
    zsets: HashMap<String, BTreeMap<String, f64>>,
}

impl MemoryInner {
    fn purge(&mut self, now: Instant) {
        self.strings
            .retain(|_, (_, expiry)| expiry.map_or(true, |at| at > now));
        self.hashes
            .retain(|_, (_, expiry)| expiry.map_or(true, |at| at > now));
    }
}

/// In-process live store with the same semantics, for tests and single-node
/// development. A single mutex makes every operation atomic.
#[derive(Default)]
pub struct MemoryLiveStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryLiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(Instant::now());
        inner
    }
}

#[async_trait]
impl LiveStore for MemoryLiveStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().strings.get(key).map(|(v, _)| v.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.lock()
            .strings
            .insert(key.to_owned(), (value.to_owned(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner
            .strings
            .insert(key.to_owned(), (value.to_owned(), Some(Instant::now() + ttl)));
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.zsets.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let at = Some(Instant::now() + ttl);
        if let Some((_, expiry)) = inner.strings.get_mut(key) {
            *expiry = at;
        }
        if let Some((_, expiry)) = inner.hashes.get_mut(key) {
            *expiry = at;
        }
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .map(|(fields, _)| fields.clone())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let entry = inner
            .hashes
            .entry(key.to_owned())
            .or_insert_with(|| (HashMap::new(), None));
        for (field, value) in fields {
            entry.0.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let entry = inner
            .hashes
            .entry(key.to_owned())
            .or_insert_with(|| (HashMap::new(), None));
        if entry.0.contains_key(field) {
            return Ok(false);
        }
        entry.0.insert(field.to_owned(), value.to_owned());
        Ok(true)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        if let Some((fields, _)) = self.lock().hashes.get_mut(key) {
            fields.remove(field);
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.lock()
            .zsets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .zsets
            .get_mut(key)
            .map(|set| set.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        Ok(self
            .lock()
            .zsets
            .get(key)
            .and_then(|set| set.get(member).copied()))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let inner = self.lock();
        let mut members: Vec<(String, f64)> = inner
            .zsets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.lock().zsets.get(key).map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn zrem_all_if_members(
        &self,
        key: &str,
        members: &[&str],
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let set = match inner.zsets.get_mut(key) {
            Some(set) => set,
            None => return Ok(false),
        };
        if !members.iter().all(|member| set.contains_key(*member)) {
            return Ok(false);
        }
        for member in members {
            set.remove(*member);
        }
        Ok(true)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        // Trailing-star globs are all the core uses.
        let matches = |key: &str| match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        };
        let inner = self.lock();
        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.hashes.keys())
            .chain(inner.zsets.keys())
            .filter(|key| matches(key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
