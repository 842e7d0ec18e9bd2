use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{TenancyError, TenancyResult};

/// Key/value store with per-key expiry backing the tenant cache.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> TenancyResult<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> TenancyResult<()>;
    async fn delete(&self, keys: &[String]) -> TenancyResult<()>;
    /// Writes `value` only if `key` holds nothing. Returns true when written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> TenancyResult<bool>;
    async fn ping(&self) -> TenancyResult<()>;

    /// Takes `key` for `ttl` unless someone else holds it. Returns true when taken.
    async fn try_lock(&self, key: &str, ttl: Duration) -> TenancyResult<bool> {
        self.set_nx_ex(key, "1", ttl).await
    }
}

/// Redis rejects a zero expiry.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

pub struct RedisCache {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(url: &str) -> TenancyResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> TenancyResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> TenancyResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs(ttl))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> TenancyResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> TenancyResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn ping(&self) -> TenancyResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-process backend for single-instance deployments and tests.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> TenancyResult<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| TenancyError::Cache("memory cache lock poisoned".into()))
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> TenancyResult<Option<String>> {
        let mut entries = self.entries()?;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> TenancyResult<()> {
        self.entries()?
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> TenancyResult<()> {
        let mut entries = self.entries()?;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> TenancyResult<bool> {
        let mut entries = self.entries()?;
        let now = Instant::now();
        if matches!(entries.get(key), Some((_, expires_at)) if *expires_at > now) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn ping(&self) -> TenancyResult<()> {
        Ok(())
    }
}
