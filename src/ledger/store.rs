//! Abstraction over the shared key-value coordination store (spec section 6.4),
//! with an in-memory test double and a Redis-backed implementation, mirroring
//! the teacher's `InMemoryRepository`/`RedisRepository` split in
//! `portfolio/repository/`.
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("lock '{0}' could not be acquired")]
    LockUnavailable(String),

    #[error("serialisation error: {0}")]
    Serialisation(String),
}

/// Held while a named lock is acquired; releases the lock on drop.
pub struct LockGuard {
    _inner: LockGuardInner,
}

enum LockGuardInner {
    InMemory(OwnedMutexGuard<()>),
    Redis {
        client: redis::Client,
        key: String,
        token: String,
    },
}

impl Drop for LockGuardInner {
    fn drop(&mut self) {
        if let LockGuardInner::Redis { client, key, token } = self {
            // Best-effort release: only delete the key if we still own it.
            // A background task is spawned because Drop cannot be async.
            let client = client.clone();
            let key = key.clone();
            let token = token.clone();
            tokio::spawn(async move {
                if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
                    let script = redis::Script::new(
                        r#"
                        if redis.call("get", KEYS[1]) == ARGV[1] then
                            return redis.call("del", KEYS[1])
                        else
                            return 0
                        end
                        "#,
                    );
                    let _: redis::RedisResult<i32> =
                        script.key(key).arg(token).invoke_async(&mut conn).await;
                }
            });
        }
    }
}

/// The shared key-value store primitive required by spec section 6.4: get,
/// set, compare-and-set, atomic increment, named lock with TTL, hash get/set.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Atomically sets `key` to `new` only if its current value equals `expected`
    /// (`None` means "key must not exist"). Returns whether the swap happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError>;
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError>;
    async fn hash_get(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError>;
    async fn hash_set(&self, key: &str, fields: HashMap<String, String>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<LockGuard, StoreError>;
}

/// In-memory `CoordinationStore` for tests and single-process dry runs.
/// **Do not use across processes - no fault tolerant guarantees!**
#[derive(Default, Clone)]
pub struct InMemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
    hashes: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.lock().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let mut values = self.values.lock().await;
        let current = values.get(key).map(String::as_str);
        if current == expected {
            values.insert(key.to_string(), new.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut values = self.values.lock().await;
        let current: i64 = values
            .get(key)
            .map(|v| v.parse().unwrap_or(0))
            .unwrap_or(0);
        let updated = current + delta;
        values.insert(key.to_string(), updated.to_string());
        Ok(updated)
    }

    async fn hash_get(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError> {
        Ok(self.hashes.lock().await.get(key).cloned())
    }

    async fn hash_set(&self, key: &str, fields: HashMap<String, String>) -> Result<(), StoreError> {
        self.hashes
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .extend(fields);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values.lock().await.remove(key);
        self.hashes.lock().await.remove(key);
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, _ttl: Duration) -> Result<LockGuard, StoreError> {
        let lock = self.lock_for(name).await;
        let guard = lock
            .try_lock_owned()
            .map_err(|_| StoreError::LockUnavailable(name.to_string()))?;
        Ok(LockGuard {
            _inner: LockGuardInner::InMemory(guard),
        })
    }
}

/// Redis-backed `CoordinationStore`.
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn connect(uri: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(uri).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.get(key)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.set(key, value)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(
            r#"
            local current = redis.call("get", KEYS[1])
            if current == ARGV[1] or (current == false and ARGV[1] == "") then
                redis.call("set", KEYS[1], ARGV[2])
                return 1
            else
                return 0
            end
            "#,
        );
        let result: i32 = script
            .key(key)
            .arg(expected.unwrap_or(""))
            .arg(new)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(result == 1)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        conn.incr(key, delta)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn hash_get(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    async fn hash_set(&self, key: &str, fields: HashMap<String, String>) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        conn.hset_multiple(key, &pairs)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.del(key)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<LockGuard, StoreError> {
        let mut conn = self.conn().await?;
        let token = uuid::Uuid::new_v4().to_string();
        let acquired: bool = redis::cmd("SET")
            .arg(name)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as i64)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .is_some();

        if !acquired {
            return Err(StoreError::LockUnavailable(name.to_string()));
        }

        Ok(LockGuard {
            _inner: LockGuardInner::Redis {
                client: self.client.clone(),
                key: name.to_string(),
                token,
            },
        })
    }
}
