//! The counter primitive backing the quota ledger.
//!
//! The store knows nothing about time buckets or limits; it is a key-value
//! map of named integers with per-key atomicity and expiry. Two backends:
//! Redis for multi-process deployments, an in-process DashMap for tests and
//! single-node runs. A store failure must surface as `StoreUnavailable` so
//! callers fail closed rather than treating the error as available quota.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use crate::error::{Error, ErrorDetails};

/// Atomic counter contract.
///
/// The expiry passed to the increment operations is applied only when the
/// increment created the key, so a counter's lifetime is fixed at the moment
/// its bucket first sees traffic. `expire` re-applies an expiry to a key that
/// may have been created by a different caller.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment by one, creating at 1 with `ttl` if absent. Returns the
    /// post-increment value.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, Error>;

    /// Increment by `amount`, creating at `amount` with `ttl` if absent.
    /// Returns the post-increment value.
    async fn increment_by(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64, Error>;

    /// Current value; zero if the key is absent or expired.
    async fn get(&self, key: &str) -> Result<u64, Error>;

    /// (Re)apply an expiry to an existing key. No-op if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Error>;
}

fn store_error(source: impl std::fmt::Display) -> Error {
    Error::new(ErrorDetails::StoreUnavailable {
        message: source.to_string(),
    })
}

/// Redis-backed counter store.
///
/// INCRBY and the conditional EXPIRE run as a single Lua script so the
/// expiry-on-creation rule cannot race with a concurrent increment on the
/// same key.
pub struct RedisCounterStore {
    conn: MultiplexedConnection,
    increment_script: Script,
}

impl RedisCounterStore {
    pub async fn new(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to Redis: {e}");
                store_error(e)
            })?;

        let increment_script = Script::new(
            r#"
            local value = redis.call('INCRBY', KEYS[1], ARGV[1])
            if value == tonumber(ARGV[1]) then
                redis.call('EXPIRE', KEYS[1], ARGV[2])
            end
            return value
            "#,
        );

        Ok(Self {
            conn,
            increment_script,
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, Error> {
        self.increment_by(key, 1, ttl).await
    }

    async fn increment_by(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        self.increment_script
            .key(key)
            .arg(amount)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn get(&self, key: &str) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn.get(key).await.map_err(store_error)?;
        Ok(value.unwrap_or(0))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: bool = conn
            .expire(key, ttl.as_secs() as i64)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct CounterCell {
    value: u64,
    expires_at: Instant,
}

/// In-process counter store with the same atomicity and expiry semantics as
/// the Redis backend. Expired cells are treated as absent and reaped lazily.
#[derive(Default)]
pub struct InMemoryCounterStore {
    cells: DashMap<String, CounterCell>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, Error> {
        self.increment_by(key, 1, ttl).await
    }

    async fn increment_by(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64, Error> {
        let now = Instant::now();
        // The entry guard holds the shard lock, which is what makes the
        // read-modify-write atomic per key.
        let value = match self.cells.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(CounterCell {
                        value: amount,
                        expires_at: now + ttl,
                    });
                } else {
                    occupied.get_mut().value += amount;
                }
                occupied.get().value
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CounterCell {
                    value: amount,
                    expires_at: now + ttl,
                });
                amount
            }
        };
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<u64, Error> {
        let now = Instant::now();
        // Copy the cell out before reaping: remove_if on a shard whose guard
        // is still held would deadlock.
        let cell = self.cells.get(key).map(|entry| *entry);
        match cell {
            Some(cell) if cell.expires_at > now => Ok(cell.value),
            Some(_) => {
                self.cells.remove_if(key, |_, cell| cell.expires_at <= now);
                Ok(0)
            }
            None => Ok(0),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        if let Some(mut cell) = self.cells.get_mut(key) {
            cell.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }
}

/// Store that fails every operation, for exercising fail-closed paths.
#[cfg(test)]
pub struct FailingCounterStore;

#[cfg(test)]
#[async_trait]
impl CounterStore for FailingCounterStore {
    async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, Error> {
        Err(store_error("connection refused"))
    }

    async fn increment_by(&self, _key: &str, _amount: u64, _ttl: Duration) -> Result<u64, Error> {
        Err(store_error("connection refused"))
    }

    async fn get(&self, _key: &str) -> Result<u64, Error> {
        Err(store_error("connection refused"))
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), Error> {
        Err(store_error("connection refused"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_increment_creates_at_one() {
        let store = InMemoryCounterStore::new();

        assert_eq!(store.increment("k", TTL).await.unwrap(), 1);
        assert_eq!(store.increment("k", TTL).await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_increment_by_creates_at_amount() {
        let store = InMemoryCounterStore::new();

        assert_eq!(store.increment_by("k", 87, TTL).await.unwrap(), 87);
        assert_eq!(store.increment_by("k", 13, TTL).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_get_absent_key_is_zero() {
        let store = InMemoryCounterStore::new();
        assert_eq!(store.get("never-written").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_key_reads_zero_and_recreates_fresh() {
        let store = InMemoryCounterStore::new();
        let short = Duration::from_millis(50);

        store.increment_by("k", 5, short).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), 5);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.get("k").await.unwrap(), 0);

        // A new increment is a fresh creation, not a resurrection
        assert_eq!(store.increment("k", TTL).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expiry_is_set_only_on_creation() {
        let store = InMemoryCounterStore::new();
        let short = Duration::from_millis(150);

        store.increment("k", short).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // This increment must not extend the original expiry
        store.increment("k", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(store.get("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expire_reapplies_lifetime() {
        let store = InMemoryCounterStore::new();

        store.increment("k", Duration::from_millis(50)).await.unwrap();
        store.expire("k", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(store.get("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_on_absent_key_is_a_noop() {
        let store = InMemoryCounterStore::new();
        store.expire("missing", TTL).await.unwrap();
        assert_eq!(store.get("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments_lose_no_updates() {
        let store = Arc::new(InMemoryCounterStore::new());

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for _ in 0..20 {
                        store.increment("shared", TTL).await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.get("shared").await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_failing_store_reports_store_unavailable() {
        let store = FailingCounterStore;
        let err = store.get("k").await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::StoreUnavailable { .. }
        ));
    }
}
