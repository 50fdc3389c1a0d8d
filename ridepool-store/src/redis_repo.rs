use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use ridepool_core::repository::FastStore;
use ridepool_core::{CoreError, CoreResult};
use tracing::info;

const COMPARE_AND_DELETE: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

const COMPARE_AND_PEXPIRE: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("PEXPIRE", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

const SCAN_BATCH: usize = 200;

#[derive(Clone)]
pub struct RedisClient {
    conn: MultiplexedConnection,
    compare_and_delete: redis::Script,
    compare_and_pexpire: redis::Script,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis");

        Ok(Self {
            conn,
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
            compare_and_pexpire: redis::Script::new(COMPARE_AND_PEXPIRE),
        })
    }
}

fn fast_err(e: redis::RedisError) -> CoreError {
    CoreError::FastStore(e.to_string())
}

// PX rejects zero.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl FastStore for RedisClient {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool> {
        let mut conn = self.conn.clone();

        // SET NX PX: only set if key does not exist
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(fast_err)?;

        Ok(result.is_some())
    }

    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(fast_err)?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> CoreResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(fast_err)?;
        Ok(values)
    }

    async fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> CoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let millis = ttl_millis(ttl);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.cmd("SET").arg(key).arg(value).arg("PX").arg(millis).ignore();
        }

        let _: () = pipe.query_async(&mut conn).await.map_err(fast_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(fast_err)?;
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(fast_err)?;
        Ok(deleted == 1)
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .compare_and_pexpire
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(fast_err)?;
        Ok(updated == 1)
    }

    async fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);

        // SCAN may return a key more than once across iterations.
        let mut keys = BTreeSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(fast_err)?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        let keys: Vec<String> = keys.into_iter().collect();
        let values = self.get_many(&keys).await?;

        // Entries that expired between SCAN and MGET come back as nil.
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }

    async fn ping(&self) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(fast_err)?;
        Ok(())
    }
}
