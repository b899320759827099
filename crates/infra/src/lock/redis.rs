//! Redis lock backend (`SET NX PX` plus Lua compare scripts).

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{Client, Script};

use super::backend::{LockBackend, LockError};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

pub struct RedisLockBackend {
    connection: MultiplexedConnection,
    release: Script,
    extend: Script,
}

impl RedisLockBackend {
    pub async fn connect(redis_url: &str) -> Result<Self, LockError> {
        let client = Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::with_connection(connection))
    }

    pub fn with_connection(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        }
    }
}

#[async_trait::async_trait]
impl LockBackend for RedisLockBackend {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection.clone();
        let updated: i64 = self
            .extend
            .key(key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut conn = self.connection.clone();
        let token: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(token)
    }
}
