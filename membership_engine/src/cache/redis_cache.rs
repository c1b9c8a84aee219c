use log::*;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};

use super::{CacheError, KeyValueCache};

/// A Redis-backed cache. The multiplexed connection is cheap to clone and safe to share between tasks.
#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            CacheError::ConnectionError(e.to_string())
        } else {
            CacheError::CommandError(e.to_string())
        }
    }
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(|e| CacheError::ConnectionError(e.to_string()))?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("📊️ Connected to Redis cache");
        Ok(Self { conn })
    }
}

impl KeyValueCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let stored: bool = conn.set_nx(key, value).await?;
        Ok(stored)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}
