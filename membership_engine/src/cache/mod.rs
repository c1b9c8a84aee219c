//! # Key/value cache
//!
//! A minimal string key/value cache used for the monthly statistics (`stats_data_<type>`) and the membership catalog
//! (`membership:<id>`). Entries never expire on their own; they are removed by explicit deletes when the underlying
//! data changes.
//!
//! Two backends are provided: [`RedisCache`] for deployments, and [`MemoryCache`] for tests and single-process
//! setups. [`CacheBackend`] picks one at runtime.
mod memory;
mod redis_cache;

use log::*;
pub use memory::MemoryCache;
pub use redis_cache::RedisCache;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Could not connect to the cache: {0}")]
    ConnectionError(String),
    #[error("Cache command failed: {0}")]
    CommandError(String),
}

#[allow(async_fn_in_trait)]
pub trait KeyValueCache: Clone {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;

    /// Stores the value only if the key is not present. Returns whether the value was stored.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, CacheError>;

    /// Removes the key. Deleting a key that does not exist is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub enum CacheBackend {
    Memory(MemoryCache),
    Redis(RedisCache),
}

impl CacheBackend {
    /// Connects to Redis if a URL is given, and falls back to an in-process cache otherwise.
    pub async fn from_url(url: Option<&str>) -> Result<Self, CacheError> {
        match url {
            Some(url) => Ok(Self::Redis(RedisCache::connect(url).await?)),
            None => {
                warn!("📊️ No Redis URL configured. Using an in-memory cache, which is not shared between processes.");
                Ok(Self::Memory(MemoryCache::default()))
            },
        }
    }
}

impl KeyValueCache for CacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self {
            Self::Memory(c) => c.get(key).await,
            Self::Redis(c) => c.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        match self {
            Self::Memory(c) => c.set(key, value).await,
            Self::Redis(c) => c.set(key, value).await,
        }
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        match self {
            Self::Memory(c) => c.set_if_absent(key, value).await,
            Self::Redis(c) => c.set_if_absent(key, value).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self {
            Self::Memory(c) => c.delete(key).await,
            Self::Redis(c) => c.delete(key).await,
        }
    }
}
