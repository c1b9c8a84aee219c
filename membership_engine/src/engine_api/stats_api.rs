//! Monthly order and user statistics, served through the key/value cache.
//!
//! Aggregates are cached without expiry under `stats_data_<type>`. Whoever changes the underlying counts must call
//! [`StatsApi::invalidate`] afterwards. Cache failures never fail a request: a broken cache degrades to querying the
//! database every time.
use std::fmt::Debug;

use log::*;

use crate::{
    cache::KeyValueCache,
    db_types::{MonthlyStats, StatsType},
    traits::{AccountManagement, PaymentGatewayError},
};

#[derive(Clone)]
pub struct StatsApi<B, C> {
    db: B,
    cache: C,
}

impl<B, C> Debug for StatsApi<B, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StatsApi")
    }
}

impl<B, C> StatsApi<B, C>
where
    B: AccountManagement,
    C: KeyValueCache,
{
    pub fn new(db: B, cache: C) -> Self {
        Self { db, cache }
    }

    /// Returns the cached aggregate if there is one. Otherwise, computes it, caches it and returns it.
    pub async fn get_aggregate(&self, stats_type: StatsType) -> Result<MonthlyStats, PaymentGatewayError> {
        let key = stats_type.cache_key();
        match self.cache.get(&key).await {
            Ok(Some(json)) => match serde_json::from_str::<MonthlyStats>(&json) {
                Ok(stats) => {
                    trace!("📊️ Cache hit for {key}");
                    return Ok(stats);
                },
                Err(e) => {
                    warn!("📊️ Discarding corrupt cache entry {key}: {e}");
                    self.invalidate(stats_type).await;
                },
            },
            Ok(None) => trace!("📊️ Cache miss for {key}"),
            Err(e) => warn!("📊️ Could not read {key} from the cache: {e}"),
        }
        self.compute_and_store(stats_type, false).await
    }

    /// Removes the cached aggregate. Failures are logged, since the caller's change has already been committed.
    pub async fn invalidate(&self, stats_type: StatsType) {
        let key = stats_type.cache_key();
        match self.cache.delete(&key).await {
            Ok(()) => debug!("📊️ Invalidated {key}"),
            Err(e) => error!("📊️ Could not invalidate {key}. Statistics may be stale until it is removed: {e}"),
        }
    }

    /// Invalidates and then recomputes the aggregate, leaving a fresh value in the cache.
    pub async fn refresh(&self, stats_type: StatsType) -> Result<MonthlyStats, PaymentGatewayError> {
        self.invalidate(stats_type).await;
        self.compute_and_store(stats_type, true).await
    }

    /// A cache miss stores its result only if the key is still empty, so a reader that counted before a change
    /// committed cannot overwrite the value written by a later [`Self::refresh`]. If no refresh follows the change,
    /// such a reader can still leave a stale entry behind until the next invalidation.
    async fn compute_and_store(
        &self,
        stats_type: StatsType,
        overwrite: bool,
    ) -> Result<MonthlyStats, PaymentGatewayError> {
        let stats = self.db.monthly_counts(stats_type).await?;
        let key = stats_type.cache_key();
        match serde_json::to_string(&stats) {
            Ok(json) => {
                let stored = if overwrite {
                    self.cache.set(&key, &json).await.map(|_| true)
                } else {
                    self.cache.set_if_absent(&key, &json).await
                };
                match stored {
                    Ok(true) => trace!("📊️ Cached {key}"),
                    Ok(false) => debug!("📊️ {key} was refreshed while it was being computed. Keeping the newer value."),
                    Err(e) => warn!("📊️ Could not write {key} to the cache: {e}"),
                }
            },
            Err(e) => warn!("📊️ Could not serialize {key}: {e}"),
        }
        Ok(stats)
    }
}
