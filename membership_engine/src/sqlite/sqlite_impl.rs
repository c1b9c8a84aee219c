//! `SqliteDatabase` is a concrete implementation of a membership engine backend.
//!
//! Unsurprisingly, it uses SQLite as the backend and implements all the traits defined in the [`traits`] module.
//!
//! ## Locking
//! SQLite does not support row locks. Every transaction that needs exclusive access starts with a no-op `UPDATE` of
//! the rows it is about to read, which takes the database-wide write lock. Competing writers wait on the busy timeout
//! until the holder commits or rolls back. The lock is therefore coarser than a row lock, but the serialisation
//! guarantees are the same.
//!
//! [`traits`]: crate::traits
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use log::*;
use sqlx::{migrate, SqlitePool};

use super::db::{db_url, memberships, new_pool, orders, stats, users, PUBLISH_TIMEOUT};
use crate::{
    db_types::{Membership, MonthlyStats, NewOrder, Order, OutTradeNo, Settlement, SettlementOutcome, StatsType, User},
    helpers::extend_membership,
    traits::{
        AccountApiError,
        AccountManagement,
        ExpiryPublisher,
        OrderPage,
        OrderQueryFilter,
        PaymentGatewayDatabase,
        PaymentGatewayError,
    },
};

#[derive(Clone)]
pub struct SqliteDatabase {
    url: String,
    pool: SqlitePool,
}

impl Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "SqliteDatabase ({:?})", self.pool)
    }
}

impl PaymentGatewayDatabase for SqliteDatabase {
    fn url(&self) -> &str {
        self.url.as_str()
    }

    async fn fetch_membership(&self, membership_id: i64) -> Result<Option<Membership>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        let membership = memberships::fetch_membership(membership_id, &mut conn).await?;
        Ok(membership)
    }

    async fn insert_order(&self, order: NewOrder) -> Result<Order, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        orders::insert_order(order, &mut conn).await
    }

    async fn settle_order(
        &self,
        settlement: &Settlement,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, PaymentGatewayError> {
        let mut tx = self.pool.begin().await?;
        let order = orders::lock_order_by_out_trade_no(&settlement.out_trade_no, &mut tx)
            .await?
            .ok_or_else(|| PaymentGatewayError::OrderNotFound(settlement.out_trade_no.clone()))?;
        if order.status.is_final() {
            debug!(
                "🗃️ Order {} is already {}. Settlement via {} is a no-op.",
                order.out_trade_no, order.status, settlement.payment_method
            );
            tx.rollback().await?;
            return Ok(SettlementOutcome::AlreadyFinal(order));
        }
        let order = orders::mark_paid(order.id, settlement, now, &mut tx)
            .await?
            .ok_or_else(|| PaymentGatewayError::OrderNotPayable(settlement.out_trade_no.clone()))?;
        let user = users::lock_user(order.user_id, &mut tx)
            .await?
            .ok_or(PaymentGatewayError::UserNotFound(order.user_id))?;
        let invalid_period =
            || PaymentGatewayError::InvalidMembershipPeriod { user_id: user.id, months: order.membership_months };
        let months = u32::try_from(order.membership_months).map_err(|_| invalid_period())?;
        let expires_at = extend_membership(user.membership_expired_at, now, months).ok_or_else(invalid_period)?;
        let user = users::apply_purchase(&user, expires_at, now, &mut tx).await?;
        tx.commit().await?;
        info!(
            "🗃️ Order {} paid via {} (trade {}). User #{} is {} until {}",
            order.out_trade_no, settlement.payment_method, settlement.trade_no, user.id, user.role, expires_at
        );
        Ok(SettlementOutcome::Settled { order, user })
    }

    async fn expire_stale_page<P: ExpiryPublisher>(
        &self,
        cutoff: DateTime<Utc>,
        after_id: i64,
        limit: i64,
        publisher: &P,
    ) -> Result<Vec<i64>, PaymentGatewayError> {
        // Reconnects (and their retry back-off) happen here, before the write lock is taken.
        publisher.prepare().await?;
        let mut tx = self.pool.begin().await?;
        let ids = orders::lock_stale_pending_orders(cutoff, after_id, limit, &mut tx).await?;
        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(ids);
        }
        // Dropping the transaction on a publish failure rolls it back.
        tokio::time::timeout(PUBLISH_TIMEOUT, publisher.publish_expired(&ids)).await.map_err(|_| {
            warn!("🗃️ Publishing {} expired orders took longer than {PUBLISH_TIMEOUT:?}. Releasing the lock.", ids.len());
            PaymentGatewayError::PublishError(format!("Timed out after {PUBLISH_TIMEOUT:?}"))
        })??;
        let expired = orders::expire_orders(&ids, Utc::now(), &mut tx).await?;
        tx.commit().await?;
        debug!("🗃️ Expired {expired} of {} locked orders", ids.len());
        Ok(ids)
    }

    async fn expire_orders(&self, ids: &[i64], now: DateTime<Utc>) -> Result<u64, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        let expired = orders::expire_orders(ids, now, &mut conn).await?;
        Ok(expired)
    }

    async fn close(&mut self) -> Result<(), PaymentGatewayError> {
        self.pool.close().await;
        Ok(())
    }
}

impl AccountManagement for SqliteDatabase {
    async fn fetch_user(&self, user_id: i64) -> Result<Option<User>, AccountApiError> {
        let mut conn = self.pool.acquire().await?;
        let user = users::fetch_user(user_id, &mut conn).await?;
        Ok(user)
    }

    async fn fetch_order_by_id(&self, id: i64) -> Result<Option<Order>, AccountApiError> {
        let mut conn = self.pool.acquire().await?;
        let order = orders::fetch_order_by_id(id, &mut conn).await?;
        Ok(order)
    }

    async fn fetch_order_by_out_trade_no(&self, out_trade_no: &OutTradeNo) -> Result<Option<Order>, AccountApiError> {
        let mut conn = self.pool.acquire().await?;
        let order = orders::fetch_order_by_out_trade_no(out_trade_no, &mut conn).await?;
        Ok(order)
    }

    async fn search_orders(&self, query: OrderQueryFilter) -> Result<OrderPage, AccountApiError> {
        let mut conn = self.pool.acquire().await?;
        let page = orders::search_orders(query, &mut conn).await?;
        Ok(page)
    }

    async fn monthly_counts(&self, stats_type: StatsType) -> Result<MonthlyStats, AccountApiError> {
        let mut conn = self.pool.acquire().await?;
        let result = stats::monthly_counts(stats_type, &mut conn).await?;
        Ok(result)
    }
}

impl SqliteDatabase {
    /// Creates a new database API object
    pub async fn new(max_connections: u32) -> Result<Self, sqlx::Error> {
        let url = db_url();
        SqliteDatabase::new_with_url(url.as_str(), max_connections).await
    }

    pub async fn new_with_url(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        trace!("Creating new database connection pool with url {url}");
        let pool = new_pool(url, max_connections).await?;
        let url = url.to_string();
        Ok(Self { url, pool })
    }

    /// Brings the schema up to date. Migrations are embedded in the binary.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        migrate!("./src/sqlite/migrations").run(&self.pool).await?;
        info!("🗃️ Database migrations complete");
        Ok(())
    }

    /// Returns a reference to the database connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
