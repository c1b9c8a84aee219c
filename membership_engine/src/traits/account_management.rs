use thiserror::Error;

use crate::{
    db_types::{MonthlyStats, Order, OutTradeNo, StatsType, User},
    traits::data_objects::{OrderPage, OrderQueryFilter},
};

#[derive(Debug, Clone, Error)]
pub enum AccountApiError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("User error constructing query: {0}")]
    QueryError(String),
}

impl From<sqlx::Error> for AccountApiError {
    fn from(e: sqlx::Error) -> Self {
        AccountApiError::DatabaseError(e.to_string())
    }
}

/// The `AccountManagement` trait defines the read-only queries over users and their orders.
///
/// The [`PaymentGatewayDatabase`](crate::traits::PaymentGatewayDatabase) trait handles the state transitions;
/// `AccountManagement` never locks or mutates anything.
#[allow(async_fn_in_trait)]
pub trait AccountManagement {
    /// Fetches the user with the given id. If no such user exists, `None` is returned.
    async fn fetch_user(&self, user_id: i64) -> Result<Option<User>, AccountApiError>;

    async fn fetch_order_by_id(&self, id: i64) -> Result<Option<Order>, AccountApiError>;

    async fn fetch_order_by_out_trade_no(&self, out_trade_no: &OutTradeNo) -> Result<Option<Order>, AccountApiError>;

    /// Fetches the orders matching the filter, newest first, together with the total number of matches (ignoring
    /// pagination).
    async fn search_orders(&self, query: OrderQueryFilter) -> Result<OrderPage, AccountApiError>;

    /// Counts orders or users per calendar month of creation.
    async fn monthly_counts(&self, stats_type: StatsType) -> Result<MonthlyStats, AccountApiError>;
}
