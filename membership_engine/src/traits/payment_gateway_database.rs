use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    db_types::{Membership, NewOrder, Order, OutTradeNo, Settlement, SettlementOutcome},
    traits::{AccountApiError, AccountManagement, ExpiryPublisher},
};

/// This trait defines the highest level of behaviour for backends supporting the membership payment engine.
///
/// This behaviour includes:
/// * Creating orders for catalog memberships.
/// * Settling orders when a payment provider confirms payment.
/// * Expiring orders that were never paid.
///
/// Every mutating method here is transactional. Implementations must serialise competing writers on the same order
/// (e.g. with a locking read) so that an order leaves the `Pending` state exactly once.
#[allow(async_fn_in_trait)]
pub trait PaymentGatewayDatabase: Clone + AccountManagement {
    /// The URL of the database
    fn url(&self) -> &str;

    /// Fetches the catalog entry for the given membership id, if it exists.
    async fn fetch_membership(&self, membership_id: i64) -> Result<Option<Membership>, PaymentGatewayError>;

    /// Stores a new `Pending` order and returns the stored record.
    async fn insert_order(&self, order: NewOrder) -> Result<Order, PaymentGatewayError>;

    /// Settles the order referenced by `settlement.out_trade_no`. In a single transaction that holds exclusive locks
    /// on the order and its owner:
    /// * If the order is not `Pending`, nothing is changed and [`SettlementOutcome::AlreadyFinal`] is returned.
    /// * Otherwise the order is marked `Paid` (together with its trade number, payment method and payment time), the
    ///   owner is promoted from Member to Premium if necessary, and the owner's membership is extended by the order's
    ///   number of months, starting from the later of their current expiry date and `now`.
    ///
    /// Calling this repeatedly, or concurrently, for the same order is safe.
    async fn settle_order(
        &self,
        settlement: &Settlement,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, PaymentGatewayError>;

    /// Expires one page of stale orders in its own transaction.
    ///
    /// Locks at most `limit` `Pending` orders created strictly before `cutoff` and with an id greater than `after_id`,
    /// passes their ids (ascending) to the `publisher`, and then marks those that are still `Pending` as `Expired`.
    /// [`ExpiryPublisher::prepare`] is called before the transaction starts. If publishing fails, or does not finish
    /// promptly, the transaction is rolled back and the error is returned.
    ///
    /// Returns the ids in the page. An empty result means there are no more stale orders.
    async fn expire_stale_page<P: ExpiryPublisher>(
        &self,
        cutoff: DateTime<Utc>,
        after_id: i64,
        limit: i64,
        publisher: &P,
    ) -> Result<Vec<i64>, PaymentGatewayError>;

    /// Marks the given orders as `Expired`, provided that they are still `Pending`. Returns the number of orders that
    /// changed. This is idempotent.
    async fn expire_orders(&self, ids: &[i64], now: DateTime<Utc>) -> Result<u64, PaymentGatewayError>;

    /// Closes the database connection pool.
    async fn close(&mut self) -> Result<(), PaymentGatewayError>;
}

#[derive(Debug, Clone, Error)]
pub enum PaymentGatewayError {
    #[error("We have an internal database engine (configuration/uptime etc.) : {0}")]
    DatabaseError(String),
    #[error("{0}")]
    AccountError(#[from] AccountApiError),
    #[error("The requested order {0} does not exist")]
    OrderNotFound(OutTradeNo),
    #[error("The requested order (internal id {0}) does not exist")]
    OrderIdNotFound(i64),
    #[error("User {0} does not exist")]
    UserNotFound(i64),
    #[error("Membership {0} does not exist")]
    MembershipNotFound(i64),
    #[error("Invalid stats type: {0}")]
    InvalidStatsType(String),
    #[error("Order {0} has already been paid or cancelled")]
    OrderNotPayable(OutTradeNo),
    #[error("Cannot extend the membership of user {user_id} by {months} months")]
    InvalidMembershipPeriod { user_id: i64, months: i64 },
    #[error("Could not publish expired orders: {0}")]
    PublishError(String),
}

impl From<sqlx::Error> for PaymentGatewayError {
    fn from(e: sqlx::Error) -> Self {
        PaymentGatewayError::DatabaseError(e.to_string())
    }
}
