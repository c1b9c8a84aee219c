use crate::traits::PaymentGatewayError;

/// A sink for the ids of orders that the expiry sweep is about to cancel.
///
/// The sweep calls [`Self::prepare`] before it opens a page transaction, and [`Self::publish_expired`] inside it,
/// before the orders are marked as `Expired`. Returning an error from either aborts (and rolls back) the page.
#[allow(async_fn_in_trait)]
pub trait ExpiryPublisher {
    /// Gets the sink ready to accept a page without delay, e.g. by (re)connecting to a broker. Slow or retrying work
    /// belongs here, since `publish_expired` runs while the database write lock is held and is cut short if it
    /// stalls.
    async fn prepare(&self) -> Result<(), PaymentGatewayError> {
        Ok(())
    }

    async fn publish_expired(&self, ids: &[i64]) -> Result<(), PaymentGatewayError>;
}
