//! Cancels orders that were never paid.
//!
//! Expiry has two halves. The sweep ([`ExpiryApi::expire_stale_orders`]) runs on a schedule, finds stale `Pending`
//! orders a page at a time, announces each page on the expiry queue and marks the page `Expired`. The consumer
//! ([`ExpiryApi::consume`]) drains the queue and re-applies the same update. Both halves only ever touch orders that
//! are still `Pending`, so they commute with each other and with settlement.
use std::{fmt::Debug, time::Duration};

use chrono::{DateTime, Utc};
use log::*;

use crate::{
    events::{EventProducers, OrdersExpiredEvent},
    queue::{Acknowledgement, MessageQueue, QueueDelivery, QueueError, QueueSubscription, EXPIRED_ORDERS_QUEUE},
    traits::{ExpiryPublisher, PaymentGatewayDatabase, PaymentGatewayError},
};

pub const DEFAULT_UNPAID_ORDER_TIMEOUT_HOURS: i64 = 24;
pub const DEFAULT_EXPIRY_PAGE_SIZE: i64 = 100;
/// Pause before handing a failed batch back to the broker, so that a database outage does not become a hot loop.
const REQUEUE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpirySweepReport {
    /// The ids of every order expired in this tick, in the order they were expired.
    pub expired: Vec<i64>,
    /// The number of pages that were committed.
    pub pages: usize,
    /// Set if the tick stopped early. The uncommitted page stays `Pending` and is retried on the next tick.
    pub aborted: Option<String>,
}

#[derive(Clone)]
pub struct ExpiryApi<B> {
    db: B,
    unpaid_timeout: chrono::Duration,
    page_size: i64,
    producers: EventProducers,
}

impl<B> Debug for ExpiryApi<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExpiryApi (timeout: {}, page size: {})", self.unpaid_timeout, self.page_size)
    }
}

impl<B> ExpiryApi<B>
where B: PaymentGatewayDatabase
{
    pub fn new(db: B, producers: EventProducers) -> Self {
        Self {
            db,
            unpaid_timeout: chrono::Duration::hours(DEFAULT_UNPAID_ORDER_TIMEOUT_HOURS),
            page_size: DEFAULT_EXPIRY_PAGE_SIZE,
            producers,
        }
    }

    /// How long an order may stay unpaid before the sweep cancels it.
    pub fn with_unpaid_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.unpaid_timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn unpaid_timeout(&self) -> chrono::Duration {
        self.unpaid_timeout
    }

    /// Runs one sweep tick. Every `Pending` order created strictly before `now - unpaid_timeout` is expired, one page
    /// (and one transaction) at a time. Each page is handed to `publisher` before it is committed.
    ///
    /// This never fails. Errors end the tick early and are recorded in [`ExpirySweepReport::aborted`].
    pub async fn expire_stale_orders<P: ExpiryPublisher>(&self, now: DateTime<Utc>, publisher: &P) -> ExpirySweepReport {
        let cutoff = now - self.unpaid_timeout;
        debug!("🕰️ Expiry sweep started. Cutoff is {cutoff}");
        let mut report = ExpirySweepReport::default();
        let mut last_id = 0;
        loop {
            match self.db.expire_stale_page(cutoff, last_id, self.page_size, publisher).await {
                Ok(ids) if ids.is_empty() => break,
                Ok(ids) => {
                    last_id = ids.iter().copied().max().unwrap_or(last_id);
                    report.pages += 1;
                    debug!("🕰️ Expired page {} ({} orders, up to id {last_id})", report.pages, ids.len());
                    for emitter in &self.producers.orders_expired_producer {
                        emitter.publish_event(OrdersExpiredEvent::new(ids.clone()));
                    }
                    report.expired.extend(ids);
                },
                Err(e) => {
                    error!("🕰️ Expiry sweep aborted after {} pages. The current page will be retried: {e}", report.pages);
                    report.aborted = Some(e.to_string());
                    break;
                },
            }
        }
        info!("🕰️ Expiry sweep complete. {} orders expired in {} pages", report.expired.len(), report.pages);
        report
    }

    /// Marks the given orders as `Expired` if they are still `Pending`. Returns the number of orders that changed.
    pub async fn apply_expiry_batch(&self, ids: &[i64]) -> Result<u64, PaymentGatewayError> {
        let changed = self.db.expire_orders(ids, Utc::now()).await?;
        trace!("🕰️ Expiry batch of {} orders applied. {changed} changed", ids.len());
        Ok(changed)
    }

    /// Decides what to do with one message from the expiry queue.
    ///
    /// * A payload that is not a JSON array of order ids can never succeed, and is dropped.
    /// * A database failure is transient, and the message is requeued.
    pub async fn handle_expiry_message(&self, payload: &[u8]) -> Acknowledgement {
        let ids = match serde_json::from_slice::<Vec<i64>>(payload) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("🕰️ Discarding malformed expiry message ({} bytes): {e}", payload.len());
                return Acknowledgement::Nack { requeue: false };
            },
        };
        match self.apply_expiry_batch(&ids).await {
            Ok(_) => Acknowledgement::Ack,
            Err(e) => {
                error!("🕰️ Could not apply expiry batch of {} orders. It will be redelivered: {e}", ids.len());
                Acknowledgement::Nack { requeue: true }
            },
        }
    }

    /// Consumes the expiry queue until the subscription ends. Returns the number of messages handled.
    ///
    /// Messages are handled one at a time and settled with the result of [`Self::handle_expiry_message`].
    pub async fn consume<Q: MessageQueue>(&self, queue: &Q, consumer_tag: &str) -> Result<u64, QueueError> {
        let mut subscription = queue.subscribe(EXPIRED_ORDERS_QUEUE, consumer_tag).await?;
        info!("🕰️ Expiry consumer {consumer_tag} started");
        let mut handled = 0;
        while let Some(delivery) = subscription.next_delivery().await {
            let delivery = delivery?;
            if delivery.redelivered() {
                debug!("🕰️ Handling a redelivered expiry message");
            }
            let ack = self.handle_expiry_message(delivery.payload()).await;
            if matches!(ack, Acknowledgement::Nack { requeue: true }) {
                tokio::time::sleep(REQUEUE_DELAY).await;
            }
            delivery.settle(ack).await?;
            handled += 1;
        }
        info!("🕰️ Expiry consumer {consumer_tag} stopped after {handled} messages");
        Ok(handled)
    }
}
