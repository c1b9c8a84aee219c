//! # Message queue bridge
//!
//! Durable, named, point-to-point queues with at-least-once delivery. Consumers must be idempotent.
//!
//! * [`MessageQueue`] declares queues, publishes persistent messages and opens subscriptions.
//! * [`QueueSubscription`] yields deliveries one at a time.
//! * [`QueueDelivery`] is settled explicitly with an [`Acknowledgement`]: `Ack` removes the message, `Nack` either
//!   requeues it for redelivery or discards it.
//!
//! [`AmqpQueue`] talks to RabbitMQ (or any AMQP 0.9.1 broker). [`MemoryQueue`] keeps everything in-process and is
//! used in tests and when no broker is configured.
mod amqp;
mod memory;

pub use amqp::{AmqpConfig, AmqpDelivery, AmqpQueue, AmqpSubscription, LinkStatus};
pub use memory::{MemoryDelivery, MemoryQueue, MemorySubscription};
use thiserror::Error;

use crate::traits::{ExpiryPublisher, PaymentGatewayError};

/// Carries batches of expired order ids (as a JSON array) from the expiry sweep to the expiry consumer.
pub const EXPIRED_ORDERS_QUEUE: &str = "expired_orders_queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Nack { requeue: bool },
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("Could not connect to the message broker after {attempts} attempts. Last error: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
    #[error("Message broker error: {0}")]
    ConnectionError(String),
    #[error("Could not declare queue {queue}: {reason}")]
    DeclareError { queue: String, reason: String },
    #[error("Could not publish to queue {queue}: {reason}")]
    PublishError { queue: String, reason: String },
    #[error("Could not consume from queue {queue}: {reason}")]
    ConsumeError { queue: String, reason: String },
    #[error("Could not settle delivery: {0}")]
    AcknowledgementError(String),
}

#[allow(async_fn_in_trait)]
pub trait MessageQueue: Clone {
    type Subscription: QueueSubscription;

    /// Declares a durable queue. Declaring a queue that already exists is a no-op.
    async fn declare(&self, queue: &str) -> Result<(), QueueError>;

    /// Publishes a persistent message to the queue, declaring the queue first if necessary.
    ///
    /// Transport failures are errors. A message that the broker refuses to confirm is logged as a warning but is not
    /// an error.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError>;

    /// Starts consuming from the queue with manual acknowledgement, one unacknowledged message at a time.
    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<Self::Subscription, QueueError>;

    /// True once the queue has been shut down deliberately. A subscription that ends while this is false was dropped
    /// by the broker, and the consumer should subscribe again.
    fn is_closed(&self) -> bool;
}

#[allow(async_fn_in_trait)]
pub trait QueueSubscription {
    type Delivery: QueueDelivery;

    /// Waits for the next message. `None` means the subscription has ended, either because the queue was closed or
    /// because the broker cancelled the consumer. [`MessageQueue::is_closed`] tells the two apart.
    async fn next_delivery(&mut self) -> Option<Result<Self::Delivery, QueueError>>;
}

#[allow(async_fn_in_trait)]
pub trait QueueDelivery {
    fn payload(&self) -> &[u8];

    /// True if this message has been delivered before and was not acknowledged.
    fn redelivered(&self) -> bool;

    async fn settle(self, ack: Acknowledgement) -> Result<(), QueueError>;
}

/// Publishes the expiry sweep's batches to [`EXPIRED_ORDERS_QUEUE`].
#[derive(Clone)]
pub struct ExpiredOrdersPublisher<Q> {
    queue: Q,
}

impl<Q: MessageQueue> ExpiredOrdersPublisher<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue }
    }
}

impl<Q: MessageQueue> ExpiryPublisher for ExpiredOrdersPublisher<Q> {
    async fn prepare(&self) -> Result<(), PaymentGatewayError> {
        self.queue.declare(EXPIRED_ORDERS_QUEUE).await.map_err(|e| PaymentGatewayError::PublishError(e.to_string()))
    }

    async fn publish_expired(&self, ids: &[i64]) -> Result<(), PaymentGatewayError> {
        let payload = serde_json::to_vec(ids).map_err(|e| PaymentGatewayError::PublishError(e.to_string()))?;
        self.queue
            .publish(EXPIRED_ORDERS_QUEUE, &payload)
            .await
            .map_err(|e| PaymentGatewayError::PublishError(e.to_string()))
    }
}
