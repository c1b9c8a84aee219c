use std::{
    collections::HashSet,
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    Consumer,
};
use log::*;
use mpg_common::Secret;
use tokio::sync::Mutex;

use super::{Acknowledgement, MessageQueue, QueueDelivery, QueueError, QueueSubscription};

const PERSISTENT: u8 = 2;

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub url: Secret<String>,
    /// How many times to try to connect before giving up
    pub retry_attempts: u32,
    /// The pause between two connection attempts
    pub retry_delay: Duration,
}

impl AmqpConfig {
    pub fn new(url: &str) -> Self {
        Self { url: Secret::new(url.to_string()), retry_attempts: 5, retry_delay: Duration::from_secs(5) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkStatus::Disconnected => write!(f, "disconnected"),
            LinkStatus::Connecting => write!(f, "connecting"),
            LinkStatus::Connected => write!(f, "connected"),
        }
    }
}

enum LinkState {
    Disconnected,
    Connecting,
    Connected { connection: Connection, channel: Channel, declared: HashSet<String> },
}

impl LinkState {
    fn status(&self) -> LinkStatus {
        match self {
            LinkState::Disconnected => LinkStatus::Disconnected,
            LinkState::Connecting => LinkStatus::Connecting,
            LinkState::Connected { .. } => LinkStatus::Connected,
        }
    }
}

struct AmqpLink {
    config: AmqpConfig,
    state: Mutex<LinkState>,
    /// Set from the connection's error callback. The next operation reconnects.
    broken: Arc<AtomicBool>,
    /// Set by [`AmqpQueue::close`]. Consumers stop instead of resubscribing.
    closed: AtomicBool,
}

/// A RabbitMQ-backed [`MessageQueue`].
///
/// The connection and its publishing channel are shared by every clone of this value and move through the states
/// `Disconnected -> Connecting -> Connected -> Disconnected`. A lost connection is re-established lazily on the next
/// operation, with the same bounded retry policy as the initial connection.
#[derive(Clone)]
pub struct AmqpQueue {
    link: Arc<AmqpLink>,
}

impl AmqpQueue {
    /// Connects to the broker, retrying `config.retry_attempts` times. Fails with [`QueueError::RetriesExhausted`]
    /// if the broker cannot be reached.
    pub async fn connect(config: AmqpConfig) -> Result<Self, QueueError> {
        let link = AmqpLink {
            config,
            state: Mutex::new(LinkState::Disconnected),
            broken: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        };
        let queue = Self { link: Arc::new(link) };
        let mut state = queue.link.state.lock().await;
        queue.ensure_connected(&mut state).await?;
        drop(state);
        Ok(queue)
    }

    pub async fn status(&self) -> LinkStatus {
        self.link.state.lock().await.status()
    }

    /// Closes the connection and marks the queue as shut down, so that consumers stop rather than resubscribe. A later
    /// publish will still reconnect.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.link.closed.store(true, Ordering::SeqCst);
        let mut state = self.link.state.lock().await;
        if let LinkState::Connected { connection, .. } = std::mem::replace(&mut *state, LinkState::Disconnected) {
            connection.close(200, "Closing").await.map_err(|e| QueueError::ConnectionError(e.to_string()))?;
            info!("📬️ AMQP connection closed");
        }
        Ok(())
    }

    fn is_healthy(&self, connection: &Connection, channel: &Channel) -> bool {
        !self.link.broken.load(Ordering::SeqCst) && connection.status().connected() && channel.status().connected()
    }

    /// Makes sure that `state` is `Connected`, reconnecting if the link has dropped.
    async fn ensure_connected(&self, state: &mut LinkState) -> Result<(), QueueError> {
        if let LinkState::Connected { connection, channel, .. } = state {
            if self.is_healthy(connection, channel) {
                return Ok(());
            }
            warn!("📬️ AMQP link has been lost. Reconnecting.");
        }
        *state = LinkState::Connecting;
        match self.connect_with_retry().await {
            Ok((connection, channel)) => {
                *state = LinkState::Connected { connection, channel, declared: HashSet::new() };
                Ok(())
            },
            Err(e) => {
                *state = LinkState::Disconnected;
                Err(e)
            },
        }
    }

    async fn connect_with_retry(&self) -> Result<(Connection, Channel), QueueError> {
        let attempts = self.link.config.retry_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.try_connect().await {
                Ok(link) => {
                    info!("📬️ Connected to the message broker (attempt {attempt}/{attempts})");
                    return Ok(link);
                },
                Err(e) => {
                    warn!("📬️ Connection attempt {attempt}/{attempts} to the message broker failed: {e}");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.link.config.retry_delay).await;
                    }
                },
            }
        }
        error!("📬️ Giving up on the message broker after {attempts} attempts");
        Err(QueueError::RetriesExhausted { attempts, reason: last_error })
    }

    async fn try_connect(&self) -> Result<(Connection, Channel), lapin::Error> {
        let connection =
            Connection::connect(self.link.config.url.reveal(), ConnectionProperties::default()).await?;
        let broken = Arc::clone(&self.link.broken);
        connection.on_error(move |e| {
            warn!("📬️ AMQP connection error: {e}");
            broken.store(true, Ordering::SeqCst);
        });
        let channel = connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        self.link.broken.store(false, Ordering::SeqCst);
        Ok((connection, channel))
    }

    /// Returns a healthy publishing channel on which `queue` has been declared.
    async fn channel_for(&self, queue: &str) -> Result<Channel, QueueError> {
        let mut state = self.link.state.lock().await;
        self.ensure_connected(&mut state).await?;
        match &mut *state {
            LinkState::Connected { channel, declared, .. } => {
                if !declared.contains(queue) {
                    declare_durable(channel, queue).await?;
                    declared.insert(queue.to_string());
                }
                Ok(channel.clone())
            },
            _ => Err(QueueError::ConnectionError("The AMQP link is not connected".into())),
        }
    }

    fn mark_broken(&self) {
        self.link.broken.store(true, Ordering::SeqCst);
    }
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<(), QueueError> {
    let options = QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() };
    channel
        .queue_declare(queue, options, FieldTable::default())
        .await
        .map_err(|e| QueueError::DeclareError { queue: queue.to_string(), reason: e.to_string() })?;
    trace!("📬️ Queue {queue} declared");
    Ok(())
}

impl MessageQueue for AmqpQueue {
    type Subscription = AmqpSubscription;

    async fn declare(&self, queue: &str) -> Result<(), QueueError> {
        self.channel_for(queue).await.map(|_| ())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        let channel = self.channel_for(queue).await?;
        let properties = BasicProperties::default().with_delivery_mode(PERSISTENT);
        let confirm =
            channel.basic_publish("", queue, BasicPublishOptions::default(), payload, properties).await.map_err(|e| {
                self.mark_broken();
                QueueError::PublishError { queue: queue.to_string(), reason: e.to_string() }
            })?;
        match confirm.await {
            Ok(Confirmation::Ack(_)) => trace!("📬️ Broker confirmed message on {queue}"),
            Ok(other) => warn!("📬️ Broker did not confirm the message on {queue}: {other:?}"),
            Err(e) => warn!("📬️ Could not confirm the message on {queue}: {e}"),
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<AmqpSubscription, QueueError> {
        let consume_error = |e: lapin::Error| QueueError::ConsumeError { queue: queue.to_string(), reason: e.to_string() };
        let mut state = self.link.state.lock().await;
        self.ensure_connected(&mut state).await?;
        let LinkState::Connected { connection, .. } = &*state else {
            return Err(QueueError::ConnectionError("The AMQP link is not connected".into()));
        };
        // Consumers get their own channel, so that the prefetch limit does not affect publishing.
        let channel = connection.create_channel().await.map_err(consume_error)?;
        drop(state);
        declare_durable(&channel, queue).await?;
        channel.basic_qos(1, BasicQosOptions::default()).await.map_err(consume_error)?;
        let consumer = channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(consume_error)?;
        info!("📬️ Consumer {consumer_tag} subscribed to {queue}");
        Ok(AmqpSubscription { queue: queue.to_string(), consumer })
    }

    fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }
}

pub struct AmqpSubscription {
    queue: String,
    consumer: Consumer,
}

impl QueueSubscription for AmqpSubscription {
    type Delivery = AmqpDelivery;

    async fn next_delivery(&mut self) -> Option<Result<AmqpDelivery, QueueError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(AmqpDelivery)
                .map_err(|e| QueueError::ConsumeError { queue: self.queue.clone(), reason: e.to_string() }),
        )
    }
}

pub struct AmqpDelivery(Delivery);

impl QueueDelivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.0.data
    }

    fn redelivered(&self) -> bool {
        self.0.redelivered
    }

    async fn settle(self, ack: Acknowledgement) -> Result<(), QueueError> {
        let result = match ack {
            Acknowledgement::Ack => self.0.ack(BasicAckOptions::default()).await,
            Acknowledgement::Nack { requeue } => {
                self.0.nack(BasicNackOptions { requeue, ..BasicNackOptions::default() }).await
            },
        };
        result.map_err(|e| QueueError::AcknowledgementError(e.to_string()))
    }
}
