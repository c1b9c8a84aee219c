use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
        Mutex,
        MutexGuard,
    },
};

use log::*;
use tokio::sync::Notify;

use super::{Acknowledgement, MessageQueue, QueueDelivery, QueueError, QueueSubscription};

struct StoredMessage {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct Queues {
    queues: Mutex<HashMap<String, VecDeque<StoredMessage>>>,
    notify: Notify,
    closed: AtomicBool,
    /// Bumped to end every open subscription without closing the queue.
    generation: AtomicU64,
}

impl Queues {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, VecDeque<StoredMessage>>>, QueueError> {
        self.queues.lock().map_err(|e| QueueError::ConnectionError(format!("Queue lock is poisoned: {e}")))
    }

    fn push_back(&self, queue: &str, message: StoredMessage) -> Result<(), QueueError> {
        self.lock()?.entry(queue.to_string()).or_default().push_back(message);
        self.notify.notify_waiters();
        Ok(())
    }

    fn push_front(&self, queue: &str, message: StoredMessage) -> Result<(), QueueError> {
        self.lock()?.entry(queue.to_string()).or_default().push_front(message);
        self.notify.notify_waiters();
        Ok(())
    }

    fn pop(&self, queue: &str) -> Result<Option<StoredMessage>, QueueError> {
        Ok(self.lock()?.get_mut(queue).and_then(VecDeque::pop_front))
    }
}

/// An in-process [`MessageQueue`] with the same delivery contract as the AMQP implementation: messages are delivered
/// in order, and a message that is nacked with `requeue` goes back to the head of the queue, flagged as redelivered.
///
/// Nothing survives a restart, so this is only suitable for tests and single-process development setups.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    queues: Arc<Queues>,
}

impl MemoryQueue {
    /// The number of messages waiting in the queue (excluding messages that have been delivered and not yet settled).
    pub fn pending(&self, queue: &str) -> usize {
        self.queues.lock().map(|q| q.get(queue).map(VecDeque::len).unwrap_or(0)).unwrap_or(0)
    }

    /// Ends all subscriptions once they have drained the messages that are already queued.
    pub fn close(&self) {
        self.queues.closed.store(true, Ordering::SeqCst);
        self.queues.notify.notify_waiters();
    }

    /// Ends every open subscription straight away, the way a broker does when it cancels its consumers. The queue
    /// stays open and keeps its messages.
    pub fn cancel_consumers(&self) {
        self.queues.generation.fetch_add(1, Ordering::SeqCst);
        self.queues.notify.notify_waiters();
        debug!("📬️ In-memory consumers cancelled");
    }
}

impl MessageQueue for MemoryQueue {
    type Subscription = MemorySubscription;

    async fn declare(&self, queue: &str) -> Result<(), QueueError> {
        self.queues.lock()?.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        if self.queues.closed.load(Ordering::SeqCst) {
            return Err(QueueError::PublishError { queue: queue.to_string(), reason: "The queue is closed".into() });
        }
        self.queues.push_back(queue, StoredMessage { payload: payload.to_vec(), redelivered: false })?;
        trace!("📬️ Message published to in-memory queue {queue}");
        Ok(())
    }

    async fn subscribe(&self, queue: &str, _consumer_tag: &str) -> Result<MemorySubscription, QueueError> {
        self.declare(queue).await?;
        let generation = self.queues.generation.load(Ordering::SeqCst);
        Ok(MemorySubscription { queue: queue.to_string(), generation, queues: Arc::clone(&self.queues) })
    }

    fn is_closed(&self) -> bool {
        self.queues.closed.load(Ordering::SeqCst)
    }
}

pub struct MemorySubscription {
    queue: String,
    generation: u64,
    queues: Arc<Queues>,
}

impl QueueSubscription for MemorySubscription {
    type Delivery = MemoryDelivery;

    async fn next_delivery(&mut self) -> Option<Result<MemoryDelivery, QueueError>> {
        loop {
            // Register interest before checking, so that a publish between the check and the wait is not missed.
            let notified = self.queues.notify.notified();
            if self.queues.generation.load(Ordering::SeqCst) != self.generation {
                return None;
            }
            match self.queues.pop(&self.queue) {
                Ok(Some(message)) => {
                    return Some(Ok(MemoryDelivery {
                        queue: self.queue.clone(),
                        payload: message.payload,
                        redelivered: message.redelivered,
                        queues: Arc::clone(&self.queues),
                    }))
                },
                Ok(None) => {},
                Err(e) => return Some(Err(e)),
            }
            if self.queues.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }
}

pub struct MemoryDelivery {
    queue: String,
    payload: Vec<u8>,
    redelivered: bool,
    queues: Arc<Queues>,
}

impl QueueDelivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn settle(self, ack: Acknowledgement) -> Result<(), QueueError> {
        match ack {
            Acknowledgement::Ack => Ok(()),
            Acknowledgement::Nack { requeue: true } => {
                self.queues.push_front(&self.queue, StoredMessage { payload: self.payload, redelivered: true })
            },
            Acknowledgement::Nack { requeue: false } => {
                debug!("📬️ Message on {} discarded", self.queue);
                Ok(())
            },
        }
    }
}
