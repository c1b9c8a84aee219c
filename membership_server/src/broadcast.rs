//! Real-time fan-out of the monthly statistics to Server-Sent Events clients.
//!
//! Each chart stream registers a bounded channel with the [`StatsBroadcaster`]. Broadcasting formats a single
//! `data: <json>\n\n` frame and offers it to every subscriber of that statistic without waiting:
//! * a subscriber whose stream has gone away is pruned on the spot,
//! * a subscriber that is too slow to keep up misses that frame, and only that frame.
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use actix_web::{http::header, HttpResponse};
use bytes::Bytes;
use futures::stream;
use log::*;
use membership_engine::db_types::{MonthlyStats, StatsType};
use tokio::sync::{mpsc, mpsc::error::TrySendError};

pub const SUBSCRIBER_BUFFER_SIZE: usize = 16;

type Registry = HashMap<StatsType, Vec<mpsc::Sender<Bytes>>>;

#[derive(Default)]
pub struct StatsBroadcaster {
    subscribers: Mutex<Registry>,
}

impl StatsBroadcaster {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A panic while holding the lock leaves the registry itself intact, so keep using it.
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, stats_type: StatsType) -> mpsc::Receiver<Bytes> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);
        let mut registry = self.registry();
        let subscribers = registry.entry(stats_type).or_default();
        subscribers.push(sender);
        debug!("📊️ New {stats_type} stats subscriber. {} connected", subscribers.len());
        receiver
    }

    /// Sends the aggregate to every subscriber of `stats_type`. Returns the number of subscribers that received it.
    pub fn broadcast(&self, stats_type: StatsType, stats: &MonthlyStats) -> usize {
        let frame = match sse_frame(stats) {
            Ok(frame) => frame,
            Err(e) => {
                error!("📊️ Could not serialize {stats_type} stats for broadcast: {e}");
                return 0;
            },
        };
        let mut registry = self.registry();
        let Some(subscribers) = registry.get_mut(&stats_type) else {
            return 0;
        };
        let mut delivered = 0;
        subscribers.retain(|sender| match sender.try_send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            },
            Err(TrySendError::Full(_)) => {
                debug!("📊️ A {stats_type} stats subscriber is lagging. Dropping this update for it.");
                true
            },
            Err(TrySendError::Closed(_)) => {
                debug!("📊️ A {stats_type} stats subscriber has disconnected");
                false
            },
        });
        trace!("📊️ {stats_type} stats sent to {delivered} of {} subscribers", subscribers.len());
        delivered
    }

    pub fn subscriber_count(&self, stats_type: StatsType) -> usize {
        self.registry().get(&stats_type).map(Vec::len).unwrap_or(0)
    }
}

pub fn sse_frame(stats: &MonthlyStats) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(stats)?;
    Ok(Bytes::from(format!("data: {json}\n\n")))
}

/// Builds the streaming response for one SSE client: `initial` (if any) first, then whatever arrives on `receiver`
/// until the broadcaster drops it.
pub fn sse_response(initial: Option<Bytes>, receiver: mpsc::Receiver<Bytes>) -> HttpResponse {
    let live = stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|frame| (Ok::<_, actix_web::Error>(frame), receiver))
    });
    let initial = stream::iter(initial.into_iter().map(Ok::<_, actix_web::Error>));
    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONNECTION, "keep-alive"))
        .streaming(futures::StreamExt::chain(initial, live))
}

#[cfg(test)]
mod test {
    use super::*;

    fn stats() -> MonthlyStats {
        MonthlyStats { months: vec!["2024-04".into(), "2024-05".into()], values: vec![3, 5] }
    }

    #[test]
    fn frames_are_sse_data_lines() {
        let frame = sse_frame(&stats()).unwrap();
        assert_eq!(frame, Bytes::from_static(b"data: {\"months\":[\"2024-04\",\"2024-05\"],\"values\":[3,5]}\n\n"));
    }

    #[tokio::test]
    async fn broadcasts_fan_out_by_type() {
        let hub = StatsBroadcaster::default();
        let mut orders_a = hub.subscribe(StatsType::Order);
        let mut orders_b = hub.subscribe(StatsType::Order);
        let mut users = hub.subscribe(StatsType::User);
        assert_eq!(hub.broadcast(StatsType::Order, &stats()), 2);
        assert_eq!(orders_a.recv().await.unwrap(), sse_frame(&stats()).unwrap());
        assert_eq!(orders_b.recv().await.unwrap(), sse_frame(&stats()).unwrap());
        assert!(users.try_recv().is_err());
        assert_eq!(hub.broadcast(StatsType::User, &MonthlyStats::default()), 1);
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let hub = StatsBroadcaster::default();
        let gone = hub.subscribe(StatsType::Order);
        let mut live = hub.subscribe(StatsType::Order);
        drop(gone);
        assert_eq!(hub.subscriber_count(StatsType::Order), 2);
        assert_eq!(hub.broadcast(StatsType::Order, &stats()), 1);
        assert_eq!(hub.subscriber_count(StatsType::Order), 1);
        assert!(live.recv().await.is_some());
        assert_eq!(hub.broadcast(StatsType::User, &stats()), 0);
    }

    #[tokio::test]
    async fn lagging_subscribers_miss_frames_but_stay_connected() {
        let hub = StatsBroadcaster::default();
        let mut slow = hub.subscribe(StatsType::Order);
        for _ in 0..SUBSCRIBER_BUFFER_SIZE {
            assert_eq!(hub.broadcast(StatsType::Order, &stats()), 1);
        }
        assert_eq!(hub.broadcast(StatsType::Order, &stats()), 0);
        assert_eq!(hub.subscriber_count(StatsType::Order), 1);
        let mut received = 0;
        while slow.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER_SIZE);
        assert_eq!(hub.broadcast(StatsType::Order, &stats()), 1);
    }
}
