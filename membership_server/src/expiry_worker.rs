use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Utc};
use log::*;
use membership_engine::{
    queue::{ExpiredOrdersPublisher, MessageQueue},
    ExpiryApi,
    PaymentGatewayDatabase,
};
use tokio::task::JoinHandle;

pub const EXPIRY_CONSUMER_TAG: &str = "mpg_expiry_consumer";
/// How long the consumer waits before subscribing again after the broker dropped it.
const CONSUMER_RESTART_DELAY: StdDuration = StdDuration::from_secs(5);

/// The first occurrence of `at` (wall-clock time in `now`'s time zone) strictly after `now`.
///
/// If `at` does not exist on a given day (it falls in a daylight saving gap) the next valid instant after it is used.
pub fn next_run<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut day = now.date_naive();
    loop {
        let candidate = day.and_time(at);
        let resolved = tz
            .from_local_datetime(&candidate)
            .earliest()
            .or_else(|| tz.from_local_datetime(&(candidate + Duration::hours(1))).earliest());
        match resolved {
            Some(t) if t > *now => return t,
            _ => day = day.succ_opt().unwrap_or(day),
        }
    }
}

/// Starts the daily expiry sweep. Do not await the returned JoinHandle, as it will run indefinitely.
///
/// The task sleeps until the next `sweep_time` (server local time), runs one sweep tick, and repeats.
pub fn start_expiry_worker<B, Q>(api: ExpiryApi<B>, queue: Q, sweep_time: NaiveTime) -> JoinHandle<()>
where
    B: PaymentGatewayDatabase + 'static,
    Q: MessageQueue + 'static,
{
    actix_web::rt::spawn(async move {
        let publisher = ExpiredOrdersPublisher::new(queue);
        info!("🕰️ Unpaid order expiry worker started. Sweeps run daily at {sweep_time} ({api:?})");
        loop {
            let now = Local::now();
            let next = next_run(&now, sweep_time);
            let wait = (next - now).to_std().unwrap_or_default();
            debug!("🕰️ Next expiry sweep at {next} (in {}s)", wait.as_secs());
            tokio::time::sleep(wait).await;
            info!("🕰️ Running unpaid order expiry job");
            let report = api.expire_stale_orders(Utc::now(), &publisher).await;
            match &report.aborted {
                None => info!("🕰️ {} orders expired", report.expired.len()),
                Some(reason) => {
                    warn!("🕰️ Expiry job stopped early after expiring {} orders: {reason}", report.expired.len())
                },
            }
            trace!("🕰️ Expired orders: {:?}", report.expired);
        }
    })
}

/// Starts the expiry queue consumer. It runs until the queue is closed.
///
/// If the subscription fails or ends while the queue is still open (e.g. the broker went away or cancelled the
/// consumer), this is logged and the consumer subscribes again after a short pause. The queue reconnects on demand.
pub fn start_expiry_consumer<B, Q>(api: ExpiryApi<B>, queue: Q) -> JoinHandle<()>
where
    B: PaymentGatewayDatabase + 'static,
    Q: MessageQueue + 'static,
{
    actix_web::rt::spawn(async move {
        loop {
            match api.consume(&queue, EXPIRY_CONSUMER_TAG).await {
                Ok(handled) if queue.is_closed() => {
                    info!("🕰️ Expiry queue closed. The consumer handled {handled} messages and has stopped.");
                    break;
                },
                Ok(handled) => {
                    warn!(
                        "🕰️ Expiry subscription was dropped by the broker after {handled} messages. Resubscribing in {}s",
                        CONSUMER_RESTART_DELAY.as_secs()
                    );
                    tokio::time::sleep(CONSUMER_RESTART_DELAY).await;
                },
                Err(e) => {
                    error!("🕰️ Expiry consumer failed: {e}. Resubscribing in {}s", CONSUMER_RESTART_DELAY.as_secs());
                    tokio::time::sleep(CONSUMER_RESTART_DELAY).await;
                },
            }
        }
    })
}
