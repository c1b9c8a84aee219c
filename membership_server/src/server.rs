use std::{sync::Arc, time::Duration};

use actix_web::{dev::Server, http::KeepAlive, middleware::Logger, web, App, HttpServer};
use log::*;
use membership_engine::{
    cache::{CacheBackend, KeyValueCache},
    db_types::StatsType,
    events::{EventHandlers, EventHooks, EventProducers},
    queue::{AmqpQueue, MemoryQueue, MessageQueue},
    AccountApi,
    ExpiryApi,
    OrderFlowApi,
    PaymentGatewayDatabase,
    SqliteDatabase,
    StatsApi,
};
use mpg_common::Secret;

use crate::{
    auth::JwtAuthority,
    broadcast::StatsBroadcaster,
    config::{ExpiryConfig, ServerConfig},
    errors::ServerError,
    expiry_worker::{start_expiry_consumer, start_expiry_worker},
    integrations::{AlipayClient, PaymentProvider, WechatClient},
    routes::{
        health,
        wechat_notify_service,
        AlipayFinishRoute,
        AlipayNotifyRoute,
        AlipayPayRoute,
        AlipayQueryRoute,
        ChartRoute,
        ChartStreamRoute,
        CreateOrderRoute,
        FinishRedirect,
        MyOrderRoute,
        MyOrdersRoute,
        WechatPayRoute,
        WechatQueryRoute,
    },
};

const MAX_DB_CONNECTIONS: u32 = 25;
const EVENT_BUFFER_SIZE: usize = 25;

pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let db = SqliteDatabase::new_with_url(&config.database_url, MAX_DB_CONNECTIONS)
        .await
        .map_err(|e| ServerError::InitializeError(e.to_string()))?;
    db.run_migrations().await.map_err(|e| ServerError::InitializeError(e.to_string()))?;
    let cache = CacheBackend::from_url(config.redis_url.as_ref().map(|url| url.reveal().as_str()))
        .await
        .map_err(|e| ServerError::InitializeError(e.to_string()))?;

    let broadcaster = Arc::new(StatsBroadcaster::default());
    let hooks = stats_broadcast_hooks(StatsApi::new(db.clone(), cache.clone()), Arc::clone(&broadcaster));
    let handlers = EventHandlers::new(EVENT_BUFFER_SIZE, hooks);
    let producers = handlers.producers();
    handlers.start_handlers();

    let expiry_api = ExpiryApi::new(db.clone(), producers.clone())
        .with_unpaid_timeout(config.expiry.unpaid_order_timeout)
        .with_page_size(config.expiry.page_size);
    match &config.amqp {
        Some(amqp) => {
            let queue = AmqpQueue::connect(amqp.clone()).await.map_err(|e| ServerError::InitializeError(e.to_string()))?;
            info!("📬️ Connected to the message broker");
            start_expiry_tasks(expiry_api, queue, &config.expiry);
        },
        None => {
            warn!("📬️ No AMQP URL configured. Expired orders are queued in memory and are lost on restart.");
            start_expiry_tasks(expiry_api, MemoryQueue::default(), &config.expiry);
        },
    }

    let srv = create_server_instance(config, db, cache, producers, broadcaster)?;
    srv.await.map_err(|e| ServerError::Unspecified(e.to_string()))
}

fn start_expiry_tasks<B, Q>(api: ExpiryApi<B>, queue: Q, config: &ExpiryConfig)
where
    B: PaymentGatewayDatabase + 'static,
    Q: MessageQueue + 'static,
{
    if config.start_consumer {
        let _consumer = start_expiry_consumer(api.clone(), queue.clone());
    } else {
        info!("🕰️ The expiry consumer is disabled on this instance");
    }
    let _worker = start_expiry_worker(api, queue, config.sweep_time);
}

/// Every change to the order counts triggers a recomputation of the order chart, which is pushed to all connected
/// chart streams.
pub fn stats_broadcast_hooks(
    stats: StatsApi<SqliteDatabase, CacheBackend>,
    broadcaster: Arc<StatsBroadcaster>,
) -> EventHooks {
    let stats = Arc::new(stats);
    let mut hooks = EventHooks::default();
    let (s, b) = (Arc::clone(&stats), Arc::clone(&broadcaster));
    hooks.on_order_created(move |ev| {
        let (stats, broadcaster) = (Arc::clone(&s), Arc::clone(&b));
        Box::pin(async move {
            trace!("📬️ Order {} created. Refreshing order stats.", ev.order.out_trade_no);
            refresh_and_broadcast(&stats, &broadcaster, StatsType::Order).await;
        })
    });
    let (s, b) = (Arc::clone(&stats), Arc::clone(&broadcaster));
    hooks.on_order_paid(move |ev| {
        let (stats, broadcaster) = (Arc::clone(&s), Arc::clone(&b));
        Box::pin(async move {
            trace!("📬️ Order {} paid. Refreshing order stats.", ev.order.out_trade_no);
            refresh_and_broadcast(&stats, &broadcaster, StatsType::Order).await;
        })
    });
    hooks.on_orders_expired(move |ev| {
        let (stats, broadcaster) = (Arc::clone(&stats), Arc::clone(&broadcaster));
        Box::pin(async move {
            trace!("📬️ {} orders expired. Refreshing order stats.", ev.order_ids.len());
            refresh_and_broadcast(&stats, &broadcaster, StatsType::Order).await;
        })
    });
    hooks
}

async fn refresh_and_broadcast<B, C>(stats: &StatsApi<B, C>, broadcaster: &StatsBroadcaster, stats_type: StatsType)
where
    B: PaymentGatewayDatabase,
    C: KeyValueCache,
{
    match stats.refresh(stats_type).await {
        Ok(aggregate) => {
            let delivered = broadcaster.broadcast(stats_type, &aggregate);
            debug!("📊️ {stats_type} stats refreshed and pushed to {delivered} chart streams");
        },
        Err(e) => warn!("📊️ Could not refresh {stats_type} stats. Chart streams were not updated. {e}"),
    }
}

pub fn create_server_instance(
    config: ServerConfig,
    db: SqliteDatabase,
    cache: CacheBackend,
    producers: EventProducers,
    broadcaster: Arc<StatsBroadcaster>,
) -> Result<Server, ServerError> {
    let alipay = AlipayClient::new(config.alipay.clone());
    let wechat = WechatClient::new(config.wechat.clone());
    let finish_redirect = FinishRedirect(config.alipay.finish_redirect.clone());
    let wechat_key = config.wechat.api_key.clone();
    let auth = config.auth.clone();
    let srv = HttpServer::new(move || {
        let orders_api = OrderFlowApi::new(db.clone(), cache.clone(), producers.clone());
        let accounts_api = AccountApi::new(db.clone());
        let stats_api = StatsApi::new(db.clone(), cache.clone());
        let authority = JwtAuthority::new(&auth);
        let wechat_key = wechat_key.clone();
        App::new()
            .wrap(Logger::new("%t (%D ms) %s %a %{Host}i %U").log_target("access_log"))
            .app_data(web::Data::new(orders_api))
            .app_data(web::Data::new(accounts_api))
            .app_data(web::Data::new(stats_api))
            .app_data(web::Data::new(authority))
            .app_data(web::Data::from(Arc::clone(&broadcaster)))
            .app_data(web::Data::new(alipay.clone()))
            .app_data(web::Data::new(wechat.clone()))
            .app_data(web::Data::new(finish_redirect.clone()))
            .configure(|cfg| {
                register_routes::<SqliteDatabase, CacheBackend, AlipayClient, WechatClient>(cfg, wechat_key)
            })
    })
    .keep_alive(KeepAlive::Timeout(Duration::from_secs(600)))
    .bind((config.host.as_str(), config.port))?
    .run();
    Ok(srv)
}

/// Registers every route. `A` and `W` are the Alipay and WeChat Pay providers.
pub fn register_routes<B, C, A, W>(cfg: &mut web::ServiceConfig, wechat_key: Secret<String>)
where
    B: PaymentGatewayDatabase + 'static,
    C: KeyValueCache + 'static,
    A: PaymentProvider + 'static,
    W: PaymentProvider + 'static,
{
    cfg.service(health)
        .service(CreateOrderRoute::<B, C>::new())
        .service(MyOrdersRoute::<B>::new())
        .service(MyOrderRoute::<B>::new())
        .service(AlipayPayRoute::<B, C, A>::new())
        .service(AlipayNotifyRoute::<B, C, A>::new())
        .service(AlipayFinishRoute::<B, C, A>::new())
        .service(AlipayQueryRoute::<B, C, A>::new())
        .service(WechatPayRoute::<B, C, W>::new())
        .service(wechat_notify_service::<B, C>(wechat_key))
        .service(WechatQueryRoute::<B, C, W>::new())
        .service(ChartStreamRoute::<B, C>::new())
        .service(ChartRoute::<B, C>::new());
}
