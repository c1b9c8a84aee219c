use std::{future::poll_fn, pin::Pin, sync::Arc, time::Duration};

use actix_http::Request;
use actix_web::{
    body::MessageBody,
    dev::{Service, ServiceResponse},
    http::StatusCode,
    test,
    web,
    App,
    Error,
};
use bytes::Bytes;
use membership_engine::{
    cache::{CacheBackend, MemoryCache},
    events::{EventHandlers, EventProducers},
    test_utils::prepare_env::{prepare_test_env, random_db_path, tear_down},
    AccountApi,
    OrderFlowApi,
    SqliteDatabase,
    StatsApi,
};
use mpg_common::Secret;

use super::mocks::{MockAlipay, MockWechat};
use crate::{
    auth::JwtAuthority,
    broadcast::StatsBroadcaster,
    config::AuthConfig,
    routes::FinishRedirect,
    server::{register_routes, stats_broadcast_hooks},
};

// Test-only secrets. DO NOT re-use these anywhere.
const JWT_SECRET: &str = "endpoint-test-jwt-secret";
const WECHAT_KEY: &str = "192006250b4c09247ec02edce69f6a2d";

pub const FINISH_PAGE: &str = "https://vip.example.com/orders/finished";

pub fn auth_config() -> AuthConfig {
    AuthConfig::new(JWT_SECRET)
}

pub fn wechat_key() -> Secret<String> {
    Secret::new(WECHAT_KEY.to_string())
}

pub fn issue_token(user_id: i64) -> String {
    JwtAuthority::new(&auth_config()).issue(user_id, chrono::Duration::hours(1)).expect("Failed to sign token")
}

pub fn bearer(user_id: i64) -> (&'static str, String) {
    ("Authorization", format!("Bearer {}", issue_token(user_id)))
}

/// A throwaway database and cache, with the stats broadcast hooks running against them.
pub struct TestEnv {
    pub db: SqliteDatabase,
    pub cache: CacheBackend,
    pub broadcaster: Arc<StatsBroadcaster>,
    pub producers: EventProducers,
}

impl TestEnv {
    pub async fn new() -> Self {
        let url = random_db_path();
        prepare_test_env(&url).await;
        let db = SqliteDatabase::new_with_url(&url, 5).await.expect("Error creating database");
        let cache = CacheBackend::Memory(MemoryCache::default());
        let broadcaster = Arc::new(StatsBroadcaster::default());
        let hooks = stats_broadcast_hooks(StatsApi::new(db.clone(), cache.clone()), Arc::clone(&broadcaster));
        let handlers = EventHandlers::new(10, hooks);
        let producers = handlers.producers();
        handlers.start_handlers();
        Self { db, cache, broadcaster, producers }
    }

    pub async fn tear_down(self) {
        tear_down(self.db).await;
    }
}

pub async fn test_app(
    env: &TestEnv,
    alipay: MockAlipay,
    wechat: MockWechat,
) -> impl Service<Request, Response = ServiceResponse<impl MessageBody>, Error = Error> {
    let app = App::new()
        .app_data(web::Data::new(OrderFlowApi::new(env.db.clone(), env.cache.clone(), env.producers.clone())))
        .app_data(web::Data::new(AccountApi::new(env.db.clone())))
        .app_data(web::Data::new(StatsApi::new(env.db.clone(), env.cache.clone())))
        .app_data(web::Data::new(JwtAuthority::new(&auth_config())))
        .app_data(web::Data::from(Arc::clone(&env.broadcaster)))
        .app_data(web::Data::new(alipay))
        .app_data(web::Data::new(wechat))
        .app_data(web::Data::new(FinishRedirect(FINISH_PAGE.to_string())))
        .configure(|cfg| {
            register_routes::<SqliteDatabase, CacheBackend, MockAlipay, MockWechat>(cfg, wechat_key())
        });
    test::init_service(app).await
}

/// Sends the request and returns the status and the body as text.
pub async fn send<S, B>(app: &S, req: Request) -> (StatusCode, String)
where
    S: Service<Request, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    let res = test::call_service(app, req).await;
    let status = res.status();
    let body = test::read_body(res).await;
    (status, String::from_utf8_lossy(&body).into_owned())
}

/// Waits (briefly) for the next chunk of a streaming body. Returns `None` if nothing arrives in time or the stream
/// has ended.
pub async fn next_chunk<B: MessageBody>(body: &mut Pin<Box<B>>) -> Option<Bytes> {
    let next = poll_fn(|cx| body.as_mut().poll_next(cx));
    match tokio::time::timeout(Duration::from_secs(5), next).await {
        Ok(Some(Ok(chunk))) => Some(chunk),
        _ => None,
    }
}
