//! Request handler definitions
//!
//! Define each route and its handler here. Handlers are generic over the storage backend, the cache and the payment
//! provider, so that the endpoint tests can run them against a throwaway database and mocked providers.
//!
//! Each worker thread processes its requests sequentially, so handlers must never block. Everything that touches the
//! database, the cache or a payment provider is awaited.
//!
//! Webhook handlers (`/alipay/notify`, `/wechat/notify`) never return an error. They answer with the provider's own
//! positive or negative reply, because that is all the provider understands.
use std::{collections::BTreeMap, str::FromStr};

use actix_web::{
    get,
    guard,
    http::header::{self, ContentType},
    web,
    HttpMessage,
    HttpRequest,
    HttpResponse,
    Responder,
};
use log::*;
use membership_engine::{
    cache::KeyValueCache,
    db_types::{OrderStatusType, OutTradeNo, SettlementOutcome, StatsType},
    traits::Pagination,
    AccountApi,
    AccountManagement,
    OrderFlowApi,
    PaymentGatewayDatabase,
    PaymentGatewayError,
    StatsApi,
};
use mpg_common::Secret;

use crate::{
    auth::{require_admin, JwtClaims},
    broadcast::{sse_frame, sse_response, StatsBroadcaster},
    data_objects::{NewOrderRequest, NewOrderResponse, OrderListQuery, OutTradeNoRequest, TradeQueryResponse},
    errors::ServerError,
    helpers::client_ip,
    integrations::{
        alipay::{self, NOTIFY_TIME_FIELD, RETURN_TIME_FIELD},
        wechat::{self, reply_xml},
        PayChannel,
        PaymentProvider,
    },
    middleware::{WechatNotification, WechatSignatureFactory},
};

// Web-actix cannot handle generics in handlers, so it's implemented manually using the `route!` macro
#[macro_export]
macro_rules! route {
    ($name:ident => $method:ident $path:literal impl $($bounds:ty),+) => {
        paste::paste! { pub struct [<$name:camel Route>]< $( [< T $bounds:camel> ],)+ >( $( core::marker::PhantomData<fn() -> [< T $bounds:camel> ] >,)+ );}
        paste::paste! { impl< $( [< T $bounds:camel> ],)+ > [<$name:camel Route>]< $( [< T $bounds:camel> ],)+ > {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self($( core::marker::PhantomData::<fn() -> [< T $bounds:camel> ] >,)+)
            }
        }}
        paste::paste! { impl<$( [< T $bounds:camel >] , )+> actix_web::dev::HttpServiceFactory for [<$name:camel Route>]<$([<T $bounds:camel>],)+>
        where
            $([<T $bounds:camel>]: $bounds + 'static,)+
        {
            fn register(self, config: &mut actix_web::dev::AppService) {
                let res = actix_web::Resource::new($path)
                    .name(stringify!($name))
                    .guard(actix_web::guard::$method())
                    .to($name::< $( [< T $bounds:camel >], )+>);
                actix_web::dev::HttpServiceFactory::register(res, config);
            }
        }}
    };
}

/// Where the browser is sent after Alipay's synchronous return has been handled.
#[derive(Debug, Clone)]
pub struct FinishRedirect(pub String);

// ----------------------------------------------   Health  ----------------------------------------------------
#[get("/health")]
pub async fn health() -> impl Responder {
    trace!("💻️ Received health check request");
    HttpResponse::Ok().body("👍️\n")
}

//----------------------------------------------   Orders  ----------------------------------------------------

route!(create_order => Post "/orders" impl PaymentGatewayDatabase, KeyValueCache);
/// Creates a pending order for one of the catalog memberships, on behalf of the caller.
///
/// Responds with the new order's id and `outTradeNo`, which is the reference used with the payment providers.
pub async fn create_order<B, C>(
    claims: JwtClaims,
    body: web::Json<NewOrderRequest>,
    api: web::Data<OrderFlowApi<B, C>>,
) -> Result<HttpResponse, ServerError>
where
    B: PaymentGatewayDatabase,
    C: KeyValueCache,
{
    let membership_id = body.membership_id;
    debug!("💻️ POST order for membership #{membership_id} by user #{}", claims.user_id);
    let order = api.create_order(claims.user_id, membership_id).await.map_err(|e| {
        debug!("💻️ Could not create order. {e}");
        ServerError::from(e)
    })?;
    Ok(HttpResponse::Ok().json(NewOrderResponse::from(&order)))
}

route!(my_orders => Get "/orders" impl AccountManagement);
/// The caller's orders, newest first, optionally filtered by `status`. Paged with `page` (1-based) and `pageSize`.
pub async fn my_orders<B: AccountManagement>(
    claims: JwtClaims,
    query: web::Query<OrderListQuery>,
    api: web::Data<AccountApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let query = query.into_inner();
    debug!("💻️ GET my_orders for user #{}", claims.user_id);
    let status = query
        .status
        .as_deref()
        .map(OrderStatusType::from_str)
        .transpose()
        .map_err(|e| ServerError::ValidationError(e.to_string()))?;
    let pagination = Pagination::new(query.page, query.page_size);
    let orders = api.orders_for_user(claims.user_id, status, pagination).await?;
    Ok(HttpResponse::Ok().json(orders))
}

route!(my_order => Get "/orders/{out_trade_no}" impl AccountManagement);
/// A single order. Orders belonging to other users are reported as not found.
pub async fn my_order<B: AccountManagement>(
    claims: JwtClaims,
    path: web::Path<String>,
    api: web::Data<AccountApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let out_trade_no = OutTradeNo(path.into_inner());
    debug!("💻️ GET order {out_trade_no} for user #{}", claims.user_id);
    let order = api
        .order_for_user(claims.user_id, &out_trade_no)
        .await?
        .ok_or_else(|| ServerError::from(PaymentGatewayError::OrderNotFound(out_trade_no)))?;
    Ok(HttpResponse::Ok().json(order))
}

//----------------------------------------------   Alipay  ----------------------------------------------------

route!(alipay_pay => Post "/alipay/pay/{platform}" impl PaymentGatewayDatabase, KeyValueCache, PaymentProvider);
/// Builds the signed Alipay checkout URL for one of the caller's pending orders. `platform` is `pc` (desktop
/// checkout page) or `mobile` (mobile web checkout).
pub async fn alipay_pay<B, C, P>(
    req: HttpRequest,
    claims: JwtClaims,
    path: web::Path<String>,
    body: web::Json<OutTradeNoRequest>,
    api: web::Data<OrderFlowApi<B, C>>,
    provider: web::Data<P>,
) -> Result<HttpResponse, ServerError>
where
    B: PaymentGatewayDatabase,
    C: KeyValueCache,
    P: PaymentProvider,
{
    let channel = match PayChannel::from_str(&path.into_inner()) {
        Ok(channel @ (PayChannel::Page | PayChannel::Wap)) => channel,
        Ok(other) => return Err(ServerError::ValidationError(format!("{other} is not an Alipay platform"))),
        Err(e) => return Err(ServerError::ValidationError(e)),
    };
    let out_trade_no = body.into_inner().out_trade_no;
    debug!("💻️ POST alipay/pay/{channel} for order {out_trade_no}");
    let order = api.payable_order_for_user(claims.user_id, &out_trade_no).await?;
    let request = provider.request_payment(&order, channel, client_ip(&req)).await?;
    Ok(HttpResponse::Ok().json(request))
}

route!(alipay_notify => Post "/alipay/notify" impl PaymentGatewayDatabase, KeyValueCache, PaymentProvider);
/// Alipay's asynchronous payment notification.
///
/// Alipay retries a notification until it is answered with the plain text `success`, so repeated deliveries for the
/// same order are normal, and are answered with `success` once the order is paid. Anything that fails (a bad
/// signature, a malformed form, an unknown order) is answered with `fail`.
pub async fn alipay_notify<B, C, P>(
    form: Result<web::Form<BTreeMap<String, String>>, actix_web::Error>,
    api: web::Data<OrderFlowApi<B, C>>,
    provider: web::Data<P>,
) -> HttpResponse
where
    B: PaymentGatewayDatabase,
    C: KeyValueCache,
    P: PaymentProvider,
{
    let result = match form {
        Ok(form) => {
            settle_alipay_params(&form.into_inner(), NOTIFY_TIME_FIELD, api.get_ref(), provider.get_ref()).await
        },
        Err(e) => Err(ServerError::InvalidRequestBody(e.to_string())),
    };
    let reply = match result {
        Ok(outcome) => {
            log_outcome("Alipay notification", outcome.as_ref());
            "success"
        },
        Err(e) => {
            warn!("💻️ Alipay notification rejected. {e}");
            "fail"
        },
    };
    HttpResponse::Ok().insert_header(ContentType::plaintext()).body(reply)
}

route!(alipay_finish => Get "/alipay/finish" impl PaymentGatewayDatabase, KeyValueCache, PaymentProvider);
/// Alipay's synchronous return. The browser lands here after paying, carrying a signed copy of the trade in the query
/// string. The order is settled and the browser is sent on to the front end.
pub async fn alipay_finish<B, C, P>(
    query: web::Query<BTreeMap<String, String>>,
    api: web::Data<OrderFlowApi<B, C>>,
    provider: web::Data<P>,
    redirect: web::Data<FinishRedirect>,
) -> Result<HttpResponse, ServerError>
where
    B: PaymentGatewayDatabase,
    C: KeyValueCache,
    P: PaymentProvider,
{
    let params = query.into_inner();
    let outcome = settle_alipay_params(&params, RETURN_TIME_FIELD, api.get_ref(), provider.get_ref()).await?;
    log_outcome("Alipay return", outcome.as_ref());
    Ok(HttpResponse::Found().insert_header((header::LOCATION, redirect.0.as_str())).finish())
}

async fn settle_alipay_params<B, C, P>(
    params: &BTreeMap<String, String>,
    time_field: &str,
    api: &OrderFlowApi<B, C>,
    provider: &P,
) -> Result<Option<SettlementOutcome>, ServerError>
where
    B: PaymentGatewayDatabase,
    C: KeyValueCache,
    P: PaymentProvider,
{
    provider.verify_notification(params).map_err(|e| ServerError::ValidationError(e.to_string()))?;
    match alipay::notification_settlement(params, time_field)? {
        Some(settlement) => Ok(Some(api.settle(settlement).await?)),
        None => Ok(None),
    }
}

route!(alipay_query => Post "/alipay/query" impl PaymentGatewayDatabase, KeyValueCache, PaymentProvider);
/// Asks Alipay about one of the caller's pending orders, and settles it if Alipay reports it as paid.
pub async fn alipay_query<B, C, P>(
    claims: JwtClaims,
    body: web::Json<OutTradeNoRequest>,
    api: web::Data<OrderFlowApi<B, C>>,
    provider: web::Data<P>,
) -> Result<HttpResponse, ServerError>
where
    B: PaymentGatewayDatabase,
    C: KeyValueCache,
    P: PaymentProvider,
{
    query_and_settle(&claims, body.into_inner().out_trade_no, api.get_ref(), provider.get_ref()).await
}

//----------------------------------------------   WeChat Pay  ----------------------------------------------------

route!(wechat_pay => Post "/wechat/pay" impl PaymentGatewayDatabase, KeyValueCache, PaymentProvider);
/// Places a `NATIVE` unified order with WeChat Pay for one of the caller's pending orders, and returns the `codeUrl`
/// to render as a QR code.
pub async fn wechat_pay<B, C, P>(
    req: HttpRequest,
    claims: JwtClaims,
    body: web::Json<OutTradeNoRequest>,
    api: web::Data<OrderFlowApi<B, C>>,
    provider: web::Data<P>,
) -> Result<HttpResponse, ServerError>
where
    B: PaymentGatewayDatabase,
    C: KeyValueCache,
    P: PaymentProvider,
{
    let out_trade_no = body.into_inner().out_trade_no;
    debug!("💻️ POST wechat/pay for order {out_trade_no}");
    let order = api.payable_order_for_user(claims.user_id, &out_trade_no).await?;
    let request = provider.request_payment(&order, PayChannel::Native, client_ip(&req)).await?;
    Ok(HttpResponse::Ok().json(request))
}

/// The WeChat Pay notification route. The signature middleware parses and verifies the XML body before
/// [`wechat_notify`] runs, so this route is assembled by hand rather than with `route!`.
pub fn wechat_notify_service<B, C>(api_key: Secret<String>) -> impl actix_web::dev::HttpServiceFactory
where
    B: PaymentGatewayDatabase + 'static,
    C: KeyValueCache + 'static,
{
    web::resource("/wechat/notify")
        .name("wechat_notify")
        .guard(guard::Post())
        .to(wechat_notify::<B, C>)
        .wrap(WechatSignatureFactory::new(api_key))
}

/// WeChat Pay's asynchronous payment notification. Only requests that passed the signature check reach this handler.
pub async fn wechat_notify<B, C>(req: HttpRequest, api: web::Data<OrderFlowApi<B, C>>) -> HttpResponse
where
    B: PaymentGatewayDatabase,
    C: KeyValueCache,
{
    let notification = req.extensions().get::<WechatNotification>().cloned();
    let result = match notification {
        Some(notification) => match wechat::notification_settlement(&notification.0) {
            Ok(settlement) => api.settle(settlement).await.map_err(ServerError::from),
            Err(e) => Err(e.into()),
        },
        None => Err(ServerError::InvalidRequestBody("No verified WeChat Pay notification".into())),
    };
    let xml = match result {
        Ok(outcome) => {
            log_outcome("WeChat Pay notification", Some(&outcome));
            reply_xml(true, "OK")
        },
        Err(e) => {
            warn!("💻️ WeChat Pay notification rejected. {e}");
            reply_xml(false, &e.to_string())
        },
    };
    HttpResponse::Ok().content_type("text/xml").body(xml)
}

route!(wechat_query => Post "/wechat/query" impl PaymentGatewayDatabase, KeyValueCache, PaymentProvider);
/// Asks WeChat Pay about one of the caller's pending orders, and settles it if WeChat Pay reports it as paid.
pub async fn wechat_query<B, C, P>(
    claims: JwtClaims,
    body: web::Json<OutTradeNoRequest>,
    api: web::Data<OrderFlowApi<B, C>>,
    provider: web::Data<P>,
) -> Result<HttpResponse, ServerError>
where
    B: PaymentGatewayDatabase,
    C: KeyValueCache,
    P: PaymentProvider,
{
    query_and_settle(&claims, body.into_inner().out_trade_no, api.get_ref(), provider.get_ref()).await
}

async fn query_and_settle<B, C, P>(
    claims: &JwtClaims,
    out_trade_no: OutTradeNo,
    api: &OrderFlowApi<B, C>,
    provider: &P,
) -> Result<HttpResponse, ServerError>
where
    B: PaymentGatewayDatabase,
    C: KeyValueCache,
    P: PaymentProvider,
{
    let method = provider.payment_method();
    debug!("💻️ Querying {method} for order {out_trade_no} on behalf of user #{}", claims.user_id);
    let order = api.payable_order_for_user(claims.user_id, &out_trade_no).await?;
    let trade = provider.query_trade(&order.out_trade_no).await?;
    let settled = match trade.settlement(&order.out_trade_no, method)? {
        Some(settlement) => {
            let outcome = api.settle(settlement).await?;
            log_outcome("Trade query", Some(&outcome));
            outcome.order().status == OrderStatusType::Paid
        },
        None => false,
    };
    Ok(HttpResponse::Ok().json(TradeQueryResponse { trade_status: trade.trade_status, settled }))
}

fn log_outcome(source: &str, outcome: Option<&SettlementOutcome>) {
    match outcome {
        Some(SettlementOutcome::Settled { order, user }) => {
            info!("💻️ {source}: order {} settled. User #{} is now {}", order.out_trade_no, user.id, user.role)
        },
        Some(SettlementOutcome::AlreadyFinal(order)) => {
            debug!("💻️ {source}: order {} was already {}", order.out_trade_no, order.status)
        },
        None => trace!("💻️ {source}: nothing to settle"),
    }
}

//----------------------------------------------   Charts  ----------------------------------------------------

fn parse_stats_type(path: &str) -> Result<StatsType, ServerError> {
    StatsType::from_str(path).map_err(|_| PaymentGatewayError::InvalidStatsType(path.to_string()).into())
}

route!(chart => Get "/admin/charts/{stats_type}" impl AccountManagement, KeyValueCache);
/// Monthly order or user counts (`order` or `user`) for the admin dashboard, served from the stats cache.
pub async fn chart<B, C>(
    claims: JwtClaims,
    path: web::Path<String>,
    accounts: web::Data<AccountApi<B>>,
    stats: web::Data<StatsApi<B, C>>,
) -> Result<HttpResponse, ServerError>
where
    B: AccountManagement,
    C: KeyValueCache,
{
    require_admin(accounts.get_ref(), &claims).await?;
    let stats_type = parse_stats_type(&path)?;
    debug!("💻️ GET {stats_type} chart");
    let aggregate = stats.get_aggregate(stats_type).await?;
    Ok(HttpResponse::Ok().json(aggregate))
}

route!(chart_stream => Get "/admin/charts/stream/{stats_type}" impl AccountManagement, KeyValueCache);
/// Server-Sent Events feed of a chart. The current aggregate is sent straight away, followed by a fresh one each time
/// the underlying counts change.
pub async fn chart_stream<B, C>(
    claims: JwtClaims,
    path: web::Path<String>,
    accounts: web::Data<AccountApi<B>>,
    stats: web::Data<StatsApi<B, C>>,
    broadcaster: web::Data<StatsBroadcaster>,
) -> Result<HttpResponse, ServerError>
where
    B: AccountManagement,
    C: KeyValueCache,
{
    let admin = require_admin(accounts.get_ref(), &claims).await?;
    let stats_type = parse_stats_type(&path)?;
    info!("💻️ Admin #{} subscribed to the {stats_type} chart stream", admin.id);
    // Subscribe first, so that no update between the snapshot and the subscription is lost.
    let receiver = broadcaster.subscribe(stats_type);
    let initial = match stats.get_aggregate(stats_type).await {
        Ok(aggregate) => sse_frame(&aggregate).map_err(|e| warn!("💻️ Could not serialize {stats_type} stats. {e}")).ok(),
        Err(e) => {
            warn!("💻️ Could not load the current {stats_type} stats for a new stream. {e}");
            None
        },
    };
    Ok(sse_response(initial, receiver))
}
