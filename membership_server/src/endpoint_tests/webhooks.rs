use std::{collections::BTreeMap, time::Duration};

use actix_http::Request;
use actix_web::{
    http::{header, StatusCode},
    test::{self, TestRequest},
};
use chrono::{DateTime, Months, Utc};
use membership_engine::{
    db_types::{Order, OrderStatusType, OutTradeNo, PaymentMethod, Role, User},
    test_utils::fixtures::{seed_membership, seed_order, seed_user},
    AccountManagement,
    SqliteDatabase,
};
use serde_json::json;

use super::{
    helpers::{bearer, send, test_app, wechat_key, TestEnv, FINISH_PAGE},
    mocks::{MockAlipay, MockWechat},
};
use crate::{
    data_objects::TradeQueryResponse,
    integrations::{wechat, PayChannel, PaymentRequest, ProviderError, TradeQueryResult},
};

const WECHAT_SUCCESS: &str = "<return_code><![CDATA[SUCCESS]]></return_code>";
const WECHAT_FAIL: &str = "<return_code><![CDATA[FAIL]]></return_code>";

async fn seed(env: &TestEnv) -> (User, Order) {
    let user = seed_user(&env.db, "alice", Role::Member, None).await;
    let membership = seed_membership(&env.db, "Monthly", 1500, 1).await;
    let order = seed_order(&env.db, user.id, &membership, Utc::now()).await;
    (user, order)
}

async fn order_status(db: &SqliteDatabase, out_trade_no: &OutTradeNo) -> OrderStatusType {
    db.fetch_order_by_out_trade_no(out_trade_no).await.unwrap().expect("Order has gone").status
}

/// Checks that the user's membership was extended by exactly one month, some time after `since`.
async fn assert_extended_once(db: &SqliteDatabase, user_id: i64, since: DateTime<Utc>) {
    let user = db.fetch_user(user_id).await.unwrap().unwrap();
    let expires = user.membership_expired_at.expect("Membership was not extended");
    let one_month = since.checked_add_months(Months::new(1)).unwrap();
    assert!(expires >= one_month - chrono::Duration::minutes(1), "{expires} is too early");
    assert!(expires <= one_month + chrono::Duration::days(1), "{expires} looks like more than one extension");
    assert_eq!(user.role, Role::Premium);
}

fn alipay_notification(out_trade_no: &OutTradeNo) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("notify_type".to_string(), "trade_status_sync".to_string()),
        ("out_trade_no".to_string(), out_trade_no.to_string()),
        ("trade_no".to_string(), "2024050122001404000000000001".to_string()),
        ("trade_status".to_string(), "TRADE_SUCCESS".to_string()),
        ("gmt_payment".to_string(), "2024-05-01 08:30:00".to_string()),
        ("total_amount".to_string(), "15.00".to_string()),
        ("sign_type".to_string(), "RSA2".to_string()),
        ("sign".to_string(), "c2lnbmF0dXJl".to_string()),
    ])
}

fn alipay_notify_request(params: &BTreeMap<String, String>) -> Request {
    TestRequest::post().uri("/alipay/notify").set_form(params).to_request()
}

fn verifying_alipay(times: usize) -> MockAlipay {
    let mut alipay = MockAlipay::new();
    alipay.expect_verify_notification().times(times).returning(|_| Ok(()));
    alipay
}

fn wechat_notification(out_trade_no: &OutTradeNo, result_code: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::from([
        ("appid".to_string(), "wx2421b1c4370ec43b".to_string()),
        ("mch_id".to_string(), "10000100".to_string()),
        ("nonce_str".to_string(), "5K8264ILTKCH16CQ2502SI8ZNMTM67VS".to_string()),
        ("out_trade_no".to_string(), out_trade_no.to_string()),
        ("transaction_id".to_string(), "4200000001202405010000000001".to_string()),
        ("time_end".to_string(), "20240501083000".to_string()),
        ("total_fee".to_string(), "1500".to_string()),
        ("return_code".to_string(), "SUCCESS".to_string()),
        ("result_code".to_string(), result_code.to_string()),
        ("sign_type".to_string(), wechat::SIGN_TYPE.to_string()),
    ]);
    let sign = wechat::sign(&params, &wechat_key()).unwrap();
    params.insert("sign".to_string(), sign);
    params
}

fn wechat_notify_request(params: &BTreeMap<String, String>) -> Request {
    TestRequest::post()
        .uri("/wechat/notify")
        .insert_header((header::CONTENT_TYPE, "text/xml"))
        .set_payload(wechat::to_xml(params))
        .to_request()
}

//----------------------------------------------   Alipay notify  ----------------------------------------------------

#[actix_web::test]
async fn alipay_notification_delivered_twice_settles_once() {
    let env = TestEnv::new().await;
    let (user, order) = seed(&env).await;
    let app = test_app(&env, verifying_alipay(2), MockWechat::new()).await;
    let before = Utc::now();

    let params = alipay_notification(&order.out_trade_no);
    let (status, body) = send(&app, alipay_notify_request(&params)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "success");
    let (status, body) = send(&app, alipay_notify_request(&params)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "success");

    let paid = env.db.fetch_order_by_out_trade_no(&order.out_trade_no).await.unwrap().unwrap();
    assert_eq!(paid.status, OrderStatusType::Paid);
    assert_eq!(paid.payment_method, Some(PaymentMethod::Alipay));
    assert_eq!(paid.trade_no.as_deref(), Some("2024050122001404000000000001"));
    assert_extended_once(&env.db, user.id, before).await;
    env.tear_down().await;
}

#[actix_web::test]
async fn alipay_notification_with_bad_signature_fails() {
    let env = TestEnv::new().await;
    let (_, order) = seed(&env).await;
    let mut alipay = MockAlipay::new();
    alipay
        .expect_verify_notification()
        .times(1)
        .returning(|_| Err(ProviderError::InvalidSignature("Signature mismatch".into())));
    let app = test_app(&env, alipay, MockWechat::new()).await;

    let (status, body) = send(&app, alipay_notify_request(&alipay_notification(&order.out_trade_no))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "fail");
    assert_eq!(order_status(&env.db, &order.out_trade_no).await, OrderStatusType::Pending);
    env.tear_down().await;
}

#[actix_web::test]
async fn alipay_notification_for_unknown_order_fails() {
    let env = TestEnv::new().await;
    let app = test_app(&env, verifying_alipay(1), MockWechat::new()).await;
    let params = alipay_notification(&OutTradeNo::from("no-such-order"));
    let (_, body) = send(&app, alipay_notify_request(&params)).await;
    assert_eq!(body, "fail");
    env.tear_down().await;
}

#[actix_web::test]
async fn unpaid_alipay_notifications_are_acknowledged_but_ignored() {
    let env = TestEnv::new().await;
    let (_, order) = seed(&env).await;
    let app = test_app(&env, verifying_alipay(1), MockWechat::new()).await;
    let mut params = alipay_notification(&order.out_trade_no);
    params.insert("trade_status".into(), "WAIT_BUYER_PAY".into());
    let (_, body) = send(&app, alipay_notify_request(&params)).await;
    assert_eq!(body, "success");
    assert_eq!(order_status(&env.db, &order.out_trade_no).await, OrderStatusType::Pending);
    env.tear_down().await;
}

//----------------------------------------------   Alipay return  ----------------------------------------------------

#[actix_web::test]
async fn alipay_return_settles_and_redirects() {
    let env = TestEnv::new().await;
    let (user, order) = seed(&env).await;
    let app = test_app(&env, verifying_alipay(1), MockWechat::new()).await;
    let before = Utc::now();

    let uri = format!(
        "/alipay/finish?out_trade_no={}&trade_no=2024050122001404000000000001&timestamp=2024-05-01+08%3A30%3A00&\
         sign=c2lnbmF0dXJl",
        order.out_trade_no
    );
    let res = test::call_service(&app, TestRequest::get().uri(&uri).to_request()).await;
    assert_eq!(res.status(), StatusCode::FOUND);
    assert_eq!(res.headers().get(header::LOCATION).unwrap(), FINISH_PAGE);
    assert_eq!(order_status(&env.db, &order.out_trade_no).await, OrderStatusType::Paid);
    assert_extended_once(&env.db, user.id, before).await;
    env.tear_down().await;
}

#[actix_web::test]
async fn alipay_return_with_bad_signature_is_rejected() {
    let env = TestEnv::new().await;
    let (_, order) = seed(&env).await;
    let mut alipay = MockAlipay::new();
    alipay.expect_verify_notification().returning(|_| Err(ProviderError::InvalidSignature("No sign field".into())));
    let app = test_app(&env, alipay, MockWechat::new()).await;

    let uri = format!("/alipay/finish?out_trade_no={}&trade_no=2024", order.out_trade_no);
    let (status, _) = send(&app, TestRequest::get().uri(&uri).to_request()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(order_status(&env.db, &order.out_trade_no).await, OrderStatusType::Pending);
    env.tear_down().await;
}

//----------------------------------------------   WeChat notify  ----------------------------------------------------

#[actix_web::test]
async fn signed_wechat_notification_settles() {
    let env = TestEnv::new().await;
    let (user, order) = seed(&env).await;
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;
    let before = Utc::now();

    let params = wechat_notification(&order.out_trade_no, "SUCCESS");
    let (status, body) = send(&app, wechat_notify_request(&params)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(WECHAT_SUCCESS), "{body}");
    // WeChat Pay retries until it is acknowledged. The repeat is acknowledged too.
    let (_, body) = send(&app, wechat_notify_request(&params)).await;
    assert!(body.contains(WECHAT_SUCCESS), "{body}");

    let paid = env.db.fetch_order_by_out_trade_no(&order.out_trade_no).await.unwrap().unwrap();
    assert_eq!(paid.status, OrderStatusType::Paid);
    assert_eq!(paid.payment_method, Some(PaymentMethod::Wechat));
    assert_eq!(paid.trade_no.as_deref(), Some("4200000001202405010000000001"));
    assert_extended_once(&env.db, user.id, before).await;
    env.tear_down().await;
}

#[actix_web::test]
async fn tampered_wechat_notification_fails() {
    let env = TestEnv::new().await;
    let (_, order) = seed(&env).await;
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;

    let mut params = wechat_notification(&order.out_trade_no, "SUCCESS");
    params.insert("total_fee".into(), "1".into());
    let (status, body) = send(&app, wechat_notify_request(&params)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(WECHAT_FAIL), "{body}");
    assert!(body.contains("Invalid signature"), "{body}");

    let (_, body) = send(&app, TestRequest::post().uri("/wechat/notify").set_payload("not xml").to_request()).await;
    assert!(body.contains(WECHAT_FAIL), "{body}");
    assert_eq!(order_status(&env.db, &order.out_trade_no).await, OrderStatusType::Pending);
    env.tear_down().await;
}

#[actix_web::test]
async fn failed_wechat_payments_do_not_settle() {
    let env = TestEnv::new().await;
    let (_, order) = seed(&env).await;
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;

    let params = wechat_notification(&order.out_trade_no, "FAIL");
    let (_, body) = send(&app, wechat_notify_request(&params)).await;
    assert!(body.contains(WECHAT_FAIL), "{body}");
    assert!(body.contains("result_code is FAIL"), "{body}");
    assert_eq!(order_status(&env.db, &order.out_trade_no).await, OrderStatusType::Pending);
    env.tear_down().await;
}

#[actix_web::test]
async fn both_providers_reporting_the_same_order_settle_it_once() {
    let env = TestEnv::new().await;
    let (user, order) = seed(&env).await;
    let app = test_app(&env, verifying_alipay(1), MockWechat::new()).await;
    let before = Utc::now();

    let alipay = send(&app, alipay_notify_request(&alipay_notification(&order.out_trade_no)));
    let wechat_req = wechat_notify_request(&wechat_notification(&order.out_trade_no, "SUCCESS"));
    let wechat = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        send(&app, wechat_req).await
    };
    let ((_, alipay_reply), (_, wechat_reply)) = futures::join!(alipay, wechat);
    assert_eq!(alipay_reply, "success");
    assert!(wechat_reply.contains(WECHAT_SUCCESS), "{wechat_reply}");

    let paid = env.db.fetch_order_by_out_trade_no(&order.out_trade_no).await.unwrap().unwrap();
    assert_eq!(paid.status, OrderStatusType::Paid);
    // The first delivery wins. The second changes nothing.
    assert_eq!(paid.payment_method, Some(PaymentMethod::Alipay));
    assert_extended_once(&env.db, user.id, before).await;
    env.tear_down().await;
}

//----------------------------------------------   Pay  ----------------------------------------------------

#[actix_web::test]
async fn alipay_pay_returns_the_checkout_url() {
    let env = TestEnv::new().await;
    let (user, order) = seed(&env).await;
    let mut alipay = MockAlipay::new();
    let expected = order.out_trade_no.clone();
    alipay
        .expect_request_payment()
        .withf(move |o, channel, _| o.out_trade_no == expected && *channel == PayChannel::Wap)
        .times(1)
        .returning(|_, _, _| Ok(PaymentRequest::Redirect { url: "https://openapi.alipay.com/gateway.do?x=1".into() }));
    let app = test_app(&env, alipay, MockWechat::new()).await;
    let body = json!({ "outTradeNo": order.out_trade_no });

    let req = TestRequest::post().uri("/alipay/pay/mobile").insert_header(bearer(user.id)).set_json(&body).to_request();
    let (status, text) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, r#"{"url":"https://openapi.alipay.com/gateway.do?x=1"}"#);

    for platform in ["tablet", "native"] {
        let uri = format!("/alipay/pay/{platform}");
        let req = TestRequest::post().uri(&uri).insert_header(bearer(user.id)).set_json(&body).to_request();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{platform}");
    }
    env.tear_down().await;
}

#[actix_web::test]
async fn wechat_pay_returns_a_qr_code() {
    let env = TestEnv::new().await;
    let (user, order) = seed(&env).await;
    let stranger = seed_user(&env.db, "mallory", Role::Member, None).await;
    let mut wechat = MockWechat::new();
    wechat
        .expect_request_payment()
        .withf(|_, channel, _| *channel == PayChannel::Native)
        .times(1)
        .returning(|o, _, _| {
            let code_url = "weixin://wxpay/bizpayurl?pr=abc".to_string();
            Ok(PaymentRequest::QrCode { code_url, out_trade_no: o.out_trade_no.clone() })
        });
    let app = test_app(&env, MockAlipay::new(), wechat).await;
    let body = json!({ "outTradeNo": order.out_trade_no });

    let req = TestRequest::post().uri("/wechat/pay").insert_header(bearer(user.id)).set_json(&body).to_request();
    let (status, text) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let reply: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(reply["codeUrl"], "weixin://wxpay/bizpayurl?pr=abc");
    assert_eq!(reply["outTradeNo"], order.out_trade_no.to_string());

    // Someone else's order does not exist, as far as the caller is concerned
    let req = TestRequest::post().uri("/wechat/pay").insert_header(bearer(stranger.id)).set_json(&body).to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    env.tear_down().await;
}

#[actix_web::test]
async fn unconfigured_providers_are_unavailable() {
    let env = TestEnv::new().await;
    let (user, order) = seed(&env).await;
    let mut wechat = MockWechat::new();
    wechat
        .expect_request_payment()
        .returning(|_, _, _| Err(ProviderError::NotConfigured("No WeChat Pay API key is configured".into())));
    let app = test_app(&env, MockAlipay::new(), wechat).await;
    let req = TestRequest::post()
        .uri("/wechat/pay")
        .insert_header(bearer(user.id))
        .set_json(json!({ "outTradeNo": order.out_trade_no }))
        .to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    env.tear_down().await;
}

//----------------------------------------------   Query  ----------------------------------------------------

#[actix_web::test]
async fn alipay_query_settles_paid_trades() {
    let env = TestEnv::new().await;
    let (user, order) = seed(&env).await;
    let mut alipay = MockAlipay::new();
    alipay.expect_payment_method().return_const(PaymentMethod::Alipay);
    alipay.expect_query_trade().times(1).returning(|_| {
        Ok(TradeQueryResult {
            trade_status: "TRADE_SUCCESS".into(),
            trade_no: Some("2024050122001404000000000009".into()),
            paid_at: Some(Utc::now()),
            paid: true,
        })
    });
    let app = test_app(&env, alipay, MockWechat::new()).await;
    let before = Utc::now();
    let body = json!({ "outTradeNo": order.out_trade_no });

    let req = TestRequest::post().uri("/alipay/query").insert_header(bearer(user.id)).set_json(&body).to_request();
    let (status, text) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK, "{text}");
    let reply: TradeQueryResponse = serde_json::from_str(&text).unwrap();
    assert_eq!(reply, TradeQueryResponse { trade_status: "TRADE_SUCCESS".into(), settled: true });
    assert_extended_once(&env.db, user.id, before).await;

    // The order is final now, so there is nothing left to ask Alipay about
    let req = TestRequest::post().uri("/alipay/query").insert_header(bearer(user.id)).set_json(&body).to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    env.tear_down().await;
}

#[actix_web::test]
async fn wechat_query_leaves_unpaid_trades_pending() {
    let env = TestEnv::new().await;
    let (user, order) = seed(&env).await;
    let mut wechat = MockWechat::new();
    wechat.expect_payment_method().return_const(PaymentMethod::Wechat);
    wechat.expect_query_trade().times(1).returning(|_| Ok(TradeQueryResult::unpaid("NOTPAY")));
    let app = test_app(&env, MockAlipay::new(), wechat).await;

    let req = TestRequest::post()
        .uri("/wechat/query")
        .insert_header(bearer(user.id))
        .set_json(json!({ "outTradeNo": order.out_trade_no }))
        .to_request();
    let (status, text) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let reply: TradeQueryResponse = serde_json::from_str(&text).unwrap();
    assert_eq!(reply, TradeQueryResponse { trade_status: "NOTPAY".into(), settled: false });
    assert_eq!(order_status(&env.db, &order.out_trade_no).await, OrderStatusType::Pending);
    env.tear_down().await;
}

#[actix_web::test]
async fn provider_outages_are_bad_gateways() {
    let env = TestEnv::new().await;
    let (user, order) = seed(&env).await;
    let mut alipay = MockAlipay::new();
    alipay.expect_payment_method().return_const(PaymentMethod::Alipay);
    alipay.expect_query_trade().returning(|_| Err(ProviderError::RequestFailed("connection refused".into())));
    let app = test_app(&env, alipay, MockWechat::new()).await;
    let req = TestRequest::post()
        .uri("/alipay/query")
        .insert_header(bearer(user.id))
        .set_json(json!({ "outTradeNo": order.out_trade_no }))
        .to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(order_status(&env.db, &order.out_trade_no).await, OrderStatusType::Pending);
    env.tear_down().await;
}
