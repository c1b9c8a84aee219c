use actix_web::{http::StatusCode, test::TestRequest};
use chrono::Utc;
use membership_engine::{
    db_types::{Order, OrderStatusType, Role},
    test_utils::fixtures::{seed_membership, seed_order, seed_user},
    traits::OrderPage,
};
use serde_json::json;

use super::{
    helpers::{bearer, send, test_app, TestEnv},
    mocks::{MockAlipay, MockWechat},
};
use crate::data_objects::NewOrderResponse;

#[actix_web::test]
async fn orders_need_a_token() {
    let env = TestEnv::new().await;
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;
    let (status, body) = send(&app, TestRequest::get().uri("/orders").to_request()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, r#"{"error":"Authentication Error. No login token was provided."}"#);
    env.tear_down().await;
}

#[actix_web::test]
async fn health_needs_no_token() {
    let env = TestEnv::new().await;
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;
    let (status, _) = send(&app, TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(status, StatusCode::OK);
    env.tear_down().await;
}

#[actix_web::test]
async fn create_list_and_fetch_orders() {
    let env = TestEnv::new().await;
    let alice = seed_user(&env.db, "alice", Role::Member, None).await;
    let monthly = seed_membership(&env.db, "Monthly", 1500, 1).await;
    let yearly = seed_membership(&env.db, "Yearly", 15000, 12).await;
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;

    let mut created = Vec::new();
    for membership in [&monthly, &yearly] {
        let req = TestRequest::post()
            .uri("/orders")
            .insert_header(bearer(alice.id))
            .set_json(json!({ "membershipId": membership.id }))
            .to_request();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let order: NewOrderResponse = serde_json::from_str(&body).expect("Not a new order response");
        created.push(order);
    }
    assert_ne!(created[0].out_trade_no, created[1].out_trade_no);

    let req = TestRequest::get().uri("/orders").insert_header(bearer(alice.id)).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let page: OrderPage = serde_json::from_str(&body).expect("Not an order page");
    assert_eq!(page.total, 2);
    assert!(page.orders.iter().all(|o| o.user_id == alice.id && o.status == OrderStatusType::Pending));

    let uri = format!("/orders/{}", created[1].out_trade_no);
    let req = TestRequest::get().uri(&uri).insert_header(bearer(alice.id)).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let order: Order = serde_json::from_str(&body).expect("Not an order");
    assert_eq!(order.id, created[1].id);
    assert_eq!(order.subject, "Yearly");
    assert_eq!(order.total_amount, yearly.price);
    assert_eq!(order.membership_months, 12);
    env.tear_down().await;
}

#[actix_web::test]
async fn orders_can_be_filtered_and_paged() {
    let env = TestEnv::new().await;
    let alice = seed_user(&env.db, "alice", Role::Member, None).await;
    let monthly = seed_membership(&env.db, "Monthly", 1500, 1).await;
    for _ in 0..3 {
        seed_order(&env.db, alice.id, &monthly, Utc::now()).await;
    }
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;

    let req = TestRequest::get().uri("/orders?page=2&pageSize=2").insert_header(bearer(alice.id)).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let page: OrderPage = serde_json::from_str(&body).unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.orders.len(), 1);

    let req = TestRequest::get().uri("/orders?status=paid").insert_header(bearer(alice.id)).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let page: OrderPage = serde_json::from_str(&body).unwrap();
    assert_eq!(page.total, 0);
    assert!(page.orders.is_empty());

    let req = TestRequest::get().uri("/orders?status=refunded").insert_header(bearer(alice.id)).to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    env.tear_down().await;
}

#[actix_web::test]
async fn other_users_orders_are_not_found() {
    let env = TestEnv::new().await;
    let alice = seed_user(&env.db, "alice", Role::Member, None).await;
    let bob = seed_user(&env.db, "bob", Role::Member, None).await;
    let monthly = seed_membership(&env.db, "Monthly", 1500, 1).await;
    let order = seed_order(&env.db, alice.id, &monthly, Utc::now()).await;
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;

    let uri = format!("/orders/{}", order.out_trade_no);
    let req = TestRequest::get().uri(&uri).insert_header(bearer(bob.id)).to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let req = TestRequest::get().uri("/orders").insert_header(bearer(bob.id)).to_request();
    let (_, body) = send(&app, req).await;
    let page: OrderPage = serde_json::from_str(&body).unwrap();
    assert_eq!(page.total, 0);
    env.tear_down().await;
}

#[actix_web::test]
async fn unknown_memberships_and_users_are_not_found() {
    let env = TestEnv::new().await;
    let alice = seed_user(&env.db, "alice", Role::Member, None).await;
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;

    let req = TestRequest::post()
        .uri("/orders")
        .insert_header(bearer(alice.id))
        .set_json(json!({ "membershipId": 404 }))
        .to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("Membership 404 does not exist"), "{body}");

    let monthly = seed_membership(&env.db, "Monthly", 1500, 1).await;
    let req = TestRequest::post()
        .uri("/orders")
        .insert_header(bearer(alice.id + 100))
        .set_json(json!({ "membershipId": monthly.id }))
        .to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    env.tear_down().await;
}
