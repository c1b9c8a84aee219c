use actix_web::{
    http::{header, StatusCode},
    test::{self, TestRequest},
};
use chrono::{TimeZone, Utc};
use membership_engine::{
    db_types::{MonthlyStats, Role},
    test_utils::fixtures::{seed_membership, seed_user, seed_user_created_at},
};
use serde_json::json;

use super::{
    helpers::{bearer, issue_token, next_chunk, send, test_app, TestEnv},
    mocks::{MockAlipay, MockWechat},
};

#[actix_web::test]
async fn charts_are_for_admins_only() {
    let env = TestEnv::new().await;
    let member = seed_user(&env.db, "alice", Role::Member, None).await;
    let premium = seed_user(&env.db, "bob", Role::Premium, None).await;
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;

    for user in [&member, &premium] {
        let req = TestRequest::get().uri("/admin/charts/order").insert_header(bearer(user.id)).to_request();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{body}");
        let req = TestRequest::get().uri("/admin/charts/stream/order").insert_header(bearer(user.id)).to_request();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
    // A valid token for an account that does not exist
    let req = TestRequest::get().uri("/admin/charts/order").insert_header(bearer(premium.id + 100)).to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    env.tear_down().await;
}

#[actix_web::test]
async fn admins_get_monthly_counts() {
    let env = TestEnv::new().await;
    seed_user_created_at(&env.db, "early", Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()).await;
    seed_user_created_at(&env.db, "early2", Utc.with_ymd_and_hms(2024, 3, 31, 23, 0, 0).unwrap()).await;
    seed_user_created_at(&env.db, "later", Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()).await;
    let admin = seed_user(&env.db, "root", Role::Admin, None).await;
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;

    let req = TestRequest::get().uri("/admin/charts/user").insert_header(bearer(admin.id)).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let stats: MonthlyStats = serde_json::from_str(&body).unwrap();
    assert_eq!(stats.months[..2], ["2024-03".to_string(), "2024-05".to_string()]);
    assert_eq!(stats.values[..2], [2, 1]);
    assert_eq!(stats.total(), 4);

    let req = TestRequest::get().uri("/admin/charts/order").insert_header(bearer(admin.id)).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"months":[],"values":[]}"#);

    let req = TestRequest::get().uri("/admin/charts/revenue").insert_header(bearer(admin.id)).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Invalid stats type: revenue"), "{body}");
    env.tear_down().await;
}

#[actix_web::test]
async fn chart_stream_pushes_updates() {
    let env = TestEnv::new().await;
    let admin = seed_user(&env.db, "root", Role::Admin, None).await;
    let alice = seed_user(&env.db, "alice", Role::Member, None).await;
    let monthly = seed_membership(&env.db, "Monthly", 1500, 1).await;
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;

    // EventSource cannot send headers, so the token goes in the query string
    let uri = format!("/admin/charts/stream/order?token={}", issue_token(admin.id));
    let res = test::call_service(&app, TestRequest::get().uri(&uri).to_request()).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers().get(header::CONTENT_TYPE).unwrap(), "text/event-stream");
    let mut body = Box::pin(res.into_body());
    let initial = next_chunk(&mut body).await.expect("No initial frame");
    assert_eq!(initial, "data: {\"months\":[],\"values\":[]}\n\n");
    assert_eq!(env.broadcaster.subscriber_count(membership_engine::db_types::StatsType::Order), 1);

    let req = TestRequest::post()
        .uri("/orders")
        .insert_header(bearer(alice.id))
        .set_json(json!({ "membershipId": monthly.id }))
        .to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);

    let update = next_chunk(&mut body).await.expect("No update after the order was created");
    let text = String::from_utf8_lossy(&update);
    let json = text.strip_prefix("data: ").and_then(|s| s.strip_suffix("\n\n")).expect("Not an SSE frame");
    let stats: MonthlyStats = serde_json::from_str(json).unwrap();
    assert_eq!(stats.months, vec![Utc::now().format("%Y-%m").to_string()]);
    assert_eq!(stats.values, vec![1]);

    drop(body);
    env.tear_down().await;
}
