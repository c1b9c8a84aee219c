use actix_web::{http::StatusCode, test::TestRequest};
use membership_engine::{db_types::Role, test_utils::fixtures::seed_user};

use super::{
    helpers::{issue_token, send, test_app, TestEnv},
    mocks::{MockAlipay, MockWechat},
};
use crate::{auth::JwtAuthority, config::AuthConfig};

#[actix_web::test]
async fn tokens_are_accepted_from_every_source() {
    let env = TestEnv::new().await;
    let alice = seed_user(&env.db, "alice", Role::Member, None).await;
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;
    let token = issue_token(alice.id);

    let req = TestRequest::get().uri("/orders").insert_header(("Authorization", format!("Bearer {token}")));
    let req = req.to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);

    let req = TestRequest::get().uri("/orders").insert_header(("token", token.as_str())).to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);

    let uri = format!("/orders?token={token}");
    let (status, _) = send(&app, TestRequest::get().uri(&uri).to_request()).await;
    assert_eq!(status, StatusCode::OK);
    env.tear_down().await;
}

#[actix_web::test]
async fn bad_tokens_are_rejected() {
    let env = TestEnv::new().await;
    let alice = seed_user(&env.db, "alice", Role::Member, None).await;
    let app = test_app(&env, MockAlipay::new(), MockWechat::new()).await;

    let mut tampered = issue_token(alice.id);
    tampered.replace_range(tampered.len() - 10..tampered.len() - 5, "AAAAA");
    let req = TestRequest::get().uri("/orders").insert_header(("Authorization", format!("Bearer {tampered}")));
    let req = req.to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED, "{body}");

    let foreign = JwtAuthority::new(&AuthConfig::new("someone-elses-secret"))
        .issue(alice.id, chrono::Duration::hours(1))
        .unwrap();
    let req = TestRequest::get().uri("/orders").insert_header(("Authorization", format!("Bearer {foreign}")));
    let req = req.to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = TestRequest::get().uri("/orders").insert_header(("Authorization", "Bearer not-a-jwt")).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Login token is not in the correct format"), "{body}");
    env.tear_down().await;
}
