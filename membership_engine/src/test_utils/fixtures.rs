//! Seed data for tests. Users and catalog entries are owned by other services in production, so the engine has no
//! public API for creating them.
use chrono::{DateTime, Utc};
use mpg_common::Amount;

use crate::{
    db_types::{Membership, NewOrder, Order, Role, User},
    sqlite::db::{memberships, orders, users},
    SqliteDatabase,
};

pub async fn seed_user(db: &SqliteDatabase, username: &str, role: Role, expires_at: Option<DateTime<Utc>>) -> User {
    let role = match role {
        Role::Member => 0,
        Role::Premium => 1,
        Role::Admin => Role::ADMIN_THRESHOLD,
    };
    let mut conn = db.pool().acquire().await.expect("Error acquiring connection");
    users::insert_user(username, role, expires_at, Utc::now(), &mut conn).await.expect("Error inserting user")
}

pub async fn seed_user_created_at(db: &SqliteDatabase, username: &str, created_at: DateTime<Utc>) -> User {
    let mut conn = db.pool().acquire().await.expect("Error acquiring connection");
    users::insert_user(username, 0, None, created_at, &mut conn).await.expect("Error inserting user")
}

pub async fn seed_membership(db: &SqliteDatabase, name: &str, price_fen: i64, months: i64) -> Membership {
    let mut conn = db.pool().acquire().await.expect("Error acquiring connection");
    memberships::insert_membership(name, Amount::from_fen(price_fen), months, &mut conn)
        .await
        .expect("Error inserting membership")
}

/// Inserts a pending order with an explicit creation time, bypassing the order flow (and its side effects).
pub async fn seed_order(db: &SqliteDatabase, user_id: i64, membership: &Membership, created_at: DateTime<Utc>) -> Order {
    let mut conn = db.pool().acquire().await.expect("Error acquiring connection");
    let order = NewOrder::for_membership(user_id, membership).with_created_at(created_at);
    orders::insert_order(order, &mut conn).await.expect("Error inserting order")
}
