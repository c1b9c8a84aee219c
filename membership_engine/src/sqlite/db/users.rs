use chrono::{DateTime, Utc};
use log::debug;
use sqlx::SqliteConnection;

use crate::db_types::{Role, User};

const USER_COLUMNS: &str = "id, username, role, membership_expired_at, created_at";

pub async fn fetch_user(id: i64, conn: &mut SqliteConnection) -> Result<Option<User>, sqlx::Error> {
    let user = sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?;
    Ok(user)
}

/// Locks the user row for the remainder of the current transaction and returns it. See
/// [`lock_order_by_out_trade_no`](super::orders::lock_order_by_out_trade_no) for how locking works on SQLite.
pub(crate) async fn lock_user(id: i64, conn: &mut SqliteConnection) -> Result<Option<User>, sqlx::Error> {
    let user = sqlx::query_as(&format!("UPDATE users SET id = id WHERE id = $1 RETURNING {USER_COLUMNS}"))
        .bind(id)
        .fetch_optional(conn)
        .await?;
    Ok(user)
}

/// Applies the role change and new membership expiry date that follow a purchase. Only Members (stored role 0) are
/// promoted; any other stored role value is left untouched.
pub(crate) async fn apply_purchase(
    user: &User,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<User, sqlx::Error> {
    let updated: User = sqlx::query_as(&format!(
        r#"
            UPDATE users SET
                role = CASE WHEN role = 0 THEN 1 ELSE role END,
                membership_expired_at = $1,
                updated_at = $2
            WHERE id = $3
            RETURNING {USER_COLUMNS};
        "#
    ))
    .bind(expires_at)
    .bind(now)
    .bind(user.id)
    .fetch_one(conn)
    .await?;
    if updated.role != user.role {
        debug!("🗃️ User #{} has been promoted to {}", updated.id, updated.role);
    }
    Ok(updated)
}

/// Users are created by the external account service. This is used for seeding and tests.
pub async fn insert_user(
    username: &str,
    role: i64,
    membership_expired_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<User, sqlx::Error> {
    let user: User = sqlx::query_as(&format!(
        "INSERT INTO users (username, role, membership_expired_at, created_at, updated_at) VALUES ($1, $2, $3, $4, $4) \
         RETURNING {USER_COLUMNS}"
    ))
    .bind(username)
    .bind(role)
    .bind(membership_expired_at)
    .bind(created_at)
    .fetch_one(conn)
    .await?;
    debug!("🗃️ User {username} inserted with id {} and role {}", user.id, Role::from(role));
    Ok(user)
}
