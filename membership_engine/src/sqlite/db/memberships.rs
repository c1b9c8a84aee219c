use log::debug;
use mpg_common::Amount;
use sqlx::SqliteConnection;

use crate::db_types::Membership;

pub async fn fetch_membership(id: i64, conn: &mut SqliteConnection) -> Result<Option<Membership>, sqlx::Error> {
    let membership = sqlx::query_as("SELECT id, name, price, duration_months FROM memberships WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await?;
    Ok(membership)
}

/// The catalog is maintained by the admin panel. This is used for seeding and tests.
pub async fn insert_membership(
    name: &str,
    price: Amount,
    duration_months: i64,
    conn: &mut SqliteConnection,
) -> Result<Membership, sqlx::Error> {
    let membership: Membership = sqlx::query_as(
        "INSERT INTO memberships (name, price, duration_months) VALUES ($1, $2, $3) RETURNING id, name, price, \
         duration_months",
    )
    .bind(name)
    .bind(price)
    .bind(duration_months)
    .fetch_one(conn)
    .await?;
    debug!("🗃️ Membership '{name}' ({price} for {duration_months} months) inserted with id {}", membership.id);
    Ok(membership)
}
