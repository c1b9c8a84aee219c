use log::trace;
use sqlx::SqliteConnection;

use crate::db_types::{MonthlyStats, StatsType};

fn table_for(stats_type: StatsType) -> &'static str {
    match stats_type {
        StatsType::Order => "orders",
        StatsType::User => "users",
    }
}

/// Counts the rows of the table behind `stats_type` per calendar month of `created_at`, oldest month first.
/// Months without any rows are omitted.
pub async fn monthly_counts(stats_type: StatsType, conn: &mut SqliteConnection) -> Result<MonthlyStats, sqlx::Error> {
    let table = table_for(stats_type);
    let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
        r#"
            SELECT strftime('%Y-%m', created_at) AS month, COUNT(*) AS total
            FROM {table}
            WHERE strftime('%Y-%m', created_at) IS NOT NULL
            GROUP BY month
            ORDER BY month ASC;
        "#
    ))
    .fetch_all(conn)
    .await?;
    trace!("🗃️ {} months of {stats_type} statistics", rows.len());
    Ok(rows.into_iter().collect())
}
