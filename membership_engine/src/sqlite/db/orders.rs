use chrono::{DateTime, Utc};
use log::{debug, trace};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use crate::{
    db_types::{NewOrder, Order, OrderStatusType, OutTradeNo, Settlement},
    traits::{OrderPage, OrderQueryFilter, PaymentGatewayError},
};

/// Inserts a new order into the database using the given connection. This is not atomic. You can embed this call
/// inside a transaction if you need to ensure atomicity, and pass `&mut tx` as the connection argument.
///
/// New orders are always `Pending`.
pub async fn insert_order(order: NewOrder, conn: &mut SqliteConnection) -> Result<Order, PaymentGatewayError> {
    let order: Order = sqlx::query_as(
        r#"
            INSERT INTO orders (
                out_trade_no,
                user_id,
                subject,
                total_amount,
                membership_months,
                status,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING *;
        "#,
    )
    .bind(order.out_trade_no)
    .bind(order.user_id)
    .bind(order.subject)
    .bind(order.total_amount)
    .bind(order.membership_months)
    .bind(OrderStatusType::Pending)
    .bind(order.created_at)
    .fetch_one(conn)
    .await?;
    debug!("🗃️ Order [{}] inserted with id {}", order.out_trade_no, order.id);
    Ok(order)
}

pub async fn fetch_order_by_out_trade_no(
    out_trade_no: &OutTradeNo,
    conn: &mut SqliteConnection,
) -> Result<Option<Order>, sqlx::Error> {
    let order = sqlx::query_as("SELECT * FROM orders WHERE out_trade_no = $1")
        .bind(out_trade_no.as_str())
        .fetch_optional(conn)
        .await?;
    Ok(order)
}

pub async fn fetch_order_by_id(id: i64, conn: &mut SqliteConnection) -> Result<Option<Order>, sqlx::Error> {
    let order = sqlx::query_as("SELECT * FROM orders WHERE id = $1").bind(id).fetch_optional(conn).await?;
    Ok(order)
}

/// Locks the order for the remainder of the current transaction and returns it.
///
/// SQLite has no `SELECT ... FOR UPDATE`. Instead, the row is touched with a no-op write, which takes the database
/// write lock before anything is read. Any other writer blocks (up to the busy timeout) until this transaction ends.
/// This MUST be the first statement in the transaction, otherwise SQLite cannot retry a busy lock for us.
pub async fn lock_order_by_out_trade_no(
    out_trade_no: &OutTradeNo,
    conn: &mut SqliteConnection,
) -> Result<Option<Order>, sqlx::Error> {
    let order = sqlx::query_as("UPDATE orders SET status = status WHERE out_trade_no = $1 RETURNING *")
        .bind(out_trade_no.as_str())
        .fetch_optional(conn)
        .await?;
    Ok(order)
}

/// Moves a pending order to `Paid`, recording the provider's settlement details in the same statement.
///
/// Returns `None` if the order is not `Pending`. The caller is expected to hold the lock on the order.
pub(crate) async fn mark_paid(
    id: i64,
    settlement: &Settlement,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Option<Order>, sqlx::Error> {
    let order = sqlx::query_as(
        r#"
            UPDATE orders SET
                status = $1,
                trade_no = $2,
                payment_method = $3,
                paid_at = $4,
                updated_at = $5
            WHERE id = $6 AND status = $7
            RETURNING *;
        "#,
    )
    .bind(OrderStatusType::Paid)
    .bind(settlement.trade_no.as_str())
    .bind(settlement.payment_method)
    .bind(settlement.paid_at)
    .bind(now)
    .bind(id)
    .bind(OrderStatusType::Pending)
    .fetch_optional(conn)
    .await?;
    Ok(order)
}

/// Locks up to `limit` pending orders that were created strictly before `cutoff` and have an id greater than
/// `after_id`. Returns their ids in ascending order.
///
/// The selection and the lock happen in a single statement. As with [`lock_order_by_out_trade_no`], this must be the
/// first statement of the transaction.
pub(crate) async fn lock_stale_pending_orders(
    cutoff: DateTime<Utc>,
    after_id: i64,
    limit: i64,
    conn: &mut SqliteConnection,
) -> Result<Vec<i64>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
            UPDATE orders SET status = status
            WHERE id IN (
                SELECT id FROM orders
                WHERE status = $1 AND julianday(created_at) < julianday($2) AND id > $3
                ORDER BY id ASC
                LIMIT $4
            )
            RETURNING id;
        "#,
    )
    .bind(OrderStatusType::Pending)
    .bind(cutoff)
    .bind(after_id)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    let mut ids = rows.iter().map(|r| r.try_get::<i64, _>("id")).collect::<Result<Vec<i64>, _>>()?;
    ids.sort_unstable();
    trace!("🗃️ Locked {} stale orders after id {after_id}", ids.len());
    Ok(ids)
}

/// Marks the given orders as `Expired`, but only those that are still `Pending`. Settled orders are never clobbered.
/// Returns the number of orders that changed.
pub(crate) async fn expire_orders(
    ids: &[i64],
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<u64, sqlx::Error> {
    if ids.is_empty() {
        return Ok(0);
    }
    let mut builder = QueryBuilder::<Sqlite>::new("UPDATE orders SET status = ");
    builder.push_bind(OrderStatusType::Expired);
    builder.push(", updated_at = ");
    builder.push_bind(now);
    builder.push(" WHERE status = ");
    builder.push_bind(OrderStatusType::Pending);
    builder.push(" AND id IN (");
    let mut id_list = builder.separated(", ");
    for id in ids {
        id_list.push_bind(*id);
    }
    builder.push(")");
    trace!("🗃️ Executing query: {}", builder.sql());
    let result = builder.build().execute(conn).await?;
    Ok(result.rows_affected())
}

fn push_filter<'a>(builder: &mut QueryBuilder<'a, Sqlite>, query: &'a OrderQueryFilter) {
    if query.is_empty() {
        return;
    }
    builder.push(" WHERE ");
    let mut where_clause = builder.separated(" AND ");
    if let Some(user_id) = query.user_id {
        where_clause.push("user_id = ");
        where_clause.push_bind_unseparated(user_id);
    }
    if let Some(out_trade_no) = &query.out_trade_no {
        where_clause.push("out_trade_no = ");
        where_clause.push_bind_unseparated(out_trade_no.as_str());
    }
    if !query.statuses.is_empty() {
        where_clause.push("status IN (");
        for (i, status) in query.statuses.iter().enumerate() {
            if i > 0 {
                where_clause.push_unseparated(", ");
            }
            where_clause.push_bind_unseparated(*status);
        }
        where_clause.push_unseparated(")");
    }
}

/// Fetches orders according to criteria specified in the `OrderQueryFilter`
///
/// Resulting orders are ordered by `created_at` in descending order (newest first). The total count ignores
/// pagination.
pub async fn search_orders(query: OrderQueryFilter, conn: &mut SqliteConnection) -> Result<OrderPage, sqlx::Error> {
    let mut count = QueryBuilder::new("SELECT COUNT(*) FROM orders");
    push_filter(&mut count, &query);
    let total: i64 = count.build_query_scalar().fetch_one(&mut *conn).await?;

    let mut builder = QueryBuilder::new("SELECT * FROM orders");
    push_filter(&mut builder, &query);
    builder.push(" ORDER BY created_at DESC, id DESC");
    if let Some(page) = query.pagination {
        builder.push(" LIMIT ");
        builder.push_bind(page.limit());
        builder.push(" OFFSET ");
        builder.push_bind(page.offset());
    }
    trace!("🗃️ Executing query: {}", builder.sql());
    let orders = builder.build_query_as::<Order>().fetch_all(conn).await?;
    trace!("🗃️ Result of search_orders: {} of {total}", orders.len());
    Ok(OrderPage { total, orders })
}
