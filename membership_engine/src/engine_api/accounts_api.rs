//! Read-only access to users and their orders.

use std::fmt::Debug;

use log::trace;

use crate::{
    db_types::{Order, OrderStatusType, OutTradeNo, User},
    traits::{AccountApiError, AccountManagement, OrderPage, OrderQueryFilter, Pagination},
};

pub struct AccountApi<B> {
    db: B,
}

impl<B: Debug> Debug for AccountApi<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccountApi ({:?})", self.db)
    }
}

impl<B> AccountApi<B>
where B: AccountManagement
{
    pub fn new(db: B) -> Self {
        Self { db }
    }

    pub async fn user(&self, user_id: i64) -> Result<Option<User>, AccountApiError> {
        self.db.fetch_user(user_id).await
    }

    /// Fetches a page of the user's orders, newest first, optionally restricted to a single status.
    pub async fn orders_for_user(
        &self,
        user_id: i64,
        status: Option<OrderStatusType>,
        pagination: Pagination,
    ) -> Result<OrderPage, AccountApiError> {
        let mut query = OrderQueryFilter::default().with_user_id(user_id).with_pagination(pagination);
        if let Some(status) = status {
            query = query.with_status(status);
        }
        let page = self.db.search_orders(query).await?;
        trace!("Fetched {} of {} orders for user #{user_id}", page.orders.len(), page.total);
        Ok(page)
    }

    /// Fetches the order with the given reference, but only if it belongs to the user.
    pub async fn order_for_user(
        &self,
        user_id: i64,
        out_trade_no: &OutTradeNo,
    ) -> Result<Option<Order>, AccountApiError> {
        let order = self.db.fetch_order_by_out_trade_no(out_trade_no).await?;
        Ok(order.filter(|o| o.user_id == user_id))
    }
}
