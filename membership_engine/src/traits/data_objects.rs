use serde::{Deserialize, Serialize};

use crate::db_types::{Order, OrderStatusType, OutTradeNo};

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// 1-based page number
    pub page: u32,
    pub page_size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, page_size: DEFAULT_PAGE_SIZE }
    }
}

impl Pagination {
    /// Builds a pagination request, clamping the values to sane bounds.
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        let page = page.unwrap_or(1).max(1);
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        Self { page, page_size }
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.page_size)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderQueryFilter {
    pub user_id: Option<i64>,
    pub out_trade_no: Option<OutTradeNo>,
    pub statuses: Vec<OrderStatusType>,
    pub pagination: Option<Pagination>,
}

impl OrderQueryFilter {
    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_out_trade_no(mut self, out_trade_no: OutTradeNo) -> Self {
        self.out_trade_no = Some(out_trade_no);
        self
    }

    pub fn with_status(mut self, status: OrderStatusType) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.out_trade_no.is_none() && self.statuses.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPage {
    pub total: i64,
    pub orders: Vec<Order>,
}
