use serde::{Deserialize, Serialize};

use crate::db_types::{Order, User};

/// A new pending order has been stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub order: Order,
}

impl OrderCreatedEvent {
    pub fn new(order: Order) -> Self {
        Self { order }
    }
}

/// An order has been settled and its owner's membership extended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPaidEvent {
    pub order: Order,
    pub user: User,
}

impl OrderPaidEvent {
    pub fn new(order: Order, user: User) -> Self {
        Self { order, user }
    }
}

/// A page of stale orders has been expired by the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrdersExpiredEvent {
    pub order_ids: Vec<i64>,
}

impl OrdersExpiredEvent {
    pub fn new(order_ids: Vec<i64>) -> Self {
        Self { order_ids }
    }
}
