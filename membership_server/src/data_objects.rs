use membership_engine::db_types::{Order, OutTradeNo};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderRequest {
    pub membership_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderResponse {
    pub id: i64,
    pub out_trade_no: OutTradeNo,
}

impl From<&Order> for NewOrderResponse {
    fn from(order: &Order) -> Self {
        Self { id: order.id, out_trade_no: order.out_trade_no.clone() }
    }
}

/// The body of the pay and query endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutTradeNoRequest {
    pub out_trade_no: OutTradeNo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderListQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    /// `pending`, `paid` or `expired` (or the numeric status)
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeQueryResponse {
    /// The provider's status for the trade
    pub trade_status: String,
    /// True if the order is paid once the query has been handled
    pub settled: bool,
}
