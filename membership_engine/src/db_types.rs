use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
pub use mpg_common::Amount;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("Conversion error: {0}")]
pub struct ConversionError(String);

//--------------------------------------      OutTradeNo       ---------------------------------------------------------
/// The external-facing order reference that is handed to the payment providers.
///
/// It is generated exactly once, when the order is created, and is never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct OutTradeNo(pub String);

impl OutTradeNo {
    /// A fresh random reference: a v4 UUID in its 32-character simple (dash-free) form.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for OutTradeNo {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConversionError("An order reference cannot be empty".into()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for OutTradeNo {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OutTradeNo {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Display for OutTradeNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

//--------------------------------------   OrderStatusType     ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[repr(i32)]
pub enum OrderStatusType {
    /// The order has been created and is waiting for payment.
    Pending = 0,
    /// A payment provider has confirmed payment in full and the membership has been credited.
    Paid = 1,
    /// The order was not paid before the deadline and has been cancelled.
    Expired = 2,
}

impl OrderStatusType {
    /// Paid and Expired are terminal. An order in a terminal state never changes again.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl Display for OrderStatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatusType::Pending => write!(f, "Pending"),
            OrderStatusType::Paid => write!(f, "Paid"),
            OrderStatusType::Expired => write!(f, "Expired"),
        }
    }
}

impl FromStr for OrderStatusType {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" | "0" => Ok(Self::Pending),
            "paid" | "1" => Ok(Self::Paid),
            "expired" | "2" => Ok(Self::Expired),
            s => Err(ConversionError(format!("Invalid order status: {s}"))),
        }
    }
}

//--------------------------------------    PaymentMethod      ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[repr(i32)]
pub enum PaymentMethod {
    Alipay = 0,
    Wechat = 1,
}

impl Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentMethod::Alipay => write!(f, "Alipay"),
            PaymentMethod::Wechat => write!(f, "WeChat Pay"),
        }
    }
}

//--------------------------------------         Role          ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Member,
    Premium,
    Admin,
}

impl Role {
    pub const ADMIN_THRESHOLD: i64 = 100;

    /// The role a user holds after a successful membership purchase.
    pub fn after_purchase(self) -> Self {
        match self {
            Role::Member => Role::Premium,
            other => other,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl From<i64> for Role {
    fn from(value: i64) -> Self {
        match value {
            1 => Role::Premium,
            v if v >= Role::ADMIN_THRESHOLD => Role::Admin,
            _ => Role::Member,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Member => write!(f, "member"),
            Role::Premium => write!(f, "premium"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

//--------------------------------------        Order          ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    pub out_trade_no: OutTradeNo,
    pub user_id: i64,
    pub subject: String,
    pub total_amount: Amount,
    pub membership_months: i64,
    pub status: OrderStatusType,
    pub payment_method: Option<PaymentMethod>,
    pub trade_no: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

//--------------------------------------       NewOrder        ---------------------------------------------------------
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub out_trade_no: OutTradeNo,
    pub user_id: i64,
    /// A human-readable label. Providers display it on the payment page.
    pub subject: String,
    pub total_amount: Amount,
    pub membership_months: i64,
    pub created_at: DateTime<Utc>,
}

impl NewOrder {
    /// A pending order for the given catalog entry with a freshly generated [`OutTradeNo`].
    pub fn for_membership(user_id: i64, membership: &Membership) -> Self {
        Self {
            out_trade_no: OutTradeNo::random(),
            user_id,
            subject: membership.name.clone(),
            total_amount: membership.price,
            membership_months: membership.duration_months.max(1),
            created_at: Utc::now(),
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

//--------------------------------------         User          ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub username: String,
    #[sqlx(try_from = "i64")]
    pub role: Role,
    pub membership_expired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

//--------------------------------------      Membership       ---------------------------------------------------------
/// A catalog entry. Memberships are immutable pricing templates and are safe to cache indefinitely.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub id: i64,
    pub name: String,
    pub price: Amount,
    pub duration_months: i64,
}

impl Membership {
    pub fn cache_key(id: i64) -> String {
        format!("membership:{id}")
    }
}

//--------------------------------------      Settlement       ---------------------------------------------------------
/// A provider's confirmation that an order has been paid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub out_trade_no: OutTradeNo,
    /// The settlement id assigned by the payment provider
    pub trade_no: String,
    pub payment_method: PaymentMethod,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// This call won the lock and performed the Pending -> Paid transition.
    Settled { order: Order, user: User },
    /// The order was already Paid or Expired. Nothing was changed.
    AlreadyFinal(Order),
}

impl SettlementOutcome {
    pub fn order(&self) -> &Order {
        match self {
            SettlementOutcome::Settled { order, .. } => order,
            SettlementOutcome::AlreadyFinal(order) => order,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, SettlementOutcome::Settled { .. })
    }
}

//--------------------------------------       StatsType       ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsType {
    Order,
    User,
}

impl StatsType {
    pub fn cache_key(&self) -> String {
        format!("stats_data_{self}")
    }
}

impl Display for StatsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsType::Order => write!(f, "order"),
            StatsType::User => write!(f, "user"),
        }
    }
}

impl FromStr for StatsType {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order" => Ok(Self::Order),
            "user" => Ok(Self::User),
            s => Err(ConversionError(format!("Invalid stats type: {s}"))),
        }
    }
}

/// Row counts bucketed by calendar month (`YYYY-MM`), oldest month first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyStats {
    pub months: Vec<String>,
    pub values: Vec<i64>,
}

impl MonthlyStats {
    pub fn total(&self) -> i64 {
        self.values.iter().sum()
    }
}

impl FromIterator<(String, i64)> for MonthlyStats {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        let (months, values) = iter.into_iter().unzip();
        Self { months, values }
    }
}
