//! # Payment provider clients
//!
//! Both providers expose the same three capabilities to the rest of the server, captured by [`PaymentProvider`]:
//! * verifying the signature on an inbound notification,
//! * asking the provider for the current state of a trade, and
//! * building the request that sends the user off to pay.
//!
//! Only the minimum of each provider's wire format is implemented.
pub mod alipay;
pub mod wechat;

use std::{collections::BTreeMap, net::IpAddr, str::FromStr};

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use membership_engine::db_types::{Order, OutTradeNo, PaymentMethod, Settlement};
use serde::Serialize;
use thiserror::Error;

pub use alipay::AlipayClient;
pub use wechat::WechatClient;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("The payment provider is not configured. {0}")]
    NotConfigured(String),
    #[error("Invalid signature. {0}")]
    InvalidSignature(String),
    #[error("Malformed provider message. {0}")]
    MalformedMessage(String),
    #[error("Could not reach the payment provider. {0}")]
    RequestFailed(String),
    #[error("The payment provider rejected the request. {0}")]
    Rejected(String),
    #[error("{0} is not a supported payment channel for this provider")]
    UnsupportedChannel(PayChannel),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::RequestFailed(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayChannel {
    /// Desktop browser checkout page
    Page,
    /// Mobile browser checkout page
    Wap,
    /// A QR code the user scans with the provider's app
    Native,
}

impl FromStr for PayChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "page" | "pc" => Ok(Self::Page),
            "wap" | "mobile" => Ok(Self::Wap),
            "native" => Ok(Self::Native),
            other => Err(format!("Unknown payment platform: {other}")),
        }
    }
}

impl std::fmt::Display for PayChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayChannel::Page => write!(f, "page"),
            PayChannel::Wap => write!(f, "wap"),
            PayChannel::Native => write!(f, "native"),
        }
    }
}

/// What the client needs in order to start paying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PaymentRequest {
    /// Send the browser to this (signed) URL.
    Redirect { url: String },
    /// Render `code_url` as a QR code.
    QrCode {
        #[serde(rename = "codeUrl")]
        code_url: String,
        #[serde(rename = "outTradeNo")]
        out_trade_no: OutTradeNo,
    },
}

/// The provider's view of a trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeQueryResult {
    /// The provider's own status string, e.g. `TRADE_SUCCESS` or `NOTPAY`
    pub trade_status: String,
    pub trade_no: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    /// True if the provider considers the trade paid in full.
    pub paid: bool,
}

impl TradeQueryResult {
    pub fn unpaid(trade_status: &str) -> Self {
        Self { trade_status: trade_status.to_string(), trade_no: None, paid: false, paid_at: None }
    }

    /// The settlement to apply, if the trade has been paid. A paid trade must carry the provider's trade number.
    pub fn settlement(
        &self,
        out_trade_no: &OutTradeNo,
        payment_method: PaymentMethod,
    ) -> Result<Option<Settlement>, ProviderError> {
        if !self.paid {
            return Ok(None);
        }
        let trade_no = self
            .trade_no
            .clone()
            .ok_or_else(|| ProviderError::MalformedMessage(format!("Paid trade {out_trade_no} has no trade number")))?;
        Ok(Some(Settlement {
            out_trade_no: out_trade_no.clone(),
            trade_no,
            payment_method,
            paid_at: self.paid_at.unwrap_or_else(Utc::now),
        }))
    }
}

#[allow(async_fn_in_trait)]
pub trait PaymentProvider {
    fn payment_method(&self) -> PaymentMethod;

    /// Checks the signature on a decoded notification (form fields, query parameters or XML elements).
    fn verify_notification(&self, params: &BTreeMap<String, String>) -> Result<(), ProviderError>;

    async fn query_trade(&self, out_trade_no: &OutTradeNo) -> Result<TradeQueryResult, ProviderError>;

    async fn request_payment(
        &self,
        order: &Order,
        channel: PayChannel,
        client_ip: IpAddr,
    ) -> Result<PaymentRequest, ProviderError>;
}

/// Both providers report times as China Standard Time wall-clock values.
pub fn china_standard_time() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).unwrap_or_else(|| Utc.fix())
}

pub fn parse_china_time(value: &str, format: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), format).ok()?;
    china_standard_time().from_local_datetime(&naive).single().map(|t| t.with_timezone(&Utc))
}

pub fn format_china_time(time: DateTime<Utc>, format: &str) -> String {
    time.with_timezone(&china_standard_time()).format(format).to_string()
}

/// The `k1=v1&k2=v2` string that both providers sign: keys in ascending order, blank values and the `excluded` keys
/// left out.
pub fn signing_content(params: &BTreeMap<String, String>, excluded: &[&str]) -> String {
    params
        .iter()
        .filter(|(k, v)| !v.is_empty() && !excluded.contains(&k.as_str()))
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}
