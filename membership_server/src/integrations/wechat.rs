//! WeChat Pay (API v2) client.
//!
//! Messages in both directions are flat XML documents. Each is signed with HMAC-SHA256 over the sorted
//! `key=value` pairs followed by `&key=<merchant API key>`, and the signature travels in the `sign` element as upper
//! case hex.
use std::{collections::BTreeMap, net::IpAddr};

use hmac::{Hmac, Mac};
use log::*;
use chrono::Utc;
use membership_engine::db_types::{Order, OutTradeNo, PaymentMethod, Settlement};
use mpg_common::Secret;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use regex::Regex;
use sha2::Sha256;

use super::{parse_china_time, signing_content, PayChannel, PaymentProvider, PaymentRequest, ProviderError, TradeQueryResult};
use crate::config::WechatConfig;

type HmacSha256 = Hmac<Sha256>;

pub const WECHAT_TIME_FORMAT: &str = "%Y%m%d%H%M%S";
pub const SIGN_TYPE: &str = "HMAC-SHA256";
const SUCCESS: &str = "SUCCESS";

#[derive(Clone)]
pub struct WechatClient {
    config: WechatConfig,
    http: reqwest::Client,
}

impl WechatClient {
    pub fn new(config: WechatConfig) -> Self {
        if config.mch_id.is_empty() || config.app_id.is_empty() {
            warn!("💳️ WeChat Pay app id or merchant id is not set. WeChat payments will fail.");
        }
        Self { config, http: reqwest::Client::new() }
    }

    pub fn api_key(&self) -> &Secret<String> {
        &self.config.api_key
    }

    fn signed(&self, mut params: BTreeMap<String, String>) -> Result<BTreeMap<String, String>, ProviderError> {
        params.insert("sign_type".to_string(), SIGN_TYPE.to_string());
        let sign = sign(&params, &self.config.api_key)?;
        params.insert("sign".to_string(), sign);
        Ok(params)
    }

    fn base_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("appid".to_string(), self.config.app_id.clone());
        params.insert("mch_id".to_string(), self.config.mch_id.clone());
        params.insert("nonce_str".to_string(), nonce());
        params
    }

    /// Posts a signed request and returns the verified response fields. A `return_code` other than `SUCCESS` is a
    /// communication failure and carries no signature.
    async fn call(&self, path: &str, params: BTreeMap<String, String>) -> Result<BTreeMap<String, String>, ProviderError> {
        let body = to_xml(&self.signed(params)?);
        let url = format!("{}/{}", self.config.api_base.trim_end_matches('/'), path.trim_start_matches('/'));
        trace!("💳️ Calling WeChat Pay at {url}");
        let text = self.http.post(&url).header("Content-Type", "text/xml").body(body).send().await?.text().await?;
        let response = parse_xml(&text)?;
        if response.get("return_code").map(String::as_str) != Some(SUCCESS) {
            let msg = response.get("return_msg").cloned().unwrap_or_default();
            return Err(ProviderError::Rejected(format!("WeChat Pay could not process {path}: {msg}")));
        }
        verify(&response, &self.config.api_key)?;
        Ok(response)
    }
}

impl PaymentProvider for WechatClient {
    fn payment_method(&self) -> PaymentMethod {
        PaymentMethod::Wechat
    }

    fn verify_notification(&self, params: &BTreeMap<String, String>) -> Result<(), ProviderError> {
        verify(params, &self.config.api_key)
    }

    async fn query_trade(&self, out_trade_no: &OutTradeNo) -> Result<TradeQueryResult, ProviderError> {
        let mut params = self.base_params();
        params.insert("out_trade_no".to_string(), out_trade_no.as_str().to_string());
        let response = self.call("pay/orderquery", params).await?;
        parse_query_response(&response)
    }

    async fn request_payment(
        &self,
        order: &Order,
        channel: PayChannel,
        client_ip: IpAddr,
    ) -> Result<PaymentRequest, ProviderError> {
        if channel != PayChannel::Native {
            return Err(ProviderError::UnsupportedChannel(channel));
        }
        let mut params = self.base_params();
        params.insert("body".to_string(), order.subject.clone());
        params.insert("out_trade_no".to_string(), order.out_trade_no.as_str().to_string());
        params.insert("total_fee".to_string(), order.total_amount.fen().to_string());
        params.insert("spbill_create_ip".to_string(), client_ip.to_string());
        params.insert("notify_url".to_string(), self.config.notify_url.clone());
        params.insert("trade_type".to_string(), "NATIVE".to_string());
        params.insert("product_id".to_string(), order.out_trade_no.as_str().to_string());
        let response = self.call("pay/unifiedorder", params).await?;
        if response.get("result_code").map(String::as_str) != Some(SUCCESS) {
            let msg = response.get("err_code_des").or_else(|| response.get("err_code")).cloned().unwrap_or_default();
            return Err(ProviderError::Rejected(format!("Unified order for {} failed: {msg}", order.out_trade_no)));
        }
        let code_url = response
            .get("code_url")
            .cloned()
            .ok_or_else(|| ProviderError::MalformedMessage("Unified order response has no code_url".into()))?;
        debug!("💳️ WeChat Pay QR code created for order {}", order.out_trade_no);
        Ok(PaymentRequest::QrCode { code_url, out_trade_no: order.out_trade_no.clone() })
    }
}

/// Interprets a verified `orderquery` response.
pub fn parse_query_response(response: &BTreeMap<String, String>) -> Result<TradeQueryResult, ProviderError> {
    if response.get("result_code").map(String::as_str) != Some(SUCCESS) {
        let status = response.get("err_code").cloned().unwrap_or_else(|| "ORDERNOTEXIST".to_string());
        return Ok(TradeQueryResult::unpaid(&status));
    }
    let trade_status = response
        .get("trade_state")
        .cloned()
        .ok_or_else(|| ProviderError::MalformedMessage("No trade_state in the response".into()))?;
    let paid = trade_status == SUCCESS;
    let paid_at = response.get("time_end").and_then(|t| parse_china_time(t, WECHAT_TIME_FORMAT));
    Ok(TradeQueryResult { trade_status, trade_no: response.get("transaction_id").cloned(), paid_at, paid })
}

/// Reads the settlement out of a verified payment notification. Only notifications that report a successful
/// payment (`return_code` and `result_code` both `SUCCESS`) carry one.
pub fn notification_settlement(params: &BTreeMap<String, String>) -> Result<Settlement, ProviderError> {
    let field = |name: &str| {
        params
            .get(name)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| ProviderError::MalformedMessage(format!("WeChat Pay notification has no {name}")))
    };
    let return_code = field("return_code")?;
    if return_code != SUCCESS {
        let msg = params.get("return_msg").cloned().unwrap_or_default();
        return Err(ProviderError::Rejected(format!("return_code is {return_code}. {msg}")));
    }
    let result_code = field("result_code")?;
    if result_code != SUCCESS {
        let msg = params.get("err_code_des").or_else(|| params.get("err_code")).cloned().unwrap_or_default();
        return Err(ProviderError::Rejected(format!("result_code is {result_code}. {msg}")));
    }
    let out_trade_no = OutTradeNo(field("out_trade_no")?);
    let trade_no = field("transaction_id")?;
    let paid_at = params.get("time_end").and_then(|t| parse_china_time(t, WECHAT_TIME_FORMAT)).unwrap_or_else(|| {
        warn!("💳️ WeChat Pay notification for {out_trade_no} has no usable time_end. Using the current time.");
        Utc::now()
    });
    Ok(Settlement { out_trade_no, trade_no, payment_method: PaymentMethod::Wechat, paid_at })
}

fn mac_for(params: &BTreeMap<String, String>, key: &Secret<String>) -> Result<HmacSha256, ProviderError> {
    if key.reveal().is_empty() {
        return Err(ProviderError::NotConfigured("No WeChat Pay API key is configured".into()));
    }
    let content = format!("{}&key={}", signing_content(params, &["sign"]), key.reveal());
    let mut mac = HmacSha256::new_from_slice(key.reveal().as_bytes())
        .map_err(|e| ProviderError::NotConfigured(format!("Unusable WeChat Pay API key. {e}")))?;
    mac.update(content.as_bytes());
    Ok(mac)
}

pub fn sign(params: &BTreeMap<String, String>, key: &Secret<String>) -> Result<String, ProviderError> {
    let mac = mac_for(params, key)?;
    Ok(hex::encode_upper(mac.finalize().into_bytes()))
}

pub fn verify(params: &BTreeMap<String, String>, key: &Secret<String>) -> Result<(), ProviderError> {
    let sign = params.get("sign").ok_or_else(|| ProviderError::InvalidSignature("No sign element".into()))?;
    if let Some(sign_type) = params.get("sign_type") {
        if sign_type != SIGN_TYPE {
            return Err(ProviderError::InvalidSignature(format!("Unsupported sign_type {sign_type}")));
        }
    }
    let expected = hex::decode(sign.trim())
        .map_err(|e| ProviderError::InvalidSignature(format!("The signature is not hex. {e}")))?;
    mac_for(params, key)?
        .verify_slice(&expected)
        .map_err(|_| ProviderError::InvalidSignature("Signature mismatch".into()))
}

/// Parses a flat `<xml><key>value</key>...</xml>` document. Values may be wrapped in CDATA sections.
pub fn parse_xml(xml: &str) -> Result<BTreeMap<String, String>, ProviderError> {
    let body = xml.trim();
    let inner = body
        .strip_prefix("<xml>")
        .and_then(|s| s.strip_suffix("</xml>"))
        .ok_or_else(|| ProviderError::MalformedMessage("The document is not wrapped in <xml>".into()))?;
    let re = Regex::new(r"(?s)<([A-Za-z0-9_]+)>(?:<!\[CDATA\[(.*?)\]\]>|([^<]*))</([A-Za-z0-9_]+)>")
        .map_err(|e| ProviderError::MalformedMessage(e.to_string()))?;
    let mut result = BTreeMap::new();
    for caps in re.captures_iter(inner) {
        let (open, close) = (&caps[1], &caps[4]);
        if open != close {
            return Err(ProviderError::MalformedMessage(format!("<{open}> is closed by </{close}>")));
        }
        let value = caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str()).unwrap_or_default();
        result.insert(open.to_string(), value.to_string());
    }
    if result.is_empty() {
        return Err(ProviderError::MalformedMessage("The document has no elements".into()));
    }
    Ok(result)
}

pub fn to_xml(params: &BTreeMap<String, String>) -> String {
    let elements = params.iter().map(|(k, v)| format!("<{k}><![CDATA[{v}]]></{k}>")).collect::<String>();
    format!("<xml>{elements}</xml>")
}

/// The acknowledgement WeChat expects in reply to a notification.
pub fn reply_xml(success: bool, message: &str) -> String {
    let code = if success { SUCCESS } else { "FAIL" };
    format!("<xml><return_code><![CDATA[{code}]]></return_code><return_msg><![CDATA[{message}]]></return_msg></xml>")
}

fn nonce() -> String {
    thread_rng().sample_iter(&Alphanumeric).take(32).map(char::from).collect()
}
