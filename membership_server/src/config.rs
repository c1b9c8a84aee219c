use std::{env, fmt::Display, str::FromStr, time::Duration as StdDuration};

use chrono::{Duration, NaiveTime};
use log::*;
use membership_engine::{
    engine_api::expiry_api::{DEFAULT_EXPIRY_PAGE_SIZE, DEFAULT_UNPAID_ORDER_TIMEOUT_HOURS},
    queue::AmqpConfig,
};
use mpg_common::{helpers::parse_boolean_flag, Secret};
use rand::{distributions::Alphanumeric, thread_rng, Rng};

const DEFAULT_MPG_HOST: &str = "127.0.0.1";
const DEFAULT_MPG_PORT: u16 = 8360;
const DEFAULT_DATABASE_URL: &str = "sqlite://data/membership.db";
const DEFAULT_AMQP_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_AMQP_RETRY_DELAY_MS: u64 = 5000;
const DEFAULT_EXPIRY_SWEEP_TIME: &str = "00:00";
pub const DEFAULT_ALIPAY_GATEWAY: &str = "https://openapi.alipay.com/gateway.do";
pub const DEFAULT_WECHAT_API_BASE: &str = "https://api.mch.weixin.qq.com";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub auth: AuthConfig,
    /// If not set, statistics and the membership catalog are cached in-process.
    pub redis_url: Option<Secret<String>>,
    /// If not set, the expired-orders queue lives in-process.
    pub amqp: Option<AmqpConfig>,
    pub expiry: ExpiryConfig,
    pub alipay: AlipayConfig,
    pub wechat: WechatConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_MPG_HOST.to_string(),
            port: DEFAULT_MPG_PORT,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            auth: AuthConfig::default(),
            redis_url: None,
            amqp: None,
            expiry: ExpiryConfig::default(),
            alipay: AlipayConfig::default(),
            wechat: WechatConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self { host: host.to_string(), port, ..Default::default() }
    }

    pub fn from_env_or_default() -> Self {
        let host = env::var("MPG_HOST").ok().unwrap_or_else(|| DEFAULT_MPG_HOST.into());
        let port = env_or_default("MPG_PORT", DEFAULT_MPG_PORT);
        let database_url = env::var("MPG_DATABASE_URL").ok().unwrap_or_else(|| {
            warn!("🪛️ MPG_DATABASE_URL is not set. Using {DEFAULT_DATABASE_URL}");
            DEFAULT_DATABASE_URL.into()
        });
        let auth = AuthConfig::from_env_or_default();
        let redis_url = non_empty_var("MPG_REDIS_URL").map(Secret::new);
        let amqp = non_empty_var("MPG_AMQP_URL").map(|url| {
            let mut config = AmqpConfig::new(&url);
            config.retry_attempts = env_or_default("MPG_AMQP_RETRY_ATTEMPTS", DEFAULT_AMQP_RETRY_ATTEMPTS);
            let delay = env_or_default("MPG_AMQP_RETRY_DELAY_MS", DEFAULT_AMQP_RETRY_DELAY_MS);
            config.retry_delay = StdDuration::from_millis(delay);
            config
        });
        if amqp.is_none() {
            info!("🪛️ MPG_AMQP_URL is not set. Expired orders will be queued in-process.");
        }
        Self {
            host,
            port,
            database_url,
            auth,
            redis_url,
            amqp,
            expiry: ExpiryConfig::from_env_or_default(),
            alipay: AlipayConfig::from_env_or_default(),
            wechat: WechatConfig::from_env_or_default(),
        }
    }
}

//-------------------------------------------------  ExpiryConfig  -----------------------------------------------------
#[derive(Clone, Debug)]
pub struct ExpiryConfig {
    /// The time before an unpaid order is considered abandoned and marked as expired.
    pub unpaid_order_timeout: Duration,
    /// How many orders the sweep locks and expires per transaction.
    pub page_size: i64,
    /// The local (server) time of day at which the daily sweep runs.
    pub sweep_time: NaiveTime,
    pub start_consumer: bool,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            unpaid_order_timeout: Duration::hours(DEFAULT_UNPAID_ORDER_TIMEOUT_HOURS),
            page_size: DEFAULT_EXPIRY_PAGE_SIZE,
            sweep_time: NaiveTime::MIN,
            start_consumer: true,
        }
    }
}

impl ExpiryConfig {
    pub fn from_env_or_default() -> Self {
        let hours = env_or_default("MPG_UNPAID_ORDER_TIMEOUT_HOURS", DEFAULT_UNPAID_ORDER_TIMEOUT_HOURS);
        let unpaid_order_timeout = if hours > 0 {
            Duration::hours(hours)
        } else {
            warn!("🪛️ MPG_UNPAID_ORDER_TIMEOUT_HOURS must be positive. Using {DEFAULT_UNPAID_ORDER_TIMEOUT_HOURS} hrs.");
            Duration::hours(DEFAULT_UNPAID_ORDER_TIMEOUT_HOURS)
        };
        let page_size = env_or_default("MPG_EXPIRY_PAGE_SIZE", DEFAULT_EXPIRY_PAGE_SIZE).max(1);
        let sweep_time = env::var("MPG_EXPIRY_SWEEP_TIME")
            .ok()
            .and_then(|s| {
                parse_sweep_time(&s)
                    .map_err(|e| warn!("🪛️ Invalid MPG_EXPIRY_SWEEP_TIME ({s}). {e}. Using {DEFAULT_EXPIRY_SWEEP_TIME}."))
                    .ok()
            })
            .unwrap_or(NaiveTime::MIN);
        let start_consumer = parse_boolean_flag(env::var("MPG_START_EXPIRY_CONSUMER").ok(), true);
        Self { unpaid_order_timeout, page_size, sweep_time, start_consumer }
    }
}

/// Parses a `HH:MM` (or `HH:MM:SS`) time of day.
pub fn parse_sweep_time(s: &str) -> Result<NaiveTime, chrono::ParseError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M").or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
}

//-------------------------------------------------  AuthConfig  -------------------------------------------------------
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// The HS256 secret shared with the service that issues user tokens.
    pub jwt_secret: Secret<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        warn!(
            "🚨️🚨️🚨️ The JWT secret has not been set. I'm using a random value for this session. No externally issued \
             token will be accepted. DO NOT operate on production like this. 🚨️🚨️🚨️"
        );
        let secret = thread_rng().sample_iter(&Alphanumeric).take(64).map(char::from).collect::<String>();
        Self { jwt_secret: Secret::new(secret) }
    }
}

impl AuthConfig {
    pub fn new(secret: &str) -> Self {
        Self { jwt_secret: Secret::new(secret.to_string()) }
    }

    pub fn from_env_or_default() -> Self {
        match non_empty_var("MPG_JWT_SECRET") {
            Some(secret) => Self::new(&secret),
            None => Self::default(),
        }
    }
}

//-------------------------------------------------  AlipayConfig  -----------------------------------------------------
#[derive(Clone, Debug)]
pub struct AlipayConfig {
    pub app_id: String,
    /// The merchant's RSA private key, PEM or bare base64 DER (PKCS#8 or PKCS#1).
    pub private_key: Secret<String>,
    /// Alipay's RSA public key, PEM or bare base64 DER.
    pub public_key: String,
    pub gateway: String,
    pub notify_url: String,
    pub return_url: String,
    /// Where the browser is sent after the synchronous return has been processed.
    pub finish_redirect: String,
}

impl Default for AlipayConfig {
    fn default() -> Self {
        Self {
            app_id: String::default(),
            private_key: Secret::default(),
            public_key: String::default(),
            gateway: DEFAULT_ALIPAY_GATEWAY.to_string(),
            notify_url: String::default(),
            return_url: String::default(),
            finish_redirect: "/".to_string(),
        }
    }
}

impl AlipayConfig {
    pub fn from_env_or_default() -> Self {
        let defaults = Self::default();
        let app_id = non_empty_var("MPG_ALIPAY_APP_ID").unwrap_or_else(|| {
            warn!("🪛️ MPG_ALIPAY_APP_ID is not set. Alipay payments will fail.");
            String::default()
        });
        Self {
            app_id,
            private_key: Secret::new(non_empty_var("MPG_ALIPAY_PRIVATE_KEY").unwrap_or_default()),
            public_key: non_empty_var("MPG_ALIPAY_PUBLIC_KEY").unwrap_or_default(),
            gateway: non_empty_var("MPG_ALIPAY_GATEWAY").unwrap_or(defaults.gateway),
            notify_url: non_empty_var("MPG_ALIPAY_NOTIFY_URL").unwrap_or_default(),
            return_url: non_empty_var("MPG_ALIPAY_RETURN_URL").unwrap_or_default(),
            finish_redirect: non_empty_var("MPG_ALIPAY_FINISH_REDIRECT").unwrap_or(defaults.finish_redirect),
        }
    }
}

//-------------------------------------------------  WechatConfig  -----------------------------------------------------
#[derive(Clone, Debug)]
pub struct WechatConfig {
    pub app_id: String,
    pub mch_id: String,
    /// The merchant API key used to sign and verify every message.
    pub api_key: Secret<String>,
    pub notify_url: String,
    pub api_base: String,
}

impl Default for WechatConfig {
    fn default() -> Self {
        Self {
            app_id: String::default(),
            mch_id: String::default(),
            api_key: Secret::default(),
            notify_url: String::default(),
            api_base: DEFAULT_WECHAT_API_BASE.to_string(),
        }
    }
}

impl WechatConfig {
    pub fn from_env_or_default() -> Self {
        let api_key = non_empty_var("MPG_WECHAT_API_KEY").unwrap_or_else(|| {
            warn!("🪛️ MPG_WECHAT_API_KEY is not set. Every WeChat Pay notification will be rejected.");
            String::default()
        });
        Self {
            app_id: non_empty_var("MPG_WECHAT_APP_ID").unwrap_or_default(),
            mch_id: non_empty_var("MPG_WECHAT_MCH_ID").unwrap_or_default(),
            api_key: Secret::new(api_key),
            notify_url: non_empty_var("MPG_WECHAT_NOTIFY_URL").unwrap_or_default(),
            api_base: non_empty_var("MPG_WECHAT_API_BASE").unwrap_or_else(|| DEFAULT_WECHAT_API_BASE.to_string()),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Reads and parses an environment variable. A missing value silently yields the default, an invalid one logs a
/// warning first.
fn env_or_default<T>(name: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match non_empty_var(name) {
        None => default,
        Some(s) => s.parse::<T>().unwrap_or_else(|e| {
            warn!("🪛️ {s} is not a valid value for {name}. {e} Using the default, {default}, instead.");
            default
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8360);
        assert_eq!(config.database_url, "sqlite://data/membership.db");
        assert!(config.redis_url.is_none());
        assert!(config.amqp.is_none());
        assert_eq!(config.expiry.unpaid_order_timeout, Duration::hours(24));
        assert_eq!(config.expiry.page_size, 100);
        assert_eq!(config.expiry.sweep_time, NaiveTime::MIN);
        assert!(config.expiry.start_consumer);
        assert_eq!(config.alipay.gateway, DEFAULT_ALIPAY_GATEWAY);
        assert_eq!(config.alipay.finish_redirect, "/");
        assert_eq!(config.wechat.api_base, DEFAULT_WECHAT_API_BASE);
        assert_eq!(config.auth.jwt_secret.reveal().len(), 64);
    }

    #[test]
    fn secrets_stay_out_of_debug_output() {
        let mut config = ServerConfig::default();
        config.wechat.api_key = Secret::new("wechat-api-key-1234".into());
        config.auth = AuthConfig::new("jwt-secret-5678");
        let dump = format!("{config:?}");
        assert!(!dump.contains("wechat-api-key-1234"));
        assert!(!dump.contains("jwt-secret-5678"));
    }

    #[test]
    fn sweep_times() {
        assert_eq!(parse_sweep_time("00:00").unwrap(), NaiveTime::MIN);
        assert_eq!(parse_sweep_time(" 03:30 ").unwrap(), NaiveTime::from_hms_opt(3, 30, 0).unwrap());
        assert_eq!(parse_sweep_time("23:59:30").unwrap(), NaiveTime::from_hms_opt(23, 59, 30).unwrap());
        assert!(parse_sweep_time("25:00").is_err());
        assert!(parse_sweep_time("midnight").is_err());
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        env::set_var("MPG_TEST_CONFIG_PORT_VALID", "9000");
        env::set_var("MPG_TEST_CONFIG_PORT_INVALID", "ninety");
        env::set_var("MPG_TEST_CONFIG_PORT_BLANK", "  ");
        assert_eq!(env_or_default("MPG_TEST_CONFIG_PORT_VALID", 8360u16), 9000);
        assert_eq!(env_or_default("MPG_TEST_CONFIG_PORT_INVALID", 8360u16), 8360);
        assert_eq!(env_or_default("MPG_TEST_CONFIG_PORT_BLANK", 8360u16), 8360);
        assert_eq!(env_or_default("MPG_TEST_CONFIG_PORT_MISSING", 8360u16), 8360);
    }
}
