//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use fulfillment::{FulfillmentWebhookConfig, LifecycleConfig, PaymentWebhookAuth, RetryConfig};
use providers::{BreakerConfig, FulfillmentClientConfig, PaymentClientConfig, ShippingRules};

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`, `RUST_LOG`: bind address, listen port, tracing filter
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory store when unset
/// - `PAYMENT_API_BASE`, `PAYMENT_SECRET_KEY`: hosted checkout API
/// - `PAYMENT_WEBHOOK_SECRET`: signing secret; `PAYMENT_WEBHOOK_TOKEN` is
///   the `?token=` fallback used only when no secret is set
/// - `FULFILLMENT_API_BASE`, `FULFILLMENT_API_KEY`: print-on-demand API
/// - `FULFILLMENT_WEBHOOK_TOKEN`: path token for fulfillment webhooks
/// - `CHECKOUT_SUCCESS_URL`, `CHECKOUT_CANCEL_URL`: checkout redirects
/// - `SHIPPING_COUNTRIES`, `SHIPPING_RATE_IDS`: comma-separated lists
/// - `BREAKER_MAX_FAILURES`, `BREAKER_RESET_TIMEOUT_SECS`, `BREAKER_HALF_OPEN_MAX`
/// - `PROVIDER_TIMEOUT_SECS`, `REQUEST_TIMEOUT_SECS`
/// - `RETRY_INTERVAL_SECS`, `RETRY_MAX_ATTEMPTS`, `FULFILLMENT_AUTO_CONFIRM`
/// - `ADMIN_TOKEN`: bearer token for `/admin`; admin routes refuse every
///   request when unset
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,

    pub payment_api_base: String,
    pub payment_secret_key: String,
    pub payment_webhook_secret: Option<String>,
    pub payment_webhook_token: Option<String>,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub shipping_countries: Vec<String>,
    pub shipping_rate_ids: Vec<String>,

    pub fulfillment_api_base: String,
    pub fulfillment_api_key: String,
    pub fulfillment_webhook_token: String,
    pub auto_confirm: bool,

    pub breaker_max_failures: u32,
    pub breaker_reset_timeout: Duration,
    pub breaker_half_open_max: u32,
    pub provider_timeout: Duration,
    pub request_timeout: Duration,

    pub retry_interval: Duration,
    pub retry_max_attempts: u32,

    pub admin_token: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &str, default: Duration| {
            parse(get(key)).map(Duration::from_secs).unwrap_or(default)
        };

        Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse(get("PORT")).unwrap_or(defaults.port),
            log_level: get("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: get("DATABASE_URL"),

            payment_api_base: get("PAYMENT_API_BASE").unwrap_or(defaults.payment_api_base),
            payment_secret_key: get("PAYMENT_SECRET_KEY").unwrap_or_default(),
            payment_webhook_secret: get("PAYMENT_WEBHOOK_SECRET"),
            payment_webhook_token: get("PAYMENT_WEBHOOK_TOKEN"),
            checkout_success_url: get("CHECKOUT_SUCCESS_URL")
                .unwrap_or(defaults.checkout_success_url),
            checkout_cancel_url: get("CHECKOUT_CANCEL_URL").unwrap_or(defaults.checkout_cancel_url),
            shipping_countries: get("SHIPPING_COUNTRIES")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.shipping_countries),
            shipping_rate_ids: get("SHIPPING_RATE_IDS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),

            fulfillment_api_base: get("FULFILLMENT_API_BASE")
                .unwrap_or(defaults.fulfillment_api_base),
            fulfillment_api_key: get("FULFILLMENT_API_KEY").unwrap_or_default(),
            fulfillment_webhook_token: get("FULFILLMENT_WEBHOOK_TOKEN").unwrap_or_default(),
            auto_confirm: get("FULFILLMENT_AUTO_CONFIRM")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.auto_confirm),

            breaker_max_failures: parse(get("BREAKER_MAX_FAILURES"))
                .unwrap_or(defaults.breaker_max_failures),
            breaker_reset_timeout: secs("BREAKER_RESET_TIMEOUT_SECS", defaults.breaker_reset_timeout),
            breaker_half_open_max: parse(get("BREAKER_HALF_OPEN_MAX"))
                .unwrap_or(defaults.breaker_half_open_max),
            provider_timeout: secs("PROVIDER_TIMEOUT_SECS", defaults.provider_timeout),
            request_timeout: secs("REQUEST_TIMEOUT_SECS", defaults.request_timeout),

            retry_interval: secs("RETRY_INTERVAL_SECS", defaults.retry_interval),
            retry_max_attempts: parse(get("RETRY_MAX_ATTEMPTS")).unwrap_or(defaults.retry_max_attempts),

            admin_token: get("ADMIN_TOKEN"),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            max_failures: self.breaker_max_failures,
            reset_timeout: self.breaker_reset_timeout,
            half_open_max_requests: self.breaker_half_open_max,
        }
    }

    pub fn payment_client(&self) -> PaymentClientConfig {
        PaymentClientConfig {
            base_url: self.payment_api_base.clone(),
            secret_key: self.payment_secret_key.clone(),
            success_url: self.checkout_success_url.clone(),
            cancel_url: self.checkout_cancel_url.clone(),
            timeout: self.provider_timeout,
        }
    }

    pub fn fulfillment_client(&self) -> FulfillmentClientConfig {
        FulfillmentClientConfig {
            base_url: self.fulfillment_api_base.clone(),
            api_key: self.fulfillment_api_key.clone(),
            timeout: self.provider_timeout,
        }
    }

    pub fn shipping_rules(&self) -> ShippingRules {
        ShippingRules {
            allowed_countries: self.shipping_countries.clone(),
            shipping_rate_ids: self.shipping_rate_ids.clone(),
        }
    }

    pub fn payment_webhook_auth(&self) -> PaymentWebhookAuth {
        PaymentWebhookAuth::from_settings(
            self.payment_webhook_secret.clone(),
            self.payment_webhook_token.clone(),
        )
    }

    pub fn fulfillment_webhook(&self) -> FulfillmentWebhookConfig {
        FulfillmentWebhookConfig::new(self.fulfillment_webhook_token.clone())
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            max_attempts: self.retry_max_attempts,
            auto_confirm: self.auto_confirm,
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            interval: self.retry_interval,
            ..RetryConfig::default()
        }
    }
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        let breaker = BreakerConfig::default();
        let lifecycle = LifecycleConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,

            payment_api_base: "https://api.stripe.com".to_string(),
            payment_secret_key: String::new(),
            payment_webhook_secret: None,
            payment_webhook_token: None,
            checkout_success_url: "http://localhost:3000/checkout/success".to_string(),
            checkout_cancel_url: "http://localhost:3000/checkout/cancel".to_string(),
            shipping_countries: vec!["US".to_string()],
            shipping_rate_ids: Vec::new(),

            fulfillment_api_base: "https://api.printful.com".to_string(),
            fulfillment_api_key: String::new(),
            fulfillment_webhook_token: String::new(),
            auto_confirm: lifecycle.auto_confirm,

            breaker_max_failures: breaker.max_failures,
            breaker_reset_timeout: breaker.reset_timeout,
            breaker_half_open_max: breaker.half_open_max_requests,
            provider_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),

            retry_interval: RetryConfig::default().interval,
            retry_max_attempts: lifecycle.max_attempts,

            admin_token: None,
        }
    }
}
