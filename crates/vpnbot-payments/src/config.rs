//! Payments Configuration
//!
//! Read from the environment (`.env` is loaded by the server before this runs).

use crate::error::{PaymentError, Result};

/// CloudPayments API connection settings
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Public ID, the Basic-auth user
    pub public_id: String,

    /// API secret; Basic-auth password and webhook HMAC key
    pub api_secret: String,

    /// API base URL
    pub api_url: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl GatewayConfig {
    pub const DEFAULT_API_URL: &'static str = "https://api.cloudpayments.ru";

    pub fn new(public_id: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            public_id: public_id.into(),
            api_secret: api_secret.into(),
            api_url: Self::DEFAULT_API_URL.into(),
            timeout_secs: 30,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let public_id = std::env::var("CLOUDPAYMENTS_PUBLIC_ID")
            .map_err(|_| PaymentError::Config("CLOUDPAYMENTS_PUBLIC_ID not set".into()))?;
        let api_secret = std::env::var("CLOUDPAYMENTS_API_SECRET")
            .map_err(|_| PaymentError::Config("CLOUDPAYMENTS_API_SECRET not set".into()))?;

        let mut config = Self::new(public_id, api_secret);
        if let Ok(url) = std::env::var("CLOUDPAYMENTS_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(timeout) = std::env::var("CLOUDPAYMENTS_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
        {
            config.timeout_secs = timeout;
        }

        Ok(config)
    }
}

/// Settings the payment service stamps onto every new payment
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Settlement currency
    pub currency: String,

    /// Provider tag stored as the payment method
    pub provider: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            currency: "RUB".into(),
            provider: "cloudpayments".into(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            currency: std::env::var("PAYMENTS_CURRENCY").unwrap_or(defaults.currency),
            provider: std::env::var("PAYMENTS_PROVIDER").unwrap_or(defaults.provider),
        }
    }
}

/// Whether unsigned webhooks are tolerated (staging gateways only)
pub fn allow_unsigned_webhooks_from_env() -> bool {
    std::env::var("WEBHOOK_ALLOW_UNSIGNED")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
