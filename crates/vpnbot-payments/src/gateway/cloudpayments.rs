//! CloudPayments Client
//!
//! Charges go to `POST {api_url}/payments/cards/charge` with HTTP Basic auth
//! (public ID / API secret). Notifications arrive as JSON and are signed with
//! the same API secret.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::Value;

use super::{ChargeOutcome, ChargeRequest, NormalizedWebhook, PaymentGateway, map_gateway_status, signature};
use crate::config::GatewayConfig;
use crate::error::{PaymentError, Result};

const CHARGE_DESCRIPTION: &str = "Оплата VPN подписки";

/// CloudPayments API client
pub struct CloudPaymentsClient {
    client: Client,
    config: GatewayConfig,
}

impl CloudPaymentsClient {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PaymentError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    fn charge_url(&self) -> String {
        format!("{}/payments/cards/charge", self.config.api_url)
    }

    fn charge_body(request: &ChargeRequest) -> Result<Value> {
        let amount = request
            .amount
            .to_f64()
            .ok_or_else(|| PaymentError::Validation(format!("amount {} out of range", request.amount)))?;

        let mut body = serde_json::json!({
            "Amount": amount,
            "Currency": request.currency,
            "InvoiceId": request.invoice_id.to_string(),
            "AccountId": request.account_id.to_string(),
            "Description": CHARGE_DESCRIPTION,
            "RequireConfirmation": false,
        });

        if let Some(email) = request.email.as_deref().filter(|e| !e.is_empty()) {
            body["Email"] = Value::from(email);
        }
        if let Some(phone) = request.phone.as_deref().filter(|p| !p.is_empty()) {
            body["Phone"] = Value::from(phone);
        }

        Ok(body)
    }
}

#[async_trait]
impl PaymentGateway for CloudPaymentsClient {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome> {
        tracing::debug!(invoice_id = request.invoice_id, amount = %request.amount, "Creating CloudPayments charge");

        let response = self
            .client
            .post(self.charge_url())
            .basic_auth(&self.config.public_id, Some(&self.config.api_secret))
            .json(&Self::charge_body(request)?)
            .send()
            .await
            .map_err(|e| PaymentError::Gateway(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Gateway(format!("HTTP {status}: {body}")));
        }

        let result: ChargeResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::Gateway(format!("invalid response: {e}")))?;

        result.into_outcome()
    }

    fn parse_notification(&self, payload: &[u8]) -> Result<NormalizedWebhook> {
        parse_notification(payload)
    }

    fn verify_signature(&self, payload: &[u8], signature: &str) -> bool {
        signature::verify(payload, signature, &self.config.api_secret)
    }

    fn name(&self) -> &str {
        "cloudpayments"
    }
}

/// Charge API response
///
/// The transaction ID is top-level in some API versions and inside `Model`
/// in others; `Model` is either the payment URL or an object carrying it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ChargeResponse {
    success: bool,

    #[serde(default)]
    message: Option<String>,

    #[serde(default)]
    transaction_id: Option<Value>,

    #[serde(default)]
    model: Option<Value>,
}

impl ChargeResponse {
    fn into_outcome(self) -> Result<ChargeOutcome> {
        if !self.success {
            let message = self.message.unwrap_or_else(|| "charge declined".into());
            return Err(PaymentError::Gateway(format!("cloudpayments error: {message}")));
        }

        let transaction_id = self
            .transaction_id
            .as_ref()
            .and_then(value_to_string)
            .or_else(|| {
                self.model
                    .as_ref()
                    .and_then(|m| m.get("TransactionId"))
                    .and_then(value_to_string)
            })
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PaymentError::Gateway("No transaction ID returned".into()))?;

        let payment_url = match &self.model {
            Some(Value::String(url)) if !url.is_empty() => Some(url.clone()),
            Some(model @ Value::Object(_)) => ["PaymentUrl", "AcsUrl"]
                .iter()
                .find_map(|key| model.get(*key).and_then(Value::as_str))
                .map(str::to_string),
            _ => None,
        };

        Ok(ChargeOutcome {
            transaction_id,
            payment_url,
        })
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Raw notification body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Notification {
    transaction_id: Value,

    status: String,

    #[serde(default, with = "rust_decimal::serde::float")]
    amount: Decimal,

    #[serde(default)]
    currency: String,

    #[serde(default)]
    invoice_id: Option<Value>,

    #[serde(default)]
    account_id: Option<Value>,

    #[serde(default)]
    email: Option<String>,

    #[serde(default)]
    date_time: Option<String>,
}

/// Decode a CloudPayments notification and map its status
pub fn parse_notification(payload: &[u8]) -> Result<NormalizedWebhook> {
    let notification: Notification = serde_json::from_slice(payload)
        .map_err(|e| PaymentError::MalformedPayload(format!("failed to parse webhook: {e}")))?;

    let transaction_id = value_to_string(&notification.transaction_id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| PaymentError::MalformedPayload("missing TransactionId".into()))?;

    Ok(NormalizedWebhook {
        transaction_id,
        status: map_gateway_status(&notification.status),
        gateway_status: notification.status,
        amount: notification.amount,
        currency: notification.currency,
        invoice_id: notification.invoice_id.as_ref().and_then(value_to_string),
        account_id: notification.account_id.as_ref().and_then(value_to_string),
        email: notification.email.filter(|e| !e.is_empty()),
        date_time: notification.date_time,
    })
}
