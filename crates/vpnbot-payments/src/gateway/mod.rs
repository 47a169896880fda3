//! Payment Gateway Integration
//!
//! The service reaches the gateway only through [`PaymentGateway`], so the
//! CloudPayments client can be swapped for a scripted double in tests.

mod cloudpayments;
pub mod signature;

pub use cloudpayments::{CloudPaymentsClient, parse_notification};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::model::PaymentStatus;

/// Gateway client trait (Strategy pattern)
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a charge for one payment. One outbound call, never retried.
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome>;

    /// Decode a webhook body and map its status. Pure, no I/O.
    fn parse_notification(&self, payload: &[u8]) -> Result<NormalizedWebhook>;

    /// Check a webhook signature over the raw body bytes
    fn verify_signature(&self, payload: &[u8], signature: &str) -> bool;

    /// Provider name, used in logs
    fn name(&self) -> &str;
}

/// Outbound charge
#[derive(Clone, Debug)]
pub struct ChargeRequest {
    pub amount: Decimal,
    pub currency: String,

    /// Internal payment ID, the charge's correlation identifier
    pub invoice_id: i64,

    /// Paying user's chat ID
    pub account_id: i64,

    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Successful charge result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChargeOutcome {
    pub transaction_id: String,

    /// Where to send the user to confirm the payment, if the gateway asks
    pub payment_url: Option<String>,
}

/// Webhook notification mapped onto our status enum
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedWebhook {
    pub transaction_id: String,
    pub status: PaymentStatus,

    /// Status string exactly as the gateway sent it
    pub gateway_status: String,

    pub amount: Decimal,
    pub currency: String,
    pub invoice_id: Option<String>,
    pub account_id: Option<String>,
    pub email: Option<String>,
    pub date_time: Option<String>,
}

/// Map the gateway's status vocabulary onto [`PaymentStatus`].
///
/// Anything unrecognized is a failure; only an explicit `Completed` grants value.
pub fn map_gateway_status(status: &str) -> PaymentStatus {
    match status {
        "Completed" => PaymentStatus::Completed,
        "Cancelled" => PaymentStatus::Cancelled,
        _ => PaymentStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_gateway_status("Completed"), PaymentStatus::Completed);
        assert_eq!(map_gateway_status("Cancelled"), PaymentStatus::Cancelled);
        assert_eq!(map_gateway_status("Declined"), PaymentStatus::Failed);
    }

    #[test]
    fn test_unknown_status_never_completes() {
        for status in ["Refunded", "Authorized", "completed", "", "COMPLETED"] {
            assert_eq!(map_gateway_status(status), PaymentStatus::Failed, "{status}");
        }
    }
}
