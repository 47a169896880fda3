//! Payment Domain Model
//!
//! A [`Payment`] is created `pending` and moves at most once into a terminal
//! outcome reported by the gateway. The only code allowed to mutate it is
//! the payment service.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};

/// Payment lifecycle status
///
/// `Pending` is the only initial state; the other three are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            other => Err(PaymentError::Validation(format!("unknown payment status '{other}'"))),
        }
    }
}

/// A persisted payment record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Internal ID, assigned by the store
    pub id: i64,

    /// Chat ID of the paying user
    pub user_chat_id: i64,

    /// Subscription this payment buys
    pub subscription_id: i64,

    pub amount: Decimal,

    pub currency: String,

    pub status: PaymentStatus,

    /// Provider tag, e.g. `cloudpayments`
    pub payment_method: String,

    /// Gateway transaction ID, set once the charge call succeeded
    pub provider_transaction_id: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Set exactly when `status` is `Completed`
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Work out how a status reported by the gateway changes this payment.
    ///
    /// Returns `None` when the report must not be applied: a completed
    /// payment never leaves `Completed`. Between the other states the
    /// gateway's latest report wins. An existing confirmation timestamp is
    /// always carried over.
    pub fn status_change(&self, reported: PaymentStatus, now: DateTime<Utc>) -> Option<StatusChange> {
        if self.status == PaymentStatus::Completed && reported != PaymentStatus::Completed {
            return None;
        }

        let confirmed_at = match reported {
            PaymentStatus::Completed => Some(self.confirmed_at.unwrap_or(now)),
            _ => None,
        };

        Some(StatusChange {
            from: self.status,
            to: reported,
            confirmed_at,
        })
    }

    /// Apply a change computed by [`Payment::status_change`]
    pub fn apply(&mut self, change: &StatusChange) {
        self.status = change.to;
        self.confirmed_at = change.confirmed_at;
    }
}

/// A status transition to be written with a conditional store update
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    /// Status the row must still have for the write to succeed
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl StatusChange {
    /// Subscription activation fires only on the edge into `Completed`
    pub fn activates(&self) -> bool {
        self.from != PaymentStatus::Completed && self.to == PaymentStatus::Completed
    }
}

/// Fields for a payment that has not been stored yet
///
/// There is no status field: every new payment starts `pending`.
#[derive(Clone, Debug)]
pub struct NewPayment {
    pub user_chat_id: i64,
    pub subscription_id: i64,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    pub created_at: DateTime<Utc>,
}

impl NewPayment {
    /// Materialize the stored record once the store has assigned an ID
    pub fn into_payment(self, id: i64) -> Payment {
        Payment {
            id,
            user_chat_id: self.user_chat_id,
            subscription_id: self.subscription_id,
            amount: self.amount,
            currency: self.currency,
            status: PaymentStatus::Pending,
            payment_method: self.payment_method,
            provider_transaction_id: None,
            created_at: self.created_at,
            confirmed_at: None,
        }
    }
}

/// Request to create a payment, as sent by the bot
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    pub user_chat_id: i64,

    pub subscription_id: i64,

    pub amount: Decimal,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub phone: Option<String>,
}

impl CreatePaymentRequest {
    pub fn validate(&self) -> Result<()> {
        if self.user_chat_id == 0 {
            return Err(PaymentError::Validation("user_chat_id must be non-zero".into()));
        }
        if self.amount <= Decimal::ZERO {
            return Err(PaymentError::Validation("amount must be positive".into()));
        }
        Ok(())
    }
}

/// A freshly created payment plus the gateway's redirect URL, if any
#[derive(Clone, Debug)]
pub struct CreatedPayment {
    pub payment: Payment,
    pub payment_url: Option<String>,
}
