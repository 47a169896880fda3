//! # vpnbot-payments
//!
//! Payment lifecycle for the VPN subscription bot.
//!
//! ## Flow
//!
//! ```text
//! ┌─────────────┐  create_payment  ┌─────────────────┐  charge   ┌──────────────┐
//! │  Bot / API  │─────────────────▶│ PaymentService  │──────────▶│ CloudPayments│
//! └─────────────┘                  └─────────────────┘           └──────────────┘
//!                                     │        ▲                        │
//!                            persist  ▼        │ process_webhook        │ notification
//!                                  ┌──────────────┐                     │
//!                                  │ PaymentStore │◀────────────────────┘
//!                                  └──────────────┘
//! ```
//!
//! A payment is `pending` until the gateway reports a final status.
//! `failed` and `cancelled` can be overwritten by a later report, so the
//! gateway's latest word wins between them. `completed` is the exception:
//! once a payment is completed, later `failed`/`cancelled` reports are
//! acknowledged but not applied, and its confirmation timestamp is kept.
//! Refunds are settled outside this crate. The first transition into `completed` activates the
//! subscription the payment was for.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vpnbot_payments::{
//!     CloudPaymentsClient, CreatePaymentRequest, KeyIssuingActivator, PaymentService,
//!     ServiceConfig, SqliteStore,
//! };
//!
//! let store = Arc::new(SqliteStore::connect("sqlite://bot.db?mode=rwc").await?);
//! let gateway = Arc::new(CloudPaymentsClient::from_env()?);
//! let activator = Arc::new(KeyIssuingActivator::new(store.clone()));
//!
//! let service = PaymentService::new(store, gateway, activator, ServiceConfig::default());
//!
//! let created = service.create_payment(CreatePaymentRequest {
//!     user_chat_id: 42,
//!     subscription_id: 1,
//!     amount: dec!(299),
//!     email: None,
//!     phone: None,
//! }).await?;
//!
//! // Later, from the webhook endpoint:
//! service.process_webhook(&body).await?;
//! ```

pub mod config;
mod error;
pub mod gateway;
mod model;
mod service;
pub mod store;
mod subscription;

pub use config::{GatewayConfig, ServiceConfig};
pub use error::{PaymentError, Result};
pub use gateway::{CloudPaymentsClient, PaymentGateway};
pub use model::{CreatePaymentRequest, CreatedPayment, NewPayment, Payment, PaymentStatus, StatusChange};
pub use service::{PaymentService, WebhookOutcome};
pub use store::{MemoryPaymentStore, PaymentStore, SqliteStore};
pub use subscription::{
    ActivationKey, KeyIssuingActivator, MemorySubscriptionStore, Plan, Subscription, SubscriptionActivator,
    SubscriptionStore,
};
