//! Application State

use std::sync::Arc;

use vpnbot_payments::{PaymentService, SubscriptionStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Payment lifecycle (create, webhook, activation retry)
    pub payments: Arc<PaymentService>,

    /// Subscriptions the bot sells plans into
    pub subscriptions: Arc<dyn SubscriptionStore>,

    /// Accept webhooks without a signature header (staging only)
    pub allow_unsigned_webhooks: bool,
}
