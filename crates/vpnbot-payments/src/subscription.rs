//! Subscription Activation
//!
//! A subscription is created inactive when the user picks a plan. Completing
//! its payment activates it: an activation key is issued and the expiry is
//! set from the plan length. Activation is idempotent, so it can be retried
//! independently of the payment state machine.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{PaymentError, Result};
use crate::model::Payment;

/// Activation key (formatted: XXXX-XXXX-XXXX-XXXX)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationKey(String);

impl ActivationKey {
    /// Generate a new activation key
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4();
        let hex = id.simple().to_string().to_uppercase();
        Self(format!(
            "{}-{}-{}-{}",
            &hex[0..4],
            &hex[4..8],
            &hex[8..12],
            &hex[12..16]
        ))
    }

    /// Parse from string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActivationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription plans sold by the bot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Plan {
    #[serde(rename = "1month")]
    OneMonth,
    #[serde(rename = "3months")]
    ThreeMonths,
    #[serde(rename = "6months")]
    SixMonths,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::OneMonth => "1month",
            Plan::ThreeMonths => "3months",
            Plan::SixMonths => "6months",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "1month" => Ok(Plan::OneMonth),
            "3months" => Ok(Plan::ThreeMonths),
            "6months" => Ok(Plan::SixMonths),
            other => Err(PaymentError::Validation(format!("unknown plan '{other}'"))),
        }
    }

    pub fn months(&self) -> u32 {
        match self {
            Plan::OneMonth => 1,
            Plan::ThreeMonths => 3,
            Plan::SixMonths => 6,
        }
    }
}

/// A subscription record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,

    pub user_chat_id: i64,

    pub plan: Plan,

    /// Issued on activation
    pub activation_key: Option<ActivationKey>,

    pub is_active: bool,

    pub created_at: DateTime<Utc>,

    pub expires_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Activate from the moment the payment was confirmed
    pub fn activate(&mut self, from: DateTime<Utc>) -> Result<()> {
        let expires_at = from
            .checked_add_months(Months::new(self.plan.months()))
            .ok_or_else(|| PaymentError::Activation(format!("expiry overflow for subscription {}", self.id)))?;

        self.activation_key = Some(ActivationKey::generate());
        self.is_active = true;
        self.expires_at = Some(expires_at);
        Ok(())
    }

    /// Active and not expired
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.is_none_or(|expires| now < expires)
    }
}

/// Subscription storage trait
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Create an inactive subscription for a plan
    async fn create(&self, user_chat_id: i64, plan: Plan) -> Result<Subscription>;

    /// Get by ID; `NotFound` on miss
    async fn get(&self, id: i64) -> Result<Subscription>;

    /// Replace the mutable fields (key, active flag, expiry)
    async fn save(&self, subscription: &Subscription) -> Result<()>;

    /// Active subscriptions of a user, newest first
    async fn list_active(&self, user_chat_id: i64) -> Result<Vec<Subscription>>;
}

/// Grants the entitlement a completed payment bought
#[async_trait]
pub trait SubscriptionActivator: Send + Sync {
    async fn activate(&self, payment: &Payment) -> Result<()>;
}

/// Activator that issues an activation key through a [`SubscriptionStore`]
pub struct KeyIssuingActivator<S: SubscriptionStore + ?Sized> {
    store: std::sync::Arc<S>,
}

impl<S: SubscriptionStore + ?Sized> KeyIssuingActivator<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: SubscriptionStore + ?Sized> SubscriptionActivator for KeyIssuingActivator<S> {
    async fn activate(&self, payment: &Payment) -> Result<()> {
        let mut subscription = self.store.get(payment.subscription_id).await?;

        if subscription.user_chat_id != payment.user_chat_id {
            return Err(PaymentError::Activation(format!(
                "subscription {} does not belong to chat {}",
                subscription.id, payment.user_chat_id
            )));
        }

        if subscription.is_active {
            tracing::info!(
                subscription_id = subscription.id,
                payment_id = payment.id,
                "Subscription already active"
            );
            return Ok(());
        }

        let from = payment.confirmed_at.unwrap_or_else(Utc::now);
        subscription.activate(from)?;
        self.store.save(&subscription).await?;

        tracing::info!(
            subscription_id = subscription.id,
            payment_id = payment.id,
            plan = subscription.plan.as_str(),
            expires_at = ?subscription.expires_at,
            "Activated subscription"
        );

        Ok(())
    }
}

/// In-memory subscription store (for development and tests)
#[derive(Default)]
pub struct MemorySubscriptionStore {
    inner: RwLock<MemorySubscriptions>,
}

#[derive(Default)]
struct MemorySubscriptions {
    last_id: i64,
    rows: BTreeMap<i64, Subscription>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn create(&self, user_chat_id: i64, plan: Plan) -> Result<Subscription> {
        let mut inner = self.inner.write().await;
        inner.last_id += 1;

        let subscription = Subscription {
            id: inner.last_id,
            user_chat_id,
            plan,
            activation_key: None,
            is_active: false,
            created_at: Utc::now(),
            expires_at: None,
        };
        inner.rows.insert(subscription.id, subscription.clone());

        Ok(subscription)
    }

    async fn get(&self, id: i64) -> Result<Subscription> {
        self.inner
            .read()
            .await
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| PaymentError::NotFound(format!("Subscription {id}")))
    }

    async fn save(&self, subscription: &Subscription) -> Result<()> {
        let mut inner = self.inner.write().await;
        let row = inner
            .rows
            .get_mut(&subscription.id)
            .ok_or_else(|| PaymentError::NotFound(format!("Subscription {}", subscription.id)))?;

        row.activation_key = subscription.activation_key.clone();
        row.is_active = subscription.is_active;
        row.expires_at = subscription.expires_at;
        Ok(())
    }

    async fn list_active(&self, user_chat_id: i64) -> Result<Vec<Subscription>> {
        let inner = self.inner.read().await;
        Ok(inner
            .rows
            .values()
            .rev()
            .filter(|s| s.user_chat_id == user_chat_id && s.is_active)
            .cloned()
            .collect())
    }
}
