//! Payment Service
//!
//! Owns every payment state transition:
//!
//! ```text
//! create_payment:   validate ─▶ store pending ─▶ charge ─┬─▶ record transaction ID
//!                                                        └─▶ mark failed (best effort)
//!
//! process_webhook:  parse ─▶ lookup by transaction ─▶ conditional transition ─▶ activate on edge
//! ```
//!
//! Monetary operations are never retried here. Webhook-side failures are
//! returned so the gateway redelivers; charge-side failures are returned to
//! the caller and left for external reconciliation.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};

use crate::config::ServiceConfig;
use crate::error::{PaymentError, Result};
use crate::gateway::{ChargeRequest, NormalizedWebhook, PaymentGateway};
use crate::model::{CreatePaymentRequest, CreatedPayment, NewPayment, Payment, PaymentStatus};
use crate::store::PaymentStore;
use crate::subscription::SubscriptionActivator;

/// Compare-and-set attempts before a webhook gives up and lets the gateway redeliver
const MAX_TRANSITION_ATTEMPTS: usize = 3;

/// Result of processing one webhook delivery
#[derive(Clone, Debug)]
pub struct WebhookOutcome {
    /// Payment as persisted after this delivery
    pub payment: Payment,

    /// Status before this delivery was applied
    pub previous_status: PaymentStatus,

    /// False when the report was ignored (the payment was already completed)
    pub applied: bool,

    /// True only for the delivery that moved the payment into `completed`
    pub activated: bool,
}

/// Payment lifecycle orchestration
pub struct PaymentService {
    store: Arc<dyn PaymentStore>,
    gateway: Arc<dyn PaymentGateway>,
    activator: Arc<dyn SubscriptionActivator>,
    config: ServiceConfig,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateway: Arc<dyn PaymentGateway>,
        activator: Arc<dyn SubscriptionActivator>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            activator,
            config,
        }
    }

    /// Timestamps are kept at the precision the store persists
    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    /// Create a payment and its gateway charge
    pub async fn create_payment(&self, request: CreatePaymentRequest) -> Result<CreatedPayment> {
        request.validate()?;

        let mut payment = self
            .store
            .create(NewPayment {
                user_chat_id: request.user_chat_id,
                subscription_id: request.subscription_id,
                amount: request.amount,
                currency: self.config.currency.clone(),
                payment_method: self.config.provider.clone(),
                created_at: Self::now(),
            })
            .await
            .inspect_err(|e| tracing::error!(error = %e, user_chat_id = request.user_chat_id, "Failed to create payment"))?;

        tracing::info!(
            payment_id = payment.id,
            user_chat_id = payment.user_chat_id,
            amount = %payment.amount,
            currency = %payment.currency,
            "Created pending payment"
        );

        let charge = ChargeRequest {
            amount: payment.amount,
            currency: payment.currency.clone(),
            invoice_id: payment.id,
            account_id: payment.user_chat_id,
            email: request.email,
            phone: request.phone,
        };

        let outcome = match self.gateway.create_charge(&charge).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    payment_id = payment.id,
                    gateway = self.gateway.name(),
                    error = %err,
                    "Charge failed"
                );

                payment.status = PaymentStatus::Failed;
                if let Err(store_err) = self.store.update(&payment).await {
                    // No money moved; the row stays pending without a transaction ID
                    tracing::error!(
                        payment_id = payment.id,
                        error = %store_err,
                        "Could not record failed charge"
                    );
                }

                return Err(err);
            }
        };

        payment.provider_transaction_id = Some(outcome.transaction_id.clone());
        if let Err(err) = self.store.update(&payment).await {
            tracing::error!(
                payment_id = payment.id,
                transaction_id = %outcome.transaction_id,
                error = %err,
                "Charge created but transaction ID not recorded; needs reconciliation"
            );
            return Err(match err {
                PaymentError::Storage(_) => err,
                other => PaymentError::Storage(other.to_string()),
            });
        }

        tracing::info!(
            payment_id = payment.id,
            transaction_id = %outcome.transaction_id,
            "Charge created"
        );

        Ok(CreatedPayment {
            payment,
            payment_url: outcome.payment_url,
        })
    }

    /// Reconcile a gateway notification and activate on first completion.
    ///
    /// Safe under duplicate and reordered delivery: the edge into
    /// `completed` is claimed by a conditional store update, so exactly one
    /// delivery triggers activation.
    pub async fn process_webhook(&self, payload: &[u8]) -> Result<WebhookOutcome> {
        let notification = self
            .gateway
            .parse_notification(payload)
            .inspect_err(|e| tracing::warn!(error = %e, "Rejected webhook payload"))?;

        let mut payment = self
            .store
            .get_by_transaction_id(&notification.transaction_id)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    transaction_id = %notification.transaction_id,
                    error = %e,
                    "Webhook for unknown transaction"
                );
            })?;

        Self::check_echo(&payment, &notification);

        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let previous_status = payment.status;

            let Some(change) = payment.status_change(notification.status, Self::now()) else {
                tracing::warn!(
                    payment_id = payment.id,
                    reported = %notification.gateway_status,
                    "Ignoring status report for completed payment"
                );
                return Ok(WebhookOutcome {
                    payment,
                    previous_status,
                    applied: false,
                    activated: false,
                });
            };

            if !self.store.transition(payment.id, &change).await? {
                tracing::debug!(payment_id = payment.id, "Payment changed concurrently, re-reading");
                payment = self.store.get_by_id(payment.id).await?;
                continue;
            }

            payment.apply(&change);
            tracing::info!(
                payment_id = payment.id,
                from = %change.from,
                to = %change.to,
                gateway_status = %notification.gateway_status,
                "Payment status updated"
            );

            let activated = change.activates();
            if activated {
                self.activate(&payment).await?;
            }

            return Ok(WebhookOutcome {
                payment,
                previous_status,
                applied: true,
                activated,
            });
        }

        Err(PaymentError::Storage(format!(
            "payment {} kept changing during webhook processing",
            payment.id
        )))
    }

    /// Re-run activation for a completed payment whose activation failed.
    /// Payment state is not touched.
    pub async fn retry_activation(&self, id: i64) -> Result<Payment> {
        let payment = self.store.get_by_id(id).await?;
        if payment.status != PaymentStatus::Completed {
            return Err(PaymentError::Validation(format!(
                "payment {id} is {}, only completed payments can be activated",
                payment.status
            )));
        }

        self.activate(&payment).await?;
        Ok(payment)
    }

    async fn activate(&self, payment: &Payment) -> Result<()> {
        self.activator.activate(payment).await.map_err(|e| {
            tracing::error!(
                payment_id = payment.id,
                subscription_id = payment.subscription_id,
                error = %e,
                "Subscription activation failed; payment stays completed"
            );
            match e {
                PaymentError::Activation(_) => e,
                other => PaymentError::Activation(other.to_string()),
            }
        })?;

        tracing::info!(
            payment_id = payment.id,
            subscription_id = payment.subscription_id,
            "Subscription activated"
        );
        Ok(())
    }

    /// The gateway is authoritative, but a mismatching echo deserves a look
    fn check_echo(payment: &Payment, notification: &NormalizedWebhook) {
        let amount_differs = !notification.amount.is_zero() && notification.amount != payment.amount;
        let currency_differs = !notification.currency.is_empty() && notification.currency != payment.currency;

        if amount_differs || currency_differs {
            tracing::warn!(
                payment_id = payment.id,
                expected_amount = %payment.amount,
                reported_amount = %notification.amount,
                expected_currency = %payment.currency,
                reported_currency = %notification.currency,
                "Webhook amount/currency differs from payment"
            );
        }
    }

    /// Check a webhook signature over the raw body
    pub fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        self.gateway.verify_signature(payload, signature)
    }

    pub async fn get_payment(&self, id: i64) -> Result<Payment> {
        self.store.get_by_id(id).await
    }

    pub async fn list_user_payments(&self, user_chat_id: i64) -> Result<Vec<Payment>> {
        self.store.list_by_user(user_chat_id).await
    }

    /// Feeds the external reconciliation sweep (e.g. stale `pending` rows)
    pub async fn list_payments_by_status(&self, status: PaymentStatus) -> Result<Vec<Payment>> {
        self.store.list_by_status(status).await
    }
}
