//! In-memory payment store
//!
//! For development and tests. A single lock guards rows and the
//! transaction-ID index so every operation is atomic.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::PaymentStore;
use crate::error::{PaymentError, Result};
use crate::model::{NewPayment, Payment, PaymentStatus, StatusChange};

#[derive(Default)]
struct Inner {
    last_id: i64,
    payments: BTreeMap<i64, Payment>,
    by_transaction: HashMap<String, i64>,
}

impl Inner {
    /// Newest first, ties broken by ID
    fn sorted(&self, keep: impl Fn(&Payment) -> bool) -> Vec<Payment> {
        let mut rows: Vec<Payment> = self.payments.values().filter(|p| keep(p)).cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows
    }
}

/// In-memory payment store
#[derive(Default)]
pub struct MemoryPaymentStore {
    inner: RwLock<Inner>,
}

impl MemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored payments
    pub async fn len(&self) -> usize {
        self.inner.read().await.payments.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl PaymentStore for MemoryPaymentStore {
    async fn create(&self, payment: NewPayment) -> Result<Payment> {
        let mut inner = self.inner.write().await;
        inner.last_id += 1;

        let payment = payment.into_payment(inner.last_id);
        inner.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn update(&self, payment: &Payment) -> Result<()> {
        let mut inner = self.inner.write().await;

        if let Some(tx) = &payment.provider_transaction_id {
            if let Some(&owner) = inner.by_transaction.get(tx) {
                if owner != payment.id {
                    return Err(PaymentError::Storage(format!(
                        "UNIQUE constraint failed: transaction {tx} already belongs to payment {owner}"
                    )));
                }
            }
        }

        let row = inner
            .payments
            .get_mut(&payment.id)
            .ok_or_else(|| PaymentError::NotFound(format!("Payment {}", payment.id)))?;

        let previous_tx = std::mem::replace(&mut row.provider_transaction_id, payment.provider_transaction_id.clone());
        row.status = payment.status;
        row.confirmed_at = payment.confirmed_at;

        if let Some(old) = previous_tx {
            inner.by_transaction.remove(&old);
        }
        if let Some(tx) = &payment.provider_transaction_id {
            inner.by_transaction.insert(tx.clone(), payment.id);
        }

        Ok(())
    }

    async fn transition(&self, id: i64, change: &StatusChange) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let row = inner
            .payments
            .get_mut(&id)
            .ok_or_else(|| PaymentError::NotFound(format!("Payment {id}")))?;

        if row.status != change.from {
            return Ok(false);
        }

        row.apply(change);
        Ok(true)
    }

    async fn get_by_id(&self, id: i64) -> Result<Payment> {
        self.inner
            .read()
            .await
            .payments
            .get(&id)
            .cloned()
            .ok_or_else(|| PaymentError::NotFound(format!("Payment {id}")))
    }

    async fn get_by_transaction_id(&self, transaction_id: &str) -> Result<Payment> {
        let inner = self.inner.read().await;
        inner
            .by_transaction
            .get(transaction_id)
            .and_then(|id| inner.payments.get(id))
            .cloned()
            .ok_or_else(|| PaymentError::NotFound(format!("Payment with transaction {transaction_id}")))
    }

    async fn list_by_user(&self, user_chat_id: i64) -> Result<Vec<Payment>> {
        Ok(self.inner.read().await.sorted(|p| p.user_chat_id == user_chat_id))
    }

    async fn list_by_status(&self, status: PaymentStatus) -> Result<Vec<Payment>> {
        Ok(self.inner.read().await.sorted(|p| p.status == status))
    }
}
