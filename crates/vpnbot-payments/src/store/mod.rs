//! Payment Storage
//!
//! Abstractions and implementations for the payments table.
//!
//! Every operation is an `async fn`; dropping the returned future cancels
//! the in-flight query and leaves the row in its last committed state.

mod memory;
mod sqlite;

pub use memory::MemoryPaymentStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{NewPayment, Payment, PaymentStatus, StatusChange};

/// Payment storage trait
///
/// At most one payment may reference a given gateway transaction ID.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Persist a new `pending` payment and assign its ID
    async fn create(&self, payment: NewPayment) -> Result<Payment>;

    /// Replace status, transaction ID and confirmation timestamp by ID.
    /// `NotFound` if no row matches.
    async fn update(&self, payment: &Payment) -> Result<()>;

    /// Write `change` only if the row's status still equals `change.from`.
    ///
    /// Returns `Ok(false)` when another writer got there first. The check
    /// and the write are one atomic step.
    async fn transition(&self, id: i64, change: &StatusChange) -> Result<bool>;

    /// `NotFound` on miss
    async fn get_by_id(&self, id: i64) -> Result<Payment>;

    /// `NotFound` on miss
    async fn get_by_transaction_id(&self, transaction_id: &str) -> Result<Payment>;

    /// Newest first; empty when the user has no payments
    async fn list_by_user(&self, user_chat_id: i64) -> Result<Vec<Payment>>;

    /// Newest first; empty when nothing matches
    async fn list_by_status(&self, status: PaymentStatus) -> Result<Vec<Payment>>;
}
