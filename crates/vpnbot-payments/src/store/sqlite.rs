//! SQLite store
//!
//! Backs both payments and subscriptions. Timestamps are stored as
//! fixed-width RFC 3339 text (microseconds, `Z`) so ordering by the column
//! is chronological; amounts are stored as decimal text.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::PaymentStore;
use crate::error::{PaymentError, Result};
use crate::model::{NewPayment, Payment, PaymentStatus, StatusChange};
use crate::subscription::{ActivationKey, Plan, Subscription, SubscriptionStore};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS subscriptions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_chat_id INTEGER NOT NULL,
        plan_type TEXT NOT NULL,
        activation_key TEXT UNIQUE,
        is_active BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TEXT NOT NULL,
        expires_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_subscriptions_user ON subscriptions(user_chat_id)",
    r"
    CREATE TABLE IF NOT EXISTS payments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_chat_id INTEGER NOT NULL,
        subscription_id INTEGER NOT NULL,
        amount TEXT NOT NULL CHECK (CAST(amount AS REAL) > 0),
        currency TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'completed', 'failed', 'cancelled')),
        payment_method TEXT NOT NULL,
        provider_transaction_id TEXT,
        created_at TEXT NOT NULL,
        confirmed_at TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_provider_tx ON payments(provider_transaction_id)",
    "CREATE INDEX IF NOT EXISTS idx_payments_status ON payments(status)",
    "CREATE INDEX IF NOT EXISTS idx_payments_user ON payments(user_chat_id)",
];

const PAYMENT_COLUMNS: &str = "SELECT id, user_chat_id, subscription_id, amount, currency, status, \
     payment_method, provider_transaction_id, created_at, confirmed_at FROM payments";

const SUBSCRIPTION_COLUMNS: &str = "SELECT id, user_chat_id, plan_type, activation_key, is_active, \
     created_at, expires_at FROM subscriptions";

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and bootstrap the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        tracing::info!(url = %url, "SQLite store ready");
        Ok(store)
    }

    /// Private in-memory database, kept alive on a single connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PaymentError::Storage(format!("corrupt timestamp '{raw}': {e}")))
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: i64,
    user_chat_id: i64,
    subscription_id: i64,
    amount: String,
    currency: String,
    status: String,
    payment_method: String,
    provider_transaction_id: Option<String>,
    created_at: String,
    confirmed_at: Option<String>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = PaymentError;

    fn try_from(row: PaymentRow) -> Result<Self> {
        let amount = Decimal::from_str(&row.amount)
            .map_err(|e| PaymentError::Storage(format!("corrupt amount '{}': {e}", row.amount)))?;
        let status = row
            .status
            .parse::<PaymentStatus>()
            .map_err(|_| PaymentError::Storage(format!("corrupt status '{}'", row.status)))?;

        Ok(Payment {
            id: row.id,
            user_chat_id: row.user_chat_id,
            subscription_id: row.subscription_id,
            amount,
            currency: row.currency,
            status,
            payment_method: row.payment_method,
            provider_transaction_id: row.provider_transaction_id,
            created_at: decode_time(&row.created_at)?,
            confirmed_at: row.confirmed_at.as_deref().map(decode_time).transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: i64,
    user_chat_id: i64,
    plan_type: String,
    activation_key: Option<String>,
    is_active: bool,
    created_at: String,
    expires_at: Option<String>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = PaymentError;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        let plan = Plan::parse(&row.plan_type)
            .map_err(|_| PaymentError::Storage(format!("corrupt plan '{}'", row.plan_type)))?;

        Ok(Subscription {
            id: row.id,
            user_chat_id: row.user_chat_id,
            plan,
            activation_key: row.activation_key.map(ActivationKey::from_string),
            is_active: row.is_active,
            created_at: decode_time(&row.created_at)?,
            expires_at: row.expires_at.as_deref().map(decode_time).transpose()?,
        })
    }
}

impl SqliteStore {
    async fn fetch_payments(&self, filter: &str, bind: PaymentFilter<'_>) -> Result<Vec<Payment>> {
        let sql = format!("{PAYMENT_COLUMNS} WHERE {filter} ORDER BY created_at DESC, id DESC");
        let query = sqlx::query_as::<_, PaymentRow>(&sql);
        let rows = match bind {
            PaymentFilter::Int(value) => query.bind(value).fetch_all(&self.pool).await?,
            PaymentFilter::Text(value) => query.bind(value).fetch_all(&self.pool).await?,
        };
        rows.into_iter().map(Payment::try_from).collect()
    }
}

enum PaymentFilter<'a> {
    Int(i64),
    Text(&'a str),
}

#[async_trait]
impl PaymentStore for SqliteStore {
    async fn create(&self, mut payment: NewPayment) -> Result<Payment> {
        // Stored with microsecond precision; return what a later read returns
        payment.created_at = payment.created_at.trunc_subsecs(6);

        let result = sqlx::query(
            r"
            INSERT INTO payments
                (user_chat_id, subscription_id, amount, currency, status, payment_method, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(payment.user_chat_id)
        .bind(payment.subscription_id)
        .bind(payment.amount.to_string())
        .bind(&payment.currency)
        .bind(PaymentStatus::Pending.as_str())
        .bind(&payment.payment_method)
        .bind(encode_time(&payment.created_at))
        .execute(&self.pool)
        .await?;

        Ok(payment.into_payment(result.last_insert_rowid()))
    }

    async fn update(&self, payment: &Payment) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE payments
            SET status = ?, provider_transaction_id = ?, confirmed_at = ?
            WHERE id = ?
            ",
        )
        .bind(payment.status.as_str())
        .bind(payment.provider_transaction_id.as_deref())
        .bind(payment.confirmed_at.as_ref().map(encode_time))
        .bind(payment.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PaymentError::NotFound(format!("Payment {}", payment.id)));
        }
        Ok(())
    }

    async fn transition(&self, id: i64, change: &StatusChange) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE payments
            SET status = ?, confirmed_at = ?
            WHERE id = ? AND status = ?
            ",
        )
        .bind(change.to.as_str())
        .bind(change.confirmed_at.as_ref().map(encode_time))
        .bind(id)
        .bind(change.from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM payments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            Some(_) => Ok(false),
            None => Err(PaymentError::NotFound(format!("Payment {id}"))),
        }
    }

    async fn get_by_id(&self, id: i64) -> Result<Payment> {
        let sql = format!("{PAYMENT_COLUMNS} WHERE id = ?");
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("Payment {id}")))?
            .try_into()
    }

    async fn get_by_transaction_id(&self, transaction_id: &str) -> Result<Payment> {
        let sql = format!("{PAYMENT_COLUMNS} WHERE provider_transaction_id = ?");
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("Payment with transaction {transaction_id}")))?
            .try_into()
    }

    async fn list_by_user(&self, user_chat_id: i64) -> Result<Vec<Payment>> {
        self.fetch_payments("user_chat_id = ?", PaymentFilter::Int(user_chat_id))
            .await
    }

    async fn list_by_status(&self, status: PaymentStatus) -> Result<Vec<Payment>> {
        self.fetch_payments("status = ?", PaymentFilter::Text(status.as_str()))
            .await
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn create(&self, user_chat_id: i64, plan: Plan) -> Result<Subscription> {
        let created_at = encode_time(&Utc::now());
        let result = sqlx::query(
            "INSERT INTO subscriptions (user_chat_id, plan_type, is_active, created_at) VALUES (?, ?, FALSE, ?)",
        )
        .bind(user_chat_id)
        .bind(plan.as_str())
        .bind(&created_at)
        .execute(&self.pool)
        .await?;

        Ok(Subscription {
            id: result.last_insert_rowid(),
            user_chat_id,
            plan,
            activation_key: None,
            is_active: false,
            created_at: decode_time(&created_at)?,
            expires_at: None,
        })
    }

    async fn get(&self, id: i64) -> Result<Subscription> {
        let sql = format!("{SUBSCRIPTION_COLUMNS} WHERE id = ?");
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("Subscription {id}")))?
            .try_into()
    }

    async fn save(&self, subscription: &Subscription) -> Result<()> {
        let result = sqlx::query(
            "UPDATE subscriptions SET activation_key = ?, is_active = ?, expires_at = ? WHERE id = ?",
        )
        .bind(subscription.activation_key.as_ref().map(ActivationKey::as_str))
        .bind(subscription.is_active)
        .bind(subscription.expires_at.as_ref().map(encode_time))
        .bind(subscription.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PaymentError::NotFound(format!("Subscription {}", subscription.id)));
        }
        Ok(())
    }

    async fn list_active(&self, user_chat_id: i64) -> Result<Vec<Subscription>> {
        let sql = format!(
            "{SUBSCRIPTION_COLUMNS} WHERE user_chat_id = ? AND is_active = TRUE ORDER BY created_at DESC, id DESC"
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(user_chat_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Subscription::try_from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn new_payment(user_chat_id: i64, created_at: DateTime<Utc>) -> NewPayment {
        NewPayment {
            user_chat_id,
            subscription_id: 1,
            amount: dec!(49.99),
            currency: "RUB".into(),
            payment_method: "cloudpayments".into(),
            created_at: created_at.trunc_subsecs(6),
        }
    }

    #[tokio::test]
    async fn test_payment_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut payment = PaymentStore::create(&store, new_payment(42, Utc::now())).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);

        payment.provider_transaction_id = Some("TX123".into());
        store.update(&payment).await.unwrap();

        let stored = store.get_by_transaction_id("TX123").await.unwrap();
        assert_eq!(stored, payment);
        assert_eq!(stored.amount, dec!(49.99));
        assert_eq!(stored.currency, "RUB");
    }

    #[tokio::test]
    async fn test_missing_rows() {
        let store = SqliteStore::in_memory().await.unwrap();

        assert!(matches!(store.get_by_id(1).await, Err(PaymentError::NotFound(_))));
        assert!(matches!(
            store.get_by_transaction_id("nope").await,
            Err(PaymentError::NotFound(_))
        ));

        let ghost = new_payment(42, Utc::now()).into_payment(99);
        assert!(matches!(store.update(&ghost).await, Err(PaymentError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unique_transaction_id() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut first = PaymentStore::create(&store, new_payment(42, Utc::now())).await.unwrap();
        let mut second = PaymentStore::create(&store, new_payment(42, Utc::now())).await.unwrap();

        first.provider_transaction_id = Some("TX1".into());
        store.update(&first).await.unwrap();

        second.provider_transaction_id = Some("TX1".into());
        assert!(matches!(store.update(&second).await, Err(PaymentError::Storage(_))));
    }

    #[tokio::test]
    async fn test_conditional_transition() {
        let store = SqliteStore::in_memory().await.unwrap();
        let payment = PaymentStore::create(&store, new_payment(42, Utc::now())).await.unwrap();
        let now = Utc::now().trunc_subsecs(6);
        let change = payment.status_change(PaymentStatus::Completed, now).unwrap();

        assert!(store.transition(payment.id, &change).await.unwrap());
        assert!(!store.transition(payment.id, &change).await.unwrap());
        assert!(matches!(
            store.transition(404, &change).await,
            Err(PaymentError::NotFound(_))
        ));

        let stored = store.get_by_id(payment.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Completed);
        assert_eq!(stored.confirmed_at, Some(now));
    }

    #[tokio::test]
    async fn test_lists_newest_first() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();

        let older = PaymentStore::create(&store, new_payment(42, now - Duration::days(1))).await.unwrap();
        let newer = PaymentStore::create(&store, new_payment(42, now)).await.unwrap();
        let other = PaymentStore::create(&store, new_payment(7, now)).await.unwrap();

        let ids: Vec<i64> = store.list_by_user(42).await.unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);

        let mut failed = other.clone();
        failed.status = PaymentStatus::Failed;
        store.update(&failed).await.unwrap();

        let pending = store.list_by_status(PaymentStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(store.list_by_status(PaymentStatus::Failed).await.unwrap()[0].id, other.id);
        assert!(store.list_by_status(PaymentStatus::Cancelled).await.unwrap().is_empty());
        assert!(store.list_by_user(1000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_activation_persists() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut subscription = SubscriptionStore::create(&store, 42, Plan::SixMonths).await.unwrap();
        assert!(!subscription.is_active);

        subscription.activate(Utc::now().trunc_subsecs(6)).unwrap();
        store.save(&subscription).await.unwrap();

        let stored = store.get(subscription.id).await.unwrap();
        assert_eq!(stored, subscription);

        let active = store.list_active(42).await.unwrap();
        assert_eq!(active.len(), 1);
        assert!(matches!(store.get(404).await, Err(PaymentError::NotFound(_))));
    }
}
