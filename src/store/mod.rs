//! Persistence seams.
//!
//! The database is the arbiter of every exactly-once guarantee: unique
//! constraints on `order -> split` and on webhook event keys. Callers may check
//! first, but must expect [`StoreError::Duplicate`] on insert regardless.

mod memory;
mod postgres;

pub use memory::{MemoryStore, RecordedReferral};
pub use postgres::{PgStore, init_pool};

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{
    Affiliate, AuditEntry, Campaign, Commission, CommissionSplit, CommissionStatus, Order,
    OrderStatus, PollingAuditEntry, UnknownVariant, WalletId, WebhookEventRecord, WebhookState,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("duplicate {0}")]
    Duplicate(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<UnknownVariant> for StoreError {
    fn from(err: UnknownVariant) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of registering a webhook event key.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// This caller owns the event and must process it.
    Registered,
    /// Some earlier delivery already registered the key.
    AlreadyRegistered(WebhookEventRecord),
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn insert_order(&self, order: &Order) -> StoreResult<()>;

    async fn get_order(&self, id: Uuid) -> StoreResult<Option<Order>>;

    async fn find_order_by_payment(&self, payment_id: &str) -> StoreResult<Option<Order>>;

    async fn attach_payment(&self, id: Uuid, payment_id: &str) -> StoreResult<()>;

    /// Moves the order to `to` only when its current status is one of `from`.
    /// Returns whether this call performed the transition.
    async fn transition_order(
        &self,
        id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> StoreResult<bool>;
}

#[async_trait]
pub trait AffiliateRepository: Send + Sync {
    /// Fails with [`StoreError::Duplicate`] when the referral code is taken.
    async fn insert_affiliate(&self, affiliate: &Affiliate) -> StoreResult<()>;

    async fn get_affiliate(&self, id: Uuid) -> StoreResult<Option<Affiliate>>;

    async fn find_affiliate_by_code(&self, code: &str) -> StoreResult<Option<Affiliate>>;

    async fn set_referrer(&self, id: Uuid, referrer_id: Uuid) -> StoreResult<()>;

    /// Stores the payout wallet and marks the affiliate financially active.
    async fn configure_wallet(&self, id: Uuid, wallet_id: &WalletId) -> StoreResult<()>;

    async fn record_click(&self, affiliate_id: Uuid, campaign: &Campaign) -> StoreResult<()>;

    /// Fails with [`StoreError::Duplicate`] when the order already converted.
    async fn record_conversion(&self, affiliate_id: Uuid, order_id: Uuid) -> StoreResult<()>;
}

#[async_trait]
pub trait SplitRepository: Send + Sync {
    async fn split_exists(&self, order_id: Uuid) -> StoreResult<bool>;

    /// Writes the split, its commission rows and the audit entry as one unit.
    /// Fails with [`StoreError::Duplicate`] when the order already has a split.
    async fn insert_split(
        &self,
        split: &CommissionSplit,
        commissions: &[Commission],
        audit: &AuditEntry,
    ) -> StoreResult<()>;

    async fn get_split(&self, order_id: Uuid) -> StoreResult<Option<CommissionSplit>>;

    async fn commissions_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Commission>>;

    async fn commissions_for_affiliate(&self, affiliate_id: Uuid) -> StoreResult<Vec<Commission>>;

    /// Conditional bulk status change; returns the number of rows moved.
    async fn transition_commissions(
        &self,
        order_id: Uuid,
        from: &[CommissionStatus],
        to: CommissionStatus,
    ) -> StoreResult<u64>;
}

#[async_trait]
pub trait WebhookEventRepository: Send + Sync {
    async fn register_event(&self, event: &WebhookEventRecord) -> StoreResult<Registration>;

    async fn set_event_state(&self, id: Uuid, state: WebhookState) -> StoreResult<()>;

    /// Records the terminal state and outcome and flips `processed`.
    async fn finish_event(&self, id: Uuid, state: WebhookState, result: &str) -> StoreResult<()>;

    async fn get_event(&self, event_key: &str) -> StoreResult<Option<WebhookEventRecord>>;
}

#[async_trait]
pub trait PollingAuditRepository: Send + Sync {
    async fn append_attempt(&self, entry: &PollingAuditEntry) -> StoreResult<()>;

    /// Entries of one correlation id ordered by attempt.
    async fn attempts(&self, correlation_id: &str) -> StoreResult<Vec<PollingAuditEntry>>;
}
