//! In-memory store used by tests and local runs without Postgres.
//!
//! A single lock guards all tables so every trait method is atomic, which
//! mirrors the unique constraints of the Postgres schema.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AffiliateRepository, OrderRepository, PollingAuditRepository, Registration, SplitRepository,
    StoreError, StoreResult, WebhookEventRepository,
};
use crate::types::{
    Affiliate, AuditEntry, Campaign, Commission, CommissionSplit, CommissionStatus,
    FinancialStatus, Order, OrderStatus, PollingAuditEntry, WalletId, WebhookEventRecord,
    WebhookState,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedReferral {
    pub affiliate_id: Uuid,
    pub order_id: Option<Uuid>,
    pub campaign: Campaign,
}

#[derive(Default)]
struct Tables {
    orders: HashMap<Uuid, Order>,
    affiliates: HashMap<Uuid, Affiliate>,
    splits: HashMap<Uuid, CommissionSplit>,
    commissions: Vec<Commission>,
    audit: Vec<AuditEntry>,
    webhook_events: HashMap<String, WebhookEventRecord>,
    polling: Vec<PollingAuditEntry>,
    clicks: Vec<RecordedReferral>,
    conversions: Vec<RecordedReferral>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn commission_count(&self) -> usize {
        self.tables.lock().await.commissions.len()
    }

    pub async fn split_count(&self) -> usize {
        self.tables.lock().await.splits.len()
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.tables.lock().await.audit.clone()
    }

    pub async fn clicks(&self) -> Vec<RecordedReferral> {
        self.tables.lock().await.clicks.clone()
    }

    pub async fn conversions(&self) -> Vec<RecordedReferral> {
        self.tables.lock().await.conversions.clone()
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn insert_order(&self, order: &Order) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.orders.contains_key(&order.id) {
            return Err(StoreError::Duplicate("order"));
        }
        tables.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        Ok(self.tables.lock().await.orders.get(&id).cloned())
    }

    async fn find_order_by_payment(&self, payment_id: &str) -> StoreResult<Option<Order>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .orders
            .values()
            .find(|order| order.payment_id.as_deref() == Some(payment_id))
            .cloned())
    }

    async fn attach_payment(&self, id: Uuid, payment_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables
            .orders
            .values()
            .any(|order| order.id != id && order.payment_id.as_deref() == Some(payment_id))
        {
            return Err(StoreError::Duplicate("payment id"));
        }
        let order = tables.orders.get_mut(&id).ok_or(StoreError::NotFound("order"))?;
        order.payment_id = Some(payment_id.to_string());
        Ok(())
    }

    async fn transition_order(
        &self,
        id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let order = tables.orders.get_mut(&id).ok_or(StoreError::NotFound("order"))?;
        if !from.contains(&order.status) {
            return Ok(false);
        }
        order.status = to;
        Ok(true)
    }
}

#[async_trait]
impl AffiliateRepository for MemoryStore {
    async fn insert_affiliate(&self, affiliate: &Affiliate) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables
            .affiliates
            .values()
            .any(|a| a.id == affiliate.id || a.referral_code == affiliate.referral_code)
        {
            return Err(StoreError::Duplicate("affiliate"));
        }
        tables.affiliates.insert(affiliate.id, affiliate.clone());
        Ok(())
    }

    async fn get_affiliate(&self, id: Uuid) -> StoreResult<Option<Affiliate>> {
        Ok(self.tables.lock().await.affiliates.get(&id).cloned())
    }

    async fn find_affiliate_by_code(&self, code: &str) -> StoreResult<Option<Affiliate>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .affiliates
            .values()
            .find(|a| a.referral_code == code)
            .cloned())
    }

    async fn set_referrer(&self, id: Uuid, referrer_id: Uuid) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if !tables.affiliates.contains_key(&referrer_id) {
            return Err(StoreError::NotFound("referrer"));
        }
        let affiliate = tables
            .affiliates
            .get_mut(&id)
            .ok_or(StoreError::NotFound("affiliate"))?;
        affiliate.referrer_id = Some(referrer_id);
        Ok(())
    }

    async fn configure_wallet(&self, id: Uuid, wallet_id: &WalletId) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let affiliate = tables
            .affiliates
            .get_mut(&id)
            .ok_or(StoreError::NotFound("affiliate"))?;
        affiliate.wallet_id = Some(wallet_id.clone());
        affiliate.financial_status = FinancialStatus::Active;
        Ok(())
    }

    async fn record_click(&self, affiliate_id: Uuid, campaign: &Campaign) -> StoreResult<()> {
        self.tables.lock().await.clicks.push(RecordedReferral {
            affiliate_id,
            order_id: None,
            campaign: campaign.clone(),
        });
        Ok(())
    }

    async fn record_conversion(&self, affiliate_id: Uuid, order_id: Uuid) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables
            .conversions
            .iter()
            .any(|c| c.order_id == Some(order_id))
        {
            return Err(StoreError::Duplicate("conversion"));
        }
        tables.conversions.push(RecordedReferral {
            affiliate_id,
            order_id: Some(order_id),
            campaign: Campaign::default(),
        });
        Ok(())
    }
}

#[async_trait]
impl SplitRepository for MemoryStore {
    async fn split_exists(&self, order_id: Uuid) -> StoreResult<bool> {
        Ok(self.tables.lock().await.splits.contains_key(&order_id))
    }

    async fn insert_split(
        &self,
        split: &CommissionSplit,
        commissions: &[Commission],
        audit: &AuditEntry,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.splits.contains_key(&split.order_id) {
            return Err(StoreError::Duplicate("commission split"));
        }
        tables.splits.insert(split.order_id, split.clone());
        tables.commissions.extend_from_slice(commissions);
        tables.audit.push(audit.clone());
        Ok(())
    }

    async fn get_split(&self, order_id: Uuid) -> StoreResult<Option<CommissionSplit>> {
        Ok(self.tables.lock().await.splits.get(&order_id).cloned())
    }

    async fn commissions_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Commission>> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<Commission> = tables
            .commissions
            .iter()
            .filter(|c| c.order_id == order_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.level);
        Ok(rows)
    }

    async fn commissions_for_affiliate(&self, affiliate_id: Uuid) -> StoreResult<Vec<Commission>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .commissions
            .iter()
            .filter(|c| c.affiliate_id == affiliate_id)
            .cloned()
            .collect())
    }

    async fn transition_commissions(
        &self,
        order_id: Uuid,
        from: &[CommissionStatus],
        to: CommissionStatus,
    ) -> StoreResult<u64> {
        let mut tables = self.tables.lock().await;
        let mut moved = 0;
        for commission in tables
            .commissions
            .iter_mut()
            .filter(|c| c.order_id == order_id && from.contains(&c.status))
        {
            commission.status = to;
            moved += 1;
        }
        Ok(moved)
    }
}

#[async_trait]
impl WebhookEventRepository for MemoryStore {
    async fn register_event(&self, event: &WebhookEventRecord) -> StoreResult<Registration> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.webhook_events.get(&event.event_key) {
            return Ok(Registration::AlreadyRegistered(existing.clone()));
        }
        tables
            .webhook_events
            .insert(event.event_key.clone(), event.clone());
        Ok(Registration::Registered)
    }

    async fn set_event_state(&self, id: Uuid, state: WebhookState) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let event = tables
            .webhook_events
            .values_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound("webhook event"))?;
        event.state = state;
        Ok(())
    }

    async fn finish_event(&self, id: Uuid, state: WebhookState, result: &str) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let event = tables
            .webhook_events
            .values_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound("webhook event"))?;
        event.state = state;
        event.processed = true;
        event.result = Some(result.to_string());
        event.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn get_event(&self, event_key: &str) -> StoreResult<Option<WebhookEventRecord>> {
        Ok(self.tables.lock().await.webhook_events.get(event_key).cloned())
    }
}

#[async_trait]
impl PollingAuditRepository for MemoryStore {
    async fn append_attempt(&self, entry: &PollingAuditEntry) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables
            .polling
            .iter()
            .any(|e| e.correlation_id == entry.correlation_id && e.attempt == entry.attempt)
        {
            return Err(StoreError::Duplicate("polling attempt"));
        }
        tables.polling.push(entry.clone());
        Ok(())
    }

    async fn attempts(&self, correlation_id: &str) -> StoreResult<Vec<PollingAuditEntry>> {
        let tables = self.tables.lock().await;
        let mut entries: Vec<PollingAuditEntry> = tables
            .polling
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.attempt);
        Ok(entries)
    }
}
