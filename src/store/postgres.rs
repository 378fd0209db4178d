use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, postgres::PgPoolOptions};
use uuid::Uuid;

use super::{
    AffiliateRepository, OrderRepository, PollingAuditRepository, Registration, SplitRepository,
    StoreError, StoreResult, WebhookEventRepository,
};
use crate::types::{
    Affiliate, AuditEntry, Campaign, Commission, CommissionSplit, CommissionStatus, LevelShare,
    Order, OrderStatus, PollingAuditEntry, WalletId, WebhookEventRecord, WebhookState,
};

// NOTE: 23505 = unique_violation
const UNIQUE_VIOLATION: &str = "23505";

/// Initializes the database pool.
pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

fn map_insert_err(err: sqlx::Error, what: &'static str) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Duplicate(what)
    } else {
        StoreError::Database(err)
    }
}

fn statuses<T: AsRef<str>>(items: impl IntoIterator<Item = T>) -> Vec<String> {
    items.into_iter().map(|s| s.as_ref().to_string()).collect()
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    total_value: i64,
    status: String,
    referral_code: Option<String>,
    payment_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            total_value: row.total_value,
            status: row.status.parse()?,
            referral_code: row.referral_code,
            payment_id: row.payment_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AffiliateRow {
    id: Uuid,
    referral_code: String,
    wallet_id: Option<String>,
    status: String,
    financial_status: String,
    referrer_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AffiliateRow> for Affiliate {
    type Error = StoreError;

    fn try_from(row: AffiliateRow) -> Result<Self, Self::Error> {
        let wallet_id = row
            .wallet_id
            .map(|w| WalletId::parse(&w))
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Affiliate {
            id: row.id,
            referral_code: row.referral_code,
            wallet_id,
            status: row.status.parse()?,
            financial_status: row.financial_status.parse()?,
            referrer_id: row.referrer_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SplitRow {
    id: Uuid,
    order_id: Uuid,
    order_value: i64,
    factory_bps: i32,
    factory_value: i64,
    n1_affiliate_id: Option<Uuid>,
    n1_bps: Option<i32>,
    n1_value: Option<i64>,
    n2_affiliate_id: Option<Uuid>,
    n2_bps: Option<i32>,
    n2_value: Option<i64>,
    n3_affiliate_id: Option<Uuid>,
    n3_bps: Option<i32>,
    n3_value: Option<i64>,
    manager_a_bps: i32,
    manager_a_value: i64,
    manager_b_bps: i32,
    manager_b_value: i64,
    redistribution_applied: bool,
    redistribution_details: serde_json::Value,
    created_at: DateTime<Utc>,
}

fn level_share(
    affiliate_id: Option<Uuid>,
    bps: Option<i32>,
    value: Option<i64>,
) -> Option<LevelShare> {
    Some(LevelShare {
        affiliate_id: affiliate_id?,
        bps: bps? as u32,
        value: value?,
    })
}

impl From<SplitRow> for CommissionSplit {
    fn from(row: SplitRow) -> Self {
        CommissionSplit {
            id: row.id,
            order_id: row.order_id,
            order_value: row.order_value,
            factory_bps: row.factory_bps as u32,
            factory_value: row.factory_value,
            n1: level_share(row.n1_affiliate_id, row.n1_bps, row.n1_value),
            n2: level_share(row.n2_affiliate_id, row.n2_bps, row.n2_value),
            n3: level_share(row.n3_affiliate_id, row.n3_bps, row.n3_value),
            manager_a_bps: row.manager_a_bps as u32,
            manager_a_value: row.manager_a_value,
            manager_b_bps: row.manager_b_bps as u32,
            manager_b_value: row.manager_b_value,
            redistribution_applied: row.redistribution_applied,
            redistribution_details: row.redistribution_details,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CommissionRow {
    id: Uuid,
    split_id: Uuid,
    order_id: Uuid,
    affiliate_id: Uuid,
    level: i16,
    percentage_bps: i32,
    value: i64,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<CommissionRow> for Commission {
    type Error = StoreError;

    fn try_from(row: CommissionRow) -> Result<Self, Self::Error> {
        Ok(Commission {
            id: row.id,
            split_id: row.split_id,
            order_id: row.order_id,
            affiliate_id: row.affiliate_id,
            level: row.level,
            percentage_bps: row.percentage_bps as u32,
            value: row.value,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WebhookEventRow {
    id: Uuid,
    event_key: String,
    event_type: String,
    payment_id: Option<String>,
    payload: serde_json::Value,
    state: String,
    processed: bool,
    result: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WebhookEventRow> for WebhookEventRecord {
    type Error = StoreError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEventRecord {
            id: row.id,
            event_key: row.event_key,
            event_type: row.event_type,
            payment_id: row.payment_id,
            payload: row.payload,
            state: row.state.parse()?,
            processed: row.processed,
            result: row.result,
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PollingRow {
    correlation_id: String,
    payment_id: String,
    attempt: i32,
    status: Option<String>,
    success: bool,
    attempt_duration_ms: i64,
    elapsed_ms: i64,
    timeout_reached: bool,
    should_continue: bool,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<PollingRow> for PollingAuditEntry {
    fn from(row: PollingRow) -> Self {
        PollingAuditEntry {
            correlation_id: row.correlation_id,
            payment_id: row.payment_id,
            attempt: row.attempt as u32,
            status: row.status,
            success: row.success,
            attempt_duration_ms: row.attempt_duration_ms as u64,
            elapsed_ms: row.elapsed_ms as u64,
            timeout_reached: row.timeout_reached,
            should_continue: row.should_continue,
            error: row.error,
            created_at: row.created_at,
        }
    }
}

/// Postgres-backed implementation of every repository trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepository for PgStore {
    async fn insert_order(&self, order: &Order) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO orders (id, total_value, status, referral_code, payment_id, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(order.id)
        .bind(order.total_value)
        .bind(order.status.as_str())
        .bind(&order.referral_code)
        .bind(&order.payment_id)
        .bind(order.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_err(e, "order"))?;
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"SELECT id, total_value, status, referral_code, payment_id, created_at
               FROM orders WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from).transpose()
    }

    async fn find_order_by_payment(&self, payment_id: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"SELECT id, total_value, status, referral_code, payment_id, created_at
               FROM orders WHERE payment_id = $1"#,
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from).transpose()
    }

    async fn attach_payment(&self, id: Uuid, payment_id: &str) -> StoreResult<()> {
        let res = sqlx::query(
            r#"UPDATE orders SET payment_id = $2, updated_at = now() WHERE id = $1"#,
        )
        .bind(id)
        .bind(payment_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_err(e, "payment id"))?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound("order"));
        }
        Ok(())
    }

    async fn transition_order(
        &self,
        id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> StoreResult<bool> {
        let res = sqlx::query(
            r#"UPDATE orders SET status = $2, updated_at = now()
               WHERE id = $1 AND status = ANY($3)"#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(statuses(from.iter().map(OrderStatus::as_str)))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl AffiliateRepository for PgStore {
    async fn insert_affiliate(&self, affiliate: &Affiliate) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO affiliates
                 (id, referral_code, wallet_id, status, financial_status, referrer_id, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(affiliate.id)
        .bind(&affiliate.referral_code)
        .bind(affiliate.wallet_id.as_ref().map(WalletId::as_str))
        .bind(affiliate.status.as_str())
        .bind(affiliate.financial_status.as_str())
        .bind(affiliate.referrer_id)
        .bind(affiliate.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_err(e, "affiliate"))?;
        Ok(())
    }

    async fn get_affiliate(&self, id: Uuid) -> StoreResult<Option<Affiliate>> {
        let row = sqlx::query_as::<_, AffiliateRow>(
            r#"SELECT id, referral_code, wallet_id, status, financial_status, referrer_id, created_at
               FROM affiliates WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Affiliate::try_from).transpose()
    }

    async fn find_affiliate_by_code(&self, code: &str) -> StoreResult<Option<Affiliate>> {
        let row = sqlx::query_as::<_, AffiliateRow>(
            r#"SELECT id, referral_code, wallet_id, status, financial_status, referrer_id, created_at
               FROM affiliates WHERE referral_code = $1"#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Affiliate::try_from).transpose()
    }

    async fn set_referrer(&self, id: Uuid, referrer_id: Uuid) -> StoreResult<()> {
        let res = sqlx::query(r#"UPDATE affiliates SET referrer_id = $2 WHERE id = $1"#)
            .bind(id)
            .bind(referrer_id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound("affiliate"));
        }
        Ok(())
    }

    async fn configure_wallet(&self, id: Uuid, wallet_id: &WalletId) -> StoreResult<()> {
        let res = sqlx::query(
            r#"UPDATE affiliates SET wallet_id = $2, financial_status = 'active' WHERE id = $1"#,
        )
        .bind(id)
        .bind(wallet_id.as_str())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound("affiliate"));
        }
        Ok(())
    }

    async fn record_click(&self, affiliate_id: Uuid, campaign: &Campaign) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO referral_events (affiliate_id, kind, utm_source, utm_medium, utm_campaign)
               VALUES ($1, 'click', $2, $3, $4)"#,
        )
        .bind(affiliate_id)
        .bind(&campaign.utm_source)
        .bind(&campaign.utm_medium)
        .bind(&campaign.utm_campaign)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_conversion(&self, affiliate_id: Uuid, order_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO referral_events (affiliate_id, kind, order_id)
               VALUES ($1, 'conversion', $2)"#,
        )
        .bind(affiliate_id)
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_err(e, "conversion"))?;
        Ok(())
    }
}

#[async_trait]
impl SplitRepository for PgStore {
    async fn split_exists(&self, order_id: Uuid) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"SELECT EXISTS (SELECT 1 FROM commission_splits WHERE order_id = $1)"#,
        )
        .bind(order_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_split(
        &self,
        split: &CommissionSplit,
        commissions: &[Commission],
        audit: &AuditEntry,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let level = |share: &Option<LevelShare>| {
            (
                share.map(|s| s.affiliate_id),
                share.map(|s| s.bps as i32),
                share.map(|s| s.value),
            )
        };
        let (n1_id, n1_bps, n1_value) = level(&split.n1);
        let (n2_id, n2_bps, n2_value) = level(&split.n2);
        let (n3_id, n3_bps, n3_value) = level(&split.n3);

        sqlx::query(
            r#"INSERT INTO commission_splits
                 (id, order_id, order_value, factory_bps, factory_value,
                  n1_affiliate_id, n1_bps, n1_value,
                  n2_affiliate_id, n2_bps, n2_value,
                  n3_affiliate_id, n3_bps, n3_value,
                  manager_a_bps, manager_a_value, manager_b_bps, manager_b_value,
                  redistribution_applied, redistribution_details, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                       $15, $16, $17, $18, $19, $20, $21)"#,
        )
        .bind(split.id)
        .bind(split.order_id)
        .bind(split.order_value)
        .bind(split.factory_bps as i32)
        .bind(split.factory_value)
        .bind(n1_id)
        .bind(n1_bps)
        .bind(n1_value)
        .bind(n2_id)
        .bind(n2_bps)
        .bind(n2_value)
        .bind(n3_id)
        .bind(n3_bps)
        .bind(n3_value)
        .bind(split.manager_a_bps as i32)
        .bind(split.manager_a_value)
        .bind(split.manager_b_bps as i32)
        .bind(split.manager_b_value)
        .bind(split.redistribution_applied)
        .bind(&split.redistribution_details)
        .bind(split.created_at)
        .execute(tx.as_mut())
        .await
        .map_err(|e| map_insert_err(e, "commission split"))?;

        for commission in commissions {
            sqlx::query(
                r#"INSERT INTO commissions
                     (id, split_id, order_id, affiliate_id, level, percentage_bps, value, status, created_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
            )
            .bind(commission.id)
            .bind(commission.split_id)
            .bind(commission.order_id)
            .bind(commission.affiliate_id)
            .bind(commission.level)
            .bind(commission.percentage_bps as i32)
            .bind(commission.value)
            .bind(commission.status.as_str())
            .bind(commission.created_at)
            .execute(tx.as_mut())
            .await
            .map_err(|e| map_insert_err(e, "commission"))?;
        }

        sqlx::query(
            r#"INSERT INTO commission_audit_log (order_id, action, details) VALUES ($1, $2, $3)"#,
        )
        .bind(audit.order_id)
        .bind(&audit.action)
        .bind(&audit.details)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_split(&self, order_id: Uuid) -> StoreResult<Option<CommissionSplit>> {
        let row = sqlx::query_as::<_, SplitRow>(
            r#"SELECT id, order_id, order_value, factory_bps, factory_value,
                      n1_affiliate_id, n1_bps, n1_value,
                      n2_affiliate_id, n2_bps, n2_value,
                      n3_affiliate_id, n3_bps, n3_value,
                      manager_a_bps, manager_a_value, manager_b_bps, manager_b_value,
                      redistribution_applied, redistribution_details, created_at
               FROM commission_splits WHERE order_id = $1"#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CommissionSplit::from))
    }

    async fn commissions_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Commission>> {
        let rows = sqlx::query_as::<_, CommissionRow>(
            r#"SELECT id, split_id, order_id, affiliate_id, level, percentage_bps, value, status, created_at
               FROM commissions WHERE order_id = $1 ORDER BY level"#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Commission::try_from).collect()
    }

    async fn commissions_for_affiliate(&self, affiliate_id: Uuid) -> StoreResult<Vec<Commission>> {
        let rows = sqlx::query_as::<_, CommissionRow>(
            r#"SELECT id, split_id, order_id, affiliate_id, level, percentage_bps, value, status, created_at
               FROM commissions WHERE affiliate_id = $1 ORDER BY created_at DESC"#,
        )
        .bind(affiliate_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Commission::try_from).collect()
    }

    async fn transition_commissions(
        &self,
        order_id: Uuid,
        from: &[CommissionStatus],
        to: CommissionStatus,
    ) -> StoreResult<u64> {
        let res = sqlx::query(
            r#"UPDATE commissions SET status = $2, updated_at = now()
               WHERE order_id = $1 AND status = ANY($3)"#,
        )
        .bind(order_id)
        .bind(to.as_str())
        .bind(statuses(from.iter().map(CommissionStatus::as_str)))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl WebhookEventRepository for PgStore {
    async fn register_event(&self, event: &WebhookEventRecord) -> StoreResult<Registration> {
        let inserted = sqlx::query(
            r#"INSERT INTO webhook_events
                 (id, event_key, event_type, payment_id, payload, state, processed, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)
               ON CONFLICT (event_key) DO NOTHING"#,
        )
        .bind(event.id)
        .bind(&event.event_key)
        .bind(&event.event_type)
        .bind(&event.payment_id)
        .bind(&event.payload)
        .bind(event.state.as_str())
        .bind(event.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            return Ok(Registration::Registered);
        }
        let existing = self
            .get_event(&event.event_key)
            .await?
            .ok_or(StoreError::NotFound("webhook event"))?;
        Ok(Registration::AlreadyRegistered(existing))
    }

    async fn set_event_state(&self, id: Uuid, state: WebhookState) -> StoreResult<()> {
        sqlx::query(r#"UPDATE webhook_events SET state = $2 WHERE id = $1"#)
            .bind(id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_event(&self, id: Uuid, state: WebhookState, result: &str) -> StoreResult<()> {
        sqlx::query(
            r#"UPDATE webhook_events
               SET state = $2, processed = TRUE, result = $3, processed_at = now()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(state.as_str())
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_event(&self, event_key: &str) -> StoreResult<Option<WebhookEventRecord>> {
        let row = sqlx::query_as::<_, WebhookEventRow>(
            r#"SELECT id, event_key, event_type, payment_id, payload, state, processed, result,
                      created_at, processed_at
               FROM webhook_events WHERE event_key = $1"#,
        )
        .bind(event_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WebhookEventRecord::try_from).transpose()
    }
}

#[async_trait]
impl PollingAuditRepository for PgStore {
    async fn append_attempt(&self, entry: &PollingAuditEntry) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO payment_polling_audit
                 (correlation_id, payment_id, attempt, status, success, attempt_duration_ms,
                  elapsed_ms, timeout_reached, should_continue, error, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(&entry.correlation_id)
        .bind(&entry.payment_id)
        .bind(entry.attempt as i32)
        .bind(&entry.status)
        .bind(entry.success)
        .bind(entry.attempt_duration_ms as i64)
        .bind(entry.elapsed_ms as i64)
        .bind(entry.timeout_reached)
        .bind(entry.should_continue)
        .bind(&entry.error)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_err(e, "polling attempt"))?;
        Ok(())
    }

    async fn attempts(&self, correlation_id: &str) -> StoreResult<Vec<PollingAuditEntry>> {
        let rows = sqlx::query_as::<_, PollingRow>(
            r#"SELECT correlation_id, payment_id, attempt, status, success, attempt_duration_ms,
                      elapsed_ms, timeout_reached, should_continue, error, created_at
               FROM payment_polling_audit WHERE correlation_id = $1 ORDER BY attempt"#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PollingAuditEntry::from).collect())
    }
}
