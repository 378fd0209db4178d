use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix every gateway wallet identifier starts with.
pub const WALLET_ID_PREFIX: &str = "wal_";
/// Total length of a gateway wallet identifier, prefix included.
pub const WALLET_ID_LEN: usize = 36;

/// A status string read back from storage did not match any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Generates `as_str`, `Display` and `FromStr` for the lowercase status enums
/// stored as TEXT columns.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    /// Charge overdue but still payable.
    PastDue,
    Paid,
    Failed,
    Refunded,
}

text_enum!(OrderStatus, "order status", {
    Pending => "pending",
    PastDue => "past_due",
    Paid => "paid",
    Failed => "failed",
    Refunded => "refunded",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffiliateStatus {
    Pending,
    Active,
    Inactive,
    Suspended,
}

text_enum!(AffiliateStatus, "affiliate status", {
    Pending => "pending",
    Active => "active",
    Inactive => "inactive",
    Suspended => "suspended",
});

/// Payout-destination configuration state of an affiliate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinancialStatus {
    Pending,
    Active,
}

text_enum!(FinancialStatus, "financial status", {
    Pending => "pending",
    Active => "active",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Calculated,
    Pending,
    Paid,
    Failed,
}

text_enum!(CommissionStatus, "commission status", {
    Calculated => "calculated",
    Pending => "pending",
    Paid => "paid",
    Failed => "failed",
});

/// Lifecycle of a registered webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookState {
    Received,
    Processing,
    Completed,
    Failed,
}

text_enum!(WebhookState, "webhook state", {
    Received => "received",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl WebhookState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed wallet id `{0}`")]
pub struct InvalidWalletId(pub String);

/// Recipient handle on the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletId(String);

impl WalletId {
    pub fn parse(raw: &str) -> Result<Self, InvalidWalletId> {
        let raw = raw.trim();
        let body = raw
            .strip_prefix(WALLET_ID_PREFIX)
            .ok_or_else(|| InvalidWalletId(raw.to_string()))?;
        if raw.len() != WALLET_ID_LEN || !body.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(InvalidWalletId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WalletId {
    type Error = InvalidWalletId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WalletId> for String {
    fn from(value: WalletId) -> Self {
        value.0
    }
}

/// Uppercased, trimmed referral code, or `None` when blank.
pub fn normalize_referral_code(raw: &str) -> Option<String> {
    let code = raw.trim();
    if code.is_empty() {
        None
    } else {
        Some(code.to_uppercase())
    }
}

/// An order placed through checkout. The total never changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    /// The ID of the order.
    pub id: Uuid,
    /// The order total in minor currency units.
    pub total_value: i64,
    /// The order status.
    pub status: OrderStatus,
    /// The referral code captured at checkout, if any.
    pub referral_code: Option<String>,
    /// The gateway payment created for this order.
    pub payment_id: Option<String>,
    /// The timestamp when the order was created.
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(total_value: i64, referral_code: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            total_value,
            status: OrderStatus::Pending,
            referral_code,
            payment_id: None,
            created_at: Utc::now(),
        }
    }
}

/// A member of the affiliate network.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Affiliate {
    /// The ID of the affiliate.
    pub id: Uuid,
    /// The code carried in `?ref=` links.
    pub referral_code: String,
    /// The payout wallet on the gateway.
    pub wallet_id: Option<WalletId>,
    pub status: AffiliateStatus,
    pub financial_status: FinancialStatus,
    /// The affiliate who referred this one.
    pub referrer_id: Option<Uuid>,
    /// The timestamp when the affiliate was created.
    pub created_at: DateTime<Utc>,
}

impl Affiliate {
    pub fn new(referral_code: &str, referrer_id: Option<Uuid>) -> Option<Self> {
        Some(Self {
            id: Uuid::new_v4(),
            referral_code: normalize_referral_code(referral_code)?,
            wallet_id: None,
            status: AffiliateStatus::Active,
            financial_status: FinancialStatus::Pending,
            referrer_id,
            created_at: Utc::now(),
        })
    }

    /// The wallet that may receive funds, present only when the affiliate is
    /// active and financially configured. Suspended, inactive and unconfigured
    /// affiliates all resolve to `None`.
    pub fn payout_wallet(&self) -> Option<&WalletId> {
        match (self.status, self.financial_status) {
            (AffiliateStatus::Active, FinancialStatus::Active) => self.wallet_id.as_ref(),
            _ => None,
        }
    }
}

/// The calculated split of one order, stored once per order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommissionSplit {
    pub id: Uuid,
    pub order_id: Uuid,
    pub order_value: i64,
    pub factory_bps: u32,
    pub factory_value: i64,
    pub n1: Option<LevelShare>,
    pub n2: Option<LevelShare>,
    pub n3: Option<LevelShare>,
    pub manager_a_bps: u32,
    pub manager_a_value: i64,
    pub manager_b_bps: u32,
    pub manager_b_value: i64,
    pub redistribution_applied: bool,
    pub redistribution_details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl CommissionSplit {
    /// Sum of every percentage on the split, factory included.
    pub fn total_bps(&self) -> u32 {
        self.factory_bps
            + [&self.n1, &self.n2, &self.n3]
                .into_iter()
                .flatten()
                .map(|share| share.bps)
                .sum::<u32>()
            + self.manager_a_bps
            + self.manager_b_bps
    }
}

/// One affiliate level's share on a stored split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LevelShare {
    pub affiliate_id: Uuid,
    pub bps: u32,
    pub value: i64,
}

/// A per-affiliate commission row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Commission {
    pub id: Uuid,
    pub split_id: Uuid,
    pub order_id: Uuid,
    pub affiliate_id: Uuid,
    /// Network level, 1 to 3.
    pub level: i16,
    pub percentage_bps: u32,
    pub value: i64,
    pub status: CommissionStatus,
    pub created_at: DateTime<Utc>,
}

/// An audit record written alongside a persisted split.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub order_id: Uuid,
    pub action: String,
    pub details: serde_json::Value,
}

/// A webhook delivery registered under its idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    /// Unique key derived from the external event.
    pub event_key: String,
    pub event_type: String,
    pub payment_id: Option<String>,
    pub payload: serde_json::Value,
    pub state: WebhookState,
    pub processed: bool,
    /// Outcome detail written when processing finishes.
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// One polling attempt, append-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollingAuditEntry {
    pub correlation_id: String,
    pub payment_id: String,
    pub attempt: u32,
    pub status: Option<String>,
    pub success: bool,
    pub attempt_duration_ms: u64,
    pub elapsed_ms: u64,
    pub timeout_reached: bool,
    pub should_continue: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// UTM attributes carried next to a referral code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
}
