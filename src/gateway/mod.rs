//! Outbound payment gateway seam.
//!
//! The split travels inside the payment-creation request; the gateway offers
//! no way to attach it afterwards.

mod asaas;
mod mock;

pub use asaas::{AsaasClient, DEFAULT_BASE_URL};
pub use mock::MockGateway;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::split::{BPS_SCALE, SplitLine, SplitResult};
use crate::types::WalletId;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Rejected locally, before any request was sent.
    #[error("invalid wallet id: {0}")]
    InvalidWallet(String),

    #[error("invalid payment request: {0}")]
    InvalidRequest(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Http(err) => err.is_timeout() || err.is_connect(),
            GatewayError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Payment status as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Received,
    ReceivedInCash,
    Overdue,
    Refunded,
    Failed,
    Refused,
    Cancelled,
    Deleted,
    #[serde(other)]
    Unknown,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Confirmed => "CONFIRMED",
            PaymentStatus::Received => "RECEIVED",
            PaymentStatus::ReceivedInCash => "RECEIVED_IN_CASH",
            PaymentStatus::Overdue => "OVERDUE",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refused => "REFUSED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Deleted => "DELETED",
            PaymentStatus::Unknown => "UNKNOWN",
        }
    }

    /// Statuses after which polling stops. An overdue boleto can still be paid.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            PaymentStatus::Pending | PaymentStatus::Overdue | PaymentStatus::Unknown
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingType {
    Boleto,
    CreditCard,
    Pix,
    Undefined,
}

/// How split lines are expressed on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitMode {
    #[default]
    Percentual,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitInstruction {
    pub wallet_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentual_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_value: Option<f64>,
}

impl SplitInstruction {
    pub fn from_line(line: &SplitLine, mode: SplitMode) -> Self {
        let (percentual_value, fixed_value) = match mode {
            SplitMode::Percentual => (Some(bps_to_percent(line.percentage_bps)), None),
            SplitMode::Fixed => (None, Some(minor_to_major(line.value))),
        };
        Self {
            wallet_id: line.wallet_id.to_string(),
            percentual_value,
            fixed_value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    /// Gateway customer handle.
    pub customer: String,
    pub billing_type: BillingType,
    /// Major currency units, as the gateway expects.
    pub value: f64,
    pub due_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<String>,
    pub split: Vec<SplitInstruction>,
}

impl CreatePaymentRequest {
    pub fn with_split(
        customer: String,
        billing_type: BillingType,
        due_date: NaiveDate,
        external_reference: String,
        split: &SplitResult,
        mode: SplitMode,
    ) -> Self {
        Self {
            customer,
            billing_type,
            value: minor_to_major(split.order_value),
            due_date,
            description: None,
            external_reference: Some(external_reference),
            split: split
                .lines
                .iter()
                .map(|line| SplitInstruction::from_line(line, mode))
                .collect(),
        }
    }

    /// Checks done before any network call.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.customer.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("customer is required".into()));
        }
        if !(self.value > 0.0) {
            return Err(GatewayError::InvalidRequest(format!(
                "value must be positive, got {}",
                self.value
            )));
        }
        for instruction in &self.split {
            WalletId::parse(&instruction.wallet_id)
                .map_err(|_| GatewayError::InvalidWallet(instruction.wallet_id.clone()))?;
            if instruction.percentual_value.is_none() == instruction.fixed_value.is_none() {
                return Err(GatewayError::InvalidRequest(format!(
                    "split for {} needs exactly one of percentualValue or fixedValue",
                    instruction.wallet_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPayment {
    pub id: String,
    pub status: PaymentStatus,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub external_reference: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a payment with its split in one request.
    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<GatewayPayment, GatewayError>;

    async fn get_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError>;
}

pub fn minor_to_major(value: i64) -> f64 {
    value as f64 / 100.0
}

pub fn bps_to_percent(bps: u32) -> f64 {
    bps as f64 * 100.0 / BPS_SCALE as f64
}
