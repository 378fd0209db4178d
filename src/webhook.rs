//! Inbound gateway webhooks.
//!
//! Each event walks `received -> processing -> completed | failed` exactly once.
//! The store's unique event key decides which delivery owns the event; every
//! other delivery of the same key is acknowledged as already processed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::BackoffPolicy;
use crate::error::ServiceError;
use crate::gateway::PaymentStatus;
use crate::service::{PaymentSignal, PaymentTransition};
use crate::store::{Registration, StoreError, WebhookEventRepository};
use crate::types::{WebhookEventRecord, WebhookState};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("malformed webhook payload: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub accepted: bool,
    pub already_processed: bool,
}

impl IngestOutcome {
    fn accepted() -> Self {
        Self {
            accepted: true,
            already_processed: false,
        }
    }

    fn already_processed() -> Self {
        Self {
            accepted: true,
            already_processed: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    PaymentCreated,
    PaymentConfirmed,
    PaymentReceived,
    PaymentOverdue,
    PaymentRefunded,
    PaymentDeleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    Unrecognized(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "PAYMENT_CREATED" => EventKind::PaymentCreated,
            "PAYMENT_CONFIRMED" => EventKind::PaymentConfirmed,
            "PAYMENT_RECEIVED" => EventKind::PaymentReceived,
            "PAYMENT_OVERDUE" => EventKind::PaymentOverdue,
            "PAYMENT_REFUNDED" => EventKind::PaymentRefunded,
            "PAYMENT_DELETED" => EventKind::PaymentDeleted,
            "SUBSCRIPTION_CREATED" => EventKind::SubscriptionCreated,
            "SUBSCRIPTION_UPDATED" => EventKind::SubscriptionUpdated,
            "SUBSCRIPTION_DELETED" => EventKind::SubscriptionDeleted,
            other => EventKind::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::PaymentCreated => "PAYMENT_CREATED",
            EventKind::PaymentConfirmed => "PAYMENT_CONFIRMED",
            EventKind::PaymentReceived => "PAYMENT_RECEIVED",
            EventKind::PaymentOverdue => "PAYMENT_OVERDUE",
            EventKind::PaymentRefunded => "PAYMENT_REFUNDED",
            EventKind::PaymentDeleted => "PAYMENT_DELETED",
            EventKind::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            EventKind::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            EventKind::SubscriptionDeleted => "SUBSCRIPTION_DELETED",
            EventKind::Unrecognized(raw) => raw,
        }
    }

    fn requires_payment(&self) -> bool {
        self.as_str().starts_with("PAYMENT_")
    }

    fn requires_subscription(&self) -> bool {
        self.as_str().starts_with("SUBSCRIPTION_")
    }

    pub fn transition(&self) -> Option<PaymentTransition> {
        match self {
            EventKind::PaymentConfirmed => Some(PaymentTransition::Confirmed),
            EventKind::PaymentReceived => Some(PaymentTransition::Received),
            EventKind::PaymentOverdue => Some(PaymentTransition::Overdue),
            EventKind::PaymentRefunded => Some(PaymentTransition::Refunded),
            EventKind::PaymentDeleted => Some(PaymentTransition::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    date_created: Option<String>,
    #[serde(default)]
    payment: Option<WebhookPayment>,
    #[serde(default)]
    subscription: Option<WebhookSubscription>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayment {
    pub id: String,
    #[serde(default)]
    pub status: Option<PaymentStatus>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub date_created: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WebhookSubscription {
    id: String,
}

/// A structurally valid webhook, ready for registration.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub key: String,
    pub kind: EventKind,
    pub payment: Option<WebhookPayment>,
    pub raw: serde_json::Value,
}

impl ParsedEvent {
    pub fn parse(body: &[u8]) -> Result<Self, IngestError> {
        let raw: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| IngestError::Malformed(e.to_string()))?;
        let payload: WebhookPayload = serde_json::from_value(raw.clone())
            .map_err(|e| IngestError::Malformed(e.to_string()))?;

        let event = payload
            .event
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| IngestError::Malformed("missing event type".into()))?;
        let kind = EventKind::parse(&event);

        let subject_id = match (&payload.payment, &payload.subscription) {
            (Some(payment), _) if kind.requires_payment() => payment.id.clone(),
            (_, Some(subscription)) if kind.requires_subscription() => subscription.id.clone(),
            (None, _) if kind.requires_payment() => {
                return Err(IngestError::Malformed(format!("{event} without payment")));
            }
            (_, None) if kind.requires_subscription() => {
                return Err(IngestError::Malformed(format!("{event} without subscription")));
            }
            (payment, subscription) => payment
                .as_ref()
                .map(|p| p.id.clone())
                .or_else(|| subscription.as_ref().map(|s| s.id.clone()))
                .unwrap_or_default(),
        };

        let key = match payload.id.filter(|id| !id.trim().is_empty()) {
            Some(id) => id,
            None => {
                let timestamp = payload
                    .date_created
                    .or_else(|| payload.payment.as_ref().and_then(|p| p.date_created.clone()))
                    .unwrap_or_default();
                format!("{event}:{subject_id}:{timestamp}")
            }
        };

        Ok(Self {
            key,
            kind,
            payment: payload.payment,
            raw,
        })
    }

    fn signal(&self) -> Option<PaymentSignal> {
        let transition = self.kind.transition()?;
        let payment = self.payment.as_ref()?;
        Some(PaymentSignal {
            transition,
            payment_id: payment.id.clone(),
            external_reference: payment.external_reference.clone(),
        })
    }
}

/// Applies payment signals to local state. Must be idempotent.
#[async_trait]
pub trait PaymentEventHandler: Send + Sync {
    async fn apply(&self, signal: &PaymentSignal) -> Result<String, ServiceError>;
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature, optionally prefixed `sha256=`.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub struct WebhookIngestor {
    events: Arc<dyn WebhookEventRepository>,
    handler: Arc<dyn PaymentEventHandler>,
    secret: Option<String>,
    retry: BackoffPolicy,
}

impl WebhookIngestor {
    pub fn new(
        events: Arc<dyn WebhookEventRepository>,
        handler: Arc<dyn PaymentEventHandler>,
        secret: Option<String>,
        retry: BackoffPolicy,
    ) -> Self {
        Self {
            events,
            handler,
            secret: secret.filter(|s| !s.is_empty()),
            retry,
        }
    }

    /// Validates, deduplicates and dispatches one delivery.
    ///
    /// Only signature, parse and registration failures surface as errors.
    /// Handler failures are recorded on the event and acknowledged so the
    /// gateway does not keep redelivering a poison event.
    pub async fn ingest(&self, body: &[u8], signature: Option<&str>) -> Result<IngestOutcome, IngestError> {
        if let Some(secret) = &self.secret {
            let valid = signature.is_some_and(|sig| verify_signature(secret.as_bytes(), body, sig));
            if !valid {
                warn!("webhook rejected: invalid signature");
                return Err(IngestError::InvalidSignature);
            }
        }

        let event = ParsedEvent::parse(body)?;
        let payment_id = event.payment.as_ref().map(|p| p.id.clone());
        let record = WebhookEventRecord {
            id: Uuid::new_v4(),
            event_key: event.key.clone(),
            event_type: event.kind.as_str().to_string(),
            payment_id: payment_id.clone(),
            payload: event.raw.clone(),
            state: WebhookState::Received,
            processed: false,
            result: None,
            created_at: Utc::now(),
            processed_at: None,
        };

        if let Registration::AlreadyRegistered(existing) = self.events.register_event(&record).await? {
            info!(
                event_key = %event.key,
                state = %existing.state,
                "duplicate webhook delivery acknowledged"
            );
            return Ok(IngestOutcome::already_processed());
        }

        if let Err(err) = self.events.set_event_state(record.id, WebhookState::Processing).await {
            warn!(event_key = %event.key, error = %err, "could not mark webhook as processing");
        }

        let (state, result) = match self.dispatch(&event).await {
            Ok(detail) => {
                info!(
                    event_key = %event.key,
                    event_type = event.kind.as_str(),
                    payment_id = payment_id.as_deref().unwrap_or(""),
                    detail = %detail,
                    "webhook processed"
                );
                (WebhookState::Completed, detail)
            }
            Err(err) => {
                error!(
                    event_key = %event.key,
                    event_type = event.kind.as_str(),
                    payment_id = payment_id.as_deref().unwrap_or(""),
                    error = %err,
                    "webhook handler failed"
                );
                (WebhookState::Failed, err.to_string())
            }
        };

        if let Err(err) = self.events.finish_event(record.id, state, &result).await {
            error!(event_key = %event.key, error = %err, "could not record webhook outcome");
        }
        Ok(IngestOutcome::accepted())
    }

    async fn dispatch(&self, event: &ParsedEvent) -> Result<String, ServiceError> {
        let Some(signal) = event.signal() else {
            info!(event_type = event.kind.as_str(), "webhook acknowledged without action");
            return Ok(format!("{} acknowledged", event.kind.as_str()));
        };

        (|| self.handler.apply(&signal))
            .retry(self.retry.builder())
            .when(ServiceError::is_transient)
            .notify(|err: &ServiceError, dur: Duration| {
                warn!(
                    payment_id = %signal.payment_id,
                    error = %err,
                    delay = ?dur,
                    "transient webhook handler failure, retrying"
                );
            })
            .await
    }
}
