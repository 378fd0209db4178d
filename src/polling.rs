//! Direct status polling for payments whose webhook never arrived.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use chrono::Utc;
use tokio::time::{Instant, sleep, timeout};
use tracing::{error, info, warn};

use crate::config::BackoffPolicy;
use crate::error::ServiceError;
use crate::gateway::{PaymentGateway, PaymentStatus};
use crate::store::PollingAuditRepository;
use crate::types::PollingAuditEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Terminal {
        status: PaymentStatus,
        attempts: u32,
    },
    /// Budget exhausted; the order stays pending until a webhook arrives.
    StillPending {
        last_status: Option<PaymentStatus>,
        attempts: u32,
    },
}

impl PollOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Terminal { attempts, .. } | PollOutcome::StillPending { attempts, .. } => *attempts,
        }
    }
}

pub struct PaymentPoller {
    gateway: Arc<dyn PaymentGateway>,
    audit: Arc<dyn PollingAuditRepository>,
    backoff: BackoffPolicy,
}

impl PaymentPoller {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        audit: Arc<dyn PollingAuditRepository>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            gateway,
            audit,
            backoff,
        }
    }

    /// Queries the gateway until the payment is terminal or the budget runs
    /// out, writing one audit entry per attempt.
    ///
    /// A further attempt is only scheduled when the next backoff delay still
    /// fits in `max_elapsed`, and each gateway call is cut off at the
    /// remaining budget, so the session never outlives it. The last entry
    /// written always has `should_continue = false`.
    pub async fn poll(
        &self,
        correlation_id: &str,
        payment_id: &str,
        max_attempts: u32,
        max_elapsed: Duration,
    ) -> Result<PollOutcome, ServiceError> {
        if max_attempts == 0 || max_elapsed.is_zero() {
            return Err(ServiceError::Validation(
                "polling needs at least one attempt and a positive time budget".into(),
            ));
        }

        let started = Instant::now();
        let mut delays = self.backoff.builder().build();
        let mut last_status = None;

        for attempt in 1..=max_attempts {
            let attempt_started = Instant::now();
            let remaining = max_elapsed.saturating_sub(started.elapsed());

            let (status, failure, timed_out) =
                match timeout(remaining, self.gateway.get_payment(payment_id)).await {
                    Ok(Ok(payment)) => (Some(payment.status), None, false),
                    Ok(Err(err)) => (None, Some(err.to_string()), false),
                    Err(_) => (
                        None,
                        Some("gateway request exceeded the polling budget".to_string()),
                        true,
                    ),
                };
            if status.is_some() {
                last_status = status;
            }

            let elapsed = started.elapsed();
            let terminal = status.is_some_and(|s| s.is_terminal());
            let next_delay = delays.next().unwrap_or(self.backoff.max_delay);
            let out_of_time = timed_out || elapsed + next_delay >= max_elapsed;
            let should_continue = !terminal && attempt < max_attempts && !out_of_time;

            let entry = PollingAuditEntry {
                correlation_id: correlation_id.to_string(),
                payment_id: payment_id.to_string(),
                attempt,
                status: status.map(|s| s.as_str().to_string()),
                success: status.is_some(),
                attempt_duration_ms: attempt_started.elapsed().as_millis() as u64,
                elapsed_ms: elapsed.as_millis() as u64,
                timeout_reached: !terminal && out_of_time,
                should_continue,
                error: failure.clone(),
                created_at: Utc::now(),
            };
            if let Err(err) = self.audit.append_attempt(&entry).await {
                error!(correlation_id, payment_id, attempt, error = %err, "polling audit write failed");
                return Err(err.into());
            }

            match &failure {
                Some(reason) => warn!(correlation_id, payment_id, attempt, error = %reason, "payment poll attempt failed"),
                None => info!(
                    correlation_id,
                    payment_id,
                    attempt,
                    status = entry.status.as_deref().unwrap_or(""),
                    elapsed_ms = entry.elapsed_ms,
                    should_continue,
                    "payment poll attempt"
                ),
            }

            if let (true, Some(status)) = (terminal, status) {
                return Ok(PollOutcome::Terminal {
                    status,
                    attempts: attempt,
                });
            }
            if !should_continue {
                warn!(correlation_id, payment_id, attempts = attempt, "polling budget exhausted, payment still pending");
                return Ok(PollOutcome::StillPending {
                    last_status,
                    attempts: attempt,
                });
            }
            sleep(next_delay).await;
        }

        Ok(PollOutcome::StillPending {
            last_status,
            attempts: max_attempts,
        })
    }
}
