//! Scripted gateway for tests and local runs.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CreatePaymentRequest, GatewayError, GatewayPayment, PaymentGateway, PaymentStatus};

enum Scripted {
    Status(PaymentStatus),
    Failure(u16),
    Hang,
}

#[derive(Default)]
pub struct MockGateway {
    created: Mutex<Vec<CreatePaymentRequest>>,
    script: Mutex<VecDeque<Scripted>>,
    last_status: Mutex<Option<PaymentStatus>>,
    fail_create: Mutex<Option<u16>>,
    create_status: Mutex<Option<PaymentStatus>>,
    status_queries: Mutex<u32>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `get_payment` reports `status`. Once the script runs dry the last
    /// reported status repeats, `PENDING` if none.
    pub async fn push_status(&self, status: PaymentStatus) {
        self.script.lock().await.push_back(Scripted::Status(status));
    }

    /// Next `get_payment` fails with the given HTTP status.
    pub async fn push_failure(&self, status: u16) {
        self.script.lock().await.push_back(Scripted::Failure(status));
    }

    /// Next `get_payment` never completes.
    pub async fn push_hang(&self) {
        self.script.lock().await.push_back(Scripted::Hang);
    }

    pub async fn set_fail_on_create(&self, status: Option<u16>) {
        *self.fail_create.lock().await = status;
    }

    /// Status reported by `create_payment`, `PENDING` if unset.
    pub async fn set_create_status(&self, status: PaymentStatus) {
        *self.create_status.lock().await = Some(status);
    }

    pub async fn created_requests(&self) -> Vec<CreatePaymentRequest> {
        self.created.lock().await.clone()
    }

    pub async fn status_queries(&self) -> u32 {
        *self.status_queries.lock().await
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<GatewayPayment, GatewayError> {
        request.validate()?;
        if let Some(status) = *self.fail_create.lock().await {
            return Err(GatewayError::Status {
                status,
                body: "mock create failure".to_string(),
            });
        }
        let mut created = self.created.lock().await;
        created.push(request.clone());
        Ok(GatewayPayment {
            id: format!("pay_{:06}", created.len()),
            status: self.create_status.lock().await.unwrap_or(PaymentStatus::Pending),
            value: Some(request.value),
            external_reference: request.external_reference.clone(),
        })
    }

    async fn get_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError> {
        *self.status_queries.lock().await += 1;
        let next = self.script.lock().await.pop_front();
        let status = match next {
            Some(Scripted::Status(status)) => {
                *self.last_status.lock().await = Some(status);
                status
            }
            Some(Scripted::Failure(status)) => {
                return Err(GatewayError::Status {
                    status,
                    body: "mock status failure".to_string(),
                });
            }
            Some(Scripted::Hang) => std::future::pending().await,
            None => self.last_status.lock().await.unwrap_or(PaymentStatus::Pending),
        };
        Ok(GatewayPayment {
            id: payment_id.to_string(),
            status,
            value: None,
            external_reference: None,
        })
    }
}
