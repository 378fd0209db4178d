//! HTTP client for the Asaas payments API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{CreatePaymentRequest, GatewayError, GatewayPayment, PaymentGateway};

pub const DEFAULT_BASE_URL: &str = "https://api.asaas.com/v3";

const ACCESS_TOKEN_HEADER: &str = "access_token";

pub struct AsaasClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AsaasClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, GatewayError> {
        if api_key.trim().is_empty() {
            return Err(GatewayError::Config("ASAAS_API_KEY not set".to_string()));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn read<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, body = %body, "gateway request failed");
        Err(GatewayError::Status {
            status: status.as_u16(),
            body: body.chars().take(200).collect(),
        })
    }
}

#[async_trait]
impl PaymentGateway for AsaasClient {
    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<GatewayPayment, GatewayError> {
        request.validate()?;

        let response = self
            .client
            .post(format!("{}/payments", self.base_url))
            .header(ACCESS_TOKEN_HEADER, &self.api_key)
            .json(request)
            .send()
            .await?;
        let payment: GatewayPayment = Self::read(response).await?;

        debug!(
            payment_id = %payment.id,
            split_lines = request.split.len(),
            "payment created with split"
        );
        Ok(payment)
    }

    async fn get_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError> {
        if payment_id.trim().is_empty() || payment_id.contains('/') {
            return Err(GatewayError::InvalidRequest(format!(
                "malformed payment id `{payment_id}`"
            )));
        }
        let response = self
            .client
            .get(format!("{}/payments/{}", self.base_url, payment_id))
            .header(ACCESS_TOKEN_HEADER, &self.api_key)
            .send()
            .await?;
        Self::read(response).await
    }
}
