use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::gateway::GatewayError;
use crate::responses::RequestMeta;
use crate::split::SplitError;
use crate::store::StoreError;
use crate::types::InvalidWalletId;

pub const E_BAD_VALUE: &str = "BAD_VALUE";
pub const E_BAD_WALLET: &str = "BAD_WALLET";
pub const E_DB_FAILURE: &str = "DB_FAILURE";
pub const E_DUPLICATE_SPLIT: &str = "DUPLICATE_SPLIT";
pub const E_CONFLICT: &str = "CONFLICT";
pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_GATEWAY_FAILURE: &str = "GATEWAY_FAILURE";
pub const E_INVALID_SIGNATURE: &str = "INVALID_SIGNATURE";
pub const E_MALFORMED_WEBHOOK: &str = "MALFORMED_WEBHOOK";
pub const E_PAYOUT_WALLET_REQUIRED: &str = "PAYOUT_WALLET_REQUIRED";
pub const E_RATE_LIMITED: &str = "RATE_LIMITED";

/// Domain failures of the commission engine.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Malformed input; never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The order already has a split. Callers treat this as an idempotent success.
    #[error("commission split already exists for order {0}")]
    DuplicateSplit(Uuid),

    #[error("payment gateway failure: {0}")]
    ExternalService(#[from] GatewayError),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("configure your payout wallet before generating referral links")]
    PayoutWalletRequired,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    /// Failures worth another attempt under a bounded retry policy.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Store(StoreError::Database(_)) => true,
            ServiceError::ExternalService(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Maps the domain failure onto the HTTP error envelope.
    pub fn into_api(self, meta: RequestMeta) -> ApiErrorWithMeta {
        let (error, code) = match self {
            ServiceError::Validation(msg) => (ApiError::BadRequest(msg), E_BAD_VALUE),
            ServiceError::DuplicateSplit(order_id) => (
                ApiError::Conflict(format!("split already exists for order {order_id}")),
                E_DUPLICATE_SPLIT,
            ),
            ServiceError::ExternalService(GatewayError::InvalidWallet(wallet)) => (
                ApiError::BadRequest(format!("malformed wallet id `{wallet}`")),
                E_BAD_WALLET,
            ),
            ServiceError::ExternalService(err) => {
                error!("payment gateway failure: {err}");
                (
                    ApiError::BadGateway("payment could not be created, please retry".into()),
                    E_GATEWAY_FAILURE,
                )
            }
            ServiceError::NotFound(what) => (ApiError::NotFound(format!("{what} not found")), E_NOT_FOUND),
            ServiceError::PayoutWalletRequired => (
                ApiError::Forbidden(ServiceError::PayoutWalletRequired.to_string()),
                E_PAYOUT_WALLET_REQUIRED,
            ),
            ServiceError::Store(StoreError::Duplicate(what)) => {
                (ApiError::Conflict(format!("{what} already exists")), E_CONFLICT)
            }
            ServiceError::Store(StoreError::NotFound(what)) => {
                (ApiError::NotFound(format!("{what} not found")), E_NOT_FOUND)
            }
            ServiceError::Store(err) => (ApiError::Internal(err.into()), E_DB_FAILURE),
        };
        error.with_meta(meta).with_code(code)
    }
}

impl From<SplitError> for ServiceError {
    fn from(err: SplitError) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

impl From<InvalidWalletId> for ServiceError {
    fn from(err: InvalidWalletId) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests(String),
    BadGateway(String),
    Internal(anyhow::Error),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn status(&self) -> StatusCode {
        match &self.error {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_message = match self.error {
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::TooManyRequests(msg)
            | ApiError::BadGateway(msg) => msg,
            ApiError::Internal(e) => {
                error!(request_id = %self.meta.request_id, "internal error: {:?}", e);
                "internal server error".to_string()
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}
