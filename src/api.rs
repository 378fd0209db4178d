use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    middleware,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{
    ApiError, ApiErrorWithMeta, E_DB_FAILURE, E_INVALID_SIGNATURE, E_MALFORMED_WEBHOOK,
    E_RATE_LIMITED, ServiceError,
};
use crate::gateway::PaymentGateway;
use crate::polling::{PaymentPoller, PollOutcome};
use crate::rate_limit::RateLimiter;
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::service::{CheckoutReceipt, CheckoutRequest, CommissionService, SplitView};
use crate::split::{PercentageTable, SplitCalculator};
use crate::store::{
    AffiliateRepository, OrderRepository, PollingAuditRepository, SplitRepository,
    WebhookEventRepository,
};
use crate::types::{Affiliate, Campaign, Commission, Order, PollingAuditEntry};
use crate::webhook::{IngestError, IngestOutcome, SIGNATURE_HEADER, WebhookIngestor};

/// Header consulted to key the click rate limiter.
const CLIENT_IP_HEADER: &str = "x-forwarded-for";

/// Polling budget applied to every reconciliation started over HTTP.
#[derive(Debug, Clone, Copy)]
pub struct PollingBudget {
    pub max_attempts: u32,
    pub max_elapsed: Duration,
}

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// Checkout, affiliate and transition operations.
    pub service: Arc<CommissionService>,
    /// Inbound gateway webhooks.
    pub ingestor: Arc<WebhookIngestor>,
    /// Status polling fallback.
    pub poller: Arc<PaymentPoller>,
    /// Polling audit trail reads.
    pub polling_audit: Arc<dyn PollingAuditRepository>,
    /// Limiter for the public click endpoint.
    pub click_limiter: Arc<RateLimiter>,
    pub polling: PollingBudget,
}

impl AppState {
    /// Wires every service over one store and one gateway.
    pub fn new<S>(store: Arc<S>, gateway: Arc<dyn PaymentGateway>, config: &Config) -> Result<Self, ServiceError>
    where
        S: OrderRepository
            + AffiliateRepository
            + SplitRepository
            + WebhookEventRepository
            + PollingAuditRepository
            + 'static,
    {
        let calculator = SplitCalculator::new(PercentageTable::STANDARD, config.managers()?)?;
        let service = Arc::new(
            CommissionService::new(store.clone(), gateway.clone(), calculator)
                .with_split_mode(config.split_mode)
                .with_storefront_url(&config.storefront_url),
        );
        let ingestor = WebhookIngestor::new(
            store.clone(),
            service.clone(),
            config.webhook_secret.clone(),
            config.webhook_retry(),
        );
        let poller = PaymentPoller::new(gateway, store.clone(), config.polling_backoff());

        Ok(Self {
            service,
            ingestor: Arc::new(ingestor),
            poller: Arc::new(poller),
            polling_audit: store,
            click_limiter: Arc::new(RateLimiter::new(
                config.click_rate_limit,
                config.click_rate_window(),
            )),
            polling: PollingBudget {
                max_attempts: config.polling_max_attempts,
                max_elapsed: config.polling_max_elapsed(),
            },
        })
    }
}

/// The request to register an affiliate.
#[derive(Deserialize)]
pub struct CreateAffiliateRequest {
    /// The affiliate's own referral code.
    pub referral_code: String,
    /// The code of the affiliate who referred them.
    #[serde(default)]
    pub referrer_code: Option<String>,
}

#[derive(Deserialize)]
pub struct LinkReferrerRequest {
    pub referrer_id: Uuid,
}

#[derive(Deserialize)]
pub struct ConfigureWalletRequest {
    pub wallet_id: String,
}

/// The response carrying a shareable referral link.
#[derive(Serialize)]
pub struct ReferralLinkResponse {
    pub affiliate_id: Uuid,
    pub link: String,
}

/// The response after scheduling a polling session.
#[derive(Serialize)]
pub struct PollStartedResponse {
    /// The ID to read the audit trail with.
    pub correlation_id: String,
    pub payment_id: String,
    pub max_attempts: u32,
    pub max_elapsed_ms: u64,
}

#[derive(Serialize)]
pub struct PollingTrailResponse {
    pub correlation_id: String,
    pub finished: bool,
    pub attempts: Vec<PollingAuditEntry>,
}

/// The request to record a referral click.
#[derive(Deserialize)]
pub struct ClickRequest {
    pub code: String,
    #[serde(default)]
    pub campaign: Campaign,
}

/// The request to record a referral conversion.
#[derive(Deserialize)]
pub struct ConversionRequest {
    pub code: String,
    pub order_id: Uuid,
}

#[derive(Serialize)]
pub struct ConversionResponse {
    pub order_id: Uuid,
    /// False when the order had already been converted.
    pub recorded: bool,
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/orders", post(create_order_handler))
        .route("/orders/{id}", get(get_order_handler))
        .route("/orders/{id}/split", get(get_split_handler))
        .route("/affiliates", post(create_affiliate_handler))
        .route("/affiliates/{id}/referrer", put(link_referrer_handler))
        .route("/affiliates/{id}/wallet", put(configure_wallet_handler))
        .route("/affiliates/{id}/commissions", get(affiliate_commissions_handler))
        .route("/affiliates/{id}/referral-link", get(referral_link_handler))
        .route("/webhooks/asaas", post(webhook_handler))
        .route("/payments/{payment_id}/poll", post(start_polling_handler))
        .route("/polling/{correlation_id}", get(polling_trail_handler))
        .route("/referrals/clicks", post(referral_click_handler))
        .route("/referrals/conversions", post(referral_conversion_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn create_order_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CheckoutRequest>,
) -> Result<ApiOk<CheckoutReceipt>, ApiErrorWithMeta> {
    let receipt = st
        .service
        .checkout(req)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;

    Ok(ApiOk::created("order created", receipt, meta))
}

async fn get_order_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Order>, ApiErrorWithMeta> {
    let order = st.service.order(id).await.map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("order fetched", order, meta))
}

async fn get_split_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<SplitView>, ApiErrorWithMeta> {
    let view = st
        .service
        .split_view(id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("split fetched", view, meta))
}

async fn create_affiliate_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CreateAffiliateRequest>,
) -> Result<ApiOk<Affiliate>, ApiErrorWithMeta> {
    let affiliate = st
        .service
        .register_affiliate(&req.referral_code, req.referrer_code.as_deref())
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::created("affiliate registered", affiliate, meta))
}

async fn link_referrer_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<LinkReferrerRequest>,
) -> Result<ApiOk<Affiliate>, ApiErrorWithMeta> {
    let affiliate = st
        .service
        .link_referrer(id, req.referrer_id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("referrer linked", affiliate, meta))
}

async fn configure_wallet_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<ConfigureWalletRequest>,
) -> Result<ApiOk<Affiliate>, ApiErrorWithMeta> {
    let affiliate = st
        .service
        .configure_wallet(id, &req.wallet_id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("payout wallet configured", affiliate, meta))
}

async fn affiliate_commissions_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<Commission>>, ApiErrorWithMeta> {
    let rows = st
        .service
        .affiliate_commissions(id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("commissions fetched", rows, meta))
}

async fn referral_link_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<ReferralLinkResponse>, ApiErrorWithMeta> {
    let link = st
        .service
        .referral_link(id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok(
        "referral link generated",
        ReferralLinkResponse {
            affiliate_id: id,
            link,
        },
        meta,
    ))
}

async fn webhook_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiOk<IngestOutcome>, ApiErrorWithMeta> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let outcome = st.ingestor.ingest(&body, signature).await.map_err(|e| match e {
        IngestError::InvalidSignature => ApiError::Unauthorized(e.to_string())
            .with_meta(meta.clone())
            .with_code(E_INVALID_SIGNATURE),
        IngestError::Malformed(_) => ApiError::BadRequest(e.to_string())
            .with_meta(meta.clone())
            .with_code(E_MALFORMED_WEBHOOK),
        IngestError::Store(err) => ApiError::Internal(err.into())
            .with_meta(meta.clone())
            .with_code(E_DB_FAILURE),
    })?;

    let message = if outcome.already_processed {
        "webhook already processed"
    } else {
        "webhook accepted"
    };
    Ok(ApiOk::ok(message, outcome, meta))
}

async fn start_polling_handler(
    State(st): State<AppState>,
    Path(payment_id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<PollStartedResponse>, ApiErrorWithMeta> {
    st.service
        .order_for_payment(&payment_id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;

    let correlation_id = Uuid::new_v4().to_string();
    let budget = st.polling;
    {
        let st = st.clone();
        let correlation_id = correlation_id.clone();
        let payment_id = payment_id.clone();
        tokio::spawn(async move {
            let result = st
                .service
                .reconcile(
                    &st.poller,
                    &correlation_id,
                    &payment_id,
                    budget.max_attempts,
                    budget.max_elapsed,
                )
                .await;
            match result {
                Ok(PollOutcome::Terminal { status, attempts }) => {
                    info!(%correlation_id, %payment_id, status = status.as_str(), attempts, "reconciliation finished")
                }
                Ok(PollOutcome::StillPending { attempts, .. }) => {
                    info!(%correlation_id, %payment_id, attempts, "reconciliation ended, payment still pending")
                }
                Err(err) => error!(%correlation_id, %payment_id, error = %err, "reconciliation failed"),
            }
        });
    }

    Ok(ApiOk::accepted(
        "polling started",
        PollStartedResponse {
            correlation_id,
            payment_id,
            max_attempts: budget.max_attempts,
            max_elapsed_ms: budget.max_elapsed.as_millis() as u64,
        },
        meta,
    ))
}

async fn polling_trail_handler(
    State(st): State<AppState>,
    Path(correlation_id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<PollingTrailResponse>, ApiErrorWithMeta> {
    let attempts = st
        .polling_audit
        .attempts(&correlation_id)
        .await
        .map_err(|e| ServiceError::from(e).into_api(meta.clone()))?;
    if attempts.is_empty() {
        return Err(ServiceError::NotFound("polling session").into_api(meta));
    }

    let finished = attempts.last().is_some_and(|entry| !entry.should_continue);
    Ok(ApiOk::ok(
        "polling trail fetched",
        PollingTrailResponse {
            correlation_id,
            finished,
            attempts,
        },
        meta,
    ))
}

async fn referral_click_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    Json(req): Json<ClickRequest>,
) -> Result<ApiOk<serde_json::Value>, ApiErrorWithMeta> {
    let client = headers
        .get(CLIENT_IP_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .unwrap_or("unknown");
    if !st.click_limiter.check(client).await {
        return Err(ApiError::TooManyRequests("too many referral clicks".into())
            .with_meta(meta)
            .with_code(E_RATE_LIMITED));
    }

    st.service
        .record_click(&req.code, &req.campaign)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::created(
        "click recorded",
        serde_json::json!({ "code": req.code.trim().to_uppercase() }),
        meta,
    ))
}

async fn referral_conversion_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<ConversionRequest>,
) -> Result<ApiOk<ConversionResponse>, ApiErrorWithMeta> {
    let recorded = st
        .service
        .record_conversion(&req.code, req.order_id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    let message = if recorded {
        "conversion recorded"
    } else {
        "conversion already recorded"
    };
    Ok(ApiOk::ok(
        message,
        ConversionResponse {
            order_id: req.order_id,
            recorded,
        },
        meta,
    ))
}
