#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, Response};
use commission_engine::config::Config;
use commission_engine::gateway::MockGateway;
use commission_engine::service::CommissionService;
use commission_engine::store::MemoryStore;
use commission_engine::types::Affiliate;
use commission_engine::{AppState, init_router};
use serde_json::Value;

pub const MANAGER_A: &str = "wal_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const MANAGER_B: &str = "wal_bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
pub const WEBHOOK_SECRET: &str = "whsec_integration";

pub fn wallet(n: u8) -> String {
    format!("wal_{:0>32}", n)
}

pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut builder = config::Config::builder()
        .set_override("manager_a_wallet", MANAGER_A)
        .unwrap()
        .set_override("manager_b_wallet", MANAGER_B)
        .unwrap()
        .set_override("storefront_url", "https://shop.example")
        .unwrap()
        .set_override("polling_max_attempts", "3")
        .unwrap()
        .set_override("polling_initial_delay_ms", "5")
        .unwrap()
        .set_override("polling_max_delay_ms", "5")
        .unwrap()
        .set_override("webhook_retry_delay_ms", "1")
        .unwrap();
    for (key, value) in overrides {
        builder = builder.set_override(*key, *value).unwrap();
    }
    builder.build().unwrap().try_deserialize().unwrap()
}

pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<MockGateway>,
    pub state: AppState,
}

impl TestApp {
    pub fn new(overrides: &[(&str, &str)]) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let state = AppState::new(store.clone(), gateway.clone(), &test_config(overrides)).unwrap();
        Self {
            store,
            gateway,
            state,
        }
    }

    pub fn service(&self) -> &CommissionService {
        &self.state.service
    }

    pub fn router(&self) -> Router {
        init_router(self.state.clone())
    }

    /// Registers an affiliate with a configured payout wallet.
    pub async fn funded_affiliate(&self, code: &str, referrer: Option<&str>, n: u8) -> Affiliate {
        let affiliate = self.service().register_affiliate(code, referrer).await.unwrap();
        self.service()
            .configure_wallet(affiliate.id, &wallet(n))
            .await
            .unwrap()
    }
}

pub fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn read_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn webhook_body(event_id: &str, event: &str, payment_id: &str) -> Vec<u8> {
    serde_json::json!({
        "id": event_id,
        "event": event,
        "payment": { "id": payment_id, "status": "CONFIRMED", "value": 3290.0 }
    })
    .to_string()
    .into_bytes()
}
