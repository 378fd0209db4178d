mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use commission_engine::gateway::{
    BillingType, CreatePaymentRequest, GatewayError, GatewayPayment, MockGateway, PaymentGateway,
    PaymentStatus,
};
use commission_engine::polling::PollOutcome;
use commission_engine::service::{
    CheckoutRequest, CheckoutReceipt, CommissionService, PaymentSignal, PaymentTransition,
};
use commission_engine::split::{PercentageTable, SplitCalculator, SplitTag};
use commission_engine::store::{MemoryStore, OrderRepository, SplitRepository};
use commission_engine::types::{CommissionStatus, OrderStatus};
use commission_engine::webhook::{PaymentEventHandler, WebhookIngestor};
use common::{MANAGER_A, MANAGER_B, TestApp, test_config, webhook_body};

fn checkout(value: i64, referral_code: Option<&str>) -> CheckoutRequest {
    CheckoutRequest {
        value,
        customer: "cus_000042".into(),
        billing_type: BillingType::Boleto,
        due_date: None,
        referral_code: referral_code.map(str::to_string),
    }
}

/// TOP refers MID, MID refers ABC123; all three have payout wallets.
async fn three_level_network(app: &TestApp) {
    app.funded_affiliate("top", None, 3).await;
    app.funded_affiliate("mid", Some("top"), 2).await;
    app.funded_affiliate("abc123", Some("mid"), 1).await;
}

fn line_value(receipt: &CheckoutReceipt, tag: SplitTag) -> Option<i64> {
    receipt.split.line(tag).map(|line| line.value)
}

fn ingestor(app: &TestApp) -> &WebhookIngestor {
    &app.state.ingestor
}

fn calculator() -> SplitCalculator {
    SplitCalculator::new(PercentageTable::STANDARD, test_config(&[]).managers().unwrap()).unwrap()
}

async fn commission_statuses(app: &TestApp, receipt: &CheckoutReceipt) -> Vec<CommissionStatus> {
    app.store
        .commissions_for_order(receipt.order.id)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.status)
        .collect()
}

/// Gateway whose payment is decided, and reported by webhook, before
/// `create_payment` returns to checkout.
struct RacingGateway {
    inner: MockGateway,
    webhook_side: CommissionService,
    transition: PaymentTransition,
}

impl RacingGateway {
    fn new(store: Arc<MemoryStore>, transition: PaymentTransition) -> Self {
        Self {
            inner: MockGateway::new(),
            webhook_side: CommissionService::new(store, Arc::new(MockGateway::new()), calculator()),
            transition,
        }
    }
}

#[async_trait]
impl PaymentGateway for RacingGateway {
    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<GatewayPayment, GatewayError> {
        let payment = self.inner.create_payment(request).await?;
        let signal = PaymentSignal {
            transition: self.transition,
            payment_id: payment.id.clone(),
            external_reference: request.external_reference.clone(),
        };
        let detail = self.webhook_side.apply(&signal).await.unwrap();
        assert!(detail.contains("0 commission(s)"), "{detail}");
        Ok(payment)
    }

    async fn get_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError> {
        self.inner.get_payment(payment_id).await
    }
}

#[tokio::test]
async fn full_network_checkout_sends_five_lines_with_the_payment() {
    let app = TestApp::new(&[]);
    three_level_network(&app).await;

    let receipt = app.service().checkout(checkout(329_000, Some("abc123"))).await.unwrap();

    assert_eq!(line_value(&receipt, SplitTag::N1), Some(49_350));
    assert_eq!(line_value(&receipt, SplitTag::N2), Some(9_870));
    assert_eq!(line_value(&receipt, SplitTag::N3), Some(6_580));
    assert_eq!(line_value(&receipt, SplitTag::ManagerA), Some(16_450));
    assert_eq!(line_value(&receipt, SplitTag::ManagerB), Some(16_450));
    assert_eq!(receipt.split.commission_value(), 98_700);
    assert!(receipt.split.redistribution.is_none());

    let sent = app.gateway.created_requests().await;
    assert_eq!(sent.len(), 1);
    let percents: Vec<f64> = sent[0].split.iter().filter_map(|s| s.percentual_value).collect();
    assert_eq!(percents, vec![15.0, 3.0, 2.0, 5.0, 5.0]);
    assert_eq!(sent[0].external_reference, Some(receipt.order.id.to_string()));

    let rows = app.store.commissions_for_order(receipt.order.id).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|row| row.status == CommissionStatus::Calculated));
}

#[tokio::test]
async fn order_without_network_pays_managers_fifteen_percent_each() {
    let app = TestApp::new(&[]);

    let receipt = app.service().checkout(checkout(329_000, None)).await.unwrap();

    assert_eq!(receipt.split.lines.len(), 2);
    assert_eq!(line_value(&receipt, SplitTag::ManagerA), Some(49_350));
    assert_eq!(line_value(&receipt, SplitTag::ManagerB), Some(49_350));
    let sent = app.gateway.created_requests().await;
    assert_eq!(sent[0].split[0].wallet_id, MANAGER_A);
    assert_eq!(sent[0].split[1].wallet_id, MANAGER_B);
    assert_eq!(app.store.commission_count().await, 0);
}

#[tokio::test]
async fn unfunded_affiliate_is_treated_as_absent() {
    let app = TestApp::new(&[]);
    app.service().register_affiliate("abc123", None).await.unwrap();

    let with_pending = app.service().checkout(checkout(329_000, Some("abc123"))).await.unwrap();
    let without = app.service().checkout(checkout(329_000, None)).await.unwrap();

    assert_eq!(with_pending.split.lines, without.split.lines);
    assert_eq!(app.store.commission_count().await, 0);
}

#[tokio::test]
async fn repeated_confirmation_webhook_moves_state_once() {
    let app = TestApp::new(&[]);
    three_level_network(&app).await;
    let receipt = app.service().checkout(checkout(329_000, Some("abc123"))).await.unwrap();
    let body = webhook_body("evt_confirm_1", "PAYMENT_CONFIRMED", &receipt.payment_id);

    let first = ingestor(&app).ingest(&body, None).await.unwrap();
    let rows_after_first = app.store.commission_count().await;
    let second = ingestor(&app).ingest(&body, None).await.unwrap();

    assert!(!first.already_processed);
    assert!(second.already_processed);
    assert_eq!(app.store.commission_count().await, rows_after_first);
    assert_eq!(rows_after_first, 3);

    let order = app.store.get_order(receipt.order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    let rows = app.store.commissions_for_order(receipt.order.id).await.unwrap();
    assert!(rows.iter().all(|row| row.status == CommissionStatus::Pending));
}

#[tokio::test]
async fn concurrent_deliveries_of_one_event_converge() {
    let app = TestApp::new(&[]);
    three_level_network(&app).await;
    let receipt = app.service().checkout(checkout(329_000, Some("abc123"))).await.unwrap();
    let body = Arc::new(webhook_body("evt_race", "PAYMENT_RECEIVED", &receipt.payment_id));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let ingestor = app.state.ingestor.clone();
            let body = body.clone();
            tokio::spawn(async move { ingestor.ingest(&body, None).await.unwrap() })
        })
        .collect();
    let mut fresh = 0;
    for task in tasks {
        if !task.await.unwrap().already_processed {
            fresh += 1;
        }
    }

    assert_eq!(fresh, 1);
    assert_eq!(app.store.commission_count().await, 3);
    let rows = app.store.commissions_for_order(receipt.order.id).await.unwrap();
    assert!(rows.iter().all(|row| row.status == CommissionStatus::Paid));
}

#[tokio::test]
async fn refund_after_payment_fails_the_commissions() {
    let app = TestApp::new(&[]);
    three_level_network(&app).await;
    let receipt = app.service().checkout(checkout(100_000, Some("abc123"))).await.unwrap();

    ingestor(&app)
        .ingest(&webhook_body("evt_r1", "PAYMENT_RECEIVED", &receipt.payment_id), None)
        .await
        .unwrap();
    ingestor(&app)
        .ingest(&webhook_body("evt_r2", "PAYMENT_REFUNDED", &receipt.payment_id), None)
        .await
        .unwrap();

    let order = app.store.get_order(receipt.order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Refunded);
    let rows = app.store.commissions_for_order(receipt.order.id).await.unwrap();
    assert!(rows.iter().all(|row| row.status == CommissionStatus::Failed));
}

#[tokio::test]
async fn webhook_for_unknown_payment_is_acknowledged_and_recorded_as_failed() {
    let app = TestApp::new(&[]);

    let outcome = ingestor(&app)
        .ingest(&webhook_body("evt_orphan", "PAYMENT_CONFIRMED", "pay_missing"), None)
        .await
        .unwrap();

    assert!(outcome.accepted);
    let event = commission_engine::store::WebhookEventRepository::get_event(app.store.as_ref(), "evt_orphan")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.result.as_deref(), Some("order not found"));
}

#[tokio::test]
async fn gateway_rejection_persists_no_split() {
    let app = TestApp::new(&[]);
    three_level_network(&app).await;
    app.gateway.set_fail_on_create(Some(503)).await;

    let result = app.service().checkout(checkout(329_000, Some("abc123"))).await;

    assert!(result.is_err());
    assert_eq!(app.store.split_count().await, 0);
    assert_eq!(app.store.commission_count().await, 0);
}

#[tokio::test]
async fn second_split_for_an_order_is_rejected() {
    let app = TestApp::new(&[]);
    let receipt = app.service().checkout(checkout(50_000, None)).await.unwrap();

    let persister = commission_engine::persist::CommissionSplitPersister::new(app.store.clone());
    let err = persister.persist(receipt.order.id, &receipt.split).await.unwrap_err();

    assert!(matches!(err, commission_engine::ServiceError::DuplicateSplit(_)));
    assert_eq!(app.store.split_count().await, 1);
}

#[tokio::test]
async fn polling_reconciles_a_payment_without_webhook() {
    let app = TestApp::new(&[]);
    three_level_network(&app).await;
    let receipt = app.service().checkout(checkout(329_000, Some("abc123"))).await.unwrap();
    app.gateway.push_status(PaymentStatus::Pending).await;
    app.gateway.push_status(PaymentStatus::Received).await;

    let outcome = app
        .service()
        .reconcile(&app.state.poller, "corr-flow", &receipt.payment_id, 5, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        PollOutcome::Terminal {
            status: PaymentStatus::Received,
            attempts: 2
        }
    );
    let order = app.store.get_order(receipt.order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    let rows = app.store.commissions_for_order(receipt.order.id).await.unwrap();
    assert!(rows.iter().all(|row| row.status == CommissionStatus::Paid));
}

#[tokio::test]
async fn exhausted_polling_leaves_the_order_pending() {
    let app = TestApp::new(&[]);
    let receipt = app.service().checkout(checkout(10_000, None)).await.unwrap();

    let outcome = app
        .service()
        .reconcile(&app.state.poller, "corr-pending", &receipt.payment_id, 3, Duration::from_secs(10))
        .await
        .unwrap();

    assert!(matches!(outcome, PollOutcome::StillPending { attempts: 3, .. }));
    let order = app.store.get_order(receipt.order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
}

#[tokio::test]
async fn webhook_racing_checkout_still_settles_the_commissions() {
    let app = TestApp::new(&[]);
    three_level_network(&app).await;
    let gateway = Arc::new(RacingGateway::new(app.store.clone(), PaymentTransition::Received));
    gateway.inner.push_status(PaymentStatus::Received).await;
    let service = CommissionService::new(app.store.clone(), gateway.clone(), calculator());

    let receipt = service.checkout(checkout(329_000, Some("abc123"))).await.unwrap();

    assert_eq!(receipt.order.status, OrderStatus::Paid);
    assert_eq!(commission_statuses(&app, &receipt).await, vec![CommissionStatus::Paid; 3]);
    assert_eq!(gateway.inner.status_queries().await, 1);
}

#[tokio::test]
async fn racing_webhook_falls_back_to_the_order_status_when_the_gateway_is_down() {
    let app = TestApp::new(&[]);
    three_level_network(&app).await;
    let gateway = Arc::new(RacingGateway::new(app.store.clone(), PaymentTransition::Confirmed));
    gateway.inner.push_failure(503).await;
    let service = CommissionService::new(app.store.clone(), gateway.clone(), calculator());

    let receipt = service.checkout(checkout(329_000, Some("abc123"))).await.unwrap();

    assert_eq!(receipt.order.status, OrderStatus::Paid);
    assert_eq!(commission_statuses(&app, &receipt).await, vec![CommissionStatus::Pending; 3]);
}

#[tokio::test]
async fn card_payment_received_at_creation_pays_the_commissions() {
    let app = TestApp::new(&[]);
    three_level_network(&app).await;
    app.gateway.set_create_status(PaymentStatus::Received).await;

    let receipt = app.service().checkout(checkout(329_000, Some("abc123"))).await.unwrap();

    assert_eq!(receipt.order.status, OrderStatus::Paid);
    assert_eq!(commission_statuses(&app, &receipt).await, vec![CommissionStatus::Paid; 3]);
}

#[tokio::test]
async fn overdue_then_received_pays_the_affiliates() {
    let app = TestApp::new(&[]);
    three_level_network(&app).await;
    let receipt = app.service().checkout(checkout(329_000, Some("abc123"))).await.unwrap();

    ingestor(&app)
        .ingest(&webhook_body("evt_o1", "PAYMENT_OVERDUE", &receipt.payment_id), None)
        .await
        .unwrap();
    let order = app.store.get_order(receipt.order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::PastDue);
    assert_eq!(commission_statuses(&app, &receipt).await, vec![CommissionStatus::Calculated; 3]);

    ingestor(&app)
        .ingest(&webhook_body("evt_o2", "PAYMENT_RECEIVED", &receipt.payment_id), None)
        .await
        .unwrap();
    let order = app.store.get_order(receipt.order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(commission_statuses(&app, &receipt).await, vec![CommissionStatus::Paid; 3]);
}

#[tokio::test]
async fn overdue_then_deleted_fails_the_commissions() {
    let app = TestApp::new(&[]);
    three_level_network(&app).await;
    let receipt = app.service().checkout(checkout(329_000, Some("abc123"))).await.unwrap();

    for (id, event) in [("evt_d1", "PAYMENT_OVERDUE"), ("evt_d2", "PAYMENT_DELETED")] {
        ingestor(&app)
            .ingest(&webhook_body(id, event, &receipt.payment_id), None)
            .await
            .unwrap();
    }

    let order = app.store.get_order(receipt.order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(commission_statuses(&app, &receipt).await, vec![CommissionStatus::Failed; 3]);
}

#[tokio::test]
async fn confirmation_arriving_after_refund_is_ignored() {
    let app = TestApp::new(&[]);
    three_level_network(&app).await;
    let receipt = app.service().checkout(checkout(329_000, Some("abc123"))).await.unwrap();

    for (id, event) in [("evt_x1", "PAYMENT_REFUNDED"), ("evt_x2", "PAYMENT_CONFIRMED")] {
        ingestor(&app)
            .ingest(&webhook_body(id, event, &receipt.payment_id), None)
            .await
            .unwrap();
    }

    let order = app.store.get_order(receipt.order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Refunded);
    assert_eq!(commission_statuses(&app, &receipt).await, vec![CommissionStatus::Failed; 3]);
}
