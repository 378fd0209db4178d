//! Checkout orchestration and payment-driven status transitions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::gateway::{
    BillingType, CreatePaymentRequest, GatewayPayment, PaymentGateway, PaymentStatus, SplitMode,
};
use crate::network::NetworkResolver;
use crate::persist::CommissionSplitPersister;
use crate::polling::{PaymentPoller, PollOutcome};
use crate::split::{SplitCalculator, SplitResult};
use crate::store::{AffiliateRepository, OrderRepository, SplitRepository, StoreError};
use crate::types::{
    Affiliate, Campaign, Commission, CommissionSplit, CommissionStatus, FinancialStatus, Order,
    OrderStatus, WalletId, normalize_referral_code,
};
use crate::webhook::PaymentEventHandler;

/// Days until a boleto/pix charge is due when checkout gives no date.
const DEFAULT_DUE_DAYS: u64 = 3;

/// Local effect of a gateway payment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PaymentTransition {
    Confirmed,
    Received,
    Overdue,
    Refunded,
    Cancelled,
}

struct TransitionPlan {
    order_from: &'static [OrderStatus],
    order_to: OrderStatus,
    /// `None` leaves the commission rows untouched.
    commissions: Option<(&'static [CommissionStatus], CommissionStatus)>,
}

impl PaymentTransition {
    /// Transition for a polled status; `None` while the payment is undecided.
    pub fn from_status(status: PaymentStatus) -> Option<Self> {
        match status {
            PaymentStatus::Confirmed => Some(PaymentTransition::Confirmed),
            PaymentStatus::Received | PaymentStatus::ReceivedInCash => Some(PaymentTransition::Received),
            PaymentStatus::Overdue => Some(PaymentTransition::Overdue),
            PaymentStatus::Refunded => Some(PaymentTransition::Refunded),
            PaymentStatus::Failed
            | PaymentStatus::Refused
            | PaymentStatus::Cancelled
            | PaymentStatus::Deleted => Some(PaymentTransition::Cancelled),
            PaymentStatus::Pending | PaymentStatus::Unknown => None,
        }
    }

    /// Transition that would have produced `status`. Used when the gateway
    /// cannot be asked which one it was.
    fn reaching(status: OrderStatus) -> Option<Self> {
        match status {
            OrderStatus::Pending => None,
            OrderStatus::PastDue => Some(PaymentTransition::Overdue),
            OrderStatus::Paid => Some(PaymentTransition::Confirmed),
            OrderStatus::Failed => Some(PaymentTransition::Cancelled),
            OrderStatus::Refunded => Some(PaymentTransition::Refunded),
        }
    }

    fn plan(&self) -> TransitionPlan {
        use CommissionStatus as C;
        use OrderStatus as O;
        match self {
            PaymentTransition::Confirmed => TransitionPlan {
                order_from: &[O::Pending, O::PastDue],
                order_to: O::Paid,
                commissions: Some((&[C::Calculated], C::Pending)),
            },
            PaymentTransition::Received => TransitionPlan {
                order_from: &[O::Pending, O::PastDue],
                order_to: O::Paid,
                commissions: Some((&[C::Calculated, C::Pending], C::Paid)),
            },
            PaymentTransition::Overdue => TransitionPlan {
                order_from: &[O::Pending],
                order_to: O::PastDue,
                commissions: None,
            },
            PaymentTransition::Cancelled => TransitionPlan {
                order_from: &[O::Pending, O::PastDue],
                order_to: O::Failed,
                commissions: Some((&[C::Calculated, C::Pending], C::Failed)),
            },
            PaymentTransition::Refunded => TransitionPlan {
                order_from: &[O::Pending, O::PastDue, O::Paid],
                order_to: O::Refunded,
                commissions: Some((&[C::Calculated, C::Pending, C::Paid], C::Failed)),
            },
        }
    }
}

/// A payment status change reported by a webhook or a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSignal {
    pub transition: PaymentTransition,
    pub payment_id: String,
    /// Our order id as echoed back by the gateway.
    pub external_reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    /// Order total in minor currency units.
    pub value: i64,
    pub customer: String,
    pub billing_type: BillingType,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub referral_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutReceipt {
    pub order: Order,
    pub payment_id: String,
    pub split_id: Uuid,
    pub split: SplitResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct SplitView {
    pub split: CommissionSplit,
    pub commissions: Vec<Commission>,
}

pub struct CommissionService {
    orders: Arc<dyn OrderRepository>,
    affiliates: Arc<dyn AffiliateRepository>,
    splits: Arc<dyn SplitRepository>,
    gateway: Arc<dyn PaymentGateway>,
    resolver: NetworkResolver,
    calculator: SplitCalculator,
    persister: CommissionSplitPersister,
    split_mode: SplitMode,
    storefront_url: String,
}

impl CommissionService {
    pub fn new<S>(store: Arc<S>, gateway: Arc<dyn PaymentGateway>, calculator: SplitCalculator) -> Self
    where
        S: OrderRepository + AffiliateRepository + SplitRepository + 'static,
    {
        Self {
            orders: store.clone(),
            affiliates: store.clone(),
            splits: store.clone(),
            gateway,
            resolver: NetworkResolver::new(store.clone()),
            calculator,
            persister: CommissionSplitPersister::new(store),
            split_mode: SplitMode::default(),
            storefront_url: String::new(),
        }
    }

    pub fn with_split_mode(mut self, mode: SplitMode) -> Self {
        self.split_mode = mode;
        self
    }

    pub fn with_storefront_url(mut self, url: &str) -> Self {
        self.storefront_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Creates the order, computes its split and creates the gateway payment
    /// carrying that split in the same request. Nothing is persisted for the
    /// split when the gateway rejects the payment; the order is marked failed.
    pub async fn checkout(&self, request: CheckoutRequest) -> Result<CheckoutReceipt, ServiceError> {
        if request.value <= 0 {
            return Err(ServiceError::Validation(format!(
                "order value must be positive, got {}",
                request.value
            )));
        }

        let code = request.referral_code.as_deref().and_then(normalize_referral_code);
        let mut order = Order::new(request.value, code);
        self.orders.insert_order(&order).await?;

        let network = self.resolver.resolve(&order).await?;
        let split = self.calculator.calculate(order.total_value, &network)?;

        let due_date = request.due_date.unwrap_or_else(|| {
            let today = Utc::now().date_naive();
            today.checked_add_days(Days::new(DEFAULT_DUE_DAYS)).unwrap_or(today)
        });
        let payment_request = CreatePaymentRequest::with_split(
            request.customer,
            request.billing_type,
            due_date,
            order.id.to_string(),
            &split,
            self.split_mode,
        );

        let payment = match self.gateway.create_payment(&payment_request).await {
            Ok(payment) => payment,
            Err(err) => {
                error!(order_id = %order.id, error = %err, "payment creation failed");
                if let Err(mark_err) = self
                    .orders
                    .transition_order(order.id, &[OrderStatus::Pending], OrderStatus::Failed)
                    .await
                {
                    error!(order_id = %order.id, error = %mark_err, "could not mark order failed");
                }
                return Err(err.into());
            }
        };

        self.orders.attach_payment(order.id, &payment.id).await?;
        order.payment_id = Some(payment.id.clone());
        let split_id = self.persister.persist(order.id, &split).await?;
        let order = self.settle_early_status(order, &payment).await;

        info!(
            order_id = %order.id,
            payment_id = %payment.id,
            value = order.total_value,
            referral_code = order.referral_code.as_deref().unwrap_or(""),
            redistribution = split.redistribution.is_some(),
            "checkout completed"
        );
        Ok(CheckoutReceipt {
            order,
            payment_id: payment.id,
            split_id,
            split,
        })
    }

    /// Applies a payment status decided before the commission rows existed:
    /// one reported by the create response, or one a webhook already applied
    /// to the order while checkout was still running. Failures are logged and
    /// left to later webhooks or reconciliation.
    async fn settle_early_status(&self, order: Order, payment: &GatewayPayment) -> Order {
        let transition = match PaymentTransition::from_status(payment.status) {
            Some(transition) => Some(transition),
            None => match self.orders.get_order(order.id).await {
                Ok(Some(current)) if current.status != OrderStatus::Pending => {
                    self.current_transition(&current, &payment.id).await
                }
                Ok(_) => None,
                Err(err) => {
                    warn!(order_id = %order.id, error = %err, "could not re-read order after checkout");
                    None
                }
            },
        };
        let Some(transition) = transition else {
            return order;
        };

        let signal = PaymentSignal {
            transition,
            payment_id: payment.id.clone(),
            external_reference: Some(order.id.to_string()),
        };
        match self.apply(&signal).await {
            Ok(detail) => info!(order_id = %order.id, detail = %detail, "early payment status applied"),
            Err(err) => warn!(order_id = %order.id, error = %err, "early payment status not applied"),
        }
        match self.orders.get_order(order.id).await {
            Ok(Some(current)) => current,
            _ => order,
        }
    }

    async fn current_transition(&self, order: &Order, payment_id: &str) -> Option<PaymentTransition> {
        match self.gateway.get_payment(payment_id).await {
            Ok(payment) => {
                if let Some(transition) = PaymentTransition::from_status(payment.status) {
                    return Some(transition);
                }
            }
            Err(err) => warn!(order_id = %order.id, payment_id, error = %err, "payment status lookup failed"),
        }
        PaymentTransition::reaching(order.status)
    }

    pub async fn order(&self, id: Uuid) -> Result<Order, ServiceError> {
        self.orders.get_order(id).await?.ok_or(ServiceError::NotFound("order"))
    }

    pub async fn order_for_payment(&self, payment_id: &str) -> Result<Order, ServiceError> {
        self.orders
            .find_order_by_payment(payment_id)
            .await?
            .ok_or(ServiceError::NotFound("payment"))
    }

    pub async fn split_view(&self, order_id: Uuid) -> Result<SplitView, ServiceError> {
        let split = self
            .splits
            .get_split(order_id)
            .await?
            .ok_or(ServiceError::NotFound("commission split"))?;
        let commissions = self.splits.commissions_for_order(order_id).await?;
        Ok(SplitView { split, commissions })
    }

    pub async fn affiliate_commissions(&self, affiliate_id: Uuid) -> Result<Vec<Commission>, ServiceError> {
        self.affiliate(affiliate_id).await?;
        Ok(self.splits.commissions_for_affiliate(affiliate_id).await?)
    }

    pub async fn affiliate(&self, id: Uuid) -> Result<Affiliate, ServiceError> {
        self.affiliates
            .get_affiliate(id)
            .await?
            .ok_or(ServiceError::NotFound("affiliate"))
    }

    pub async fn register_affiliate(
        &self,
        referral_code: &str,
        referrer_code: Option<&str>,
    ) -> Result<Affiliate, ServiceError> {
        let referrer_id = match referrer_code.and_then(normalize_referral_code) {
            Some(code) => Some(
                self.affiliates
                    .find_affiliate_by_code(&code)
                    .await?
                    .ok_or(ServiceError::NotFound("referrer"))?
                    .id,
            ),
            None => None,
        };
        let affiliate = Affiliate::new(referral_code, referrer_id)
            .ok_or_else(|| ServiceError::Validation("referral code is required".into()))?;
        self.affiliates.insert_affiliate(&affiliate).await?;
        info!(affiliate_id = %affiliate.id, code = %affiliate.referral_code, "affiliate registered");
        Ok(affiliate)
    }

    pub async fn link_referrer(&self, affiliate_id: Uuid, referrer_id: Uuid) -> Result<Affiliate, ServiceError> {
        self.resolver.link_referrer(affiliate_id, referrer_id).await?;
        info!(%affiliate_id, %referrer_id, "upline relinked");
        self.affiliate(affiliate_id).await
    }

    pub async fn configure_wallet(&self, affiliate_id: Uuid, wallet: &str) -> Result<Affiliate, ServiceError> {
        let wallet = WalletId::parse(wallet)?;
        self.affiliates.configure_wallet(affiliate_id, &wallet).await?;
        info!(%affiliate_id, "payout wallet configured");
        self.affiliate(affiliate_id).await
    }

    /// Storefront link carrying the affiliate's code. Affiliates without a
    /// configured payout wallet get [`ServiceError::PayoutWalletRequired`].
    pub async fn referral_link(&self, affiliate_id: Uuid) -> Result<String, ServiceError> {
        let affiliate = self.affiliate(affiliate_id).await?;
        if affiliate.financial_status != FinancialStatus::Active {
            return Err(ServiceError::PayoutWalletRequired);
        }
        if affiliate.payout_wallet().is_none() {
            return Err(ServiceError::Validation(format!(
                "affiliate is {}",
                affiliate.status
            )));
        }
        Ok(format!("{}/?ref={}", self.storefront_url, affiliate.referral_code))
    }

    pub async fn record_click(&self, code: &str, campaign: &Campaign) -> Result<(), ServiceError> {
        let affiliate = self.affiliate_by_code(code).await?;
        self.affiliates.record_click(affiliate.id, campaign).await?;
        Ok(())
    }

    /// Returns `false` when the order had already been converted.
    pub async fn record_conversion(&self, code: &str, order_id: Uuid) -> Result<bool, ServiceError> {
        let affiliate = self.affiliate_by_code(code).await?;
        self.order(order_id).await?;
        match self.affiliates.record_conversion(affiliate.id, order_id).await {
            Ok(()) => {
                info!(affiliate_id = %affiliate.id, %order_id, "referral conversion recorded");
                Ok(true)
            }
            Err(StoreError::Duplicate(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn affiliate_by_code(&self, code: &str) -> Result<Affiliate, ServiceError> {
        let code = normalize_referral_code(code)
            .ok_or_else(|| ServiceError::Validation("referral code is required".into()))?;
        self.affiliates
            .find_affiliate_by_code(&code)
            .await?
            .ok_or(ServiceError::NotFound("affiliate"))
    }

    async fn locate_order(&self, signal: &PaymentSignal) -> Result<Order, ServiceError> {
        if let Some(order) = self.orders.find_order_by_payment(&signal.payment_id).await? {
            return Ok(order);
        }
        let by_reference = signal
            .external_reference
            .as_deref()
            .and_then(|reference| Uuid::parse_str(reference).ok());
        match by_reference {
            Some(order_id) => self.order(order_id).await,
            None => Err(ServiceError::NotFound("order")),
        }
    }

    /// Polls a payment and applies the transition of its terminal status.
    pub async fn reconcile(
        &self,
        poller: &PaymentPoller,
        correlation_id: &str,
        payment_id: &str,
        max_attempts: u32,
        max_elapsed: Duration,
    ) -> Result<PollOutcome, ServiceError> {
        let outcome = poller
            .poll(correlation_id, payment_id, max_attempts, max_elapsed)
            .await?;
        match outcome {
            PollOutcome::Terminal { status, .. } => {
                if let Some(transition) = PaymentTransition::from_status(status) {
                    let signal = PaymentSignal {
                        transition,
                        payment_id: payment_id.to_string(),
                        external_reference: None,
                    };
                    self.apply(&signal).await?;
                }
            }
            PollOutcome::StillPending { .. } => {
                warn!(correlation_id, payment_id, "reconciliation left payment pending");
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl PaymentEventHandler for CommissionService {
    async fn apply(&self, signal: &PaymentSignal) -> Result<String, ServiceError> {
        let order = self.locate_order(signal).await?;
        let plan = signal.transition.plan();

        let order_moved = self
            .orders
            .transition_order(order.id, plan.order_from, plan.order_to)
            .await?;
        let commissions_moved = match plan.commissions {
            Some((from, to)) => self.splits.transition_commissions(order.id, from, to).await?,
            None => 0,
        };

        if order_moved {
            info!(
                order_id = %order.id,
                payment_id = %signal.payment_id,
                from = %order.status,
                to = %plan.order_to,
                commissions_moved,
                "order status changed"
            );
        }
        let commissions_to = plan.commissions.map(|(_, to)| to);
        if commissions_moved > 0 && commissions_to == Some(CommissionStatus::Paid) {
            info!(order_id = %order.id, commissions_moved, "commissions finalized, notifying affiliates");
        }

        let order_detail = if order_moved { "moved" } else { "unchanged" };
        Ok(match commissions_to {
            Some(to) => format!(
                "{:?}: order {} {order_detail}, {commissions_moved} commission(s) -> {to}",
                signal.transition, order.id
            ),
            None => format!(
                "{:?}: order {} {order_detail}, commissions unchanged",
                signal.transition, order.id
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use crate::split::{Managers, PercentageTable};
    use crate::store::MemoryStore;

    fn calculator() -> SplitCalculator {
        SplitCalculator::new(
            PercentageTable::STANDARD,
            Managers {
                manager_a: WalletId::parse("wal_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap(),
                manager_b: WalletId::parse("wal_bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb").unwrap(),
            },
        )
        .unwrap()
    }

    fn checkout_request(value: i64) -> CheckoutRequest {
        CheckoutRequest {
            value,
            customer: "cus_000001".into(),
            billing_type: BillingType::Pix,
            due_date: None,
            referral_code: None,
        }
    }

    fn service(store: &Arc<MemoryStore>, gateway: &Arc<MockGateway>) -> CommissionService {
        CommissionService::new(store.clone(), gateway.clone(), calculator())
            .with_storefront_url("https://shop.example/")
    }

    #[test]
    fn undecided_statuses_have_no_transition() {
        assert_eq!(PaymentTransition::from_status(PaymentStatus::Pending), None);
        assert_eq!(PaymentTransition::from_status(PaymentStatus::Unknown), None);
        assert_eq!(
            PaymentTransition::from_status(PaymentStatus::ReceivedInCash),
            Some(PaymentTransition::Received)
        );
        assert_eq!(
            PaymentTransition::from_status(PaymentStatus::Refused),
            Some(PaymentTransition::Cancelled)
        );
    }

    #[tokio::test]
    async fn non_positive_value_is_rejected_before_anything_is_written() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());

        let err = service(&store, &gateway).checkout(checkout_request(0)).await.unwrap_err();

        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(gateway.created_requests().await.is_empty());
    }

    #[tokio::test]
    async fn gateway_failure_leaves_no_split_and_fails_the_order() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        gateway.set_fail_on_create(Some(502)).await;

        let err = service(&store, &gateway)
            .checkout(checkout_request(329_000))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::ExternalService(_)));
        assert_eq!(store.split_count().await, 0);
        assert_eq!(store.commission_count().await, 0);
    }

    #[tokio::test]
    async fn replayed_transition_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let service = service(&store, &gateway);
        let receipt = service.checkout(checkout_request(10_000)).await.unwrap();
        let signal = PaymentSignal {
            transition: PaymentTransition::Confirmed,
            payment_id: receipt.payment_id.clone(),
            external_reference: None,
        };

        let first = service.apply(&signal).await.unwrap();
        let second = service.apply(&signal).await.unwrap();

        assert!(first.contains("moved"));
        assert!(second.contains("unchanged"));
        assert_eq!(service.order(receipt.order.id).await.unwrap().status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn overdue_order_can_still_be_paid() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let service = service(&store, &gateway);
        let receipt = service.checkout(checkout_request(10_000)).await.unwrap();
        let signal = |transition| PaymentSignal {
            transition,
            payment_id: receipt.payment_id.clone(),
            external_reference: None,
        };

        let overdue = service.apply(&signal(PaymentTransition::Overdue)).await.unwrap();
        assert!(overdue.contains("commissions unchanged"));
        assert_eq!(service.order(receipt.order.id).await.unwrap().status, OrderStatus::PastDue);

        service.apply(&signal(PaymentTransition::Received)).await.unwrap();
        assert_eq!(service.order(receipt.order.id).await.unwrap().status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn confirmation_after_refund_changes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let service = service(&store, &gateway);
        let receipt = service.checkout(checkout_request(10_000)).await.unwrap();
        let signal = |transition| PaymentSignal {
            transition,
            payment_id: receipt.payment_id.clone(),
            external_reference: None,
        };

        service.apply(&signal(PaymentTransition::Refunded)).await.unwrap();
        let late = service.apply(&signal(PaymentTransition::Confirmed)).await.unwrap();

        assert!(late.contains("unchanged"));
        assert_eq!(service.order(receipt.order.id).await.unwrap().status, OrderStatus::Refunded);
    }

    #[tokio::test]
    async fn status_from_the_create_response_is_applied_at_checkout() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        gateway.set_create_status(PaymentStatus::Confirmed).await;

        let receipt = service(&store, &gateway)
            .checkout(checkout_request(10_000))
            .await
            .unwrap();

        assert_eq!(receipt.order.status, OrderStatus::Paid);
        assert_eq!(receipt.order.payment_id.as_deref(), Some(receipt.payment_id.as_str()));
        assert_eq!(gateway.status_queries().await, 0);
    }

    #[tokio::test]
    async fn signal_falls_back_to_external_reference() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let service = service(&store, &gateway);
        let receipt = service.checkout(checkout_request(10_000)).await.unwrap();
        let signal = PaymentSignal {
            transition: PaymentTransition::Cancelled,
            payment_id: "pay_unknown".into(),
            external_reference: Some(receipt.order.id.to_string()),
        };

        service.apply(&signal).await.unwrap();

        assert_eq!(service.order(receipt.order.id).await.unwrap().status, OrderStatus::Failed);
    }

    #[tokio::test]
    async fn referral_link_requires_a_payout_wallet() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let service = service(&store, &gateway);
        let affiliate = service.register_affiliate("abc123", None).await.unwrap();

        let err = service.referral_link(affiliate.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::PayoutWalletRequired));

        service
            .configure_wallet(affiliate.id, "wal_cccccccccccccccccccccccccccccccc")
            .await
            .unwrap();
        let link = service.referral_link(affiliate.id).await.unwrap();
        assert_eq!(link, "https://shop.example/?ref=ABC123");
    }

    #[tokio::test]
    async fn conversions_are_recorded_once_per_order() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let service = service(&store, &gateway);
        service.register_affiliate("abc123", None).await.unwrap();
        let receipt = service.checkout(checkout_request(10_000)).await.unwrap();

        assert!(service.record_conversion("abc123", receipt.order.id).await.unwrap());
        assert!(!service.record_conversion("ABC123", receipt.order.id).await.unwrap());
        assert_eq!(store.conversions().await.len(), 1);
    }
}
