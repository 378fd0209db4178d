//! Resolves the N1..N3 slots of an order from the affiliate upline chain.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::split::{Level, Network, Recipient};
use crate::store::{AffiliateRepository, StoreError};
use crate::types::{Affiliate, Order};

/// Upper bound on upline hops walked while checking for cycles.
pub const CYCLE_GUARD_LIMIT: usize = 64;

pub struct NetworkResolver {
    affiliates: Arc<dyn AffiliateRepository>,
}

impl NetworkResolver {
    pub fn new(affiliates: Arc<dyn AffiliateRepository>) -> Self {
        Self { affiliates }
    }

    /// Network of an order, empty when it carries no known referral code.
    pub async fn resolve(&self, order: &Order) -> Result<Network, StoreError> {
        let Some(code) = order.referral_code.as_deref() else {
            return Ok(Network::default());
        };
        match self.affiliates.find_affiliate_by_code(code).await? {
            Some(direct) => self.resolve_from(direct).await,
            None => {
                debug!(order_id = %order.id, code, "referral code matches no affiliate");
                Ok(Network::default())
            }
        }
    }

    /// Walks up to three levels starting at the direct referrer. Slot positions
    /// follow the chain: an ineligible affiliate leaves its slot empty but its
    /// own upline still fills the next level.
    pub async fn resolve_from(&self, direct: Affiliate) -> Result<Network, StoreError> {
        let mut network = Network::default();
        let mut seen = HashSet::new();
        let mut current = Some(direct);

        for level in Level::ALL {
            let Some(affiliate) = current.take() else {
                break;
            };
            if !seen.insert(affiliate.id) {
                warn!(affiliate_id = %affiliate.id, "cycle in affiliate upline, stopping walk");
                break;
            }

            *network.slot_mut(level) = affiliate.payout_wallet().map(|wallet| Recipient {
                affiliate_id: affiliate.id,
                wallet_id: wallet.clone(),
            });
            if network.slot(level).is_none() {
                debug!(
                    affiliate_id = %affiliate.id,
                    level = level.number(),
                    status = %affiliate.status,
                    financial_status = %affiliate.financial_status,
                    "affiliate not eligible, share goes to redistribution"
                );
            }

            current = match affiliate.referrer_id {
                Some(referrer_id) => self.affiliates.get_affiliate(referrer_id).await?,
                None => None,
            };
        }

        Ok(network)
    }

    /// Points `affiliate_id` at `referrer_id`, rejecting edges that would close
    /// a cycle in the upline graph.
    pub async fn link_referrer(&self, affiliate_id: Uuid, referrer_id: Uuid) -> Result<(), ServiceError> {
        if self.affiliates.get_affiliate(affiliate_id).await?.is_none() {
            return Err(ServiceError::NotFound("affiliate"));
        }
        self.ensure_acyclic(affiliate_id, referrer_id).await?;
        self.affiliates.set_referrer(affiliate_id, referrer_id).await?;
        Ok(())
    }

    async fn ensure_acyclic(&self, affiliate_id: Uuid, referrer_id: Uuid) -> Result<(), ServiceError> {
        let mut cursor = Some(referrer_id);
        let mut hops = 0;
        while let Some(id) = cursor {
            if id == affiliate_id {
                return Err(ServiceError::Validation(
                    "referral link would create a cycle".into(),
                ));
            }
            hops += 1;
            if hops > CYCLE_GUARD_LIMIT {
                return Err(ServiceError::Validation(
                    "upline chain exceeds the cycle guard limit".into(),
                ));
            }
            let referrer = self
                .affiliates
                .get_affiliate(id)
                .await?
                .ok_or(ServiceError::NotFound("referrer"))?;
            cursor = referrer.referrer_id;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{AffiliateStatus, FinancialStatus, WalletId};

    fn wallet(n: u8) -> WalletId {
        WalletId::parse(&format!("wal_{:0>32}", n)).unwrap()
    }

    async fn add(
        store: &MemoryStore,
        code: &str,
        referrer: Option<&Affiliate>,
        configured: bool,
    ) -> Affiliate {
        let mut affiliate = Affiliate::new(code, referrer.map(|r| r.id)).unwrap();
        if configured {
            affiliate.wallet_id = Some(wallet(code.len() as u8));
            affiliate.financial_status = FinancialStatus::Active;
        }
        store.insert_affiliate(&affiliate).await.unwrap();
        affiliate
    }

    fn resolver(store: &Arc<MemoryStore>) -> NetworkResolver {
        NetworkResolver::new(store.clone())
    }

    #[tokio::test]
    async fn resolves_three_levels_and_ignores_the_fourth() {
        let store = Arc::new(MemoryStore::new());
        let top = add(&store, "TOP", None, true).await;
        let n3 = add(&store, "N3", Some(&top), true).await;
        let n2 = add(&store, "N2", Some(&n3), true).await;
        let n1 = add(&store, "N1", Some(&n2), true).await;

        let order = Order::new(10_000, Some("N1".into()));
        let network = resolver(&store).resolve(&order).await.unwrap();

        assert_eq!(network.n1.unwrap().affiliate_id, n1.id);
        assert_eq!(network.n2.unwrap().affiliate_id, n2.id);
        assert_eq!(network.n3.unwrap().affiliate_id, n3.id);
    }

    #[tokio::test]
    async fn unconfigured_affiliate_leaves_its_slot_empty() {
        let store = Arc::new(MemoryStore::new());
        let n2 = add(&store, "UPPER", None, true).await;
        add(&store, "PENDING", Some(&n2), false).await;

        let order = Order::new(10_000, Some("PENDING".into()));
        let network = resolver(&store).resolve(&order).await.unwrap();

        assert!(network.n1.is_none());
        assert_eq!(network.n2.unwrap().affiliate_id, n2.id);
        assert!(network.n3.is_none());
    }

    #[tokio::test]
    async fn suspended_and_inactive_affiliates_are_absent() {
        let store = Arc::new(MemoryStore::new());
        let mut affiliate = Affiliate::new("SUSP", None).unwrap();
        affiliate.wallet_id = Some(wallet(1));
        affiliate.financial_status = FinancialStatus::Active;
        affiliate.status = AffiliateStatus::Suspended;
        store.insert_affiliate(&affiliate).await.unwrap();

        let network = resolver(&store).resolve_from(affiliate).await.unwrap();
        assert!(network.is_empty());
    }

    #[tokio::test]
    async fn orders_without_a_known_code_have_no_network() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(&store);

        let no_code = Order::new(10_000, None);
        assert!(resolver.resolve(&no_code).await.unwrap().is_empty());

        let unknown = Order::new(10_000, Some("NOBODY".into()));
        assert!(resolver.resolve(&unknown).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupted_cyclic_upline_stops_the_walk() {
        let store = Arc::new(MemoryStore::new());
        let a = add(&store, "A", None, true).await;
        let b = add(&store, "BB", Some(&a), true).await;
        // Bypasses the link check to simulate corrupted data.
        store.set_referrer(a.id, b.id).await.unwrap();

        let network = resolver(&store)
            .resolve_from(store.get_affiliate(b.id).await.unwrap().unwrap())
            .await
            .unwrap();

        assert_eq!(network.n1.unwrap().affiliate_id, b.id);
        assert_eq!(network.n2.unwrap().affiliate_id, a.id);
        assert!(network.n3.is_none());
    }

    #[tokio::test]
    async fn link_referrer_rejects_cycles() {
        let store = Arc::new(MemoryStore::new());
        let root = add(&store, "ROOT", None, true).await;
        let mid = add(&store, "MID", Some(&root), true).await;
        let leaf = add(&store, "LEAF", Some(&mid), true).await;
        let resolver = resolver(&store);

        let err = resolver.link_referrer(root.id, leaf.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        let err = resolver.link_referrer(mid.id, mid.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let other = add(&store, "OTHER", None, true).await;
        resolver.link_referrer(other.id, leaf.id).await.unwrap();
        let linked = store.get_affiliate(other.id).await.unwrap().unwrap();
        assert_eq!(linked.referrer_id, Some(leaf.id));
    }
}
