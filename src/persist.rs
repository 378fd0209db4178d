//! Stores a calculated split exactly once per order.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::split::{Level, SplitResult, SplitTag};
use crate::store::{SplitRepository, StoreError};
use crate::types::{AuditEntry, Commission, CommissionSplit, CommissionStatus, LevelShare};

pub const AUDIT_SPLIT_CREATED: &str = "commission_split_created";

pub struct CommissionSplitPersister {
    splits: Arc<dyn SplitRepository>,
}

impl CommissionSplitPersister {
    pub fn new(splits: Arc<dyn SplitRepository>) -> Self {
        Self { splits }
    }

    /// Persists the split, one commission row per paid affiliate level and an
    /// audit entry. A second call for the same order fails with
    /// [`ServiceError::DuplicateSplit`]; the store's unique constraint is the
    /// authoritative guard, the lookup only saves a round trip.
    pub async fn persist(&self, order_id: Uuid, split: &SplitResult) -> Result<Uuid, ServiceError> {
        if self.splits.split_exists(order_id).await? {
            warn!(%order_id, "commission split already exists");
            return Err(ServiceError::DuplicateSplit(order_id));
        }

        let record = split_record(order_id, split);
        let commissions = commission_rows(&record, split);
        let audit = AuditEntry {
            order_id,
            action: AUDIT_SPLIT_CREATED.to_string(),
            details: json!({
                "input": { "order_value": split.order_value },
                "output": split,
                "redistribution_applied": record.redistribution_applied,
            }),
        };

        match self.splits.insert_split(&record, &commissions, &audit).await {
            Ok(()) => {
                info!(
                    %order_id,
                    split_id = %record.id,
                    commissions = commissions.len(),
                    redistribution_applied = record.redistribution_applied,
                    "commission split persisted"
                );
                Ok(record.id)
            }
            Err(StoreError::Duplicate(_)) => {
                warn!(%order_id, "concurrent split insert rejected by store");
                Err(ServiceError::DuplicateSplit(order_id))
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn split_record(order_id: Uuid, split: &SplitResult) -> CommissionSplit {
    let level = |level: Level| {
        split.line(level.into()).map(|line| LevelShare {
            affiliate_id: line.affiliate_id.unwrap_or_default(),
            bps: line.percentage_bps,
            value: line.value,
        })
    };
    let manager = |tag: SplitTag| {
        split
            .line(tag)
            .map(|line| (line.percentage_bps, line.value))
            .unwrap_or_default()
    };
    let (manager_a_bps, manager_a_value) = manager(SplitTag::ManagerA);
    let (manager_b_bps, manager_b_value) = manager(SplitTag::ManagerB);

    CommissionSplit {
        id: Uuid::new_v4(),
        order_id,
        order_value: split.order_value,
        factory_bps: split.factory_bps,
        factory_value: split.factory_value,
        n1: level(Level::N1),
        n2: level(Level::N2),
        n3: level(Level::N3),
        manager_a_bps,
        manager_a_value,
        manager_b_bps,
        manager_b_value,
        redistribution_applied: split.redistribution.is_some(),
        redistribution_details: serde_json::to_value(&split.redistribution)
            .unwrap_or(serde_json::Value::Null),
        created_at: Utc::now(),
    }
}

fn commission_rows(record: &CommissionSplit, split: &SplitResult) -> Vec<Commission> {
    split
        .affiliate_lines()
        .filter_map(|line| {
            Some(Commission {
                id: Uuid::new_v4(),
                split_id: record.id,
                order_id: record.order_id,
                affiliate_id: line.affiliate_id?,
                level: line.tag.level()?.number(),
                percentage_bps: line.percentage_bps,
                value: line.value,
                status: CommissionStatus::Calculated,
                created_at: record.created_at,
            })
        })
        .collect()
}
