//! Percentage table and the split calculator.
//!
//! Percentages are integer basis points (1 bp = 0.01%) so that the table and
//! every redistribution always add up exactly. Monetary values are minor
//! currency units; each line is rounded on its own (half away from zero) and
//! the residual drift against the 30% total is accepted, never absorbed by a
//! specific recipient.

use serde::Serialize;
use uuid::Uuid;

use crate::types::WalletId;

/// 100% in basis points.
pub const BPS_SCALE: u32 = 10_000;

/// Commission percentage per recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PercentageTable {
    pub n1: u32,
    pub n2: u32,
    pub n3: u32,
    pub manager_a: u32,
    pub manager_b: u32,
}

impl PercentageTable {
    /// N1 15%, N2 3%, N3 2%, each manager 5%; 70% retained by the factory.
    pub const STANDARD: Self = Self {
        n1: 1_500,
        n2: 300,
        n3: 200,
        manager_a: 500,
        manager_b: 500,
    };

    pub fn level(&self, level: Level) -> u32 {
        match level {
            Level::N1 => self.n1,
            Level::N2 => self.n2,
            Level::N3 => self.n3,
        }
    }

    /// Everything handed out through the split.
    pub fn commission_total(&self) -> u32 {
        [self.n1, self.n2, self.n3, self.manager_a, self.manager_b]
            .into_iter()
            .fold(0u32, u32::saturating_add)
    }

    /// What the factory keeps; zero once the table hands out 100% or more.
    pub fn factory(&self) -> u32 {
        BPS_SCALE.saturating_sub(self.commission_total())
    }

    pub fn validate(&self) -> Result<(), SplitError> {
        let total = self.commission_total();
        if total > BPS_SCALE {
            return Err(SplitError::TableExceedsScale(total));
        }
        Ok(())
    }
}

impl Default for PercentageTable {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Affiliate level in the upline chain of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    N1,
    N2,
    N3,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::N1, Level::N2, Level::N3];

    pub fn number(&self) -> i16 {
        match self {
            Level::N1 => 1,
            Level::N2 => 2,
            Level::N3 => 3,
        }
    }
}

/// Which recipient a split line pays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitTag {
    N1,
    N2,
    N3,
    ManagerA,
    ManagerB,
}

impl From<Level> for SplitTag {
    fn from(level: Level) -> Self {
        match level {
            Level::N1 => SplitTag::N1,
            Level::N2 => SplitTag::N2,
            Level::N3 => SplitTag::N3,
        }
    }
}

impl SplitTag {
    pub fn level(&self) -> Option<Level> {
        match self {
            SplitTag::N1 => Some(Level::N1),
            SplitTag::N2 => Some(Level::N2),
            SplitTag::N3 => Some(Level::N3),
            SplitTag::ManagerA | SplitTag::ManagerB => None,
        }
    }
}

/// An eligible affiliate occupying a network slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub affiliate_id: Uuid,
    pub wallet_id: WalletId,
}

/// The resolved network of an order. Absent slots are either empty in the
/// upline chain or occupied by an ineligible affiliate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Network {
    pub n1: Option<Recipient>,
    pub n2: Option<Recipient>,
    pub n3: Option<Recipient>,
}

impl Network {
    pub fn slot(&self, level: Level) -> Option<&Recipient> {
        match level {
            Level::N1 => self.n1.as_ref(),
            Level::N2 => self.n2.as_ref(),
            Level::N3 => self.n3.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, level: Level) -> &mut Option<Recipient> {
        match level {
            Level::N1 => &mut self.n1,
            Level::N2 => &mut self.n2,
            Level::N3 => &mut self.n3,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n1.is_none() && self.n2.is_none() && self.n3.is_none()
    }
}

/// The two fixed manager recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Managers {
    pub manager_a: WalletId,
    pub manager_b: WalletId,
}

/// One payout line handed to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitLine {
    pub tag: SplitTag,
    pub wallet_id: WalletId,
    /// Set for affiliate levels, `None` for managers.
    pub affiliate_id: Option<Uuid>,
    pub percentage_bps: u32,
    pub value: i64,
}

/// How unclaimed level shares were handed to the managers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redistribution {
    pub missing_levels: Vec<Level>,
    pub pool_bps: u32,
    pub manager_a_share_bps: u32,
    pub manager_b_share_bps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitResult {
    pub order_value: i64,
    pub factory_bps: u32,
    pub factory_value: i64,
    pub lines: Vec<SplitLine>,
    pub redistribution: Option<Redistribution>,
}

impl SplitResult {
    pub fn line(&self, tag: SplitTag) -> Option<&SplitLine> {
        self.lines.iter().find(|line| line.tag == tag)
    }

    /// Lines paying affiliate levels, in N1..N3 order.
    pub fn affiliate_lines(&self) -> impl Iterator<Item = &SplitLine> {
        self.lines.iter().filter(|line| line.tag.level().is_some())
    }

    pub fn commission_bps(&self) -> u32 {
        self.lines.iter().map(|line| line.percentage_bps).sum()
    }

    pub fn commission_value(&self) -> i64 {
        self.lines.iter().map(|line| line.value).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("order value must be positive, got {0}")]
    NonPositiveValue(i64),

    #[error("percentage table hands out {0} bp, more than 100%")]
    TableExceedsScale(u32),
}

/// `bps` of `amount`, rounded half away from zero.
pub fn share_of(amount: i64, bps: u32) -> i64 {
    let scaled = amount as i128 * bps as i128;
    let half = BPS_SCALE as i128 / 2;
    let rounded = if scaled >= 0 {
        (scaled + half) / BPS_SCALE as i128
    } else {
        (scaled - half) / BPS_SCALE as i128
    };
    rounded as i64
}

/// Maps an order value and its resolved network to payout lines.
#[derive(Debug, Clone)]
pub struct SplitCalculator {
    table: PercentageTable,
    managers: Managers,
}

impl SplitCalculator {
    pub fn new(table: PercentageTable, managers: Managers) -> Result<Self, SplitError> {
        table.validate()?;
        Ok(Self { table, managers })
    }

    pub fn table(&self) -> &PercentageTable {
        &self.table
    }

    pub fn calculate(&self, order_value: i64, network: &Network) -> Result<SplitResult, SplitError> {
        if order_value <= 0 {
            return Err(SplitError::NonPositiveValue(order_value));
        }

        let mut lines = Vec::with_capacity(5);
        let mut missing_levels = Vec::new();
        let mut pool_bps = 0;

        for level in Level::ALL {
            let bps = self.table.level(level);
            match network.slot(level) {
                Some(recipient) => lines.push(SplitLine {
                    tag: level.into(),
                    wallet_id: recipient.wallet_id.clone(),
                    affiliate_id: Some(recipient.affiliate_id),
                    percentage_bps: bps,
                    value: share_of(order_value, bps),
                }),
                None => {
                    missing_levels.push(level);
                    pool_bps += bps;
                }
            }
        }

        // An odd pool leaves the extra basis point with manager A.
        let manager_b_share = pool_bps / 2;
        let manager_a_share = pool_bps - manager_b_share;

        for (tag, wallet, bps) in [
            (
                SplitTag::ManagerA,
                &self.managers.manager_a,
                self.table.manager_a + manager_a_share,
            ),
            (
                SplitTag::ManagerB,
                &self.managers.manager_b,
                self.table.manager_b + manager_b_share,
            ),
        ] {
            lines.push(SplitLine {
                tag,
                wallet_id: wallet.clone(),
                affiliate_id: None,
                percentage_bps: bps,
                value: share_of(order_value, bps),
            });
        }

        let redistribution = (pool_bps > 0).then(|| Redistribution {
            missing_levels,
            pool_bps,
            manager_a_share_bps: manager_a_share,
            manager_b_share_bps: manager_b_share,
        });

        let factory_bps = self.table.factory();
        Ok(SplitResult {
            order_value,
            factory_bps,
            factory_value: share_of(order_value, factory_bps),
            lines,
            redistribution,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO_VALUE: i64 = 329_000;

    fn wallet(n: u8) -> WalletId {
        WalletId::parse(&format!("wal_{:0>32}", n)).unwrap()
    }

    fn recipient(n: u8) -> Recipient {
        Recipient {
            affiliate_id: Uuid::new_v4(),
            wallet_id: wallet(n),
        }
    }

    fn calculator() -> SplitCalculator {
        SplitCalculator::new(
            PercentageTable::STANDARD,
            Managers {
                manager_a: wallet(91),
                manager_b: wallet(92),
            },
        )
        .unwrap()
    }

    fn network(n1: bool, n2: bool, n3: bool) -> Network {
        Network {
            n1: n1.then(|| recipient(1)),
            n2: n2.then(|| recipient(2)),
            n3: n3.then(|| recipient(3)),
        }
    }

    fn bps(split: &SplitResult, tag: SplitTag) -> Option<u32> {
        split.line(tag).map(|line| line.percentage_bps)
    }

    #[test]
    fn standard_table_hands_out_thirty_percent() {
        let table = PercentageTable::STANDARD;
        assert_eq!(table.commission_total(), 3_000);
        assert_eq!(table.factory(), 7_000);
    }

    #[test]
    fn full_network_pays_every_level_without_redistribution() {
        let split = calculator()
            .calculate(SCENARIO_VALUE, &network(true, true, true))
            .unwrap();

        let values: Vec<(SplitTag, i64)> = split.lines.iter().map(|l| (l.tag, l.value)).collect();
        assert_eq!(
            values,
            vec![
                (SplitTag::N1, 49_350),
                (SplitTag::N2, 9_870),
                (SplitTag::N3, 6_580),
                (SplitTag::ManagerA, 16_450),
                (SplitTag::ManagerB, 16_450),
            ]
        );
        assert_eq!(split.commission_value(), 98_700);
        assert_eq!(split.factory_value, 230_300);
        assert!(split.redistribution.is_none());
    }

    #[test]
    fn no_network_sends_everything_to_the_managers() {
        let split = calculator().calculate(SCENARIO_VALUE, &Network::default()).unwrap();

        assert_eq!(split.lines.len(), 2);
        assert_eq!(split.line(SplitTag::ManagerA).unwrap().value, 49_350);
        assert_eq!(split.line(SplitTag::ManagerB).unwrap().value, 49_350);
        assert_eq!(split.commission_value(), 98_700);

        let redistribution = split.redistribution.unwrap();
        assert_eq!(redistribution.pool_bps, 2_000);
        assert_eq!(redistribution.missing_levels, Level::ALL.to_vec());
    }

    #[test]
    fn managers_absorb_missing_levels_evenly() {
        let calc = calculator();

        let only_n1 = calc.calculate(SCENARIO_VALUE, &network(true, false, false)).unwrap();
        assert_eq!(bps(&only_n1, SplitTag::N1), Some(1_500));
        assert_eq!(bps(&only_n1, SplitTag::ManagerA), Some(750));
        assert_eq!(bps(&only_n1, SplitTag::ManagerB), Some(750));

        let n1_n2 = calc.calculate(SCENARIO_VALUE, &network(true, true, false)).unwrap();
        assert_eq!(bps(&n1_n2, SplitTag::N3), None);
        assert_eq!(bps(&n1_n2, SplitTag::ManagerA), Some(600));
        assert_eq!(bps(&n1_n2, SplitTag::ManagerB), Some(600));

        let gap_at_n1 = calc.calculate(SCENARIO_VALUE, &network(false, true, true)).unwrap();
        assert_eq!(bps(&gap_at_n1, SplitTag::N2), Some(300));
        assert_eq!(bps(&gap_at_n1, SplitTag::ManagerA), Some(1_250));
    }

    #[test]
    fn every_configuration_keeps_the_totals() {
        let calc = calculator();
        for mask in 0..8u8 {
            let net = network(mask & 1 != 0, mask & 2 != 0, mask & 4 != 0);
            for value in [1, 7, 99, 1_001, 12_345, 329_000, 987_654_321] {
                let split = calc.calculate(value, &net).unwrap();

                assert_eq!(split.commission_bps(), 3_000, "mask {mask} value {value}");
                assert_eq!(split.factory_bps + split.commission_bps(), BPS_SCALE);
                assert_eq!(split.affiliate_lines().count(), mask.count_ones() as usize);
                assert!(split.line(SplitTag::ManagerA).unwrap().percentage_bps >= 500);
                assert!(split.line(SplitTag::ManagerB).unwrap().percentage_bps >= 500);

                let drift = (split.commission_value() - share_of(value, 3_000)).abs();
                assert!(drift <= split.lines.len() as i64, "drift {drift} for {value}");
            }
        }
    }

    #[test]
    fn odd_pool_keeps_the_total_exact() {
        let table = PercentageTable {
            n1: 1_001,
            ..PercentageTable::STANDARD
        };
        let calc = SplitCalculator::new(table, calculator().managers).unwrap();
        let split = calc.calculate(10_000, &Network::default()).unwrap();

        assert_eq!(bps(&split, SplitTag::ManagerA), Some(500 + 751));
        assert_eq!(bps(&split, SplitTag::ManagerB), Some(500 + 750));
        assert_eq!(split.commission_bps(), table.commission_total());
    }

    #[test]
    fn tables_above_one_hundred_percent_are_rejected() {
        let table = PercentageTable {
            n1: 9_000,
            ..PercentageTable::STANDARD
        };

        let err = SplitCalculator::new(table, calculator().managers).unwrap_err();

        assert_eq!(err, SplitError::TableExceedsScale(11_500));
        assert_eq!(table.factory(), 0);
    }

    #[test]
    fn rejects_non_positive_order_values() {
        let calc = calculator();
        assert_eq!(
            calc.calculate(0, &Network::default()),
            Err(SplitError::NonPositiveValue(0))
        );
        assert!(calc.calculate(-5, &Network::default()).is_err());
    }

    #[test]
    fn share_of_rounds_half_away_from_zero() {
        assert_eq!(share_of(10, 500), 1);
        assert_eq!(share_of(9, 500), 0);
        assert_eq!(share_of(-10, 500), -1);
        assert_eq!(share_of(i64::MAX, BPS_SCALE), i64::MAX);
    }
}
