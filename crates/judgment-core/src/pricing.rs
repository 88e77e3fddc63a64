//! Usage-tiered anchor pricing.
//!
//! A [`PricingTable`] partitions the non-negative integers into ordered,
//! gap-free, non-overlapping tiers. Each tier carries a fixed unit price and
//! later (higher-usage) tiers are never more expensive than earlier ones.
//! The table is validated once at construction; a misconfigured tier table is
//! a startup failure, not a runtime surprise.
//!
//! Pricing is pure: the caller supplies the account's cumulative monthly
//! anchor count and gets back the price of the *next* anchor. Next-tier
//! savings figures are informational only and never affect the charged
//! amount.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors detected while validating a tier table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PricingError {
    /// The table has no tiers.
    #[error("tier table is empty")]
    Empty,

    /// The first tier does not start at zero.
    #[error("first tier must start at 0, got {min}")]
    FirstTierNotZero {
        /// The offending lower bound.
        min: u64,
    },

    /// A tier does not start exactly one past the previous tier's upper bound.
    #[error("tier '{name}' starts at {min} but previous tier ends at {previous_max}")]
    GapOrOverlap {
        /// Name of the offending tier.
        name: String,
        /// Lower bound of the offending tier.
        min: u64,
        /// Upper bound of the previous tier.
        previous_max: u64,
    },

    /// A tier other than the last one is unbounded.
    #[error("tier '{name}' is unbounded but is not the last tier")]
    UnboundedNotLast {
        /// Name of the offending tier.
        name: String,
    },

    /// The last tier has an upper bound, leaving high usage counts unpriced.
    #[error("last tier '{name}' must be unbounded")]
    LastTierBounded {
        /// Name of the offending tier.
        name: String,
    },

    /// A later tier is more expensive than an earlier one.
    #[error("tier '{name}' price {price} exceeds previous tier price {previous_price}")]
    PriceIncrease {
        /// Name of the offending tier.
        name: String,
        /// Price of the offending tier.
        price: Decimal,
        /// Price of the previous tier.
        previous_price: Decimal,
    },

    /// A tier price is negative.
    #[error("tier '{name}' has negative price {price}")]
    NegativePrice {
        /// Name of the offending tier.
        name: String,
        /// The negative price.
        price: Decimal,
    },
}

/// One usage-count range mapped to a fixed unit price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    /// Inclusive lower bound of the usage range.
    pub min: u64,
    /// Inclusive upper bound; `None` means unbounded (last tier only).
    pub max: Option<u64>,
    /// Fixed price per anchor within this tier.
    pub price: Decimal,
    /// Display name (`experience`, `standard`, ...).
    pub name: String,
}

impl Tier {
    fn covers(&self, count: u64) -> bool {
        count >= self.min && self.max.map_or(true, |max| count <= max)
    }
}

/// A quote for the next anchor, given cumulative monthly usage so far.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    /// Price charged for the next anchor.
    pub price: Decimal,
    /// Name of the tier covering the next anchor.
    pub tier: String,
    /// Monthly count before this anchor.
    pub current_count: u64,
    /// Informational next-tier incentive, when a cheaper tier exists.
    pub next_tier: Option<NextTierInfo>,
}

/// Informational description of the next cheaper tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextTierInfo {
    /// Usage count at which the next tier begins.
    pub threshold: u64,
    /// Unit price in the next tier.
    pub price: Decimal,
    /// Absolute per-anchor saving versus the current tier.
    pub save_per_anchor: Decimal,
    /// Percentage saving versus the current tier, one decimal place.
    pub save_percentage: Decimal,
}

/// Cost estimate for a batch of anchors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkEstimate {
    /// Number of anchors estimated.
    pub anchor_count: u64,
    /// Total estimated cost across tier boundaries.
    pub estimated_cost: Decimal,
    /// Average price per anchor, rounded to four decimal places.
    pub average_price: Decimal,
    /// Usage count of the first anchor in the batch.
    pub starting_from: u64,
}

/// Ordered, gap-free, non-overlapping tier table.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    tiers: Vec<Tier>,
}

impl PricingTable {
    /// Builds a table after validating the partition invariants.
    ///
    /// # Errors
    ///
    /// Returns [`PricingError`] when the tiers are empty, do not start at
    /// zero, leave gaps or overlap, leave high counts unpriced, or have
    /// prices that increase with usage.
    pub fn new(tiers: Vec<Tier>) -> Result<Self, PricingError> {
        let Some(first) = tiers.first() else {
            return Err(PricingError::Empty);
        };
        if first.min != 0 {
            return Err(PricingError::FirstTierNotZero { min: first.min });
        }

        let last_index = tiers.len() - 1;
        for (i, tier) in tiers.iter().enumerate() {
            if tier.price < Decimal::ZERO {
                return Err(PricingError::NegativePrice {
                    name: tier.name.clone(),
                    price: tier.price,
                });
            }
            if i < last_index {
                let Some(max) = tier.max else {
                    return Err(PricingError::UnboundedNotLast {
                        name: tier.name.clone(),
                    });
                };
                let next = &tiers[i + 1];
                if next.min != max + 1 {
                    return Err(PricingError::GapOrOverlap {
                        name: next.name.clone(),
                        min: next.min,
                        previous_max: max,
                    });
                }
                if next.price > tier.price {
                    return Err(PricingError::PriceIncrease {
                        name: next.name.clone(),
                        price: next.price,
                        previous_price: tier.price,
                    });
                }
            } else if tier.max.is_some() {
                return Err(PricingError::LastTierBounded {
                    name: tier.name.clone(),
                });
            }
        }

        Ok(Self { tiers })
    }

    /// The default four-tier table: experience, standard, bulk, enterprise.
    #[must_use]
    pub fn default_table() -> Self {
        Self::new(vec![
            Tier {
                min: 0,
                max: Some(100),
                price: dec!(0.03),
                name: "experience".to_string(),
            },
            Tier {
                min: 101,
                max: Some(1000),
                price: dec!(0.02),
                name: "standard".to_string(),
            },
            Tier {
                min: 1001,
                max: Some(10_000),
                price: dec!(0.01),
                name: "bulk".to_string(),
            },
            Tier {
                min: 10_001,
                max: None,
                price: dec!(0.005),
                name: "enterprise".to_string(),
            },
        ])
        .expect("default tier table is valid")
    }

    /// All tiers, in usage order.
    #[must_use]
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// The tier covering a given cumulative usage count.
    #[must_use]
    pub fn tier_for(&self, count: u64) -> &Tier {
        self.tiers
            .iter()
            .find(|t| t.covers(count))
            .unwrap_or_else(|| {
                // Unreachable given the validated partition; the last tier is
                // unbounded.
                self.tiers.last().expect("table is non-empty")
            })
    }

    /// Quotes the price for the next anchor after `monthly_count_so_far`
    /// anchors this month.
    #[must_use]
    pub fn price_for_next_unit(&self, monthly_count_so_far: u64) -> PriceQuote {
        let tier = self.tier_for(monthly_count_so_far + 1);
        PriceQuote {
            price: tier.price,
            tier: tier.name.clone(),
            current_count: monthly_count_so_far,
            next_tier: self.next_tier_info(monthly_count_so_far),
        }
    }

    /// Describes the next cheaper tier the account can reach, if any.
    /// Informational display only.
    #[must_use]
    pub fn next_tier_info(&self, monthly_count_so_far: u64) -> Option<NextTierInfo> {
        let current = self.tier_for(monthly_count_so_far);
        let next = self.tiers.iter().find(|t| t.min > monthly_count_so_far)?;
        let diff = current.price - next.price;
        let percentage = if current.price.is_zero() {
            Decimal::ZERO
        } else {
            (diff / current.price * dec!(100)).round_dp(1)
        };
        Some(NextTierInfo {
            threshold: next.min,
            price: next.price,
            save_per_anchor: diff,
            save_percentage: percentage,
        })
    }

    /// Estimates the cost of `anchor_count` further anchors, walking tier
    /// boundaries as the count climbs.
    #[must_use]
    pub fn estimate_bulk(&self, monthly_count_so_far: u64, anchor_count: u64) -> BulkEstimate {
        let mut total = Decimal::ZERO;
        for i in 1..=anchor_count {
            total += self.tier_for(monthly_count_so_far + i).price;
        }
        let average = if anchor_count == 0 {
            Decimal::ZERO
        } else {
            (total / Decimal::from(anchor_count)).round_dp(4)
        };
        BulkEstimate {
            anchor_count,
            estimated_cost: total.round_dp(4),
            average_price: average,
            starting_from: monthly_count_so_far + 1,
        }
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::default_table()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(min: u64, max: Option<u64>, price: Decimal, name: &str) -> Tier {
        Tier {
            min,
            max,
            price,
            name: name.to_string(),
        }
    }

    #[test]
    fn rejects_empty_table() {
        assert_eq!(PricingTable::new(vec![]), Err(PricingError::Empty));
    }

    #[test]
    fn rejects_first_tier_not_zero() {
        let result = PricingTable::new(vec![tier(1, None, dec!(0.01), "a")]);
        assert!(matches!(
            result,
            Err(PricingError::FirstTierNotZero { min: 1 })
        ));
    }

    #[test]
    fn rejects_gap() {
        let result = PricingTable::new(vec![
            tier(0, Some(100), dec!(0.03), "a"),
            tier(102, None, dec!(0.02), "b"),
        ]);
        assert!(matches!(result, Err(PricingError::GapOrOverlap { .. })));
    }

    #[test]
    fn rejects_overlap() {
        let result = PricingTable::new(vec![
            tier(0, Some(100), dec!(0.03), "a"),
            tier(100, None, dec!(0.02), "b"),
        ]);
        assert!(matches!(result, Err(PricingError::GapOrOverlap { .. })));
    }

    #[test]
    fn rejects_price_increase() {
        let result = PricingTable::new(vec![
            tier(0, Some(100), dec!(0.01), "a"),
            tier(101, None, dec!(0.02), "b"),
        ]);
        assert!(matches!(result, Err(PricingError::PriceIncrease { .. })));
    }

    #[test]
    fn rejects_bounded_last_tier() {
        let result = PricingTable::new(vec![
            tier(0, Some(100), dec!(0.03), "a"),
            tier(101, Some(200), dec!(0.02), "b"),
        ]);
        assert!(matches!(result, Err(PricingError::LastTierBounded { .. })));
    }

    #[test]
    fn equal_prices_across_tiers_are_allowed() {
        let result = PricingTable::new(vec![
            tier(0, Some(100), dec!(0.02), "a"),
            tier(101, None, dec!(0.02), "b"),
        ]);
        assert!(result.is_ok());
    }

    #[test]
    fn prices_never_increase_with_usage() {
        let table = PricingTable::default_table();
        let counts = [0u64, 50, 100, 101, 999, 1000, 1001, 10_000, 10_001, 1_000_000];
        for window in counts.windows(2) {
            let lower = table.tier_for(window[0]).price;
            let higher = table.tier_for(window[1]).price;
            assert!(
                higher <= lower,
                "price must be non-increasing: {lower} -> {higher}"
            );
        }
    }

    #[test]
    fn anchor_101_is_priced_in_the_standard_tier() {
        // 100 prior anchors this month; anchor #101 crosses into the second
        // tier and costs $0.02.
        let table = PricingTable::default_table();
        let quote = table.price_for_next_unit(100);
        assert_eq!(quote.price, dec!(0.02));
        assert_eq!(quote.tier, "standard");
        assert_eq!(quote.current_count, 100);
    }

    #[test]
    fn anchor_100_is_still_in_the_first_tier() {
        let table = PricingTable::default_table();
        let quote = table.price_for_next_unit(99);
        assert_eq!(quote.price, dec!(0.03));
        assert_eq!(quote.tier, "experience");
    }

    #[test]
    fn next_tier_info_reports_threshold_and_savings() {
        let table = PricingTable::default_table();
        let info = table.next_tier_info(50).expect("next tier exists");
        assert_eq!(info.threshold, 101);
        assert_eq!(info.price, dec!(0.02));
        assert_eq!(info.save_per_anchor, dec!(0.01));
        assert_eq!(info.save_percentage, dec!(33.3));
    }

    #[test]
    fn next_tier_info_is_none_in_the_last_tier() {
        let table = PricingTable::default_table();
        assert!(table.next_tier_info(20_000).is_none());
    }

    #[test]
    fn bulk_estimate_crosses_tier_boundary() {
        let table = PricingTable::default_table();
        // Anchors 99 and 100 at $0.03, anchor 101 at $0.02.
        let estimate = table.estimate_bulk(98, 3);
        assert_eq!(estimate.estimated_cost, dec!(0.08));
        assert_eq!(estimate.starting_from, 99);
        assert_eq!(estimate.average_price, dec!(0.0267));
    }
}
