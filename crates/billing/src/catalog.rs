//! Pricing tier catalog
//!
//! Tiers are keyed by congregation size. Each tier carries a price for every
//! billing interval; longer intervals are discounted relative to paying
//! monthly. Ranges are inclusive on both ends and `max_members = None` means
//! the tier is unbounded.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::money::round_money;

/// Days in one billing month for daily-rate arithmetic
pub const DAYS_PER_MONTH: i64 = 30;

pub const FREE_TIER_ID: Uuid = Uuid::from_u128(0x5e1f_0000_0000_4000_8000_0000_0000_0001);
pub const GROWTH_TIER_ID: Uuid = Uuid::from_u128(0x5e1f_0000_0000_4000_8000_0000_0000_0002);
pub const STANDARD_TIER_ID: Uuid = Uuid::from_u128(0x5e1f_0000_0000_4000_8000_0000_0000_0003);
pub const LARGE_TIER_ID: Uuid = Uuid::from_u128(0x5e1f_0000_0000_4000_8000_0000_0000_0004);
pub const ENTERPRISE_TIER_ID: Uuid = Uuid::from_u128(0x5e1f_0000_0000_4000_8000_0000_0000_0005);

pub const MONTHLY_INTERVAL_ID: Uuid = Uuid::from_u128(0x5e1f_0000_0000_4000_9000_0000_0000_0001);
pub const QUARTERLY_INTERVAL_ID: Uuid = Uuid::from_u128(0x5e1f_0000_0000_4000_9000_0000_0000_0003);
pub const BIANNUAL_INTERVAL_ID: Uuid = Uuid::from_u128(0x5e1f_0000_0000_4000_9000_0000_0000_0006);
pub const ANNUAL_INTERVAL_ID: Uuid = Uuid::from_u128(0x5e1f_0000_0000_4000_9000_0000_0000_0012);

/// Billing interval names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntervalName {
    Monthly,
    Quarterly,
    Biannual,
    Annual,
}

impl IntervalName {
    pub const ALL: [IntervalName; 4] = [
        IntervalName::Monthly,
        IntervalName::Quarterly,
        IntervalName::Biannual,
        IntervalName::Annual,
    ];

    pub fn months(&self) -> u32 {
        match self {
            IntervalName::Monthly => 1,
            IntervalName::Quarterly => 3,
            IntervalName::Biannual => 6,
            IntervalName::Annual => 12,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalName::Monthly => "MONTHLY",
            IntervalName::Quarterly => "QUARTERLY",
            IntervalName::Biannual => "BIANNUAL",
            IntervalName::Annual => "ANNUAL",
        }
    }

    /// Parse an interval name, case-insensitively.
    pub fn parse(name: &str) -> BillingResult<Self> {
        match name.trim().to_uppercase().as_str() {
            "MONTHLY" => Ok(IntervalName::Monthly),
            "QUARTERLY" => Ok(IntervalName::Quarterly),
            "BIANNUAL" => Ok(IntervalName::Biannual),
            "ANNUAL" => Ok(IntervalName::Annual),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown billing interval '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for IntervalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A billing interval row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingInterval {
    pub id: Uuid,
    pub name: IntervalName,
    pub months: i32,
    pub is_active: bool,
}

impl BillingInterval {
    /// Length of the interval in days (`months × 30`)
    pub fn period_days(&self) -> i64 {
        i64::from(self.months) * DAYS_PER_MONTH
    }

    pub fn months_u32(&self) -> u32 {
        u32::try_from(self.months).unwrap_or(1)
    }
}

/// A congregation-size pricing tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PricingTier {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub min_members: i64,
    pub max_members: Option<i64>,
    pub monthly_price: Decimal,
    pub quarterly_price: Decimal,
    pub biannual_price: Decimal,
    pub annual_price: Decimal,
    pub is_active: bool,
    pub display_order: i32,
}

impl PricingTier {
    pub fn contains(&self, member_count: i64) -> bool {
        member_count >= self.min_members && self.max_members.map_or(true, |max| member_count <= max)
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_members.is_none()
    }

    pub fn is_free(&self) -> bool {
        self.monthly_price.is_zero()
    }

    /// Price in USD for a whole interval
    pub fn price_for(&self, interval: IntervalName) -> Decimal {
        match interval {
            IntervalName::Monthly => self.monthly_price,
            IntervalName::Quarterly => self.quarterly_price,
            IntervalName::Biannual => self.biannual_price,
            IntervalName::Annual => self.annual_price,
        }
    }

    /// Discount of `interval` relative to paying monthly for the same span, in percent.
    pub fn discount_percent(&self, interval: IntervalName) -> Decimal {
        let undiscounted = self.monthly_price * Decimal::from(interval.months());
        if undiscounted.is_zero() {
            return Decimal::ZERO;
        }
        round_money((Decimal::ONE - self.price_for(interval) / undiscounted) * dec!(100))
    }

    pub fn range_label(&self) -> String {
        match self.max_members {
            Some(max) => format!("{}-{}", self.min_members, max),
            None => format!("{}+", self.min_members),
        }
    }
}

/// The set of tiers and intervals prices are resolved against.
#[derive(Debug, Clone)]
pub struct TierCatalog {
    tiers: Vec<PricingTier>,
    intervals: Vec<BillingInterval>,
}

impl TierCatalog {
    pub fn new(mut tiers: Vec<PricingTier>, intervals: Vec<BillingInterval>) -> Self {
        tiers.sort_by_key(|t| (t.display_order, t.min_members));
        Self { tiers, intervals }
    }

    /// The standard congregation tiers and the four billing intervals.
    pub fn default_catalog() -> Self {
        Self::new(default_tiers(), default_intervals())
    }

    pub fn tiers(&self) -> &[PricingTier] {
        &self.tiers
    }

    pub fn active_tiers(&self) -> impl Iterator<Item = &PricingTier> {
        self.tiers.iter().filter(|t| t.is_active)
    }

    pub fn intervals(&self) -> &[BillingInterval] {
        &self.intervals
    }

    pub fn active_intervals(&self) -> impl Iterator<Item = &BillingInterval> {
        self.intervals.iter().filter(|i| i.is_active)
    }

    pub fn tier(&self, id: Uuid) -> Option<&PricingTier> {
        self.tiers.iter().find(|t| t.id == id)
    }

    pub fn interval(&self, id: Uuid) -> Option<&BillingInterval> {
        self.intervals.iter().find(|i| i.id == id)
    }

    pub fn interval_by_name(&self, name: IntervalName) -> Option<&BillingInterval> {
        self.intervals.iter().find(|i| i.name == name && i.is_active)
    }

    /// The unique active tier covering `member_count`.
    ///
    /// Counts below 1 are a caller error. No match (or more than one) means the
    /// catalog itself is broken and is reported as a configuration error.
    pub fn tier_for_member_count(&self, member_count: i64) -> BillingResult<&PricingTier> {
        if member_count < 1 {
            return Err(BillingError::InvalidInput(format!(
                "Member count must be at least 1, got {}",
                member_count
            )));
        }

        let mut matching = self.active_tiers().filter(|t| t.contains(member_count));
        match (matching.next(), matching.next()) {
            (Some(tier), None) => Ok(tier),
            (None, _) => Err(BillingError::Configuration(format!(
                "No active pricing tier covers {} members",
                member_count
            ))),
            (Some(first), Some(second)) => Err(BillingError::Configuration(format!(
                "Pricing tiers '{}' and '{}' both cover {} members",
                first.name, second.name, member_count
            ))),
        }
    }

    /// The tier new churches start on: the lowest active zero-price tier.
    pub fn free_tier(&self) -> BillingResult<&PricingTier> {
        self.active_tiers()
            .filter(|t| t.is_free())
            .min_by_key(|t| t.min_members)
            .ok_or_else(|| BillingError::Configuration("No active free tier".to_string()))
    }

    /// Check that active tiers start at 1, are contiguous, do not overlap, and
    /// that only the last one is unbounded.
    pub fn validate(&self) -> BillingResult<()> {
        let mut active: Vec<&PricingTier> = self.active_tiers().collect();
        active.sort_by_key(|t| t.min_members);

        let Some(first) = active.first() else {
            return Err(BillingError::Configuration(
                "Pricing catalog has no active tiers".to_string(),
            ));
        };
        if first.min_members != 1 {
            return Err(BillingError::Configuration(format!(
                "Lowest tier '{}' starts at {} members, expected 1",
                first.name, first.min_members
            )));
        }

        for pair in active.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            let Some(max) = lower.max_members else {
                return Err(BillingError::Configuration(format!(
                    "Unbounded tier '{}' is followed by tier '{}'",
                    lower.name, upper.name
                )));
            };
            if upper.min_members <= max {
                return Err(BillingError::Configuration(format!(
                    "Tiers '{}' ({}) and '{}' ({}) overlap",
                    lower.name,
                    lower.range_label(),
                    upper.name,
                    upper.range_label()
                )));
            }
            if upper.min_members != max + 1 {
                return Err(BillingError::Configuration(format!(
                    "Gap between tiers '{}' ({}) and '{}' ({})",
                    lower.name,
                    lower.range_label(),
                    upper.name,
                    upper.range_label()
                )));
            }
        }

        for tier in &active {
            if let Some(max) = tier.max_members {
                if max < tier.min_members {
                    return Err(BillingError::Configuration(format!(
                        "Tier '{}' has max {} below min {}",
                        tier.name, max, tier.min_members
                    )));
                }
            }
        }

        if active.last().is_some_and(|t| !t.is_unbounded()) {
            return Err(BillingError::Configuration(
                "Highest tier must be unbounded".to_string(),
            ));
        }

        Ok(())
    }
}

fn tier(
    id: Uuid,
    name: &str,
    display_name: &str,
    range: (i64, Option<i64>),
    prices: [Decimal; 4],
    display_order: i32,
) -> PricingTier {
    PricingTier {
        id,
        name: name.to_string(),
        display_name: display_name.to_string(),
        min_members: range.0,
        max_members: range.1,
        monthly_price: prices[0],
        quarterly_price: prices[1],
        biannual_price: prices[2],
        annual_price: prices[3],
        is_active: true,
        display_order,
    }
}

pub fn default_tiers() -> Vec<PricingTier> {
    vec![
        tier(
            FREE_TIER_ID,
            "free",
            "Free",
            (1, Some(50)),
            [Decimal::ZERO; 4],
            1,
        ),
        tier(
            GROWTH_TIER_ID,
            "growth",
            "Growth",
            (51, Some(200)),
            [dec!(9.99), dec!(28.47), dec!(53.94), dec!(107.88)],
            2,
        ),
        tier(
            STANDARD_TIER_ID,
            "standard",
            "Standard",
            (201, Some(500)),
            [dec!(13.99), dec!(39.87), dec!(75.54), dec!(143.88)],
            3,
        ),
        tier(
            LARGE_TIER_ID,
            "large",
            "Large",
            (501, Some(1000)),
            [dec!(24.99), dec!(71.22), dec!(134.94), dec!(263.88)],
            4,
        ),
        tier(
            ENTERPRISE_TIER_ID,
            "enterprise",
            "Enterprise",
            (1001, None),
            [dec!(49.99), dec!(142.47), dec!(269.94), dec!(539.88)],
            5,
        ),
    ]
}

pub fn default_intervals() -> Vec<BillingInterval> {
    [
        (MONTHLY_INTERVAL_ID, IntervalName::Monthly),
        (QUARTERLY_INTERVAL_ID, IntervalName::Quarterly),
        (BIANNUAL_INTERVAL_ID, IntervalName::Biannual),
        (ANNUAL_INTERVAL_ID, IntervalName::Annual),
    ]
    .into_iter()
    .map(|(id, name)| BillingInterval {
        id,
        name,
        months: name.months() as i32,
        is_active: true,
    })
    .collect()
}
