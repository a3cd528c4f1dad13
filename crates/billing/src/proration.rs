//! Proration calculation engine
//!
//! Quotes what a church owes to move mid-cycle to another tier, another
//! billing interval, or both. Tier changes are prorated by day over the
//! current interval; interval changes are charged in full and push the next
//! billing date out by the new interval's length.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{BillingInterval, IntervalName, PricingTier};
use crate::error::{BillingError, BillingResult};
use crate::models::{add_months, ChangeType, Subscription};
use crate::money::{round_money, round_rate, CurrencyConverter};
use crate::store::BillingStore;

/// Outcome of a proration quote, in both the base and the payment currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProrationResult {
    pub change_type: ChangeType,
    pub old_tier_id: Uuid,
    pub old_tier_name: String,
    pub new_tier_id: Uuid,
    pub new_tier_name: String,
    pub old_interval_id: Uuid,
    pub old_interval_name: IntervalName,
    pub new_interval_id: Uuid,
    pub new_interval_name: IntervalName,
    /// Length of the current interval in days
    pub period_days: i64,
    pub days_remaining: i64,
    pub days_used: i64,
    /// Set when the stored next billing date was not in the future
    pub days_remaining_clamped: bool,
    pub old_daily_rate: Decimal,
    pub new_daily_rate: Decimal,
    pub unused_credit_usd: Decimal,
    pub prorated_charge_usd: Decimal,
    pub net_charge_usd: Decimal,
    /// Set when the charge was below the credit and the net was floored at zero
    pub net_charge_floored: bool,
    pub currency: String,
    pub unused_credit_local: Decimal,
    pub prorated_charge_local: Decimal,
    pub net_charge_local: Decimal,
    pub old_next_billing_date: NaiveDate,
    pub new_next_billing_date: NaiveDate,
}

/// Everything a quote depends on, already resolved
#[derive(Debug, Clone, Copy)]
pub struct ProrationInput<'a> {
    pub old_tier: &'a PricingTier,
    pub new_tier: &'a PricingTier,
    pub old_interval: &'a BillingInterval,
    pub new_interval: &'a BillingInterval,
    pub next_billing_date: NaiveDate,
    pub today: NaiveDate,
}

impl ProrationInput<'_> {
    pub fn change_type(&self) -> BillingResult<ChangeType> {
        let tier_changed = self.old_tier.id != self.new_tier.id;
        let interval_changed = self.old_interval.id != self.new_interval.id;
        match (tier_changed, interval_changed) {
            (true, false) => Ok(ChangeType::TierUpgrade),
            (false, true) => Ok(ChangeType::IntervalChange),
            (true, true) => Ok(ChangeType::Combined),
            (false, false) => Err(BillingError::InvalidInput(
                "Requested tier and interval match the current subscription".to_string(),
            )),
        }
    }
}

/// Compute a quote. Pure apart from logging anomalies.
pub fn calculate(
    input: &ProrationInput<'_>,
    converter: &dyn CurrencyConverter,
) -> BillingResult<ProrationResult> {
    let change_type = input.change_type()?;

    let period_days = input.old_interval.period_days();
    if period_days <= 0 {
        return Err(BillingError::Configuration(format!(
            "Billing interval {} has no length",
            input.old_interval.name
        )));
    }

    let raw_remaining = (input.next_billing_date - input.today).num_days();
    let days_remaining_clamped = raw_remaining <= 0;
    let days_remaining = if days_remaining_clamped {
        tracing::warn!(
            anomaly = "days_remaining_clamped",
            next_billing_date = %input.next_billing_date,
            today = %input.today,
            raw_days_remaining = raw_remaining,
            "Next billing date is not in the future; prorating over one day"
        );
        1
    } else {
        raw_remaining
    };
    let days_used = (period_days - days_remaining).max(0);

    let period = Decimal::from(period_days);
    let remaining = Decimal::from(days_remaining);

    let old_price = input.old_tier.price_for(input.old_interval.name);
    let old_daily_rate = round_rate(old_price / period);
    let unused_credit_usd = round_money(old_price * remaining / period);

    let (new_daily_rate, prorated_charge_usd, new_next_billing_date) = match change_type {
        ChangeType::TierUpgrade => {
            let new_price = input.new_tier.price_for(input.old_interval.name);
            (
                round_rate(new_price / period),
                round_money(new_price * remaining / period),
                input.next_billing_date,
            )
        }
        ChangeType::IntervalChange | ChangeType::Combined => {
            let new_price = input.new_tier.price_for(input.new_interval.name);
            let new_period = Decimal::from(input.new_interval.period_days().max(1));
            (
                round_rate(new_price / new_period),
                round_money(new_price),
                add_months(input.next_billing_date, input.new_interval.months_u32())?,
            )
        }
    };

    let mut net_charge_usd = prorated_charge_usd - unused_credit_usd;
    let net_charge_floored = net_charge_usd < Decimal::ZERO;
    if net_charge_floored {
        tracing::warn!(
            anomaly = "negative_net_charge",
            old_tier = %input.old_tier.name,
            new_tier = %input.new_tier.name,
            unused_credit_usd = %unused_credit_usd,
            prorated_charge_usd = %prorated_charge_usd,
            "Charge is below unused credit; flooring net charge at zero"
        );
        net_charge_usd = Decimal::ZERO;
    }

    Ok(ProrationResult {
        change_type,
        old_tier_id: input.old_tier.id,
        old_tier_name: input.old_tier.name.clone(),
        new_tier_id: input.new_tier.id,
        new_tier_name: input.new_tier.name.clone(),
        old_interval_id: input.old_interval.id,
        old_interval_name: input.old_interval.name,
        new_interval_id: input.new_interval.id,
        new_interval_name: input.new_interval.name,
        period_days,
        days_remaining,
        days_used,
        days_remaining_clamped,
        old_daily_rate,
        new_daily_rate,
        unused_credit_usd,
        prorated_charge_usd,
        net_charge_usd,
        net_charge_floored,
        currency: converter.payment_currency().to_string(),
        unused_credit_local: converter.usd_to_local(unused_credit_usd),
        prorated_charge_local: converter.usd_to_local(prorated_charge_usd),
        net_charge_local: converter.usd_to_local(net_charge_usd),
        old_next_billing_date: input.next_billing_date,
        new_next_billing_date,
    })
}

/// Store-backed proration quotes
#[derive(Clone)]
pub struct ProrationEngine {
    store: Arc<dyn BillingStore>,
    converter: Arc<dyn CurrencyConverter>,
}

impl ProrationEngine {
    pub fn new(store: Arc<dyn BillingStore>, converter: Arc<dyn CurrencyConverter>) -> Self {
        Self { store, converter }
    }

    /// Quote moving `subscription` to `new_tier_id` and optionally a new interval, as of today.
    pub async fn calculate_upgrade(
        &self,
        subscription: &Subscription,
        new_tier_id: Uuid,
        new_interval_id: Option<Uuid>,
    ) -> BillingResult<ProrationResult> {
        let today = Utc::now().date_naive();
        self.calculate_upgrade_on(subscription, new_tier_id, new_interval_id, today)
            .await
    }

    pub async fn calculate_upgrade_on(
        &self,
        subscription: &Subscription,
        new_tier_id: Uuid,
        new_interval_id: Option<Uuid>,
        today: NaiveDate,
    ) -> BillingResult<ProrationResult> {
        let (Some(old_tier_id), Some(old_interval_id)) =
            (subscription.tier_id, subscription.interval_id)
        else {
            return Err(BillingError::InvalidState(format!(
                "Subscription {} has no tier or interval assigned",
                subscription.id
            )));
        };

        let old_tier = self.store.require_tier(old_tier_id).await?;
        let old_interval = self.store.require_interval(old_interval_id).await?;

        let new_tier = if new_tier_id == old_tier_id {
            old_tier.clone()
        } else {
            self.store.require_tier(new_tier_id).await?
        };
        if !new_tier.is_active {
            return Err(BillingError::InvalidInput(format!(
                "Pricing tier '{}' is not available",
                new_tier.name
            )));
        }

        let new_interval = match new_interval_id {
            Some(id) if id != old_interval_id => {
                let interval = self.store.require_interval(id).await?;
                if !interval.is_active {
                    return Err(BillingError::InvalidInput(format!(
                        "Billing interval {} is not available",
                        interval.name
                    )));
                }
                interval
            }
            _ => old_interval.clone(),
        };

        let input = ProrationInput {
            old_tier: &old_tier,
            new_tier: &new_tier,
            old_interval: &old_interval,
            new_interval: &new_interval,
            next_billing_date: subscription.next_billing_date,
            today,
        };
        calculate(&input, self.converter.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{default_intervals, default_tiers};
    use crate::money::FixedRateConverter;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn converter() -> FixedRateConverter {
        FixedRateConverter::new("NGN", dec!(1500))
    }

    struct Fixture {
        tiers: Vec<PricingTier>,
        intervals: Vec<BillingInterval>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tiers: default_tiers(),
                intervals: default_intervals(),
            }
        }

        fn tier(&self, name: &str) -> &PricingTier {
            self.tiers.iter().find(|t| t.name == name).unwrap()
        }

        fn interval(&self, name: IntervalName) -> &BillingInterval {
            self.intervals.iter().find(|i| i.name == name).unwrap()
        }
    }

    #[test]
    fn test_tier_upgrade_prorates_both_sides() {
        let f = Fixture::new();
        let today = date(2024, 6, 1);
        let input = ProrationInput {
            old_tier: f.tier("growth"),
            new_tier: f.tier("standard"),
            old_interval: f.interval(IntervalName::Monthly),
            new_interval: f.interval(IntervalName::Monthly),
            next_billing_date: date(2024, 6, 16),
            today,
        };

        let result = calculate(&input, &converter()).unwrap();

        assert_eq!(result.change_type, ChangeType::TierUpgrade);
        assert_eq!(result.days_remaining, 15);
        assert_eq!(result.days_used, 15);
        assert_eq!(result.unused_credit_usd, dec!(5.00));
        assert_eq!(result.prorated_charge_usd, dec!(7.00));
        assert_eq!(result.net_charge_usd, dec!(2.00));
        assert_eq!(result.net_charge_local, dec!(3000.00));
        assert_eq!(result.currency, "NGN");
        assert_eq!(result.new_next_billing_date, date(2024, 6, 16));
        assert_eq!(result.old_daily_rate, dec!(0.3330));
    }

    #[test]
    fn test_interval_change_charges_full_price() {
        let f = Fixture::new();
        let input = ProrationInput {
            old_tier: f.tier("growth"),
            new_tier: f.tier("growth"),
            old_interval: f.interval(IntervalName::Monthly),
            new_interval: f.interval(IntervalName::Annual),
            next_billing_date: date(2024, 6, 16),
            today: date(2024, 6, 1),
        };

        let result = calculate(&input, &converter()).unwrap();

        assert_eq!(result.change_type, ChangeType::IntervalChange);
        assert_eq!(result.unused_credit_usd, dec!(5.00));
        assert_eq!(result.prorated_charge_usd, dec!(107.88));
        assert_eq!(result.net_charge_usd, dec!(102.88));
        assert_eq!(result.new_next_billing_date, date(2025, 6, 16));
    }

    #[test]
    fn test_interval_charge_ignores_days_remaining() {
        let f = Fixture::new();
        let base = ProrationInput {
            old_tier: f.tier("growth"),
            new_tier: f.tier("growth"),
            old_interval: f.interval(IntervalName::Monthly),
            new_interval: f.interval(IntervalName::Quarterly),
            next_billing_date: date(2024, 6, 29),
            today: date(2024, 6, 1),
        };
        let later = ProrationInput {
            today: date(2024, 6, 27),
            ..base
        };

        let a = calculate(&base, &converter()).unwrap();
        let b = calculate(&later, &converter()).unwrap();
        assert_eq!(a.prorated_charge_usd, dec!(28.47));
        assert_eq!(b.prorated_charge_usd, dec!(28.47));
        assert!(a.unused_credit_usd > b.unused_credit_usd);
    }

    #[test]
    fn test_combined_uses_new_tier_full_price() {
        let f = Fixture::new();
        let input = ProrationInput {
            old_tier: f.tier("growth"),
            new_tier: f.tier("standard"),
            old_interval: f.interval(IntervalName::Monthly),
            new_interval: f.interval(IntervalName::Annual),
            next_billing_date: date(2024, 6, 16),
            today: date(2024, 6, 1),
        };

        let result = calculate(&input, &converter()).unwrap();

        assert_eq!(result.change_type, ChangeType::Combined);
        assert_eq!(result.unused_credit_usd, dec!(5.00));
        assert_eq!(result.prorated_charge_usd, dec!(143.88));
        assert_eq!(result.net_charge_usd, dec!(138.88));
        assert_eq!(result.new_next_billing_date, date(2025, 6, 16));
    }

    #[test]
    fn test_past_billing_date_clamps_to_one_day() {
        let f = Fixture::new();
        let input = ProrationInput {
            old_tier: f.tier("growth"),
            new_tier: f.tier("standard"),
            old_interval: f.interval(IntervalName::Monthly),
            new_interval: f.interval(IntervalName::Monthly),
            next_billing_date: date(2024, 5, 20),
            today: date(2024, 6, 1),
        };

        let result = calculate(&input, &converter()).unwrap();

        assert!(result.days_remaining_clamped);
        assert_eq!(result.days_remaining, 1);
        assert_eq!(result.days_used, 29);
        assert_eq!(result.unused_credit_usd, dec!(0.33));
        assert_eq!(result.prorated_charge_usd, dec!(0.47));
    }

    #[test]
    fn test_downgrade_net_floored_at_zero() {
        let f = Fixture::new();
        let input = ProrationInput {
            old_tier: f.tier("large"),
            new_tier: f.tier("growth"),
            old_interval: f.interval(IntervalName::Monthly),
            new_interval: f.interval(IntervalName::Monthly),
            next_billing_date: date(2024, 6, 16),
            today: date(2024, 6, 1),
        };

        let result = calculate(&input, &converter()).unwrap();

        assert!(result.net_charge_floored);
        assert_eq!(result.net_charge_usd, Decimal::ZERO);
        assert_eq!(result.net_charge_local, Decimal::ZERO);
    }

    #[test]
    fn test_no_change_is_invalid_input() {
        let f = Fixture::new();
        let input = ProrationInput {
            old_tier: f.tier("growth"),
            new_tier: f.tier("growth"),
            old_interval: f.interval(IntervalName::Monthly),
            new_interval: f.interval(IntervalName::Monthly),
            next_billing_date: date(2024, 6, 16),
            today: date(2024, 6, 1),
        };
        assert!(matches!(
            calculate(&input, &converter()),
            Err(BillingError::InvalidInput(_))
        ));
    }
}
