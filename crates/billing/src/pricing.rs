//! Congregation pricing service
//!
//! Resolves which tier a church belongs on from its member count and assigns
//! tiers to subscriptions. Assignment never touches payments.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::{BillingInterval, IntervalName, PricingTier};
use crate::directory::MemberDirectory;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventType};
use crate::models::{Subscription, Tenant};
use crate::money::{round_money, CurrencyConverter};
use crate::store::{BillingStore, ChangeSet};

/// Price of one interval for a tier
#[derive(Debug, Clone, Serialize)]
pub struct IntervalPrice {
    pub interval_id: Uuid,
    pub interval: IntervalName,
    pub months: i32,
    pub price_usd: Decimal,
    pub price_local: Decimal,
    pub monthly_equivalent_usd: Decimal,
    pub discount_percent: Decimal,
}

/// What a church pays now and what it should be paying
#[derive(Debug, Clone, Serialize)]
pub struct PricingSummary {
    pub tenant_id: Uuid,
    pub member_count: i64,
    pub currency: String,
    pub current_tier: Option<PricingTier>,
    pub current_interval: Option<IntervalName>,
    pub recommended_tier: PricingTier,
    pub upgrade_required: bool,
    /// Prices of the recommended tier for every active interval
    pub prices: Vec<IntervalPrice>,
}

/// A tier assignment staged but not yet written
#[derive(Debug, Clone)]
pub struct TierAssignment {
    pub subscription: Subscription,
    pub tenant: Tenant,
    pub tier: PricingTier,
    pub interval: BillingInterval,
    pub member_count: i64,
    pub previous_tier_id: Option<Uuid>,
}

impl TierAssignment {
    pub fn changes(&self) -> ChangeSet {
        ChangeSet::new()
            .update_subscription(self.subscription.clone())
            .update_tenant(self.tenant.clone())
    }
}

#[derive(Clone)]
pub struct PricingService {
    store: Arc<dyn BillingStore>,
    members: Arc<dyn MemberDirectory>,
    converter: Arc<dyn CurrencyConverter>,
    upgrade_threshold_percent: Decimal,
}

impl PricingService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        members: Arc<dyn MemberDirectory>,
        converter: Arc<dyn CurrencyConverter>,
        upgrade_threshold_percent: Decimal,
    ) -> Self {
        Self {
            store,
            members,
            converter,
            upgrade_threshold_percent,
        }
    }

    /// The unique active tier covering `member_count`.
    pub async fn tier_for_member_count(&self, member_count: i64) -> BillingResult<PricingTier> {
        let catalog = self.store.catalog().await?;
        match catalog.tier_for_member_count(member_count) {
            Ok(tier) => Ok(tier.clone()),
            Err(err) => {
                if err.is_configuration() {
                    tracing::error!(
                        kind = err.kind(),
                        member_count = member_count,
                        error = %err,
                        "Pricing tier catalog does not cover member count"
                    );
                }
                Err(err)
            }
        }
    }

    /// USD price of `tier` for the interval called `interval_name`.
    pub fn price_for_interval(
        &self,
        tier: &PricingTier,
        interval_name: &str,
    ) -> BillingResult<Decimal> {
        Ok(tier.price_for(IntervalName::parse(interval_name)?))
    }

    /// The tier currently assigned to a church's subscription.
    pub async fn current_tier_for_tenant(&self, tenant_id: Uuid) -> BillingResult<PricingTier> {
        let subscription = self.store.require_subscription(tenant_id).await?;
        let tier_id = subscription.tier_id.ok_or_else(|| {
            BillingError::InvalidState(format!(
                "Subscription for church {} has no pricing tier (migration incomplete)",
                tenant_id
            ))
        })?;
        self.store.require_tier(tier_id).await
    }

    /// The tier a church should be on given its live member count.
    pub async fn recommended_tier_for_tenant(&self, tenant_id: Uuid) -> BillingResult<PricingTier> {
        let member_count = self.members.count_members(tenant_id).await?;
        self.tier_for_member_count(member_count.max(1)).await
    }

    /// Whether the church has outgrown, or nearly outgrown, its current tier.
    pub async fn upgrade_required(&self, tenant_id: Uuid) -> BillingResult<bool> {
        let tier = self.current_tier_for_tenant(tenant_id).await?;
        let member_count = self.members.count_members(tenant_id).await?;
        Ok(self.exceeds_threshold(&tier, member_count))
    }

    fn exceeds_threshold(&self, tier: &PricingTier, member_count: i64) -> bool {
        let Some(max) = tier.max_members else {
            return false;
        };
        member_count > max
            || Decimal::from(member_count) * Decimal::ONE_HUNDRED
                > Decimal::from(max) * self.upgrade_threshold_percent
    }

    /// Check eligibility and stage a tier/interval assignment without writing it.
    pub async fn prepare_assignment(
        &self,
        tenant_id: Uuid,
        tier_id: Uuid,
        interval_id: Uuid,
    ) -> BillingResult<TierAssignment> {
        let mut tenant = self.store.require_tenant(tenant_id).await?;
        let mut subscription = self.store.require_subscription(tenant_id).await?;
        if let Some(reference) = subscription.pending_reference() {
            return Err(BillingError::InvalidState(format!(
                "Church {} has a pending upgrade ({})",
                tenant_id, reference
            )));
        }

        let tier = self.store.require_tier(tier_id).await?;
        if !tier.is_active {
            return Err(BillingError::InvalidInput(format!(
                "Pricing tier '{}' is not available",
                tier.name
            )));
        }
        let interval = self.store.require_interval(interval_id).await?;
        if !interval.is_active {
            return Err(BillingError::InvalidInput(format!(
                "Billing interval {} is not available",
                interval.name
            )));
        }

        let member_count = self.members.count_members(tenant_id).await?;
        if !tier.contains(member_count.max(1)) {
            return Err(BillingError::InvalidState(format!(
                "Tier '{}' covers {} members but church {} has {}",
                tier.name,
                tier.range_label(),
                tenant_id,
                member_count
            )));
        }

        let previous_tier_id = subscription.tier_id;
        subscription.tier_id = Some(tier.id);
        subscription.interval_id = Some(interval.id);
        subscription.amount = tier.price_for(interval.name);

        tenant.member_count_cache = member_count;
        tenant.eligible_tier_id = Some(tier.id);
        tenant.tier_checked_at = Some(Utc::now());

        Ok(TierAssignment {
            subscription,
            tenant,
            tier,
            interval,
            member_count,
            previous_tier_id,
        })
    }

    /// Assign a tier and interval to a church's subscription.
    pub async fn assign_tier(
        &self,
        tenant_id: Uuid,
        tier_id: Uuid,
        interval_id: Uuid,
        performed_by: Option<Uuid>,
    ) -> BillingResult<Subscription> {
        let assignment = self
            .prepare_assignment(tenant_id, tier_id, interval_id)
            .await?;
        let subscription = self.store.apply(assignment.changes()).await?.ok_or_else(|| {
            BillingError::Internal("Tier assignment wrote no subscription".to_string())
        })?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %subscription.id,
            tier = %assignment.tier.name,
            interval = %assignment.interval.name,
            member_count = assignment.member_count,
            "Assigned pricing tier"
        );
        BillingEventBuilder::new(tenant_id, BillingEventType::TierAssigned)
            .actor_opt(performed_by)
            .data(serde_json::json!({
                "from_tier_id": assignment.previous_tier_id,
                "to_tier_id": assignment.tier.id,
                "interval": assignment.interval.name,
                "member_count": assignment.member_count,
            }))
            .emit();

        Ok(subscription)
    }

    /// Current and recommended tier with prices for every active interval.
    pub async fn pricing_summary(&self, tenant_id: Uuid) -> BillingResult<PricingSummary> {
        let catalog = self.store.catalog().await?;
        let subscription = self.store.require_subscription(tenant_id).await?;
        let member_count = self.members.count_members(tenant_id).await?;

        let recommended_tier = catalog.tier_for_member_count(member_count.max(1))?.clone();
        let current_tier = subscription
            .tier_id
            .and_then(|id| catalog.tier(id))
            .cloned();
        let current_interval = subscription
            .interval_id
            .and_then(|id| catalog.interval(id))
            .map(|i| i.name);
        let upgrade_required = current_tier
            .as_ref()
            .is_some_and(|tier| self.exceeds_threshold(tier, member_count));

        let prices = catalog
            .active_intervals()
            .map(|interval| {
                let price_usd = recommended_tier.price_for(interval.name);
                IntervalPrice {
                    interval_id: interval.id,
                    interval: interval.name,
                    months: interval.months,
                    price_usd,
                    price_local: self.converter.usd_to_local(price_usd),
                    monthly_equivalent_usd: round_money(
                        price_usd / Decimal::from(interval.months.max(1)),
                    ),
                    discount_percent: recommended_tier.discount_percent(interval.name),
                }
            })
            .collect();

        Ok(PricingSummary {
            tenant_id,
            member_count,
            currency: self.converter.payment_currency().to_string(),
            current_tier,
            current_interval,
            recommended_tier,
            upgrade_required,
            prices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        default_tiers, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID, STANDARD_TIER_ID,
    };
    use crate::directory::InMemoryMemberDirectory;
    use crate::money::FixedRateConverter;
    use crate::store::InMemoryBillingStore;
    use crate::testing::{active_subscription, tenant};
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<InMemoryBillingStore>,
        members: Arc<InMemoryMemberDirectory>,
        pricing: PricingService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryBillingStore::new());
        let members = Arc::new(InMemoryMemberDirectory::new());
        let pricing = PricingService::new(
            store.clone(),
            members.clone(),
            Arc::new(FixedRateConverter::new("NGN", dec!(1500))),
            dec!(95),
        );
        Fixture {
            store,
            members,
            pricing,
        }
    }

    async fn church_on_growth(f: &Fixture, members: i64) -> Uuid {
        let church = tenant("St. Mark's");
        f.store.insert_tenant(church.clone()).await;
        f.store
            .seed_subscription(active_subscription(
                church.id,
                GROWTH_TIER_ID,
                MONTHLY_INTERVAL_ID,
                dec!(9.99),
            ))
            .await;
        f.members.set_count(church.id, members).await;
        church.id
    }

    #[tokio::test]
    async fn test_upgrade_threshold() {
        let f = fixture();
        // growth tops out at 200; 95% of that is 190
        let at_threshold = church_on_growth(&f, 190).await;
        let above_threshold = church_on_growth(&f, 191).await;
        let over_max = church_on_growth(&f, 240).await;

        assert!(!f.pricing.upgrade_required(at_threshold).await.unwrap());
        assert!(f.pricing.upgrade_required(above_threshold).await.unwrap());
        assert!(f.pricing.upgrade_required(over_max).await.unwrap());
    }

    #[tokio::test]
    async fn test_unbounded_tier_never_requires_upgrade() {
        let f = fixture();
        let enterprise = default_tiers().pop().unwrap();
        assert!(!f.pricing.exceeds_threshold(&enterprise, 1_000_000));
    }

    #[tokio::test]
    async fn test_current_tier_missing_is_invalid_state() {
        let f = fixture();
        let church = tenant("Old Plan Chapel");
        f.store.insert_tenant(church.clone()).await;
        let mut sub =
            active_subscription(church.id, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID, dec!(9.99));
        sub.tier_id = None;
        f.store.seed_subscription(sub).await;

        let err = f.pricing.current_tier_for_tenant(church.id).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_assign_rejects_too_small_tier() {
        let f = fixture();
        let church_id = church_on_growth(&f, 350).await;

        let err = f
            .pricing
            .assign_tier(church_id, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_assign_updates_subscription_and_tenant_cache() {
        let f = fixture();
        let church_id = church_on_growth(&f, 350).await;

        let sub = f
            .pricing
            .assign_tier(church_id, STANDARD_TIER_ID, MONTHLY_INTERVAL_ID, None)
            .await
            .unwrap();
        assert_eq!(sub.tier_id, Some(STANDARD_TIER_ID));
        assert_eq!(sub.amount, dec!(13.99));

        let church = f.store.get_tenant(church_id).await.unwrap().unwrap();
        assert_eq!(church.member_count_cache, 350);
        assert_eq!(church.eligible_tier_id, Some(STANDARD_TIER_ID));
        assert!(f.store.payments().await.is_empty());
    }

    #[tokio::test]
    async fn test_price_for_interval_rejects_unknown_name() {
        let f = fixture();
        let growth = &default_tiers()[1];
        assert_eq!(
            f.pricing.price_for_interval(growth, "quarterly").unwrap(),
            dec!(28.47)
        );
        assert!(matches!(
            f.pricing.price_for_interval(growth, "fortnightly"),
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_pricing_summary_recommends_by_live_count() {
        let f = fixture();
        let church_id = church_on_growth(&f, 620).await;

        let summary = f.pricing.pricing_summary(church_id).await.unwrap();
        assert_eq!(summary.recommended_tier.name, "large");
        assert!(summary.upgrade_required);
        assert_eq!(summary.prices.len(), 4);
        let monthly = &summary.prices[0];
        assert_eq!(monthly.price_usd, dec!(24.99));
        assert_eq!(monthly.price_local, dec!(37485.00));
    }
}
