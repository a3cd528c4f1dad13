//! Storage add-ons
//!
//! Add-ons are bought mid-cycle at a prorated price and then renew with the
//! base subscription, so their renewal date always tracks `next_billing_date`.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use steward_shared::ensure_same_tenant;
use uuid::Uuid;

use crate::catalog::DAYS_PER_MONTH;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventType};
use crate::models::{
    AddonStatus, Payment, PaymentMetadata, PaymentStatus, StorageAddon, SubscriptionStatus,
    TenantStorageAddon,
};
use crate::money::{round_money, CurrencyConverter};
use crate::provider::{InitializePayment, PaymentProvider};
use crate::store::{BillingStore, ChangeSet};

/// Price of an add-on for the rest of the current billing cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddonQuote {
    pub addon_id: Uuid,
    pub name: String,
    pub storage_mb: i64,
    pub full_price_usd: Decimal,
    pub days_remaining: i64,
    pub prorated: bool,
    pub amount_usd: Decimal,
    pub amount_local: Decimal,
    pub currency: String,
    pub renewal_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddonPurchase {
    pub reference: String,
    pub authorization_url: String,
    pub quote: AddonQuote,
}

/// Prorate a monthly price over `days_remaining` on a 30-day month.
///
/// Days are clamped to `1..=30`, so the result never exceeds the full price.
pub fn prorate_addon(monthly_price: Decimal, days_remaining: i64) -> Decimal {
    let days = days_remaining.clamp(1, DAYS_PER_MONTH);
    round_money(monthly_price * Decimal::from(days) / Decimal::from(DAYS_PER_MONTH))
        .min(monthly_price)
}

#[derive(Clone)]
pub struct AddonService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    converter: Arc<dyn CurrencyConverter>,
    config: BillingConfig,
}

impl AddonService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        converter: Arc<dyn CurrencyConverter>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            provider,
            converter,
            config,
        }
    }

    async fn require_addon(&self, addon_id: Uuid) -> BillingResult<StorageAddon> {
        self.store
            .get_addon(addon_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Storage add-on {}", addon_id)))
    }

    pub async fn quote(&self, tenant_id: Uuid, addon_id: Uuid) -> BillingResult<AddonQuote> {
        self.quote_on(tenant_id, addon_id, Utc::now().date_naive()).await
    }

    pub async fn quote_on(
        &self,
        tenant_id: Uuid,
        addon_id: Uuid,
        today: NaiveDate,
    ) -> BillingResult<AddonQuote> {
        let subscription = self.store.require_subscription(tenant_id).await?;
        if !matches!(
            subscription.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        ) {
            return Err(BillingError::InvalidState(format!(
                "Add-ons need an active subscription; church {} is {}",
                tenant_id, subscription.status
            )));
        }

        let addon = self.require_addon(addon_id).await?;
        if !addon.is_active {
            return Err(BillingError::InvalidInput(format!(
                "Storage add-on '{}' is not available",
                addon.name
            )));
        }

        let owned = self.store.list_tenant_addons(Some(tenant_id)).await?;
        if owned
            .iter()
            .any(|a| a.addon_id == addon_id && a.status != AddonStatus::Canceled)
        {
            return Err(BillingError::AlreadyExists(format!(
                "Church {} already has add-on '{}'",
                tenant_id, addon.name
            )));
        }

        let raw_days = (subscription.next_billing_date - today).num_days();
        let days_remaining = raw_days.clamp(1, DAYS_PER_MONTH);
        let amount_usd = prorate_addon(addon.monthly_price, raw_days);

        Ok(AddonQuote {
            addon_id,
            name: addon.name,
            storage_mb: addon.storage_mb,
            full_price_usd: addon.monthly_price,
            days_remaining,
            prorated: amount_usd < addon.monthly_price,
            amount_usd,
            amount_local: self.converter.usd_to_local(amount_usd),
            currency: self.converter.payment_currency().to_string(),
            renewal_date: subscription.next_billing_date,
        })
    }

    /// Start a prorated add-on payment.
    pub async fn purchase(
        &self,
        tenant_id: Uuid,
        addon_id: Uuid,
        email: &str,
    ) -> BillingResult<AddonPurchase> {
        let quote = self.quote(tenant_id, addon_id).await?;
        if quote.amount_usd.is_zero() {
            return Err(BillingError::InvalidInput(format!(
                "Storage add-on '{}' is free",
                quote.name
            )));
        }
        let subscription = self.store.require_subscription(tenant_id).await?;

        let reference = format!("SA-{}", Uuid::new_v4().simple());
        let metadata = PaymentMetadata::StorageAddon {
            addon_id,
            prorated: quote.prorated,
            days_remaining: quote.days_remaining,
            full_price_usd: quote.full_price_usd,
        };
        let payment = Payment::pending(
            tenant_id,
            Some(subscription.id),
            reference.clone(),
            quote.amount_local,
            &quote.currency,
            metadata.clone(),
        );
        self.store
            .apply(ChangeSet::new().insert_payment(payment.clone()))
            .await?;

        let session = match self
            .provider
            .initialize_payment(InitializePayment {
                amount: quote.amount_local,
                currency: quote.currency.clone(),
                email: email.to_string(),
                reference: reference.clone(),
                callback_url: self.config.callback_url.clone(),
                metadata,
            })
            .await
        {
            Ok(session) => session,
            Err(err) => {
                let mut failed = payment;
                failed.mark_failed(format!("provider error: {}", err));
                if let Err(cleanup_err) = self.store.apply(ChangeSet::new().update_payment(failed)).await {
                    tracing::error!(
                        reference = %reference,
                        error = %cleanup_err,
                        "Failed to mark add-on payment FAILED"
                    );
                }
                return Err(err);
            }
        };

        tracing::info!(
            tenant_id = %tenant_id,
            reference = %reference,
            addon = %quote.name,
            days_remaining = quote.days_remaining,
            amount_usd = %quote.amount_usd,
            "Storage add-on purchase initiated"
        );

        Ok(AddonPurchase {
            reference,
            authorization_url: session.authorization_url,
            quote,
        })
    }

    /// Activate the add-on paid for by `reference`. Safe to call more than once.
    pub async fn complete_purchase(&self, reference: &str) -> BillingResult<TenantStorageAddon> {
        let mut payment = self.store.require_payment(reference).await?;
        let PaymentMetadata::StorageAddon {
            addon_id,
            days_remaining,
            full_price_usd,
            ..
        } = payment.metadata
        else {
            return Err(BillingError::InvalidInput(format!(
                "Payment {} is a {} payment, not a storage add-on purchase",
                reference,
                payment.payment_type()
            )));
        };

        match payment.status {
            PaymentStatus::Success => {
                return self
                    .store
                    .list_tenant_addons(Some(payment.tenant_id))
                    .await?
                    .into_iter()
                    .find(|a| a.purchase_reference == reference)
                    .ok_or_else(|| {
                        BillingError::Internal(format!(
                            "Payment {} succeeded but no add-on was activated",
                            reference
                        ))
                    });
            }
            PaymentStatus::Failed => {
                return Err(BillingError::InvalidState(format!(
                    "Payment {} already failed",
                    reference
                )));
            }
            PaymentStatus::Pending => {}
        }

        let verification = self.provider.verify_payment(reference).await?;
        if !verification.success {
            let reason = verification
                .failure_reason
                .unwrap_or_else(|| "payment not successful".to_string());
            payment.mark_failed(reason.clone());
            self.store
                .apply(ChangeSet::new().update_payment(payment.clone()))
                .await?;
            tracing::warn!(
                tenant_id = %payment.tenant_id,
                reference = %reference,
                reason = %reason,
                "Storage add-on payment failed verification"
            );
            BillingEventBuilder::new(payment.tenant_id, BillingEventType::PaymentFailed)
                .actor_type(ActorType::Provider)
                .reference(reference)
                .data(serde_json::json!({ "reason": reason }))
                .emit();
            return Err(BillingError::PaymentVerificationFailed {
                reference: reference.to_string(),
                reason,
            });
        }

        let subscription = self.store.require_subscription(payment.tenant_id).await?;
        let addon = TenantStorageAddon {
            id: Uuid::new_v4(),
            tenant_id: payment.tenant_id,
            subscription_id: subscription.id,
            addon_id,
            status: AddonStatus::Active,
            purchase_reference: reference.to_string(),
            prorated_amount: prorate_addon(full_price_usd, days_remaining),
            renewal_date: subscription.next_billing_date,
            activated_at: Utc::now(),
            canceled_at: None,
        };

        payment.mark_success(verification.provider_transaction_id);
        self.store
            .apply(
                ChangeSet::new()
                    .update_payment(payment)
                    .insert_addon(addon.clone()),
            )
            .await?;

        tracing::info!(
            tenant_id = %addon.tenant_id,
            addon_id = %addon_id,
            reference = %reference,
            renewal_date = %addon.renewal_date,
            "Storage add-on activated"
        );
        BillingEventBuilder::new(addon.tenant_id, BillingEventType::AddonActivated)
            .actor_type(ActorType::Provider)
            .reference(reference)
            .data(serde_json::json!({ "addon_id": addon_id }))
            .emit();

        Ok(addon)
    }

    pub async fn cancel(
        &self,
        tenant_id: Uuid,
        tenant_addon_id: Uuid,
        performed_by: Option<Uuid>,
    ) -> BillingResult<TenantStorageAddon> {
        let mut addon = self
            .store
            .get_tenant_addon(tenant_addon_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Add-on {}", tenant_addon_id)))?;
        ensure_same_tenant(&addon, tenant_id)?;
        if addon.status == AddonStatus::Canceled {
            return Err(BillingError::InvalidState(format!(
                "Add-on {} is already canceled",
                tenant_addon_id
            )));
        }

        addon.status = AddonStatus::Canceled;
        addon.canceled_at = Some(Utc::now());
        self.store
            .apply(ChangeSet::new().update_addon(addon.clone()))
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            tenant_addon_id = %tenant_addon_id,
            "Storage add-on canceled"
        );
        BillingEventBuilder::new(tenant_id, BillingEventType::AddonCanceled)
            .actor_opt(performed_by)
            .data(serde_json::json!({ "addon_id": addon.addon_id }))
            .emit();

        Ok(addon)
    }

    pub async fn list_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Vec<TenantStorageAddon>> {
        self.store.list_tenant_addons(Some(tenant_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{GROWTH_TIER_ID, MONTHLY_INTERVAL_ID};
    use crate::testing::TestHarness;
    use rust_decimal_macros::dec;

    async fn media_addon(h: &TestHarness) -> StorageAddon {
        let addon = StorageAddon {
            id: Uuid::new_v4(),
            name: "Media 10GB".to_string(),
            storage_mb: 10240,
            monthly_price: dec!(4.99),
            is_active: true,
        };
        h.store.insert_addon_product(addon.clone()).await;
        addon
    }

    async fn active_church(h: &TestHarness, name: &str) -> Uuid {
        h.add_active_church(name, 120, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap()
            .id
    }

    #[test]
    fn test_prorate_half_month() {
        assert_eq!(prorate_addon(dec!(4.99), 15), dec!(2.50));
    }

    #[test]
    fn test_prorate_clamps_to_one_day() {
        assert_eq!(prorate_addon(dec!(30.00), 0), dec!(1.00));
        assert_eq!(prorate_addon(dec!(30.00), -4), dec!(1.00));
    }

    #[test]
    fn test_prorate_caps_at_full_price() {
        // quarterly subscribers can have 90 days left
        assert_eq!(prorate_addon(dec!(4.99), 90), dec!(4.99));
        assert_eq!(prorate_addon(dec!(4.99), 30), dec!(4.99));
    }

    #[tokio::test]
    async fn test_quote_prorates_to_next_billing_date() {
        let h = TestHarness::new();
        let addon = media_addon(&h).await;
        let church = active_church(&h, "Oak Street").await;
        let sub = h.subscription(church).await.unwrap();

        let quote = h.billing.addons.quote(church, addon.id).await.unwrap();
        assert_eq!(quote.days_remaining, 15);
        assert!(quote.prorated);
        assert_eq!(quote.amount_usd, dec!(2.50));
        assert_eq!(quote.amount_local, dec!(3750.00));
        assert_eq!(quote.renewal_date, sub.next_billing_date);
    }

    #[tokio::test]
    async fn test_purchase_and_complete_is_idempotent() {
        let h = TestHarness::new();
        let addon = media_addon(&h).await;
        let church = active_church(&h, "Maple Avenue").await;

        let purchase = h
            .billing
            .addons
            .purchase(church, addon.id, "office@maple.example")
            .await
            .unwrap();
        assert!(purchase.reference.starts_with("SA-"));

        let owned = h
            .billing
            .addons
            .complete_purchase(&purchase.reference)
            .await
            .unwrap();
        assert_eq!(owned.status, AddonStatus::Active);
        assert_eq!(owned.prorated_amount, dec!(2.50));
        assert_eq!(
            owned.renewal_date,
            h.subscription(church).await.unwrap().next_billing_date
        );

        let again = h
            .billing
            .addons
            .complete_purchase(&purchase.reference)
            .await
            .unwrap();
        assert_eq!(again.id, owned.id);
        assert_eq!(h.billing.addons.list_for_tenant(church).await.unwrap().len(), 1);

        let err = h.billing.addons.quote(church, addon.id).await.unwrap_err();
        assert!(matches!(err, BillingError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_declined_purchase_activates_nothing() {
        let h = TestHarness::new();
        let addon = media_addon(&h).await;
        let church = active_church(&h, "Elm Court").await;
        let purchase = h
            .billing
            .addons
            .purchase(church, addon.id, "office@elm.example")
            .await
            .unwrap();
        h.provider.decline(&purchase.reference).await;

        let err = h
            .billing
            .addons
            .complete_purchase(&purchase.reference)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PaymentVerificationFailed { .. }));
        assert!(h.billing.addons.list_for_tenant(church).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_addon_or_inactive_subscription_rejected() {
        let h = TestHarness::new();
        let mut retired = media_addon(&h).await;
        retired.id = Uuid::new_v4();
        retired.is_active = false;
        h.store.insert_addon_product(retired.clone()).await;
        let church = active_church(&h, "Cedar Hill").await;

        let err = h.billing.addons.quote(church, retired.id).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        let mut sub = h.subscription(church).await.unwrap();
        sub.status = SubscriptionStatus::Suspended;
        h.store.seed_subscription(sub).await;
        let addon = media_addon(&h).await;
        let err = h.billing.addons.quote(church, addon.id).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_cancel_checks_owner() {
        let h = TestHarness::new();
        let addon = media_addon(&h).await;
        let church = active_church(&h, "Birch Road").await;
        let other = active_church(&h, "Willow Lane").await;
        let purchase = h
            .billing
            .addons
            .purchase(church, addon.id, "office@birch.example")
            .await
            .unwrap();
        let owned = h
            .billing
            .addons
            .complete_purchase(&purchase.reference)
            .await
            .unwrap();

        let err = h.billing.addons.cancel(other, owned.id, None).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));

        let canceled = h.billing.addons.cancel(church, owned.id, None).await.unwrap();
        assert_eq!(canceled.status, AddonStatus::Canceled);
        assert!(canceled.canceled_at.is_some());

        let err = h.billing.addons.cancel(church, owned.id, None).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));

        // canceled add-ons can be bought again
        h.billing.addons.quote(church, addon.id).await.unwrap();
    }
}
