//! Payment provider callbacks
//!
//! The provider redirects (or posts) back with a payment reference once a
//! hosted payment finishes. The reference's stored metadata decides which
//! service completes it.

use std::sync::Arc;

use serde::Serialize;

use crate::addons::AddonService;
use crate::error::{BillingError, BillingResult};
use crate::models::{PaymentMetadata, PaymentType, Subscription, TenantStorageAddon};
use crate::store::BillingStore;
use crate::subscriptions::SubscriptionService;
use crate::upgrade::TierUpgradeOrchestrator;

/// What a callback completed
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallbackOutcome {
    SubscriptionActivated { subscription: Box<Subscription> },
    TierChangeCompleted { subscription: Box<Subscription> },
    AddonActivated { addon: TenantStorageAddon },
}

/// Routes provider callbacks to the service that owns the payment
#[derive(Clone)]
pub struct PaymentCallbackHandler {
    store: Arc<dyn BillingStore>,
    subscriptions: SubscriptionService,
    upgrades: TierUpgradeOrchestrator,
    addons: AddonService,
}

impl PaymentCallbackHandler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        subscriptions: SubscriptionService,
        upgrades: TierUpgradeOrchestrator,
        addons: AddonService,
    ) -> Self {
        Self {
            store,
            subscriptions,
            upgrades,
            addons,
        }
    }

    /// Complete whatever `reference` paid for.
    ///
    /// Every target is idempotent, so replayed callbacks return the same outcome.
    pub async fn handle_callback(&self, reference: &str) -> BillingResult<CallbackOutcome> {
        let payment = self.store.require_payment(reference).await?;

        tracing::info!(
            tenant_id = %payment.tenant_id,
            reference = %reference,
            payment_type = %payment.payment_type(),
            status = %payment.status,
            "Processing payment callback"
        );

        let result = match payment.metadata {
            PaymentMetadata::Subscription { .. } => self
                .subscriptions
                .verify_and_activate(reference)
                .await
                .map(|subscription| CallbackOutcome::SubscriptionActivated {
                    subscription: Box::new(subscription),
                }),
            PaymentMetadata::TierUpgrade { .. } => self
                .upgrades
                .complete(reference)
                .await
                .map(|subscription| CallbackOutcome::TierChangeCompleted {
                    subscription: Box::new(subscription),
                }),
            PaymentMetadata::StorageAddon { .. } => self
                .addons
                .complete_purchase(reference)
                .await
                .map(|addon| CallbackOutcome::AddonActivated { addon }),
            PaymentMetadata::RecurringCharge { .. } => Err(BillingError::InvalidInput(format!(
                "{} payments are settled by the retry sweep, not by callback",
                PaymentType::RecurringCharge
            ))),
        };

        if let Err(err) = &result {
            tracing::warn!(
                tenant_id = %payment.tenant_id,
                reference = %reference,
                kind = err.kind(),
                error = %err,
                "Payment callback was not applied"
            );
        }
        result
    }
}
