//! In-memory billing store for tests and local development

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BillingStore, ChangeSet, Write};
use crate::catalog::{BillingInterval, PricingTier, TierCatalog};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    AddonStatus, LegacyPlan, MigrationStatus, Payment, PricingModelMigration, StorageAddon,
    Subscription, SubscriptionFilter, Tenant, TenantStorageAddon, TierChangeHistory,
    TierChangeStatus,
};

#[derive(Debug, Clone, Default)]
struct State {
    tiers: Vec<PricingTier>,
    intervals: Vec<BillingInterval>,
    tenants: Vec<Tenant>,
    subscriptions: HashMap<Uuid, Subscription>,
    payments: Vec<Payment>,
    tier_changes: Vec<TierChangeHistory>,
    migrations: Vec<PricingModelMigration>,
    legacy_plans: HashMap<Uuid, LegacyPlan>,
    addons: HashMap<Uuid, StorageAddon>,
    tenant_addons: Vec<TenantStorageAddon>,
}

/// Billing store held entirely in memory behind one lock.
///
/// `apply` stages every write on a copy of the state and swaps it in only
/// when all guards pass, so a rejected change set leaves nothing behind.
#[derive(Debug)]
pub struct InMemoryBillingStore {
    state: Mutex<State>,
}

impl Default for InMemoryBillingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBillingStore {
    /// Empty store seeded with the default tier catalog
    pub fn new() -> Self {
        Self::with_catalog(TierCatalog::default_catalog())
    }

    pub fn with_catalog(catalog: TierCatalog) -> Self {
        let state = State {
            tiers: catalog.tiers().to_vec(),
            intervals: catalog.intervals().to_vec(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn replace_tiers(&self, tiers: Vec<PricingTier>) {
        self.state.lock().await.tiers = tiers;
    }

    pub async fn insert_tenant(&self, tenant: Tenant) {
        let mut state = self.state.lock().await;
        state.tenants.retain(|t| t.id != tenant.id);
        state.tenants.push(tenant);
    }

    pub async fn insert_legacy_plan(&self, plan: LegacyPlan) {
        self.state.lock().await.legacy_plans.insert(plan.id, plan);
    }

    pub async fn insert_addon_product(&self, addon: StorageAddon) {
        self.state.lock().await.addons.insert(addon.id, addon);
    }

    /// Seed a subscription directly, bypassing the write guards.
    pub async fn seed_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.tenant_id, subscription);
    }

    /// Seed a purchased add-on directly, bypassing the write guards.
    pub async fn seed_tenant_addon(&self, addon: TenantStorageAddon) {
        self.state.lock().await.tenant_addons.push(addon);
    }

    pub async fn payments(&self) -> Vec<Payment> {
        self.state.lock().await.payments.clone()
    }
}

impl State {
    fn write_subscription(&mut self, write: Write<Subscription>) -> BillingResult<Subscription> {
        let now = Utc::now();
        let stored = match write {
            Write::Insert(mut sub) => {
                if self.subscriptions.contains_key(&sub.tenant_id) {
                    return Err(BillingError::AlreadyExists(format!(
                        "Subscription for church {}",
                        sub.tenant_id
                    )));
                }
                sub.version = 1;
                sub.created_at = now;
                sub.updated_at = now;
                sub
            }
            Write::Update(mut sub) => {
                let current = self.subscriptions.get(&sub.tenant_id).ok_or_else(|| {
                    BillingError::NotFound(format!("Subscription for church {}", sub.tenant_id))
                })?;
                if current.version != sub.version || current.id != sub.id {
                    return Err(BillingError::ConcurrentModification(format!(
                        "Subscription {} changed (expected version {}, found {})",
                        sub.id, sub.version, current.version
                    )));
                }
                sub.version += 1;
                sub.updated_at = now;
                sub
            }
        };
        self.subscriptions.insert(stored.tenant_id, stored.clone());
        Ok(stored)
    }

    fn write_tenant(&mut self, tenant: Tenant) -> BillingResult<()> {
        let slot = self
            .tenants
            .iter_mut()
            .find(|t| t.id == tenant.id)
            .ok_or_else(|| BillingError::NotFound(format!("Church {}", tenant.id)))?;
        *slot = tenant;
        Ok(())
    }

    fn write_payment(&mut self, write: Write<Payment>) -> BillingResult<()> {
        match write {
            Write::Insert(payment) => {
                if self.payments.iter().any(|p| p.reference == payment.reference) {
                    return Err(BillingError::AlreadyExists(format!(
                        "Payment reference {}",
                        payment.reference
                    )));
                }
                self.payments.push(payment);
            }
            Write::Update(payment) => {
                let slot = self
                    .payments
                    .iter_mut()
                    .find(|p| p.reference == payment.reference)
                    .ok_or_else(|| {
                        BillingError::NotFound(format!("Payment {}", payment.reference))
                    })?;
                if slot.status.is_terminal() && slot.status != payment.status {
                    return Err(BillingError::InvalidState(format!(
                        "Payment {} is already {}",
                        payment.reference, slot.status
                    )));
                }
                *slot = payment;
            }
        }
        Ok(())
    }

    fn write_tier_change(&mut self, write: Write<TierChangeHistory>) -> BillingResult<()> {
        match write {
            Write::Insert(change) => {
                if self.tier_changes.iter().any(|c| {
                    c.subscription_id == change.subscription_id
                        && c.status == TierChangeStatus::Pending
                }) {
                    return Err(BillingError::InvalidState(format!(
                        "Subscription {} already has a pending tier change",
                        change.subscription_id
                    )));
                }
                if self
                    .tier_changes
                    .iter()
                    .any(|c| c.payment_reference == change.payment_reference)
                {
                    return Err(BillingError::AlreadyExists(format!(
                        "Tier change for payment {}",
                        change.payment_reference
                    )));
                }
                self.tier_changes.push(change);
            }
            Write::Update(change) => {
                let slot = self
                    .tier_changes
                    .iter_mut()
                    .find(|c| c.id == change.id)
                    .ok_or_else(|| BillingError::NotFound(format!("Tier change {}", change.id)))?;
                if slot.status.is_terminal() {
                    return Err(BillingError::InvalidState(format!(
                        "Tier change {} is already {}",
                        change.id, slot.status
                    )));
                }
                *slot = change;
            }
        }
        Ok(())
    }

    fn write_migration(&mut self, write: Write<PricingModelMigration>) -> BillingResult<()> {
        match write {
            Write::Insert(migration) => {
                if migration.status == MigrationStatus::Completed
                    && self.migrations.iter().any(|m| {
                        m.tenant_id == migration.tenant_id && m.status == MigrationStatus::Completed
                    })
                {
                    return Err(BillingError::InvalidState(format!(
                        "Church {} is already migrated",
                        migration.tenant_id
                    )));
                }
                self.migrations.push(migration);
            }
            Write::Update(migration) => {
                let slot = self
                    .migrations
                    .iter_mut()
                    .find(|m| m.id == migration.id)
                    .ok_or_else(|| {
                        BillingError::NotFound(format!("Pricing migration {}", migration.id))
                    })?;
                *slot = migration;
            }
        }
        Ok(())
    }

    fn write_addon(&mut self, write: Write<TenantStorageAddon>) -> BillingResult<()> {
        match write {
            Write::Insert(addon) => {
                if self.tenant_addons.iter().any(|a| a.id == addon.id) {
                    return Err(BillingError::AlreadyExists(format!("Add-on {}", addon.id)));
                }
                self.tenant_addons.push(addon);
            }
            Write::Update(addon) => {
                let slot = self
                    .tenant_addons
                    .iter_mut()
                    .find(|a| a.id == addon.id)
                    .ok_or_else(|| BillingError::NotFound(format!("Add-on {}", addon.id)))?;
                *slot = addon;
            }
        }
        Ok(())
    }

    fn sync_addon_renewals(&mut self, subscription: &Subscription) {
        for addon in self.tenant_addons.iter_mut().filter(|a| {
            a.tenant_id == subscription.tenant_id && a.status == AddonStatus::Active
        }) {
            addon.renewal_date = subscription.next_billing_date;
        }
    }

    fn apply(&mut self, changes: ChangeSet) -> BillingResult<Option<Subscription>> {
        let subscription = changes
            .subscription
            .map(|write| self.write_subscription(write))
            .transpose()?;
        if let Some(tenant) = changes.tenant {
            self.write_tenant(tenant)?;
        }
        for write in changes.payments {
            self.write_payment(write)?;
        }
        for write in changes.tier_changes {
            self.write_tier_change(write)?;
        }
        for write in changes.migrations {
            self.write_migration(write)?;
        }
        for write in changes.addons {
            self.write_addon(write)?;
        }
        if let Some(sub) = &subscription {
            self.sync_addon_renewals(sub);
        }
        Ok(subscription)
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn list_tiers(&self) -> BillingResult<Vec<PricingTier>> {
        Ok(self.state.lock().await.tiers.clone())
    }

    async fn get_tier(&self, id: Uuid) -> BillingResult<Option<PricingTier>> {
        Ok(self.state.lock().await.tiers.iter().find(|t| t.id == id).cloned())
    }

    async fn list_intervals(&self) -> BillingResult<Vec<BillingInterval>> {
        Ok(self.state.lock().await.intervals.clone())
    }

    async fn get_interval(&self, id: Uuid) -> BillingResult<Option<BillingInterval>> {
        Ok(self
            .state
            .lock()
            .await
            .intervals
            .iter()
            .find(|i| i.id == id)
            .cloned())
    }

    async fn get_tenant(&self, id: Uuid) -> BillingResult<Option<Tenant>> {
        Ok(self
            .state
            .lock()
            .await
            .tenants
            .iter()
            .find(|t| t.id == id)
            .cloned())
    }

    async fn list_tenants(&self) -> BillingResult<Vec<Tenant>> {
        Ok(self.state.lock().await.tenants.clone())
    }

    async fn get_subscription(&self, tenant_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(&tenant_id).cloned())
    }

    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut subs: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        subs.sort_by_key(|s| (s.next_billing_date, s.id));
        Ok(subs)
    }

    async fn get_payment(&self, reference: &str) -> BillingResult<Option<Payment>> {
        Ok(self
            .state
            .lock()
            .await
            .payments
            .iter()
            .find(|p| p.reference == reference)
            .cloned())
    }

    async fn get_tier_change(&self, reference: &str) -> BillingResult<Option<TierChangeHistory>> {
        Ok(self
            .state
            .lock()
            .await
            .tier_changes
            .iter()
            .find(|c| c.payment_reference == reference)
            .cloned())
    }

    async fn list_tier_changes(
        &self,
        tenant_id: Option<Uuid>,
        status: Option<TierChangeStatus>,
    ) -> BillingResult<Vec<TierChangeHistory>> {
        Ok(self
            .state
            .lock()
            .await
            .tier_changes
            .iter()
            .rev()
            .filter(|c| tenant_id.map_or(true, |t| c.tenant_id == t))
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect())
    }

    async fn list_migrations(
        &self,
        tenant_id: Option<Uuid>,
    ) -> BillingResult<Vec<PricingModelMigration>> {
        Ok(self
            .state
            .lock()
            .await
            .migrations
            .iter()
            .rev()
            .filter(|m| tenant_id.map_or(true, |t| m.tenant_id == t))
            .cloned()
            .collect())
    }

    async fn get_legacy_plan(&self, id: Uuid) -> BillingResult<Option<LegacyPlan>> {
        Ok(self.state.lock().await.legacy_plans.get(&id).cloned())
    }

    async fn get_addon(&self, id: Uuid) -> BillingResult<Option<StorageAddon>> {
        Ok(self.state.lock().await.addons.get(&id).cloned())
    }

    async fn list_tenant_addons(
        &self,
        tenant_id: Option<Uuid>,
    ) -> BillingResult<Vec<TenantStorageAddon>> {
        Ok(self
            .state
            .lock()
            .await
            .tenant_addons
            .iter()
            .filter(|a| tenant_id.map_or(true, |t| a.tenant_id == t))
            .cloned()
            .collect())
    }

    async fn get_tenant_addon(&self, id: Uuid) -> BillingResult<Option<TenantStorageAddon>> {
        Ok(self
            .state
            .lock()
            .await
            .tenant_addons
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn apply(&self, changes: ChangeSet) -> BillingResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let written = staged.apply(changes)?;
        *state = staged;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{GROWTH_TIER_ID, MONTHLY_INTERVAL_ID};
    use crate::models::{PaymentMetadata, PaymentStatus};
    use crate::testing::{active_subscription, tenant};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_insert_then_stale_update_is_rejected() {
        let store = InMemoryBillingStore::new();
        let church = tenant("Grace Chapel");
        store.insert_tenant(church.clone()).await;

        let sub = active_subscription(church.id, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID, dec!(9.99));
        let written = store
            .apply(ChangeSet::new().insert_subscription(sub))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written.version, 1);

        let mut first = written.clone();
        first.auto_renew = false;
        let updated = store
            .apply(ChangeSet::new().update_subscription(first))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.version, 2);

        let err = store
            .apply(ChangeSet::new().update_subscription(written))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected() {
        let store = InMemoryBillingStore::new();
        let church = tenant("Grace Chapel");
        let sub = active_subscription(church.id, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID, dec!(9.99));

        store
            .apply(ChangeSet::new().insert_subscription(sub.clone()))
            .await
            .unwrap();
        let err = store
            .apply(ChangeSet::new().insert_subscription(sub))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_failed_apply_leaves_no_partial_writes() {
        let store = InMemoryBillingStore::new();
        let church = tenant("Grace Chapel");
        let payment = Payment::pending(
            church.id,
            None,
            "REF-1".to_string(),
            dec!(1500),
            "NGN",
            PaymentMetadata::Subscription {
                tier_id: GROWTH_TIER_ID,
                interval_id: MONTHLY_INTERVAL_ID,
            },
        );
        store
            .apply(ChangeSet::new().insert_payment(payment.clone()))
            .await
            .unwrap();

        // First write is fine, the duplicate reference fails the whole set.
        let sub = active_subscription(church.id, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID, dec!(9.99));
        let err = store
            .apply(
                ChangeSet::new()
                    .insert_subscription(sub)
                    .insert_payment(payment),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AlreadyExists(_)));
        assert!(store.get_subscription(church.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_payment_is_not_rewritten() {
        let store = InMemoryBillingStore::new();
        let mut payment = Payment::pending(
            Uuid::new_v4(),
            None,
            "REF-2".to_string(),
            dec!(1500),
            "NGN",
            PaymentMetadata::Subscription {
                tier_id: GROWTH_TIER_ID,
                interval_id: MONTHLY_INTERVAL_ID,
            },
        );
        store
            .apply(ChangeSet::new().insert_payment(payment.clone()))
            .await
            .unwrap();

        payment.mark_failed("declined");
        store
            .apply(ChangeSet::new().update_payment(payment.clone()))
            .await
            .unwrap();

        payment.mark_success(Some("txn".to_string()));
        let err = store
            .apply(ChangeSet::new().update_payment(payment))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
        assert_eq!(
            store.get_payment("REF-2").await.unwrap().unwrap().status,
            PaymentStatus::Failed
        );
    }
}
