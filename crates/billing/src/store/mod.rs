//! Persistence seam for the billing engine
//!
//! Reads are plain lookups. Every state change goes through a single
//! [`BillingStore::apply`] call carrying a [`ChangeSet`], which the store
//! applies atomically after checking these guards:
//!
//! - one subscription per church
//! - subscription updates must carry the version that was read
//! - at most one PENDING tier change per subscription
//! - payment references are unique
//! - COMPLETED/FAILED tier changes and terminal payments are never rewritten
//! - at most one COMPLETED pricing model migration per church
//!
//! Writing a subscription also re-syncs the renewal date of the church's
//! active storage add-ons to the subscription's next billing date.

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::catalog::{BillingInterval, IntervalName, PricingTier, TierCatalog};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    LegacyPlan, Payment, PricingModelMigration, StorageAddon, Subscription, SubscriptionFilter,
    Tenant, TenantStorageAddon, TierChangeHistory, TierChangeStatus,
};

/// Insert or update of a single record
#[derive(Debug, Clone)]
pub enum Write<T> {
    Insert(T),
    Update(T),
}

impl<T> Write<T> {
    pub fn record(&self) -> &T {
        match self {
            Write::Insert(r) | Write::Update(r) => r,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Write::Insert(_))
    }
}

/// A unit of work applied atomically by [`BillingStore::apply`]
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub subscription: Option<Write<Subscription>>,
    pub tenant: Option<Tenant>,
    pub payments: Vec<Write<Payment>>,
    pub tier_changes: Vec<Write<TierChangeHistory>>,
    pub migrations: Vec<Write<PricingModelMigration>>,
    pub addons: Vec<Write<TenantStorageAddon>>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.subscription.is_none()
            && self.tenant.is_none()
            && self.payments.is_empty()
            && self.tier_changes.is_empty()
            && self.migrations.is_empty()
            && self.addons.is_empty()
    }

    pub fn insert_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = Some(Write::Insert(subscription));
        self
    }

    /// Update a subscription. Its `version` must be the one that was read.
    pub fn update_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = Some(Write::Update(subscription));
        self
    }

    pub fn update_tenant(mut self, tenant: Tenant) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn insert_payment(mut self, payment: Payment) -> Self {
        self.payments.push(Write::Insert(payment));
        self
    }

    pub fn update_payment(mut self, payment: Payment) -> Self {
        self.payments.push(Write::Update(payment));
        self
    }

    pub fn insert_tier_change(mut self, change: TierChangeHistory) -> Self {
        self.tier_changes.push(Write::Insert(change));
        self
    }

    pub fn update_tier_change(mut self, change: TierChangeHistory) -> Self {
        self.tier_changes.push(Write::Update(change));
        self
    }

    pub fn insert_migration(mut self, migration: PricingModelMigration) -> Self {
        self.migrations.push(Write::Insert(migration));
        self
    }

    pub fn update_migration(mut self, migration: PricingModelMigration) -> Self {
        self.migrations.push(Write::Update(migration));
        self
    }

    pub fn insert_addon(mut self, addon: TenantStorageAddon) -> Self {
        self.addons.push(Write::Insert(addon));
        self
    }

    pub fn update_addon(mut self, addon: TenantStorageAddon) -> Self {
        self.addons.push(Write::Update(addon));
        self
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn list_tiers(&self) -> BillingResult<Vec<PricingTier>>;
    async fn get_tier(&self, id: Uuid) -> BillingResult<Option<PricingTier>>;
    async fn list_intervals(&self) -> BillingResult<Vec<BillingInterval>>;
    async fn get_interval(&self, id: Uuid) -> BillingResult<Option<BillingInterval>>;

    async fn get_tenant(&self, id: Uuid) -> BillingResult<Option<Tenant>>;
    async fn list_tenants(&self) -> BillingResult<Vec<Tenant>>;

    async fn get_subscription(&self, tenant_id: Uuid) -> BillingResult<Option<Subscription>>;
    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> BillingResult<Vec<Subscription>>;

    async fn get_payment(&self, reference: &str) -> BillingResult<Option<Payment>>;

    async fn get_tier_change(&self, reference: &str) -> BillingResult<Option<TierChangeHistory>>;
    /// Newest first
    async fn list_tier_changes(
        &self,
        tenant_id: Option<Uuid>,
        status: Option<TierChangeStatus>,
    ) -> BillingResult<Vec<TierChangeHistory>>;

    /// Newest first
    async fn list_migrations(
        &self,
        tenant_id: Option<Uuid>,
    ) -> BillingResult<Vec<PricingModelMigration>>;
    async fn get_legacy_plan(&self, id: Uuid) -> BillingResult<Option<LegacyPlan>>;

    async fn get_addon(&self, id: Uuid) -> BillingResult<Option<StorageAddon>>;
    async fn list_tenant_addons(
        &self,
        tenant_id: Option<Uuid>,
    ) -> BillingResult<Vec<TenantStorageAddon>>;
    async fn get_tenant_addon(&self, id: Uuid) -> BillingResult<Option<TenantStorageAddon>>;

    /// Apply `changes` atomically. Returns the subscription as written, if any.
    async fn apply(&self, changes: ChangeSet) -> BillingResult<Option<Subscription>>;

    // ---- convenience lookups ----

    async fn catalog(&self) -> BillingResult<TierCatalog> {
        Ok(TierCatalog::new(
            self.list_tiers().await?,
            self.list_intervals().await?,
        ))
    }

    async fn require_tier(&self, id: Uuid) -> BillingResult<PricingTier> {
        self.get_tier(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Pricing tier {}", id)))
    }

    async fn require_interval(&self, id: Uuid) -> BillingResult<BillingInterval> {
        self.get_interval(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Billing interval {}", id)))
    }

    async fn require_interval_by_name(&self, name: IntervalName) -> BillingResult<BillingInterval> {
        self.list_intervals()
            .await?
            .into_iter()
            .find(|i| i.name == name && i.is_active)
            .ok_or_else(|| BillingError::Configuration(format!("No active {} interval", name)))
    }

    async fn require_legacy_plan(&self, id: Uuid) -> BillingResult<LegacyPlan> {
        self.get_legacy_plan(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Legacy plan {}", id)))
    }

    async fn require_tenant(&self, id: Uuid) -> BillingResult<Tenant> {
        self.get_tenant(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Church {}", id)))
    }

    async fn require_subscription(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        self.get_subscription(tenant_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription for church {}", tenant_id)))
    }

    async fn require_payment(&self, reference: &str) -> BillingResult<Payment> {
        self.get_payment(reference)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Payment {}", reference)))
    }

    async fn require_tier_change(&self, reference: &str) -> BillingResult<TierChangeHistory> {
        self.get_tier_change(reference)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Tier change for payment {}", reference)))
    }
}
