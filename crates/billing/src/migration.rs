//! Pricing model migration
//!
//! Moves churches from the storage-based legacy plans onto congregation-size
//! tiers. Every migration writes one audit row in the same unit of work as the
//! subscription change, and a rollback amends that row instead of adding one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::IntervalName;
use crate::directory::MemberDirectory;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventType};
use crate::models::{MigrationStatus, PricingModelMigration, SubscriptionSnapshot};
use crate::money::round_money;
use crate::pricing::PricingService;
use crate::store::{BillingStore, ChangeSet};

#[derive(Debug, Clone, Serialize)]
pub struct MigrationFailure {
    pub tenant_id: Uuid,
    pub kind: &'static str,
    pub error: String,
}

/// Outcome of a bulk migration run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkMigrationReport {
    pub total: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: Vec<MigrationFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusSummary {
    pub total_tenants: usize,
    pub completed: usize,
    pub rolled_back: usize,
    pub failed: usize,
    /// Churches with no COMPLETED migration
    pub pending: usize,
    /// Mean monthly price change over COMPLETED migrations, USD
    pub average_price_delta: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReportRow {
    pub migration_id: Uuid,
    pub tenant_id: Uuid,
    pub tenant_name: Option<String>,
    pub status: MigrationStatus,
    pub old_plan_name: Option<String>,
    pub old_monthly_price: Decimal,
    pub new_tier_name: Option<String>,
    pub new_member_count: i64,
    pub new_monthly_price: Decimal,
    pub price_delta: Decimal,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct MigrationService {
    store: Arc<dyn BillingStore>,
    members: Arc<dyn MemberDirectory>,
    pricing: PricingService,
}

impl MigrationService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        members: Arc<dyn MemberDirectory>,
        pricing: PricingService,
    ) -> Self {
        Self {
            store,
            members,
            pricing,
        }
    }

    async fn is_migrated(&self, tenant_id: Uuid) -> BillingResult<bool> {
        Ok(self
            .store
            .list_migrations(Some(tenant_id))
            .await?
            .iter()
            .any(|m| m.status == MigrationStatus::Completed))
    }

    /// Move one church onto the tier matching its member count, billed monthly.
    pub async fn migrate_one(
        &self,
        tenant_id: Uuid,
        performed_by: Option<Uuid>,
    ) -> BillingResult<PricingModelMigration> {
        if self.is_migrated(tenant_id).await? {
            return Err(BillingError::InvalidState(format!(
                "Church {} is already migrated to congregation pricing",
                tenant_id
            )));
        }

        let tenant = self.store.require_tenant(tenant_id).await?;
        let subscription = self.store.require_subscription(tenant_id).await?;
        let previous = SubscriptionSnapshot::capture(&subscription, &tenant);
        let plan_id = subscription.legacy_plan_id.ok_or_else(|| {
            BillingError::InvalidState(format!(
                "Church {} is not on a legacy plan",
                tenant_id
            ))
        })?;
        let legacy_plan = self.store.require_legacy_plan(plan_id).await?;

        let member_count = self.members.count_members(tenant_id).await?;
        let tier = self.pricing.tier_for_member_count(member_count.max(1)).await?;
        let monthly = self
            .store
            .require_interval_by_name(IntervalName::Monthly)
            .await?;

        let mut assignment = self
            .pricing
            .prepare_assignment(tenant_id, tier.id, monthly.id)
            .await?;
        assignment.subscription.legacy_plan_id = None;

        let migration = PricingModelMigration {
            id: Uuid::new_v4(),
            tenant_id,
            subscription_id: Some(subscription.id),
            old_plan_id: Some(legacy_plan.id),
            old_plan_name: Some(legacy_plan.name.clone()),
            old_storage_limit_mb: Some(legacy_plan.storage_limit_mb),
            old_monthly_price: legacy_plan.monthly_price,
            previous: Some(previous),
            new_tier_id: Some(assignment.tier.id),
            new_member_count: assignment.member_count,
            new_monthly_price: assignment.tier.monthly_price,
            status: MigrationStatus::Completed,
            notes: Some(format!(
                "Migrated to {} ({} members)",
                assignment.tier.display_name, assignment.member_count
            )),
            performed_by,
            created_at: Utc::now(),
            rolled_back_at: None,
            rolled_back_by: None,
        };

        self.store
            .apply(assignment.changes().insert_migration(migration.clone()))
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %subscription.id,
            old_plan = %legacy_plan.name,
            new_tier = %assignment.tier.name,
            member_count = assignment.member_count,
            price_delta = %migration.price_delta(),
            "Migrated church to congregation pricing"
        );
        BillingEventBuilder::new(tenant_id, BillingEventType::MigrationCompleted)
            .actor_opt(performed_by)
            .data(serde_json::json!({
                "migration_id": migration.id,
                "old_plan": migration.old_plan_name,
                "new_tier": assignment.tier.name,
                "member_count": assignment.member_count,
            }))
            .emit();

        Ok(migration)
    }

    /// Migrate every church still on a legacy plan.
    ///
    /// Churches without a subscription, already on a tier, or already migrated
    /// are skipped. Each church is its own unit of work; a failure is recorded
    /// and the run moves on.
    pub async fn migrate_all(&self, performed_by: Option<Uuid>) -> BillingResult<BulkMigrationReport> {
        let tenants = self.store.list_tenants().await?;
        let migrated: HashSet<Uuid> = self
            .store
            .list_migrations(None)
            .await?
            .into_iter()
            .filter(|m| m.status == MigrationStatus::Completed)
            .map(|m| m.tenant_id)
            .collect();

        let mut report = BulkMigrationReport {
            total: tenants.len(),
            ..Default::default()
        };

        for tenant in tenants {
            if migrated.contains(&tenant.id) {
                report.skipped += 1;
                continue;
            }
            let result = match self.store.get_subscription(tenant.id).await {
                Ok(None) => {
                    tracing::debug!(tenant_id = %tenant.id, "No subscription to migrate");
                    report.skipped += 1;
                    continue;
                }
                Ok(Some(sub)) if sub.legacy_plan_id.is_none() => {
                    tracing::debug!(tenant_id = %tenant.id, "Already on congregation pricing");
                    report.skipped += 1;
                    continue;
                }
                Ok(Some(_)) => self.migrate_one(tenant.id, performed_by).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(_) => report.migrated += 1,
                Err(err) => {
                    tracing::error!(
                        tenant_id = %tenant.id,
                        kind = err.kind(),
                        error = %err,
                        "Pricing migration failed"
                    );
                    self.record_failure(tenant.id, performed_by, &err).await;
                    report.failed.push(MigrationFailure {
                        tenant_id: tenant.id,
                        kind: err.kind(),
                        error: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            total = report.total,
            migrated = report.migrated,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Bulk pricing migration finished"
        );
        Ok(report)
    }

    async fn record_failure(&self, tenant_id: Uuid, performed_by: Option<Uuid>, err: &BillingError) {
        let subscription = self.store.get_subscription(tenant_id).await.ok().flatten();
        let record = PricingModelMigration {
            id: Uuid::new_v4(),
            tenant_id,
            subscription_id: subscription.as_ref().map(|s| s.id),
            old_plan_id: subscription.as_ref().and_then(|s| s.legacy_plan_id),
            old_plan_name: None,
            old_storage_limit_mb: None,
            old_monthly_price: subscription.as_ref().map_or(Decimal::ZERO, |s| s.amount),
            previous: None,
            new_tier_id: None,
            new_member_count: 0,
            new_monthly_price: Decimal::ZERO,
            status: MigrationStatus::Failed,
            notes: Some(format!("Migration failed: {}", err)),
            performed_by,
            created_at: Utc::now(),
            rolled_back_at: None,
            rolled_back_by: None,
        };

        if let Err(write_err) = self.store.apply(ChangeSet::new().insert_migration(record)).await {
            tracing::error!(
                tenant_id = %tenant_id,
                error = %write_err,
                "Failed to record failed pricing migration"
            );
        }
        BillingEventBuilder::new(tenant_id, BillingEventType::MigrationFailed)
            .actor_opt(performed_by)
            .data(serde_json::json!({ "error": err.to_string() }))
            .emit();
    }

    /// Restore a church to the plan it had before its latest migration.
    pub async fn rollback(
        &self,
        tenant_id: Uuid,
        performed_by: Uuid,
        reason: &str,
    ) -> BillingResult<PricingModelMigration> {
        let mut migration = self
            .store
            .list_migrations(Some(tenant_id))
            .await?
            .into_iter()
            .find(|m| m.status != MigrationStatus::Failed)
            .ok_or_else(|| {
                BillingError::NotFound(format!("Pricing migration for church {}", tenant_id))
            })?;
        if migration.status != MigrationStatus::Completed {
            return Err(BillingError::InvalidState(format!(
                "Latest migration for church {} is {}, not COMPLETED",
                tenant_id, migration.status
            )));
        }
        let previous = migration.previous.clone().ok_or_else(|| {
            BillingError::InvalidState(format!(
                "Migration {} has no snapshot to restore",
                migration.id
            ))
        })?;

        let mut subscription = self.store.require_subscription(tenant_id).await?;
        if let Some(reference) = subscription.pending_reference() {
            return Err(BillingError::InvalidState(format!(
                "Cannot roll back church {} while upgrade {} is pending",
                tenant_id, reference
            )));
        }
        let mut tenant = self.store.require_tenant(tenant_id).await?;

        subscription.legacy_plan_id = previous.legacy_plan_id;
        subscription.amount = previous.amount;
        subscription.tier_id = previous.tier_id;
        subscription.interval_id = previous.interval_id;
        tenant.member_count_cache = previous.member_count_cache;
        tenant.eligible_tier_id = previous.eligible_tier_id;

        let now = Utc::now();
        let provenance = format!(
            "[ROLLED BACK {} by {}: {}]",
            now.format("%Y-%m-%dT%H:%M:%SZ"),
            performed_by,
            reason
        );
        migration.notes = Some(match migration.notes.take() {
            Some(notes) if !notes.is_empty() => format!("{} {}", notes, provenance),
            _ => provenance,
        });
        migration.status = MigrationStatus::RolledBack;
        migration.rolled_back_at = Some(now);
        migration.rolled_back_by = Some(performed_by);

        self.store
            .apply(
                ChangeSet::new()
                    .update_subscription(subscription)
                    .update_tenant(tenant)
                    .update_migration(migration.clone()),
            )
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            migration_id = %migration.id,
            rolled_back_by = %performed_by,
            "Pricing migration rolled back"
        );
        BillingEventBuilder::new(tenant_id, BillingEventType::MigrationRolledBack)
            .actor_opt(Some(performed_by))
            .data(serde_json::json!({ "migration_id": migration.id, "reason": reason }))
            .emit();

        Ok(migration)
    }

    pub async fn status(&self) -> BillingResult<MigrationStatusSummary> {
        let tenants = self.store.list_tenants().await?;
        let migrations = self.store.list_migrations(None).await?;

        let count = |status: MigrationStatus| migrations.iter().filter(|m| m.status == status).count();
        let completed: Vec<&PricingModelMigration> = migrations
            .iter()
            .filter(|m| m.status == MigrationStatus::Completed)
            .collect();
        let migrated: HashSet<Uuid> = completed.iter().map(|m| m.tenant_id).collect();

        let average_price_delta = if completed.is_empty() {
            Decimal::ZERO
        } else {
            let total: Decimal = completed.iter().map(|m| m.price_delta()).sum();
            round_money(total / Decimal::from(completed.len()))
        };

        Ok(MigrationStatusSummary {
            total_tenants: tenants.len(),
            completed: completed.len(),
            rolled_back: count(MigrationStatus::RolledBack),
            failed: count(MigrationStatus::Failed),
            pending: tenants.iter().filter(|t| !migrated.contains(&t.id)).count(),
            average_price_delta,
        })
    }

    /// Every migration record, newest first.
    pub async fn report(&self) -> BillingResult<Vec<MigrationReportRow>> {
        let names: HashMap<Uuid, String> = self
            .store
            .list_tenants()
            .await?
            .into_iter()
            .map(|t| (t.id, t.name))
            .collect();
        let catalog = self.store.catalog().await?;

        Ok(self
            .store
            .list_migrations(None)
            .await?
            .into_iter()
            .map(|m| MigrationReportRow {
                migration_id: m.id,
                tenant_id: m.tenant_id,
                tenant_name: names.get(&m.tenant_id).cloned(),
                status: m.status,
                old_plan_name: m.old_plan_name.clone(),
                old_monthly_price: m.old_monthly_price,
                new_tier_name: m
                    .new_tier_id
                    .and_then(|id| catalog.tier(id))
                    .map(|t| t.name.clone()),
                new_member_count: m.new_member_count,
                new_monthly_price: m.new_monthly_price,
                price_delta: m.price_delta(),
                notes: m.notes.clone(),
                created_at: m.created_at,
                rolled_back_at: m.rolled_back_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        ANNUAL_INTERVAL_ID, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID, STANDARD_TIER_ID,
    };
    use crate::models::{LegacyPlan, PendingUpgrade};
    use crate::testing::{legacy_subscription, TestHarness};
    use rust_decimal_macros::dec;

    async fn legacy_church(h: &TestHarness, name: &str, members: i64, plan: &LegacyPlan) -> Uuid {
        let church = h.add_church(name, members).await;
        h.store
            .seed_subscription(legacy_subscription(church.id, plan.id, plan.monthly_price))
            .await;
        church.id
    }

    async fn storage_plan(h: &TestHarness) -> LegacyPlan {
        let plan = LegacyPlan {
            id: Uuid::new_v4(),
            name: "Storage 5GB".to_string(),
            storage_limit_mb: 5120,
            monthly_price: dec!(15.00),
        };
        h.store.insert_legacy_plan(plan.clone()).await;
        plan
    }

    #[tokio::test]
    async fn test_migrate_one_moves_to_member_tier() {
        let h = TestHarness::new();
        let plan = storage_plan(&h).await;
        let church = legacy_church(&h, "Grace Chapel", 120, &plan).await;
        let admin = Uuid::new_v4();

        let migration = h
            .billing
            .migrations
            .migrate_one(church, Some(admin))
            .await
            .unwrap();
        assert_eq!(migration.status, MigrationStatus::Completed);
        assert_eq!(migration.old_plan_name.as_deref(), Some("Storage 5GB"));
        assert_eq!(migration.old_storage_limit_mb, Some(5120));
        assert_eq!(migration.new_tier_id, Some(GROWTH_TIER_ID));
        assert_eq!(migration.new_member_count, 120);
        assert_eq!(migration.price_delta(), dec!(-5.01));
        assert_eq!(migration.notes.as_deref(), Some("Migrated to Growth (120 members)"));
        assert_eq!(migration.performed_by, Some(admin));

        let sub = h.subscription(church).await.unwrap();
        assert_eq!(sub.legacy_plan_id, None);
        assert_eq!(sub.tier_id, Some(GROWTH_TIER_ID));
        assert_eq!(sub.interval_id, Some(MONTHLY_INTERVAL_ID));
        assert_eq!(sub.amount, dec!(9.99));
        let tenant = h.store.require_tenant(church).await.unwrap();
        assert_eq!(tenant.member_count_cache, 120);
        assert_eq!(tenant.eligible_tier_id, Some(GROWTH_TIER_ID));

        let err = h
            .billing
            .migrations
            .migrate_one(church, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_church_with_no_members_lands_on_free_tier() {
        let h = TestHarness::new();
        let plan = storage_plan(&h).await;
        let church = legacy_church(&h, "Empty Pews", 0, &plan).await;

        let migration = h.billing.migrations.migrate_one(church, None).await.unwrap();
        assert_eq!(migration.new_monthly_price, Decimal::ZERO);
        assert_eq!(h.subscription(church).await.unwrap().amount, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot_and_amends_record() {
        let h = TestHarness::new();
        let plan = storage_plan(&h).await;
        let church = legacy_church(&h, "Hillside", 300, &plan).await;
        let before = h.subscription(church).await.unwrap();
        h.billing.migrations.migrate_one(church, None).await.unwrap();
        assert_eq!(
            h.subscription(church).await.unwrap().tier_id,
            Some(STANDARD_TIER_ID)
        );

        let admin = Uuid::new_v4();
        let rolled_back = h
            .billing
            .migrations
            .rollback(church, admin, "board vote")
            .await
            .unwrap();
        assert_eq!(rolled_back.status, MigrationStatus::RolledBack);
        assert_eq!(rolled_back.rolled_back_by, Some(admin));
        let notes = rolled_back.notes.unwrap();
        assert!(notes.starts_with("Migrated to Standard (300 members) [ROLLED BACK "));
        assert!(notes.ends_with(&format!("by {}: board vote]", admin)));

        let sub = h.subscription(church).await.unwrap();
        assert_eq!(sub.legacy_plan_id, Some(plan.id));
        assert_eq!(sub.amount, before.amount);
        assert_eq!(sub.tier_id, None);
        assert_eq!(sub.interval_id, None);

        // one audit row per migration, amended in place
        assert_eq!(h.store.list_migrations(Some(church)).await.unwrap().len(), 1);

        let err = h
            .billing
            .migrations
            .rollback(church, admin, "again")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));

        // a rolled-back church can be migrated again
        h.billing.migrations.migrate_one(church, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_without_migration_not_found() {
        let h = TestHarness::new();
        let plan = storage_plan(&h).await;
        let church = legacy_church(&h, "Brookside", 80, &plan).await;

        let err = h
            .billing
            .migrations
            .rollback(church, Uuid::new_v4(), "oops")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_migrate_all_isolates_failures() {
        let h = TestHarness::new();
        let plan = storage_plan(&h).await;
        let ready = legacy_church(&h, "Ready", 80, &plan).await;
        let done = legacy_church(&h, "Already Done", 80, &plan).await;
        let busy = legacy_church(&h, "Mid Upgrade", 80, &plan).await;
        h.add_church("No Subscription", 30).await;

        h.billing.migrations.migrate_one(done, None).await.unwrap();
        let mut sub = h.subscription(busy).await.unwrap();
        sub.pending_upgrade = Some(PendingUpgrade {
            tier_id: GROWTH_TIER_ID,
            interval_id: MONTHLY_INTERVAL_ID,
            reference: "TU-busy".to_string(),
            initiated_at: Utc::now(),
        });
        h.store.seed_subscription(sub).await;

        let report = h.billing.migrations.migrate_all(None).await.unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.migrated, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].tenant_id, busy);
        assert_eq!(report.failed[0].kind, "invalid_state");

        assert_eq!(h.subscription(ready).await.unwrap().tier_id, Some(GROWTH_TIER_ID));
        let busy_records = h.store.list_migrations(Some(busy)).await.unwrap();
        assert_eq!(busy_records.len(), 1);
        assert_eq!(busy_records[0].status, MigrationStatus::Failed);
        assert_eq!(
            h.subscription(busy).await.unwrap().legacy_plan_id,
            Some(plan.id)
        );

        let status = h.billing.migrations.status().await.unwrap();
        assert_eq!(status.total_tenants, 4);
        assert_eq!(status.completed, 2);
        assert_eq!(status.failed, 1);
        assert_eq!(status.rolled_back, 0);
        assert_eq!(status.pending, 2);
        assert_eq!(status.average_price_delta, dec!(-5.01));

        let report = h.billing.migrations.report().await.unwrap();
        assert_eq!(report.len(), 3);
        let failed_row = report.iter().find(|r| r.tenant_id == busy).unwrap();
        assert_eq!(failed_row.tenant_name.as_deref(), Some("Mid Upgrade"));
        assert_eq!(failed_row.new_tier_name, None);
        let ready_row = report.iter().find(|r| r.tenant_id == ready).unwrap();
        assert_eq!(ready_row.new_tier_name.as_deref(), Some("growth"));
    }

    #[tokio::test]
    async fn test_migrate_all_leaves_tier_model_churches_alone() {
        let h = TestHarness::new();
        let plan = storage_plan(&h).await;
        let legacy = legacy_church(&h, "Old Plan", 120, &plan).await;
        let annual = h
            .add_active_church("Annual Payer", 120, GROWTH_TIER_ID, ANNUAL_INTERVAL_ID)
            .await
            .unwrap();
        let before = h.subscription(annual.id).await.unwrap();

        let report = h.billing.migrations.migrate_all(None).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.migrated, 1);
        assert_eq!(report.skipped, 1);
        assert!(report.failed.is_empty());

        let after = h.subscription(annual.id).await.unwrap();
        assert_eq!(after.interval_id, Some(ANNUAL_INTERVAL_ID));
        assert_eq!(after.amount, dec!(107.88));
        assert_eq!(after.next_billing_date, before.next_billing_date);
        assert_eq!(after.version, before.version);
        assert!(h.store.list_migrations(Some(annual.id)).await.unwrap().is_empty());
        assert_eq!(h.subscription(legacy).await.unwrap().tier_id, Some(GROWTH_TIER_ID));
    }

    #[tokio::test]
    async fn test_migrate_one_rejects_church_not_on_legacy_plan() {
        let h = TestHarness::new();
        let church = h
            .add_active_church("Tier Native", 120, GROWTH_TIER_ID, ANNUAL_INTERVAL_ID)
            .await
            .unwrap();

        let err = h
            .billing
            .migrations
            .migrate_one(church.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
        assert_eq!(
            h.subscription(church.id).await.unwrap().interval_id,
            Some(ANNUAL_INTERVAL_ID)
        );
        assert!(h.store.list_migrations(Some(church.id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_migrate_one_with_missing_legacy_plan_writes_nothing() {
        let h = TestHarness::new();
        let church = h.add_church("Lost Plan", 90).await;
        let missing_plan = Uuid::new_v4();
        h.store
            .seed_subscription(legacy_subscription(church.id, missing_plan, dec!(15.00)))
            .await;
        let before = h.subscription(church.id).await.unwrap();

        let err = h
            .billing
            .migrations
            .migrate_one(church.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert!(err.to_string().contains(&missing_plan.to_string()));

        let after = h.subscription(church.id).await.unwrap();
        assert_eq!(after, before);
        assert!(h.store.list_migrations(Some(church.id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_attempt_does_not_block_later_migration() {
        let h = TestHarness::new();
        let plan = storage_plan(&h).await;
        let church = legacy_church(&h, "Second Try", 80, &plan).await;
        let mut sub = h.subscription(church).await.unwrap();
        sub.pending_upgrade = Some(PendingUpgrade {
            tier_id: GROWTH_TIER_ID,
            interval_id: MONTHLY_INTERVAL_ID,
            reference: "TU-second".to_string(),
            initiated_at: Utc::now(),
        });
        h.store.seed_subscription(sub).await;

        let report = h.billing.migrations.migrate_all(None).await.unwrap();
        assert_eq!(report.failed.len(), 1);

        let mut sub = h.subscription(church).await.unwrap();
        sub.pending_upgrade = None;
        h.store.seed_subscription(sub).await;
        h.billing.migrations.migrate_one(church, None).await.unwrap();

        let records = h.store.list_migrations(Some(church)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records.iter().filter(|m| m.status == MigrationStatus::Completed).count(),
            1
        );

        let rolled_back = h
            .billing
            .migrations
            .rollback(church, Uuid::new_v4(), "undo")
            .await
            .unwrap();
        assert_eq!(rolled_back.status, MigrationStatus::RolledBack);
        assert!(rolled_back.previous.is_some());
    }
}
