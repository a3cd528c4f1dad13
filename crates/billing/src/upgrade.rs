//! Tier upgrade orchestrator
//!
//! Two-phase upgrade: a quote is confirmed, a payment is started, and the new
//! tier/interval is committed only once the provider confirms the payment.
//!
//! ```text
//! NONE -> PENDING -> COMPLETED -> NONE
//!                 \-> FAILED   -> NONE
//! ```
//!
//! The pending marker on the subscription, the PENDING history row and the
//! PENDING payment are always written together in one store apply, and are
//! always cleared together as well.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::PricingTier;
use crate::config::BillingConfig;
use crate::directory::MemberDirectory;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventType};
use crate::models::{
    Payment, PaymentMetadata, PendingUpgrade, Subscription, SubscriptionStatus,
    TierChangeHistory, TierChangeStatus,
};
use crate::proration::{ProrationEngine, ProrationResult};
use crate::provider::{InitializePayment, PaymentProvider, PaymentVerification};
use crate::store::{BillingStore, ChangeSet};

/// Parameters for starting an upgrade
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub tenant_id: Uuid,
    pub new_tier_id: Uuid,
    /// `None` keeps the current interval
    pub new_interval_id: Option<Uuid>,
    /// Address the provider sends the receipt to
    pub email: String,
    pub performed_by: Option<Uuid>,
    pub reason: Option<String>,
}

/// Result of a started upgrade
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeInitiation {
    pub reference: String,
    pub authorization_url: String,
    pub access_code: Option<String>,
    pub proration: ProrationResult,
}

/// Outcome of a stale-upgrade reconciliation sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub errors: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct TierUpgradeOrchestrator {
    store: Arc<dyn BillingStore>,
    members: Arc<dyn MemberDirectory>,
    provider: Arc<dyn PaymentProvider>,
    proration: ProrationEngine,
    config: BillingConfig,
}

impl TierUpgradeOrchestrator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        members: Arc<dyn MemberDirectory>,
        provider: Arc<dyn PaymentProvider>,
        proration: ProrationEngine,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            members,
            provider,
            proration,
            config,
        }
    }

    /// Quote an upgrade without changing anything.
    pub async fn preview(
        &self,
        tenant_id: Uuid,
        new_tier_id: Uuid,
        new_interval_id: Option<Uuid>,
    ) -> BillingResult<ProrationResult> {
        let subscription = self.store.require_subscription(tenant_id).await?;
        self.quote(&subscription, new_tier_id, new_interval_id).await
    }

    async fn quote(
        &self,
        subscription: &Subscription,
        new_tier_id: Uuid,
        new_interval_id: Option<Uuid>,
    ) -> BillingResult<ProrationResult> {
        if subscription.status != SubscriptionStatus::Active {
            return Err(BillingError::InvalidState(format!(
                "Upgrades require an ACTIVE subscription, church {} is {}",
                subscription.tenant_id, subscription.status
            )));
        }

        let new_tier = self.store.require_tier(new_tier_id).await?;
        self.ensure_tier_fits(subscription.tenant_id, &new_tier).await?;

        self.proration
            .calculate_upgrade(subscription, new_tier_id, new_interval_id)
            .await
    }

    async fn ensure_tier_fits(&self, tenant_id: Uuid, tier: &PricingTier) -> BillingResult<()> {
        let member_count = self.members.count_members(tenant_id).await?.max(1);
        if tier.max_members.is_some_and(|max| member_count > max) {
            return Err(BillingError::InvalidState(format!(
                "Tier '{}' covers {} members but church {} has {}",
                tier.name,
                tier.range_label(),
                tenant_id,
                member_count
            )));
        }
        Ok(())
    }

    /// Start an upgrade: record it as PENDING and hand the charge to the provider.
    pub async fn initiate(&self, request: UpgradeRequest) -> BillingResult<UpgradeInitiation> {
        let tenant_id = request.tenant_id;
        let subscription = self.store.require_subscription(tenant_id).await?;
        if let Some(reference) = subscription.pending_reference() {
            return Err(BillingError::InvalidState(format!(
                "Church {} already has a pending upgrade ({})",
                tenant_id, reference
            )));
        }

        let proration = self
            .quote(&subscription, request.new_tier_id, request.new_interval_id)
            .await?;
        if proration.net_charge_usd.is_zero() {
            return Err(BillingError::InvalidInput(format!(
                "Moving to '{}' {} costs nothing; downgrades are not supported",
                proration.new_tier_name, proration.new_interval_name
            )));
        }
        let (old_tier_id, old_interval_id) = (proration.old_tier_id, proration.old_interval_id);

        let reference = format!("TU-{}", Uuid::new_v4().simple());
        let now = Utc::now();

        let history = TierChangeHistory {
            id: Uuid::new_v4(),
            tenant_id,
            subscription_id: subscription.id,
            old_tier_id,
            new_tier_id: proration.new_tier_id,
            old_interval_id,
            new_interval_id: proration.new_interval_id,
            change_type: proration.change_type,
            proration: proration.clone(),
            old_next_billing_date: proration.old_next_billing_date,
            new_next_billing_date: proration.new_next_billing_date,
            payment_reference: reference.clone(),
            status: TierChangeStatus::Pending,
            reason: request.reason.clone(),
            failure_reason: None,
            performed_by: request.performed_by,
            created_at: now,
            completed_at: None,
        };
        let metadata = PaymentMetadata::TierUpgrade {
            tier_change_id: history.id,
            new_tier_id: proration.new_tier_id,
            new_interval_id: proration.new_interval_id,
            change_type: proration.change_type,
        };
        let payment = Payment::pending(
            tenant_id,
            Some(subscription.id),
            reference.clone(),
            proration.net_charge_local,
            &proration.currency,
            metadata.clone(),
        );

        let mut marked = subscription.clone();
        marked.pending_upgrade = Some(PendingUpgrade {
            tier_id: proration.new_tier_id,
            interval_id: proration.new_interval_id,
            reference: reference.clone(),
            initiated_at: now,
        });

        self.store
            .apply(
                ChangeSet::new()
                    .update_subscription(marked)
                    .insert_tier_change(history)
                    .insert_payment(payment),
            )
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %subscription.id,
            reference = %reference,
            change_type = %proration.change_type,
            from_tier = %proration.old_tier_name,
            to_tier = %proration.new_tier_name,
            net_charge = %proration.net_charge_local,
            currency = %proration.currency,
            "Tier upgrade initiated"
        );

        let session = match self
            .provider
            .initialize_payment(InitializePayment {
                amount: proration.net_charge_local,
                currency: proration.currency.clone(),
                email: request.email.clone(),
                reference: reference.clone(),
                callback_url: self.config.callback_url.clone(),
                metadata,
            })
            .await
        {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(
                    tenant_id = %tenant_id,
                    reference = %reference,
                    error = %err,
                    "Payment provider rejected upgrade payment; rolling back pending upgrade"
                );
                if let Err(cleanup_err) = self
                    .fail_pending(tenant_id, &reference, &format!("provider error: {}", err))
                    .await
                {
                    tracing::error!(
                        tenant_id = %tenant_id,
                        reference = %reference,
                        error = %cleanup_err,
                        "Failed to clear pending upgrade; reconciliation will retry"
                    );
                }
                return Err(err);
            }
        };

        BillingEventBuilder::new(tenant_id, BillingEventType::TierChangeInitiated)
            .actor_opt(request.performed_by)
            .reference(&reference)
            .data(serde_json::json!({
                "from_tier": proration.old_tier_name,
                "to_tier": proration.new_tier_name,
                "change_type": proration.change_type,
                "net_charge_local": proration.net_charge_local,
                "currency": proration.currency,
            }))
            .emit();

        Ok(UpgradeInitiation {
            reference,
            authorization_url: session.authorization_url,
            access_code: session.access_code,
            proration,
        })
    }

    /// Commit an upgrade once its payment is confirmed. Safe to call repeatedly.
    pub async fn complete(&self, reference: &str) -> BillingResult<Subscription> {
        let history = self.store.require_tier_change(reference).await?;
        match history.status {
            TierChangeStatus::Completed => {
                tracing::info!(
                    tenant_id = %history.tenant_id,
                    reference = %reference,
                    "Tier upgrade already completed"
                );
                return self.store.require_subscription(history.tenant_id).await;
            }
            TierChangeStatus::Failed => {
                return Err(BillingError::InvalidState(format!(
                    "Tier upgrade {} already failed",
                    reference
                )));
            }
            TierChangeStatus::Pending => {}
        }

        let subscription = self.store.require_subscription(history.tenant_id).await?;
        if subscription.pending_reference() != Some(reference) {
            return Err(BillingError::InvalidState(format!(
                "Church {} has no pending upgrade for {}",
                history.tenant_id, reference
            )));
        }

        let verification = self.provider.verify_payment(reference).await?;
        if !verification.success {
            let reason = verification
                .failure_reason
                .clone()
                .unwrap_or_else(|| "payment not successful".to_string());
            self.fail_pending(history.tenant_id, reference, &reason).await?;
            return Err(BillingError::PaymentVerificationFailed {
                reference: reference.to_string(),
                reason,
            });
        }

        match self.apply_verified(history, subscription, verification).await {
            Ok(subscription) => Ok(subscription),
            Err(BillingError::ConcurrentModification(msg)) => {
                // A concurrent completion may have won the race
                let latest = self.store.require_tier_change(reference).await?;
                if latest.status == TierChangeStatus::Completed {
                    self.store.require_subscription(latest.tenant_id).await
                } else {
                    Err(BillingError::ConcurrentModification(msg))
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn apply_verified(
        &self,
        mut history: TierChangeHistory,
        mut subscription: Subscription,
        verification: PaymentVerification,
    ) -> BillingResult<Subscription> {
        let reference = history.payment_reference.clone();
        let new_tier = self.store.require_tier(history.new_tier_id).await?;
        let from_tier = history.proration.old_tier_name.clone();
        let to_tier = history.proration.new_tier_name.clone();

        subscription.tier_id = Some(history.new_tier_id);
        subscription.interval_id = Some(history.new_interval_id);
        subscription.amount = new_tier.price_for(history.proration.new_interval_name);
        subscription.next_billing_date = history.new_next_billing_date;
        subscription.current_period_end = history.new_next_billing_date;
        subscription.pending_upgrade = None;
        if subscription.status == SubscriptionStatus::PastDue {
            subscription.status = SubscriptionStatus::Active;
            subscription.reset_failures();
        }
        if let Some(authorization) = verification.authorization.clone() {
            subscription.authorization = Some(authorization);
        }

        let mut payment = self.store.require_payment(&reference).await?;
        payment.mark_success(verification.provider_transaction_id.clone());
        history.mark_completed();

        let tenant_id = history.tenant_id;
        let written = self
            .store
            .apply(
                ChangeSet::new()
                    .update_subscription(subscription)
                    .update_payment(payment)
                    .update_tier_change(history),
            )
            .await?
            .ok_or_else(|| BillingError::Internal("Upgrade wrote no subscription".to_string()))?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %written.id,
            reference = %reference,
            from_tier = %from_tier,
            to_tier = %to_tier,
            next_billing_date = %written.next_billing_date,
            "Tier upgrade completed"
        );
        BillingEventBuilder::new(tenant_id, BillingEventType::TierChangeCompleted)
            .actor_type(ActorType::Provider)
            .reference(&reference)
            .data(serde_json::json!({ "from_tier": from_tier, "to_tier": to_tier }))
            .emit();

        Ok(written)
    }

    /// Mark a pending upgrade FAILED and clear the subscription's marker.
    async fn fail_pending(&self, tenant_id: Uuid, reference: &str, reason: &str) -> BillingResult<()> {
        let mut changes = ChangeSet::new();

        let subscription = self.store.require_subscription(tenant_id).await?;
        if subscription.pending_reference() == Some(reference) {
            let mut cleared = subscription;
            cleared.pending_upgrade = None;
            changes = changes.update_subscription(cleared);
        }

        if let Some(mut history) = self.store.get_tier_change(reference).await? {
            if history.status == TierChangeStatus::Pending {
                history.mark_failed(reason);
                changes = changes.update_tier_change(history);
            }
        }

        if let Some(mut payment) = self.store.get_payment(reference).await? {
            if !payment.status.is_terminal() {
                payment.mark_failed(reason);
                changes = changes.update_payment(payment);
            }
        }

        if changes.is_empty() {
            return Ok(());
        }
        self.store.apply(changes).await?;

        tracing::warn!(
            tenant_id = %tenant_id,
            reference = %reference,
            reason = %reason,
            "Tier upgrade failed"
        );
        BillingEventBuilder::new(tenant_id, BillingEventType::TierChangeFailed)
            .reference(reference)
            .data(serde_json::json!({ "reason": reason }))
            .emit();
        Ok(())
    }

    /// Abandon the church's pending upgrade, if any.
    pub async fn cancel(
        &self,
        tenant_id: Uuid,
        reason: Option<&str>,
    ) -> BillingResult<Option<TierChangeHistory>> {
        let subscription = self.store.require_subscription(tenant_id).await?;
        let Some(reference) = subscription.pending_reference().map(str::to_string) else {
            tracing::warn!(
                anomaly = "cancel_without_pending_upgrade",
                tenant_id = %tenant_id,
                "No pending upgrade to cancel"
            );
            return Ok(None);
        };

        self.fail_pending(tenant_id, &reference, reason.unwrap_or("canceled"))
            .await?;
        self.store.get_tier_change(&reference).await
    }

    /// Resolve upgrades left PENDING longer than `timeout`.
    ///
    /// Paid upgrades are completed; declined or unverifiable ones are failed.
    /// Transient provider errors leave the upgrade for the next sweep.
    pub async fn reconcile_stale_pending_upgrades(
        &self,
        timeout: chrono::Duration,
    ) -> BillingResult<ReconcileReport> {
        let cutoff: DateTime<Utc> = Utc::now() - timeout;
        let pending = self
            .store
            .list_subscriptions(&crate::models::SubscriptionFilter {
                has_pending_upgrade: Some(true),
                ..Default::default()
            })
            .await?;

        let mut report = ReconcileReport::default();
        for subscription in pending {
            let Some(marker) = subscription.pending_upgrade.clone() else {
                continue;
            };
            if marker.initiated_at > cutoff {
                continue;
            }
            report.checked += 1;
            let reference = marker.reference;

            let outcome = match self.provider.verify_payment(&reference).await {
                Ok(v) if v.success => self.complete(&reference).await.map(|_| true),
                Ok(v) => {
                    let reason = v
                        .failure_reason
                        .unwrap_or_else(|| "payment not completed before timeout".to_string());
                    self.fail_pending(subscription.tenant_id, &reference, &reason)
                        .await
                        .map(|_| false)
                }
                Err(err) if err.is_retryable() => Err(err),
                Err(err) => self
                    .fail_pending(
                        subscription.tenant_id,
                        &reference,
                        &format!("stale upgrade could not be verified: {}", err),
                    )
                    .await
                    .map(|_| false),
            };

            match outcome {
                Ok(true) => report.completed.push(reference),
                Ok(false) => report.failed.push(reference),
                Err(err) => {
                    tracing::error!(
                        tenant_id = %subscription.tenant_id,
                        reference = %reference,
                        kind = err.kind(),
                        error = %err,
                        "Failed to reconcile stale upgrade"
                    );
                    report.errors.push((reference, err.to_string()));
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            completed = report.completed.len(),
            failed = report.failed.len(),
            errors = report.errors.len(),
            "Stale upgrade reconciliation finished"
        );
        Ok(report)
    }

    /// Every upgrade attempt for a church, newest first.
    pub async fn history_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Vec<TierChangeHistory>> {
        self.store.list_tier_changes(Some(tenant_id), None).await
    }
}
