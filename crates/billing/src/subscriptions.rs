//! Subscription management
//!
//! Owns the subscription lifecycle: trial, activation after a verified
//! payment, cancellation and reactivation, promotional credits, and the
//! scheduled renewal, suspension, and charge-retry sweeps.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::IntervalName;
use crate::config::BillingConfig;
use crate::directory::MemberDirectory;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventType};
use crate::models::{
    add_months, AddonStatus, Payment, PaymentMetadata, PaymentStatus, Subscription,
    SubscriptionFilter, SubscriptionStatus,
};
use crate::money::CurrencyConverter;
use crate::provider::{ChargeAuthorization, InitializePayment, PaymentProvider};
use crate::store::{BillingStore, ChangeSet};

/// A row a sweep could not process
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub kind: &'static str,
    pub error: String,
}

impl SweepFailure {
    fn new(subscription: &Subscription, err: &BillingError) -> Self {
        Self {
            tenant_id: subscription.tenant_id,
            subscription_id: subscription.id,
            kind: err.kind(),
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RenewalReport {
    pub due: usize,
    pub renewed_with_credit: usize,
    pub renewed_free: usize,
    pub marked_past_due: usize,
    pub skipped_pending_upgrade: usize,
    pub failures: Vec<SweepFailure>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SuspensionReport {
    pub past_due: usize,
    pub suspended: usize,
    pub skipped_pending_upgrade: usize,
    pub failures: Vec<SweepFailure>,
}

/// Result of one recurring charge attempt
#[derive(Debug, Clone, Serialize)]
pub struct RetryOutcome {
    pub tenant_id: Uuid,
    pub reference: String,
    pub succeeded: bool,
    pub failed_payment_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub declined: usize,
    pub failures: Vec<SweepFailure>,
}

/// Promotional credit balance and where it came from
#[derive(Debug, Clone, Serialize)]
pub struct CreditStatus {
    pub tenant_id: Uuid,
    pub free_months_remaining: i32,
    pub note: Option<String>,
    pub granted_by: Option<Uuid>,
    pub granted_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
}

impl From<&Subscription> for CreditStatus {
    fn from(sub: &Subscription) -> Self {
        Self {
            tenant_id: sub.tenant_id,
            free_months_remaining: sub.free_months_remaining,
            note: sub.credit_note.clone(),
            granted_by: sub.credit_granted_by,
            granted_at: sub.credit_granted_at,
            revoked_reason: sub.credit_revoked_reason.clone(),
        }
    }
}

/// Handle for a started subscription payment
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionPayment {
    pub reference: String,
    pub authorization_url: String,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenewalAction {
    CreditConsumed,
    RenewedFree,
    MarkedPastDue,
}

/// Service for subscription lifecycle operations
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    members: Arc<dyn MemberDirectory>,
    provider: Arc<dyn PaymentProvider>,
    converter: Arc<dyn CurrencyConverter>,
    config: BillingConfig,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        members: Arc<dyn MemberDirectory>,
        provider: Arc<dyn PaymentProvider>,
        converter: Arc<dyn CurrencyConverter>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            members,
            provider,
            converter,
            config,
        }
    }

    pub async fn get_subscription(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        self.store.require_subscription(tenant_id).await
    }

    async fn interval_months(&self, subscription: &Subscription) -> BillingResult<u32> {
        match subscription.interval_id {
            Some(id) => Ok(self.store.require_interval(id).await?.months_u32()),
            None => Ok(1),
        }
    }

    async fn write(&self, changes: ChangeSet) -> BillingResult<Subscription> {
        self.store
            .apply(changes)
            .await?
            .ok_or_else(|| BillingError::Internal("Change set wrote no subscription".to_string()))
    }

    fn reject_pending_upgrade(subscription: &Subscription, action: &str) -> BillingResult<()> {
        match subscription.pending_reference() {
            Some(reference) => Err(BillingError::InvalidState(format!(
                "Cannot {} while upgrade {} is pending for church {}",
                action, reference, subscription.tenant_id
            ))),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start a church on the free tier in trial. One subscription per church.
    pub async fn create_initial_subscription(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        self.store.require_tenant(tenant_id).await?;
        if self.store.get_subscription(tenant_id).await?.is_some() {
            return Err(BillingError::AlreadyExists(format!(
                "Subscription for church {}",
                tenant_id
            )));
        }

        let catalog = self.store.catalog().await?;
        let free_tier = catalog.free_tier()?;
        let monthly = catalog
            .interval_by_name(IntervalName::Monthly)
            .ok_or_else(|| BillingError::Configuration("No active MONTHLY interval".to_string()))?;

        let today = Utc::now().date_naive();
        let trial_end = today + chrono::Duration::days(self.config.trial_days);
        let mut subscription = Subscription::new(
            tenant_id,
            SubscriptionStatus::Trialing,
            today,
            trial_end,
            self.config.grace_period_days,
        );
        subscription.tier_id = Some(free_tier.id);
        subscription.interval_id = Some(monthly.id);
        subscription.trial_ends_at = Some(trial_end);

        let written = self
            .write(ChangeSet::new().insert_subscription(subscription))
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %written.id,
            trial_ends_at = %trial_end,
            "Created trial subscription"
        );
        BillingEventBuilder::new(tenant_id, BillingEventType::SubscriptionCreated)
            .data(serde_json::json!({ "tier": free_tier.name, "trial_ends_at": trial_end }))
            .emit();

        Ok(written)
    }

    /// Start a payment for a tier and interval. Activation happens in
    /// [`verify_and_activate`](Self::verify_and_activate).
    pub async fn initiate_payment(
        &self,
        tenant_id: Uuid,
        tier_id: Uuid,
        interval_id: Uuid,
        email: &str,
    ) -> BillingResult<SubscriptionPayment> {
        let subscription = self.store.require_subscription(tenant_id).await?;
        Self::reject_pending_upgrade(&subscription, "start a subscription payment")?;

        let tier = self.store.require_tier(tier_id).await?;
        let interval = self.store.require_interval(interval_id).await?;
        if !tier.is_active || !interval.is_active {
            return Err(BillingError::InvalidInput(format!(
                "Tier '{}' at {} is not available",
                tier.name, interval.name
            )));
        }
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

        let price_usd = tier.price_for(interval.name);
        if price_usd.is_zero() {
            return Err(BillingError::InvalidInput(format!(
                "Tier '{}' is free and needs no payment",
                tier.name
            )));
        }
        let amount = self.converter.usd_to_local(price_usd);
        let currency = self.converter.payment_currency().to_string();
        let reference = format!("SUB-{}", Uuid::new_v4().simple());
        let metadata = PaymentMetadata::Subscription {
            tier_id,
            interval_id,
        };

        let payment = Payment::pending(
            tenant_id,
            Some(subscription.id),
            reference.clone(),
            amount,
            &currency,
            metadata.clone(),
        );
        self.store
            .apply(ChangeSet::new().insert_payment(payment.clone()))
            .await?;

        let session = self
            .provider
            .initialize_payment(InitializePayment {
                amount,
                currency: currency.clone(),
                email: email.to_string(),
                reference: reference.clone(),
                callback_url: self.config.callback_url.clone(),
                metadata,
            })
            .await;

        match session {
            Ok(session) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    reference = %reference,
                    tier = %tier.name,
                    interval = %interval.name,
                    amount = %amount,
                    currency = %currency,
                    "Subscription payment initiated"
                );
                Ok(SubscriptionPayment {
                    reference,
                    authorization_url: session.authorization_url,
                    amount,
                    currency,
                })
            }
            Err(err) => {
                let mut failed = payment;
                failed.mark_failed(format!("provider error: {}", err));
                if let Err(cleanup_err) = self.store.apply(ChangeSet::new().update_payment(failed)).await {
                    tracing::error!(
                        reference = %reference,
                        error = %cleanup_err,
                        "Failed to mark payment FAILED after provider error"
                    );
                }
                Err(err)
            }
        }
    }

    /// Activate a subscription once the provider confirms its payment.
    ///
    /// A declined payment is marked FAILED and the subscription is left alone.
    pub async fn verify_and_activate(&self, reference: &str) -> BillingResult<Subscription> {
        let mut payment = self.store.require_payment(reference).await?;
        let PaymentMetadata::Subscription {
            tier_id,
            interval_id,
        } = payment.metadata
        else {
            return Err(BillingError::InvalidInput(format!(
                "Payment {} is a {} payment, not a subscription payment",
                reference,
                payment.payment_type()
            )));
        };

        match payment.status {
            PaymentStatus::Success => {
                tracing::info!(reference = %reference, "Subscription payment already verified");
                return self.store.require_subscription(payment.tenant_id).await;
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
                "Subscription payment failed verification"
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

        let mut subscription = self.store.require_subscription(payment.tenant_id).await?;
        Self::reject_pending_upgrade(&subscription, "activate a subscription payment")?;
        let tier = self.store.require_tier(tier_id).await?;
        let interval = self.store.require_interval(interval_id).await?;

        let today = Utc::now().date_naive();
        let period_end = add_months(today, interval.months_u32())?;
        let was_suspended = subscription.status == SubscriptionStatus::Suspended;

        subscription.tier_id = Some(tier.id);
        subscription.interval_id = Some(interval.id);
        subscription.amount = tier.price_for(interval.name);
        subscription.status = SubscriptionStatus::Active;
        subscription.current_period_start = today;
        subscription.current_period_end = period_end;
        subscription.next_billing_date = period_end;
        subscription.auto_renew = true;
        subscription.canceled_at = None;
        subscription.cancel_reason = None;
        subscription.reset_failures();
        if let Some(authorization) = verification.authorization {
            subscription.authorization = Some(authorization);
        }

        payment.mark_success(verification.provider_transaction_id);
        let mut changes = ChangeSet::new()
            .update_subscription(subscription)
            .update_payment(payment.clone());

        if was_suspended {
            for mut addon in self.store.list_tenant_addons(Some(payment.tenant_id)).await? {
                if addon.status == AddonStatus::Suspended {
                    addon.status = AddonStatus::Active;
                    changes = changes.update_addon(addon);
                }
            }
        }

        let written = self.write(changes).await?;

        tracing::info!(
            tenant_id = %written.tenant_id,
            subscription_id = %written.id,
            reference = %reference,
            tier = %tier.name,
            interval = %interval.name,
            next_billing_date = %written.next_billing_date,
            "Subscription activated"
        );
        BillingEventBuilder::new(written.tenant_id, BillingEventType::PaymentVerified)
            .actor_type(ActorType::Provider)
            .reference(reference)
            .data(serde_json::json!({ "tier": tier.name, "interval": interval.name }))
            .emit();

        Ok(written)
    }

    /// Cancel at period end. Access continues until `current_period_end`.
    pub async fn cancel(
        &self,
        tenant_id: Uuid,
        performed_by: Option<Uuid>,
        reason: Option<&str>,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.store.require_subscription(tenant_id).await?;
        if subscription.status == SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidState(format!(
                "Subscription for church {} is already canceled",
                tenant_id
            )));
        }
        Self::reject_pending_upgrade(&subscription, "cancel")?;

        subscription.status = SubscriptionStatus::Canceled;
        subscription.auto_renew = false;
        subscription.canceled_at = Some(Utc::now());
        subscription.cancel_reason = reason.map(str::to_string);
        subscription.next_retry_at = None;

        let written = self
            .write(ChangeSet::new().update_subscription(subscription))
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %written.id,
            access_until = %written.current_period_end,
            "Subscription canceled"
        );
        BillingEventBuilder::new(tenant_id, BillingEventType::SubscriptionCanceled)
            .actor_opt(performed_by)
            .data(serde_json::json!({ "reason": reason, "access_until": written.current_period_end }))
            .emit();

        Ok(written)
    }

    /// Undo a cancellation. Only legal from CANCELED.
    pub async fn reactivate(
        &self,
        tenant_id: Uuid,
        performed_by: Option<Uuid>,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.store.require_subscription(tenant_id).await?;
        if subscription.status != SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidState(format!(
                "Only canceled subscriptions can be reactivated; church {} is {}",
                tenant_id, subscription.status
            )));
        }

        let today = Utc::now().date_naive();
        subscription.status = if today <= subscription.current_period_end {
            SubscriptionStatus::Active
        } else {
            SubscriptionStatus::PastDue
        };
        subscription.auto_renew = true;
        subscription.canceled_at = None;
        subscription.cancel_reason = None;

        let written = self
            .write(ChangeSet::new().update_subscription(subscription))
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %written.id,
            status = %written.status,
            "Subscription reactivated"
        );
        BillingEventBuilder::new(tenant_id, BillingEventType::SubscriptionReactivated)
            .actor_opt(performed_by)
            .data(serde_json::json!({ "status": written.status }))
            .emit();

        Ok(written)
    }

    /// Move a church to the free tier, monthly, with no charge.
    pub async fn downgrade_to_free(
        &self,
        tenant_id: Uuid,
        performed_by: Option<Uuid>,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.store.require_subscription(tenant_id).await?;
        Self::reject_pending_upgrade(&subscription, "downgrade")?;

        let catalog = self.store.catalog().await?;
        let free_tier = catalog.free_tier()?;
        let monthly = catalog
            .interval_by_name(IntervalName::Monthly)
            .ok_or_else(|| BillingError::Configuration("No active MONTHLY interval".to_string()))?;

        let member_count = self.members.count_members(tenant_id).await?;
        if !free_tier.contains(member_count.max(1)) {
            tracing::warn!(
                tenant_id = %tenant_id,
                member_count = member_count,
                free_tier_range = %free_tier.range_label(),
                "Downgrading church larger than the free tier"
            );
        }

        let from_tier_id = subscription.tier_id;
        let today = Utc::now().date_naive();
        subscription.tier_id = Some(free_tier.id);
        subscription.interval_id = Some(monthly.id);
        subscription.amount = Decimal::ZERO;
        subscription.status = SubscriptionStatus::Active;
        subscription.auto_renew = true;
        subscription.canceled_at = None;
        subscription.cancel_reason = None;
        subscription.reset_failures();
        if subscription.next_billing_date < today {
            subscription.current_period_start = today;
            subscription.next_billing_date = add_months(today, 1)?;
            subscription.current_period_end = subscription.next_billing_date;
        }

        let written = self
            .write(ChangeSet::new().update_subscription(subscription))
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %written.id,
            "Subscription downgraded to free tier"
        );
        BillingEventBuilder::new(tenant_id, BillingEventType::SubscriptionDowngraded)
            .actor_opt(performed_by)
            .data(serde_json::json!({ "from_tier_id": from_tier_id, "to_tier": free_tier.name }))
            .emit();

        Ok(written)
    }

    // =========================================================================
    // Promotional credits
    // =========================================================================

    pub async fn grant_credit(
        &self,
        tenant_id: Uuid,
        months: i32,
        note: &str,
        granted_by: Uuid,
    ) -> BillingResult<CreditStatus> {
        if months <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "Credit must be at least one month, got {}",
                months
            )));
        }

        let mut subscription = self.store.require_subscription(tenant_id).await?;
        subscription.free_months_remaining = subscription
            .free_months_remaining
            .checked_add(months)
            .ok_or_else(|| BillingError::InvalidInput("Credit balance overflow".to_string()))?;
        subscription.credit_note = Some(note.to_string());
        subscription.credit_granted_by = Some(granted_by);
        subscription.credit_granted_at = Some(Utc::now());
        subscription.credit_revoked_reason = None;

        let written = self
            .write(ChangeSet::new().update_subscription(subscription))
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            months = months,
            balance = written.free_months_remaining,
            granted_by = %granted_by,
            "Promotional credit granted"
        );
        BillingEventBuilder::new(tenant_id, BillingEventType::CreditGranted)
            .actor_opt(Some(granted_by))
            .actor_type(ActorType::Admin)
            .data(serde_json::json!({ "months": months, "note": note }))
            .emit();

        Ok(CreditStatus::from(&written))
    }

    pub async fn revoke_credit(
        &self,
        tenant_id: Uuid,
        reason: &str,
        revoked_by: Uuid,
    ) -> BillingResult<CreditStatus> {
        let mut subscription = self.store.require_subscription(tenant_id).await?;
        let forfeited = subscription.free_months_remaining;
        subscription.free_months_remaining = 0;
        subscription.credit_revoked_reason = Some(reason.to_string());

        let written = self
            .write(ChangeSet::new().update_subscription(subscription))
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            forfeited_months = forfeited,
            revoked_by = %revoked_by,
            "Promotional credit revoked"
        );
        BillingEventBuilder::new(tenant_id, BillingEventType::CreditRevoked)
            .actor_opt(Some(revoked_by))
            .actor_type(ActorType::Admin)
            .data(serde_json::json!({ "forfeited_months": forfeited, "reason": reason }))
            .emit();

        Ok(CreditStatus::from(&written))
    }

    pub async fn credit_status(&self, tenant_id: Uuid) -> BillingResult<CreditStatus> {
        let subscription = self.store.require_subscription(tenant_id).await?;
        Ok(CreditStatus::from(&subscription))
    }

    // =========================================================================
    // Scheduled sweeps
    // =========================================================================

    pub async fn process_renewals(&self) -> BillingResult<RenewalReport> {
        self.process_renewals_on(Utc::now().date_naive()).await
    }

    /// Renew every auto-renewing subscription due within a day of `today`.
    ///
    /// Credits are consumed before anything is billed. Paid renewals are only
    /// flagged PAST_DUE here; the charge itself goes through the retry sweep.
    pub async fn process_renewals_on(&self, today: NaiveDate) -> BillingResult<RenewalReport> {
        let due = self
            .store
            .list_subscriptions(&SubscriptionFilter {
                statuses: vec![SubscriptionStatus::Active, SubscriptionStatus::Trialing],
                next_billing_on_or_before: Some(today + chrono::Duration::days(1)),
                auto_renew: Some(true),
                ..Default::default()
            })
            .await?;

        let mut report = RenewalReport {
            due: due.len(),
            ..Default::default()
        };

        for subscription in due {
            if subscription.has_pending_upgrade() {
                tracing::info!(
                    tenant_id = %subscription.tenant_id,
                    reference = subscription.pending_reference().unwrap_or_default(),
                    "Skipping renewal while upgrade is pending"
                );
                report.skipped_pending_upgrade += 1;
                continue;
            }

            match self.renew_one(subscription.clone()).await {
                Ok(RenewalAction::CreditConsumed) => report.renewed_with_credit += 1,
                Ok(RenewalAction::RenewedFree) => report.renewed_free += 1,
                Ok(RenewalAction::MarkedPastDue) => report.marked_past_due += 1,
                Err(err) => {
                    tracing::error!(
                        tenant_id = %subscription.tenant_id,
                        subscription_id = %subscription.id,
                        kind = err.kind(),
                        error = %err,
                        "Failed to process renewal"
                    );
                    report.failures.push(SweepFailure::new(&subscription, &err));
                }
            }
        }

        tracing::info!(
            due = report.due,
            renewed_with_credit = report.renewed_with_credit,
            renewed_free = report.renewed_free,
            marked_past_due = report.marked_past_due,
            skipped_pending_upgrade = report.skipped_pending_upgrade,
            failed = report.failures.len(),
            "Renewal sweep finished"
        );
        Ok(report)
    }

    async fn renew_one(&self, mut subscription: Subscription) -> BillingResult<RenewalAction> {
        let tenant_id = subscription.tenant_id;

        let action = if subscription.free_months_remaining > 0 {
            subscription.free_months_remaining -= 1;
            subscription.advance_period(1)?;
            subscription.status = SubscriptionStatus::Active;
            subscription.reset_failures();
            RenewalAction::CreditConsumed
        } else if subscription.amount.is_zero() {
            let months = self.interval_months(&subscription).await?;
            subscription.advance_period(months)?;
            subscription.status = SubscriptionStatus::Active;
            RenewalAction::RenewedFree
        } else {
            subscription.status = SubscriptionStatus::PastDue;
            subscription.failed_payment_attempts += 1;
            subscription.next_retry_at = match subscription.authorization {
                Some(_) => self
                    .config
                    .retry
                    .chrono_delay_for(subscription.failed_payment_attempts.max(1) as u32)
                    .map(|delay| Utc::now() + delay),
                None => None,
            };
            RenewalAction::MarkedPastDue
        };

        let written = self
            .write(ChangeSet::new().update_subscription(subscription))
            .await?;

        match action {
            RenewalAction::CreditConsumed => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    subscription_id = %written.id,
                    remaining = written.free_months_remaining,
                    next_billing_date = %written.next_billing_date,
                    "Renewed with promotional credit"
                );
                BillingEventBuilder::new(tenant_id, BillingEventType::CreditConsumed)
                    .data(serde_json::json!({ "remaining": written.free_months_remaining }))
                    .emit();
            }
            RenewalAction::RenewedFree => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    subscription_id = %written.id,
                    next_billing_date = %written.next_billing_date,
                    "Renewed free subscription"
                );
                BillingEventBuilder::new(tenant_id, BillingEventType::Renewed).emit();
            }
            RenewalAction::MarkedPastDue => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    subscription_id = %written.id,
                    failed_payment_attempts = written.failed_payment_attempts,
                    next_retry_at = ?written.next_retry_at,
                    "Subscription marked past due"
                );
                BillingEventBuilder::new(tenant_id, BillingEventType::MarkedPastDue)
                    .data(serde_json::json!({ "amount_usd": written.amount }))
                    .emit();
            }
        }

        Ok(action)
    }

    pub async fn suspend_past_due(&self) -> BillingResult<SuspensionReport> {
        self.suspend_past_due_on(Utc::now().date_naive()).await
    }

    /// Suspend PAST_DUE subscriptions whose billing date is older than their grace period.
    pub async fn suspend_past_due_on(&self, today: NaiveDate) -> BillingResult<SuspensionReport> {
        let past_due = self
            .store
            .list_subscriptions(&SubscriptionFilter {
                statuses: vec![SubscriptionStatus::PastDue],
                next_billing_on_or_before: Some(today),
                ..Default::default()
            })
            .await?;

        let mut report = SuspensionReport::default();
        for subscription in past_due {
            let overdue_days = (today - subscription.next_billing_date).num_days();
            if overdue_days <= i64::from(subscription.grace_period_days) {
                continue;
            }
            report.past_due += 1;
            if subscription.has_pending_upgrade() {
                report.skipped_pending_upgrade += 1;
                continue;
            }

            match self.suspend_one(subscription.clone(), overdue_days).await {
                Ok(()) => report.suspended += 1,
                Err(err) => {
                    tracing::error!(
                        tenant_id = %subscription.tenant_id,
                        subscription_id = %subscription.id,
                        kind = err.kind(),
                        error = %err,
                        "Failed to suspend subscription"
                    );
                    report.failures.push(SweepFailure::new(&subscription, &err));
                }
            }
        }

        tracing::info!(
            past_due = report.past_due,
            suspended = report.suspended,
            skipped_pending_upgrade = report.skipped_pending_upgrade,
            failed = report.failures.len(),
            "Suspension sweep finished"
        );
        Ok(report)
    }

    async fn suspend_one(&self, mut subscription: Subscription, overdue_days: i64) -> BillingResult<()> {
        let tenant_id = subscription.tenant_id;
        subscription.status = SubscriptionStatus::Suspended;
        subscription.next_retry_at = None;

        let mut changes = ChangeSet::new().update_subscription(subscription);
        for mut addon in self.store.list_tenant_addons(Some(tenant_id)).await? {
            if addon.status == AddonStatus::Active {
                addon.status = AddonStatus::Suspended;
                changes = changes.update_addon(addon);
            }
        }
        let written = self.write(changes).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %written.id,
            overdue_days = overdue_days,
            "Subscription suspended"
        );
        BillingEventBuilder::new(tenant_id, BillingEventType::Suspended)
            .data(serde_json::json!({ "overdue_days": overdue_days }))
            .emit();
        Ok(())
    }

    // =========================================================================
    // Recurring charge retries
    // =========================================================================

    /// Charge a PAST_DUE subscription's stored card for the overdue period.
    pub async fn retry_recurring_charge(&self, tenant_id: Uuid) -> BillingResult<RetryOutcome> {
        if !self.provider.is_configured() {
            return Err(BillingError::Configuration(
                "No payment provider configured for recurring charges".to_string(),
            ));
        }

        let subscription = self.store.require_subscription(tenant_id).await?;
        if subscription.status != SubscriptionStatus::PastDue {
            return Err(BillingError::InvalidState(format!(
                "Only PAST_DUE subscriptions are retried; church {} is {}",
                tenant_id, subscription.status
            )));
        }
        Self::reject_pending_upgrade(&subscription, "retry a recurring charge")?;
        let authorization = subscription.authorization.clone().ok_or_else(|| {
            BillingError::InvalidState(format!("Church {} has no stored card", tenant_id))
        })?;
        let max_attempts = i32::try_from(self.config.retry.max_attempts).unwrap_or(i32::MAX);
        if subscription.failed_payment_attempts > max_attempts {
            return Err(BillingError::InvalidState(format!(
                "Church {} reached the retry ceiling of {} attempts",
                tenant_id, max_attempts
            )));
        }
        if subscription.amount.is_zero() {
            return Err(BillingError::InvalidState(format!(
                "Church {} owes nothing",
                tenant_id
            )));
        }

        let tenant = self.store.require_tenant(tenant_id).await?;
        let months = self.interval_months(&subscription).await?;
        let amount = self.converter.usd_to_local(subscription.amount);
        let currency = self.converter.payment_currency().to_string();
        let reference = format!("RC-{}", Uuid::new_v4().simple());

        let mut payment = Payment::pending(
            tenant_id,
            Some(subscription.id),
            reference.clone(),
            amount,
            &currency,
            PaymentMetadata::RecurringCharge {
                period_start: subscription.next_billing_date,
                attempt: subscription.failed_payment_attempts,
            },
        );
        self.store
            .apply(ChangeSet::new().insert_payment(payment.clone()))
            .await?;

        let result = self
            .provider
            .charge_authorization(ChargeAuthorization {
                authorization_code: authorization.authorization_code.clone(),
                amount,
                currency,
                email: tenant.email.clone(),
                reference: reference.clone(),
            })
            .await;

        let (succeeded, failure_reason) = match result {
            Ok(v) if v.success => {
                payment.mark_success(v.provider_transaction_id);
                (true, None)
            }
            Ok(v) => (
                false,
                Some(v.failure_reason.unwrap_or_else(|| "charge declined".to_string())),
            ),
            Err(err) => (false, Some(format!("provider error: {}", err))),
        };

        let mut updated = subscription;
        if succeeded {
            updated.status = SubscriptionStatus::Active;
            updated.advance_period(months)?;
            updated.reset_failures();
        } else {
            let reason = failure_reason.clone().unwrap_or_default();
            payment.mark_failed(reason);
            updated.failed_payment_attempts += 1;
            updated.next_retry_at = self
                .config
                .retry
                .chrono_delay_for(updated.failed_payment_attempts.max(1) as u32)
                .map(|delay| Utc::now() + delay);
        }

        let written = self
            .write(
                ChangeSet::new()
                    .update_subscription(updated)
                    .update_payment(payment),
            )
            .await?;

        if succeeded {
            tracing::info!(
                tenant_id = %tenant_id,
                reference = %reference,
                next_billing_date = %written.next_billing_date,
                "Recurring charge succeeded"
            );
            BillingEventBuilder::new(tenant_id, BillingEventType::PaymentVerified)
                .reference(&reference)
                .emit();
        } else {
            tracing::warn!(
                tenant_id = %tenant_id,
                reference = %reference,
                failed_payment_attempts = written.failed_payment_attempts,
                next_retry_at = ?written.next_retry_at,
                reason = failure_reason.as_deref().unwrap_or_default(),
                "Recurring charge failed"
            );
            BillingEventBuilder::new(tenant_id, BillingEventType::PaymentFailed)
                .reference(&reference)
                .data(serde_json::json!({ "reason": failure_reason }))
                .emit();
        }

        Ok(RetryOutcome {
            tenant_id,
            reference,
            succeeded,
            failed_payment_attempts: written.failed_payment_attempts,
            next_retry_at: written.next_retry_at,
            failure_reason,
        })
    }

    /// Retry every PAST_DUE subscription whose next retry time has passed.
    pub async fn retry_due_charges(&self) -> BillingResult<RetryReport> {
        if !self.provider.is_configured() {
            return Err(BillingError::Configuration(
                "No payment provider configured for recurring charges".to_string(),
            ));
        }

        let due = self
            .store
            .list_subscriptions(&SubscriptionFilter {
                statuses: vec![SubscriptionStatus::PastDue],
                retry_due_at_or_before: Some(Utc::now()),
                has_pending_upgrade: Some(false),
                ..Default::default()
            })
            .await?;

        let mut report = RetryReport::default();
        for subscription in due {
            report.attempted += 1;
            match self.retry_recurring_charge(subscription.tenant_id).await {
                Ok(outcome) if outcome.succeeded => report.succeeded += 1,
                Ok(_) => report.declined += 1,
                Err(err) => {
                    tracing::error!(
                        tenant_id = %subscription.tenant_id,
                        subscription_id = %subscription.id,
                        kind = err.kind(),
                        error = %err,
                        "Failed to retry recurring charge"
                    );
                    report.failures.push(SweepFailure::new(&subscription, &err));
                }
            }
        }

        tracing::info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            declined = report.declined,
            failed = report.failures.len(),
            "Recurring charge retry sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        FREE_TIER_ID, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID, QUARTERLY_INTERVAL_ID,
    };
    use crate::models::TenantStorageAddon;
    use crate::testing::{MockPaymentProvider, TestHarness, TEST_AUTHORIZATION_CODE};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn suspended_addon(tenant_id: Uuid, subscription: &Subscription) -> TenantStorageAddon {
        TenantStorageAddon {
            id: Uuid::new_v4(),
            tenant_id,
            subscription_id: subscription.id,
            addon_id: Uuid::new_v4(),
            status: AddonStatus::Suspended,
            purchase_reference: "SA-seeded".to_string(),
            prorated_amount: dec!(2.50),
            renewal_date: subscription.next_billing_date,
            activated_at: Utc::now(),
            canceled_at: None,
        }
    }

    #[tokio::test]
    async fn test_initial_subscription_is_free_trial() {
        let h = TestHarness::new();
        let church = h.add_church("Cornerstone", 12).await;

        let sub = h
            .billing
            .subscriptions
            .create_initial_subscription(church.id)
            .await
            .unwrap();
        let today = Utc::now().date_naive();
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert_eq!(sub.tier_id, Some(FREE_TIER_ID));
        assert_eq!(sub.interval_id, Some(MONTHLY_INTERVAL_ID));
        assert_eq!(sub.trial_ends_at, Some(today + Duration::days(30)));
        assert_eq!(sub.next_billing_date, today + Duration::days(30));
        assert_eq!(sub.amount, Decimal::ZERO);

        let err = h
            .billing
            .subscriptions
            .create_initial_subscription(church.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_pay_and_activate_quarterly() {
        let h = TestHarness::new();
        let church = h.add_church("St. Mark", 120).await;
        h.billing
            .subscriptions
            .create_initial_subscription(church.id)
            .await
            .unwrap();

        let payment = h
            .billing
            .subscriptions
            .initiate_payment(church.id, GROWTH_TIER_ID, QUARTERLY_INTERVAL_ID, &church.email)
            .await
            .unwrap();
        assert!(payment.reference.starts_with("SUB-"));
        assert_eq!(payment.amount, dec!(42705.00));
        assert_eq!(payment.currency, "NGN");

        let sub = h
            .billing
            .subscriptions
            .verify_and_activate(&payment.reference)
            .await
            .unwrap();
        let today = Utc::now().date_naive();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.tier_id, Some(GROWTH_TIER_ID));
        assert_eq!(sub.amount, dec!(28.47));
        assert_eq!(sub.current_period_start, today);
        assert_eq!(sub.next_billing_date, add_months(today, 3).unwrap());
        assert_eq!(
            sub.authorization.as_ref().map(|a| a.authorization_code.as_str()),
            Some(TEST_AUTHORIZATION_CODE)
        );

        let again = h
            .billing
            .subscriptions
            .verify_and_activate(&payment.reference)
            .await
            .unwrap();
        assert_eq!(again, sub);
        assert_eq!(h.provider.verify_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_payment_for_wrong_tier_rejected() {
        let h = TestHarness::new();
        let big = h.add_church("City Cathedral", 650).await;
        let small = h.add_church("House Church", 25).await;
        for church in [&big, &small] {
            h.billing
                .subscriptions
                .create_initial_subscription(church.id)
                .await
                .unwrap();
        }

        let err = h
            .billing
            .subscriptions
            .initiate_payment(big.id, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID, &big.email)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));

        let err = h
            .billing
            .subscriptions
            .initiate_payment(small.id, FREE_TIER_ID, MONTHLY_INTERVAL_ID, &small.email)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
        assert!(h.store.payments().await.is_empty());
    }

    #[tokio::test]
    async fn test_declined_activation_leaves_subscription_alone() {
        let h = TestHarness::new();
        let church = h.add_church("Trinity", 80).await;
        h.billing
            .subscriptions
            .create_initial_subscription(church.id)
            .await
            .unwrap();
        let payment = h
            .billing
            .subscriptions
            .initiate_payment(church.id, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID, &church.email)
            .await
            .unwrap();
        h.provider.decline(&payment.reference).await;

        let err = h
            .billing
            .subscriptions
            .verify_and_activate(&payment.reference)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PaymentVerificationFailed { .. }));
        assert_eq!(
            h.subscription(church.id).await.unwrap().status,
            SubscriptionStatus::Trialing
        );
        let stored = h.store.require_payment(&payment.reference).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("Declined by issuer"));
    }

    #[tokio::test]
    async fn test_reactivating_suspended_church_restores_addons() {
        let h = TestHarness::new();
        let church = h
            .add_active_church("Lakeside", 80, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap();
        let mut sub = h.subscription(church.id).await.unwrap();
        sub.status = SubscriptionStatus::Suspended;
        h.store.seed_subscription(sub.clone()).await;
        h.store
            .seed_tenant_addon(suspended_addon(church.id, &sub))
            .await;

        let payment = h
            .billing
            .subscriptions
            .initiate_payment(church.id, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID, &church.email)
            .await
            .unwrap();
        let active = h
            .billing
            .subscriptions
            .verify_and_activate(&payment.reference)
            .await
            .unwrap();
        assert_eq!(active.status, SubscriptionStatus::Active);

        let addons = h.billing.addons.list_for_tenant(church.id).await.unwrap();
        assert_eq!(addons.len(), 1);
        assert_eq!(addons[0].status, AddonStatus::Active);
        assert_eq!(addons[0].renewal_date, active.next_billing_date);
    }

    #[tokio::test]
    async fn test_cancel_then_reactivate_within_period() {
        let h = TestHarness::new();
        let church = h
            .add_active_church("Riverside", 80, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap();

        let canceled = h
            .billing
            .subscriptions
            .cancel(church.id, None, Some("budget cuts"))
            .await
            .unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert!(!canceled.auto_renew);
        assert_eq!(canceled.cancel_reason.as_deref(), Some("budget cuts"));
        assert!(canceled.has_access(Utc::now().date_naive()));

        let err = h
            .billing
            .subscriptions
            .cancel(church.id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));

        let reactivated = h
            .billing
            .subscriptions
            .reactivate(church.id, None)
            .await
            .unwrap();
        assert_eq!(reactivated.status, SubscriptionStatus::Active);
        assert!(reactivated.auto_renew);
        assert!(reactivated.canceled_at.is_none());

        let err = h
            .billing
            .subscriptions
            .reactivate(church.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_reactivate_after_period_end_is_past_due() {
        let h = TestHarness::new();
        let church = h
            .add_active_church("Old Mill", 80, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap();
        let today = Utc::now().date_naive();
        let mut sub = h.subscription(church.id).await.unwrap();
        sub.status = SubscriptionStatus::Canceled;
        sub.auto_renew = false;
        sub.current_period_end = today - Duration::days(2);
        h.store.seed_subscription(sub).await;

        let reactivated = h
            .billing
            .subscriptions
            .reactivate(church.id, None)
            .await
            .unwrap();
        assert_eq!(reactivated.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn test_downgrade_to_free_clears_amount() {
        let h = TestHarness::new();
        let church = h
            .add_active_church("Valley", 40, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap();

        let sub = h
            .billing
            .subscriptions
            .downgrade_to_free(church.id, None)
            .await
            .unwrap();
        assert_eq!(sub.tier_id, Some(FREE_TIER_ID));
        assert_eq!(sub.interval_id, Some(MONTHLY_INTERVAL_ID));
        assert_eq!(sub.amount, Decimal::ZERO);
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_credit_consumed_before_billing() {
        let h = TestHarness::new();
        let admin = Uuid::new_v4();
        let church = h
            .add_active_church("Harvest", 80, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap();
        let today = Utc::now().date_naive();
        let mut sub = h.subscription(church.id).await.unwrap();
        sub.next_billing_date = today;
        h.store.seed_subscription(sub).await;

        let status = h
            .billing
            .subscriptions
            .grant_credit(church.id, 2, "launch promotion", admin)
            .await
            .unwrap();
        assert_eq!(status.free_months_remaining, 2);
        assert_eq!(status.granted_by, Some(admin));

        let report = h
            .billing
            .subscriptions
            .process_renewals_on(today)
            .await
            .unwrap();
        assert_eq!(report.renewed_with_credit, 1);
        assert_eq!(report.marked_past_due, 0);

        let after = h.subscription(church.id).await.unwrap();
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.free_months_remaining, 1);
        assert_eq!(after.current_period_start, today);
        assert_eq!(after.next_billing_date, add_months(today, 1).unwrap());
        assert!(h.store.payments().await.is_empty());

        let revoked = h
            .billing
            .subscriptions
            .revoke_credit(church.id, "promotion ended", admin)
            .await
            .unwrap();
        assert_eq!(revoked.free_months_remaining, 0);
        assert_eq!(revoked.revoked_reason.as_deref(), Some("promotion ended"));
    }

    #[tokio::test]
    async fn test_grant_non_positive_credit_rejected() {
        let h = TestHarness::new();
        let church = h
            .add_active_church("Harbor", 80, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap();
        let err = h
            .billing
            .subscriptions
            .grant_credit(church.id, 0, "nothing", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_paid_renewal_schedules_first_retry() {
        let h = TestHarness::new();
        let church = h
            .add_active_church("Summit", 80, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap();
        let today = Utc::now().date_naive();
        let mut sub = h.subscription(church.id).await.unwrap();
        sub.next_billing_date = today;
        h.store.seed_subscription(sub).await;

        let report = h
            .billing
            .subscriptions
            .process_renewals_on(today)
            .await
            .unwrap();
        assert_eq!(report.marked_past_due, 1);

        let after = h.subscription(church.id).await.unwrap();
        assert_eq!(after.status, SubscriptionStatus::PastDue);
        assert_eq!(after.failed_payment_attempts, 1);
        let retry_at = after.next_retry_at.unwrap();
        assert!(retry_at > Utc::now() + Duration::hours(23));
        assert!(retry_at <= Utc::now() + Duration::hours(24));
    }

    #[tokio::test]
    async fn test_retry_sweep_charges_stored_card() {
        let h = TestHarness::new();
        let church = h
            .add_active_church("Pinewood", 80, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap();
        let today = Utc::now().date_naive();
        let overdue_since = today - Duration::days(3);
        let mut sub = h.subscription(church.id).await.unwrap();
        sub.status = SubscriptionStatus::PastDue;
        sub.next_billing_date = overdue_since;
        sub.failed_payment_attempts = 1;
        sub.next_retry_at = Some(Utc::now() - Duration::minutes(5));
        h.store.seed_subscription(sub).await;

        let report = h.billing.subscriptions.retry_due_charges().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);

        let after = h.subscription(church.id).await.unwrap();
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.failed_payment_attempts, 0);
        assert!(after.next_retry_at.is_none());
        assert_eq!(after.current_period_start, overdue_since);
        assert_eq!(after.next_billing_date, add_months(overdue_since, 1).unwrap());

        let charges = h.provider.charges().await;
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].authorization_code, TEST_AUTHORIZATION_CODE);
        assert_eq!(charges[0].amount, dec!(14985.00));
        assert_eq!(charges[0].email, church.email);

        let payment = h.store.require_payment(&charges[0].reference).await.unwrap();
        assert!(payment.reference.starts_with("RC-"));
        assert_eq!(payment.status, PaymentStatus::Success);
    }

    #[tokio::test]
    async fn test_declined_retry_backs_off() {
        let h = TestHarness::new();
        let church = h
            .add_active_church("Meadow", 80, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap();
        let mut sub = h.subscription(church.id).await.unwrap();
        sub.status = SubscriptionStatus::PastDue;
        sub.failed_payment_attempts = 1;
        h.store.seed_subscription(sub).await;
        h.provider.decline_charges(true).await;

        let outcome = h
            .billing
            .subscriptions
            .retry_recurring_charge(church.id)
            .await
            .unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.failed_payment_attempts, 2);
        assert_eq!(outcome.failure_reason.as_deref(), Some("Insufficient funds"));
        let retry_at = outcome.next_retry_at.unwrap();
        assert!(retry_at > Utc::now() + Duration::hours(47));

        let after = h.subscription(church.id).await.unwrap();
        assert_eq!(after.status, SubscriptionStatus::PastDue);
        let payment = h.store.require_payment(&outcome.reference).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_requires_configured_provider() {
        let h = TestHarness::with_provider(BillingConfig::default(), MockPaymentProvider::unconfigured());
        let err = h.billing.subscriptions.retry_due_charges().await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_suspension_suspends_active_addons() {
        let h = TestHarness::new();
        let church = h
            .add_active_church("Eastgate", 80, GROWTH_TIER_ID, MONTHLY_INTERVAL_ID)
            .await
            .unwrap();
        let today = Utc::now().date_naive();
        let mut sub = h.subscription(church.id).await.unwrap();
        sub.status = SubscriptionStatus::PastDue;
        sub.next_billing_date = today - Duration::days(10);
        h.store.seed_subscription(sub.clone()).await;
        let mut addon = suspended_addon(church.id, &sub);
        addon.status = AddonStatus::Active;
        h.store.seed_tenant_addon(addon).await;

        let report = h
            .billing
            .subscriptions
            .suspend_past_due_on(today)
            .await
            .unwrap();
        assert_eq!(report.suspended, 1);
        assert!(!h.subscription(church.id).await.unwrap().has_access(today));
        let addons = h.billing.addons.list_for_tenant(church.id).await.unwrap();
        assert_eq!(addons[0].status, AddonStatus::Suspended);
    }
}
