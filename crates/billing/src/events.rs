//! Billing Events Module
//!
//! Append-only billing events for audit trails and debugging. Events are
//! emitted on the `steward_billing::events` tracing target so any subscriber
//! (log files, JSON shipping, tests) can collect them.

use serde::Serialize;
use uuid::Uuid;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BillingEventType {
    // Subscription lifecycle
    SubscriptionCreated,
    SubscriptionCanceled,
    SubscriptionReactivated,
    SubscriptionDowngraded,
    MarkedPastDue,
    Suspended,
    Renewed,

    // Payments
    PaymentVerified,
    PaymentFailed,

    // Tier changes
    TierAssigned,
    TierChangeInitiated,
    TierChangeCompleted,
    TierChangeFailed,

    // Promotional credits
    CreditGranted,
    CreditRevoked,
    CreditConsumed,

    // Migration
    MigrationCompleted,
    MigrationFailed,
    MigrationRolledBack,

    // Add-ons
    AddonActivated,
    AddonCanceled,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::SubscriptionReactivated => "SUBSCRIPTION_REACTIVATED",
            BillingEventType::SubscriptionDowngraded => "SUBSCRIPTION_DOWNGRADED",
            BillingEventType::MarkedPastDue => "MARKED_PAST_DUE",
            BillingEventType::Suspended => "SUSPENDED",
            BillingEventType::Renewed => "RENEWED",
            BillingEventType::PaymentVerified => "PAYMENT_VERIFIED",
            BillingEventType::PaymentFailed => "PAYMENT_FAILED",
            BillingEventType::TierAssigned => "TIER_ASSIGNED",
            BillingEventType::TierChangeInitiated => "TIER_CHANGE_INITIATED",
            BillingEventType::TierChangeCompleted => "TIER_CHANGE_COMPLETED",
            BillingEventType::TierChangeFailed => "TIER_CHANGE_FAILED",
            BillingEventType::CreditGranted => "CREDIT_GRANTED",
            BillingEventType::CreditRevoked => "CREDIT_REVOKED",
            BillingEventType::CreditConsumed => "CREDIT_CONSUMED",
            BillingEventType::MigrationCompleted => "MIGRATION_COMPLETED",
            BillingEventType::MigrationFailed => "MIGRATION_FAILED",
            BillingEventType::MigrationRolledBack => "MIGRATION_ROLLED_BACK",
            BillingEventType::AddonActivated => "ADDON_ACTIVATED",
            BillingEventType::AddonCanceled => "ADDON_CANCELED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActorType {
    /// Church staff through the app
    User,
    /// Platform administrator
    Admin,
    /// Scheduled sweeps and reconciliation
    System,
    /// Payment provider callback
    Provider,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::System => write!(f, "system"),
            ActorType::Provider => write!(f, "provider"),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, Serialize)]
pub struct BillingEvent {
    pub tenant_id: Uuid,
    pub event_type: BillingEventType,
    pub event_data: serde_json::Value,
    pub reference: Option<String>,
    pub actor_id: Option<Uuid>,
    pub actor_type: ActorType,
}

impl BillingEvent {
    /// Emit this event on the billing event target.
    pub fn emit(&self) {
        tracing::info!(
            target: "steward_billing::events",
            event = %self.event_type,
            tenant_id = %self.tenant_id,
            reference = self.reference.as_deref().unwrap_or(""),
            actor_type = %self.actor_type,
            actor_id = ?self.actor_id,
            data = %self.event_data,
            "billing event"
        );
    }
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    tenant_id: Uuid,
    event_type: BillingEventType,
    event_data: serde_json::Value,
    reference: Option<String>,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    /// Create a new event builder
    pub fn new(tenant_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            tenant_id,
            event_type,
            event_data: serde_json::json!({}),
            reference: None,
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Set the payment reference the event relates to
    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Set the actor, if known. A known actor is a church user.
    pub fn actor_opt(mut self, actor_id: Option<Uuid>) -> Self {
        if actor_id.is_some() {
            self.actor_type = ActorType::User;
        }
        self.actor_id = actor_id;
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn build(self) -> BillingEvent {
        BillingEvent {
            tenant_id: self.tenant_id,
            event_type: self.event_type,
            event_data: self.event_data,
            reference: self.reference,
            actor_id: self.actor_id,
            actor_type: self.actor_type,
        }
    }

    /// Build and emit in one step
    pub fn emit(self) {
        self.build().emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_display() {
        assert_eq!(
            BillingEventType::TierChangeCompleted.to_string(),
            "TIER_CHANGE_COMPLETED"
        );
        assert_eq!(BillingEventType::CreditConsumed.to_string(), "CREDIT_CONSUMED");
    }

    #[test]
    fn test_builder_defaults_to_system_actor() {
        let event = BillingEventBuilder::new(Uuid::new_v4(), BillingEventType::Suspended).build();
        assert_eq!(event.actor_type, ActorType::System);
        assert!(event.actor_id.is_none());
    }

    #[test]
    fn test_builder_with_actor() {
        let actor = Uuid::new_v4();
        let event = BillingEventBuilder::new(Uuid::new_v4(), BillingEventType::CreditGranted)
            .actor_opt(Some(actor))
            .reference("TU-abc")
            .data(serde_json::json!({ "months": 3 }))
            .build();
        assert_eq!(event.actor_type, ActorType::User);
        assert_eq!(event.actor_id, Some(actor));
        assert_eq!(event.reference.as_deref(), Some("TU-abc"));
        assert_eq!(event.event_data["months"], 3);
    }
}
