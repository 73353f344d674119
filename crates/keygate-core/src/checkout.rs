//! Checkout Intents
//!
//! The local side of a purchase. An intent is created before the provider
//! call so a correlation id exists even if that call fails; the provider
//! session id is attached once known. Status only moves forward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::BillingCycle;

/// Lifecycle of a checkout intent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckoutStatus {
    /// Local record exists, provider session not yet confirmed
    Pending,
    /// Provider session created and attached
    Created,
    /// Payment completed, credential key issued
    Completed,
    /// Provider session expired before payment
    Expired,
}

impl CheckoutStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckoutStatus::Pending => "pending",
            CheckoutStatus::Created => "created",
            CheckoutStatus::Completed => "completed",
            CheckoutStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CheckoutStatus::Pending),
            "created" => Some(CheckoutStatus::Created),
            "completed" => Some(CheckoutStatus::Completed),
            "expired" => Some(CheckoutStatus::Expired),
            _ => None,
        }
    }

    /// Forward-only transitions: pending→created→completed, or
    /// pending/created→expired. Completed and expired are terminal.
    pub fn can_transition_to(self, next: CheckoutStatus) -> bool {
        use CheckoutStatus::{Completed, Created, Expired, Pending};
        matches!(
            (self, next),
            (Pending, Created)
                | (Pending, Completed)
                | (Created, Completed)
                | (Pending, Expired)
                | (Created, Expired)
        )
    }
}

/// A pending purchase, correlated to a provider checkout session via
/// opaque metadata rather than a shared foreign key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutIntent {
    pub id: Uuid,
    /// Provider session id, known only after the provider call returns
    pub provider_session_id: Option<String>,
    pub email: Option<String>,
    pub user_id: Option<String>,
    pub plan_id: String,
    pub billing_cycle: BillingCycle,
    pub status: CheckoutStatus,
    /// Set when the checkout completes and a key is issued
    pub credential_key_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl CheckoutIntent {
    pub fn new(
        plan_id: impl Into<String>,
        billing_cycle: BillingCycle,
        email: Option<String>,
        user_id: Option<String>,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), plan_id, billing_cycle, email, user_id)
    }

    /// Create with a caller-supplied id (the authenticated flow lets the
    /// client pick the correlation id up front).
    pub fn with_id(
        id: Uuid,
        plan_id: impl Into<String>,
        billing_cycle: BillingCycle,
        email: Option<String>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            id,
            provider_session_id: None,
            email,
            user_id,
            plan_id: plan_id.into(),
            billing_cycle,
            status: CheckoutStatus::Pending,
            credential_key_id: None,
            created_at: Utc::now(),
        }
    }
}
