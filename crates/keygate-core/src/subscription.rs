//! Mirrored Subscription Records
//!
//! The provider owns subscription lifecycle state; these rows are a local
//! mirror maintained exclusively through the webhook channel. Rows are
//! never deleted — cancellation sets a status and timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local mirror of a provider subscription, keyed by provider id
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub provider_subscription_id: String,
    pub provider_customer_id: Option<String>,
    /// Provider status string, mirrored verbatim
    pub status: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    pub fn is_canceled(&self) -> bool {
        self.status == "canceled"
    }
}
