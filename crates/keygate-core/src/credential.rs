//! Credential Keys
//!
//! Opaque, single-use entitlement tokens issued on checkout completion
//! and redeemed exactly once to bind a purchase to an account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::plan::BillingCycle;

/// Credential key string (formatted: XXXX-XXXX-XXXX-XXXX)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyString(String);

impl KeyString {
    /// Generate a new opaque key
    pub fn generate() -> Self {
        let id = Uuid::new_v4();
        let hex = id.simple().to_string().to_uppercase();
        Self(format!(
            "{}-{}-{}-{}",
            &hex[0..4],
            &hex[4..8],
            &hex[8..12],
            &hex[12..16]
        ))
    }

    /// Parse from user input, normalizing case
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters for issuing a key when a checkout completes
#[derive(Clone, Debug)]
pub struct IssueKey {
    pub email: String,
    pub plan_id: String,
    pub billing_cycle: BillingCycle,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
}

/// A redeemable entitlement record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialKey {
    pub id: Uuid,
    pub key: KeyString,
    /// Owning email; redemption compares case-insensitively
    pub email: String,
    pub plan_id: String,
    pub billing_cycle: BillingCycle,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// One-way flag; never reverts once set
    pub is_redeemed: bool,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub redeemed_by: Option<String>,
}

impl CredentialKey {
    /// Issue a fresh key. Expiry is issuance time plus one calendar month
    /// or year depending on the billing cycle.
    pub fn issue(request: &IssueKey, issued_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: KeyString::generate(),
            email: request.email.clone(),
            plan_id: request.plan_id.clone(),
            billing_cycle: request.billing_cycle,
            provider_customer_id: request.provider_customer_id.clone(),
            provider_subscription_id: request.provider_subscription_id.clone(),
            issued_at,
            expires_at: request.billing_cycle.expiry_from(issued_at),
            is_redeemed: false,
            redeemed_at: None,
            redeemed_by: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Validate a redemption attempt. Check order matters: a second
    /// redemption always reports `AlreadyRedeemed` regardless of the
    /// other parameters.
    pub fn check_redeemable(&self, email: &str, now: DateTime<Utc>) -> Result<()> {
        if self.is_redeemed {
            return Err(Error::AlreadyRedeemed);
        }
        if !self.email.eq_ignore_ascii_case(email) {
            return Err(Error::EmailMismatch);
        }
        if self.is_expired(now) {
            return Err(Error::KeyExpired);
        }
        Ok(())
    }
}
