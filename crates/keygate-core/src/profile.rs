//! Profiles
//!
//! Account entitlement records created at redemption. A profile may start
//! passwordless (no auth subject yet) and be linked to an account later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An account entitlement record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    /// Auth subject id, attached at most once
    pub auth_user_id: Option<String>,
    pub email: String,
    pub plan_id: String,
    pub subscription_status: String,
    pub credential_key_id: Uuid,
    /// False for profiles created ahead of account signup
    pub password_set: bool,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    /// Profile for a redemption that carried an authenticated user id
    pub fn for_user(
        auth_user_id: impl Into<String>,
        email: impl Into<String>,
        plan_id: impl Into<String>,
        credential_key_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            auth_user_id: Some(auth_user_id.into()),
            email: email.into(),
            plan_id: plan_id.into(),
            subscription_status: "active".into(),
            credential_key_id,
            password_set: true,
            created_at: Utc::now(),
        }
    }

    /// Passwordless profile, to be linked to an account afterwards
    pub fn passwordless(
        email: impl Into<String>,
        plan_id: impl Into<String>,
        credential_key_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            auth_user_id: None,
            email: email.into(),
            plan_id: plan_id.into(),
            subscription_status: "active".into(),
            credential_key_id,
            password_set: false,
            created_at: Utc::now(),
        }
    }
}
