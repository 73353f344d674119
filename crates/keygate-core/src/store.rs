//! Entitlement Storage
//!
//! All durable state lives behind this trait; handlers hold no shared
//! mutable state of their own. The two check-then-set sequences in the
//! flow — issuance on checkout completion and key redemption — must be
//! atomic with respect to concurrent callers, so they are single trait
//! operations rather than read-then-write call pairs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::checkout::{CheckoutIntent, CheckoutStatus};
use crate::credential::{CredentialKey, IssueKey, KeyString};
use crate::error::{Error, Result};
use crate::profile::Profile;
use crate::subscription::SubscriptionRecord;

/// A redemption attempt
#[derive(Clone, Debug)]
pub struct RedeemRequest {
    pub key: String,
    pub email: String,
    /// Authenticated subject, when the redeemer is already signed in
    pub user_id: Option<String>,
}

/// Result of a successful redemption
#[derive(Clone, Debug)]
pub struct RedeemOutcome {
    pub key: CredentialKey,
    pub profile: Profile,
}

/// Result of completing a checkout. `newly_issued` is false when a
/// duplicate webhook delivery found the checkout already completed.
#[derive(Clone, Debug)]
pub struct IssueOutcome {
    pub key: CredentialKey,
    pub newly_issued: bool,
}

/// Durable entitlement state
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Short label for diagnostics ("memory", "postgres")
    fn kind(&self) -> &'static str;

    async fn create_intent(&self, intent: CheckoutIntent) -> Result<()>;

    async fn intent(&self, id: Uuid) -> Result<Option<CheckoutIntent>>;

    async fn intent_by_session(&self, provider_session_id: &str)
        -> Result<Option<CheckoutIntent>>;

    /// Record the provider session id once the provider call returns,
    /// moving a pending intent to `created`.
    async fn attach_provider_session(
        &self,
        intent_id: Uuid,
        provider_session_id: &str,
    ) -> Result<()>;

    /// Atomically issue a credential key and mark the intent completed.
    /// Idempotent: if the intent is already completed, the existing key
    /// is returned and no second key is created.
    async fn complete_checkout(&self, intent_id: Uuid, issue: IssueKey) -> Result<IssueOutcome>;

    /// Mark an intent expired. A no-op if the intent already completed —
    /// a late expiry event never downgrades a completed purchase.
    async fn expire_checkout(&self, intent_id: Uuid) -> Result<()>;

    async fn credential_key(&self, key: &str) -> Result<Option<CredentialKey>>;

    async fn credential_key_by_id(&self, id: Uuid) -> Result<Option<CredentialKey>>;

    /// Atomically validate and redeem a key, creating or updating the
    /// purchaser's profile. Under concurrent calls for the same key,
    /// exactly one succeeds; the rest see `AlreadyRedeemed`.
    async fn redeem_key(&self, request: RedeemRequest) -> Result<RedeemOutcome>;

    /// Bind a profile to an auth subject. Re-linking the same subject is
    /// a no-op; a different subject is a conflict.
    async fn link_profile(&self, profile_id: Uuid, auth_user_id: &str) -> Result<Profile>;

    async fn upsert_subscription(&self, record: SubscriptionRecord) -> Result<()>;

    /// Set canceled status and timestamp. Never deletes the row.
    async fn cancel_subscription(
        &self,
        provider_subscription_id: &str,
        canceled_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<SubscriptionRecord>>;
}

#[derive(Default)]
struct Inner {
    intents: HashMap<Uuid, CheckoutIntent>,
    intents_by_session: HashMap<String, Uuid>,
    keys: HashMap<String, CredentialKey>,
    key_strings_by_id: HashMap<Uuid, String>,
    profiles: HashMap<Uuid, Profile>,
    subscriptions: HashMap<String, SubscriptionRecord>,
}

/// In-memory store (for development and tests). A single lock guards all
/// maps so multi-map operations stay atomic.
pub struct MemoryEntitlementStore {
    inner: RwLock<Inner>,
}

impl Default for MemoryEntitlementStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEntitlementStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

#[async_trait]
impl EntitlementStore for MemoryEntitlementStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn create_intent(&self, intent: CheckoutIntent) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(session_id) = &intent.provider_session_id {
            inner.intents_by_session.insert(session_id.clone(), intent.id);
        }
        inner.intents.insert(intent.id, intent);
        Ok(())
    }

    async fn intent(&self, id: Uuid) -> Result<Option<CheckoutIntent>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.intents.get(&id).cloned())
    }

    async fn intent_by_session(
        &self,
        provider_session_id: &str,
    ) -> Result<Option<CheckoutIntent>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .intents_by_session
            .get(provider_session_id)
            .and_then(|id| inner.intents.get(id))
            .cloned())
    }

    async fn attach_provider_session(
        &self,
        intent_id: Uuid,
        provider_session_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let intent = inner
            .intents
            .get_mut(&intent_id)
            .ok_or_else(|| Error::SessionNotFound(intent_id.to_string()))?;
        intent.provider_session_id = Some(provider_session_id.to_string());
        if intent.status.can_transition_to(CheckoutStatus::Created) {
            intent.status = CheckoutStatus::Created;
        }
        inner
            .intents_by_session
            .insert(provider_session_id.to_string(), intent_id);
        Ok(())
    }

    async fn complete_checkout(&self, intent_id: Uuid, issue: IssueKey) -> Result<IssueOutcome> {
        let mut inner = self.inner.write().unwrap();

        let (status, existing_key_id) = {
            let intent = inner
                .intents
                .get(&intent_id)
                .ok_or_else(|| Error::SessionNotFound(intent_id.to_string()))?;
            (intent.status, intent.credential_key_id)
        };

        match status {
            CheckoutStatus::Completed => {
                // Duplicate delivery: hand back the key issued the first time
                let key_id = existing_key_id.ok_or_else(|| {
                    Error::Storage(format!("completed intent {intent_id} has no key"))
                })?;
                let key = inner
                    .key_strings_by_id
                    .get(&key_id)
                    .and_then(|s| inner.keys.get(s))
                    .cloned()
                    .ok_or_else(|| Error::Storage(format!("credential key {key_id} missing")))?;
                Ok(IssueOutcome {
                    key,
                    newly_issued: false,
                })
            }
            CheckoutStatus::Expired => Err(Error::SessionExpired),
            CheckoutStatus::Pending | CheckoutStatus::Created => {
                let key = CredentialKey::issue(&issue, Utc::now());
                if let Some(intent) = inner.intents.get_mut(&intent_id) {
                    intent.status = CheckoutStatus::Completed;
                    intent.credential_key_id = Some(key.id);
                }
                inner
                    .key_strings_by_id
                    .insert(key.id, key.key.as_str().to_string());
                inner.keys.insert(key.key.as_str().to_string(), key.clone());
                Ok(IssueOutcome {
                    key,
                    newly_issued: true,
                })
            }
        }
    }

    async fn expire_checkout(&self, intent_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let intent = inner
            .intents
            .get_mut(&intent_id)
            .ok_or_else(|| Error::SessionNotFound(intent_id.to_string()))?;
        if !intent.status.can_transition_to(CheckoutStatus::Expired) {
            tracing::debug!(
                intent_id = %intent_id,
                status = intent.status.as_str(),
                "expiry ignored for terminal checkout"
            );
            return Ok(());
        }
        intent.status = CheckoutStatus::Expired;
        Ok(())
    }

    async fn credential_key(&self, key: &str) -> Result<Option<CredentialKey>> {
        let inner = self.inner.read().unwrap();
        let normalized = KeyString::from_string(key);
        Ok(inner.keys.get(normalized.as_str()).cloned())
    }

    async fn credential_key_by_id(&self, id: Uuid) -> Result<Option<CredentialKey>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .key_strings_by_id
            .get(&id)
            .and_then(|s| inner.keys.get(s))
            .cloned())
    }

    async fn redeem_key(&self, request: RedeemRequest) -> Result<RedeemOutcome> {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();
        let normalized = KeyString::from_string(&request.key);

        let key = {
            let entry = inner
                .keys
                .get_mut(normalized.as_str())
                .ok_or(Error::KeyNotFound)?;
            entry.check_redeemable(&request.email, now)?;
            entry.is_redeemed = true;
            entry.redeemed_at = Some(now);
            entry.redeemed_by = request.user_id.clone();
            entry.clone()
        };

        let profile = match &request.user_id {
            Some(user_id) => {
                let existing = inner
                    .profiles
                    .values_mut()
                    .find(|p| p.auth_user_id.as_deref() == Some(user_id.as_str()));
                if let Some(profile) = existing {
                    profile.plan_id = key.plan_id.clone();
                    profile.credential_key_id = key.id;
                    profile.subscription_status = "active".into();
                    profile.password_set = true;
                    profile.clone()
                } else {
                    let profile =
                        Profile::for_user(user_id, key.email.clone(), key.plan_id.clone(), key.id);
                    inner.profiles.insert(profile.id, profile.clone());
                    profile
                }
            }
            None => {
                let profile =
                    Profile::passwordless(key.email.clone(), key.plan_id.clone(), key.id);
                inner.profiles.insert(profile.id, profile.clone());
                profile
            }
        };

        Ok(RedeemOutcome { key, profile })
    }

    async fn link_profile(&self, profile_id: Uuid, auth_user_id: &str) -> Result<Profile> {
        let mut inner = self.inner.write().unwrap();
        let profile = inner
            .profiles
            .get_mut(&profile_id)
            .ok_or(Error::ProfileNotFound(profile_id))?;

        match profile.auth_user_id.as_deref() {
            Some(existing) if existing == auth_user_id => {} // re-link is a no-op
            Some(_) => return Err(Error::ProfileAlreadyLinked(profile_id)),
            None => {
                profile.auth_user_id = Some(auth_user_id.to_string());
                profile.password_set = true;
            }
        }
        Ok(profile.clone())
    }

    async fn upsert_subscription(&self, record: SubscriptionRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .subscriptions
            .insert(record.provider_subscription_id.clone(), record);
        Ok(())
    }

    async fn cancel_subscription(
        &self,
        provider_subscription_id: &str,
        canceled_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.subscriptions.get_mut(provider_subscription_id) {
            Some(record) => {
                record.status = "canceled".into();
                record.canceled_at = Some(canceled_at);
                record.updated_at = Utc::now();
            }
            None => {
                // Deletion event for a subscription we never saw; record it
                // anyway so the mirror stays consistent with the provider
                tracing::warn!(
                    subscription_id = %provider_subscription_id,
                    "cancellation for unknown subscription, creating row"
                );
                inner.subscriptions.insert(
                    provider_subscription_id.to_string(),
                    SubscriptionRecord {
                        provider_subscription_id: provider_subscription_id.to_string(),
                        provider_customer_id: None,
                        status: "canceled".into(),
                        current_period_start: None,
                        current_period_end: None,
                        canceled_at: Some(canceled_at),
                        updated_at: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<SubscriptionRecord>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.subscriptions.get(provider_subscription_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::BillingCycle;
    use std::sync::Arc;

    fn issue_request(email: &str) -> IssueKey {
        IssueKey {
            email: email.into(),
            plan_id: "starter".into(),
            billing_cycle: BillingCycle::Monthly,
            provider_customer_id: Some("cus_1".into()),
            provider_subscription_id: Some("sub_1".into()),
        }
    }

    async fn completed_checkout(store: &MemoryEntitlementStore, email: &str) -> CredentialKey {
        let intent = CheckoutIntent::new("starter", BillingCycle::Monthly, Some(email.into()), None);
        let intent_id = intent.id;
        store.create_intent(intent).await.unwrap();
        store
            .attach_provider_session(intent_id, "cs_test_1")
            .await
            .unwrap();
        store
            .complete_checkout(intent_id, issue_request(email))
            .await
            .unwrap()
            .key
    }

    #[tokio::test]
    async fn test_complete_checkout_is_idempotent() {
        let store = MemoryEntitlementStore::new();
        let intent = CheckoutIntent::new(
            "starter",
            BillingCycle::Monthly,
            Some("a@x.com".into()),
            None,
        );
        let id = intent.id;
        store.create_intent(intent).await.unwrap();

        let first = store
            .complete_checkout(id, issue_request("a@x.com"))
            .await
            .unwrap();
        let second = store
            .complete_checkout(id, issue_request("a@x.com"))
            .await
            .unwrap();

        assert!(first.newly_issued);
        assert!(!second.newly_issued);
        assert_eq!(first.key.id, second.key.id);
        assert_eq!(first.key.key, second.key.key);
    }

    #[tokio::test]
    async fn test_expire_never_downgrades_completed() {
        let store = MemoryEntitlementStore::new();
        let key = completed_checkout(&store, "a@x.com").await;
        let intent = store
            .intent_by_session("cs_test_1")
            .await
            .unwrap()
            .unwrap();

        store.expire_checkout(intent.id).await.unwrap();

        let after = store.intent(intent.id).await.unwrap().unwrap();
        assert_eq!(after.status, CheckoutStatus::Completed);
        assert_eq!(after.credential_key_id, Some(key.id));
    }

    #[tokio::test]
    async fn test_expired_checkout_cannot_complete() {
        let store = MemoryEntitlementStore::new();
        let intent = CheckoutIntent::new(
            "starter",
            BillingCycle::Monthly,
            Some("a@x.com".into()),
            None,
        );
        let id = intent.id;
        store.create_intent(intent).await.unwrap();
        store.expire_checkout(id).await.unwrap();

        assert!(matches!(
            store.complete_checkout(id, issue_request("a@x.com")).await,
            Err(Error::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_redeem_happy_path_creates_passwordless_profile() {
        let store = MemoryEntitlementStore::new();
        let key = completed_checkout(&store, "A@X.com").await;

        let outcome = store
            .redeem_key(RedeemRequest {
                key: key.key.as_str().into(),
                email: "a@x.com".into(), // case differs from stored email
                user_id: None,
            })
            .await
            .unwrap();

        assert!(outcome.key.is_redeemed);
        assert!(outcome.key.redeemed_at.is_some());
        assert!(outcome.profile.auth_user_id.is_none());
        assert!(!outcome.profile.password_set);
        assert_eq!(outcome.profile.credential_key_id, key.id);
    }

    #[tokio::test]
    async fn test_second_redemption_fails() {
        let store = MemoryEntitlementStore::new();
        let key = completed_checkout(&store, "a@x.com").await;
        let request = RedeemRequest {
            key: key.key.as_str().into(),
            email: "a@x.com".into(),
            user_id: None,
        };

        store.redeem_key(request.clone()).await.unwrap();
        assert!(matches!(
            store.redeem_key(request).await,
            Err(Error::AlreadyRedeemed)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_redemptions_yield_one_success() {
        let store = Arc::new(MemoryEntitlementStore::new());
        let key = completed_checkout(&store, "a@x.com").await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let key = key.key.as_str().to_string();
            handles.push(tokio::spawn(async move {
                store
                    .redeem_key(RedeemRequest {
                        key,
                        email: "a@x.com".into(),
                        user_id: None,
                    })
                    .await
            }));
        }

        let mut successes = 0;
        let mut already_redeemed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(Error::AlreadyRedeemed) => already_redeemed += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(already_redeemed, 7);
    }

    #[tokio::test]
    async fn test_redeem_unknown_key() {
        let store = MemoryEntitlementStore::new();
        assert!(matches!(
            store
                .redeem_key(RedeemRequest {
                    key: "AAAA-BBBB-CCCC-DDDD".into(),
                    email: "a@x.com".into(),
                    user_id: None,
                })
                .await,
            Err(Error::KeyNotFound)
        ));
    }

    #[tokio::test]
    async fn test_redeem_with_user_id_sets_password_flag() {
        let store = MemoryEntitlementStore::new();
        let key = completed_checkout(&store, "a@x.com").await;

        let outcome = store
            .redeem_key(RedeemRequest {
                key: key.key.as_str().into(),
                email: "a@x.com".into(),
                user_id: Some("user_42".into()),
            })
            .await
            .unwrap();

        assert_eq!(outcome.key.redeemed_by.as_deref(), Some("user_42"));
        assert_eq!(outcome.profile.auth_user_id.as_deref(), Some("user_42"));
        assert!(outcome.profile.password_set);
    }

    #[tokio::test]
    async fn test_link_profile_once() {
        let store = MemoryEntitlementStore::new();
        let key = completed_checkout(&store, "a@x.com").await;
        let outcome = store
            .redeem_key(RedeemRequest {
                key: key.key.as_str().into(),
                email: "a@x.com".into(),
                user_id: None,
            })
            .await
            .unwrap();

        let linked = store
            .link_profile(outcome.profile.id, "auth_1")
            .await
            .unwrap();
        assert_eq!(linked.auth_user_id.as_deref(), Some("auth_1"));
        assert!(linked.password_set);

        // Same subject again: no-op
        let relinked = store
            .link_profile(outcome.profile.id, "auth_1")
            .await
            .unwrap();
        assert_eq!(relinked.auth_user_id.as_deref(), Some("auth_1"));

        // Different subject: conflict
        assert!(matches!(
            store.link_profile(outcome.profile.id, "auth_2").await,
            Err(Error::ProfileAlreadyLinked(_))
        ));
    }

    #[tokio::test]
    async fn test_subscription_cancel_keeps_row() {
        let store = MemoryEntitlementStore::new();
        store
            .upsert_subscription(SubscriptionRecord {
                provider_subscription_id: "sub_1".into(),
                provider_customer_id: Some("cus_1".into()),
                status: "active".into(),
                current_period_start: Some(Utc::now()),
                current_period_end: None,
                canceled_at: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        store
            .cancel_subscription("sub_1", Utc::now())
            .await
            .unwrap();

        let record = store.subscription("sub_1").await.unwrap().unwrap();
        assert!(record.is_canceled());
        assert!(record.canceled_at.is_some());
        // Customer reference from the original row survives cancellation
        assert_eq!(record.provider_customer_id.as_deref(), Some("cus_1"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_subscription_creates_row() {
        let store = MemoryEntitlementStore::new();
        store
            .cancel_subscription("sub_ghost", Utc::now())
            .await
            .unwrap();
        let record = store.subscription("sub_ghost").await.unwrap().unwrap();
        assert!(record.is_canceled());
    }

    #[tokio::test]
    async fn test_attach_session_moves_pending_to_created() {
        let store = MemoryEntitlementStore::new();
        let intent = CheckoutIntent::new(
            "starter",
            BillingCycle::Monthly,
            Some("a@x.com".into()),
            None,
        );
        let id = intent.id;
        store.create_intent(intent).await.unwrap();

        store.attach_provider_session(id, "cs_abc").await.unwrap();

        let intent = store.intent_by_session("cs_abc").await.unwrap().unwrap();
        assert_eq!(intent.id, id);
        assert_eq!(intent.status, CheckoutStatus::Created);
    }
}
