//! Stripe Checkout Integration
//!
//! Implements the "Stripe Checkout (Hosted)" approach: the client is
//! redirected to a Stripe-hosted page and completion comes back through
//! the webhook channel. Creation is two-phase — local intent first, then
//! the provider call — so a correlation id exists even if Stripe fails.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stripe::{
    CheckoutSession as StripeCheckoutSession, CheckoutSessionId, CheckoutSessionMode,
    CheckoutSessionPaymentStatus, Client, CreateCheckoutSession, CreateCheckoutSessionLineItems,
};
use uuid::Uuid;

use keygate_core::{
    BillingCycle, CheckoutIntent, CheckoutStatus, EntitlementStore, Error, IssueKey, PlanCatalog,
    Result,
};

/// Metadata keys carried on the provider session. This metadata is the
/// sole correlation back to the local record — the provider session id is
/// not known until the provider responds.
pub(crate) const META_CHECKOUT_ID: &str = "checkout_id";
pub(crate) const META_EMAIL: &str = "email";
pub(crate) const META_PLAN: &str = "plan";
pub(crate) const META_BILLING_CYCLE: &str = "billing_cycle";
pub(crate) const META_USER_ID: &str = "user_id";

/// Stripe client wrapper
pub struct StripeClient {
    client: Client,
    webhook_secret: String,
}

impl StripeClient {
    /// Create a new Stripe client
    pub fn new(secret_key: &str, webhook_secret: &str) -> Self {
        Self {
            client: Client::new(secret_key),
            webhook_secret: webhook_secret.to_string(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| Error::Config("STRIPE_SECRET_KEY not set".into()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| Error::Config("STRIPE_WEBHOOK_SECRET not set".into()))?;

        Ok(Self::new(&secret_key, &webhook_secret))
    }

    /// Get the webhook secret
    pub fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }

    /// Create a hosted checkout session for a recurring price
    async fn create_session(&self, args: &SessionArgs) -> Result<ProviderSession> {
        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&args.success_url);
        params.cancel_url = Some(&args.cancel_url);
        params.customer_email = args.customer_email.as_deref();
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            quantity: Some(1),
            price: Some(args.price_id.clone()),
            ..Default::default()
        }]);
        params.metadata = Some(args.metadata.clone());

        let session = StripeCheckoutSession::create(&self.client, params)
            .await
            .map_err(|e| Error::Provider(e.to_string()))?;

        let url = session
            .url
            .ok_or_else(|| Error::Provider("no checkout URL returned".into()))?;

        Ok(ProviderSession {
            id: session.id.to_string(),
            url,
        })
    }

    /// Fetch the current provider-side view of a session
    async fn retrieve_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        let id: CheckoutSessionId = session_id
            .parse()
            .map_err(|_| Error::SessionNotFound(session_id.to_string()))?;

        let session = StripeCheckoutSession::retrieve(&self.client, &id, &[])
            .await
            .map_err(|e| Error::Provider(e.to_string()))?;

        Ok(SessionSnapshot {
            paid: matches!(
                session.payment_status,
                CheckoutSessionPaymentStatus::Paid
                    | CheckoutSessionPaymentStatus::NoPaymentRequired
            ),
            customer_email: session.customer_email.clone(),
            customer_id: session.customer.as_ref().map(|c| c.id().to_string()),
            subscription_id: session.subscription.as_ref().map(|s| s.id().to_string()),
        })
    }
}

struct SessionArgs {
    price_id: String,
    customer_email: Option<String>,
    success_url: String,
    cancel_url: String,
    metadata: HashMap<String, String>,
}

struct ProviderSession {
    id: String,
    url: String,
}

struct SessionSnapshot {
    paid: bool,
    customer_email: Option<String>,
    customer_id: Option<String>,
    subscription_id: Option<String>,
}

/// Redirect targets after the hosted page
#[derive(Clone, Debug)]
pub struct CheckoutUrls {
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutUrls {
    pub fn from_env() -> Self {
        Self {
            success_url: std::env::var("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|_| "http://localhost:3000/success".into()),
            cancel_url: std::env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| "http://localhost:3000/pricing".into()),
        }
    }
}

/// Request to start a checkout for an anonymous purchaser
#[derive(Clone, Debug, Deserialize)]
pub struct CreateCheckout {
    pub email: String,
    pub plan: String,
    pub billing_cycle: BillingCycle,
}

/// Request from the authenticated flow: plan by name, purchaser by user
/// id, correlation id chosen by the caller.
#[derive(Clone, Debug, Deserialize)]
pub struct CreateUserCheckout {
    pub plan_name: String,
    pub user_id: String,
    pub intent_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub billing_cycle: Option<BillingCycle>,
}

/// Result of creating a checkout session
#[derive(Clone, Debug, Serialize)]
pub struct CheckoutCreated {
    pub session_id: String,
    pub url: String,
}

/// Resolved credential key details for a completed session
#[derive(Clone, Debug, Serialize)]
pub struct CredentialKeyView {
    pub credential_key: String,
    pub plan_name: String,
    pub billing_cycle: BillingCycle,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub email: String,
}

/// Coordinates plan resolution, local intent records, and the provider
pub struct CheckoutService<S: EntitlementStore + ?Sized> {
    store: Arc<S>,
    stripe: Arc<StripeClient>,
    plans: PlanCatalog,
    urls: CheckoutUrls,
}

impl<S: EntitlementStore + ?Sized> CheckoutService<S> {
    pub fn new(
        store: Arc<S>,
        stripe: Arc<StripeClient>,
        plans: PlanCatalog,
        urls: CheckoutUrls,
    ) -> Self {
        Self {
            store,
            stripe,
            plans,
            urls,
        }
    }

    /// Start a checkout. Plan and price are resolved before any side
    /// effect; the pending intent is written before the provider call so
    /// a Stripe failure leaves a reconcilable local record.
    pub async fn create_checkout(&self, request: CreateCheckout) -> Result<CheckoutCreated> {
        let plan = self.plans.resolve(&request.plan)?;
        let price_id = plan.price_id(request.billing_cycle)?.to_string();

        let intent = CheckoutIntent::new(
            plan.id.clone(),
            request.billing_cycle,
            Some(request.email.clone()),
            None,
        );
        self.store.create_intent(intent.clone()).await?;

        self.start_provider_session(&intent, price_id, Some(request.email))
            .await
    }

    /// Authenticated flow. The caller may supply the correlation id;
    /// an id that already completed cannot start a new session.
    pub async fn create_checkout_for_user(
        &self,
        request: CreateUserCheckout,
    ) -> Result<CheckoutCreated> {
        let plan = self.plans.resolve(&request.plan_name)?;
        let cycle = request.billing_cycle.unwrap_or(BillingCycle::Monthly);
        let price_id = plan.price_id(cycle)?.to_string();

        let intent = match &request.intent_id {
            Some(raw) => {
                let id = Uuid::parse_str(raw)
                    .map_err(|_| Error::Validation(format!("invalid intent id: {raw}")))?;
                match self.store.intent(id).await? {
                    Some(existing) => {
                        if existing.status == CheckoutStatus::Completed {
                            return Err(Error::Validation(
                                "checkout intent already completed".into(),
                            ));
                        }
                        // The session metadata (and so the eventual key)
                        // comes from the stored intent; the charged price
                        // must refer to the same plan and cycle
                        if existing.plan_id != plan.id || existing.billing_cycle != cycle {
                            return Err(Error::Validation(
                                "checkout intent was created for a different plan or billing cycle"
                                    .into(),
                            ));
                        }
                        existing
                    }
                    None => {
                        let intent = CheckoutIntent::with_id(
                            id,
                            plan.id.clone(),
                            cycle,
                            request.email.clone(),
                            Some(request.user_id.clone()),
                        );
                        self.store.create_intent(intent.clone()).await?;
                        intent
                    }
                }
            }
            None => {
                let intent = CheckoutIntent::new(
                    plan.id.clone(),
                    cycle,
                    request.email.clone(),
                    Some(request.user_id.clone()),
                );
                self.store.create_intent(intent.clone()).await?;
                intent
            }
        };

        self.start_provider_session(&intent, price_id, request.email)
            .await
    }

    async fn start_provider_session(
        &self,
        intent: &CheckoutIntent,
        price_id: String,
        customer_email: Option<String>,
    ) -> Result<CheckoutCreated> {
        let session = self
            .stripe
            .create_session(&SessionArgs {
                price_id,
                customer_email,
                success_url: self.urls.success_url.clone(),
                cancel_url: self.urls.cancel_url.clone(),
                metadata: session_metadata(intent),
            })
            .await?;

        self.store
            .attach_provider_session(intent.id, &session.id)
            .await?;

        tracing::info!(
            intent_id = %intent.id,
            session_id = %session.id,
            plan = %intent.plan_id,
            "created checkout session"
        );

        Ok(CheckoutCreated {
            session_id: session.id,
            url: session.url,
        })
    }

    /// Resolve the credential key for a completed session. If the local
    /// record is stale (webhook not yet processed), reconcile against the
    /// provider and issue the key here — issuance is idempotent, so a
    /// webhook racing this call still yields a single key.
    pub async fn credential_key_for_session(&self, session_id: &str) -> Result<CredentialKeyView> {
        let intent = self
            .store
            .intent_by_session(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let key = match intent.status {
            CheckoutStatus::Completed => {
                let key_id = intent.credential_key_id.ok_or_else(|| {
                    Error::Storage(format!("completed intent {} has no key", intent.id))
                })?;
                self.store
                    .credential_key_by_id(key_id)
                    .await?
                    .ok_or(Error::KeyNotFound)?
            }
            CheckoutStatus::Expired => return Err(Error::SessionExpired),
            CheckoutStatus::Pending | CheckoutStatus::Created => {
                let snapshot = self.stripe.retrieve_session(session_id).await?;
                if !snapshot.paid {
                    return Err(Error::SessionNotCompleted);
                }

                let email = intent
                    .email
                    .clone()
                    .or_else(|| snapshot.customer_email.clone())
                    .ok_or_else(|| Error::Validation("no purchaser email on session".into()))?;

                tracing::info!(
                    intent_id = %intent.id,
                    session_id,
                    "local record stale for paid session, reconciling"
                );

                let outcome = self
                    .store
                    .complete_checkout(
                        intent.id,
                        IssueKey {
                            email,
                            plan_id: intent.plan_id.clone(),
                            billing_cycle: intent.billing_cycle,
                            provider_customer_id: snapshot.customer_id,
                            provider_subscription_id: snapshot.subscription_id,
                        },
                    )
                    .await?;
                outcome.key
            }
        };

        let plan_name = self
            .plans
            .get(&key.plan_id)
            .map_or_else(|| key.plan_id.clone(), |p| p.name.clone());

        Ok(CredentialKeyView {
            credential_key: key.key.to_string(),
            plan_name,
            billing_cycle: key.billing_cycle,
            expires_at: key.expires_at,
            email: key.email,
        })
    }
}

fn session_metadata(intent: &CheckoutIntent) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert(META_CHECKOUT_ID.to_string(), intent.id.to_string());
    metadata.insert(META_PLAN.to_string(), intent.plan_id.clone());
    metadata.insert(
        META_BILLING_CYCLE.to_string(),
        intent.billing_cycle.as_str().to_string(),
    );
    if let Some(email) = &intent.email {
        metadata.insert(META_EMAIL.to_string(), email.clone());
    }
    if let Some(user_id) = &intent.user_id {
        metadata.insert(META_USER_ID.to_string(), user_id.clone());
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_core::{MemoryEntitlementStore, Plan};

    fn service(plans: PlanCatalog) -> CheckoutService<MemoryEntitlementStore> {
        service_with_store(Arc::new(MemoryEntitlementStore::new()), plans)
    }

    fn service_with_store(
        store: Arc<MemoryEntitlementStore>,
        plans: PlanCatalog,
    ) -> CheckoutService<MemoryEntitlementStore> {
        CheckoutService::new(
            store,
            Arc::new(StripeClient::new("sk_test_dummy", "whsec_dummy")),
            plans,
            CheckoutUrls {
                success_url: "http://localhost/success".into(),
                cancel_url: "http://localhost/pricing".into(),
            },
        )
    }

    fn one_plan_catalog() -> PlanCatalog {
        PlanCatalog::new(vec![Plan {
            id: "starter".into(),
            name: "Starter".into(),
            monthly_cents: 900,
            yearly_cents: 9000,
            monthly_price_id: Some("price_m".into()),
            yearly_price_id: None,
        }])
    }

    #[tokio::test]
    async fn test_unknown_plan_fails_before_any_call() {
        let svc = service(one_plan_catalog());
        let err = svc
            .create_checkout(CreateCheckout {
                email: "a@x.com".into(),
                plan: "enterprise".into(),
                billing_cycle: BillingCycle::Monthly,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PlanNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_price_fails_before_any_call() {
        let svc = service(one_plan_catalog());
        let err = svc
            .create_checkout(CreateCheckout {
                email: "a@x.com".into(),
                plan: "starter".into(),
                billing_cycle: BillingCycle::Yearly,
            })
            .await
            .unwrap_err();
        // A Provider error here would mean Stripe was contacted
        assert!(matches!(err, Error::PriceNotConfigured { .. }));
    }

    #[tokio::test]
    async fn test_user_flow_rejects_bad_intent_id() {
        let svc = service(one_plan_catalog());
        let err = svc
            .create_checkout_for_user(CreateUserCheckout {
                plan_name: "Starter".into(),
                user_id: "user_1".into(),
                intent_id: Some("not-a-uuid".into()),
                email: None,
                billing_cycle: Some(BillingCycle::Monthly),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_user_flow_rejects_plan_change_on_reused_intent() {
        let store = Arc::new(MemoryEntitlementStore::new());
        let plans = PlanCatalog::new(vec![
            Plan {
                id: "starter".into(),
                name: "Starter".into(),
                monthly_cents: 900,
                yearly_cents: 9000,
                monthly_price_id: Some("price_starter_m".into()),
                yearly_price_id: None,
            },
            Plan {
                id: "pro".into(),
                name: "Pro".into(),
                monthly_cents: 2900,
                yearly_cents: 29000,
                monthly_price_id: Some("price_pro_m".into()),
                yearly_price_id: None,
            },
        ]);
        let svc = service_with_store(store.clone(), plans);

        let intent = CheckoutIntent::new(
            "starter",
            BillingCycle::Monthly,
            None,
            Some("user_1".into()),
        );
        let intent_id = intent.id;
        store.create_intent(intent).await.unwrap();

        // Reusing the intent with a different plan would charge one plan
        // and issue a key for another
        let err = svc
            .create_checkout_for_user(CreateUserCheckout {
                plan_name: "Pro".into(),
                user_id: "user_1".into(),
                intent_id: Some(intent_id.to_string()),
                email: None,
                billing_cycle: Some(BillingCycle::Monthly),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // The stored intent is untouched
        let stored = store.intent(intent_id).await.unwrap().unwrap();
        assert_eq!(stored.plan_id, "starter");
    }

    #[test]
    fn test_session_metadata_carries_correlation_fields() {
        let intent = CheckoutIntent::new(
            "starter",
            BillingCycle::Yearly,
            Some("a@x.com".into()),
            Some("user_1".into()),
        );
        let metadata = session_metadata(&intent);
        assert_eq!(metadata.get(META_CHECKOUT_ID).unwrap(), &intent.id.to_string());
        assert_eq!(metadata.get(META_PLAN).unwrap(), "starter");
        assert_eq!(metadata.get(META_BILLING_CYCLE).unwrap(), "yearly");
        assert_eq!(metadata.get(META_EMAIL).unwrap(), "a@x.com");
        assert_eq!(metadata.get(META_USER_ID).unwrap(), "user_1");
    }
}
