//! Stripe Webhook Handling
//!
//! The webhook channel is the only path that moves provider state into
//! local entitlement state. Delivery is at-least-once, so every branch is
//! idempotent; a database failure is surfaced so the provider retries,
//! while malformed events are logged and acknowledged to stop the retry
//! loop.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use stripe::{Event, EventObject, EventType, Webhook};
use uuid::Uuid;

use keygate_core::{
    BillingCycle, EntitlementStore, Error, IssueKey, Result, SubscriptionRecord,
};

use crate::checkout::{META_BILLING_CYCLE, META_CHECKOUT_ID, META_EMAIL, META_PLAN};

/// Parsed webhook event
#[derive(Clone, Debug)]
pub enum WebhookEvent {
    /// Checkout completed - issue the credential key
    CheckoutCompleted {
        session_id: String,
        checkout_id: Uuid,
        email: String,
        plan_id: String,
        billing_cycle: BillingCycle,
        customer_id: Option<String>,
        subscription_id: Option<String>,
    },

    /// Checkout session expired before payment
    CheckoutExpired {
        session_id: String,
        checkout_id: Option<Uuid>,
    },

    /// Subscription created or updated - mirror provider state
    SubscriptionChanged { record: SubscriptionRecord },

    /// Subscription deleted - mark canceled, keep the row
    SubscriptionCanceled {
        subscription_id: String,
        canceled_at: DateTime<Utc>,
    },

    /// Recognized kind but required fields are missing; logged and acked
    Malformed {
        event_type: String,
        reason: String,
    },

    /// Unhandled event type
    Other { event_type: String },
}

/// Webhook handler
pub struct WebhookHandler<S: EntitlementStore + ?Sized> {
    store: Arc<S>,
}

impl<S: EntitlementStore + ?Sized> WebhookHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Verify the signature over the raw body and parse the event.
    /// Nothing in the payload is trusted before this succeeds.
    pub fn parse_event(&self, payload: &str, signature: &str, secret: &str) -> Result<Event> {
        Webhook::construct_event(payload, signature, secret)
            .map_err(|e| Error::SignatureInvalid(e.to_string()))
    }

    /// Process a verified event
    pub async fn handle(&self, event: Event) -> Result<WebhookEvent> {
        tracing::info!(event_type = ?event.type_, event_id = %event.id, "processing Stripe webhook");
        let parsed = classify(&event);
        self.apply(&parsed).await?;
        Ok(parsed)
    }

    /// Apply a parsed event to the store
    pub async fn apply(&self, event: &WebhookEvent) -> Result<()> {
        match event {
            WebhookEvent::CheckoutCompleted {
                session_id,
                checkout_id,
                email,
                plan_id,
                billing_cycle,
                customer_id,
                subscription_id,
            } => {
                let issue = IssueKey {
                    email: email.clone(),
                    plan_id: plan_id.clone(),
                    billing_cycle: *billing_cycle,
                    provider_customer_id: customer_id.clone(),
                    provider_subscription_id: subscription_id.clone(),
                };

                match self.store.complete_checkout(*checkout_id, issue).await {
                    Ok(outcome) if outcome.newly_issued => {
                        tracing::info!(
                            key_id = %outcome.key.id,
                            email = %email,
                            plan = %plan_id,
                            "issued credential key"
                        );
                    }
                    Ok(_) => {
                        tracing::info!(
                            checkout_id = %checkout_id,
                            "duplicate delivery, checkout already completed"
                        );
                    }
                    // A completion we cannot apply will not become
                    // applicable on retry; acknowledge it
                    Err(e @ (Error::SessionNotFound(_) | Error::SessionExpired)) => {
                        tracing::warn!(
                            checkout_id = %checkout_id,
                            session_id = %session_id,
                            error = %e,
                            "cannot apply checkout completion"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            WebhookEvent::CheckoutExpired {
                session_id,
                checkout_id,
            } => {
                let intent = match checkout_id {
                    Some(id) => self.store.intent(*id).await?,
                    None => self.store.intent_by_session(session_id).await?,
                };
                match intent {
                    // No-op if the checkout already completed
                    Some(intent) => self.store.expire_checkout(intent.id).await?,
                    None => {
                        tracing::debug!(session_id = %session_id, "expiry for unknown checkout");
                    }
                }
            }

            WebhookEvent::SubscriptionChanged { record } => {
                if self
                    .store
                    .subscription(&record.provider_subscription_id)
                    .await?
                    .is_none()
                {
                    tracing::warn!(
                        subscription_id = %record.provider_subscription_id,
                        "update for unknown subscription, creating mirror row"
                    );
                }
                self.store.upsert_subscription(record.clone()).await?;
                tracing::info!(
                    subscription_id = %record.provider_subscription_id,
                    status = %record.status,
                    "mirrored subscription state"
                );
            }

            WebhookEvent::SubscriptionCanceled {
                subscription_id,
                canceled_at,
            } => {
                self.store
                    .cancel_subscription(subscription_id, *canceled_at)
                    .await?;
                tracing::info!(subscription_id = %subscription_id, "subscription canceled");
            }

            WebhookEvent::Malformed { event_type, reason } => {
                tracing::warn!(
                    event_type = %event_type,
                    reason = %reason,
                    "malformed webhook event, acknowledging without action"
                );
            }

            WebhookEvent::Other { event_type } => {
                tracing::debug!(event_type = %event_type, "unhandled webhook event");
            }
        }
        Ok(())
    }
}

/// Classify a Stripe event into our event type
fn classify(event: &Event) -> WebhookEvent {
    match event.type_ {
        EventType::CheckoutSessionCompleted => {
            if let EventObject::CheckoutSession(session) = &event.data.object {
                let metadata = session.metadata.clone().unwrap_or_default();

                let checkout_id = metadata
                    .get(META_CHECKOUT_ID)
                    .and_then(|s| Uuid::parse_str(s).ok());
                let email = metadata
                    .get(META_EMAIL)
                    .cloned()
                    .or_else(|| session.customer_email.clone());
                let plan_id = metadata.get(META_PLAN).cloned();
                let billing_cycle = metadata
                    .get(META_BILLING_CYCLE)
                    .and_then(|s| BillingCycle::parse(s).ok());

                match (checkout_id, email, plan_id, billing_cycle) {
                    (Some(checkout_id), Some(email), Some(plan_id), Some(billing_cycle)) => {
                        WebhookEvent::CheckoutCompleted {
                            session_id: session.id.to_string(),
                            checkout_id,
                            email,
                            plan_id,
                            billing_cycle,
                            customer_id: session.customer.as_ref().map(|c| c.id().to_string()),
                            subscription_id: session
                                .subscription
                                .as_ref()
                                .map(|s| s.id().to_string()),
                        }
                    }
                    _ => WebhookEvent::Malformed {
                        event_type: "checkout.session.completed".into(),
                        reason: "missing correlation metadata".into(),
                    },
                }
            } else {
                WebhookEvent::Malformed {
                    event_type: "checkout.session.completed".into(),
                    reason: "unexpected event object".into(),
                }
            }
        }

        EventType::CheckoutSessionExpired => {
            if let EventObject::CheckoutSession(session) = &event.data.object {
                WebhookEvent::CheckoutExpired {
                    session_id: session.id.to_string(),
                    checkout_id: session
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get(META_CHECKOUT_ID))
                        .and_then(|s| Uuid::parse_str(s).ok()),
                }
            } else {
                WebhookEvent::Malformed {
                    event_type: "checkout.session.expired".into(),
                    reason: "unexpected event object".into(),
                }
            }
        }

        EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
            if let EventObject::Subscription(sub) = &event.data.object {
                WebhookEvent::SubscriptionChanged {
                    record: SubscriptionRecord {
                        provider_subscription_id: sub.id.to_string(),
                        provider_customer_id: Some(sub.customer.id().to_string()),
                        status: sub.status.to_string(),
                        current_period_start: timestamp(sub.current_period_start),
                        current_period_end: timestamp(sub.current_period_end),
                        canceled_at: sub.canceled_at.and_then(timestamp),
                        updated_at: Utc::now(),
                    },
                }
            } else {
                WebhookEvent::Malformed {
                    event_type: format!("{:?}", event.type_),
                    reason: "unexpected event object".into(),
                }
            }
        }

        EventType::CustomerSubscriptionDeleted => {
            if let EventObject::Subscription(sub) = &event.data.object {
                WebhookEvent::SubscriptionCanceled {
                    subscription_id: sub.id.to_string(),
                    canceled_at: sub.canceled_at.and_then(timestamp).unwrap_or_else(Utc::now),
                }
            } else {
                WebhookEvent::Malformed {
                    event_type: "customer.subscription.deleted".into(),
                    reason: "unexpected event object".into(),
                }
            }
        }

        _ => WebhookEvent::Other {
            event_type: format!("{:?}", event.type_),
        },
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_core::{CheckoutIntent, CheckoutStatus, MemoryEntitlementStore};

    fn completed_event(checkout_id: Uuid) -> WebhookEvent {
        WebhookEvent::CheckoutCompleted {
            session_id: "cs_test_1".into(),
            checkout_id,
            email: "a@x.com".into(),
            plan_id: "starter".into(),
            billing_cycle: BillingCycle::Monthly,
            customer_id: Some("cus_1".into()),
            subscription_id: Some("sub_1".into()),
        }
    }

    async fn store_with_intent() -> (Arc<MemoryEntitlementStore>, Uuid) {
        let store = Arc::new(MemoryEntitlementStore::new());
        let intent = CheckoutIntent::new(
            "starter",
            BillingCycle::Monthly,
            Some("a@x.com".into()),
            None,
        );
        let id = intent.id;
        store.create_intent(intent).await.unwrap();
        store
            .attach_provider_session(id, "cs_test_1")
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_duplicate_completed_creates_one_key() {
        let (store, checkout_id) = store_with_intent().await;
        let handler = WebhookHandler::new(store.clone());
        let event = completed_event(checkout_id);

        handler.apply(&event).await.unwrap();
        handler.apply(&event).await.unwrap();

        let intent = store.intent(checkout_id).await.unwrap().unwrap();
        assert_eq!(intent.status, CheckoutStatus::Completed);
        let key_id = intent.credential_key_id.unwrap();
        let key = store.credential_key_by_id(key_id).await.unwrap().unwrap();
        assert_eq!(key.email, "a@x.com");
        assert!(!key.is_redeemed);
    }

    #[tokio::test]
    async fn test_completed_for_unknown_checkout_is_acked() {
        let store = Arc::new(MemoryEntitlementStore::new());
        let handler = WebhookHandler::new(store);
        let event = completed_event(Uuid::new_v4());
        // Unknown correlation id must not bounce into the retry loop
        assert!(handler.apply(&event).await.is_ok());
    }

    #[tokio::test]
    async fn test_expiry_after_completion_never_downgrades() {
        let (store, checkout_id) = store_with_intent().await;
        let handler = WebhookHandler::new(store.clone());

        handler.apply(&completed_event(checkout_id)).await.unwrap();
        handler
            .apply(&WebhookEvent::CheckoutExpired {
                session_id: "cs_test_1".into(),
                checkout_id: Some(checkout_id),
            })
            .await
            .unwrap();

        let intent = store.intent(checkout_id).await.unwrap().unwrap();
        assert_eq!(intent.status, CheckoutStatus::Completed);
    }

    #[tokio::test]
    async fn test_expiry_marks_unpaid_checkout() {
        let (store, checkout_id) = store_with_intent().await;
        let handler = WebhookHandler::new(store.clone());

        handler
            .apply(&WebhookEvent::CheckoutExpired {
                session_id: "cs_test_1".into(),
                checkout_id: None, // resolve via the session id
            })
            .await
            .unwrap();

        let intent = store.intent(checkout_id).await.unwrap().unwrap();
        assert_eq!(intent.status, CheckoutStatus::Expired);
    }

    #[tokio::test]
    async fn test_malformed_event_is_acked() {
        let store = Arc::new(MemoryEntitlementStore::new());
        let handler = WebhookHandler::new(store);
        assert!(
            handler
                .apply(&WebhookEvent::Malformed {
                    event_type: "checkout.session.completed".into(),
                    reason: "missing correlation metadata".into(),
                })
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_subscription_lifecycle_mirroring() {
        let store = Arc::new(MemoryEntitlementStore::new());
        let handler = WebhookHandler::new(store.clone());

        handler
            .apply(&WebhookEvent::SubscriptionChanged {
                record: SubscriptionRecord {
                    provider_subscription_id: "sub_1".into(),
                    provider_customer_id: Some("cus_1".into()),
                    status: "active".into(),
                    current_period_start: Some(Utc::now()),
                    current_period_end: None,
                    canceled_at: None,
                    updated_at: Utc::now(),
                },
            })
            .await
            .unwrap();

        handler
            .apply(&WebhookEvent::SubscriptionCanceled {
                subscription_id: "sub_1".into(),
                canceled_at: Utc::now(),
            })
            .await
            .unwrap();

        let record = store.subscription("sub_1").await.unwrap().unwrap();
        assert!(record.is_canceled());
        assert!(record.canceled_at.is_some());
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let store = Arc::new(MemoryEntitlementStore::new());
        let handler = WebhookHandler::new(store);
        let result = handler.parse_event("{}", "t=1,v1=deadbeef", "whsec_test");
        assert!(result.is_err());
    }
}
