//! HTTP Handlers
//!
//! Thin request-handling glue: validate input, call the checkout service
//! or the store, shape a JSON response. Business-rule violations map to
//! 4xx with a `{ success: false, error }` body; infrastructure failures
//! map to 5xx so the provider's retry policy can do its work.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keygate_core::{BillingCycle, Error, Profile, RedeemRequest};
use keygate_payments::{CreateCheckout, CreateUserCheckout, CredentialKeyView, WebhookHandler};

use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub store: &'static str,
    pub stripe_configured: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutBody {
    pub email: String,
    pub plan_id: String,
    pub billing_cycle: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutSessionBody {
    pub plan_name: String,
    pub user_id: String,
    pub intent_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub billing_cycle: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct CredentialKeyQuery {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RedeemBody {
    pub credential_key: String,
    pub email: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RedeemResponse {
    pub success: bool,
    pub plan_id: String,
    pub plan_name: String,
    pub billing_cycle: BillingCycle,
    pub expires_at: DateTime<Utc>,
    pub profile_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct LinkProfileBody {
    pub profile_id: String,
    pub auth_user_id: String,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

type HandlerError = (StatusCode, Json<ErrorBody>);

fn error_response(err: &Error) -> HandlerError {
    let status = match err {
        Error::PlanNotFound(_)
        | Error::SessionNotFound(_)
        | Error::SessionNotCompleted
        | Error::KeyNotFound
        | Error::ProfileNotFound(_) => StatusCode::NOT_FOUND,
        Error::AlreadyRedeemed | Error::ProfileAlreadyLinked(_) => StatusCode::CONFLICT,
        Error::EmailMismatch => StatusCode::FORBIDDEN,
        Error::KeyExpired | Error::SessionExpired => StatusCode::GONE,
        Error::PriceNotConfigured { .. } | Error::Validation(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Error::SignatureInvalid(_) => StatusCode::BAD_REQUEST,
        Error::Provider(_) => StatusCode::BAD_GATEWAY,
        Error::Storage(_) | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }

    (
        status,
        Json(ErrorBody {
            success: false,
            error: err.user_message(),
        }),
    )
}

fn payments_disabled() -> HandlerError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorBody {
            success: false,
            error: "Payments not configured".into(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        store: state.store.kind(),
        stripe_configured: state.stripe.is_some(),
    })
}

/// Start a checkout for an anonymous purchaser
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(body): Json<CreateCheckoutBody>,
) -> Result<Json<CheckoutResponse>, HandlerError> {
    let checkout = state.checkout.as_ref().ok_or_else(payments_disabled)?;
    let billing_cycle =
        BillingCycle::parse(&body.billing_cycle).map_err(|e| error_response(&e))?;

    let created = checkout
        .create_checkout(CreateCheckout {
            email: body.email,
            plan: body.plan_id,
            billing_cycle,
        })
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(CheckoutResponse {
        session_id: created.session_id,
        url: created.url,
    }))
}

/// Start a checkout for an authenticated user, plan by name
pub async fn create_checkout_session(
    State(state): State<AppState>,
    Json(body): Json<CreateCheckoutSessionBody>,
) -> Result<Json<CheckoutResponse>, HandlerError> {
    let checkout = state.checkout.as_ref().ok_or_else(payments_disabled)?;
    let billing_cycle = body
        .billing_cycle
        .as_deref()
        .map(BillingCycle::parse)
        .transpose()
        .map_err(|e| error_response(&e))?;

    let created = checkout
        .create_checkout_for_user(CreateUserCheckout {
            plan_name: body.plan_name,
            user_id: body.user_id,
            intent_id: body.intent_id,
            email: body.email,
            billing_cycle,
        })
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(CheckoutResponse {
        session_id: created.session_id,
        url: created.url,
    }))
}

/// Resolve the credential key for a completed session, reconciling
/// against the provider when the local record is stale
pub async fn get_credential_key(
    State(state): State<AppState>,
    Query(query): Query<CredentialKeyQuery>,
) -> Result<Json<CredentialKeyView>, HandlerError> {
    let checkout = state.checkout.as_ref().ok_or_else(payments_disabled)?;

    let view = checkout
        .credential_key_for_session(&query.session_id)
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(view))
}

/// Redeem a credential key (one-time)
pub async fn redeem(
    State(state): State<AppState>,
    Json(body): Json<RedeemBody>,
) -> Result<Json<RedeemResponse>, HandlerError> {
    let outcome = state
        .store
        .redeem_key(RedeemRequest {
            key: body.credential_key,
            email: body.email,
            user_id: body.user_id,
        })
        .await
        .map_err(|e| error_response(&e))?;

    tracing::info!(
        key_id = %outcome.key.id,
        profile_id = %outcome.profile.id,
        "credential key redeemed"
    );

    let plan_name = state
        .plans
        .get(&outcome.key.plan_id)
        .map_or_else(|| outcome.key.plan_id.clone(), |p| p.name.clone());

    Ok(Json(RedeemResponse {
        success: true,
        plan_id: outcome.key.plan_id,
        plan_name,
        billing_cycle: outcome.key.billing_cycle,
        expires_at: outcome.key.expires_at,
        profile_id: outcome.profile.id,
    }))
}

/// Bind a passwordless profile to a newly created account
pub async fn link_profile(
    State(state): State<AppState>,
    Json(body): Json<LinkProfileBody>,
) -> Result<Json<Profile>, HandlerError> {
    let profile_id = Uuid::parse_str(&body.profile_id).map_err(|_| {
        error_response(&Error::Validation(format!(
            "invalid profile id: {}",
            body.profile_id
        )))
    })?;

    let profile = state
        .store
        .link_profile(profile_id, &body.auth_user_id)
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(profile))
}

/// Stripe webhook endpoint. The signature is verified over the raw body
/// before any field is trusted.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookAck>, HandlerError> {
    let stripe = state.stripe.as_ref().ok_or_else(payments_disabled)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            error_response(&Error::SignatureInvalid("missing signature header".into()))
        })?;

    let handler = WebhookHandler::new(state.store.clone());

    let event = handler
        .parse_event(&body, signature, stripe.webhook_secret())
        .map_err(|e| {
            tracing::warn!(error = %e, "webhook signature verification failed");
            error_response(&e)
        })?;

    handler.handle(event).await.map_err(|e| error_response(&e))?;

    Ok(Json(WebhookAck { received: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let (status, _) = error_response(&Error::EmailMismatch);
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = error_response(&Error::AlreadyRedeemed);
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = error_response(&Error::KeyExpired);
        assert_eq!(status, StatusCode::GONE);

        let (status, _) = error_response(&Error::KeyNotFound);
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = error_response(&Error::Provider("boom".into()));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_body_shape() {
        let (_, Json(body)) = error_response(&Error::EmailMismatch);
        assert!(!body.success);
        assert_eq!(body.error, "Email does not match the credential key");
    }
}
