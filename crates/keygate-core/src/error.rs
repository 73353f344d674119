//! Entitlement Error Types

use thiserror::Error;

use crate::plan::BillingCycle;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the checkout and entitlement flow
#[derive(Error, Debug)]
pub enum Error {
    /// No plan matches the given id or name
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    /// The plan exists but has no provider price for the requested cycle
    #[error("Plan '{plan}' has no {cycle} price configured")]
    PriceNotConfigured { plan: String, cycle: BillingCycle },

    /// No local checkout record for the given id or provider session
    #[error("Checkout session not found: {0}")]
    SessionNotFound(String),

    /// The checkout exists but the provider has not reported payment yet
    #[error("Checkout session is not completed yet")]
    SessionNotCompleted,

    /// The checkout expired before payment completed
    #[error("Checkout session has expired")]
    SessionExpired,

    /// Credential key string does not match any issued key
    #[error("Credential key not found")]
    KeyNotFound,

    /// Credential key was already redeemed
    #[error("Credential key has already been redeemed")]
    AlreadyRedeemed,

    /// Redemption email does not match the key's owning email
    #[error("Email does not match the credential key")]
    EmailMismatch,

    /// Credential key passed its expiry before redemption
    #[error("Credential key has expired")]
    KeyExpired,

    /// Profile row missing
    #[error("Profile not found: {0}")]
    ProfileNotFound(uuid::Uuid),

    /// Profile is already bound to a different account subject
    #[error("Profile {0} is already linked to a different account")]
    ProfileAlreadyLinked(uuid::Uuid),

    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    SignatureInvalid(String),

    /// Request is missing or has malformed required fields
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Payment provider call failed
    #[error("Payment provider error: {0}")]
    Provider(String),

    /// Database call failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the provider should retry delivery after seeing this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Provider(_) | Error::Storage(_))
    }

    /// Message safe to show to an end user. Business-rule violations keep
    /// their own wording; infrastructure failures are collapsed to a
    /// generic message so internals never leak into responses.
    pub fn user_message(&self) -> String {
        match self {
            Error::Provider(_) => "Payment processing failed. Please try again.".into(),
            Error::Storage(_) => "An error occurred processing your request.".into(),
            Error::Config(_) => "Service configuration error.".into(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_mismatch_message() {
        assert_eq!(
            Error::EmailMismatch.user_message(),
            "Email does not match the credential key"
        );
    }

    #[test]
    fn test_infrastructure_errors_are_retryable() {
        assert!(Error::Storage("connection reset".into()).is_retryable());
        assert!(Error::Provider("timeout".into()).is_retryable());
        assert!(!Error::AlreadyRedeemed.is_retryable());
    }

    #[test]
    fn test_storage_details_do_not_leak() {
        let msg = Error::Storage("password=hunter2".into()).user_message();
        assert!(!msg.contains("hunter2"));
    }
}
