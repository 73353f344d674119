//! # keygate-payments
//!
//! Stripe integration for the keygate checkout and entitlement flow.
//!
//! ## Integration shape
//!
//! This crate uses Stripe Checkout (Hosted): the client is redirected to
//! Stripe's hosted page, payment completion comes back asynchronously
//! over the signed webhook channel, and the credential key is retrieved
//! afterwards by session id.
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌─────────────┐
//! │  Your Site  │────▶│  Stripe Hosted  │────▶│  Your Site  │
//! │  (pricing)  │     │  Checkout Page  │     │  (success)  │
//! └─────────────┘     └────────┬────────┘     └──────┬──────┘
//!                              │ webhook             │ poll
//!                              ▼                     ▼
//!                     ┌─────────────────┐    ┌───────────────┐
//!                     │ issue credential│───▶│ credential key│
//!                     │  key (exactly 1)│    │  by session   │
//!                     └─────────────────┘    └───────────────┘
//! ```
//!
//! Correlation between the provider session and the local checkout
//! intent travels as opaque metadata on the session, because the session
//! id is not known until the provider call returns.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keygate_payments::{CheckoutService, CheckoutUrls, CreateCheckout, StripeClient};
//!
//! let stripe = StripeClient::new("sk_test_xxx", "whsec_xxx");
//! let service = CheckoutService::new(store, Arc::new(stripe), plans, CheckoutUrls::from_env());
//!
//! let created = service.create_checkout(CreateCheckout {
//!     email: "user@example.com".into(),
//!     plan: "starter".into(),
//!     billing_cycle: BillingCycle::Monthly,
//! }).await?;
//!
//! // Redirect user to: created.url
//! ```

mod checkout;
mod webhook;

pub use checkout::{
    CheckoutCreated, CheckoutService, CheckoutUrls, CreateCheckout, CreateUserCheckout,
    CredentialKeyView, StripeClient,
};
pub use webhook::{WebhookEvent, WebhookHandler};
