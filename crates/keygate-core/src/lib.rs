//! # keygate-core
//!
//! Domain model and storage abstraction for the keygate checkout and
//! entitlement flow.
//!
//! ## The flow
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌──────────────┐
//! │   Client    │────▶│  Hosted Stripe  │────▶│   Webhook    │
//! │  (pricing)  │     │  Checkout Page  │     │  (completed) │
//! └─────────────┘     └─────────────────┘     └──────┬───────┘
//!                                                    │ issue key
//!                                                    ▼
//! ┌─────────────┐     ┌─────────────────┐     ┌──────────────┐
//! │   Account   │◀────│     Redeem      │◀────│  Credential  │
//! │  (profile)  │     │   (one-time)    │     │     Key      │
//! └─────────────┘     └─────────────────┘     └──────────────┘
//! ```
//!
//! A local checkout intent is created before the provider call so a
//! correlation id exists even if that call fails. The webhook channel is
//! the only path that moves provider state into local entitlement state;
//! every handler tolerates at-least-once delivery. A credential key is
//! issued exactly once per completed checkout and redeemed exactly once.

mod checkout;
mod credential;
mod error;
mod plan;
mod profile;
mod store;
mod subscription;

pub use checkout::{CheckoutIntent, CheckoutStatus};
pub use credential::{CredentialKey, IssueKey, KeyString};
pub use error::{Error, Result};
pub use plan::{BillingCycle, Plan, PlanCatalog};
pub use profile::Profile;
pub use store::{
    EntitlementStore, IssueOutcome, MemoryEntitlementStore, RedeemOutcome, RedeemRequest,
};
pub use subscription::SubscriptionRecord;
