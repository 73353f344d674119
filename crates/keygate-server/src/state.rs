//! Application State

use std::sync::Arc;

use keygate_core::{EntitlementStore, PlanCatalog};
use keygate_payments::{CheckoutService, StripeClient};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Durable entitlement state (memory or postgres)
    pub store: Arc<dyn EntitlementStore>,

    /// Plan catalog with provider price references
    pub plans: Arc<PlanCatalog>,

    /// Stripe client (None if not configured)
    pub stripe: Option<Arc<StripeClient>>,

    /// Checkout orchestration (None if Stripe is not configured)
    pub checkout: Option<Arc<CheckoutService<dyn EntitlementStore>>>,
}
