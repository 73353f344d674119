//! Plan Catalog
//!
//! Purchasable tiers and their provider price references. A checkout can
//! only start once the resolved plan carries a price id for the requested
//! billing cycle.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Billing recurrence, which also determines entitlement expiry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" => Ok(BillingCycle::Yearly),
            other => Err(Error::Validation(format!("unknown billing cycle: {other}"))),
        }
    }

    /// Entitlement expiry from issuance time: one calendar month or one
    /// calendar year, not a fixed number of days.
    pub fn expiry_from(self, issued_at: DateTime<Utc>) -> DateTime<Utc> {
        let months = match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Yearly => 12,
        };
        // Only fails at the edge of representable time
        issued_at
            .checked_add_months(Months::new(months))
            .unwrap_or(issued_at)
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A purchasable tier
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub monthly_cents: i64,
    pub yearly_cents: i64,
    /// Provider price reference for monthly billing
    pub monthly_price_id: Option<String>,
    /// Provider price reference for yearly billing
    pub yearly_price_id: Option<String>,
}

impl Plan {
    /// Resolve the provider price reference for a cycle
    pub fn price_id(&self, cycle: BillingCycle) -> Result<&str> {
        let price = match cycle {
            BillingCycle::Monthly => self.monthly_price_id.as_deref(),
            BillingCycle::Yearly => self.yearly_price_id.as_deref(),
        };
        price.ok_or_else(|| Error::PriceNotConfigured {
            plan: self.id.clone(),
            cycle,
        })
    }
}

/// The set of plans available for purchase
#[derive(Clone, Debug, Default)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self { plans }
    }

    /// Built-in tiers with price references read from
    /// `STRIPE_PRICE_<PLAN>_<CYCLE>` environment variables. A missing
    /// variable leaves that cycle unpurchasable rather than failing boot.
    pub fn from_env() -> Self {
        let price = |plan: &str, cycle: &str| {
            std::env::var(format!(
                "STRIPE_PRICE_{}_{}",
                plan.to_uppercase(),
                cycle.to_uppercase()
            ))
            .ok()
        };

        Self::new(vec![
            Plan {
                id: "starter".into(),
                name: "Starter".into(),
                monthly_cents: 900,
                yearly_cents: 9000,
                monthly_price_id: price("starter", "monthly"),
                yearly_price_id: price("starter", "yearly"),
            },
            Plan {
                id: "pro".into(),
                name: "Pro".into(),
                monthly_cents: 2900,
                yearly_cents: 29000,
                monthly_price_id: price("pro", "monthly"),
                yearly_price_id: price("pro", "yearly"),
            },
            Plan {
                id: "business".into(),
                name: "Business".into(),
                monthly_cents: 9900,
                yearly_cents: 99000,
                monthly_price_id: price("business", "monthly"),
                yearly_price_id: price("business", "yearly"),
            },
        ])
    }

    /// Resolve a plan by id or display name, case-insensitively
    pub fn resolve(&self, plan_ref: &str) -> Result<&Plan> {
        self.plans
            .iter()
            .find(|p| {
                p.id.eq_ignore_ascii_case(plan_ref) || p.name.eq_ignore_ascii_case(plan_ref)
            })
            .ok_or_else(|| Error::PlanNotFound(plan_ref.to_string()))
    }

    /// Look up by exact plan id
    pub fn get(&self, id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == id)
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn catalog() -> PlanCatalog {
        PlanCatalog::new(vec![Plan {
            id: "starter".into(),
            name: "Starter".into(),
            monthly_cents: 900,
            yearly_cents: 9000,
            monthly_price_id: Some("price_starter_m".into()),
            yearly_price_id: None,
        }])
    }

    #[test]
    fn test_resolve_by_id_and_name() {
        let c = catalog();
        assert_eq!(c.resolve("starter").unwrap().name, "Starter");
        assert_eq!(c.resolve("STARTER").unwrap().id, "starter");
        assert_eq!(c.resolve("Starter").unwrap().id, "starter");
    }

    #[test]
    fn test_unknown_plan() {
        assert!(matches!(
            catalog().resolve("enterprise"),
            Err(Error::PlanNotFound(_))
        ));
    }

    #[test]
    fn test_missing_price_for_cycle() {
        let c = catalog();
        let plan = c.resolve("starter").unwrap();
        assert_eq!(plan.price_id(BillingCycle::Monthly).unwrap(), "price_starter_m");
        assert!(matches!(
            plan.price_id(BillingCycle::Yearly),
            Err(Error::PriceNotConfigured { .. })
        ));
    }

    #[test]
    fn test_calendar_expiry() {
        let issued = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        // January 31 + 1 month clamps to February 29 (leap year)
        let monthly = BillingCycle::Monthly.expiry_from(issued);
        assert_eq!(monthly, Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());

        let yearly = BillingCycle::Yearly.expiry_from(issued);
        assert_eq!(yearly, Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_cycle_parsing() {
        assert_eq!(BillingCycle::parse("monthly").unwrap(), BillingCycle::Monthly);
        assert_eq!(BillingCycle::parse("Yearly").unwrap(), BillingCycle::Yearly);
        assert!(BillingCycle::parse("weekly").is_err());
    }
}
