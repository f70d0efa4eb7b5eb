//! Plan tiers and the query-limit table.
//!
//! The limit table is the single source of truth for how many queries a
//! tier grants per billing period. Tiers are resolved from processor
//! price amounts (minor units) or from the plan names carried in
//! checkout metadata, which the product localizes.

use serde::{Deserialize, Serialize};

/// Subscription tier of an entitlement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    /// No plan. Zero budget; every usage check denies.
    None,
    Demo,
    Basic,
    Professional,
    Academy,
}

impl PlanTier {
    /// Queries granted per billing period.
    #[must_use]
    pub fn monthly_query_limit(self) -> i64 {
        match self {
            PlanTier::None => 0,
            PlanTier::Demo => 3,
            PlanTier::Basic => 100,
            PlanTier::Professional => 3000,
            PlanTier::Academy => 30000,
        }
    }

    /// Resolve a purchasable tier from a price amount in minor units.
    #[must_use]
    pub fn from_price_amount(minor_units: i64) -> Self {
        if minor_units <= 1000 {
            PlanTier::Basic
        } else if minor_units <= 2000 {
            PlanTier::Professional
        } else {
            PlanTier::Academy
        }
    }

    /// Parse a plan name, accepting both canonical and localized forms.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "demo" => Some(PlanTier::Demo),
            "basic" | "basico" | "básico" => Some(PlanTier::Basic),
            "professional" | "profesional" => Some(PlanTier::Professional),
            "academy" | "academia" => Some(PlanTier::Academy),
            "none" => Some(PlanTier::None),
            _ => None,
        }
    }

    /// Canonical name shown in subscription-check responses.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            PlanTier::None => "None",
            PlanTier::Demo => "Demo",
            PlanTier::Basic => "Basic",
            PlanTier::Professional => "Professional",
            PlanTier::Academy => "Academy",
        }
    }

    /// Stable lowercase identifier used for persistence.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PlanTier::None => "none",
            PlanTier::Demo => "demo",
            PlanTier::Basic => "basic",
            PlanTier::Professional => "professional",
            PlanTier::Academy => "academy",
        }
    }

    /// Inverse of [`as_str`]. Unknown values fall back to `None`.
    ///
    /// [`as_str`]: PlanTier::as_str
    #[must_use]
    pub fn from_str(value: &str) -> Self {
        match value {
            "demo" => PlanTier::Demo,
            "basic" => PlanTier::Basic,
            "professional" => PlanTier::Professional,
            "academy" => PlanTier::Academy,
            _ => PlanTier::None,
        }
    }
}

impl Default for PlanTier {
    fn default() -> Self {
        PlanTier::None
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
