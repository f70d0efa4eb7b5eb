//! Entitlement record and patch types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plans::PlanTier;

/// The authoritative per-identity entitlement row.
///
/// Keyed by email; at most one record exists per email. The counter pair
/// always satisfies `queries_remaining >= 0` and, within one tier and
/// period, `queries_used + queries_remaining == monthly_query_limit()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementRecord {
    pub email: String,
    /// Identity-service principal id, filled once the identity is seen.
    pub principal_id: Option<String>,
    pub plan_tier: PlanTier,
    pub is_active: bool,
    /// Billing processor customer reference, when known.
    pub billing_customer_ref: Option<String>,
    pub queries_used: i64,
    pub queries_remaining: i64,
    /// End of the current billing period as a unix timestamp.
    pub period_end: Option<i64>,
    /// Set once when a demo grant is issued and never cleared, even
    /// after an upgrade to a paid tier. Gates repeat demo grants.
    pub is_demo_user: bool,
    pub updated_at: DateTime<Utc>,
}

impl EntitlementRecord {
    /// A fresh record for an identity with no subscription.
    #[must_use]
    pub fn unsubscribed(email: impl Into<String>, principal_id: Option<String>) -> Self {
        Self {
            email: email.into(),
            principal_id,
            plan_tier: PlanTier::None,
            is_active: false,
            billing_customer_ref: None,
            queries_used: 0,
            queries_remaining: 0,
            period_end: None,
            is_demo_user: false,
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn monthly_limit(&self) -> i64 {
        self.plan_tier.monthly_query_limit()
    }

    /// Whether this record is a live demo grant. Live demo records are
    /// preserved by reconciliation, which otherwise deactivates records
    /// without a processor subscription.
    #[must_use]
    pub fn is_live_demo(&self) -> bool {
        self.is_demo_user && self.plan_tier == PlanTier::Demo && self.is_active
    }
}

/// Merge patch applied by [`upsert`]. Unset fields keep their stored
/// value; on insert they take the [`EntitlementRecord::unsubscribed`]
/// defaults.
///
/// [`upsert`]: crate::entitlements::EntitlementStore::upsert
#[derive(Debug, Clone, Default)]
pub struct EntitlementPatch {
    pub principal_id: Option<String>,
    pub plan_tier: Option<PlanTier>,
    pub is_active: Option<bool>,
    pub billing_customer_ref: Option<String>,
    pub queries_used: Option<i64>,
    pub queries_remaining: Option<i64>,
    pub period_end: Option<i64>,
    pub is_demo_user: Option<bool>,
}

impl EntitlementPatch {
    /// Apply this patch over an existing record.
    pub fn apply_to(&self, record: &mut EntitlementRecord) {
        if let Some(principal_id) = &self.principal_id {
            record.principal_id = Some(principal_id.clone());
        }
        if let Some(plan_tier) = self.plan_tier {
            record.plan_tier = plan_tier;
        }
        if let Some(is_active) = self.is_active {
            record.is_active = is_active;
        }
        if let Some(customer_ref) = &self.billing_customer_ref {
            record.billing_customer_ref = Some(customer_ref.clone());
        }
        if let Some(queries_used) = self.queries_used {
            record.queries_used = queries_used;
        }
        if let Some(queries_remaining) = self.queries_remaining {
            record.queries_remaining = queries_remaining;
        }
        if let Some(period_end) = self.period_end {
            record.period_end = Some(period_end);
        }
        if let Some(is_demo_user) = self.is_demo_user {
            record.is_demo_user = is_demo_user;
        }
        record.updated_at = Utc::now();
    }

    /// Materialize a new record from this patch for an insert.
    #[must_use]
    pub fn into_record(self, email: &str) -> EntitlementRecord {
        let mut record = EntitlementRecord::unsubscribed(email, None);
        self.apply_to(&mut record);
        record
    }
}

/// Append-only usage log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub principal_id: String,
    pub query_text: String,
    pub response_length: i64,
    pub created_at: DateTime<Utc>,
}

impl QueryLogEntry {
    #[must_use]
    pub fn new(principal_id: impl Into<String>, query_text: impl Into<String>, response_length: i64) -> Self {
        Self {
            principal_id: principal_id.into(),
            query_text: query_text.into(),
            response_length,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_merges_only_set_fields() {
        let mut record = EntitlementRecord::unsubscribed("a@example.com", Some("user_1".into()));
        record.queries_used = 5;

        let patch = EntitlementPatch {
            plan_tier: Some(PlanTier::Basic),
            is_active: Some(true),
            queries_remaining: Some(95),
            ..Default::default()
        };
        patch.apply_to(&mut record);

        assert_eq!(record.plan_tier, PlanTier::Basic);
        assert!(record.is_active);
        assert_eq!(record.queries_remaining, 95);
        // untouched fields survive
        assert_eq!(record.queries_used, 5);
        assert_eq!(record.principal_id.as_deref(), Some("user_1"));
        assert!(!record.is_demo_user);
    }

    #[test]
    fn patch_materializes_insert_defaults() {
        let record = EntitlementPatch {
            plan_tier: Some(PlanTier::Demo),
            is_active: Some(true),
            queries_remaining: Some(3),
            is_demo_user: Some(true),
            ..Default::default()
        }
        .into_record("demo@example.com");

        assert_eq!(record.email, "demo@example.com");
        assert_eq!(record.plan_tier, PlanTier::Demo);
        assert_eq!(record.queries_used, 0);
        assert_eq!(record.queries_remaining, 3);
        assert!(record.is_live_demo());
    }

    #[test]
    fn live_demo_detection() {
        let mut record = EntitlementRecord::unsubscribed("d@example.com", None);
        assert!(!record.is_live_demo());

        record.plan_tier = PlanTier::Demo;
        record.is_active = true;
        record.is_demo_user = true;
        assert!(record.is_live_demo());

        // an upgraded former demo user is not a live demo
        record.plan_tier = PlanTier::Basic;
        assert!(!record.is_live_demo());
    }
}
