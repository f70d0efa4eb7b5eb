//! One-time demo grant allocation.
//!
//! A demo grant is one-way: once an identity has held one, the
//! `is_demo_user` flag stays set forever and blocks any further grant,
//! even after the demo is exhausted or the user later subscribes. The
//! per-address ledger is a best-effort deterrent on top, nothing more;
//! originating addresses are attacker-controlled.

use serde::Serialize;

use crate::auth::Principal;
use crate::entitlements::EntitlementStore;
use crate::error::Result;

/// Demo grants ever allowed per originating address.
const MAX_GRANTS_PER_ADDRESS: u32 = 2;

/// Answer to a demo availability check.
#[derive(Debug, Clone, Serialize)]
pub struct DemoAvailability {
    pub can_grant: bool,
    /// Human-readable denial reason, absent when a grant is possible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DemoAvailability {
    fn granted() -> Self {
        Self {
            can_grant: true,
            reason: None,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            can_grant: false,
            reason: Some(reason.into()),
        }
    }
}

pub struct DemoGrantService<S: EntitlementStore> {
    store: S,
}

impl<S: EntitlementStore> DemoGrantService<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Whether a grant is currently possible for this identity and
    /// originating address.
    pub async fn check_availability(
        &self,
        principal: &Principal,
        address: &str,
    ) -> Result<DemoAvailability> {
        if let Some(record) = self.store.get_by_email(&principal.email).await? {
            if record.is_demo_user {
                return Ok(DemoAvailability::denied(
                    "this account has already used its demo",
                ));
            }
        }

        let grants = self.store.demo_grants_for_address(address).await?;
        if grants >= MAX_GRANTS_PER_ADDRESS {
            return Ok(DemoAvailability::denied(
                "the demo limit for this network has been reached",
            ));
        }

        Ok(DemoAvailability::granted())
    }

    /// Issue a demo grant. Returns `false` without touching any state
    /// when the grant is denied; in particular, re-running a grant for
    /// a demo-flagged identity never resets its counters.
    pub async fn grant(&self, principal: &Principal, address: &str) -> Result<bool> {
        let availability = self.check_availability(principal, address).await?;
        if !availability.can_grant {
            tracing::debug!(
                principal_id = %principal.id,
                reason = availability.reason.as_deref().unwrap_or(""),
                "demo grant denied"
            );
            return Ok(false);
        }

        // The store makes the transition one-way; of concurrent grants
        // for the same identity exactly one lands here with `true`, so
        // the address ledger counts each identity once.
        if !self.store.grant_demo(&principal.email, &principal.id).await? {
            tracing::debug!(principal_id = %principal.id, "demo grant lost to a concurrent request");
            return Ok(false);
        }
        self.store.record_demo_address(address).await?;

        tracing::info!(principal_id = %principal.id, "issued demo grant");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::{EntitlementPatch, InMemoryEntitlementStore};
    use crate::plans::PlanTier;

    fn principal(id: &str, email: &str) -> Principal {
        Principal {
            id: id.to_string(),
            email: email.to_string(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn grant_sets_demo_state() {
        let store = InMemoryEntitlementStore::new();
        let service = DemoGrantService::new(store.clone());
        let user = principal("user_1", "a@example.com");

        assert!(service.grant(&user, "10.0.0.1").await.unwrap());

        let record = store.get_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(record.plan_tier, PlanTier::Demo);
        assert!(record.is_active);
        assert!(record.is_demo_user);
        assert_eq!(record.queries_remaining, 3);
        assert_eq!(record.queries_used, 0);
    }

    #[tokio::test]
    async fn repeat_grant_is_denied_and_never_resets() {
        let store = InMemoryEntitlementStore::new();
        let service = DemoGrantService::new(store.clone());
        let user = principal("user_1", "a@example.com");

        assert!(service.grant(&user, "10.0.0.1").await.unwrap());

        // burn the budget down
        store.consume_query("a@example.com").await.unwrap();
        store.consume_query("a@example.com").await.unwrap();

        assert!(!service.grant(&user, "10.0.0.9").await.unwrap());

        let record = store.get_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(record.queries_remaining, 1);
        assert_eq!(record.queries_used, 2);
    }

    #[tokio::test]
    async fn concurrent_grants_issue_exactly_one() {
        let store = InMemoryEntitlementStore::new();
        let service = std::sync::Arc::new(DemoGrantService::new(store.clone()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service
                    .grant(&principal("user_1", "a@example.com"), "10.0.0.1")
                    .await
                    .unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);

        // one grant, one ledger entry, counters untouched by the losers
        assert_eq!(store.demo_grants_for_address("10.0.0.1").await.unwrap(), 1);
        let record = store.get_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(record.queries_remaining, 3);
        assert_eq!(record.queries_used, 0);
    }

    #[tokio::test]
    async fn exhausted_demo_stays_denied() {
        let store = InMemoryEntitlementStore::new();
        let service = DemoGrantService::new(store.clone());
        let user = principal("user_1", "a@example.com");

        service.grant(&user, "10.0.0.1").await.unwrap();
        for _ in 0..3 {
            store.consume_query("a@example.com").await.unwrap();
        }

        let availability = service.check_availability(&user, "10.0.0.2").await.unwrap();
        assert!(!availability.can_grant);
    }

    #[tokio::test]
    async fn address_allotment_is_enforced() {
        let store = InMemoryEntitlementStore::new();
        let service = DemoGrantService::new(store.clone());

        assert!(service
            .grant(&principal("user_1", "a@example.com"), "10.0.0.1")
            .await
            .unwrap());
        assert!(service
            .grant(&principal("user_2", "b@example.com"), "10.0.0.1")
            .await
            .unwrap());

        // third identity on the same address is denied
        assert!(!service
            .grant(&principal("user_3", "c@example.com"), "10.0.0.1")
            .await
            .unwrap());

        // a different address is fine
        assert!(service
            .grant(&principal("user_3", "c@example.com"), "10.0.0.2")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn paid_user_can_still_claim_a_first_demo_check() {
        // an identity without the demo flag is only gated by address
        let store = InMemoryEntitlementStore::new();
        store
            .upsert(
                "a@example.com",
                EntitlementPatch {
                    plan_tier: Some(PlanTier::Basic),
                    is_active: Some(true),
                    queries_remaining: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let service = DemoGrantService::new(store);
        let availability = service
            .check_availability(&principal("user_1", "a@example.com"), "10.0.0.1")
            .await
            .unwrap();
        assert!(availability.can_grant);
    }
}
