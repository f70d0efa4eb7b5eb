//! Usage limit decisions and query accounting.
//!
//! `check_limit` is advisory and cacheable; `log_query` is the one
//! place capacity is actually consumed, through the store's guarded
//! decrement. Denial is a business outcome, not an error: callers get a
//! [`LimitDecision`] either way.

use std::time::Duration;

use serde::Serialize;

use crate::auth::Principal;
use crate::cache::TtlCache;
use crate::entitlements::{EntitlementPatch, EntitlementRecord, EntitlementStore, QueryLogEntry};
use crate::error::Result;
use crate::plans::PlanTier;

/// How long a cached decision is served before re-reading the store.
/// Every recorded query invalidates the principal's entry, so an
/// in-use account never sees a stale counter for long.
const DECISION_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    Ok,
    NoSubscription,
    LimitExceeded,
    NoAuth,
}

/// Counter snapshot carried on a decision.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub queries_used: i64,
    pub queries_remaining: i64,
    pub monthly_limit: i64,
    /// True exactly when a demo budget ran out. The upsell path treats
    /// this differently from a paid tier hitting its cap.
    pub demo_exhausted: bool,
}

/// Outcome of a limit check.
#[derive(Debug, Clone, Serialize)]
pub struct LimitDecision {
    pub can_proceed: bool,
    pub reason: LimitReason,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
}

impl LimitDecision {
    /// Denial for requests that never authenticated.
    #[must_use]
    pub fn no_auth() -> Self {
        Self {
            can_proceed: false,
            reason: LimitReason::NoAuth,
            message: "authentication required".to_string(),
            usage: None,
        }
    }
}

fn snapshot(record: &EntitlementRecord) -> UsageSnapshot {
    let monthly_limit = record.monthly_limit();
    UsageSnapshot {
        queries_used: record.queries_used,
        queries_remaining: record.queries_remaining,
        monthly_limit,
        demo_exhausted: monthly_limit == 3 && record.queries_remaining == 0,
    }
}

/// Usage limiter over an entitlement store.
pub struct UsageLimiter<S: EntitlementStore> {
    store: S,
    cache: TtlCache<LimitDecision>,
}

impl<S: EntitlementStore> UsageLimiter<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: TtlCache::new(DECISION_TTL),
        }
    }

    /// Decide whether the principal may run one more query.
    ///
    /// Lazily creates the entitlement row for identities never seen
    /// before, so a fresh account gets a clean `no_subscription` denial
    /// rather than an error. Store failures propagate: unknown state
    /// denies, it never allows.
    pub async fn check_limit(&self, principal: &Principal) -> Result<LimitDecision> {
        if let Some(decision) = self.cache.get(&principal.id).await {
            return Ok(decision);
        }

        let record = self.ensure_record(principal).await?;
        let decision = decide(&record);

        self.cache
            .insert(principal.id.clone(), decision.clone())
            .await;
        Ok(decision)
    }

    /// Record one answered query: consume a unit of budget, append the
    /// usage log, and drop the cached decision.
    ///
    /// Returns whether a unit was actually consumed. A `false` here
    /// means a concurrent request drained the last unit first.
    pub async fn log_query(
        &self,
        principal: &Principal,
        query_text: &str,
        response_length: i64,
    ) -> Result<bool> {
        let consumed = self.store.consume_query(&principal.email).await?;

        if consumed {
            // Log failures must not undo an already-delivered answer
            if let Err(e) = self
                .store
                .append_query_log(QueryLogEntry::new(
                    principal.id.clone(),
                    query_text,
                    response_length,
                ))
                .await
            {
                tracing::warn!(
                    principal_id = %principal.id,
                    error = %e,
                    "failed to append query log entry"
                );
            }
        } else {
            tracing::warn!(
                principal_id = %principal.id,
                "query completed but no budget was available to consume"
            );
        }

        self.cache.invalidate(&principal.id).await;
        Ok(consumed)
    }

    /// Drop the cached decision for one principal.
    pub async fn invalidate(&self, principal_id: &str) {
        self.cache.invalidate(principal_id).await;
    }

    async fn ensure_record(&self, principal: &Principal) -> Result<EntitlementRecord> {
        if let Some(record) = self.store.get_by_email(&principal.email).await? {
            return Ok(record);
        }

        tracing::debug!(principal_id = %principal.id, "creating entitlement row for new identity");
        self.store
            .upsert(
                &principal.email,
                EntitlementPatch {
                    principal_id: Some(principal.id.clone()),
                    plan_tier: Some(PlanTier::None),
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
    }
}

fn decide(record: &EntitlementRecord) -> LimitDecision {
    let usage = snapshot(record);

    if !record.is_active || record.plan_tier == PlanTier::None {
        return LimitDecision {
            can_proceed: false,
            reason: LimitReason::NoSubscription,
            message: "an active subscription is required".to_string(),
            usage: Some(usage),
        };
    }

    if record.queries_remaining > 0 {
        return LimitDecision {
            can_proceed: true,
            reason: LimitReason::Ok,
            message: format!("{} queries remaining", record.queries_remaining),
            usage: Some(usage),
        };
    }

    let message = if usage.demo_exhausted {
        "your demo queries are used up, subscribe to continue".to_string()
    } else {
        "you have reached your monthly query limit".to_string()
    };

    LimitDecision {
        can_proceed: false,
        reason: LimitReason::LimitExceeded,
        message,
        usage: Some(usage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::InMemoryEntitlementStore;

    fn principal() -> Principal {
        Principal {
            id: "user_1".to_string(),
            email: "a@example.com".to_string(),
            expires_at: None,
        }
    }

    async fn seed(store: &InMemoryEntitlementStore, tier: PlanTier, remaining: i64, used: i64) {
        store
            .upsert(
                "a@example.com",
                EntitlementPatch {
                    principal_id: Some("user_1".into()),
                    plan_tier: Some(tier),
                    is_active: Some(true),
                    queries_remaining: Some(remaining),
                    queries_used: Some(used),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_identity_gets_no_subscription() {
        let store = InMemoryEntitlementStore::new();
        let limiter = UsageLimiter::new(store.clone());

        let decision = limiter.check_limit(&principal()).await.unwrap();
        assert!(!decision.can_proceed);
        assert_eq!(decision.reason, LimitReason::NoSubscription);

        // the row was created lazily
        let record = store.get_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(record.plan_tier, PlanTier::None);
        assert!(!record.is_active);
    }

    #[tokio::test]
    async fn active_subscription_with_budget_proceeds() {
        let store = InMemoryEntitlementStore::new();
        seed(&store, PlanTier::Basic, 42, 58).await;
        let limiter = UsageLimiter::new(store);

        let decision = limiter.check_limit(&principal()).await.unwrap();
        assert!(decision.can_proceed);
        assert_eq!(decision.reason, LimitReason::Ok);
        let usage = decision.usage.unwrap();
        assert_eq!(usage.queries_remaining, 42);
        assert_eq!(usage.monthly_limit, 100);
        assert!(!usage.demo_exhausted);
    }

    #[tokio::test]
    async fn exhausted_paid_plan_is_limit_exceeded() {
        let store = InMemoryEntitlementStore::new();
        seed(&store, PlanTier::Basic, 0, 100).await;
        let limiter = UsageLimiter::new(store);

        let decision = limiter.check_limit(&principal()).await.unwrap();
        assert!(!decision.can_proceed);
        assert_eq!(decision.reason, LimitReason::LimitExceeded);
        assert!(!decision.usage.unwrap().demo_exhausted);
    }

    #[tokio::test]
    async fn exhausted_demo_is_flagged() {
        let store = InMemoryEntitlementStore::new();
        seed(&store, PlanTier::Demo, 0, 3).await;
        let limiter = UsageLimiter::new(store);

        let decision = limiter.check_limit(&principal()).await.unwrap();
        assert!(!decision.can_proceed);
        assert_eq!(decision.reason, LimitReason::LimitExceeded);
        assert!(decision.usage.unwrap().demo_exhausted);
    }

    #[tokio::test]
    async fn inactive_record_denies_despite_positive_counter() {
        let store = InMemoryEntitlementStore::new();
        store
            .upsert(
                "a@example.com",
                EntitlementPatch {
                    principal_id: Some("user_1".into()),
                    plan_tier: Some(PlanTier::Professional),
                    is_active: Some(false),
                    queries_remaining: Some(2500),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let limiter = UsageLimiter::new(store);

        let decision = limiter.check_limit(&principal()).await.unwrap();
        assert!(!decision.can_proceed);
        assert_eq!(decision.reason, LimitReason::NoSubscription);
    }

    #[tokio::test]
    async fn log_query_consumes_and_invalidates_cache() {
        let store = InMemoryEntitlementStore::new();
        seed(&store, PlanTier::Demo, 1, 2).await;
        let limiter = UsageLimiter::new(store.clone());

        // prime the cache with an allow
        let decision = limiter.check_limit(&principal()).await.unwrap();
        assert!(decision.can_proceed);

        assert!(limiter.log_query(&principal(), "what is rust", 420).await.unwrap());

        // cache was invalidated, so the next check sees the drained budget
        let decision = limiter.check_limit(&principal()).await.unwrap();
        assert!(!decision.can_proceed);
        assert_eq!(decision.reason, LimitReason::LimitExceeded);

        let log = store.query_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].query_text, "what is rust");
        assert_eq!(log[0].response_length, 420);
    }

    #[tokio::test]
    async fn log_query_without_budget_reports_false() {
        let store = InMemoryEntitlementStore::new();
        seed(&store, PlanTier::Demo, 0, 3).await;
        let limiter = UsageLimiter::new(store.clone());

        assert!(!limiter.log_query(&principal(), "q", 1).await.unwrap());
        assert!(store.query_log().await.is_empty());
    }

    #[tokio::test]
    async fn decision_is_cached_until_invalidated() {
        let store = InMemoryEntitlementStore::new();
        seed(&store, PlanTier::Basic, 10, 90).await;
        let limiter = UsageLimiter::new(store.clone());

        let first = limiter.check_limit(&principal()).await.unwrap();
        assert!(first.can_proceed);

        // mutate the store behind the cache
        seed(&store, PlanTier::Basic, 0, 100).await;
        let cached = limiter.check_limit(&principal()).await.unwrap();
        assert!(cached.can_proceed);

        limiter.invalidate("user_1").await;
        let fresh = limiter.check_limit(&principal()).await.unwrap();
        assert!(!fresh.can_proceed);
    }
}
