//! Pull-path reconciliation against the billing processor.
//!
//! Rebuilds an identity's entitlement row from the processor's answer.
//! The write is absolute state, so re-running reconciliation is
//! idempotent: the same processor answer always lands the row in the
//! same place regardless of what was there before.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::client::{BillingClient, BillingSubscription, SubscriptionStatus};
use crate::auth::Principal;
use crate::cache::TtlCache;
use crate::entitlements::{EntitlementPatch, EntitlementRecord, EntitlementStore};
use crate::error::{GateError, Result};
use crate::limiter::UsageLimiter;
use crate::plans::PlanTier;

/// Repeated pulls inside this window return the cached answer even
/// when `force` is set.
const PULL_COOLDOWN: Duration = Duration::from_secs(5);
/// Non-forced pulls trust a cached answer this old.
const FRESHNESS_WINDOW: Duration = Duration::from_secs(30 * 60);
/// How long a `past_due` subscription keeps access past its period end.
const PAST_DUE_GRACE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// What a pull resolved for an identity.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSummary {
    pub subscribed: bool,
    pub tier: PlanTier,
    pub period_end: Option<i64>,
}

impl SubscriptionSummary {
    fn unsubscribed() -> Self {
        Self {
            subscribed: false,
            tier: PlanTier::None,
            period_end: None,
        }
    }
}

/// Cached result of the last pull, success or failure alike. Failure
/// markers only live for the cooldown window, so a billing outage is
/// re-probed at most once per window instead of on every request.
#[derive(Clone)]
enum PullOutcome {
    Ready(SubscriptionSummary),
    Failed(String),
}

/// Pull-path reconciliation manager.
pub struct ReconcileManager<S: EntitlementStore, C: BillingClient> {
    store: S,
    client: C,
    cache: TtlCache<PullOutcome>,
    limiter: Option<Arc<UsageLimiter<S>>>,
}

impl<S: EntitlementStore, C: BillingClient> ReconcileManager<S, C> {
    #[must_use]
    pub fn new(store: S, client: C) -> Self {
        Self {
            store,
            client,
            cache: TtlCache::new(FRESHNESS_WINDOW),
            limiter: None,
        }
    }

    /// Drop the limiter's cached decision for a principal whenever a
    /// pull rewrites their entitlement row.
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<UsageLimiter<S>>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Reconcile one identity's entitlement row with the processor.
    ///
    /// `force` bypasses the freshness window but not the cooldown; a
    /// failed pull also holds for the cooldown before the processor is
    /// called again. Processor or store failures propagate; callers
    /// treat them as "state unknown" and deny, never allow.
    pub async fn reconcile(&self, principal: &Principal, force: bool) -> Result<SubscriptionSummary> {
        if let Some((outcome, age)) = self.cache.get_with_age(&principal.id).await {
            match outcome {
                PullOutcome::Ready(summary) => {
                    if age < PULL_COOLDOWN || !force {
                        tracing::debug!(
                            principal_id = %principal.id,
                            age_secs = age.as_secs(),
                            "returning cached subscription state"
                        );
                        return Ok(summary);
                    }
                }
                PullOutcome::Failed(detail) => {
                    tracing::debug!(
                        principal_id = %principal.id,
                        "returning recent pull failure inside cooldown"
                    );
                    return Err(GateError::unavailable(detail));
                }
            }
        }

        match self.pull(principal).await {
            Ok(summary) => {
                self.cache
                    .insert(principal.id.clone(), PullOutcome::Ready(summary.clone()))
                    .await;
                Ok(summary)
            }
            Err(e) => {
                self.cache
                    .insert_with_ttl(
                        principal.id.clone(),
                        PullOutcome::Failed(e.to_string()),
                        PULL_COOLDOWN,
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn invalidate_decision(&self, principal_id: &str) {
        if let Some(limiter) = &self.limiter {
            limiter.invalidate(principal_id).await;
        }
    }

    async fn pull(&self, principal: &Principal) -> Result<SubscriptionSummary> {
        tracing::debug!(principal_id = %principal.id, "pulling subscription state");

        let record = self.store.get_by_email(&principal.email).await?;

        let customer_ref = match record.as_ref().and_then(|r| r.billing_customer_ref.clone()) {
            Some(customer_ref) => Some(customer_ref),
            None => self
                .client
                .find_customer_by_email(&principal.email)
                .await?
                .map(|c| c.id),
        };

        let Some(customer_ref) = customer_ref else {
            return self.settle_unentitled(principal, record, None).await;
        };

        let subscriptions = self.client.list_subscriptions(&customer_ref).await?;
        let now = chrono::Utc::now().timestamp();
        let entitled = subscriptions
            .iter()
            .find(|s| entitled_with_grace(s, now));

        match entitled {
            Some(subscription) => {
                self.settle_entitled(principal, record, &customer_ref, subscription)
                    .await
            }
            None => {
                self.settle_unentitled(principal, record, Some(customer_ref))
                    .await
            }
        }
    }

    async fn settle_entitled(
        &self,
        principal: &Principal,
        record: Option<EntitlementRecord>,
        customer_ref: &str,
        subscription: &BillingSubscription,
    ) -> Result<SubscriptionSummary> {
        let tier = self.resolve_tier(subscription).await;
        let period_end = subscription.current_period_end;

        // Counters persist across reconciliations of the same tier and
        // period; a tier change or a period rollover resets the budget.
        let reset = match &record {
            Some(record) => {
                record.plan_tier != tier
                    || matches!(
                        (record.period_end, period_end),
                        (Some(old), Some(new)) if new > old
                    )
            }
            None => true,
        };

        let mut patch = EntitlementPatch {
            principal_id: Some(principal.id.clone()),
            plan_tier: Some(tier),
            is_active: Some(true),
            billing_customer_ref: Some(customer_ref.to_string()),
            period_end,
            ..Default::default()
        };
        if reset {
            patch.queries_used = Some(0);
            patch.queries_remaining = Some(tier.monthly_query_limit());
        }

        self.store.upsert(&principal.email, patch).await?;
        self.invalidate_decision(&principal.id).await;

        tracing::debug!(
            principal_id = %principal.id,
            tier = %tier,
            reset = reset,
            "reconciled entitled subscription"
        );

        Ok(SubscriptionSummary {
            subscribed: true,
            tier,
            period_end,
        })
    }

    async fn settle_unentitled(
        &self,
        principal: &Principal,
        record: Option<EntitlementRecord>,
        customer_ref: Option<String>,
    ) -> Result<SubscriptionSummary> {
        // A live demo grant has no processor subscription; leave it be.
        if let Some(record) = &record {
            if record.is_live_demo() {
                tracing::debug!(principal_id = %principal.id, "preserving live demo grant");
                return Ok(SubscriptionSummary {
                    subscribed: true,
                    tier: PlanTier::Demo,
                    period_end: record.period_end,
                });
            }
        }

        self.store
            .upsert(
                &principal.email,
                EntitlementPatch {
                    principal_id: Some(principal.id.clone()),
                    plan_tier: Some(PlanTier::None),
                    is_active: Some(false),
                    billing_customer_ref: customer_ref,
                    queries_remaining: Some(0),
                    ..Default::default()
                },
            )
            .await?;
        self.invalidate_decision(&principal.id).await;

        tracing::debug!(principal_id = %principal.id, "reconciled as unsubscribed");
        Ok(SubscriptionSummary::unsubscribed())
    }

    /// Resolve the tier from the subscription's price. A missing or
    /// failing price lookup degrades to Basic rather than failing the
    /// whole reconciliation.
    async fn resolve_tier(&self, subscription: &BillingSubscription) -> PlanTier {
        if let Some(amount) = subscription.unit_amount {
            return PlanTier::from_price_amount(amount);
        }

        let Some(price_id) = &subscription.price_id else {
            tracing::warn!(
                subscription_id = %subscription.id,
                "subscription has no price, defaulting to Basic"
            );
            return PlanTier::Basic;
        };

        match self.client.get_price_amount(price_id).await {
            Ok(Some(amount)) => PlanTier::from_price_amount(amount),
            Ok(None) => {
                tracing::warn!(price_id = %price_id, "price has no amount, defaulting to Basic");
                PlanTier::Basic
            }
            Err(e) => {
                tracing::warn!(
                    price_id = %price_id,
                    error = %e,
                    "price lookup failed, defaulting to Basic"
                );
                PlanTier::Basic
            }
        }
    }
}

/// Entitlement check with the past_due grace window applied.
fn entitled_with_grace(subscription: &BillingSubscription, now: i64) -> bool {
    if !subscription.status.is_entitled() {
        return false;
    }
    if subscription.status != SubscriptionStatus::PastDue {
        return true;
    }
    match subscription.current_period_end {
        Some(period_end) => now <= period_end + PAST_DUE_GRACE.as_secs() as i64,
        None => true,
    }
}
