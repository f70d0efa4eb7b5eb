//! Entitlement storage trait and the in-memory implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::plans::PlanTier;
use super::record::{EntitlementPatch, EntitlementRecord, QueryLogEntry};

/// Storage abstraction for entitlement state.
///
/// The entitlement row is the only shared mutable resource in the
/// system; all same-identity concurrency serializes through
/// [`consume_query`], never through in-memory locks held by callers.
///
/// [`consume_query`]: EntitlementStore::consume_query
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn get_by_email(&self, email: &str) -> Result<Option<EntitlementRecord>>;

    async fn get_by_principal(&self, principal_id: &str) -> Result<Option<EntitlementRecord>>;

    async fn get_by_customer_ref(&self, customer_ref: &str) -> Result<Option<EntitlementRecord>>;

    /// Insert-or-merge keyed by email. Set patch fields overwrite, unset
    /// fields keep their stored value. Counters must only be mutated
    /// through [`consume_query`] outside of plan-change resets.
    ///
    /// [`consume_query`]: EntitlementStore::consume_query
    async fn upsert(&self, email: &str, patch: EntitlementPatch) -> Result<EntitlementRecord>;

    /// Atomically consume one query: decrement `queries_remaining` and
    /// increment `queries_used`, but only while `queries_remaining > 0`.
    ///
    /// Returns `true` if a unit was consumed. The guard makes concurrent
    /// calls on the same email consume exactly the available budget and
    /// never drive the counter negative.
    async fn consume_query(&self, email: &str) -> Result<bool>;

    /// Atomically flip an identity into its demo state: `plan_tier =
    /// Demo`, active, fresh 3-query budget, `is_demo_user = true`, but
    /// only while `is_demo_user` is still false.
    ///
    /// Returns `true` if the transition happened. The guard makes the
    /// transition one-way under concurrency: of any number of racing
    /// grants for the same email, exactly one wins and none can reset
    /// the counters of an identity that already holds the flag.
    async fn grant_demo(&self, email: &str, principal_id: &str) -> Result<bool>;

    async fn append_query_log(&self, entry: QueryLogEntry) -> Result<()>;

    /// Number of demo grants ever issued to an originating address.
    async fn demo_grants_for_address(&self, address: &str) -> Result<u32>;

    async fn record_demo_address(&self, address: &str) -> Result<()>;

    /// Webhook idempotency ledger.
    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    async fn mark_event_processed(&self, event_id: &str) -> Result<()>;
}

#[async_trait]
impl<T: EntitlementStore + ?Sized> EntitlementStore for Arc<T> {
    async fn get_by_email(&self, email: &str) -> Result<Option<EntitlementRecord>> {
        (**self).get_by_email(email).await
    }

    async fn get_by_principal(&self, principal_id: &str) -> Result<Option<EntitlementRecord>> {
        (**self).get_by_principal(principal_id).await
    }

    async fn get_by_customer_ref(&self, customer_ref: &str) -> Result<Option<EntitlementRecord>> {
        (**self).get_by_customer_ref(customer_ref).await
    }

    async fn upsert(&self, email: &str, patch: EntitlementPatch) -> Result<EntitlementRecord> {
        (**self).upsert(email, patch).await
    }

    async fn consume_query(&self, email: &str) -> Result<bool> {
        (**self).consume_query(email).await
    }

    async fn grant_demo(&self, email: &str, principal_id: &str) -> Result<bool> {
        (**self).grant_demo(email, principal_id).await
    }

    async fn append_query_log(&self, entry: QueryLogEntry) -> Result<()> {
        (**self).append_query_log(entry).await
    }

    async fn demo_grants_for_address(&self, address: &str) -> Result<u32> {
        (**self).demo_grants_for_address(address).await
    }

    async fn record_demo_address(&self, address: &str) -> Result<()> {
        (**self).record_demo_address(address).await
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        (**self).is_event_processed(event_id).await
    }

    async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
        (**self).mark_event_processed(event_id).await
    }
}

/// In-memory entitlement store for development and tests.
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryEntitlementStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    records: RwLock<HashMap<String, EntitlementRecord>>,
    query_log: RwLock<Vec<QueryLogEntry>>,
    demo_addresses: RwLock<HashMap<String, u32>>,
    processed_events: RwLock<HashMap<String, ()>>,
}

impl InMemoryEntitlementStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the query log, oldest first.
    pub async fn query_log(&self) -> Vec<QueryLogEntry> {
        self.inner.query_log.read().await.clone()
    }
}

#[async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn get_by_email(&self, email: &str) -> Result<Option<EntitlementRecord>> {
        Ok(self.inner.records.read().await.get(email).cloned())
    }

    async fn get_by_principal(&self, principal_id: &str) -> Result<Option<EntitlementRecord>> {
        Ok(self
            .inner
            .records
            .read()
            .await
            .values()
            .find(|r| r.principal_id.as_deref() == Some(principal_id))
            .cloned())
    }

    async fn get_by_customer_ref(&self, customer_ref: &str) -> Result<Option<EntitlementRecord>> {
        Ok(self
            .inner
            .records
            .read()
            .await
            .values()
            .find(|r| r.billing_customer_ref.as_deref() == Some(customer_ref))
            .cloned())
    }

    async fn upsert(&self, email: &str, patch: EntitlementPatch) -> Result<EntitlementRecord> {
        let mut records = self.inner.records.write().await;
        let record = match records.get_mut(email) {
            Some(existing) => {
                patch.apply_to(existing);
                existing.clone()
            }
            None => {
                let record = patch.into_record(email);
                records.insert(email.to_string(), record.clone());
                record
            }
        };
        Ok(record)
    }

    async fn consume_query(&self, email: &str) -> Result<bool> {
        let mut records = self.inner.records.write().await;
        match records.get_mut(email) {
            Some(record) if record.queries_remaining > 0 => {
                record.queries_remaining -= 1;
                record.queries_used += 1;
                record.updated_at = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn grant_demo(&self, email: &str, principal_id: &str) -> Result<bool> {
        let mut records = self.inner.records.write().await;
        match records.get_mut(email) {
            Some(record) if record.is_demo_user => Ok(false),
            Some(record) => {
                record.principal_id = Some(principal_id.to_string());
                record.plan_tier = PlanTier::Demo;
                record.is_active = true;
                record.queries_used = 0;
                record.queries_remaining = PlanTier::Demo.monthly_query_limit();
                record.is_demo_user = true;
                record.updated_at = chrono::Utc::now();
                Ok(true)
            }
            None => {
                let record = EntitlementPatch {
                    principal_id: Some(principal_id.to_string()),
                    plan_tier: Some(PlanTier::Demo),
                    is_active: Some(true),
                    queries_used: Some(0),
                    queries_remaining: Some(PlanTier::Demo.monthly_query_limit()),
                    is_demo_user: Some(true),
                    ..Default::default()
                }
                .into_record(email);
                records.insert(email.to_string(), record);
                Ok(true)
            }
        }
    }

    async fn append_query_log(&self, entry: QueryLogEntry) -> Result<()> {
        self.inner.query_log.write().await.push(entry);
        Ok(())
    }

    async fn demo_grants_for_address(&self, address: &str) -> Result<u32> {
        Ok(self
            .inner
            .demo_addresses
            .read()
            .await
            .get(address)
            .copied()
            .unwrap_or(0))
    }

    async fn record_demo_address(&self, address: &str) -> Result<()> {
        *self
            .inner
            .demo_addresses
            .write()
            .await
            .entry(address.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .processed_events
            .read()
            .await
            .contains_key(event_id))
    }

    async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
        self.inner
            .processed_events
            .write()
            .await
            .insert(event_id.to_string(), ());
        Ok(())
    }
}
