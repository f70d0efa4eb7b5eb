//! Chat request orchestration.
//!
//! Walks one chat request through its states: authentication,
//! entitlement readiness, the limit decision, the completion call, and
//! usage logging. Denials along the way are outcomes, not errors; only
//! infrastructure failures surface as `Err` and those always deny.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::auth::Principal;
use crate::billing::{BillingClient, ReconcileManager};
use crate::completion::{ChatTurn, CompletionClient, SYSTEM_INSTRUCTION};
use crate::entitlements::EntitlementStore;
use crate::error::Result;
use crate::limiter::{LimitReason, UsageLimiter};

/// Where a request ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Idle,
    AuthChecked,
    EntitlementReady,
    LimiterChecked,
    Completing,
    Logged,
    Failed,
}

/// Why a request failed, when it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatFailure {
    /// No token, or the session expired. The client must re-authenticate.
    NoAuth,
    /// Subscription state is still being verified; the client should
    /// retry shortly.
    Verifying,
    NoSubscription,
    LimitExceeded { demo_exhausted: bool },
    /// The completion provider failed. No quota was consumed.
    CompletionError,
}

/// Final outcome of one chat request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub state: RequestState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ChatFailure>,
}

impl ChatOutcome {
    fn failed(failure: ChatFailure) -> Self {
        Self {
            state: RequestState::Failed,
            reply: None,
            failure: Some(failure),
        }
    }

    fn logged(reply: String) -> Self {
        Self {
            state: RequestState::Logged,
            reply: Some(reply),
            failure: None,
        }
    }
}

pub struct ChatOrchestrator<S, C, L>
where
    S: EntitlementStore + 'static,
    C: BillingClient,
    L: CompletionClient,
{
    limiter: Arc<UsageLimiter<S>>,
    reconciler: Arc<ReconcileManager<S, C>>,
    completion: L,
    /// Principals whose entitlement state was pulled at least once this
    /// process lifetime. Requests arriving before that first pull get a
    /// retryable "verifying" denial instead of an unentitled one.
    ready: RwLock<HashSet<String>>,
}

impl<S, C, L> ChatOrchestrator<S, C, L>
where
    S: EntitlementStore + 'static,
    C: BillingClient,
    L: CompletionClient,
{
    #[must_use]
    pub fn new(
        limiter: Arc<UsageLimiter<S>>,
        reconciler: Arc<ReconcileManager<S, C>>,
        completion: L,
    ) -> Self {
        Self {
            limiter,
            reconciler,
            completion,
            ready: RwLock::new(HashSet::new()),
        }
    }

    /// Run one chat request through the state machine.
    ///
    /// `principal` is `None` when the caller never authenticated.
    /// A client that disconnects after the completion succeeds still
    /// consumes its unit; the logging task is detached.
    pub async fn handle_chat(
        &self,
        principal: Option<&Principal>,
        message: &str,
        history: &[ChatTurn],
    ) -> Result<ChatOutcome> {
        let Some(principal) = principal else {
            return Ok(ChatOutcome::failed(ChatFailure::NoAuth));
        };
        if principal.is_expired() {
            return Ok(ChatOutcome::failed(ChatFailure::NoAuth));
        }

        if !self.ensure_ready(principal).await {
            return Ok(ChatOutcome::failed(ChatFailure::Verifying));
        }

        let decision = self.limiter.check_limit(principal).await?;
        if !decision.can_proceed {
            let failure = match decision.reason {
                LimitReason::NoAuth => ChatFailure::NoAuth,
                LimitReason::NoSubscription => ChatFailure::NoSubscription,
                LimitReason::LimitExceeded | LimitReason::Ok => ChatFailure::LimitExceeded {
                    demo_exhausted: decision
                        .usage
                        .as_ref()
                        .map(|u| u.demo_exhausted)
                        .unwrap_or(false),
                },
            };
            return Ok(ChatOutcome::failed(failure));
        }

        let mut turns = Vec::with_capacity(history.len() + 2);
        turns.push(ChatTurn::system(SYSTEM_INSTRUCTION));
        turns.extend_from_slice(history);
        turns.push(ChatTurn::user(message));

        let reply = match self.completion.complete(&turns).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(
                    principal_id = %principal.id,
                    error = %e,
                    "completion failed, no quota consumed"
                );
                return Ok(ChatOutcome::failed(ChatFailure::CompletionError));
            }
        };

        // The user already has their answer; accounting runs detached
        // and its failures only get logged.
        let limiter = Arc::clone(&self.limiter);
        let principal = principal.clone();
        let query_text = message.to_string();
        let response_length = reply.chars().count() as i64;
        tokio::spawn(async move {
            if let Err(e) = limiter
                .log_query(&principal, &query_text, response_length)
                .await
            {
                tracing::warn!(
                    principal_id = %principal.id,
                    error = %e,
                    "failed to record query usage"
                );
            }
        });

        Ok(ChatOutcome::logged(reply))
    }

    /// Pull entitlement state once per principal per process lifetime.
    /// Returns whether the principal is ready to be limit-checked.
    async fn ensure_ready(&self, principal: &Principal) -> bool {
        if self.ready.read().await.contains(&principal.id) {
            return true;
        }

        match self.reconciler.reconcile(principal, false).await {
            Ok(_) => {
                self.ready.write().await.insert(principal.id.clone());
                true
            }
            Err(e) => {
                tracing::warn!(
                    principal_id = %principal.id,
                    error = %e,
                    "entitlement pull failed, request deferred"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::{EntitlementPatch, InMemoryEntitlementStore};
    use crate::plans::PlanTier;
    use crate::testing::{MockBillingClient, MockCompletionClient};

    fn principal() -> Principal {
        Principal {
            id: "user_1".to_string(),
            email: "a@example.com".to_string(),
            expires_at: None,
        }
    }

    fn orchestrator(
        store: InMemoryEntitlementStore,
        billing: MockBillingClient,
        completion: MockCompletionClient,
    ) -> ChatOrchestrator<InMemoryEntitlementStore, MockBillingClient, MockCompletionClient> {
        ChatOrchestrator::new(
            Arc::new(UsageLimiter::new(store.clone())),
            Arc::new(ReconcileManager::new(store, billing)),
            completion,
        )
    }

    #[tokio::test]
    async fn missing_principal_fails_no_auth() {
        let orch = orchestrator(
            InMemoryEntitlementStore::new(),
            MockBillingClient::new(),
            MockCompletionClient::replying("hi"),
        );

        let outcome = orch.handle_chat(None, "hello", &[]).await.unwrap();
        assert_eq!(outcome.state, RequestState::Failed);
        assert_eq!(outcome.failure, Some(ChatFailure::NoAuth));
    }

    #[tokio::test]
    async fn expired_session_fails_no_auth() {
        let orch = orchestrator(
            InMemoryEntitlementStore::new(),
            MockBillingClient::new(),
            MockCompletionClient::replying("hi"),
        );

        let expired = Principal {
            expires_at: Some(chrono::Utc::now().timestamp() - 60),
            ..principal()
        };
        let outcome = orch.handle_chat(Some(&expired), "hello", &[]).await.unwrap();
        assert_eq!(outcome.failure, Some(ChatFailure::NoAuth));
    }

    #[tokio::test]
    async fn unsubscribed_identity_is_denied_after_pull() {
        let orch = orchestrator(
            InMemoryEntitlementStore::new(),
            MockBillingClient::new(),
            MockCompletionClient::replying("hi"),
        );

        let outcome = orch
            .handle_chat(Some(&principal()), "hello", &[])
            .await
            .unwrap();
        assert_eq!(outcome.failure, Some(ChatFailure::NoSubscription));
    }

    #[tokio::test]
    async fn billing_outage_defers_instead_of_denying() {
        let billing = MockBillingClient::new();
        billing.fail_next_calls(true).await;

        let orch = orchestrator(
            InMemoryEntitlementStore::new(),
            billing,
            MockCompletionClient::replying("hi"),
        );

        let outcome = orch
            .handle_chat(Some(&principal()), "hello", &[])
            .await
            .unwrap();
        assert_eq!(outcome.failure, Some(ChatFailure::Verifying));
    }

    #[tokio::test]
    async fn subscribed_identity_gets_reply_and_usage_is_logged() {
        let store = InMemoryEntitlementStore::new();
        store
            .upsert(
                "a@example.com",
                EntitlementPatch {
                    principal_id: Some("user_1".into()),
                    plan_tier: Some(PlanTier::Demo),
                    is_active: Some(true),
                    is_demo_user: Some(true),
                    queries_remaining: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let orch = orchestrator(
            store.clone(),
            MockBillingClient::new(),
            MockCompletionClient::replying("the answer"),
        );

        let outcome = orch
            .handle_chat(Some(&principal()), "a question", &[])
            .await
            .unwrap();
        assert_eq!(outcome.state, RequestState::Logged);
        assert_eq!(outcome.reply.as_deref(), Some("the answer"));

        // logging runs on a detached task
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let record = store.get_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(record.queries_remaining, 2);
        assert_eq!(store.query_log().await.len(), 1);
    }

    #[tokio::test]
    async fn completion_failure_consumes_no_quota() {
        let store = InMemoryEntitlementStore::new();
        store
            .upsert(
                "a@example.com",
                EntitlementPatch {
                    principal_id: Some("user_1".into()),
                    plan_tier: Some(PlanTier::Demo),
                    is_active: Some(true),
                    is_demo_user: Some(true),
                    queries_remaining: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let orch = orchestrator(
            store.clone(),
            MockBillingClient::new(),
            MockCompletionClient::failing(),
        );

        let outcome = orch
            .handle_chat(Some(&principal()), "a question", &[])
            .await
            .unwrap();
        assert_eq!(outcome.failure, Some(ChatFailure::CompletionError));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let record = store.get_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(record.queries_remaining, 3);
        assert!(store.query_log().await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_demo_failure_carries_the_flag() {
        let store = InMemoryEntitlementStore::new();
        store
            .upsert(
                "a@example.com",
                EntitlementPatch {
                    principal_id: Some("user_1".into()),
                    plan_tier: Some(PlanTier::Demo),
                    is_active: Some(true),
                    is_demo_user: Some(true),
                    queries_remaining: Some(0),
                    queries_used: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let orch = orchestrator(
            store,
            MockBillingClient::new(),
            MockCompletionClient::replying("hi"),
        );

        let outcome = orch
            .handle_chat(Some(&principal()), "hello", &[])
            .await
            .unwrap();
        assert_eq!(
            outcome.failure,
            Some(ChatFailure::LimitExceeded {
                demo_exhausted: true
            })
        );
    }
}
