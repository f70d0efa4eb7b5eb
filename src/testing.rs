//! Mock collaborators for tests and local development.
//!
//! Shipped unconditionally so downstream integration tests can drive
//! the managers without a billing account, an identity service, or a
//! completion provider.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::auth::{IdentityProvider, Principal};
use crate::billing::{
    BillingClient, BillingCustomer, BillingSubscription, CheckoutSession, CheckoutSessionRequest,
};
use crate::completion::{ChatTurn, CompletionClient};
use crate::error::{GateError, Result};

/// Scriptable in-memory billing client. Clones share state.
#[derive(Clone, Default)]
pub struct MockBillingClient {
    inner: Arc<MockBillingInner>,
}

#[derive(Default)]
struct MockBillingInner {
    /// email -> customer id
    customers: RwLock<HashMap<String, String>>,
    /// customer id -> subscriptions
    subscriptions: RwLock<HashMap<String, Vec<BillingSubscription>>>,
    /// price id -> unit amount
    prices: RwLock<HashMap<String, i64>>,
    checkout_requests: RwLock<Vec<CheckoutSessionRequest>>,
    fail_calls: RwLock<bool>,
    calls: RwLock<u64>,
}

impl MockBillingClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_customer(&self, email: &str, customer_id: &str) {
        self.inner
            .customers
            .write()
            .await
            .insert(email.to_string(), customer_id.to_string());
    }

    pub async fn set_subscriptions(&self, customer_id: &str, subscriptions: Vec<BillingSubscription>) {
        self.inner
            .subscriptions
            .write()
            .await
            .insert(customer_id.to_string(), subscriptions);
    }

    pub async fn set_price(&self, price_id: &str, unit_amount: i64) {
        self.inner
            .prices
            .write()
            .await
            .insert(price_id.to_string(), unit_amount);
    }

    /// Make every subsequent call fail, simulating a processor outage.
    pub async fn fail_next_calls(&self, fail: bool) {
        *self.inner.fail_calls.write().await = fail;
    }

    /// Checkout requests seen so far, oldest first.
    pub async fn checkout_requests(&self) -> Vec<CheckoutSessionRequest> {
        self.inner.checkout_requests.read().await.clone()
    }

    /// Total client calls attempted, failed ones included.
    pub async fn call_count(&self) -> u64 {
        *self.inner.calls.read().await
    }

    async fn begin_call(&self) -> Result<()> {
        *self.inner.calls.write().await += 1;
        if *self.inner.fail_calls.read().await {
            return Err(GateError::unavailable("simulated billing outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingClient for MockBillingClient {
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<BillingCustomer>> {
        self.begin_call().await?;
        Ok(self
            .inner
            .customers
            .read()
            .await
            .get(email)
            .map(|id| BillingCustomer {
                id: id.clone(),
                email: Some(email.to_string()),
            }))
    }

    async fn list_subscriptions(&self, customer_ref: &str) -> Result<Vec<BillingSubscription>> {
        self.begin_call().await?;
        Ok(self
            .inner
            .subscriptions
            .read()
            .await
            .get(customer_ref)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_price_amount(&self, price_id: &str) -> Result<Option<i64>> {
        self.begin_call().await?;
        Ok(self.inner.prices.read().await.get(price_id).copied())
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSession> {
        self.begin_call().await?;
        let id = format!("cs_test_{}", uuid::Uuid::new_v4().simple());
        self.inner.checkout_requests.write().await.push(request);
        Ok(CheckoutSession {
            url: format!("https://checkout.example.com/{}", id),
            id,
        })
    }
}

/// Identity provider resolving tokens from a fixed map.
#[derive(Clone, Default)]
pub struct MockIdentityProvider {
    users: Arc<RwLock<HashMap<String, Principal>>>,
}

impl MockIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_token(&self, token: &str, principal: Principal) {
        self.users
            .write()
            .await
            .insert(token.to_string(), principal);
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn get_user(&self, token: &str) -> Result<Principal> {
        self.users
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| GateError::auth("invalid or expired token"))
    }
}

/// Completion client with a canned reply or a scripted failure.
#[derive(Clone)]
pub struct MockCompletionClient {
    reply: Option<String>,
    calls: Arc<RwLock<Vec<Vec<ChatTurn>>>>,
}

impl MockCompletionClient {
    /// A client that always answers with `reply`.
    #[must_use]
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            calls: Arc::default(),
        }
    }

    /// A client whose every call fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            reply: None,
            calls: Arc::default(),
        }
    }

    /// Turn lists passed to `complete` so far.
    pub async fn calls(&self) -> Vec<Vec<ChatTurn>> {
        self.calls.read().await.clone()
    }
}

#[async_trait]
impl CompletionClient for MockCompletionClient {
    async fn complete(&self, turns: &[ChatTurn]) -> Result<String> {
        self.calls.write().await.push(turns.to_vec());
        match &self.reply {
            Some(reply) => Ok(reply.clone()),
            None => Err(GateError::Completion("simulated provider failure".to_string())),
        }
    }
}
