//! Billing processor client trait and wire types.
//!
//! The processor is the source of truth for subscription state; this
//! crate only mirrors it. Everything the rest of the system needs from
//! the processor goes through [`BillingClient`], so tests run against a
//! mock and production against [`LiveBillingClient`].
//!
//! [`LiveBillingClient`]: super::LiveBillingClient

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;

/// Subscription status as reported by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
    Unknown,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn from_str(status: &str) -> Self {
        match status {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "canceled" => Self::Canceled,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "unpaid" => Self::Unpaid,
            "paused" => Self::Paused,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Unpaid => "unpaid",
            Self::Paused => "paused",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this status grants access at all. `past_due` keeps
    /// access, bounded by the grace window applied in reconciliation.
    #[must_use]
    pub fn is_entitled(self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Processor customer, as much of it as this crate needs.
#[derive(Debug, Clone)]
pub struct BillingCustomer {
    pub id: String,
    pub email: Option<String>,
}

/// Subscription summary returned by the processor.
#[derive(Debug, Clone)]
pub struct BillingSubscription {
    pub id: String,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    /// Price amount in minor units, present when the listing expanded
    /// price data.
    pub unit_amount: Option<i64>,
    pub current_period_end: Option<i64>,
}

/// Parameters for a new checkout session.
#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    /// Existing processor customer to attach, when known.
    pub customer_ref: Option<String>,
    /// Email for customer creation when no ref is known.
    pub customer_email: Option<String>,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Carried back verbatim on `checkout.session.completed`.
    pub principal_id: String,
    pub plan_name: String,
}

/// A created checkout session.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Client for the billing processor's REST API.
#[async_trait]
pub trait BillingClient: Send + Sync {
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<BillingCustomer>>;

    /// List the customer's subscriptions across all statuses, with
    /// price data expanded where the processor supports it.
    async fn list_subscriptions(&self, customer_ref: &str) -> Result<Vec<BillingSubscription>>;

    async fn get_price_amount(&self, price_id: &str) -> Result<Option<i64>>;

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSession>;
}

#[async_trait]
impl<T: BillingClient + ?Sized> BillingClient for Arc<T> {
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<BillingCustomer>> {
        (**self).find_customer_by_email(email).await
    }

    async fn list_subscriptions(&self, customer_ref: &str) -> Result<Vec<BillingSubscription>> {
        (**self).list_subscriptions(customer_ref).await
    }

    async fn get_price_amount(&self, price_id: &str) -> Result<Option<i64>> {
        (**self).get_price_amount(price_id).await
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSession> {
        (**self).create_checkout_session(request).await
    }
}
