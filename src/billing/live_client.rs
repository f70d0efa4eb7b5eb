//! Live billing client speaking the processor's REST API.
//!
//! Plain form-encoded REST calls via reqwest with bearer auth and a
//! hard per-call timeout. Only the handful of endpoints this crate
//! needs are covered.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use super::client::{
    BillingClient, BillingCustomer, BillingSubscription, CheckoutSession, CheckoutSessionRequest,
    SubscriptionStatus,
};
use crate::error::{GateError, Result};

const DEFAULT_API_BASE: &str = "https://api.stripe.com/v1";
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Billing client backed by the processor's HTTP API.
///
/// The secret key is held as [`SecretString`] so it never appears in
/// debug output or logs.
pub struct LiveBillingClient {
    client: reqwest::Client,
    api_base: String,
    secret_key: SecretString,
}

impl LiveBillingClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(secret_key: impl Into<SecretString>) -> Result<Self> {
        Self::with_api_base(secret_key, DEFAULT_API_BASE)
    }

    /// Create a client against a non-default API base, for sandboxes.
    pub fn with_api_base(
        secret_key: impl Into<SecretString>,
        api_base: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .map_err(|e| GateError::internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = format!("{}{}", self.api_base, path);

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.secret_key.expose_secret())
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                path = %path,
                status = status.as_u16(),
                "billing API call failed"
            );
            return Err(GateError::unavailable(format!(
                "billing API returned {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        Ok(response.json().await?)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// Minimal wire shapes; unknown fields are ignored.

#[derive(Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct ApiCustomer {
    id: String,
    email: Option<String>,
}

#[derive(Deserialize)]
struct ApiSubscription {
    id: String,
    status: String,
    current_period_end: Option<i64>,
    items: Option<ApiSubscriptionItems>,
}

#[derive(Deserialize)]
struct ApiSubscriptionItems {
    data: Vec<ApiSubscriptionItem>,
}

#[derive(Deserialize)]
struct ApiSubscriptionItem {
    price: Option<ApiPrice>,
}

#[derive(Deserialize)]
struct ApiPrice {
    id: String,
    unit_amount: Option<i64>,
}

#[derive(Deserialize)]
struct ApiCheckoutSession {
    id: String,
    url: Option<String>,
}

#[async_trait]
impl BillingClient for LiveBillingClient {
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<BillingCustomer>> {
        tracing::debug!(email = %email, "looking up billing customer");

        let response: ListResponse<ApiCustomer> = self
            .get_json("/customers", &[("email", email), ("limit", "1")])
            .await?;

        Ok(response.data.into_iter().next().map(|c| BillingCustomer {
            id: c.id,
            email: c.email,
        }))
    }

    async fn list_subscriptions(&self, customer_ref: &str) -> Result<Vec<BillingSubscription>> {
        tracing::debug!(customer_ref = %customer_ref, "listing subscriptions");

        let response: ListResponse<ApiSubscription> = self
            .get_json(
                "/subscriptions",
                &[
                    ("customer", customer_ref),
                    ("status", "all"),
                    ("expand[]", "data.items.data.price"),
                ],
            )
            .await?;

        Ok(response
            .data
            .into_iter()
            .map(|s| {
                let price = s
                    .items
                    .and_then(|items| items.data.into_iter().next())
                    .and_then(|item| item.price);
                BillingSubscription {
                    id: s.id,
                    status: SubscriptionStatus::from_str(&s.status),
                    price_id: price.as_ref().map(|p| p.id.clone()),
                    unit_amount: price.and_then(|p| p.unit_amount),
                    current_period_end: s.current_period_end,
                }
            })
            .collect())
    }

    async fn get_price_amount(&self, price_id: &str) -> Result<Option<i64>> {
        tracing::debug!(price_id = %price_id, "fetching price");

        let price: ApiPrice = self
            .get_json(&format!("/prices/{}", price_id), &[])
            .await?;

        Ok(price.unit_amount)
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSession> {
        tracing::debug!(
            principal_id = %request.principal_id,
            plan_name = %request.plan_name,
            "creating checkout session"
        );

        let mut params: Vec<(&str, String)> = vec![
            ("mode", "subscription".to_string()),
            ("line_items[0][price]", request.price_id),
            ("line_items[0][quantity]", "1".to_string()),
            ("success_url", request.success_url),
            ("cancel_url", request.cancel_url),
            ("metadata[principal_id]", request.principal_id.clone()),
            ("metadata[plan_name]", request.plan_name.clone()),
            (
                "subscription_data[metadata][principal_id]",
                request.principal_id,
            ),
        ];

        if let Some(customer_ref) = request.customer_ref {
            params.push(("customer", customer_ref));
        } else if let Some(email) = request.customer_email {
            params.push(("customer_email", email));
        }

        let url = format!("{}/checkout/sessions", self.api_base);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.secret_key.expose_secret())
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "checkout session creation failed");
            return Err(GateError::unavailable(format!(
                "billing API returned {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        let session: ApiCheckoutSession = response.json().await?;
        let checkout_url = session.url.ok_or_else(|| {
            GateError::internal("checkout session created without a redirect URL")
        })?;

        Ok(CheckoutSession {
            id: session.id,
            url: checkout_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_base_trailing_slash_is_trimmed() {
        let client =
            LiveBillingClient::with_api_base("sk_test", "http://localhost:12111/v1/").unwrap();
        assert_eq!(client.api_base, "http://localhost:12111/v1");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("añejo", 2), "añ");
    }

    #[test]
    fn subscription_wire_shape_parses() {
        let raw = r#"{
            "data": [{
                "id": "sub_123",
                "status": "active",
                "current_period_end": 1702592000,
                "items": {
                    "data": [{"price": {"id": "price_pro", "unit_amount": 1500}}]
                }
            }]
        }"#;
        let parsed: ListResponse<ApiSubscription> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.data.len(), 1);
        let sub = &parsed.data[0];
        assert_eq!(sub.id, "sub_123");
        assert_eq!(
            sub.items.as_ref().unwrap().data[0]
                .price
                .as_ref()
                .unwrap()
                .unit_amount,
            Some(1500)
        );
    }
}
