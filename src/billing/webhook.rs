//! Billing webhook handling.
//!
//! Push path of the sync story: signature verification, event
//! idempotency, and routing into absolute-state entitlement writes.
//! Every write is safely re-appliable, so the processor's replays and
//! out-of-order deliveries self-correct.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::entitlements::{EntitlementPatch, EntitlementStore};
use crate::error::{GateError, Result};
use crate::limiter::UsageLimiter;
use crate::plans::PlanTier;

/// Webhook handler for billing processor events.
///
/// The signing secret is stored as [`SecretString`] to prevent
/// accidental exposure in logs or debug output.
pub struct WebhookHandler<S: EntitlementStore> {
    store: S,
    webhook_secret: SecretString,
    limiter: Option<Arc<UsageLimiter<S>>>,
}

impl<S: EntitlementStore> WebhookHandler<S> {
    #[must_use]
    pub fn new(store: S, webhook_secret: impl Into<SecretString>) -> Self {
        Self {
            store,
            webhook_secret: webhook_secret.into(),
            limiter: None,
        }
    }

    /// Drop the limiter's cached decision for a principal whenever an
    /// event rewrites their entitlement row, so a cancellation takes
    /// effect immediately instead of after the decision TTL.
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<UsageLimiter<S>>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    async fn invalidate_decision(&self, principal_id: Option<&str>) {
        if let (Some(limiter), Some(principal_id)) = (&self.limiter, principal_id) {
            limiter.invalidate(principal_id).await;
        }
    }

    /// Verify the webhook signature and parse the event.
    ///
    /// # Arguments
    /// * `payload` - The raw request body
    /// * `signature` - The signature header value
    ///
    /// # Errors
    /// Returns an error if signature verification fails or the payload
    /// is invalid. Nothing is mutated on failure.
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent> {
        let sig_parts = parse_signature_header(signature)?;

        // Timestamp must be recent (within 5 minutes)
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0) as i64;

        let timestamp_diff = (now - sig_parts.timestamp).abs();
        if timestamp_diff > 300 {
            return Err(GateError::validation("webhook timestamp too old"));
        }

        let signed_payload = format!(
            "{}.{}",
            sig_parts.timestamp,
            String::from_utf8_lossy(payload)
        );
        let expected_sig =
            compute_signature(self.webhook_secret.expose_secret(), signed_payload.as_bytes())?;

        // Constant-time comparison
        let expected_bytes = hex::decode(&expected_sig)
            .map_err(|_| GateError::internal("hex decode error"))?;
        let provided_bytes =
            hex::decode(&sig_parts.signature).map_err(|_| GateError::SignatureInvalid)?;

        if expected_bytes.ct_eq(&provided_bytes).unwrap_u8() != 1 {
            return Err(GateError::SignatureInvalid);
        }

        // Detailed parse errors stay in server logs only
        let event: WebhookEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(error = %e, "failed to parse webhook payload");
            GateError::validation("malformed webhook payload")
        })?;

        Ok(event)
    }

    /// Process a verified webhook event.
    ///
    /// Handles idempotency and routes to the matching handler. Internal
    /// errors propagate as 5xx so the processor redelivers.
    pub async fn handle_event(&self, event: WebhookEvent) -> Result<WebhookOutcome> {
        if self.store.is_event_processed(&event.id).await? {
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let outcome = match event.event_type.as_str() {
            "checkout.session.completed" => self.handle_checkout_completed(&event).await?,
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.handle_subscription_updated(&event).await?
            }
            "customer.subscription.deleted" => self.handle_subscription_deleted(&event).await?,
            "invoice.payment_succeeded" | "invoice.paid" => {
                self.handle_invoice_event(&event, true).await?
            }
            "invoice.payment_failed" => self.handle_invoice_event(&event, false).await?,
            _ => WebhookOutcome::Ignored,
        };

        if !matches!(outcome, WebhookOutcome::Ignored) {
            self.store.mark_event_processed(&event.id).await?;
        }

        Ok(outcome)
    }

    /// `checkout.session.completed`: attribute the purchase via session
    /// metadata and activate the plan with a fresh query budget.
    async fn handle_checkout_completed(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let object = &event.data.object;

        let Some(principal_id) = object
            .get("metadata")
            .and_then(|m| m.get("principal_id"))
            .and_then(|v| v.as_str())
        else {
            tracing::warn!(event_id = %event.id, "checkout completed without principal_id metadata");
            return Ok(WebhookOutcome::Ignored);
        };

        let plan_name = object
            .get("metadata")
            .and_then(|m| m.get("plan_name"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let Some(tier) = PlanTier::parse(plan_name) else {
            tracing::warn!(
                event_id = %event.id,
                plan_name = %plan_name,
                "checkout completed with unknown plan name"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let customer_ref = object
            .get("customer")
            .and_then(|v| v.as_str())
            .map(String::from);

        let email = object
            .get("customer_details")
            .and_then(|d| d.get("email"))
            .and_then(|v| v.as_str())
            .or_else(|| object.get("customer_email").and_then(|v| v.as_str()))
            .map(String::from);

        let email = match email {
            Some(email) => email,
            None => {
                // Fall back to the row the checkout manager seeded
                match self.store.get_by_principal(principal_id).await? {
                    Some(record) => record.email,
                    None => {
                        tracing::warn!(
                            event_id = %event.id,
                            principal_id = %principal_id,
                            "checkout completed for unknown identity"
                        );
                        return Ok(WebhookOutcome::Ignored);
                    }
                }
            }
        };

        self.store
            .upsert(
                &email,
                EntitlementPatch {
                    principal_id: Some(principal_id.to_string()),
                    plan_tier: Some(tier),
                    is_active: Some(true),
                    billing_customer_ref: customer_ref,
                    queries_used: Some(0),
                    queries_remaining: Some(tier.monthly_query_limit()),
                    ..Default::default()
                },
            )
            .await?;
        self.invalidate_decision(Some(principal_id)).await;

        tracing::info!(
            event_id = %event.id,
            principal_id = %principal_id,
            tier = %tier,
            "activated plan from checkout"
        );
        Ok(WebhookOutcome::Processed)
    }

    /// `customer.subscription.created` / `.updated`: mirror the
    /// subscription's state onto the row keyed by customer ref.
    async fn handle_subscription_updated(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let object = &event.data.object;

        let customer_ref = object
            .get("customer")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GateError::validation("subscription event missing customer"))?;

        let Some(record) = self.store.get_by_customer_ref(customer_ref).await? else {
            tracing::warn!(
                event_id = %event.id,
                customer_ref = %customer_ref,
                "subscription event for unknown customer"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let status = object.get("status").and_then(|v| v.as_str()).unwrap_or("");
        let is_active = status == "active";
        let period_end = object.get("current_period_end").and_then(|v| v.as_i64());

        let unit_amount = object
            .get("items")
            .and_then(|i| i.get("data"))
            .and_then(|d| d.as_array())
            .and_then(|items| items.first())
            .and_then(|item| item.get("price"))
            .and_then(|p| p.get("unit_amount"))
            .and_then(|v| v.as_i64());
        let tier = match unit_amount {
            Some(amount) => PlanTier::from_price_amount(amount),
            None => record.plan_tier,
        };

        let mut patch = EntitlementPatch {
            plan_tier: Some(tier),
            is_active: Some(is_active),
            period_end,
            ..Default::default()
        };
        if tier != record.plan_tier {
            patch.queries_used = Some(0);
            patch.queries_remaining = Some(tier.monthly_query_limit());
        }

        self.store.upsert(&record.email, patch).await?;
        self.invalidate_decision(record.principal_id.as_deref()).await;

        tracing::info!(
            event_id = %event.id,
            customer_ref = %customer_ref,
            status = %status,
            tier = %tier,
            "synced subscription state"
        );
        Ok(WebhookOutcome::Processed)
    }

    /// `customer.subscription.deleted`: revoke access immediately.
    async fn handle_subscription_deleted(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let customer_ref = event
            .data
            .object
            .get("customer")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GateError::validation("subscription event missing customer"))?;

        let Some(record) = self.store.get_by_customer_ref(customer_ref).await? else {
            tracing::warn!(
                event_id = %event.id,
                customer_ref = %customer_ref,
                "subscription deletion for unknown customer"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        self.store
            .upsert(
                &record.email,
                EntitlementPatch {
                    plan_tier: Some(PlanTier::None),
                    is_active: Some(false),
                    period_end: Some(chrono::Utc::now().timestamp()),
                    queries_remaining: Some(0),
                    ..Default::default()
                },
            )
            .await?;
        self.invalidate_decision(record.principal_id.as_deref()).await;

        tracing::info!(
            event_id = %event.id,
            customer_ref = %customer_ref,
            "revoked entitlement for deleted subscription"
        );
        Ok(WebhookOutcome::Processed)
    }

    /// Invoice outcomes are acknowledged only; the entitlement change
    /// rides the corresponding `customer.subscription.updated` event.
    async fn handle_invoice_event(
        &self,
        event: &WebhookEvent,
        succeeded: bool,
    ) -> Result<WebhookOutcome> {
        let customer_ref = event
            .data
            .object
            .get("customer")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        if succeeded {
            tracing::debug!(event_id = %event.id, customer_ref = %customer_ref, "invoice paid");
        } else {
            tracing::warn!(event_id = %event.id, customer_ref = %customer_ref, "invoice payment failed");
        }

        Ok(WebhookOutcome::Processed)
    }
}

/// Parsed webhook event.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookEvent {
    /// Event ID.
    pub id: String,
    /// Event type (e.g., "checkout.session.completed").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data.
    pub data: WebhookEventData,
    /// Timestamp when the event was created.
    pub created: u64,
}

/// Webhook event data.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookEventData {
    /// The object that triggered the event.
    pub object: serde_json::Value,
}

/// Outcome of webhook processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event was processed successfully.
    Processed,
    /// Event was ignored (not relevant).
    Ignored,
    /// Event was already processed (idempotency).
    AlreadyProcessed,
}

/// Parsed signature header parts.
struct SignatureParts {
    timestamp: i64,
    signature: String,
}

/// Parse the signature header (`t=<ts>,v1=<hex>`).
fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| GateError::validation("invalid signature header format"))?;

        match key.trim() {
            "t" => timestamp = value.parse().ok(),
            "v1" => signature = Some(value.to_string()),
            _ => {} // Ignore other versions
        }
    }

    Ok(SignatureParts {
        timestamp: timestamp
            .ok_or_else(|| GateError::validation("missing timestamp in signature"))?,
        signature: signature.ok_or_else(|| GateError::validation("missing v1 signature"))?,
    })
}

/// Compute HMAC-SHA256 signature.
fn compute_signature(secret: &str, payload: &[u8]) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| GateError::internal("HMAC error"))?;

    mac.update(payload);
    let result = mac.finalize();

    Ok(hex::encode(result.into_bytes()))
}

/// Sign a payload the way the processor does. Test helper.
pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let sig = compute_signature(secret, signed_payload.as_bytes()).unwrap_or_default();
    format!("t={},v1={}", timestamp, sig)
}
