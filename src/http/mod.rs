//! The axum service surface.
//!
//! Thin handlers over the managers: authentication resolves the bearer
//! token, then each route delegates to the matching manager and
//! serializes its outcome. Business denials come back as 200 responses
//! with a decision payload; only infrastructure failures map to error
//! statuses.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::{bearer_token, IdentityProvider, Principal};
use crate::billing::{
    BillingClient, CheckoutManager, ReconcileManager, WebhookHandler,
};
use crate::completion::{ChatTurn, CompletionClient};
use crate::demo::DemoGrantService;
use crate::entitlements::EntitlementStore;
use crate::error::{GateError, Result};
use crate::limiter::UsageLimiter;
use crate::orchestrator::ChatOrchestrator;

pub type SharedStore = Arc<dyn EntitlementStore>;
pub type SharedBilling = Arc<dyn BillingClient>;
pub type SharedCompletion = Arc<dyn CompletionClient>;

/// Shared application state: every manager wired over trait objects.
#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<dyn IdentityProvider>,
    pub limiter: Arc<UsageLimiter<SharedStore>>,
    pub reconciler: Arc<ReconcileManager<SharedStore, SharedBilling>>,
    pub checkout: Arc<CheckoutManager<SharedStore, SharedBilling>>,
    pub demo: Arc<DemoGrantService<SharedStore>>,
    pub webhook: Arc<WebhookHandler<SharedStore>>,
    pub orchestrator: Arc<ChatOrchestrator<SharedStore, SharedBilling, SharedCompletion>>,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/usage", post(usage))
        .route("/subscription-check", post(subscription_check))
        .route("/checkout", post(checkout))
        .route("/demo", post(demo))
        .route("/chat", post(chat))
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .with_state(state)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Principal> {
    let token = bearer_token(headers)?;
    let principal = state.identity.get_user(&token).await?;
    if principal.is_expired() {
        return Err(GateError::auth("session expired"));
    }
    Ok(principal)
}

/// Originating address for the demo ledger. The service runs behind a
/// proxy, so the forwarded headers are the only address we see.
fn client_address(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .unwrap_or_else(|| "unknown".to_string())
}

// =============================================================================
// Request bodies
// =============================================================================

#[derive(Deserialize)]
struct UsageRequest {
    action: String,
    #[serde(default)]
    query_text: Option<String>,
    #[serde(default)]
    response_length: Option<i64>,
}

#[derive(Deserialize, Default)]
struct SubscriptionCheckRequest {
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct CheckoutRequest {
    plan_name: String,
    success_url: String,
    cancel_url: String,
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UsageRequest>,
) -> Result<Json<serde_json::Value>> {
    let principal = authenticate(&state, &headers).await?;

    match body.action.as_str() {
        "check_limit" => {
            let decision = state.limiter.check_limit(&principal).await?;
            Ok(Json(serde_json::to_value(decision)?))
        }
        "log_query" => {
            let query_text = body.query_text.unwrap_or_default();
            let response_length = body.response_length.unwrap_or(0);
            state
                .limiter
                .log_query(&principal, &query_text, response_length)
                .await?;
            Ok(Json(serde_json::json!({"success": true})))
        }
        other => Err(GateError::validation(format!("unknown action: {}", other))),
    }
}

async fn subscription_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<SubscriptionCheckRequest>>,
) -> Result<Json<serde_json::Value>> {
    let principal = authenticate(&state, &headers).await?;
    let force = body.map(|Json(b)| b.force).unwrap_or(false);

    let summary = state.reconciler.reconcile(&principal, force).await?;

    Ok(Json(serde_json::json!({
        "subscribed": summary.subscribed,
        "subscription_tier": summary.tier.display_name(),
        "subscription_end": summary.period_end,
    })))
}

async fn checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CheckoutRequest>,
) -> Result<Json<serde_json::Value>> {
    let principal = authenticate(&state, &headers).await?;

    let session = state
        .checkout
        .create_session(&principal, &body.plan_name, &body.success_url, &body.cancel_url)
        .await?;

    Ok(Json(serde_json::json!({
        "session_id": session.id,
        "url": session.url,
    })))
}

async fn demo(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let principal = authenticate(&state, &headers).await?;
    let address = client_address(&headers);

    let granted = state.demo.grant(&principal, &address).await?;
    if granted {
        return Ok(Json(serde_json::json!({"granted": true})));
    }

    let availability = state.demo.check_availability(&principal, &address).await?;
    Ok(Json(serde_json::json!({
        "granted": false,
        "reason": availability.reason,
    })))
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Result<Json<serde_json::Value>> {
    // Auth failures become a typed outcome, not a 401, so the client
    // can render them like any other chat denial
    let principal = match authenticate(&state, &headers).await {
        Ok(principal) => Some(principal),
        Err(GateError::Auth(_)) => None,
        Err(e) => return Err(e),
    };

    let outcome = state
        .orchestrator
        .handle_chat(principal.as_ref(), &body.message, &body.history)
        .await?;

    Ok(Json(serde_json::to_value(outcome)?))
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GateError::validation("missing signature header"))?;

    let event = state.webhook.verify_signature(&body, signature)?;
    let outcome = state.webhook.handle_event(event).await?;

    tracing::debug!(outcome = ?outcome, "webhook handled");
    Ok(Json(serde_json::json!({"received": true})))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
