//! Billing processor integration: the client seam, checkout session
//! creation, and both halves of the entitlement sync story (pull-path
//! reconciliation and push-path webhooks).

mod checkout;
mod client;
mod live_client;
mod reconcile;
mod webhook;

pub use checkout::CheckoutManager;
pub use client::{
    BillingClient, BillingCustomer, BillingSubscription, CheckoutSession, CheckoutSessionRequest,
    SubscriptionStatus,
};
pub use live_client::LiveBillingClient;
pub use reconcile::{ReconcileManager, SubscriptionSummary};
pub use webhook::{sign_payload, WebhookEvent, WebhookEventData, WebhookHandler, WebhookOutcome};
