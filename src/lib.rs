//! querygate - usage metering and entitlement resolution for a
//! subscription-gated AI chat product
//!
//! The billing processor is the source of truth for who is subscribed;
//! querygate mirrors that truth into per-identity entitlement records,
//! meters query usage against per-plan budgets, and gates every chat
//! request on the result. State converges over two paths: webhooks push
//! processor events in, and reconciliation pulls the processor's answer
//! on demand. In doubt the system denies; it never fails open.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use querygate::{Config, init_tracing};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     init_tracing();
//!     let config = Config::from_env()?;
//!     // wire stores, managers, and the router; see src/main.rs
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod billing;
pub mod cache;
mod config;
pub mod completion;
pub mod demo;
pub mod entitlements;
mod error;
pub mod http;
pub mod limiter;
pub mod orchestrator;
pub mod plans;
pub mod testing;

// Re-exports for public API
pub use auth::{HttpIdentityProvider, IdentityProvider, Principal};
pub use billing::{
    BillingClient, CheckoutManager, LiveBillingClient, ReconcileManager, SubscriptionStatus,
    SubscriptionSummary, WebhookHandler, WebhookOutcome,
};
pub use cache::TtlCache;
pub use completion::{ChatRole, ChatTurn, CompletionClient, HttpCompletionClient};
pub use config::{BillingConfig, CompletionConfig, Config, IdentityConfig, LoggingConfig, PlanPrices, ServerConfig};
pub use demo::{DemoAvailability, DemoGrantService};
pub use entitlements::{
    EntitlementPatch, EntitlementRecord, EntitlementStore, InMemoryEntitlementStore, QueryLogEntry,
};
#[cfg(feature = "database")]
pub use entitlements::SeaOrmEntitlementStore;
pub use error::{GateError, Result};
pub use http::{router, AppState};
pub use limiter::{LimitDecision, LimitReason, UsageLimiter, UsageSnapshot};
pub use orchestrator::{ChatFailure, ChatOrchestrator, ChatOutcome, RequestState};
pub use plans::PlanTier;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, before building the
/// router.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "querygate=debug")
/// - `QUERYGATE_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("QUERYGATE_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
