use std::sync::Arc;

use querygate::http::{AppState, SharedBilling, SharedCompletion, SharedStore};
use querygate::{
    CheckoutManager, ChatOrchestrator, Config, DemoGrantService, HttpCompletionClient,
    HttpIdentityProvider, InMemoryEntitlementStore, LiveBillingClient, ReconcileManager,
    UsageLimiter, WebhookHandler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    querygate::init_tracing();

    let config = Config::from_env()?;

    let store = build_store(&config).await?;
    let billing: SharedBilling =
        Arc::new(LiveBillingClient::new(config.billing.secret_key.clone())?);
    let completion: SharedCompletion = Arc::new(HttpCompletionClient::new(&config.completion)?);
    let identity = Arc::new(HttpIdentityProvider::new(config.identity.base_url.clone())?);

    let limiter = Arc::new(UsageLimiter::new(store.clone()));
    let reconciler = Arc::new(
        ReconcileManager::new(store.clone(), billing.clone()).with_limiter(limiter.clone()),
    );
    let checkout = Arc::new(CheckoutManager::new(
        store.clone(),
        billing.clone(),
        config.billing.prices.clone(),
    ));
    let demo = Arc::new(DemoGrantService::new(store.clone()));
    let webhook = Arc::new(
        WebhookHandler::new(store.clone(), config.billing.webhook_secret.clone())
            .with_limiter(limiter.clone()),
    );
    let orchestrator = Arc::new(ChatOrchestrator::new(
        limiter.clone(),
        reconciler.clone(),
        completion,
    ));

    let state = AppState {
        identity,
        limiter,
        reconciler,
        checkout,
        demo,
        webhook,
        orchestrator,
    };
    let app = querygate::router(state);

    let addr = config.server.addr()?;
    tracing::info!(addr = %addr, "starting querygate");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(feature = "database")]
async fn build_store(config: &Config) -> anyhow::Result<SharedStore> {
    use querygate::entitlements::migration::Migrator;
    use querygate::SeaOrmEntitlementStore;
    use sea_orm_migration::MigratorTrait;

    if let Some(url) = &config.database_url {
        let db = sea_orm::Database::connect(url.as_str()).await?;
        Migrator::up(&db, None).await?;
        tracing::info!("using database-backed entitlement store");
        return Ok(Arc::new(SeaOrmEntitlementStore::new(db)));
    }

    tracing::warn!("DATABASE_URL not set, using in-memory entitlement store");
    Ok(Arc::new(InMemoryEntitlementStore::new()))
}

#[cfg(not(feature = "database"))]
async fn build_store(_config: &Config) -> anyhow::Result<SharedStore> {
    tracing::warn!("built without database support, using in-memory entitlement store");
    Ok(Arc::new(InMemoryEntitlementStore::new()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
