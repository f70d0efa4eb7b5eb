//! End-to-end flows across the store, managers, and webhook handler,
//! all running on the in-memory store and mock collaborators.

use std::sync::Arc;

use querygate::billing::{sign_payload, BillingSubscription, WebhookEvent, WebhookEventData};
use querygate::testing::{MockBillingClient, MockCompletionClient};
use querygate::{
    ChatFailure, ChatOrchestrator, CheckoutManager, EntitlementPatch, EntitlementStore,
    InMemoryEntitlementStore, LimitReason, PlanPrices, PlanTier, Principal, ReconcileManager,
    SubscriptionStatus, UsageLimiter, WebhookHandler, WebhookOutcome,
};

const WEBHOOK_SECRET: &str = "whsec_integration_test";

fn principal(id: &str, email: &str) -> Principal {
    Principal {
        id: id.to_string(),
        email: email.to_string(),
        expires_at: None,
    }
}

fn now_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn webhook_event(id: &str, event_type: &str, object: serde_json::Value) -> WebhookEvent {
    WebhookEvent {
        id: id.to_string(),
        event_type: event_type.to_string(),
        data: WebhookEventData { object },
        created: now_ts() as u64,
    }
}

async fn seed_active(
    store: &InMemoryEntitlementStore,
    email: &str,
    principal_id: &str,
    tier: PlanTier,
    remaining: i64,
) {
    store
        .upsert(
            email,
            EntitlementPatch {
                principal_id: Some(principal_id.to_string()),
                plan_tier: Some(tier),
                is_active: Some(true),
                queries_remaining: Some(remaining),
                queries_used: Some(tier.monthly_query_limit() - remaining),
                is_demo_user: Some(tier == PlanTier::Demo),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn parallel_decrements_consume_exactly_the_budget() {
    let store = InMemoryEntitlementStore::new();
    seed_active(&store, "a@example.com", "user_1", PlanTier::Basic, 5).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.consume_query("a@example.com").await.unwrap()
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap() {
            successes += 1;
        }
    }

    assert_eq!(successes, 5);
    let record = store.get_by_email("a@example.com").await.unwrap().unwrap();
    assert_eq!(record.queries_remaining, 0);
    assert_eq!(record.queries_used, 100);
}

#[tokio::test]
async fn decrement_to_zero_then_limit_exceeded() {
    let store = InMemoryEntitlementStore::new();
    seed_active(&store, "a@example.com", "user_1", PlanTier::Demo, 3).await;
    let limiter = UsageLimiter::new(store.clone());
    let user = principal("user_1", "a@example.com");

    for i in 0..3 {
        let decision = limiter.check_limit(&user).await.unwrap();
        assert!(decision.can_proceed, "query {} should be allowed", i);
        assert!(limiter.log_query(&user, "q", 10).await.unwrap());
    }

    let decision = limiter.check_limit(&user).await.unwrap();
    assert!(!decision.can_proceed);
    assert_eq!(decision.reason, LimitReason::LimitExceeded);
    let usage = decision.usage.unwrap();
    assert_eq!(usage.queries_remaining, 0);
    assert_eq!(usage.queries_used, 3);
    assert!(usage.demo_exhausted);
}

#[tokio::test]
async fn demo_exhaustion_is_distinct_from_paid_exhaustion() {
    let store = InMemoryEntitlementStore::new();
    seed_active(&store, "demo@example.com", "user_d", PlanTier::Demo, 0).await;
    seed_active(&store, "paid@example.com", "user_p", PlanTier::Basic, 0).await;
    let limiter = UsageLimiter::new(store);

    let demo = limiter
        .check_limit(&principal("user_d", "demo@example.com"))
        .await
        .unwrap();
    assert_eq!(demo.reason, LimitReason::LimitExceeded);
    assert!(demo.usage.unwrap().demo_exhausted);

    let paid = limiter
        .check_limit(&principal("user_p", "paid@example.com"))
        .await
        .unwrap();
    assert_eq!(paid.reason, LimitReason::LimitExceeded);
    assert!(!paid.usage.unwrap().demo_exhausted);
}

#[tokio::test]
async fn fresh_principal_is_lazily_created_and_unsubscribed() {
    let store = InMemoryEntitlementStore::new();
    let limiter = UsageLimiter::new(store.clone());

    let decision = limiter
        .check_limit(&principal("user_new", "new@example.com"))
        .await
        .unwrap();
    assert!(!decision.can_proceed);
    assert_eq!(decision.reason, LimitReason::NoSubscription);

    let record = store.get_by_email("new@example.com").await.unwrap().unwrap();
    assert_eq!(record.plan_tier, PlanTier::None);
    assert!(!record.is_active);
    assert_eq!(record.queries_remaining, 0);
}

#[tokio::test]
async fn checkout_webhook_then_pull_round_trip() {
    let store = InMemoryEntitlementStore::new();
    let billing = MockBillingClient::new();
    let user = principal("user_1", "buyer@example.com");

    // 1. the user starts a checkout for the Professional plan
    let checkout = CheckoutManager::new(
        store.clone(),
        billing.clone(),
        PlanPrices {
            basic: Some("price_basic".into()),
            professional: Some("price_pro".into()),
            academy: Some("price_academy".into()),
        },
    );
    checkout
        .create_session(&user, "Profesional", "https://ok", "https://no")
        .await
        .unwrap();

    // 2. the processor confirms via webhook
    let webhook = WebhookHandler::new(store.clone(), WEBHOOK_SECRET);
    let outcome = webhook
        .handle_event(webhook_event(
            "evt_checkout_1",
            "checkout.session.completed",
            serde_json::json!({
                "customer": "cus_buyer",
                "customer_details": {"email": "buyer@example.com"},
                "metadata": {"principal_id": "user_1", "plan_name": "Profesional"}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Processed);

    let record = store.get_by_email("buyer@example.com").await.unwrap().unwrap();
    assert!(record.is_active);
    assert_eq!(record.plan_tier, PlanTier::Professional);
    assert_eq!(record.queries_remaining, 3000);

    // 3. a later pull sees the same subscription and preserves the counters
    store.consume_query("buyer@example.com").await.unwrap();

    billing.add_customer("buyer@example.com", "cus_buyer").await;
    billing
        .set_subscriptions(
            "cus_buyer",
            vec![BillingSubscription {
                id: "sub_buyer".into(),
                status: SubscriptionStatus::Active,
                price_id: Some("price_pro".into()),
                unit_amount: Some(1500),
                current_period_end: Some(now_ts() + 30 * 24 * 3600),
            }],
        )
        .await;

    let reconciler = ReconcileManager::new(store.clone(), billing);
    let summary = reconciler.reconcile(&user, false).await.unwrap();
    assert!(summary.subscribed);
    assert_eq!(summary.tier, PlanTier::Professional);

    let record = store.get_by_email("buyer@example.com").await.unwrap().unwrap();
    assert!(record.is_active);
    assert_eq!(record.plan_tier, PlanTier::Professional);
    assert_eq!(record.queries_remaining, 2999);
    assert_eq!(record.queries_used, 1);
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let store = InMemoryEntitlementStore::new();
    let billing = MockBillingClient::new();
    let user = principal("user_1", "a@example.com");

    billing.add_customer("a@example.com", "cus_1").await;
    let period_end = now_ts() + 20 * 24 * 3600;
    billing
        .set_subscriptions(
            "cus_1",
            vec![BillingSubscription {
                id: "sub_1".into(),
                status: SubscriptionStatus::Active,
                price_id: Some("price_basic".into()),
                unit_amount: Some(900),
                current_period_end: Some(period_end),
            }],
        )
        .await;

    // fresh manager each round so the pull cache does not short-circuit
    for _ in 0..3 {
        let reconciler = ReconcileManager::new(store.clone(), billing.clone());
        let summary = reconciler.reconcile(&user, false).await.unwrap();
        assert!(summary.subscribed);
        assert_eq!(summary.tier, PlanTier::Basic);
    }

    let record = store.get_by_email("a@example.com").await.unwrap().unwrap();
    assert_eq!(record.plan_tier, PlanTier::Basic);
    assert_eq!(record.queries_remaining, 100);
    assert_eq!(record.queries_used, 0);
    assert_eq!(record.period_end, Some(period_end));

    // consumed budget survives further reconciliations of the same state
    store.consume_query("a@example.com").await.unwrap();
    let reconciler = ReconcileManager::new(store.clone(), billing);
    reconciler.reconcile(&user, false).await.unwrap();

    let record = store.get_by_email("a@example.com").await.unwrap().unwrap();
    assert_eq!(record.queries_remaining, 99);
    assert_eq!(record.queries_used, 1);
}

#[tokio::test]
async fn reconciliation_preserves_live_demo_grants() {
    let store = InMemoryEntitlementStore::new();
    seed_active(&store, "demo@example.com", "user_d", PlanTier::Demo, 2).await;

    let reconciler = ReconcileManager::new(store.clone(), MockBillingClient::new());
    let summary = reconciler
        .reconcile(&principal("user_d", "demo@example.com"), false)
        .await
        .unwrap();
    assert!(summary.subscribed);
    assert_eq!(summary.tier, PlanTier::Demo);

    let record = store.get_by_email("demo@example.com").await.unwrap().unwrap();
    assert!(record.is_active);
    assert_eq!(record.plan_tier, PlanTier::Demo);
    assert_eq!(record.queries_remaining, 2);
}

#[tokio::test]
async fn tampered_webhook_is_rejected_without_mutation() {
    let store = InMemoryEntitlementStore::new();
    let handler = WebhookHandler::new(store.clone(), WEBHOOK_SECRET);

    let payload = serde_json::json!({
        "id": "evt_forged",
        "type": "checkout.session.completed",
        "data": {"object": {
            "customer": "cus_evil",
            "customer_details": {"email": "evil@example.com"},
            "metadata": {"principal_id": "user_evil", "plan_name": "Academy"}
        }},
        "created": now_ts()
    })
    .to_string();

    // signed with the wrong secret
    let signature = sign_payload("whsec_wrong", payload.as_bytes(), now_ts());
    assert!(handler.verify_signature(payload.as_bytes(), &signature).is_err());

    // signed correctly, then altered in transit
    let signature = sign_payload(WEBHOOK_SECRET, payload.as_bytes(), now_ts());
    let tampered = payload.replace("Academy", "Basic");
    assert!(handler.verify_signature(tampered.as_bytes(), &signature).is_err());

    assert!(store.get_by_email("evil@example.com").await.unwrap().is_none());
    assert!(!store.is_event_processed("evt_forged").await.unwrap());
}

#[tokio::test]
async fn cancellation_gates_access_despite_stale_counter() {
    let store = InMemoryEntitlementStore::new();
    seed_active(&store, "a@example.com", "user_1", PlanTier::Basic, 50).await;
    store
        .upsert(
            "a@example.com",
            EntitlementPatch {
                billing_customer_ref: Some("cus_1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let handler = WebhookHandler::new(store.clone(), WEBHOOK_SECRET);
    let outcome = handler
        .handle_event(webhook_event(
            "evt_cancel",
            "customer.subscription.deleted",
            serde_json::json!({"id": "sub_1", "customer": "cus_1"}),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Processed);

    // even if the counter had stayed positive, the flags gate access
    let limiter = UsageLimiter::new(store.clone());
    let decision = limiter
        .check_limit(&principal("user_1", "a@example.com"))
        .await
        .unwrap();
    assert!(!decision.can_proceed);
    assert_eq!(decision.reason, LimitReason::NoSubscription);
}

#[tokio::test]
async fn demo_grant_is_one_way_per_identity() {
    let store = InMemoryEntitlementStore::new();
    let service = querygate::DemoGrantService::new(store.clone());
    let user = principal("user_1", "a@example.com");

    assert!(service.grant(&user, "198.51.100.4").await.unwrap());

    // exhaust the demo
    for _ in 0..3 {
        store.consume_query("a@example.com").await.unwrap();
    }

    // no second grant, no counter reset
    assert!(!service.grant(&user, "198.51.100.4").await.unwrap());
    assert!(!service.grant(&user, "203.0.113.77").await.unwrap());

    let record = store.get_by_email("a@example.com").await.unwrap().unwrap();
    assert_eq!(record.queries_remaining, 0);
    assert_eq!(record.queries_used, 3);
}

#[tokio::test]
async fn full_chat_flow_from_demo_grant_to_exhaustion() {
    let store = InMemoryEntitlementStore::new();
    let billing = MockBillingClient::new();
    let user = principal("user_1", "a@example.com");

    let service = querygate::DemoGrantService::new(store.clone());
    assert!(service.grant(&user, "198.51.100.4").await.unwrap());

    let limiter = Arc::new(UsageLimiter::new(store.clone()));
    let reconciler = Arc::new(ReconcileManager::new(store.clone(), billing));
    let orchestrator = ChatOrchestrator::new(
        limiter,
        reconciler,
        MockCompletionClient::replying("here is your answer"),
    );

    for _ in 0..3 {
        let outcome = orchestrator
            .handle_chat(Some(&user), "a question", &[])
            .await
            .unwrap();
        assert_eq!(outcome.reply.as_deref(), Some("here is your answer"));
        // usage is recorded on a detached task
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    let outcome = orchestrator
        .handle_chat(Some(&user), "one more", &[])
        .await
        .unwrap();
    assert_eq!(
        outcome.failure,
        Some(ChatFailure::LimitExceeded {
            demo_exhausted: true
        })
    );
}
