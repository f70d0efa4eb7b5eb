//! Checkout session creation.
//!
//! Sessions carry the principal id and plan name as metadata so the
//! `checkout.session.completed` webhook can attribute the purchase.
//! The entitlement row gets the discovered customer ref up front;
//! activation itself waits for the webhook.

use super::client::{BillingClient, CheckoutSession, CheckoutSessionRequest};
use crate::auth::Principal;
use crate::config::PlanPrices;
use crate::entitlements::{EntitlementPatch, EntitlementStore};
use crate::error::{GateError, Result};
use crate::plans::PlanTier;

pub struct CheckoutManager<S: EntitlementStore, C: BillingClient> {
    store: S,
    client: C,
    prices: PlanPrices,
}

impl<S: EntitlementStore, C: BillingClient> CheckoutManager<S, C> {
    #[must_use]
    pub fn new(store: S, client: C, prices: PlanPrices) -> Self {
        Self {
            store,
            client,
            prices,
        }
    }

    /// Create a checkout session for the named plan.
    ///
    /// # Errors
    ///
    /// Fails with [`GateError::Validation`] for unknown or
    /// non-purchasable plan names and for tiers without a configured
    /// price.
    pub async fn create_session(
        &self,
        principal: &Principal,
        plan_name: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSession> {
        let tier = PlanTier::parse(plan_name)
            .ok_or_else(|| GateError::validation(format!("unknown plan: {}", plan_name)))?;
        let price_id = self.price_for(tier)?;

        let record = self.store.get_by_email(&principal.email).await?;
        let customer_ref = match record.as_ref().and_then(|r| r.billing_customer_ref.clone()) {
            Some(customer_ref) => Some(customer_ref),
            None => self
                .client
                .find_customer_by_email(&principal.email)
                .await?
                .map(|c| c.id),
        };

        let session = self
            .client
            .create_checkout_session(CheckoutSessionRequest {
                customer_ref: customer_ref.clone(),
                customer_email: Some(principal.email.clone()),
                price_id,
                success_url: success_url.to_string(),
                cancel_url: cancel_url.to_string(),
                principal_id: principal.id.clone(),
                plan_name: plan_name.to_string(),
            })
            .await?;

        // Seed the row so the webhook finds it; an existing record only
        // gains the customer ref and keeps its current access.
        let patch = match record {
            Some(_) => EntitlementPatch {
                principal_id: Some(principal.id.clone()),
                billing_customer_ref: customer_ref,
                ..Default::default()
            },
            None => EntitlementPatch {
                principal_id: Some(principal.id.clone()),
                billing_customer_ref: customer_ref,
                is_active: Some(false),
                plan_tier: Some(PlanTier::None),
                ..Default::default()
            },
        };
        self.store.upsert(&principal.email, patch).await?;

        tracing::info!(
            principal_id = %principal.id,
            plan = %tier,
            session_id = %session.id,
            "created checkout session"
        );

        Ok(session)
    }

    fn price_for(&self, tier: PlanTier) -> Result<String> {
        let price = match tier {
            PlanTier::Basic => self.prices.basic.clone(),
            PlanTier::Professional => self.prices.professional.clone(),
            PlanTier::Academy => self.prices.academy.clone(),
            PlanTier::Demo | PlanTier::None => {
                return Err(GateError::validation(format!(
                    "plan {} is not purchasable",
                    tier.display_name()
                )))
            }
        };
        price.ok_or_else(|| {
            GateError::validation(format!(
                "no price configured for plan {}",
                tier.display_name()
            ))
        })
    }
}
