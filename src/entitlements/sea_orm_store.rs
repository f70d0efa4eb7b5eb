//! SeaORM-backed entitlement storage.
//!
//! Production persistence for entitlement state. The query-consumption
//! guard lives in the database as a conditional UPDATE, so concurrent
//! requests on the same email serialize at the row and the counter can
//! never go negative.

use async_trait::async_trait;
use sea_orm::{
    entity::prelude::*, sea_query::OnConflict, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set,
};

use super::record::{EntitlementPatch, EntitlementRecord, QueryLogEntry};
use super::store::EntitlementStore;
use crate::error::{GateError, Result};
use crate::plans::PlanTier;

// =============================================================================
// SeaORM Entities
// =============================================================================

mod entity {
    use sea_orm::entity::prelude::*;

    pub mod entitlement_record {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "entitlement_records")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub email: String,
            pub principal_id: Option<String>,
            pub plan_tier: String,
            pub is_active: bool,
            pub billing_customer_ref: Option<String>,
            pub queries_used: i64,
            pub queries_remaining: i64,
            pub period_end: Option<i64>,
            pub is_demo_user: bool,
            pub updated_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod query_log {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "query_log")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i64,
            pub principal_id: String,
            pub query_text: String,
            pub response_length: i64,
            pub created_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod demo_address_usage {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "demo_address_usage")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i64,
            pub address: String,
            pub granted_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod processed_billing_event {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "processed_billing_events")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub event_id: String,
            pub processed_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{demo_address_usage, entitlement_record, processed_billing_event, query_log};

// =============================================================================
// Helper Functions
// =============================================================================

fn model_to_record(model: entitlement_record::Model) -> EntitlementRecord {
    EntitlementRecord {
        email: model.email,
        principal_id: model.principal_id,
        plan_tier: PlanTier::from_str(&model.plan_tier),
        is_active: model.is_active,
        billing_customer_ref: model.billing_customer_ref,
        queries_used: model.queries_used,
        queries_remaining: model.queries_remaining,
        period_end: model.period_end,
        is_demo_user: model.is_demo_user,
        updated_at: model.updated_at.with_timezone(&chrono::Utc),
    }
}

fn record_to_active_model(record: &EntitlementRecord) -> entitlement_record::ActiveModel {
    entitlement_record::ActiveModel {
        email: Set(record.email.clone()),
        principal_id: Set(record.principal_id.clone()),
        plan_tier: Set(record.plan_tier.as_str().to_string()),
        is_active: Set(record.is_active),
        billing_customer_ref: Set(record.billing_customer_ref.clone()),
        queries_used: Set(record.queries_used),
        queries_remaining: Set(record.queries_remaining),
        period_end: Set(record.period_end),
        is_demo_user: Set(record.is_demo_user),
        updated_at: Set(record.updated_at.fixed_offset()),
    }
}

/// Columns a patch touches, for the ON CONFLICT update list. Unset
/// patch fields are left alone so the upsert is a true merge.
fn patched_columns(patch: &EntitlementPatch) -> Vec<entitlement_record::Column> {
    use entitlement_record::Column;

    let mut columns = vec![Column::UpdatedAt];
    if patch.principal_id.is_some() {
        columns.push(Column::PrincipalId);
    }
    if patch.plan_tier.is_some() {
        columns.push(Column::PlanTier);
    }
    if patch.is_active.is_some() {
        columns.push(Column::IsActive);
    }
    if patch.billing_customer_ref.is_some() {
        columns.push(Column::BillingCustomerRef);
    }
    if patch.queries_used.is_some() {
        columns.push(Column::QueriesUsed);
    }
    if patch.queries_remaining.is_some() {
        columns.push(Column::QueriesRemaining);
    }
    if patch.period_end.is_some() {
        columns.push(Column::PeriodEnd);
    }
    if patch.is_demo_user.is_some() {
        columns.push(Column::IsDemoUser);
    }
    columns
}

// =============================================================================
// SeaOrmEntitlementStore
// =============================================================================

/// SeaORM-backed entitlement store implementing [`EntitlementStore`].
#[derive(Clone, Debug)]
pub struct SeaOrmEntitlementStore {
    db: DatabaseConnection,
}

impl SeaOrmEntitlementStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Get a reference to the underlying database connection.
    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl EntitlementStore for SeaOrmEntitlementStore {
    async fn get_by_email(&self, email: &str) -> Result<Option<EntitlementRecord>> {
        tracing::debug!(email = %email, "fetching entitlement by email");

        let record = entitlement_record::Entity::find_by_id(email)
            .one(&self.db)
            .await
            .map_err(|e| GateError::Database(e.to_string()))?;

        Ok(record.map(model_to_record))
    }

    async fn get_by_principal(&self, principal_id: &str) -> Result<Option<EntitlementRecord>> {
        tracing::debug!(principal_id = %principal_id, "fetching entitlement by principal");

        let record = entitlement_record::Entity::find()
            .filter(entitlement_record::Column::PrincipalId.eq(principal_id))
            .one(&self.db)
            .await
            .map_err(|e| GateError::Database(e.to_string()))?;

        Ok(record.map(model_to_record))
    }

    async fn get_by_customer_ref(&self, customer_ref: &str) -> Result<Option<EntitlementRecord>> {
        tracing::debug!(customer_ref = %customer_ref, "fetching entitlement by customer ref");

        let record = entitlement_record::Entity::find()
            .filter(entitlement_record::Column::BillingCustomerRef.eq(customer_ref))
            .one(&self.db)
            .await
            .map_err(|e| GateError::Database(e.to_string()))?;

        Ok(record.map(model_to_record))
    }

    async fn upsert(&self, email: &str, patch: EntitlementPatch) -> Result<EntitlementRecord> {
        tracing::debug!(email = %email, "upserting entitlement");

        let columns = patched_columns(&patch);
        let insert_record = patch.into_record(email);
        let active_model = record_to_active_model(&insert_record);

        // INSERT ... ON CONFLICT (email) UPDATE only the patched
        // columns, so the operation is a merge rather than a replace.
        entitlement_record::Entity::insert(active_model)
            .on_conflict(
                OnConflict::column(entitlement_record::Column::Email)
                    .update_columns(columns)
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|e| GateError::Database(e.to_string()))?;

        let stored = entitlement_record::Entity::find_by_id(email)
            .one(&self.db)
            .await
            .map_err(|e| GateError::Database(e.to_string()))?
            .ok_or_else(|| GateError::Database("upserted row not found".to_string()))?;

        Ok(model_to_record(stored))
    }

    async fn consume_query(&self, email: &str) -> Result<bool> {
        tracing::debug!(email = %email, "consuming query");

        // Single guarded UPDATE: the remaining > 0 filter is the whole
        // concurrency story. Lost races read 0 rows affected.
        let result = entitlement_record::Entity::update_many()
            .col_expr(
                entitlement_record::Column::QueriesRemaining,
                Expr::col(entitlement_record::Column::QueriesRemaining).sub(1),
            )
            .col_expr(
                entitlement_record::Column::QueriesUsed,
                Expr::col(entitlement_record::Column::QueriesUsed).add(1),
            )
            .col_expr(
                entitlement_record::Column::UpdatedAt,
                Expr::value(chrono::Utc::now().fixed_offset()),
            )
            .filter(entitlement_record::Column::Email.eq(email))
            .filter(entitlement_record::Column::QueriesRemaining.gt(0))
            .exec(&self.db)
            .await
            .map_err(|e| GateError::Database(e.to_string()))?;

        Ok(result.rows_affected > 0)
    }

    async fn grant_demo(&self, email: &str, principal_id: &str) -> Result<bool> {
        tracing::debug!(email = %email, "granting demo");

        let model = entitlement_record::ActiveModel {
            email: Set(email.to_string()),
            principal_id: Set(Some(principal_id.to_string())),
            plan_tier: Set(PlanTier::Demo.as_str().to_string()),
            is_active: Set(true),
            billing_customer_ref: Set(None),
            queries_used: Set(0),
            queries_remaining: Set(PlanTier::Demo.monthly_query_limit()),
            period_end: Set(None),
            is_demo_user: Set(true),
            updated_at: Set(chrono::Utc::now().fixed_offset()),
        };

        // ON CONFLICT (email) DO UPDATE ... WHERE is_demo_user = FALSE:
        // the row-level guard makes the transition one-way, so of any
        // number of racing grants exactly one takes effect.
        let result = entitlement_record::Entity::insert(model)
            .on_conflict(
                OnConflict::column(entitlement_record::Column::Email)
                    .update_columns([
                        entitlement_record::Column::PrincipalId,
                        entitlement_record::Column::PlanTier,
                        entitlement_record::Column::IsActive,
                        entitlement_record::Column::QueriesUsed,
                        entitlement_record::Column::QueriesRemaining,
                        entitlement_record::Column::IsDemoUser,
                        entitlement_record::Column::UpdatedAt,
                    ])
                    .action_and_where(entitlement_record::Column::IsDemoUser.eq(false))
                    .to_owned(),
            )
            .exec(&self.db)
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sea_orm::DbErr::RecordNotInserted) => Ok(false),
            Err(e) => Err(GateError::Database(e.to_string())),
        }
    }

    async fn append_query_log(&self, entry: QueryLogEntry) -> Result<()> {
        tracing::debug!(principal_id = %entry.principal_id, "appending query log entry");

        let model = query_log::ActiveModel {
            principal_id: Set(entry.principal_id),
            query_text: Set(entry.query_text),
            response_length: Set(entry.response_length),
            created_at: Set(entry.created_at.fixed_offset()),
            ..Default::default()
        };

        query_log::Entity::insert(model)
            .exec(&self.db)
            .await
            .map_err(|e| GateError::Database(e.to_string()))?;

        Ok(())
    }

    async fn demo_grants_for_address(&self, address: &str) -> Result<u32> {
        tracing::debug!(address = %address, "counting demo grants for address");

        let count = demo_address_usage::Entity::find()
            .filter(demo_address_usage::Column::Address.eq(address))
            .count(&self.db)
            .await
            .map_err(|e| GateError::Database(e.to_string()))?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn record_demo_address(&self, address: &str) -> Result<()> {
        tracing::debug!(address = %address, "recording demo grant address");

        let model = demo_address_usage::ActiveModel {
            address: Set(address.to_string()),
            granted_at: Set(chrono::Utc::now().fixed_offset()),
            ..Default::default()
        };

        demo_address_usage::Entity::insert(model)
            .exec(&self.db)
            .await
            .map_err(|e| GateError::Database(e.to_string()))?;

        Ok(())
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        tracing::debug!(event_id = %event_id, "checking if event is processed");

        let event = processed_billing_event::Entity::find_by_id(event_id)
            .one(&self.db)
            .await
            .map_err(|e| GateError::Database(e.to_string()))?;

        Ok(event.is_some())
    }

    async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
        tracing::debug!(event_id = %event_id, "marking event as processed");

        let event = processed_billing_event::ActiveModel {
            event_id: Set(event_id.to_string()),
            processed_at: Set(chrono::Utc::now().fixed_offset()),
        };

        // INSERT ... ON CONFLICT DO NOTHING keeps the marker idempotent
        processed_billing_event::Entity::insert(event)
            .on_conflict(
                OnConflict::column(processed_billing_event::Column::EventId)
                    .do_nothing()
                    .to_owned(),
            )
            .do_nothing()
            .exec(&self.db)
            .await
            .map_err(|e| GateError::Database(e.to_string()))?;

        Ok(())
    }
}
