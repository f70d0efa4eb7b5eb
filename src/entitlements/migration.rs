//! Entitlement tables migration.
//!
//! Creates the tables backing [`SeaOrmEntitlementStore`]:
//! - entitlement_records: per-identity entitlement state, keyed by email
//! - query_log: append-only usage log
//! - demo_address_usage: demo-grant ledger per originating address
//! - processed_billing_events: webhook event idempotency tracking
//!
//! [`SeaOrmEntitlementStore`]: super::SeaOrmEntitlementStore

use sea_orm_migration::{prelude::*, schema::*};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(CreateEntitlementTables)]
    }
}

pub struct CreateEntitlementTables;

impl MigrationName for CreateEntitlementTables {
    fn name(&self) -> &str {
        "m20250301_000001_create_entitlement_tables"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for CreateEntitlementTables {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EntitlementRecords::Table)
                    .if_not_exists()
                    .col(string(EntitlementRecords::Email).primary_key())
                    .col(string_null(EntitlementRecords::PrincipalId))
                    .col(
                        string(EntitlementRecords::PlanTier)
                            .not_null()
                            .default("none"),
                    )
                    .col(
                        boolean(EntitlementRecords::IsActive)
                            .not_null()
                            .default(false),
                    )
                    .col(string_null(EntitlementRecords::BillingCustomerRef))
                    .col(
                        big_integer(EntitlementRecords::QueriesUsed)
                            .not_null()
                            .default(0),
                    )
                    .col(
                        big_integer(EntitlementRecords::QueriesRemaining)
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer_null(EntitlementRecords::PeriodEnd))
                    .col(
                        boolean(EntitlementRecords::IsDemoUser)
                            .not_null()
                            .default(false),
                    )
                    .col(
                        timestamp_with_time_zone(EntitlementRecords::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Lookups arrive keyed by principal id (usage path) and by
        // customer ref (webhook path)
        manager
            .create_index(
                Index::create()
                    .name("idx_entitlement_records_principal_id")
                    .table(EntitlementRecords::Table)
                    .col(EntitlementRecords::PrincipalId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_entitlement_records_billing_customer_ref")
                    .table(EntitlementRecords::Table)
                    .col(EntitlementRecords::BillingCustomerRef)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(QueryLog::Table)
                    .if_not_exists()
                    .col(big_integer(QueryLog::Id).auto_increment().primary_key())
                    .col(string(QueryLog::PrincipalId).not_null())
                    .col(text(QueryLog::QueryText).not_null())
                    .col(big_integer(QueryLog::ResponseLength).not_null().default(0))
                    .col(
                        timestamp_with_time_zone(QueryLog::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_query_log_principal_id")
                    .table(QueryLog::Table)
                    .col(QueryLog::PrincipalId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(DemoAddressUsage::Table)
                    .if_not_exists()
                    .col(
                        big_integer(DemoAddressUsage::Id)
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string(DemoAddressUsage::Address).not_null())
                    .col(
                        timestamp_with_time_zone(DemoAddressUsage::GrantedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_demo_address_usage_address")
                    .table(DemoAddressUsage::Table)
                    .col(DemoAddressUsage::Address)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ProcessedBillingEvents::Table)
                    .if_not_exists()
                    .col(string(ProcessedBillingEvents::EventId).primary_key())
                    .col(
                        timestamp_with_time_zone(ProcessedBillingEvents::ProcessedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Drop tables in reverse order
        manager
            .drop_table(Table::drop().table(ProcessedBillingEvents::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(DemoAddressUsage::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(QueryLog::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(EntitlementRecords::Table).to_owned())
            .await?;

        Ok(())
    }
}

// =============================================================================
// Table Definitions
// =============================================================================

#[derive(DeriveIden)]
enum EntitlementRecords {
    Table,
    Email,
    PrincipalId,
    PlanTier,
    IsActive,
    BillingCustomerRef,
    QueriesUsed,
    QueriesRemaining,
    PeriodEnd,
    IsDemoUser,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum QueryLog {
    Table,
    Id,
    PrincipalId,
    QueryText,
    ResponseLength,
    CreatedAt,
}

#[derive(DeriveIden)]
enum DemoAddressUsage {
    Table,
    Id,
    Address,
    GrantedAt,
}

#[derive(DeriveIden)]
enum ProcessedBillingEvents {
    Table,
    EventId,
    ProcessedAt,
}
