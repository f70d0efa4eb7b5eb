//! Entitlement state: the authoritative per-identity record, its
//! storage trait, and the database implementation.

mod record;
mod store;

#[cfg(feature = "database")]
pub mod migration;
#[cfg(feature = "database")]
mod sea_orm_store;

pub use record::{EntitlementPatch, EntitlementRecord, QueryLogEntry};
pub use store::{EntitlementStore, InMemoryEntitlementStore};

#[cfg(feature = "database")]
pub use sea_orm_store::SeaOrmEntitlementStore;
