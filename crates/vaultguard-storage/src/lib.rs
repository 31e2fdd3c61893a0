pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::{InMemoryAuditStore, InMemoryPlanOverrideStore};
pub use postgres::{PostgresAuditStore, PostgresPlanOverrideStore};
pub use traits::{AuditStore, PlanOverrideStore, StorageError};
