use vaultguard_core::audit::{AuditEvent, AuditPage, AuditQuery};
use vaultguard_core::{PlanLimits, PlanType};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("tenant id must not be empty")]
    EmptyTenant,
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
    #[error("internal storage error: {0}")]
    Internal(String),
}

/// Persistent sink and read path for audit records.
pub trait AuditStore: Send + Sync + 'static {
    fn append(&self, event: &AuditEvent) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Records matching `query`, newest first, paginated by the query's
    /// limit and offset. `total` counts every match before pagination.
    fn query(
        &self,
        query: &AuditQuery,
    ) -> impl Future<Output = Result<AuditPage, StorageError>> + Send;
}

/// Tenant-specific replacements of a plan tier's default limits.
pub trait PlanOverrideStore: Send + Sync + 'static {
    fn get_override(
        &self,
        tenant_id: &str,
        plan: PlanType,
    ) -> impl Future<Output = Result<Option<PlanLimits>, StorageError>> + Send;

    fn upsert_override(
        &self,
        tenant_id: &str,
        plan: PlanType,
        limits: &PlanLimits,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Returns whether an override existed.
    fn delete_override(
        &self,
        tenant_id: &str,
        plan: PlanType,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;
}
