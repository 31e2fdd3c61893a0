pub mod migrations;
mod queries;

pub use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use vaultguard_core::audit::{AuditEvent, AuditPage, AuditQuery};
use vaultguard_core::{PlanLimits, PlanType};

use crate::traits::{AuditStore, PlanOverrideStore, StorageError};

pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, StorageError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|e| StorageError::Internal(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl AuditStore for PostgresAuditStore {
    async fn append(&self, event: &AuditEvent) -> Result<(), StorageError> {
        queries::insert_audit_event(&self.pool, event).await
    }

    async fn query(&self, query: &AuditQuery) -> Result<AuditPage, StorageError> {
        let total = queries::count_audit_events(&self.pool, query).await?;
        let records = queries::query_audit_events(&self.pool, query).await?;
        Ok(AuditPage { records, total })
    }
}

#[derive(Debug, Clone)]
pub struct PostgresPlanOverrideStore {
    pool: PgPool,
}

impl PostgresPlanOverrideStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PlanOverrideStore for PostgresPlanOverrideStore {
    async fn get_override(
        &self,
        tenant_id: &str,
        plan: PlanType,
    ) -> Result<Option<PlanLimits>, StorageError> {
        queries::select_plan_override(&self.pool, tenant_id, plan).await
    }

    async fn upsert_override(
        &self,
        tenant_id: &str,
        plan: PlanType,
        limits: &PlanLimits,
    ) -> Result<(), StorageError> {
        if tenant_id.is_empty() {
            return Err(StorageError::EmptyTenant);
        }
        queries::upsert_plan_override(&self.pool, tenant_id, plan, limits).await
    }

    async fn delete_override(&self, tenant_id: &str, plan: PlanType) -> Result<bool, StorageError> {
        queries::delete_plan_override(&self.pool, tenant_id, plan).await
    }
}
