use sqlx::PgPool;

use crate::traits::StorageError;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS audit_events (
        id              UUID PRIMARY KEY,
        user_id         TEXT NOT NULL,
        action          TEXT NOT NULL,
        resource        TEXT NOT NULL,
        resource_type   TEXT NOT NULL,
        result          TEXT NOT NULL,
        metadata        JSONB NOT NULL DEFAULT '{}'::jsonb,
        request_id      TEXT,
        client_ip       TEXT,
        user_agent      TEXT,
        duration_ms     BIGINT NOT NULL DEFAULT 0,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_audit_events_user
    ON audit_events (user_id, created_at DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_audit_events_action
    ON audit_events (action, created_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS plan_overrides (
        tenant_id   TEXT NOT NULL,
        plan_type   TEXT NOT NULL,
        limits      JSONB NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (tenant_id, plan_type)
    )
    "#,
];

/// Creates the audit and plan-override tables. Safe to run repeatedly.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StorageError> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))?;
    }
    tracing::info!(statements = STATEMENTS.len(), "storage migrations applied");
    Ok(())
}
