use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;
use vaultguard_core::audit::{AuditEvent, AuditQuery};
use vaultguard_core::{PlanLimits, PlanType};

use crate::traits::StorageError;

fn to_storage_error(e: sqlx::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    user_id: String,
    action: String,
    resource: String,
    result: String,
    metadata: serde_json::Value,
    request_id: Option<String>,
    client_ip: Option<String>,
    user_agent: Option<String>,
    duration_ms: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEvent {
    type Error = StorageError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let metadata: BTreeMap<String, String> = serde_json::from_value(row.metadata)
            .map_err(|e| StorageError::Corrupt(format!("audit metadata of {}: {e}", row.id)))?;
        Ok(AuditEvent {
            id: row.id,
            user_id: row.user_id,
            action: row.action,
            resource: row.resource,
            result: row.result,
            metadata,
            request_id: row.request_id,
            client_ip: row.client_ip,
            user_agent: row.user_agent,
            duration_ms: u64::try_from(row.duration_ms).unwrap_or(0),
            timestamp: row.created_at,
        })
    }
}

pub async fn insert_audit_event<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    event: &AuditEvent,
) -> Result<(), StorageError> {
    let metadata = serde_json::to_value(&event.metadata)
        .map_err(|e| StorageError::Internal(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO audit_events
            (id, user_id, action, resource, resource_type, result, metadata,
             request_id, client_ip, user_agent, duration_ms, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(event.id)
    .bind(&event.user_id)
    .bind(&event.action)
    .bind(&event.resource)
    .bind(event.resource_type())
    .bind(&event.result)
    .bind(metadata)
    .bind(&event.request_id)
    .bind(&event.client_ip)
    .bind(&event.user_agent)
    .bind(i64::try_from(event.duration_ms).unwrap_or(i64::MAX))
    .bind(event.timestamp)
    .execute(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(())
}

/// Builds the WHERE clause for `query`. Text filters bind first, then the
/// time bounds, numbered from `$1`.
fn audit_filter(query: &AuditQuery) -> (String, Vec<&str>, Vec<DateTime<Utc>>) {
    let mut conditions = vec!["TRUE".to_string()];
    let mut text_binds: Vec<&str> = Vec::new();
    let mut time_binds = Vec::new();
    let mut bind_idx = 1;

    for (column, value) in [
        ("user_id", &query.user_id),
        ("resource_type", &query.resource_type),
        ("action", &query.action),
    ] {
        if let Some(value) = value {
            conditions.push(format!("{column} = ${bind_idx}"));
            text_binds.push(value.as_str());
            bind_idx += 1;
        }
    }
    if let Some(start) = query.start {
        conditions.push(format!("created_at >= ${bind_idx}"));
        time_binds.push(start);
        bind_idx += 1;
    }
    if let Some(end) = query.end {
        conditions.push(format!("created_at <= ${bind_idx}"));
        time_binds.push(end);
    }

    (conditions.join(" AND "), text_binds, time_binds)
}

pub async fn query_audit_events<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    query: &AuditQuery,
) -> Result<Vec<AuditEvent>, StorageError> {
    let (where_clause, text_binds, time_binds) = audit_filter(query);
    let bind_count = text_binds.len() + time_binds.len();
    let sql = format!(
        r#"SELECT id, user_id, action, resource, result, metadata, request_id,
                  client_ip, user_agent, duration_ms, created_at
           FROM audit_events
           WHERE {where_clause}
           ORDER BY created_at DESC, id DESC
           LIMIT ${} OFFSET ${}"#,
        bind_count + 1,
        bind_count + 2
    );

    let mut q = sqlx::query_as::<_, AuditRow>(&sql);
    for bind in text_binds {
        q = q.bind(bind);
    }
    for bind in time_binds {
        q = q.bind(bind);
    }
    let limit = i64::try_from(query.effective_limit()).unwrap_or(i64::MAX);
    let offset = i64::try_from(query.offset).unwrap_or(i64::MAX);

    let rows = q
        .bind(limit)
        .bind(offset)
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;

    rows.into_iter().map(AuditEvent::try_from).collect()
}

pub async fn count_audit_events<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    query: &AuditQuery,
) -> Result<usize, StorageError> {
    let (where_clause, text_binds, time_binds) = audit_filter(query);
    let sql = format!("SELECT COUNT(*) FROM audit_events WHERE {where_clause}");

    let mut q = sqlx::query_as::<_, (i64,)>(&sql);
    for bind in text_binds {
        q = q.bind(bind);
    }
    for bind in time_binds {
        q = q.bind(bind);
    }
    let row = q.fetch_one(executor).await.map_err(to_storage_error)?;

    Ok(usize::try_from(row.0).unwrap_or(0))
}

pub async fn select_plan_override<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    tenant_id: &str,
    plan: PlanType,
) -> Result<Option<PlanLimits>, StorageError> {
    let row: Option<(serde_json::Value,)> = sqlx::query_as(
        "SELECT limits FROM plan_overrides WHERE tenant_id = $1 AND plan_type = $2",
    )
    .bind(tenant_id)
    .bind(plan.as_str())
    .fetch_optional(executor)
    .await
    .map_err(to_storage_error)?;

    row.map(|(limits,)| {
        serde_json::from_value(limits).map_err(|e| {
            StorageError::Corrupt(format!("plan override for {tenant_id}:{plan}: {e}"))
        })
    })
    .transpose()
}

pub async fn upsert_plan_override<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    tenant_id: &str,
    plan: PlanType,
    limits: &PlanLimits,
) -> Result<(), StorageError> {
    let limits =
        serde_json::to_value(limits).map_err(|e| StorageError::Internal(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO plan_overrides (tenant_id, plan_type, limits, updated_at)
        VALUES ($1, $2, $3, now())
        ON CONFLICT (tenant_id, plan_type)
        DO UPDATE SET limits = EXCLUDED.limits, updated_at = now()
        "#,
    )
    .bind(tenant_id)
    .bind(plan.as_str())
    .bind(limits)
    .execute(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(())
}

pub async fn delete_plan_override<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    tenant_id: &str,
    plan: PlanType,
) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM plan_overrides WHERE tenant_id = $1 AND plan_type = $2")
        .bind(tenant_id)
        .bind(plan.as_str())
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(result.rows_affected() > 0)
}
