//! Audit pipeline.
//!
//! Every record is written to the `audit` tracing target and, when a store is
//! attached, appended to it. Store failures are logged and swallowed so an
//! authorization decision never fails because of its audit trail.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use vaultguard_core::audit::{
    AuditEvent, AuditPage, AuditQuery, CheckOutcome, ExportFormat, PermissionCheckEvent,
    PermissionGrantEvent, PermissionRevokeEvent, Severity, SuspiciousActivityEvent,
};
use vaultguard_storage::{AuditStore, InMemoryAuditStore};

use crate::error::AuditError;

const CSV_HEADER: [&str; 10] = [
    "id",
    "timestamp",
    "user_id",
    "action",
    "resource",
    "result",
    "duration_ms",
    "request_id",
    "client_ip",
    "user_agent",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    /// Denials, errors, mutations and suspicious activity only.
    Minimal,
    #[default]
    Standard,
    /// Standard plus cache hit/miss traces.
    Verbose,
}

impl FromStr for AuditLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimal" => Ok(AuditLevel::Minimal),
            "standard" => Ok(AuditLevel::Standard),
            "verbose" => Ok(AuditLevel::Verbose),
            other => Err(format!("unknown audit level: {other}")),
        }
    }
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditLevel::Minimal => "minimal",
            AuditLevel::Standard => "standard",
            AuditLevel::Verbose => "verbose",
        })
    }
}

pub struct AuditPipeline<S: AuditStore = InMemoryAuditStore> {
    enabled: bool,
    level: AuditLevel,
    store: Option<Arc<S>>,
}

impl AuditPipeline {
    /// A pipeline that only writes to the tracing stream. Queries on it fail
    /// with [`AuditError::NotSupported`].
    pub fn new(level: AuditLevel) -> Self {
        Self {
            enabled: true,
            level,
            store: None,
        }
    }
}

impl<S: AuditStore> AuditPipeline<S> {
    pub fn with_store(level: AuditLevel, store: Arc<S>) -> Self {
        Self {
            enabled: true,
            level,
            store: Some(store),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn level(&self) -> AuditLevel {
        self.level
    }

    pub fn store(&self) -> Option<&Arc<S>> {
        self.store.as_ref()
    }

    pub async fn log_permission_check(&self, event: &PermissionCheckEvent) {
        if !self.enabled
            || (self.level == AuditLevel::Minimal && event.result == CheckOutcome::Allowed)
        {
            return;
        }

        let duration_ms = u64::try_from(event.duration.as_millis()).unwrap_or(u64::MAX);
        match event.result {
            CheckOutcome::Error => tracing::warn!(
                target: "audit",
                event = "permission_check",
                user = %event.user,
                relation = %event.relation,
                object = %event.object,
                result = event.result.as_str(),
                duration_ms,
                error = event.error.as_deref().unwrap_or(""),
                "permission check failed"
            ),
            _ => tracing::info!(
                target: "audit",
                event = "permission_check",
                user = %event.user,
                relation = %event.relation,
                object = %event.object,
                result = event.result.as_str(),
                duration_ms,
                "permission checked"
            ),
        }

        self.persist(AuditEvent::from(event)).await;
    }

    pub async fn log_permission_grant(&self, event: &PermissionGrantEvent) {
        if !self.enabled {
            return;
        }
        tracing::info!(
            target: "audit",
            event = "permission_grant",
            grantor = %event.grantor,
            grantee = %event.grantee,
            relation = %event.relation,
            object = %event.object,
            "permission granted"
        );
        self.persist(AuditEvent::from(event)).await;
    }

    pub async fn log_permission_revoke(&self, event: &PermissionRevokeEvent) {
        if !self.enabled {
            return;
        }
        tracing::info!(
            target: "audit",
            event = "permission_revoke",
            revoker = %event.revoker,
            revokee = %event.revokee,
            relation = %event.relation,
            object = %event.object,
            "permission revoked"
        );
        self.persist(AuditEvent::from(event)).await;
    }

    pub async fn log_suspicious_activity(&self, event: &SuspiciousActivityEvent) {
        if !self.enabled {
            return;
        }
        let client_ip = event.client_ip.as_deref().unwrap_or("");
        let user_agent = event.user_agent.as_deref().unwrap_or("");
        match event.severity {
            Severity::Critical => tracing::error!(
                target: "audit",
                event = "suspicious_activity",
                user = %event.user,
                activity = %event.activity,
                details = %event.details,
                severity = event.severity.as_str(),
                client_ip,
                user_agent,
                "suspicious activity detected"
            ),
            Severity::High => tracing::warn!(
                target: "audit",
                event = "suspicious_activity",
                user = %event.user,
                activity = %event.activity,
                details = %event.details,
                severity = event.severity.as_str(),
                client_ip,
                user_agent,
                "suspicious activity detected"
            ),
            Severity::Medium | Severity::Low => tracing::info!(
                target: "audit",
                event = "suspicious_activity",
                user = %event.user,
                activity = %event.activity,
                details = %event.details,
                severity = event.severity.as_str(),
                client_ip,
                user_agent,
                "suspicious activity detected"
            ),
        }
        self.persist(AuditEvent::from(event)).await;
    }

    /// Records an event that has no typed shape of its own.
    pub async fn log_event(&self, event: AuditEvent) {
        if !self.enabled {
            return;
        }
        tracing::info!(
            target: "audit",
            event = "audit_event",
            user = %event.user_id,
            action = %event.action,
            resource = %event.resource,
            result = %event.result,
            "audit event"
        );
        self.persist(event).await;
    }

    pub fn log_cache_access(&self, key: &str, hit: bool) {
        if self.enabled && self.level == AuditLevel::Verbose {
            tracing::debug!(target: "audit", event = "cache_access", key, hit, "permission cache access");
        }
    }

    async fn persist(&self, event: AuditEvent) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.append(&event).await {
            tracing::warn!(
                error = %err,
                action = %event.action,
                event_id = %event.id,
                "failed to persist audit event"
            );
        }
    }

    pub async fn get_logs(&self, query: &AuditQuery) -> Result<AuditPage, AuditError> {
        let store = self.store.as_ref().ok_or(AuditError::NotSupported)?;
        Ok(store.query(query).await?)
    }

    pub async fn export_logs(
        &self,
        query: &AuditQuery,
        format: ExportFormat,
    ) -> Result<String, AuditError> {
        let page = self.get_logs(query).await?;
        match format {
            ExportFormat::Json => serde_json::to_string_pretty(&page.records)
                .map_err(|e| AuditError::Export(e.to_string())),
            ExportFormat::Csv => records_to_csv(&page.records),
        }
    }
}

fn records_to_csv(records: &[AuditEvent]) -> Result<String, AuditError> {
    let export_err = |e: csv::Error| AuditError::Export(e.to_string());
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER).map_err(export_err)?;

    for record in records {
        writer
            .write_record([
                record.id.to_string(),
                record.timestamp.to_rfc3339(),
                record.user_id.clone(),
                record.action.clone(),
                record.resource.clone(),
                record.result.clone(),
                record.duration_ms.to_string(),
                record.request_id.clone().unwrap_or_default(),
                record.client_ip.clone().unwrap_or_default(),
                record.user_agent.clone().unwrap_or_default(),
            ])
            .map_err(export_err)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| AuditError::Export(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| AuditError::Export(e.to_string()))
}
