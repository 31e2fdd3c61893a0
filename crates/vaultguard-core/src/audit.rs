//! Audit record shapes.
//!
//! Each decision or mutation produces one typed event. Typed events are
//! flattened into [`AuditEvent`] for persistence and querying.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ACTION_PERMISSION_CHECK: &str = "permission.check";
pub const ACTION_PERMISSION_GRANT: &str = "permission.grant";
pub const ACTION_PERMISSION_REVOKE: &str = "permission.revoke";
pub const ACTION_SUSPICIOUS_ACTIVITY: &str = "suspicious_activity";

pub const DEFAULT_QUERY_LIMIT: usize = 50;
pub const MAX_QUERY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    Allowed,
    Denied,
    Error,
}

impl CheckOutcome {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            CheckOutcome::Allowed
        } else {
            CheckOutcome::Denied
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckOutcome::Allowed => "allowed",
            CheckOutcome::Denied => "denied",
            CheckOutcome::Error => "error",
        }
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionCheckEvent {
    pub user: String,
    pub relation: String,
    pub object: String,
    pub result: CheckOutcome,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionGrantEvent {
    pub grantor: String,
    pub grantee: String,
    pub relation: String,
    pub object: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionRevokeEvent {
    pub revoker: String,
    pub revokee: String,
    pub relation: String,
    pub object: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuspiciousActivityEvent {
    pub user: String,
    pub activity: String,
    pub details: String,
    pub severity: Severity,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Flattened, storable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub user_id: String,
    pub action: String,
    pub resource: String,
    pub result: String,
    pub metadata: BTreeMap<String, String>,
    pub request_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        user_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            action: action.into(),
            resource: resource.into(),
            result: result.into(),
            metadata: BTreeMap::new(),
            request_id: None,
            client_ip: None,
            user_agent: None,
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Object type of `resource`, i.e. the segment before the first `:`.
    pub fn resource_type(&self) -> &str {
        self.resource
            .split_once(':')
            .map_or(self.resource.as_str(), |(t, _)| t)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl From<&PermissionCheckEvent> for AuditEvent {
    fn from(event: &PermissionCheckEvent) -> Self {
        let mut record = AuditEvent::new(
            &event.user,
            ACTION_PERMISSION_CHECK,
            &event.object,
            event.result.as_str(),
        )
        .with_metadata("relation", &event.relation);
        if let Some(ref error) = event.error {
            record = record.with_metadata("error", error);
        }
        record.duration_ms = duration_millis(event.duration);
        record.timestamp = event.timestamp;
        record
    }
}

impl From<&PermissionGrantEvent> for AuditEvent {
    fn from(event: &PermissionGrantEvent) -> Self {
        let mut record = AuditEvent::new(
            &event.grantor,
            ACTION_PERMISSION_GRANT,
            &event.object,
            "success",
        )
        .with_metadata("grantee", &event.grantee)
        .with_metadata("relation", &event.relation);
        record.timestamp = event.timestamp;
        record
    }
}

impl From<&PermissionRevokeEvent> for AuditEvent {
    fn from(event: &PermissionRevokeEvent) -> Self {
        let mut record = AuditEvent::new(
            &event.revoker,
            ACTION_PERMISSION_REVOKE,
            &event.object,
            "success",
        )
        .with_metadata("revokee", &event.revokee)
        .with_metadata("relation", &event.relation);
        record.timestamp = event.timestamp;
        record
    }
}

impl From<&SuspiciousActivityEvent> for AuditEvent {
    fn from(event: &SuspiciousActivityEvent) -> Self {
        let mut record = AuditEvent::new(
            &event.user,
            ACTION_SUSPICIOUS_ACTIVITY,
            "",
            event.severity.as_str(),
        )
        .with_metadata("activity", &event.activity)
        .with_metadata("details", &event.details);
        record.client_ip = event.client_ip.clone();
        record.user_agent = event.user_agent.clone();
        record.timestamp = event.timestamp;
        record
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub resource_type: Option<String>,
    pub action: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl AuditQuery {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref user_id) = self.user_id
            && user_id != &event.user_id
        {
            return false;
        }
        if let Some(ref resource_type) = self.resource_type
            && resource_type != event.resource_type()
        {
            return false;
        }
        if let Some(ref action) = self.action
            && action != &event.action
        {
            return false;
        }
        if let Some(start) = self.start
            && event.timestamp < start
        {
            return false;
        }
        if let Some(end) = self.end
            && event.timestamp > end
        {
            return false;
        }
        true
    }

    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditPage {
    pub records: Vec<AuditEvent>,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("unknown export format: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_event(result: CheckOutcome) -> PermissionCheckEvent {
        PermissionCheckEvent {
            user: "user:alice".to_string(),
            relation: "viewer".to_string(),
            object: "vault:v1".to_string(),
            result,
            timestamp: Utc::now(),
            duration: Duration::from_millis(12),
            error: None,
        }
    }

    #[test]
    fn check_outcome_strings() {
        assert_eq!(CheckOutcome::from_allowed(true).as_str(), "allowed");
        assert_eq!(CheckOutcome::from_allowed(false).as_str(), "denied");
        assert_eq!(CheckOutcome::Error.to_string(), "error");
    }

    #[test]
    fn check_event_flattens_into_audit_event() {
        let event = check_event(CheckOutcome::Allowed);
        let record = AuditEvent::from(&event);

        assert_eq!(record.user_id, "user:alice");
        assert_eq!(record.action, ACTION_PERMISSION_CHECK);
        assert_eq!(record.resource, "vault:v1");
        assert_eq!(record.result, "allowed");
        assert_eq!(record.duration_ms, 12);
        assert_eq!(record.metadata.get("relation").map(String::as_str), Some("viewer"));
        assert_eq!(record.timestamp, event.timestamp);
    }

    #[test]
    fn check_event_error_is_kept_in_metadata() {
        let mut event = check_event(CheckOutcome::Error);
        event.error = Some("request timed out".to_string());
        let record = AuditEvent::from(&event);

        assert_eq!(record.result, "error");
        assert_eq!(
            record.metadata.get("error").map(String::as_str),
            Some("request timed out")
        );
    }

    #[test]
    fn grant_event_records_grantee() {
        let event = PermissionGrantEvent {
            grantor: "user:alice".to_string(),
            grantee: "user:bob".to_string(),
            relation: "editor".to_string(),
            object: "vault:v1".to_string(),
            timestamp: Utc::now(),
        };
        let record = AuditEvent::from(&event);

        assert_eq!(record.action, ACTION_PERMISSION_GRANT);
        assert_eq!(record.metadata.get("grantee").map(String::as_str), Some("user:bob"));
    }

    #[test]
    fn suspicious_event_uses_severity_as_result() {
        let event = SuspiciousActivityEvent {
            user: "user:mallory".to_string(),
            activity: "brute_force".to_string(),
            details: "50 denials in 10s".to_string(),
            severity: Severity::High,
            client_ip: Some("10.0.0.1".to_string()),
            user_agent: None,
            timestamp: Utc::now(),
        };
        let record = AuditEvent::from(&event);

        assert_eq!(record.result, "high");
        assert_eq!(record.client_ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn resource_type_is_prefix_before_colon() {
        let record = AuditEvent::new("user:a", "x", "secret:s1", "ok");
        assert_eq!(record.resource_type(), "secret");
        let bare = AuditEvent::new("user:a", "x", "", "ok");
        assert_eq!(bare.resource_type(), "");
    }

    #[test]
    fn query_filters_by_every_field() {
        let record = AuditEvent::from(&check_event(CheckOutcome::Denied));

        assert!(AuditQuery::default().matches(&record));
        assert!(
            AuditQuery {
                user_id: Some("user:alice".to_string()),
                resource_type: Some("vault".to_string()),
                action: Some(ACTION_PERMISSION_CHECK.to_string()),
                ..Default::default()
            }
            .matches(&record)
        );
        assert!(
            !AuditQuery {
                user_id: Some("user:bob".to_string()),
                ..Default::default()
            }
            .matches(&record)
        );
        assert!(
            !AuditQuery {
                resource_type: Some("secret".to_string()),
                ..Default::default()
            }
            .matches(&record)
        );
        assert!(
            !AuditQuery {
                start: Some(record.timestamp + chrono::Duration::seconds(1)),
                ..Default::default()
            }
            .matches(&record)
        );
        assert!(
            !AuditQuery {
                end: Some(record.timestamp - chrono::Duration::seconds(1)),
                ..Default::default()
            }
            .matches(&record)
        );
    }

    #[test]
    fn query_limit_defaults_and_clamps() {
        assert_eq!(AuditQuery::default().effective_limit(), DEFAULT_QUERY_LIMIT);
        let huge = AuditQuery {
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(huge.effective_limit(), MAX_QUERY_LIMIT);
    }

    #[test]
    fn export_format_parses() {
        assert_eq!("csv".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
