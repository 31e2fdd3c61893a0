use vaultguard_client::ClientError;
use vaultguard_core::identifier::FormatError;
use vaultguard_core::plan::PlanParseError;
use vaultguard_core::{ObjectType, ValidationError};
use vaultguard_storage::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthzError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown permission '{permission}' for {object_type}")]
    UnknownPermission {
        object_type: ObjectType,
        permission: String,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("policy engine error: {0}")]
    Client(ClientError),
}

impl AuthzError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AuthzError::Validation(_) | AuthzError::UnknownPermission { .. }
        )
    }

    pub fn is_remote_failure(&self) -> bool {
        matches!(self, AuthzError::Client(err) if err.is_remote_failure())
    }
}

impl From<ClientError> for AuthzError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::InvalidRequest(msg) => AuthzError::Validation(msg),
            other => AuthzError::Client(other),
        }
    }
}

impl From<ValidationError> for AuthzError {
    fn from(err: ValidationError) -> Self {
        AuthzError::Validation(err.to_string())
    }
}

impl From<FormatError> for AuthzError {
    fn from(err: FormatError) -> Self {
        AuthzError::Validation(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("tenant id must not be empty")]
    EmptyTenant,

    #[error("unknown plan type: {0}")]
    UnknownPlanType(String),

    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("unknown plan feature: {0}")]
    UnknownFeature(String),

    #[error("resource count must not be negative: {0}")]
    NegativeCount(i64),

    #[error("plan override storage failed: {0}")]
    Storage(#[from] StorageError),
}

impl From<PlanParseError> for PlanError {
    fn from(err: PlanParseError) -> Self {
        match err {
            PlanParseError::UnknownPlanType(s) => PlanError::UnknownPlanType(s),
            PlanParseError::UnknownResourceType(s) => PlanError::UnknownResourceType(s),
            PlanParseError::UnknownFeature(s) => PlanError::UnknownFeature(s),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit log queries are not supported without a persistent audit store")]
    NotSupported,

    #[error("audit store error: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to export audit logs: {0}")]
    Export(String),
}
