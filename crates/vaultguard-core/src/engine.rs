//! The seam between the authorization core and the remote policy engine.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::identifier::{FormatError, ObjectType, parse_object, parse_user};
use crate::tuple::{Tuple, TupleError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Tuple(#[from] TupleError),

    #[error("unknown object type: {0}")]
    UnknownType(String),

    #[error("tuple batch must not be empty")]
    EmptyBatch,
}

/// Failures reported by a policy engine transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine call timed out")]
    Timeout,

    #[error("engine rejected request: {0}")]
    InvalidArgument(String),

    #[error("engine refused credentials: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("engine internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Connection(_) | EngineError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckRequest {
    pub user: String,
    pub relation: String,
    pub object: String,
}

impl CheckRequest {
    pub fn new(
        user: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            relation: relation.into(),
            object: object.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.user.is_empty() {
            return Err(ValidationError::Empty("user"));
        }
        if self.relation.is_empty() {
            return Err(ValidationError::Empty("relation"));
        }
        if self.object.is_empty() {
            return Err(ValidationError::Empty("object"));
        }
        parse_user(&self.user)?;
        parse_object(&self.object)?;
        Ok(())
    }

    /// Stable key used by the check cache.
    pub fn cache_key(&self) -> String {
        format!("check:{}#{}@{}", self.user, self.relation, self.object)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListObjectsRequest {
    pub user: String,
    pub relation: String,
    pub object_type: String,
}

impl ListObjectsRequest {
    pub fn new(user: impl Into<String>, relation: impl Into<String>, object_type: ObjectType) -> Self {
        Self {
            user: user.into(),
            relation: relation.into(),
            object_type: object_type.as_str().to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.user.is_empty() {
            return Err(ValidationError::Empty("user"));
        }
        if self.relation.is_empty() {
            return Err(ValidationError::Empty("relation"));
        }
        if self.object_type.is_empty() {
            return Err(ValidationError::Empty("object type"));
        }
        parse_user(&self.user)?;
        self.object_type
            .parse::<ObjectType>()
            .map_err(|_| ValidationError::UnknownType(self.object_type.clone()))?;
        Ok(())
    }
}

pub fn validate_tuples(tuples: &[Tuple]) -> Result<(), ValidationError> {
    if tuples.is_empty() {
        return Err(ValidationError::EmptyBatch);
    }
    for tuple in tuples {
        tuple.validate()?;
    }
    Ok(())
}

/// Remote relationship-based policy engine.
pub trait PolicyEngine: Send + Sync + 'static {
    fn check(
        &self,
        request: &CheckRequest,
    ) -> impl Future<Output = Result<CheckResponse, EngineError>> + Send;

    /// Full identifiers (`type:id`) of every object related to the user.
    fn list_objects(
        &self,
        request: &ListObjectsRequest,
    ) -> impl Future<Output = Result<Vec<String>, EngineError>> + Send;

    fn write_tuples(
        &self,
        tuples: &[Tuple],
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn delete_tuples(
        &self,
        tuples: &[Tuple],
    ) -> impl Future<Output = Result<(), EngineError>> + Send;
}
