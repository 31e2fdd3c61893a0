//! JSON wire types of the policy engine's HTTP API and their mapping to and
//! from domain types.

use serde::{Deserialize, Serialize};
use vaultguard_core::engine::{CheckRequest, EngineError, ListObjectsRequest};
use vaultguard_core::Tuple;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleKey {
    pub user: String,
    pub relation: String,
    pub object: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckBody {
    pub tuple_key: TupleKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_model_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReply {
    pub allowed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListObjectsBody {
    #[serde(rename = "type")]
    pub object_type: String,
    pub relation: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_model_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListObjectsReply {
    pub objects: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TupleKeys {
    pub tuple_keys: Vec<TupleKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writes: Option<TupleKeys>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletes: Option<TupleKeys>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_model_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorReply {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

pub fn tuple_to_wire(tuple: &Tuple) -> TupleKey {
    TupleKey {
        user: tuple.user.clone(),
        relation: tuple.relation.clone(),
        object: tuple.object.clone(),
    }
}

pub fn wire_to_tuple(key: &TupleKey) -> Tuple {
    Tuple::new(&key.user, &key.relation, &key.object)
}

pub fn tuples_to_wire(tuples: &[Tuple]) -> TupleKeys {
    TupleKeys {
        tuple_keys: tuples.iter().map(tuple_to_wire).collect(),
    }
}

pub fn check_to_wire(request: &CheckRequest, model_id: Option<&str>) -> CheckBody {
    CheckBody {
        tuple_key: TupleKey {
            user: request.user.clone(),
            relation: request.relation.clone(),
            object: request.object.clone(),
        },
        authorization_model_id: model_id.map(str::to_string),
    }
}

pub fn list_objects_to_wire(request: &ListObjectsRequest, model_id: Option<&str>) -> ListObjectsBody {
    ListObjectsBody {
        object_type: request.object_type.clone(),
        relation: request.relation.clone(),
        user: request.user.clone(),
        authorization_model_id: model_id.map(str::to_string),
    }
}

/// Maps a non-success HTTP status from the engine onto an [`EngineError`].
pub fn status_to_error(status: u16, body: &str) -> EngineError {
    let message = serde_json::from_str::<ErrorReply>(body)
        .ok()
        .filter(|reply| !reply.message.is_empty())
        .map(|reply| reply.message)
        .unwrap_or_else(|| body.trim().to_string());
    let message = if message.is_empty() {
        format!("http status {status}")
    } else {
        message
    };

    match status {
        400 | 422 => EngineError::InvalidArgument(message),
        401 | 403 => EngineError::Unauthorized(message),
        404 => EngineError::NotFound(message),
        408 | 504 => EngineError::Timeout,
        429 | 500..=599 => EngineError::Unavailable(message),
        _ => EngineError::Internal(message),
    }
}

pub fn transport_error(err: &reqwest::Error) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout
    } else if err.is_connect() || err.is_request() {
        EngineError::Connection(err.to_string())
    } else if err.is_decode() {
        EngineError::Internal(format!("invalid engine response: {err}"))
    } else {
        EngineError::Unavailable(err.to_string())
    }
}
