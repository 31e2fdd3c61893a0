use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("invalid identifier '{0}': expected exactly one ':' separating type and id")]
    InvalidFormat(String),

    #[error("invalid identifier '{0}': type segment is empty")]
    EmptyType(String),

    #[error("invalid identifier '{0}': id segment is empty")]
    EmptyId(String),

    #[error("invalid user identifier '{0}': expected 'user:' or 'token:' prefix")]
    InvalidUser(String),

    #[error("unknown object type: {0}")]
    UnknownType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    User,
    Vault,
    Secret,
    Tenant,
    Token,
    Group,
}

impl ObjectType {
    pub const ALL: [ObjectType; 6] = [
        ObjectType::User,
        ObjectType::Vault,
        ObjectType::Secret,
        ObjectType::Tenant,
        ObjectType::Token,
        ObjectType::Group,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::User => "user",
            ObjectType::Vault => "vault",
            ObjectType::Secret => "secret",
            ObjectType::Tenant => "tenant",
            ObjectType::Token => "token",
            ObjectType::Group => "group",
        }
    }

    /// Prefixes `id` with `<type>:` unless it already carries that prefix.
    pub fn format(&self, id: &str) -> String {
        let prefix = self.as_str();
        if let Some(rest) = id.strip_prefix(prefix)
            && rest.starts_with(':')
        {
            return id.to_string();
        }
        format!("{prefix}:{id}")
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| FormatError::UnknownType(s.to_string()))
    }
}

pub fn format_user(id: &str) -> String {
    ObjectType::User.format(id)
}

pub fn format_vault(id: &str) -> String {
    ObjectType::Vault.format(id)
}

pub fn format_secret(id: &str) -> String {
    ObjectType::Secret.format(id)
}

pub fn format_tenant(id: &str) -> String {
    ObjectType::Tenant.format(id)
}

pub fn format_token(id: &str) -> String {
    ObjectType::Token.format(id)
}

pub fn format_group(id: &str) -> String {
    ObjectType::Group.format(id)
}

/// Userset subject for every member of a group, e.g. `group:eng#member`.
pub fn format_group_members(id: &str) -> String {
    format!("{}#member", format_group(id))
}

/// Splits `type:id` into its two segments.
pub fn parse_object(object: &str) -> Result<(&str, &str), FormatError> {
    let mut parts = object.split(':');
    let (Some(object_type), Some(id), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(FormatError::InvalidFormat(object.to_string()));
    };
    if object_type.is_empty() {
        return Err(FormatError::EmptyType(object.to_string()));
    }
    if id.is_empty() {
        return Err(FormatError::EmptyId(object.to_string()));
    }
    Ok((object_type, id))
}

/// Returns the bare id of a `user:` or `token:` identifier.
pub fn parse_user(user: &str) -> Result<&str, FormatError> {
    let (user_type, id) = parse_object(user)?;
    match user_type {
        "user" | "token" => Ok(id),
        _ => Err(FormatError::InvalidUser(user.to_string())),
    }
}

/// Strips the `<type>:` prefix from a typed identifier, leaving other input untouched.
pub fn strip_type<'a>(object_type: ObjectType, object: &'a str) -> &'a str {
    object
        .strip_prefix(object_type.as_str())
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(object)
}
