use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identifier::{FormatError, parse_object};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TupleError {
    #[error("tuple '{0}' must have the form user#relation@type:id")]
    Malformed(String),

    #[error("tuple relation must not be empty")]
    EmptyRelation,

    #[error(transparent)]
    Format(#[from] FormatError),
}

/// One relationship fact: `user` has `relation` to `object`.
///
/// `user` may be a direct subject (`user:alice`) or a userset
/// (`group:eng#member`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple {
    pub user: String,
    pub relation: String,
    pub object: String,
}

impl Tuple {
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

    pub fn validate(&self) -> Result<(), TupleError> {
        let user_base = match self.user.split_once('#') {
            Some((base, rel)) if !rel.is_empty() => base,
            Some(_) => return Err(TupleError::Malformed(self.to_string())),
            None => self.user.as_str(),
        };
        parse_object(user_base)?;
        if self.relation.is_empty() {
            return Err(TupleError::EmptyRelation);
        }
        parse_object(&self.object)?;
        Ok(())
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.user, self.relation, self.object)
    }
}

impl FromStr for Tuple {
    type Err = TupleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (left, object) = s
            .rsplit_once('@')
            .ok_or_else(|| TupleError::Malformed(s.to_string()))?;
        let (user, relation) = left
            .rsplit_once('#')
            .ok_or_else(|| TupleError::Malformed(s.to_string()))?;
        let tuple = Tuple::new(user, relation, object);
        tuple.validate()?;
        Ok(tuple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_display_uses_user_relation_object_order() {
        let tuple = Tuple::new("user:alice", "viewer", "vault:v1");
        assert_eq!(tuple.to_string(), "user:alice#viewer@vault:v1");
    }

    #[test]
    fn tuple_parses_its_display_form() {
        let tuple: Tuple = "user:alice#viewer@vault:v1".parse().unwrap();
        assert_eq!(tuple, Tuple::new("user:alice", "viewer", "vault:v1"));
        assert_eq!(tuple.to_string().parse::<Tuple>().unwrap(), tuple);
    }

    #[test]
    fn tuple_parses_userset_user() {
        let tuple: Tuple = "group:eng#member#editor@vault:v1".parse().unwrap();
        assert_eq!(tuple.user, "group:eng#member");
        assert_eq!(tuple.relation, "editor");
        assert_eq!(tuple.object, "vault:v1");
    }

    #[test]
    fn tuple_parse_rejects_missing_parts() {
        assert!(matches!(
            "user:alice@vault:v1".parse::<Tuple>(),
            Err(TupleError::Malformed(_))
        ));
        assert!(matches!(
            "user:alice#viewer".parse::<Tuple>(),
            Err(TupleError::Malformed(_))
        ));
    }

    #[test]
    fn tuple_parse_rejects_bad_identifiers() {
        assert!(matches!(
            "alice#viewer@vault:v1".parse::<Tuple>(),
            Err(TupleError::Format(FormatError::InvalidFormat(_)))
        ));
        assert!(matches!(
            "user:alice#viewer@vault:".parse::<Tuple>(),
            Err(TupleError::Format(FormatError::EmptyId(_)))
        ));
    }

    #[test]
    fn validate_rejects_empty_relation() {
        let tuple = Tuple::new("user:alice", "", "vault:v1");
        assert_eq!(tuple.validate(), Err(TupleError::EmptyRelation));
    }

    #[test]
    fn validate_rejects_userset_without_relation() {
        let tuple = Tuple::new("group:eng#", "viewer", "vault:v1");
        assert!(matches!(tuple.validate(), Err(TupleError::Malformed(_))));
    }

    #[test]
    fn tuple_hash_consistent_with_equality() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(Tuple::new("user:alice", "viewer", "vault:v1"));
        assert!(set.contains(&Tuple::new("user:alice", "viewer", "vault:v1")));
    }
}
