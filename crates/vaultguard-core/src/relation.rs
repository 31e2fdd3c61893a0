//! Closed relation vocabulary for each object type.
//!
//! Grantable relations are stored as tuples in the policy engine. Computed
//! permissions are derived by the engine's model and can only be checked.

use crate::identifier::ObjectType;

const VAULT_GRANTABLE: &[&str] = &["owner", "admin", "editor", "viewer", "tenant"];
const VAULT_COMPUTED: &[&str] = &["view", "edit", "delete", "manage", "share"];

const SECRET_GRANTABLE: &[&str] = &["parent", "owner", "editor", "viewer"];
const SECRET_COMPUTED: &[&str] = &["read", "write", "delete", "manage"];

const TENANT_GRANTABLE: &[&str] = &["owner", "admin", "member"];
const TENANT_COMPUTED: &[&str] = &[
    "view",
    "manage",
    "create_vault",
    "manage_members",
    "manage_billing",
];

const GROUP_GRANTABLE: &[&str] = &["owner", "admin", "member"];
const GROUP_COMPUTED: &[&str] = &["view", "manage", "manage_members"];

const TOKEN_GRANTABLE: &[&str] = &["owner", "tenant"];
const TOKEN_COMPUTED: &[&str] = &["view", "use", "revoke", "manage"];

pub const MANAGE: &str = "manage";
pub const VIEW: &str = "view";

pub fn grantable_relations(object_type: ObjectType) -> &'static [&'static str] {
    match object_type {
        ObjectType::Vault => VAULT_GRANTABLE,
        ObjectType::Secret => SECRET_GRANTABLE,
        ObjectType::Tenant => TENANT_GRANTABLE,
        ObjectType::Group => GROUP_GRANTABLE,
        ObjectType::Token => TOKEN_GRANTABLE,
        ObjectType::User => &[],
    }
}

pub fn computed_permissions(object_type: ObjectType) -> &'static [&'static str] {
    match object_type {
        ObjectType::Vault => VAULT_COMPUTED,
        ObjectType::Secret => SECRET_COMPUTED,
        ObjectType::Tenant => TENANT_COMPUTED,
        ObjectType::Group => GROUP_COMPUTED,
        ObjectType::Token => TOKEN_COMPUTED,
        ObjectType::User => &[],
    }
}

pub fn is_grantable(object_type: ObjectType, relation: &str) -> bool {
    grantable_relations(object_type).contains(&relation)
}

pub fn is_checkable(object_type: ObjectType, relation: &str) -> bool {
    is_grantable(object_type, relation) || computed_permissions(object_type).contains(&relation)
}
