use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sentinel reported as "remaining" for unlimited plans.
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanParseError {
    #[error("unknown plan type: {0}")]
    UnknownPlanType(String),

    #[error("unknown plan feature: {0}")]
    UnknownFeature(String),

    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    Free,
    Pro,
    Enterprise,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Free => "free",
            PlanType::Pro => "pro",
            PlanType::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanType {
    type Err = PlanParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(PlanType::Free),
            "pro" => Ok(PlanType::Pro),
            "enterprise" => Ok(PlanType::Enterprise),
            other => Err(PlanParseError::UnknownPlanType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanFeature {
    AuditLogs,
    ApiAccess,
    GroupManagement,
    Sso,
    CrossTenantSharing,
}

impl PlanFeature {
    pub const ALL: [PlanFeature; 5] = [
        PlanFeature::AuditLogs,
        PlanFeature::ApiAccess,
        PlanFeature::GroupManagement,
        PlanFeature::Sso,
        PlanFeature::CrossTenantSharing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanFeature::AuditLogs => "audit_logs",
            PlanFeature::ApiAccess => "api_access",
            PlanFeature::GroupManagement => "group_management",
            PlanFeature::Sso => "sso",
            PlanFeature::CrossTenantSharing => "cross_tenant_sharing",
        }
    }
}

impl fmt::Display for PlanFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanFeature {
    type Err = PlanParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlanFeature::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| PlanParseError::UnknownFeature(s.to_string()))
    }
}

/// Countable resources a plan puts a ceiling on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Vault,
    User,
}

impl FromStr for ResourceType {
    type Err = PlanParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vault" => Ok(ResourceType::Vault),
            "user" => Ok(ResourceType::User),
            other => Err(PlanParseError::UnknownResourceType(other.to_string())),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Vault => f.write_str("vault"),
            ResourceType::User => f.write_str("user"),
        }
    }
}

/// Quotas and feature flags of a plan tier.
///
/// When `is_unlimited` is set the numeric limits carry no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub vault_limit: i64,
    pub user_limit: i64,
    pub is_unlimited: bool,
    pub features: BTreeSet<PlanFeature>,
    pub description: String,
}

impl PlanLimits {
    pub fn defaults_for(plan: PlanType) -> Self {
        match plan {
            PlanType::Free => Self {
                vault_limit: 3,
                user_limit: 1,
                is_unlimited: false,
                features: BTreeSet::new(),
                description: "Free plan: up to 3 vaults for a single user".to_string(),
            },
            PlanType::Pro => Self {
                vault_limit: 50,
                user_limit: 10,
                is_unlimited: false,
                features: BTreeSet::from([
                    PlanFeature::AuditLogs,
                    PlanFeature::ApiAccess,
                    PlanFeature::GroupManagement,
                ]),
                description: "Pro plan: up to 50 vaults and 10 users".to_string(),
            },
            PlanType::Enterprise => Self {
                vault_limit: UNLIMITED,
                user_limit: UNLIMITED,
                is_unlimited: true,
                features: PlanFeature::ALL.into_iter().collect(),
                description: "Enterprise plan: unlimited vaults and users".to_string(),
            },
        }
    }

    pub fn limit_for(&self, resource: ResourceType) -> i64 {
        match resource {
            ResourceType::Vault => self.vault_limit,
            ResourceType::User => self.user_limit,
        }
    }

    /// Negative counts are treated as zero.
    pub fn allows(&self, resource: ResourceType, current_count: i64) -> bool {
        self.is_unlimited || current_count.max(0) < self.limit_for(resource)
    }

    /// Headroom in `0..=limit`, or [`UNLIMITED`]. Negative counts are treated
    /// as zero.
    pub fn remaining(&self, resource: ResourceType, current_count: i64) -> i64 {
        if self.is_unlimited {
            return UNLIMITED;
        }
        self.limit_for(resource)
            .saturating_sub(current_count.max(0))
            .max(0)
    }

    pub fn has_feature(&self, feature: PlanFeature) -> bool {
        self.features.contains(&feature)
    }
}
