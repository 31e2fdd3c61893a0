use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use vaultguard_core::{PlanFeature, PlanLimits, PlanType, ResourceType};
use vaultguard_storage::{InMemoryPlanOverrideStore, PlanOverrideStore};

use crate::cache::{CacheStats, PermissionCache};
use crate::error::PlanError;

/// Resolved limits stay cached this long whether they came from an override
/// or a tier default.
pub const PLAN_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

const PLAN_CACHE_SIZE: usize = 10_000;

fn cache_key(tenant_id: &str, plan: PlanType) -> String {
    format!("{tenant_id}:{plan}")
}

fn require_count(current_count: i64) -> Result<(), PlanError> {
    if current_count < 0 {
        return Err(PlanError::NegativeCount(current_count));
    }
    Ok(())
}

fn require_tenant(tenant_id: &str) -> Result<(), PlanError> {
    if tenant_id.trim().is_empty() {
        return Err(PlanError::EmptyTenant);
    }
    Ok(())
}

/// Quota and feature-flag lookups per tenant and plan tier.
pub struct PlanLimitService<O: PlanOverrideStore = InMemoryPlanOverrideStore> {
    overrides: Arc<O>,
    cache: Arc<PermissionCache<PlanLimits>>,
}

impl<O: PlanOverrideStore> PlanLimitService<O> {
    pub fn new(overrides: Arc<O>) -> Self {
        Self {
            overrides,
            cache: Arc::new(PermissionCache::new(PLAN_CACHE_SIZE, PLAN_CACHE_TTL)),
        }
    }

    /// Sweeps expired limits every `interval` until [`Self::close`].
    pub fn spawn_cleanup(&self, interval: Duration) -> JoinHandle<()> {
        self.cache.spawn_cleanup(interval)
    }

    pub fn close(&self) {
        self.cache.close();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// The tenant's override for `plan` if one exists, else the tier default.
    pub async fn get_plan_limits(
        &self,
        tenant_id: &str,
        plan: PlanType,
    ) -> Result<PlanLimits, PlanError> {
        require_tenant(tenant_id)?;
        let key = cache_key(tenant_id, plan);
        if let Some(limits) = self.cache.get(&key) {
            return Ok(limits);
        }

        let generation = self.cache.generation();
        let limits = match self.overrides.get_override(tenant_id, plan).await? {
            Some(custom) => {
                tracing::debug!(tenant_id, plan = %plan, "using custom plan limits");
                custom
            }
            None => PlanLimits::defaults_for(plan),
        };
        if !self.cache.set_if_unchanged(key, limits.clone(), generation) {
            tracing::debug!(tenant_id, plan = %plan, "plan limits changed during lookup, not cached");
        }
        Ok(limits)
    }

    pub async fn set_custom_limits(
        &self,
        tenant_id: &str,
        plan: PlanType,
        limits: PlanLimits,
    ) -> Result<(), PlanError> {
        require_tenant(tenant_id)?;
        self.overrides.upsert_override(tenant_id, plan, &limits).await?;
        self.clear_cache(tenant_id, plan);
        tracing::info!(tenant_id, plan = %plan, "custom plan limits stored");
        Ok(())
    }

    /// Drops the tenant's override so the tier default applies again.
    pub async fn remove_custom_limits(
        &self,
        tenant_id: &str,
        plan: PlanType,
    ) -> Result<bool, PlanError> {
        require_tenant(tenant_id)?;
        let removed = self.overrides.delete_override(tenant_id, plan).await?;
        self.clear_cache(tenant_id, plan);
        Ok(removed)
    }

    pub async fn is_within_limits(
        &self,
        tenant_id: &str,
        plan: PlanType,
        resource_type: &str,
        current_count: i64,
    ) -> Result<bool, PlanError> {
        require_count(current_count)?;
        let resource: ResourceType = resource_type.parse()?;
        let limits = self.get_plan_limits(tenant_id, plan).await?;
        Ok(limits.allows(resource, current_count))
    }

    /// Headroom left for the resource, or [`vaultguard_core::plan::UNLIMITED`].
    pub async fn get_remaining_limits(
        &self,
        tenant_id: &str,
        plan: PlanType,
        resource_type: &str,
        current_count: i64,
    ) -> Result<i64, PlanError> {
        require_count(current_count)?;
        let resource: ResourceType = resource_type.parse()?;
        let limits = self.get_plan_limits(tenant_id, plan).await?;
        Ok(limits.remaining(resource, current_count))
    }

    pub async fn has_feature(
        &self,
        tenant_id: &str,
        plan: PlanType,
        feature: PlanFeature,
    ) -> Result<bool, PlanError> {
        let limits = self.get_plan_limits(tenant_id, plan).await?;
        Ok(limits.has_feature(feature))
    }

    /// Forgets the cached limits of exactly this tenant and plan.
    pub fn clear_cache(&self, tenant_id: &str, plan: PlanType) {
        self.cache.delete(&cache_key(tenant_id, plan));
    }
}
