use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vaultguard_core::audit::{AuditEvent, AuditPage, AuditQuery};
use vaultguard_core::{PlanLimits, PlanType};

use crate::traits::{AuditStore, PlanOverrideStore, StorageError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditStore {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditStore for InMemoryAuditStore {
    async fn append(&self, event: &AuditEvent) -> Result<(), StorageError> {
        lock(&self.events).push(event.clone());
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<AuditPage, StorageError> {
        let events = lock(&self.events);
        let mut matching: Vec<&AuditEvent> = events.iter().filter(|e| query.matches(e)).collect();
        // Stable sort keeps later appends first among equal timestamps.
        matching.reverse();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let total = matching.len();
        let records = matching
            .into_iter()
            .skip(query.offset)
            .take(query.effective_limit())
            .cloned()
            .collect();

        Ok(AuditPage { records, total })
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryPlanOverrideStore {
    overrides: Arc<Mutex<HashMap<(String, PlanType), PlanLimits>>>,
}

impl InMemoryPlanOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlanOverrideStore for InMemoryPlanOverrideStore {
    async fn get_override(
        &self,
        tenant_id: &str,
        plan: PlanType,
    ) -> Result<Option<PlanLimits>, StorageError> {
        Ok(lock(&self.overrides)
            .get(&(tenant_id.to_string(), plan))
            .cloned())
    }

    async fn upsert_override(
        &self,
        tenant_id: &str,
        plan: PlanType,
        limits: &PlanLimits,
    ) -> Result<(), StorageError> {
        if tenant_id.is_empty() {
            return Err(StorageError::EmptyTenant);
        }
        lock(&self.overrides).insert((tenant_id.to_string(), plan), limits.clone());
        Ok(())
    }

    async fn delete_override(&self, tenant_id: &str, plan: PlanType) -> Result<bool, StorageError> {
        Ok(lock(&self.overrides)
            .remove(&(tenant_id.to_string(), plan))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use vaultguard_core::PlanFeature;

    use super::*;

    fn event_at(user: &str, action: &str, resource: &str, minutes_ago: i64) -> AuditEvent {
        let mut event = AuditEvent::new(user, action, resource, "allowed");
        event.timestamp = Utc::now() - Duration::minutes(minutes_ago);
        event
    }

    async fn seeded_store() -> InMemoryAuditStore {
        let store = InMemoryAuditStore::new();
        for event in [
            event_at("user:alice", "permission.check", "vault:v1", 30),
            event_at("user:bob", "permission.check", "vault:v2", 20),
            event_at("user:alice", "permission.grant", "vault:v1", 10),
            event_at("user:alice", "permission.check", "secret:s1", 5),
        ] {
            store.append(&event).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn query_returns_newest_first() {
        let store = seeded_store().await;

        let page = store.query(&AuditQuery::default()).await.unwrap();

        assert_eq!(page.total, 4);
        let resources: Vec<_> = page.records.iter().map(|e| e.resource.as_str()).collect();
        assert_eq!(resources, vec!["secret:s1", "vault:v1", "vault:v2", "vault:v1"]);
    }

    #[tokio::test]
    async fn query_filters_by_user_action_and_resource_type() {
        let store = seeded_store().await;

        let page = store
            .query(&AuditQuery {
                user_id: Some("user:alice".to_string()),
                action: Some("permission.check".to_string()),
                resource_type: Some("vault".to_string()),
                ..AuditQuery::default()
            })
            .await
            .unwrap();

        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].resource, "vault:v1");
    }

    #[tokio::test]
    async fn query_filters_by_time_range() {
        let store = seeded_store().await;

        let page = store
            .query(&AuditQuery {
                start: Some(Utc::now() - Duration::minutes(25)),
                end: Some(Utc::now() - Duration::minutes(7)),
                ..AuditQuery::default()
            })
            .await
            .unwrap();

        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn query_paginates_but_reports_full_total() {
        let store = seeded_store().await;

        let page = store
            .query(&AuditQuery {
                limit: Some(2),
                offset: 1,
                ..AuditQuery::default()
            })
            .await
            .unwrap();

        assert_eq!(page.total, 4);
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].action, "permission.grant");
    }

    #[tokio::test]
    async fn override_upsert_replaces_previous_value() {
        let store = InMemoryPlanOverrideStore::new();
        let mut limits = PlanLimits::defaults_for(PlanType::Pro);

        store.upsert_override("acme", PlanType::Pro, &limits).await.unwrap();
        limits.features.insert(PlanFeature::Sso);
        store.upsert_override("acme", PlanType::Pro, &limits).await.unwrap();

        let stored = store.get_override("acme", PlanType::Pro).await.unwrap().unwrap();
        assert!(stored.has_feature(PlanFeature::Sso));
    }

    #[tokio::test]
    async fn overrides_are_keyed_by_tenant_and_plan() {
        let store = InMemoryPlanOverrideStore::new();
        let limits = PlanLimits::defaults_for(PlanType::Enterprise);

        store.upsert_override("acme", PlanType::Pro, &limits).await.unwrap();

        assert!(store.get_override("acme", PlanType::Free).await.unwrap().is_none());
        assert!(store.get_override("globex", PlanType::Pro).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_override_reports_existence() {
        let store = InMemoryPlanOverrideStore::new();
        let limits = PlanLimits::defaults_for(PlanType::Free);
        store.upsert_override("acme", PlanType::Free, &limits).await.unwrap();

        assert!(store.delete_override("acme", PlanType::Free).await.unwrap());
        assert!(!store.delete_override("acme", PlanType::Free).await.unwrap());
    }

    #[tokio::test]
    async fn upsert_rejects_empty_tenant() {
        let store = InMemoryPlanOverrideStore::new();
        let limits = PlanLimits::defaults_for(PlanType::Free);

        let err = store.upsert_override("", PlanType::Free, &limits).await.unwrap_err();

        assert_eq!(err, StorageError::EmptyTenant);
    }
}
