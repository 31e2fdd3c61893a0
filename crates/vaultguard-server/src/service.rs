use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vaultguard_client::{ClientError, HealthStatus, PolicyClient};
use vaultguard_core::audit::{
    AuditEvent, CheckOutcome, PermissionCheckEvent, PermissionGrantEvent, PermissionRevokeEvent,
    Severity, SuspiciousActivityEvent,
};
use vaultguard_core::identifier::{format_group_members, format_user, parse_user, strip_type};
use vaultguard_core::relation::{MANAGE, VIEW, is_checkable, is_grantable};
use vaultguard_core::{CheckRequest, ListObjectsRequest, ObjectType, PolicyEngine, Tuple};
use vaultguard_storage::{AuditStore, InMemoryAuditStore};

use crate::audit::AuditPipeline;
use crate::cache::PermissionCache;
use crate::error::AuthzError;

const ACTIVITY_UNAUTHORIZED_CHANGE: &str = "unauthorized_permission_change";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Grant,
    Revoke,
}

impl Change {
    fn verb(self) -> &'static str {
        match self {
            Change::Grant => "grant",
            Change::Revoke => "revoke",
        }
    }
}

/// Permission an actor needs on an object before changing who else may
/// access it.
fn guard_permission(object_type: ObjectType) -> &'static str {
    match object_type {
        ObjectType::Tenant | ObjectType::Group => "manage_members",
        _ => MANAGE,
    }
}

/// Accepts `alice`, `user:alice` or `token:t1` and returns the typed subject.
fn subject(user_id: &str) -> String {
    if parse_user(user_id).is_ok() {
        user_id.to_string()
    } else {
        format_user(user_id)
    }
}

fn require_id(what: &str, id: &str) -> Result<(), AuthzError> {
    if id.trim().is_empty() {
        return Err(AuthzError::Validation(format!("{what} must not be empty")));
    }
    Ok(())
}

/// Domain-level authorization: turns vault, secret, tenant, group and token
/// verbs into policy engine calls, with caching and an audit record for every
/// decision and mutation.
pub struct AuthorizationService<E: PolicyEngine, S: AuditStore = InMemoryAuditStore> {
    client: PolicyClient<E>,
    cache: Option<Arc<PermissionCache<bool>>>,
    audit: Arc<AuditPipeline<S>>,
}

impl<E: PolicyEngine, S: AuditStore> Clone for AuthorizationService<E, S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            cache: self.cache.clone(),
            audit: Arc::clone(&self.audit),
        }
    }
}

impl<E: PolicyEngine, S: AuditStore> AuthorizationService<E, S> {
    pub fn new(
        client: PolicyClient<E>,
        cache: Option<Arc<PermissionCache<bool>>>,
        audit: Arc<AuditPipeline<S>>,
    ) -> Self {
        Self {
            client,
            cache,
            audit,
        }
    }

    pub fn client(&self) -> &PolicyClient<E> {
        &self.client
    }

    pub fn cache(&self) -> Option<&Arc<PermissionCache<bool>>> {
        self.cache.as_ref()
    }

    pub fn audit(&self) -> &Arc<AuditPipeline<S>> {
        &self.audit
    }

    /// Checks an arbitrary relation. The relation is not matched against the
    /// per-type vocabulary, so model-specific relations pass through.
    pub async fn check(
        &self,
        ctx: &CancellationToken,
        request: &CheckRequest,
    ) -> Result<bool, AuthzError> {
        request.validate()?;
        self.decide(ctx, request, true).await
    }

    pub async fn can_access_vault(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
        vault_id: &str,
        permission: &str,
    ) -> Result<bool, AuthzError> {
        self.can_access(ctx, ObjectType::Vault, user_id, vault_id, permission)
            .await
    }

    pub async fn can_access_secret(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
        secret_id: &str,
        permission: &str,
    ) -> Result<bool, AuthzError> {
        self.can_access(ctx, ObjectType::Secret, user_id, secret_id, permission)
            .await
    }

    pub async fn can_access_tenant(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
        tenant_id: &str,
        permission: &str,
    ) -> Result<bool, AuthzError> {
        self.can_access(ctx, ObjectType::Tenant, user_id, tenant_id, permission)
            .await
    }

    pub async fn can_access_group(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
        group_id: &str,
        permission: &str,
    ) -> Result<bool, AuthzError> {
        self.can_access(ctx, ObjectType::Group, user_id, group_id, permission)
            .await
    }

    pub async fn can_access_token(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
        token_id: &str,
        permission: &str,
    ) -> Result<bool, AuthzError> {
        self.can_access(ctx, ObjectType::Token, user_id, token_id, permission)
            .await
    }

    pub async fn can_access(
        &self,
        ctx: &CancellationToken,
        object_type: ObjectType,
        user_id: &str,
        object_id: &str,
        permission: &str,
    ) -> Result<bool, AuthzError> {
        let request = domain_request(object_type, user_id, object_id, permission)?;
        self.decide(ctx, &request, true).await
    }

    /// Decides every request, answering cache hits locally and sending the
    /// rest to the engine as one bounded batch. `results[i]` answers
    /// `requests[i]`.
    pub async fn batch_check(
        &self,
        ctx: &CancellationToken,
        requests: &[CheckRequest],
    ) -> Vec<Result<bool, AuthzError>> {
        if ctx.is_cancelled() {
            return vec![Err(ClientError::Cancelled.into()); requests.len()];
        }

        let mut results: Vec<Option<Result<bool, AuthzError>>> = vec![None; requests.len()];
        let mut pending_index = Vec::new();
        let mut pending = Vec::new();

        for (index, request) in requests.iter().enumerate() {
            if let Err(err) = request.validate() {
                results[index] = Some(Err(err.into()));
                continue;
            }
            if let Some(allowed) = self.cached(request) {
                self.audit_decision(request, Ok(allowed), Duration::ZERO).await;
                results[index] = Some(Ok(allowed));
                continue;
            }
            pending_index.push(index);
            pending.push(request.clone());
        }

        if !pending.is_empty() {
            let generation = self.cache_generation();
            let batch = self.client.batch_check(ctx, &pending).await;
            let slots = batch.results.into_iter().zip(batch.errors);

            for ((index, request), (response, error)) in pending_index.into_iter().zip(&pending).zip(slots) {
                let outcome = match (response, error) {
                    (Some(response), _) => {
                        self.remember(request, response.allowed, generation);
                        Ok(response.allowed)
                    }
                    (None, Some(err)) => Err(AuthzError::from(err)),
                    (None, None) => Err(ClientError::Internal("missing batch result".to_string()).into()),
                };
                if !matches!(outcome, Err(AuthzError::Client(ClientError::Cancelled))) {
                    self.audit_decision(request, outcome.clone(), batch.duration).await;
                }
                results[index] = Some(outcome);
            }
        }

        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(AuthzError::Client(ClientError::Internal(
                        "batch slot left undecided".to_string(),
                    )))
                })
            })
            .collect()
    }

    pub async fn grant_permission(
        &self,
        ctx: &CancellationToken,
        object_type: ObjectType,
        grantor_id: &str,
        grantee_id: &str,
        object_id: &str,
        relation: &str,
    ) -> Result<(), AuthzError> {
        require_id("grantee id", grantee_id)?;
        self.change_guarded(
            ctx,
            Change::Grant,
            object_type,
            grantor_id,
            subject(grantee_id),
            object_id,
            relation,
        )
        .await
    }

    pub async fn revoke_permission(
        &self,
        ctx: &CancellationToken,
        object_type: ObjectType,
        revoker_id: &str,
        revokee_id: &str,
        object_id: &str,
        relation: &str,
    ) -> Result<(), AuthzError> {
        require_id("revokee id", revokee_id)?;
        self.change_guarded(
            ctx,
            Change::Revoke,
            object_type,
            revoker_id,
            subject(revokee_id),
            object_id,
            relation,
        )
        .await
    }

    pub async fn grant_vault_permission(
        &self,
        ctx: &CancellationToken,
        grantor_id: &str,
        grantee_id: &str,
        vault_id: &str,
        relation: &str,
    ) -> Result<(), AuthzError> {
        self.grant_permission(ctx, ObjectType::Vault, grantor_id, grantee_id, vault_id, relation)
            .await
    }

    pub async fn revoke_vault_permission(
        &self,
        ctx: &CancellationToken,
        revoker_id: &str,
        revokee_id: &str,
        vault_id: &str,
        relation: &str,
    ) -> Result<(), AuthzError> {
        self.revoke_permission(ctx, ObjectType::Vault, revoker_id, revokee_id, vault_id, relation)
            .await
    }

    pub async fn grant_secret_permission(
        &self,
        ctx: &CancellationToken,
        grantor_id: &str,
        grantee_id: &str,
        secret_id: &str,
        relation: &str,
    ) -> Result<(), AuthzError> {
        self.grant_permission(ctx, ObjectType::Secret, grantor_id, grantee_id, secret_id, relation)
            .await
    }

    pub async fn revoke_secret_permission(
        &self,
        ctx: &CancellationToken,
        revoker_id: &str,
        revokee_id: &str,
        secret_id: &str,
        relation: &str,
    ) -> Result<(), AuthzError> {
        self.revoke_permission(ctx, ObjectType::Secret, revoker_id, revokee_id, secret_id, relation)
            .await
    }

    pub async fn add_tenant_member(
        &self,
        ctx: &CancellationToken,
        actor_id: &str,
        user_id: &str,
        tenant_id: &str,
        role: &str,
    ) -> Result<(), AuthzError> {
        self.grant_permission(ctx, ObjectType::Tenant, actor_id, user_id, tenant_id, role)
            .await
    }

    pub async fn remove_tenant_member(
        &self,
        ctx: &CancellationToken,
        actor_id: &str,
        user_id: &str,
        tenant_id: &str,
        role: &str,
    ) -> Result<(), AuthzError> {
        self.revoke_permission(ctx, ObjectType::Tenant, actor_id, user_id, tenant_id, role)
            .await
    }

    pub async fn add_group_member(
        &self,
        ctx: &CancellationToken,
        actor_id: &str,
        user_id: &str,
        group_id: &str,
    ) -> Result<(), AuthzError> {
        self.grant_permission(ctx, ObjectType::Group, actor_id, user_id, group_id, "member")
            .await
    }

    pub async fn remove_group_member(
        &self,
        ctx: &CancellationToken,
        actor_id: &str,
        user_id: &str,
        group_id: &str,
    ) -> Result<(), AuthzError> {
        self.revoke_permission(ctx, ObjectType::Group, actor_id, user_id, group_id, "member")
            .await
    }

    /// Grants `relation` on the vault to every member of the group.
    pub async fn grant_group_vault_access(
        &self,
        ctx: &CancellationToken,
        grantor_id: &str,
        group_id: &str,
        vault_id: &str,
        relation: &str,
    ) -> Result<(), AuthzError> {
        require_id("group id", group_id)?;
        self.change_guarded(
            ctx,
            Change::Grant,
            ObjectType::Vault,
            grantor_id,
            format_group_members(group_id),
            vault_id,
            relation,
        )
        .await
    }

    pub async fn revoke_group_vault_access(
        &self,
        ctx: &CancellationToken,
        revoker_id: &str,
        group_id: &str,
        vault_id: &str,
        relation: &str,
    ) -> Result<(), AuthzError> {
        require_id("group id", group_id)?;
        self.change_guarded(
            ctx,
            Change::Revoke,
            ObjectType::Vault,
            revoker_id,
            format_group_members(group_id),
            vault_id,
            relation,
        )
        .await
    }

    pub async fn list_user_vaults(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
    ) -> Result<Vec<String>, AuthzError> {
        self.list_accessible(ctx, ObjectType::Vault, user_id, VIEW).await
    }

    pub async fn list_user_secrets(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
    ) -> Result<Vec<String>, AuthzError> {
        self.list_accessible(ctx, ObjectType::Secret, user_id, "read")
            .await
    }

    pub async fn list_user_tenants(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
    ) -> Result<Vec<String>, AuthzError> {
        self.list_accessible(ctx, ObjectType::Tenant, user_id, VIEW).await
    }

    pub async fn list_user_groups(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
    ) -> Result<Vec<String>, AuthzError> {
        self.list_accessible(ctx, ObjectType::Group, user_id, VIEW).await
    }

    pub async fn list_user_tokens(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
    ) -> Result<Vec<String>, AuthzError> {
        self.list_accessible(ctx, ObjectType::Token, user_id, VIEW).await
    }

    /// Bare ids of every object of `object_type` the user holds `permission` on.
    pub async fn list_accessible(
        &self,
        ctx: &CancellationToken,
        object_type: ObjectType,
        user_id: &str,
        permission: &str,
    ) -> Result<Vec<String>, AuthzError> {
        require_id("user id", user_id)?;
        if !is_checkable(object_type, permission) {
            return Err(AuthzError::UnknownPermission {
                object_type,
                permission: permission.to_string(),
            });
        }
        let request = ListObjectsRequest::new(subject(user_id), permission, object_type);
        let objects = self.client.list_objects(ctx, &request).await?;
        Ok(objects
            .iter()
            .map(|object| strip_type(object_type, object).to_string())
            .collect())
    }

    /// Writes the ownership and tenancy tuples of a freshly created vault.
    pub async fn initialize_vault(
        &self,
        ctx: &CancellationToken,
        owner_id: &str,
        vault_id: &str,
        tenant_id: &str,
    ) -> Result<(), AuthzError> {
        require_id("owner id", owner_id)?;
        require_id("vault id", vault_id)?;
        require_id("tenant id", tenant_id)?;
        let vault = ObjectType::Vault.format(vault_id);
        let tuples = [
            Tuple::new(subject(owner_id), "owner", &vault),
            Tuple::new(ObjectType::Tenant.format(tenant_id), "tenant", &vault),
        ];
        self.bootstrap(ctx, owner_id, "vault.initialize", &vault, &tuples)
            .await
    }

    pub async fn initialize_tenant(
        &self,
        ctx: &CancellationToken,
        owner_id: &str,
        tenant_id: &str,
    ) -> Result<(), AuthzError> {
        require_id("owner id", owner_id)?;
        require_id("tenant id", tenant_id)?;
        let tenant = ObjectType::Tenant.format(tenant_id);
        let tuples = [Tuple::new(subject(owner_id), "owner", &tenant)];
        self.bootstrap(ctx, owner_id, "tenant.initialize", &tenant, &tuples)
            .await
    }

    pub async fn register_token(
        &self,
        ctx: &CancellationToken,
        owner_id: &str,
        token_id: &str,
        tenant_id: &str,
    ) -> Result<(), AuthzError> {
        require_id("owner id", owner_id)?;
        require_id("token id", token_id)?;
        require_id("tenant id", tenant_id)?;
        let token = ObjectType::Token.format(token_id);
        let tuples = [
            Tuple::new(subject(owner_id), "owner", &token),
            Tuple::new(ObjectType::Tenant.format(tenant_id), "tenant", &token),
        ];
        self.bootstrap(ctx, owner_id, "token.register", &token, &tuples)
            .await
    }

    pub async fn link_secret_to_vault(
        &self,
        ctx: &CancellationToken,
        vault_id: &str,
        secret_id: &str,
    ) -> Result<(), AuthzError> {
        require_id("vault id", vault_id)?;
        require_id("secret id", secret_id)?;
        let vault = ObjectType::Vault.format(vault_id);
        let secret = ObjectType::Secret.format(secret_id);
        let tuples = [Tuple::new(&vault, "parent", &secret)];
        self.bootstrap(ctx, &vault, "secret.link", &secret, &tuples)
            .await
    }

    pub async fn report_suspicious_activity(&self, event: &SuspiciousActivityEvent) {
        self.audit.log_suspicious_activity(event).await;
    }

    pub async fn health_check(&self, ctx: &CancellationToken) -> HealthStatus {
        self.client.health_check(ctx).await
    }

    /// Starts the check cache sweep and, when `health_interval` is set, the
    /// engine health monitor. Both stop once `shutdown` is cancelled.
    pub fn spawn_background(
        &self,
        cleanup_interval: Duration,
        health_interval: Option<Duration>,
        shutdown: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(cache) = &self.cache {
            let sweep = cache.spawn_cleanup(cleanup_interval);
            let cache = Arc::downgrade(cache);
            let stop = shutdown.clone();
            handles.push(tokio::spawn(async move {
                stop.cancelled().await;
                if let Some(cache) = cache.upgrade() {
                    cache.close();
                }
                if let Err(err) = sweep.await {
                    tracing::warn!(error = %err, "cache cleanup task failed");
                }
            }));
        }
        if let Some(interval) = health_interval {
            handles.push(self.client.spawn_health_monitor(interval, shutdown.child_token()));
        }
        handles
    }

    async fn decide(
        &self,
        ctx: &CancellationToken,
        request: &CheckRequest,
        use_cache: bool,
    ) -> Result<bool, AuthzError> {
        if ctx.is_cancelled() {
            return Err(ClientError::Cancelled.into());
        }

        if use_cache && let Some(allowed) = self.cached(request) {
            self.audit_decision(request, Ok(allowed), Duration::ZERO).await;
            return Ok(allowed);
        }

        let started = Instant::now();
        let generation = self.cache_generation();
        let outcome = match self.client.check(ctx, request).await {
            Ok(response) => {
                self.remember(request, response.allowed, generation);
                Ok(response.allowed)
            }
            Err(ClientError::Cancelled) => return Err(ClientError::Cancelled.into()),
            Err(err) => Err(AuthzError::from(err)),
        };
        self.audit_decision(request, outcome.clone(), started.elapsed())
            .await;
        outcome
    }

    fn cached(&self, request: &CheckRequest) -> Option<bool> {
        let cache = self.cache.as_ref()?;
        let key = request.cache_key();
        let hit = cache.get(&key);
        self.audit.log_cache_access(&key, hit.is_some());
        hit
    }

    fn cache_generation(&self) -> u64 {
        self.cache.as_ref().map_or(0, |cache| cache.generation())
    }

    /// Caches the engine's answer unless a tuple change cleared the cache
    /// after `generation` was taken.
    fn remember(&self, request: &CheckRequest, allowed: bool, generation: u64) {
        if let Some(cache) = &self.cache
            && !cache.set_if_unchanged(request.cache_key(), allowed, generation)
        {
            tracing::debug!(object = %request.object, "permission changed during check, not cached");
        }
    }

    fn invalidate_checks(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
            tracing::debug!("permission cache cleared after tuple change");
        }
    }

    async fn audit_decision(
        &self,
        request: &CheckRequest,
        outcome: Result<bool, AuthzError>,
        duration: Duration,
    ) {
        let (result, error) = match outcome {
            Ok(allowed) => (CheckOutcome::from_allowed(allowed), None),
            Err(err) => (CheckOutcome::Error, Some(err.to_string())),
        };
        self.audit
            .log_permission_check(&PermissionCheckEvent {
                user: request.user.clone(),
                relation: request.relation.clone(),
                object: request.object.clone(),
                result,
                timestamp: Utc::now(),
                duration,
                error,
            })
            .await;
    }

    /// Verifies the actor may change access to the object, then writes or
    /// deletes the tuple. Nothing is written unless the guard says yes.
    #[allow(clippy::too_many_arguments)]
    async fn change_guarded(
        &self,
        ctx: &CancellationToken,
        change: Change,
        object_type: ObjectType,
        actor_id: &str,
        target: String,
        object_id: &str,
        relation: &str,
    ) -> Result<(), AuthzError> {
        require_id("object id", object_id)?;
        if !is_grantable(object_type, relation) {
            return Err(AuthzError::UnknownPermission {
                object_type,
                permission: relation.to_string(),
            });
        }
        let tuple = Tuple::new(target, relation, object_type.format(object_id));
        tuple.validate().map_err(|e| AuthzError::Validation(e.to_string()))?;

        let guard = domain_request(object_type, actor_id, object_id, guard_permission(object_type))?;
        if !self.decide(ctx, &guard, false).await? {
            self.audit
                .log_suspicious_activity(&SuspiciousActivityEvent {
                    user: guard.user.clone(),
                    activity: ACTIVITY_UNAUTHORIZED_CHANGE.to_string(),
                    details: format!(
                        "attempted to {} '{}' on {} for {} without '{}'",
                        change.verb(),
                        relation,
                        guard.object,
                        tuple.user,
                        guard.relation
                    ),
                    severity: Severity::Medium,
                    client_ip: None,
                    user_agent: None,
                    timestamp: Utc::now(),
                })
                .await;
            return Err(AuthzError::PermissionDenied(format!(
                "{} lacks '{}' on {}",
                guard.user, guard.relation, guard.object
            )));
        }

        let tuples = std::slice::from_ref(&tuple);
        match change {
            Change::Grant => self.client.write_tuples(ctx, tuples).await?,
            Change::Revoke => self.client.delete_tuples(ctx, tuples).await?,
        }
        self.invalidate_checks();

        match change {
            Change::Grant => {
                self.audit
                    .log_permission_grant(&PermissionGrantEvent {
                        grantor: guard.user,
                        grantee: tuple.user,
                        relation: tuple.relation,
                        object: tuple.object,
                        timestamp: Utc::now(),
                    })
                    .await
            }
            Change::Revoke => {
                self.audit
                    .log_permission_revoke(&PermissionRevokeEvent {
                        revoker: guard.user,
                        revokee: tuple.user,
                        relation: tuple.relation,
                        object: tuple.object,
                        timestamp: Utc::now(),
                    })
                    .await
            }
        }
        Ok(())
    }

    async fn bootstrap(
        &self,
        ctx: &CancellationToken,
        actor: &str,
        action: &str,
        resource: &str,
        tuples: &[Tuple],
    ) -> Result<(), AuthzError> {
        self.client.write_tuples(ctx, tuples).await?;
        self.invalidate_checks();

        let mut event = AuditEvent::new(subject_or_object(actor), action, resource, "success");
        event.metadata.insert("tuples".to_string(), tuples.len().to_string());
        self.audit.log_event(event).await;
        Ok(())
    }
}

fn subject_or_object(actor: &str) -> String {
    if actor.contains(':') {
        actor.to_string()
    } else {
        format_user(actor)
    }
}

fn domain_request(
    object_type: ObjectType,
    user_id: &str,
    object_id: &str,
    permission: &str,
) -> Result<CheckRequest, AuthzError> {
    require_id("user id", user_id)?;
    require_id(&format!("{object_type} id"), object_id)?;
    if !is_checkable(object_type, permission) {
        return Err(AuthzError::UnknownPermission {
            object_type,
            permission: permission.to_string(),
        });
    }
    let request = CheckRequest::new(subject(user_id), permission, object_type.format(object_id));
    request.validate()?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLevel;
    use crate::test_support::EventCapture;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;
    use vaultguard_client::{ClientOptions, InMemoryPolicyEngine, RetryPolicy};
    use vaultguard_core::{CheckResponse, EngineError};
    use vaultguard_core::audit::AuditQuery;

    type TestService = AuthorizationService<InMemoryPolicyEngine, InMemoryAuditStore>;

    struct Harness {
        engine: Arc<InMemoryPolicyEngine>,
        store: Arc<InMemoryAuditStore>,
        service: TestService,
    }

    fn harness_with(engine: InMemoryPolicyEngine, options: ClientOptions) -> Harness {
        let engine = Arc::new(engine);
        let store = Arc::new(InMemoryAuditStore::new());
        let client = PolicyClient::new(Arc::clone(&engine), options);
        let cache = Arc::new(PermissionCache::new(1000, Duration::from_secs(60)));
        let audit = Arc::new(AuditPipeline::with_store(AuditLevel::Standard, Arc::clone(&store)));
        Harness {
            engine,
            store,
            service: AuthorizationService::new(client, Some(cache), audit),
        }
    }

    fn harness() -> Harness {
        harness_with(
            InMemoryPolicyEngine::with_default_model(),
            ClientOptions {
                retry: RetryPolicy::no_retry(),
                ..ClientOptions::default()
            },
        )
    }

    fn seed_owner(h: &Harness, user: &str, vault: &str) {
        h.engine.seed([Tuple::new(user, "owner", vault)]);
    }

    #[tokio::test]
    async fn check_with_custom_relation_audits_one_allowed_event() {
        let capture = EventCapture::start();
        let h = harness_with(InMemoryPolicyEngine::new(), ClientOptions::default());
        let tuple: Tuple = "user:alice#can_read@vault:v1".parse().unwrap();
        assert_eq!(tuple.to_string(), "user:alice#can_read@vault:v1");
        h.engine.seed([tuple]);
        let ctx = CancellationToken::new();

        let allowed = h
            .service
            .check(&ctx, &CheckRequest::new("user:alice", "can_read", "vault:v1"))
            .await
            .unwrap();

        assert!(allowed);
        let events = capture.audit_events_of("permission_check");
        assert_eq!(events.len(), 1);
        assert!(events[0].has_field("result", "allowed"));
        assert!(events[0].has_field("relation", "can_read"));
    }

    #[tokio::test]
    async fn can_access_vault_formats_bare_ids() {
        let h = harness();
        seed_owner(&h, "user:alice", "vault:v1");
        let ctx = CancellationToken::new();

        assert!(h.service.can_access_vault(&ctx, "alice", "v1", "manage").await.unwrap());
        assert!(h.service.can_access_vault(&ctx, "user:alice", "vault:v1", "view").await.unwrap());
        assert!(!h.service.can_access_vault(&ctx, "bob", "v1", "view").await.unwrap());
    }

    #[tokio::test]
    async fn validation_errors_never_reach_the_engine() {
        let h = harness();
        let ctx = CancellationToken::new();

        let empty = h.service.can_access_vault(&ctx, "", "v1", "view").await;
        let unknown = h.service.can_access_vault(&ctx, "alice", "v1", "fly").await;
        let bad_user = h.service.can_access_secret(&ctx, "svc:x", "s1", "read").await;

        assert!(matches!(empty, Err(AuthzError::Validation(_))));
        assert!(matches!(unknown, Err(AuthzError::UnknownPermission { .. })));
        assert!(matches!(bad_user, Err(AuthzError::Validation(_))));
        assert_eq!(h.engine.check_calls(), 0);
    }

    #[tokio::test]
    async fn repeated_check_is_served_from_cache_and_still_audited() {
        let h = harness();
        seed_owner(&h, "user:alice", "vault:v1");
        let ctx = CancellationToken::new();

        for _ in 0..3 {
            assert!(h.service.can_access_vault(&ctx, "alice", "v1", "view").await.unwrap());
        }

        assert_eq!(h.engine.check_calls(), 1);
        assert_eq!(h.store.len(), 3);
        let stats = h.service.cache().unwrap().stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn timeout_is_an_error_not_a_denial() {
        let capture = EventCapture::start();
        let h = harness_with(
            InMemoryPolicyEngine::with_default_model(),
            ClientOptions {
                timeout: Duration::from_millis(20),
                retry: RetryPolicy::no_retry(),
                ..ClientOptions::default()
            },
        );
        h.engine.set_delay(Duration::from_millis(300));
        let ctx = CancellationToken::new();

        let err = h
            .service
            .can_access_vault(&ctx, "alice", "v1", "view")
            .await
            .unwrap_err();

        assert!(err.is_remote_failure(), "expected remote failure, got {err:?}");
        let events = capture.audit_events_of("permission_check");
        assert!(events.iter().all(|e| !e.has_field("result", "denied")));
        assert!(events.iter().any(|e| e.has_field("result", "error")));
        assert!(h.service.cache().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_check_returns_promptly_without_audit() {
        let capture = EventCapture::start();
        let h = harness();
        let ctx = CancellationToken::new();
        ctx.cancel();

        let err = h
            .service
            .can_access_vault(&ctx, "alice", "v1", "view")
            .await
            .unwrap_err();

        assert_eq!(err, AuthzError::Client(ClientError::Cancelled));
        assert!(capture.audit_events().is_empty());
        assert_eq!(h.engine.check_calls(), 0);
    }

    #[tokio::test]
    async fn grant_without_manage_is_denied_and_writes_nothing() {
        let capture = EventCapture::start();
        let h = harness();
        h.engine.seed([Tuple::new("user:mallory", "viewer", "vault:v1")]);
        let ctx = CancellationToken::new();

        let err = h
            .service
            .grant_vault_permission(&ctx, "mallory", "eve", "v1", "editor")
            .await
            .unwrap_err();

        assert!(matches!(err, AuthzError::PermissionDenied(_)));
        assert_eq!(h.engine.write_calls(), 0);
        let suspicious = capture.audit_events_of("suspicious_activity");
        assert_eq!(suspicious.len(), 1);
        assert!(suspicious[0].has_field("activity", ACTIVITY_UNAUTHORIZED_CHANGE));
        assert!(suspicious[0].has_field("severity", "medium"));
    }

    #[tokio::test]
    async fn guard_failure_aborts_the_grant() {
        let h = harness();
        seed_owner(&h, "user:alice", "vault:v1");
        h.engine
            .set_failure(Some(EngineError::Unavailable("maintenance".to_string())));
        let ctx = CancellationToken::new();

        let err = h
            .service
            .grant_vault_permission(&ctx, "alice", "bob", "v1", "viewer")
            .await
            .unwrap_err();

        assert!(err.is_remote_failure());
        assert_eq!(h.engine.write_calls(), 0);
    }

    #[tokio::test]
    async fn grant_writes_tuple_invalidates_cache_and_audits() {
        let capture = EventCapture::start();
        let h = harness();
        seed_owner(&h, "user:alice", "vault:v1");
        let ctx = CancellationToken::new();
        assert!(!h.service.can_access_vault(&ctx, "bob", "v1", "view").await.unwrap());

        h.service
            .grant_vault_permission(&ctx, "alice", "bob", "v1", "viewer")
            .await
            .unwrap();

        assert!(h.engine.contains(&Tuple::new("user:bob", "viewer", "vault:v1")));
        assert!(h.service.can_access_vault(&ctx, "bob", "v1", "view").await.unwrap());
        let grants = capture.audit_events_of("permission_grant");
        assert_eq!(grants.len(), 1);
        assert!(grants[0].has_field("grantee", "user:bob"));
        assert!(grants[0].has_field("grantor", "user:alice"));
    }

    #[tokio::test]
    async fn grant_rejects_computed_relation() {
        let h = harness();
        seed_owner(&h, "user:alice", "vault:v1");
        let ctx = CancellationToken::new();

        let err = h
            .service
            .grant_vault_permission(&ctx, "alice", "bob", "v1", "view")
            .await
            .unwrap_err();

        assert!(matches!(err, AuthzError::UnknownPermission { .. }));
        assert_eq!(h.engine.check_calls(), 0);
    }

    #[tokio::test]
    async fn revoke_deletes_tuple_and_audits() {
        let capture = EventCapture::start();
        let h = harness();
        seed_owner(&h, "user:alice", "vault:v1");
        h.engine.seed([Tuple::new("user:bob", "editor", "vault:v1")]);
        let ctx = CancellationToken::new();

        h.service
            .revoke_vault_permission(&ctx, "alice", "bob", "v1", "editor")
            .await
            .unwrap();

        assert!(!h.engine.contains(&Tuple::new("user:bob", "editor", "vault:v1")));
        assert_eq!(capture.audit_events_of("permission_revoke").len(), 1);
    }

    #[tokio::test]
    async fn tenant_membership_requires_manage_members() {
        let h = harness();
        h.engine.seed([
            Tuple::new("user:alice", "owner", "tenant:acme"),
            Tuple::new("user:bob", "member", "tenant:acme"),
        ]);
        let ctx = CancellationToken::new();

        h.service
            .add_tenant_member(&ctx, "alice", "carol", "acme", "member")
            .await
            .unwrap();
        let denied = h
            .service
            .add_tenant_member(&ctx, "bob", "dave", "acme", "admin")
            .await;

        assert!(h.service.can_access_tenant(&ctx, "carol", "acme", "view").await.unwrap());
        assert!(matches!(denied, Err(AuthzError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn group_vault_access_reaches_group_members() {
        let h = harness();
        seed_owner(&h, "user:alice", "vault:v1");
        h.engine.seed([Tuple::new("user:alice", "owner", "group:eng")]);
        let ctx = CancellationToken::new();

        h.service.add_group_member(&ctx, "alice", "bob", "eng").await.unwrap();
        h.service
            .grant_group_vault_access(&ctx, "alice", "eng", "v1", "viewer")
            .await
            .unwrap();

        assert!(h.engine.contains(&Tuple::new("group:eng#member", "viewer", "vault:v1")));
        assert!(h.service.can_access_vault(&ctx, "bob", "v1", "view").await.unwrap());
        assert!(h.service.can_access_group(&ctx, "bob", "eng", "view").await.unwrap());

        h.service.remove_group_member(&ctx, "alice", "bob", "eng").await.unwrap();
        assert!(!h.service.can_access_vault(&ctx, "bob", "v1", "view").await.unwrap());
    }

    #[tokio::test]
    async fn initialize_vault_makes_owner_manager_and_links_tenant() {
        let capture = EventCapture::start();
        let h = harness();
        let ctx = CancellationToken::new();

        h.service.initialize_vault(&ctx, "alice", "v9", "acme").await.unwrap();

        assert!(h.engine.contains(&Tuple::new("tenant:acme", "tenant", "vault:v9")));
        assert!(h.service.can_access_vault(&ctx, "alice", "v9", "manage").await.unwrap());
        let events = capture.audit_events_of("audit_event");
        assert_eq!(events.len(), 1);
        assert!(events[0].has_field("action", "vault.initialize"));
    }

    #[tokio::test]
    async fn token_and_secret_bootstrap() {
        let h = harness();
        let ctx = CancellationToken::new();

        h.service.register_token(&ctx, "alice", "t1", "acme").await.unwrap();
        h.service.initialize_tenant(&ctx, "alice", "acme").await.unwrap();
        h.service.link_secret_to_vault(&ctx, "v1", "s1").await.unwrap();

        assert!(h.service.can_access_token(&ctx, "alice", "t1", "use").await.unwrap());
        assert!(h.service.can_access_tenant(&ctx, "alice", "acme", "manage_billing").await.unwrap());
        assert!(h.engine.contains(&Tuple::new("vault:v1", "parent", "secret:s1")));
        assert_eq!(h.service.list_user_tokens(&ctx, "alice").await.unwrap(), vec!["t1"]);
    }

    #[tokio::test]
    async fn list_user_vaults_returns_bare_ids() {
        let h = harness();
        seed_owner(&h, "user:alice", "vault:v1");
        h.engine.seed([
            Tuple::new("user:alice", "viewer", "vault:v2"),
            Tuple::new("user:bob", "viewer", "vault:v3"),
            Tuple::new("user:alice", "owner", "secret:s1"),
        ]);
        let ctx = CancellationToken::new();

        let vaults = h.service.list_user_vaults(&ctx, "alice").await.unwrap();
        let secrets = h.service.list_user_secrets(&ctx, "alice").await.unwrap();

        assert_eq!(vaults, vec!["v1", "v2"]);
        assert_eq!(secrets, vec!["s1"]);
    }

    #[tokio::test]
    async fn batch_check_merges_cache_hits_in_order() {
        let h = harness();
        seed_owner(&h, "user:alice", "vault:v1");
        let ctx = CancellationToken::new();
        assert!(h.service.can_access_vault(&ctx, "alice", "v1", "view").await.unwrap());
        let before = h.engine.check_calls();

        let results = h
            .service
            .batch_check(
                &ctx,
                &[
                    CheckRequest::new("user:bob", "view", "vault:v1"),
                    CheckRequest::new("user:alice", "view", "vault:v1"),
                    CheckRequest::new("", "view", "vault:v1"),
                    CheckRequest::new("user:alice", "manage", "vault:v1"),
                ],
            )
            .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0], Ok(false));
        assert_eq!(results[1], Ok(true));
        assert!(matches!(results[2], Err(AuthzError::Validation(_))));
        assert_eq!(results[3], Ok(true));
        assert_eq!(h.engine.check_calls() - before, 2);
    }

    #[tokio::test]
    async fn batch_check_failed_slots_report_remote_failures() {
        let h = harness();
        h.engine
            .set_failure(Some(EngineError::Unavailable("down".to_string())));
        let ctx = CancellationToken::new();

        let results = h
            .service
            .batch_check(
                &ctx,
                &[
                    CheckRequest::new("user:a", "view", "vault:v1"),
                    CheckRequest::new("user:b", "view", "vault:v1"),
                ],
            )
            .await;

        assert!(results.iter().all(|r| r.as_ref().is_err_and(AuthzError::is_remote_failure)));
        let page = h
            .service
            .audit()
            .get_logs(&AuditQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert!(page.records.iter().all(|r| r.result == "error"));
    }

    #[tokio::test]
    async fn report_suspicious_activity_is_persisted() {
        let h = harness();

        h.service
            .report_suspicious_activity(&SuspiciousActivityEvent {
                user: "user:mallory".to_string(),
                activity: "token_reuse".to_string(),
                details: "revoked token presented".to_string(),
                severity: Severity::High,
                client_ip: Some("10.1.2.3".to_string()),
                user_agent: None,
                timestamp: Utc::now(),
            })
            .await;

        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn health_check_delegates_to_client() {
        let h = harness();

        let status = h.service.health_check(&CancellationToken::new()).await;

        assert!(status.healthy);
        assert!(status.last_checked.is_some());
    }

    #[tokio::test]
    async fn batch_check_audits_each_slot_by_its_own_error() {
        let engine = InMemoryPolicyEngine::with_default_model();
        engine.set_delay(Duration::from_millis(20));
        engine.fail_next(EngineError::Unavailable("engine restarting".to_string()));
        let h = harness_with(
            engine,
            ClientOptions {
                batch_size: 1,
                retry: RetryPolicy::no_retry(),
                ..ClientOptions::default()
            },
        );
        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });
        let requests: Vec<_> = (0..4)
            .map(|i| CheckRequest::new(format!("user:u{i}"), "view", "vault:v1"))
            .collect();

        let results = h.service.batch_check(&ctx, &requests).await;

        let unavailable = results
            .iter()
            .filter(|r| matches!(r, Err(AuthzError::Client(ClientError::Unavailable(_)))))
            .count();
        let cancelled = results
            .iter()
            .filter(|r| matches!(r, Err(AuthzError::Client(ClientError::Cancelled))))
            .count();
        assert_eq!(unavailable, 1);
        assert_eq!(cancelled, 3);

        let page = h
            .service
            .audit()
            .get_logs(&AuditQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].result, "error");
    }

    /// Answers the first armed check, then holds the answer until `resume`.
    #[derive(Default)]
    struct PausingEngine {
        inner: InMemoryPolicyEngine,
        armed: AtomicBool,
        answered: Notify,
        resume: Notify,
    }

    impl PolicyEngine for PausingEngine {
        async fn check(&self, request: &CheckRequest) -> Result<CheckResponse, EngineError> {
            let answer = self.inner.check(request).await;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.answered.notify_one();
                self.resume.notified().await;
            }
            answer
        }

        async fn list_objects(&self, request: &ListObjectsRequest) -> Result<Vec<String>, EngineError> {
            self.inner.list_objects(request).await
        }

        async fn write_tuples(&self, tuples: &[Tuple]) -> Result<(), EngineError> {
            self.inner.write_tuples(tuples).await
        }

        async fn delete_tuples(&self, tuples: &[Tuple]) -> Result<(), EngineError> {
            self.inner.delete_tuples(tuples).await
        }
    }

    #[tokio::test]
    async fn revoke_during_an_inflight_check_is_not_undone_by_the_cache() {
        let engine = Arc::new(PausingEngine {
            inner: InMemoryPolicyEngine::with_default_model(),
            ..PausingEngine::default()
        });
        engine.inner.seed([
            Tuple::new("user:alice", "owner", "vault:v1"),
            Tuple::new("user:bob", "viewer", "vault:v1"),
        ]);
        let client = PolicyClient::new(Arc::clone(&engine), ClientOptions::default());
        let cache = Arc::new(PermissionCache::new(100, Duration::from_secs(60)));
        let audit = Arc::new(AuditPipeline::new(AuditLevel::Standard));
        let service = AuthorizationService::new(client, Some(Arc::clone(&cache)), audit);
        let ctx = CancellationToken::new();

        engine.armed.store(true, Ordering::SeqCst);
        let inflight = {
            let service = service.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { service.can_access_vault(&ctx, "bob", "v1", "view").await })
        };
        engine.answered.notified().await;

        service
            .revoke_vault_permission(&ctx, "alice", "bob", "v1", "viewer")
            .await
            .unwrap();
        engine.resume.notify_one();

        assert_eq!(inflight.await.unwrap(), Ok(true));
        assert!(cache.is_empty());
        assert!(!service.can_access_vault(&ctx, "bob", "v1", "view").await.unwrap());
    }

    #[tokio::test]
    async fn background_tasks_sweep_and_check_health_until_shutdown() {
        let h = harness();
        let cache = Arc::clone(h.service.cache().unwrap());
        cache.set_with_ttl("user:bob#view@vault:v1", true, Duration::from_millis(5));
        let shutdown = CancellationToken::new();

        let handles = h.service.spawn_background(
            Duration::from_millis(10),
            Some(Duration::from_millis(10)),
            &shutdown,
        );
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(handles.len(), 2);
        assert!(cache.is_empty());
        assert!(cache.stats().last_cleanup.is_some());
        assert!(h.engine.check_calls() >= 1);

        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
