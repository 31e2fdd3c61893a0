use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;
use vaultguard_client::ClientError;
use vaultguard_core::plan::ResourceType;
use vaultguard_core::{PlanFeature, PlanType, PolicyEngine};
use vaultguard_storage::{AuditStore, PlanOverrideStore};

use super::error_json;
use crate::error::{AuthzError, PlanError};
use crate::plan_limits::PlanLimitService;
use crate::service::AuthorizationService;

/// Identity placed in request extensions by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantPlan {
    pub tenant_id: String,
    pub plan: PlanType,
}

pub struct VaultPermissionState<E: PolicyEngine, S: AuditStore> {
    service: AuthorizationService<E, S>,
    permission: &'static str,
}

impl<E: PolicyEngine, S: AuditStore> Clone for VaultPermissionState<E, S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            permission: self.permission,
        }
    }
}

impl<E: PolicyEngine, S: AuditStore> VaultPermissionState<E, S> {
    pub fn new(service: AuthorizationService<E, S>, permission: &'static str) -> Self {
        Self {
            service,
            permission,
        }
    }
}

fn authz_failure(err: &AuthzError) -> Response {
    match err {
        AuthzError::Validation(_) | AuthzError::UnknownPermission { .. } => {
            error_json(StatusCode::BAD_REQUEST, &err.to_string())
        }
        AuthzError::PermissionDenied(_) => error_json(StatusCode::FORBIDDEN, "permission denied"),
        AuthzError::Client(ClientError::Rejected(_)) => {
            error_json(StatusCode::BAD_REQUEST, &err.to_string())
        }
        AuthzError::Client(ClientError::CircuitOpen | ClientError::RateLimited) => {
            error_json(StatusCode::SERVICE_UNAVAILABLE, "authorization service unavailable")
        }
        _ if err.is_remote_failure() => {
            tracing::warn!(error = %err, "authorization check failed");
            error_json(StatusCode::SERVICE_UNAVAILABLE, "authorization service unavailable")
        }
        _ => {
            tracing::error!(error = %err, "authorization check failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

fn plan_failure(err: &PlanError) -> Response {
    match err {
        PlanError::Storage(_) => {
            tracing::error!(error = %err, "plan limit lookup failed");
            error_json(StatusCode::SERVICE_UNAVAILABLE, "plan limits unavailable")
        }
        _ => error_json(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

/// Admits the request only if the authenticated user holds the configured
/// permission on the `vault_id` path parameter. Install with `route_layer`
/// so path parameters are resolved.
pub async fn require_vault_permission<E: PolicyEngine, S: AuditStore>(
    State(state): State<VaultPermissionState<E, S>>,
    Path(params): Path<HashMap<String, String>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(AuthenticatedUser(user_id)) = request.extensions().get::<AuthenticatedUser>().cloned()
    else {
        return error_json(StatusCode::UNAUTHORIZED, "authentication required");
    };
    let Some(vault_id) = params.get("vault_id") else {
        return error_json(StatusCode::BAD_REQUEST, "missing vault id");
    };

    let ctx = CancellationToken::new();
    match state
        .service
        .can_access_vault(&ctx, &user_id, vault_id, state.permission)
        .await
    {
        Ok(true) => next.run(request).await,
        Ok(false) => error_json(StatusCode::FORBIDDEN, "permission denied"),
        Err(err) => authz_failure(&err),
    }
}

pub struct PlanFeatureState<O: PlanOverrideStore> {
    plans: Arc<PlanLimitService<O>>,
    feature: PlanFeature,
}

impl<O: PlanOverrideStore> Clone for PlanFeatureState<O> {
    fn clone(&self) -> Self {
        Self {
            plans: Arc::clone(&self.plans),
            feature: self.feature,
        }
    }
}

impl<O: PlanOverrideStore> PlanFeatureState<O> {
    pub fn new(plans: Arc<PlanLimitService<O>>, feature: PlanFeature) -> Self {
        Self { plans, feature }
    }
}

pub async fn require_plan_feature<O: PlanOverrideStore>(
    State(state): State<PlanFeatureState<O>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(tenant) = request.extensions().get::<TenantPlan>().cloned() else {
        return error_json(StatusCode::UNAUTHORIZED, "missing tenant context");
    };

    match state
        .plans
        .has_feature(&tenant.tenant_id, tenant.plan, state.feature)
        .await
    {
        Ok(true) => next.run(request).await,
        Ok(false) => error_json(
            StatusCode::FORBIDDEN,
            &format!("feature '{}' is not included in the {} plan", state.feature, tenant.plan),
        ),
        Err(err) => plan_failure(&err),
    }
}

/// Refuses creating another vault once the tenant's plan quota is used up.
pub async fn enforce_vault_quota<O: PlanOverrideStore>(
    plans: &PlanLimitService<O>,
    tenant: &TenantPlan,
    current_vaults: i64,
) -> Result<(), Response> {
    let resource = ResourceType::Vault.to_string();
    let within = plans
        .is_within_limits(&tenant.tenant_id, tenant.plan, &resource, current_vaults)
        .await
        .map_err(|e| plan_failure(&e))?;
    if within {
        return Ok(());
    }

    let limits = plans
        .get_plan_limits(&tenant.tenant_id, tenant.plan)
        .await
        .map_err(|e| plan_failure(&e))?;
    let body = serde_json::json!({
        "error": "quota exceeded",
        "resource": resource,
        "limit": limits.vault_limit,
        "current": current_vaults,
        "plan": tenant.plan,
    });
    Err((StatusCode::FORBIDDEN, axum::Json(body)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLevel, AuditPipeline};
    use crate::cache::PermissionCache;
    use axum::Router;
    use axum::middleware;
    use axum::routing::{get, post};
    use axum_test::TestServer;
    use serde_json::json;
    use std::time::Duration;
    use vaultguard_client::{ClientOptions, InMemoryPolicyEngine, PolicyClient, RetryPolicy};
    use vaultguard_core::{EngineError, Tuple};
    use vaultguard_storage::{InMemoryAuditStore, InMemoryPlanOverrideStore};

    type Service = AuthorizationService<InMemoryPolicyEngine, InMemoryAuditStore>;

    fn service(engine: Arc<InMemoryPolicyEngine>) -> Service {
        let client = PolicyClient::new(
            engine,
            ClientOptions {
                retry: RetryPolicy::no_retry(),
                ..ClientOptions::default()
            },
        );
        let audit = Arc::new(AuditPipeline::with_store(
            AuditLevel::Standard,
            Arc::new(InMemoryAuditStore::new()),
        ));
        let cache = Arc::new(PermissionCache::new(100, Duration::from_secs(60)));
        AuthorizationService::new(client, Some(cache), audit)
    }

    fn vault_server(engine: Arc<InMemoryPolicyEngine>, user: Option<&str>) -> TestServer {
        let state = VaultPermissionState::new(service(engine), "view");
        let user = user.map(|u| AuthenticatedUser(u.to_string()));
        let app = Router::new()
            .route(
                "/vaults/{vault_id}",
                get(|Path(vault_id): Path<String>| async move { axum::Json(json!({"vault": vault_id})) }),
            )
            .route_layer(middleware::from_fn_with_state(
                state,
                require_vault_permission::<InMemoryPolicyEngine, InMemoryAuditStore>,
            ))
            .layer(middleware::from_fn(move |mut request: Request<Body>, next: Next| {
                let user = user.clone();
                async move {
                    if let Some(user) = user {
                        request.extensions_mut().insert(user);
                    }
                    next.run(request).await
                }
            }));
        TestServer::new(app).unwrap()
    }

    fn seeded_engine() -> Arc<InMemoryPolicyEngine> {
        let engine = Arc::new(InMemoryPolicyEngine::with_default_model());
        engine.seed([Tuple::new("user:alice", "viewer", "vault:v1")]);
        engine
    }

    #[tokio::test]
    async fn vault_permission_admits_authorized_user() {
        let server = vault_server(seeded_engine(), Some("alice"));

        let response = server.get("/vaults/v1").await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["vault"], "v1");
    }

    #[tokio::test]
    async fn vault_permission_without_user_returns_401() {
        let server = vault_server(seeded_engine(), None);

        let response = server.get("/vaults/v1").await;

        response.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn vault_permission_denied_returns_403() {
        let server = vault_server(seeded_engine(), Some("bob"));

        let response = server.get("/vaults/v1").await;

        response.assert_status(StatusCode::FORBIDDEN);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"], "permission denied");
    }

    #[tokio::test]
    async fn vault_permission_invalid_user_returns_400() {
        let server = vault_server(seeded_engine(), Some("svc:robot"));

        let response = server.get("/vaults/v1").await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn vault_permission_engine_outage_returns_503() {
        let engine = seeded_engine();
        engine.set_failure(Some(EngineError::Unavailable("down".to_string())));
        let server = vault_server(engine, Some("alice"));

        let response = server.get("/vaults/v1").await;

        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    }

    fn plans() -> Arc<PlanLimitService<InMemoryPlanOverrideStore>> {
        Arc::new(PlanLimitService::new(Arc::new(InMemoryPlanOverrideStore::new())))
    }

    fn feature_server(plan: PlanType) -> TestServer {
        let state = PlanFeatureState::new(plans(), PlanFeature::AuditLogs);
        let tenant = TenantPlan {
            tenant_id: "acme".to_string(),
            plan,
        };
        let app = Router::new()
            .route("/audit", get(|| async { axum::Json(json!({"ok": true})) }))
            .layer(middleware::from_fn_with_state(
                state,
                require_plan_feature::<InMemoryPlanOverrideStore>,
            ))
            .layer(axum::Extension(tenant));
        TestServer::new(app).unwrap()
    }

    #[tokio::test]
    async fn plan_feature_admits_pro_tenant() {
        let server = feature_server(PlanType::Pro);

        server.get("/audit").await.assert_status_ok();
    }

    #[tokio::test]
    async fn plan_feature_blocks_free_tenant() {
        let server = feature_server(PlanType::Free);

        let response = server.get("/audit").await;

        response.assert_status(StatusCode::FORBIDDEN);
        let body: serde_json::Value = response.json();
        assert!(body["error"].as_str().unwrap().contains("audit_logs"));
    }

    #[tokio::test]
    async fn vault_quota_helper_renders_quota_exceeded() {
        let plans = plans();
        let app = Router::new().route(
            "/vaults/{count}",
            post(move |Path(count): Path<i64>| {
                let plans = Arc::clone(&plans);
                async move {
                    let tenant = TenantPlan {
                        tenant_id: "acme".to_string(),
                        plan: PlanType::Free,
                    };
                    match enforce_vault_quota(&plans, &tenant, count).await {
                        Ok(()) => StatusCode::CREATED.into_response(),
                        Err(response) => response,
                    }
                }
            }),
        );
        let server = TestServer::new(app).unwrap();

        server.post("/vaults/2").await.assert_status(StatusCode::CREATED);
        let response = server.post("/vaults/3").await;

        response.assert_status(StatusCode::FORBIDDEN);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"], "quota exceeded");
        assert_eq!(body["limit"], 3);
        assert_eq!(body["plan"], "free");
    }
}
