mod authz;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub use authz::{
    AuthenticatedUser, PlanFeatureState, TenantPlan, VaultPermissionState, enforce_vault_quota,
    require_plan_feature, require_vault_permission,
};

fn error_json(status: StatusCode, msg: &str) -> Response {
    let body = serde_json::json!({"error": msg});
    (status, axum::Json(body)).into_response()
}
