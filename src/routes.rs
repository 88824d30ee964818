use axum::{
    async_trait,
    extract::{rejection::JsonRejection, Extension, FromRequest},
    http::Request,
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;

use crate::app::Vault;
use crate::audit::AuditService;
use crate::bundles::BundleService;
use crate::error::{VaultError, VaultResult};
use crate::identity::CallMetadata;
use crate::models::{
    ActivateBundleVersionRequest, ActivateBundleVersionResponse, GetPolicyRequest,
    GetPolicyResponse, ListAuditEventsRequest, ListAuditEventsResponse,
    ListBundleVersionsRequest, ListBundleVersionsResponse, PullActiveBundleRequest,
    PullActiveBundleResponse, PushBundleVersionRequest, PushBundleVersionResponse,
    RotateBundleVersionRequest, RotateBundleVersionResponse, SetPolicyRequest, SetPolicyResponse,
};
use crate::policy::PolicyService;

/// Connect-style JSON RPC surface: `POST /vault.v1.<Service>/<Method>`.
pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/vault.v1.BundleService/PushBundleVersion",
            post(push_bundle_version),
        )
        .route(
            "/vault.v1.BundleService/PullActiveBundle",
            post(pull_active_bundle),
        )
        .route(
            "/vault.v1.BundleService/ListBundleVersions",
            post(list_bundle_versions),
        )
        .route(
            "/vault.v1.BundleService/ActivateBundleVersion",
            post(activate_bundle_version),
        )
        .route(
            "/vault.v1.BundleService/RotateBundleVersion",
            post(rotate_bundle_version),
        )
        .route("/vault.v1.PolicyService/GetPolicy", post(get_policy))
        .route("/vault.v1.PolicyService/SetPolicy", post(set_policy))
        .route(
            "/vault.v1.AuditService/ListAuditEvents",
            post(list_audit_events),
        )
}

/// API routes plus `/healthz`, with the services attached as extensions.
pub fn router(vault: Vault) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .merge(api_routes())
        .layer(Extension(vault.bundles))
        .layer(Extension(vault.policy))
        .layer(Extension(vault.audit))
}

async fn healthz() -> &'static str {
    "ok"
}

/// JSON body extractor whose rejections use the coded error body.
pub struct VaultJson<T>(pub T);

#[async_trait]
impl<S, B, T> FromRequest<S, B> for VaultJson<T>
where
    T: DeserializeOwned,
    Json<T>: FromRequest<S, B, Rejection = JsonRejection>,
    S: Send + Sync,
    B: Send + 'static,
{
    type Rejection = VaultError;

    async fn from_request(req: Request<B>, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(VaultJson(value)),
            Err(rejection) => Err(VaultError::InvalidArgument(format!(
                "malformed request body: {}",
                rejection.body_text()
            ))),
        }
    }
}

async fn push_bundle_version(
    Extension(bundles): Extension<BundleService>,
    call: CallMetadata,
    VaultJson(request): VaultJson<PushBundleVersionRequest>,
) -> VaultResult<Json<PushBundleVersionResponse>> {
    bundles.push_bundle_version(&call, request).await.map(Json)
}

async fn pull_active_bundle(
    Extension(bundles): Extension<BundleService>,
    call: CallMetadata,
    VaultJson(request): VaultJson<PullActiveBundleRequest>,
) -> VaultResult<Json<PullActiveBundleResponse>> {
    bundles.pull_active_bundle(&call, request).await.map(Json)
}

async fn list_bundle_versions(
    Extension(bundles): Extension<BundleService>,
    call: CallMetadata,
    VaultJson(request): VaultJson<ListBundleVersionsRequest>,
) -> VaultResult<Json<ListBundleVersionsResponse>> {
    bundles.list_bundle_versions(&call, request).await.map(Json)
}

async fn activate_bundle_version(
    Extension(bundles): Extension<BundleService>,
    call: CallMetadata,
    VaultJson(request): VaultJson<ActivateBundleVersionRequest>,
) -> VaultResult<Json<ActivateBundleVersionResponse>> {
    bundles.activate_bundle_version(&call, request).await.map(Json)
}

async fn rotate_bundle_version(
    Extension(bundles): Extension<BundleService>,
    call: CallMetadata,
    VaultJson(request): VaultJson<RotateBundleVersionRequest>,
) -> VaultResult<Json<RotateBundleVersionResponse>> {
    bundles.rotate_bundle_version(&call, request).await.map(Json)
}

async fn get_policy(
    Extension(policy): Extension<PolicyService>,
    call: CallMetadata,
    VaultJson(request): VaultJson<GetPolicyRequest>,
) -> VaultResult<Json<GetPolicyResponse>> {
    policy.get_policy(&call, request).await.map(Json)
}

async fn set_policy(
    Extension(policy): Extension<PolicyService>,
    call: CallMetadata,
    VaultJson(request): VaultJson<SetPolicyRequest>,
) -> VaultResult<Json<SetPolicyResponse>> {
    policy.set_policy(&call, request).await.map(Json)
}

async fn list_audit_events(
    Extension(audit): Extension<AuditService>,
    call: CallMetadata,
    VaultJson(request): VaultJson<ListAuditEventsRequest>,
) -> VaultResult<Json<ListAuditEventsResponse>> {
    audit.list_audit_events(&call, request).await.map(Json)
}
