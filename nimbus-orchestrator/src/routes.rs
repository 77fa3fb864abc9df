use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use nimbus_common::policy::AutoPolicyRequest;
use nimbus_common::{ControlError, MciRequest, VmRequest};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{bastion, control, policy, provisioning, repo, status, ControlPlane};

/// `ControlError` as an HTTP response.
pub struct ApiError(pub ControlError);

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, kind) = match &self.0 {
            ControlError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            ControlError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            ControlError::AlreadyExists(_) => (StatusCode::CONFLICT, "already_exists"),
            ControlError::TransitionDenied(_) => (StatusCode::CONFLICT, "transition_denied"),
            ControlError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ControlError::Transport(_) => (StatusCode::BAD_GATEWAY, "transport"),
            ControlError::PartialFailure { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "partial_failure"),
            ControlError::InconsistentRecord(_) => (StatusCode::INTERNAL_SERVER_ERROR, "inconsistent_record"),
            ControlError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store"),
        };
        if code.is_server_error() {
            tracing::error!("❌ [api] {}", self.0);
        }
        let mut body = json!({ "error": kind, "message": self.0.to_string() });
        if let ControlError::PartialFailure { failures } = &self.0 {
            body["failures"] = failures
                .iter()
                .map(|(id, err)| json!({ "id": id, "error": err }))
                .collect();
        }
        (code, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn message(msg: impl Into<String>) -> Json<Value> {
    Json(json!({ "message": msg.into() }))
}

#[derive(Deserialize, Default)]
pub struct ForceQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
pub struct ActionQuery {
    action: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
pub struct FilterQuery {
    field: Option<String>,
    value: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BastionBody {
    target_vm_ids: Vec<String>,
}

pub fn router(cp: ControlPlane) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/admin/status", get(admin_status))
        .route("/ns/{ns}/mci", post(create_mci).get(list_mcis))
        .route("/ns/{ns}/mci/{mci}", get(get_mci).delete(delete_mci))
        .route("/ns/{ns}/mci/{mci}/status", get(mci_status))
        .route("/ns/{ns}/mci/{mci}/vm", post(add_vms).get(list_vm_ids))
        .route("/ns/{ns}/mci/{mci}/vm/{vm}", axum::routing::delete(delete_vm))
        .route("/ns/{ns}/mci/{mci}/vm/{vm}/status", get(vm_status))
        .route("/ns/{ns}/mci/{mci}/bastion", get(list_bastions))
        .route("/ns/{ns}/mci/{mci}/bastion/{vm}", put(set_bastion))
        .route("/ns/{ns}/control/mci/{mci}", get(control_mci))
        .route("/ns/{ns}/control/mci/{mci}/vm/{vm}", get(control_vm))
        .route(
            "/ns/{ns}/policy/mci",
            get(list_policies).delete(delete_all_policies),
        )
        .route(
            "/ns/{ns}/policy/mci/{mci}",
            put(create_policy).post(create_policy).get(get_policy).delete(delete_policy),
        )
        .with_state(cp)
}

async fn root() -> &'static str {
    "Nimbus control plane online"
}

async fn admin_status(State(cp): State<ControlPlane>) -> ApiResult<Json<Value>> {
    let namespaces = repo::policy_namespaces(cp.store.as_ref()).await?;
    Ok(Json(json!({
        "store": "ok",
        "autoscaled_namespaces": namespaces,
    })))
}

async fn create_mci(
    State(cp): State<ControlPlane>,
    Path(ns): Path<String>,
    Json(req): Json<MciRequest>,
) -> ApiResult<impl IntoResponse> {
    let mci = provisioning::create_mci(&cp, &ns, req).await?;
    Ok((StatusCode::CREATED, Json(mci)))
}

async fn list_mcis(State(cp): State<ControlPlane>, Path(ns): Path<String>) -> ApiResult<Json<Value>> {
    let mcis = provisioning::list_mcis(&cp, &ns).await?;
    Ok(Json(json!({ "mci": mcis })))
}

async fn get_mci(
    State(cp): State<ControlPlane>,
    Path((ns, mci)): Path<(String, String)>,
) -> ApiResult<Json<provisioning::MciView>> {
    Ok(Json(provisioning::get_mci(&cp, &ns, &mci).await?))
}

async fn delete_mci(
    State(cp): State<ControlPlane>,
    Path((ns, mci)): Path<(String, String)>,
    Query(q): Query<ForceQuery>,
) -> ApiResult<Json<Value>> {
    provisioning::delete_mci(&cp, &ns, &mci, q.force).await?;
    Ok(message(format!("Deleted the MCI '{}'", mci)))
}

async fn mci_status(
    State(cp): State<ControlPlane>,
    Path((ns, mci)): Path<(String, String)>,
) -> ApiResult<Json<nimbus_common::MciStatusInfo>> {
    Ok(Json(status::get_mci_status(&cp, &ns, &mci).await?))
}

async fn vm_status(
    State(cp): State<ControlPlane>,
    Path((ns, mci, vm)): Path<(String, String, String)>,
) -> ApiResult<Json<nimbus_common::VmStatusInfo>> {
    let (_, info) = status::fetch_vm_status(&cp, &ns, &mci, &vm).await?;
    Ok(Json(info))
}

async fn add_vms(
    State(cp): State<ControlPlane>,
    Path((ns, mci)): Path<(String, String)>,
    Json(req): Json<VmRequest>,
) -> ApiResult<impl IntoResponse> {
    let ids = provisioning::add_vms(&cp, &ns, &mci, req).await?;
    Ok((StatusCode::CREATED, Json(json!({ "vmIds": ids }))))
}

async fn list_vm_ids(
    State(cp): State<ControlPlane>,
    Path((ns, mci)): Path<(String, String)>,
    Query(q): Query<FilterQuery>,
) -> ApiResult<Json<Value>> {
    let ids = match (q.field, q.value) {
        (Some(field), Some(value)) => {
            provisioning::list_vm_ids_by_filter(&cp, &ns, &mci, &field, &value).await?
        }
        (None, None) => {
            repo::load_mci(cp.store.as_ref(), &ns, &mci).await?;
            repo::list_vm_ids(cp.store.as_ref(), &ns, &mci).await?
        }
        _ => {
            return Err(ControlError::Validation(
                "field and value must be given together".to_string(),
            )
            .into())
        }
    };
    Ok(Json(json!({ "vmIds": ids })))
}

async fn delete_vm(
    State(cp): State<ControlPlane>,
    Path((ns, mci, vm)): Path<(String, String, String)>,
    Query(q): Query<ForceQuery>,
) -> ApiResult<Json<Value>> {
    provisioning::delete_vm(&cp, &ns, &mci, &vm, q.force).await?;
    Ok(message(format!("Deleted the VM '{}'", vm)))
}

async fn list_bastions(
    State(cp): State<ControlPlane>,
    Path((ns, mci)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let list = bastion::list_bastions(&cp, &ns, &mci).await?;
    Ok(Json(json!({ "bastion": list })))
}

async fn set_bastion(
    State(cp): State<ControlPlane>,
    Path((ns, mci, vm)): Path<(String, String, String)>,
    Json(body): Json<BastionBody>,
) -> ApiResult<Json<nimbus_common::BastionAssignment>> {
    Ok(Json(
        bastion::set_bastion(&cp, &ns, &mci, &vm, body.target_vm_ids).await?,
    ))
}

async fn control_mci(
    State(cp): State<ControlPlane>,
    Path((ns, mci)): Path<(String, String)>,
    Query(q): Query<ActionQuery>,
) -> ApiResult<Json<Value>> {
    let msg = control::handle_mci_action(&cp, &ns, &mci, &q.action, q.force).await?;
    Ok(message(msg))
}

async fn control_vm(
    State(cp): State<ControlPlane>,
    Path((ns, mci, vm)): Path<(String, String, String)>,
    Query(q): Query<ActionQuery>,
) -> ApiResult<Json<Value>> {
    let msg = control::handle_vm_action(&cp, &ns, &mci, &vm, &q.action, q.force).await?;
    Ok(message(msg))
}

async fn create_policy(
    State(cp): State<ControlPlane>,
    Path((ns, mci)): Path<(String, String)>,
    Json(req): Json<AutoPolicyRequest>,
) -> ApiResult<Json<nimbus_common::policy::AutoPolicy>> {
    Ok(Json(policy::create_policy(&cp, &ns, &mci, req).await?))
}

async fn get_policy(
    State(cp): State<ControlPlane>,
    Path((ns, mci)): Path<(String, String)>,
) -> ApiResult<Json<nimbus_common::policy::AutoPolicy>> {
    Ok(Json(policy::get_policy(&cp, &ns, &mci).await?))
}

async fn list_policies(State(cp): State<ControlPlane>, Path(ns): Path<String>) -> ApiResult<Json<Value>> {
    let list = policy::list_policies(&cp, &ns).await?;
    Ok(Json(json!({ "mciPolicy": list })))
}

async fn delete_policy(
    State(cp): State<ControlPlane>,
    Path((ns, mci)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    policy::delete_policy(&cp, &ns, &mci).await?;
    Ok(message(format!("Deleted the policy of MCI '{}'", mci)))
}

async fn delete_all_policies(State(cp): State<ControlPlane>, Path(ns): Path<String>) -> ApiResult<Json<Value>> {
    let n = policy::delete_all_policies(&cp, &ns).await?;
    Ok(message(format!("Deleted {} policies in namespace '{}'", n, ns)))
}
