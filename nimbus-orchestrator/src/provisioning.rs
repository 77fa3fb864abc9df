//! MCI creation, VM add/remove, hold handling, refine and cascading delete.

use std::collections::HashSet;

use futures_util::future::join_all;
use nimbus_common::filter::VmField;
use nimbus_common::{
    keys, Action, ControlError, ControlResult, HoldState, Mci, MciRequest, Status, SubGroup, Vm,
    VmRequest,
};
use nimbus_providers::VmCreateSpec;
use serde::Serialize;

use crate::{control, repo, status, ControlPlane};

/// An MCI with its VM records, as returned by `get_mci`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MciView {
    #[serde(flatten)]
    pub mci: Mci,
    pub sub_groups: Vec<String>,
    pub vm: Vec<Vm>,
}

fn validate_vm_request(req: &VmRequest) -> ControlResult<()> {
    keys::validate_id("subGroup", &req.name)?;
    if req.sub_group_size == 0 {
        return Err(ControlError::Validation(format!(
            "sub-group '{}' must have at least one VM",
            req.name
        )));
    }
    for (field, value) in [
        ("connectionName", &req.connection_name),
        ("specId", &req.spec_id),
        ("imageId", &req.image_id),
    ] {
        if value.trim().is_empty() {
            return Err(ControlError::Validation(format!(
                "sub-group '{}' is missing {}",
                req.name, field
            )));
        }
    }
    Ok(())
}

/// Create an MCI and provision its VMs. With `hold`, records are persisted
/// and provisioning waits in the background for `continue` or `withdraw`.
pub async fn create_mci(cp: &ControlPlane, ns: &str, req: MciRequest) -> ControlResult<Mci> {
    let store = cp.store.as_ref();
    keys::validate_id("namespace", ns)?;
    keys::validate_id("mci", &req.name)?;
    if req.vm.is_empty() {
        return Err(ControlError::Validation(format!(
            "MCI '{}' has no VM request",
            req.name
        )));
    }
    let mut seen = HashSet::new();
    for vm_req in &req.vm {
        validate_vm_request(vm_req)?;
        if !seen.insert(vm_req.name.as_str()) {
            return Err(ControlError::Validation(format!(
                "sub-group '{}' is requested twice",
                vm_req.name
            )));
        }
    }
    if repo::find_mci(store, ns, &req.name).await?.is_some() {
        return Err(ControlError::AlreadyExists(format!("MCI '{}'", req.name)));
    }

    let mut mci = Mci::new(&req.name, &req.name);
    mci.description = req.description.clone();
    mci.label = req.label.clone();
    mci.status = Status::Creating;
    mci.target_action = Action::Create;
    mci.target_status = Status::Running;
    mci.hold = if req.hold {
        HoldState::Held
    } else {
        HoldState::Released
    };
    repo::save_mci(store, ns, &mut mci).await?;

    let mut vm_ids = Vec::new();
    for vm_req in &req.vm {
        for vm in persist_sub_group(cp, ns, &mci.id, vm_req).await? {
            vm_ids.push(vm.id);
        }
    }
    tracing::info!(
        "📦 [provisioning] MCI {}/{} registered with {} VM(s){}",
        ns,
        mci.id,
        vm_ids.len(),
        if req.hold { " (on hold)" } else { "" }
    );

    if req.hold {
        let cp = cp.clone();
        let (ns, mci_id) = (ns.to_string(), mci.id.clone());
        tokio::spawn(async move {
            provision_when_released(&cp, &ns, &mci_id, vm_ids).await;
        });
        return Ok(mci);
    }

    provision_and_finish(cp, ns, &mci.id, &vm_ids).await;
    repo::load_mci(store, ns, &mci.id).await
}

async fn provision_and_finish(cp: &ControlPlane, ns: &str, mci_id: &str, vm_ids: &[String]) {
    let failures = provision_vms(cp, ns, mci_id, vm_ids).await;
    if !failures.is_empty() {
        tracing::warn!(
            "⚠️ [provisioning] MCI {}/{}: {} of {} VM(s) failed to create",
            ns,
            mci_id,
            failures.len(),
            vm_ids.len()
        );
    }
    if let Err(e) = finish_creation(cp, ns, mci_id).await {
        tracing::error!("❌ [provisioning] could not finalize MCI {}/{}: {}", ns, mci_id, e);
    }
}

async fn finish_creation(cp: &ControlPlane, ns: &str, mci_id: &str) -> ControlResult<()> {
    let store = cp.store.as_ref();
    let mut mci = repo::load_mci(store, ns, mci_id).await?;
    mci.target_action = Action::Complete;
    mci.target_status = Status::Complete;
    mci.hold = HoldState::Released;
    repo::save_mci(store, ns, &mut mci).await?;
    let info = status::get_mci_status(cp, ns, mci_id).await?;
    tracing::info!("✅ [provisioning] MCI {}/{} is {}", ns, mci_id, info.status);
    Ok(())
}

async fn provision_when_released(cp: &ControlPlane, ns: &str, mci_id: &str, vm_ids: Vec<String>) {
    loop {
        tokio::time::sleep(cp.tuning.hold_poll).await;
        let mci = match repo::find_mci(cp.store.as_ref(), ns, mci_id).await {
            Ok(Some(mci)) => mci,
            Ok(None) => {
                tracing::info!("[provisioning] held MCI {}/{} is gone, nothing to do", ns, mci_id);
                return;
            }
            Err(e) => {
                tracing::warn!("⚠️ [provisioning] reading held MCI {}/{} failed: {}", ns, mci_id, e);
                continue;
            }
        };
        match mci.hold {
            HoldState::Held => continue,
            HoldState::Continue | HoldState::Released => break,
            HoldState::Withdraw => {
                tracing::info!("🧹 [provisioning] MCI {}/{} withdrawn", ns, mci_id);
                if let Err(e) = withdraw(cp, ns, mci_id).await {
                    tracing::error!("❌ [provisioning] withdraw of MCI {}/{} failed: {}", ns, mci_id, e);
                }
                return;
            }
        }
    }
    tracing::info!("▶️ [provisioning] MCI {}/{} released, provisioning", ns, mci_id);
    provision_and_finish(cp, ns, mci_id, &vm_ids).await;
}

async fn withdraw(cp: &ControlPlane, ns: &str, mci_id: &str) -> ControlResult<()> {
    let store = cp.store.as_ref();
    for mut vm in repo::list_vms(store, ns, mci_id).await? {
        vm.status = Status::Terminated;
        vm.target_action = Action::Terminate;
        vm.target_status = Status::Terminated;
        repo::save_vm(store, ns, &mut vm).await?;
    }
    purge_mci(cp, ns, mci_id).await
}

/// Flip the hold flag of a held MCI to `Continue` or `Withdraw`.
pub async fn resolve_hold(cp: &ControlPlane, ns: &str, mci_id: &str, action: Action) -> ControlResult<()> {
    let store = cp.store.as_ref();
    let (mut mci, raw) = repo::load_mci_raw(store, ns, mci_id).await?;
    if mci.hold != HoldState::Held {
        return Err(ControlError::Validation(format!(
            "MCI '{}' is not on hold",
            mci_id
        )));
    }
    mci.hold = match action {
        Action::Continue => HoldState::Continue,
        Action::Withdraw => HoldState::Withdraw,
        other => {
            return Err(ControlError::Validation(format!(
                "'{}' does not resolve a hold",
                other
            )))
        }
    };
    repo::save_mci_checked(store, ns, &mut mci, &raw).await
}

/// Persist the VMs of one sub-group request (extending the sub-group if it
/// exists) and register their catalog associations. VM ids are `{sg}-{n}`.
async fn persist_sub_group(
    cp: &ControlPlane,
    ns: &str,
    mci_id: &str,
    req: &VmRequest,
) -> ControlResult<Vec<Vm>> {
    let store = cp.store.as_ref();
    let existing: HashSet<String> = repo::list_vm_ids(store, ns, mci_id)
        .await?
        .into_iter()
        .collect();
    let mut sg = repo::find_sub_group(store, ns, mci_id, &req.name)
        .await?
        .unwrap_or_else(|| SubGroup {
            id: req.name.clone(),
            mci_id: mci_id.to_string(),
            vm_ids: Vec::new(),
            request: req.clone(),
        });

    let mut created = Vec::with_capacity(req.sub_group_size);
    let mut n = 0usize;
    for _ in 0..req.sub_group_size {
        let vm_id = loop {
            n += 1;
            let candidate = format!("{}-{}", req.name, n);
            if !existing.contains(&candidate) && !sg.vm_ids.contains(&candidate) {
                break candidate;
            }
        };
        keys::validate_id("vm", &vm_id)?;
        let mut vm = Vm::from_request(mci_id, &vm_id, &sg.id, req);
        repo::save_vm(store, ns, &mut vm).await?;
        crate::catalog::register_vm(cp, ns, &vm).await;
        sg.vm_ids.push(vm_id);
        created.push(vm);
    }
    repo::save_sub_group(store, ns, &sg).await?;
    Ok(created)
}

/// Create every listed VM on its provider, staggered, and wait for all.
/// Returns `(vm_id, error)` for each VM that failed.
async fn provision_vms(
    cp: &ControlPlane,
    ns: &str,
    mci_id: &str,
    vm_ids: &[String],
) -> Vec<(String, String)> {
    let mut handles = Vec::with_capacity(vm_ids.len());
    for (i, vm_id) in vm_ids.iter().enumerate() {
        if i > 0 && !cp.tuning.control_stagger.is_zero() {
            tokio::time::sleep(cp.tuning.control_stagger).await;
        }
        let cp = cp.clone();
        let (ns, mci_id, vm_id) = (ns.to_string(), mci_id.to_string(), vm_id.clone());
        handles.push(tokio::spawn(async move {
            let res = create_one_vm(&cp, &ns, &mci_id, &vm_id).await;
            (vm_id, res)
        }));
    }

    let mut failures = Vec::new();
    for joined in join_all(handles).await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((vm_id, Err(e))) => failures.push((vm_id, e.to_string())),
            Err(e) => tracing::error!("❌ [provisioning] VM task aborted: {}", e),
        }
    }
    failures.sort();
    failures
}

async fn create_one_vm(cp: &ControlPlane, ns: &str, mci_id: &str, vm_id: &str) -> ControlResult<()> {
    let store = cp.store.as_ref();
    let mut vm = repo::load_vm(store, ns, mci_id, vm_id).await?;
    let spec = VmCreateSpec {
        connection_name: vm.connection_name.clone(),
        name: format!("{}-{}", mci_id, vm.name),
        image_name: vm.image_id.clone(),
        spec_name: vm.spec_id.clone(),
        vpc_name: vm.vnet_id.clone(),
        subnet_name: vm.subnet_id.clone(),
        security_group_names: vm.security_group_ids.clone(),
        key_pair_name: vm.ssh_key_id.clone(),
        data_disk_names: vm.data_disk_ids.clone(),
    };

    match cp.cloud.create_vm(&spec).await {
        Ok(created) => {
            vm.csp_id = created.csp_id;
            status::apply_access(&mut vm, &created.access);
            vm.status = match Status::from_native(&created.access.status) {
                Status::Undefined => Status::Running,
                st => st,
            };
            vm.target_action = Action::Complete;
            vm.target_status = Status::Complete;
            vm.system_message.clear();
            repo::save_vm(store, ns, &mut vm).await?;
            tracing::info!(
                "🆕 [provisioning] VM {} created on {} as {}",
                vm.id,
                vm.connection_name,
                vm.csp_id
            );
            Ok(())
        }
        Err(e) => {
            tracing::warn!("⚠️ [provisioning] VM {} creation failed: {}", vm.id, e);
            vm.status = Status::Failed;
            vm.system_message = e.to_string();
            repo::save_vm(store, ns, &mut vm).await?;
            Err(ControlError::Transport(e.to_string()))
        }
    }
}

/// Add a sub-group (or grow an existing one) on an idle MCI and provision it.
/// Returns the new VM ids; any creation failure is reported as a
/// `PartialFailure` after the successful VMs are persisted.
pub async fn add_vms(cp: &ControlPlane, ns: &str, mci_id: &str, req: VmRequest) -> ControlResult<Vec<String>> {
    let mci = repo::load_mci(cp.store.as_ref(), ns, mci_id).await?;
    if mci.is_busy() {
        return Err(ControlError::TransitionDenied(format!(
            "MCI '{}' is still processing {}",
            mci_id, mci.target_action
        )));
    }
    validate_vm_request(&req)?;

    let vm_ids: Vec<String> = persist_sub_group(cp, ns, mci_id, &req)
        .await?
        .into_iter()
        .map(|vm| vm.id)
        .collect();
    let failures = provision_vms(cp, ns, mci_id, &vm_ids).await;
    if !failures.is_empty() {
        return Err(ControlError::PartialFailure { failures });
    }
    tracing::info!(
        "📈 [provisioning] added {} VM(s) to MCI {}/{}",
        vm_ids.len(),
        ns,
        mci_id
    );
    Ok(vm_ids)
}

/// Drop every VM record that ended up `Failed` or `Undefined`.
pub async fn refine_mci(cp: &ControlPlane, ns: &str, mci_id: &str) -> ControlResult<Vec<String>> {
    let store = cp.store.as_ref();
    repo::load_mci(store, ns, mci_id).await?;
    let mut removed = Vec::new();
    for vm in repo::list_vms(store, ns, mci_id).await? {
        if matches!(vm.status, Status::Failed | Status::Undefined) {
            purge_vm(cp, ns, &vm).await?;
            removed.push(vm.id);
        }
    }
    tracing::info!("🧽 [provisioning] refined MCI {}/{}: {:?}", ns, mci_id, removed);
    Ok(removed)
}

/// Remove a VM record with its associations, bastion roles and sub-group
/// membership. Does not touch the provider.
pub(crate) async fn purge_vm(cp: &ControlPlane, ns: &str, vm: &Vm) -> ControlResult<()> {
    let store = cp.store.as_ref();
    control::release_vm(cp, ns, vm).await;
    repo::delete_vm_record(store, ns, &vm.mci_id, &vm.id).await?;
    if let Some(mut sg) = repo::find_sub_group(store, ns, &vm.mci_id, &vm.sub_group_id).await? {
        sg.vm_ids.retain(|id| id != &vm.id);
        if sg.vm_ids.is_empty() {
            repo::delete_sub_group(store, ns, &vm.mci_id, &sg.id).await?;
        } else {
            repo::save_sub_group(store, ns, &sg).await?;
        }
    }
    Ok(())
}

/// Delete one VM. Without `force` only VMs that are already Terminated,
/// Failed or Undefined can go; with `force` a live VM is terminated first
/// (best effort).
pub async fn delete_vm(cp: &ControlPlane, ns: &str, mci_id: &str, vm_id: &str, force: bool) -> ControlResult<()> {
    let mut vm = repo::load_vm(cp.store.as_ref(), ns, mci_id, vm_id).await?;
    match status::fetch_vm_status(cp, ns, mci_id, vm_id).await {
        Ok((current, _)) => vm.status = current,
        Err(e) => tracing::warn!("⚠️ [provisioning] could not refresh VM {} before delete: {}", vm_id, e),
    }
    let gone = matches!(vm.status, Status::Terminated | Status::Failed | Status::Undefined);
    if !gone {
        if !force {
            return Err(ControlError::TransitionDenied(format!(
                "VM '{}' is {}; terminate it first or use force",
                vm_id, vm.status
            )));
        }
        if !vm.csp_id.is_empty() {
            if let Err(e) = cp.cloud.terminate_vm(&vm.connection_name, &vm.csp_id).await {
                tracing::warn!("⚠️ [provisioning] best-effort terminate of VM {} failed: {}", vm_id, e);
            }
        }
    }
    purge_vm(cp, ns, &vm).await
}

/// Delete an MCI and everything under it.
///
/// Refused unless the MCI is wholly Terminated, Undefined or Failed; `force`
/// first attempts to terminate whatever is still alive.
pub async fn delete_mci(cp: &ControlPlane, ns: &str, mci_id: &str, force: bool) -> ControlResult<()> {
    let info = status::get_mci_status(cp, ns, mci_id).await?;
    let deletable = !info.partial
        && matches!(
            info.dominant_status,
            Status::Terminated | Status::Undefined | Status::Failed
        );
    if !deletable {
        if !force {
            return Err(ControlError::TransitionDenied(format!(
                "MCI '{}' is {}; only Terminated, Undefined or Failed MCIs can be deleted (terminate first or use force)",
                mci_id, info.status
            )));
        }
        tracing::warn!(
            "⚠️ [provisioning] force-deleting MCI {}/{} in state {}",
            ns,
            mci_id,
            info.status
        );
        if let Err(e) = control::control_mci(cp, ns, mci_id, Action::Terminate, true).await {
            tracing::warn!("⚠️ [provisioning] best-effort terminate of MCI {} failed: {}", mci_id, e);
        }
    }
    purge_mci(cp, ns, mci_id).await?;
    tracing::info!("🗑️ [provisioning] MCI {}/{} deleted", ns, mci_id);
    Ok(())
}

async fn purge_mci(cp: &ControlPlane, ns: &str, mci_id: &str) -> ControlResult<()> {
    let store = cp.store.as_ref();
    for vm_id in repo::list_vm_ids(store, ns, mci_id).await? {
        match repo::load_vm(store, ns, mci_id, &vm_id).await {
            Ok(vm) => crate::catalog::unregister_vm(cp, ns, &vm).await,
            Err(e) => tracing::warn!("⚠️ [provisioning] dropping unreadable VM record {}: {}", vm_id, e),
        }
        repo::delete_vm_record(store, ns, mci_id, &vm_id).await?;
    }
    for sg in repo::list_sub_groups(store, ns, mci_id).await? {
        repo::delete_sub_group(store, ns, mci_id, &sg.id).await?;
    }
    for assignment in repo::list_bastions(store, ns, mci_id).await? {
        repo::delete_bastion(store, ns, mci_id, &assignment.bastion_vm_id).await?;
    }
    repo::delete_policy(store, ns, mci_id).await?;
    repo::delete_mci_record(store, ns, mci_id).await
}

pub async fn get_mci(cp: &ControlPlane, ns: &str, mci_id: &str) -> ControlResult<MciView> {
    let store = cp.store.as_ref();
    let mci = repo::load_mci(store, ns, mci_id).await?;
    let vm = repo::list_vms(store, ns, mci_id).await?;
    let mut sub_groups: Vec<String> = vm.iter().map(|v| v.sub_group_id.clone()).collect();
    sub_groups.sort();
    sub_groups.dedup();
    Ok(MciView {
        mci,
        sub_groups,
        vm,
    })
}

pub async fn list_mcis(cp: &ControlPlane, ns: &str) -> ControlResult<Vec<Mci>> {
    repo::list_mcis(cp.store.as_ref(), ns).await
}

/// Ids of the MCI's VMs whose `field` equals `value`.
pub async fn list_vm_ids_by_filter(
    cp: &ControlPlane,
    ns: &str,
    mci_id: &str,
    field: &str,
    value: &str,
) -> ControlResult<Vec<String>> {
    let field = VmField::parse(field)?;
    let store = cp.store.as_ref();
    repo::load_mci(store, ns, mci_id).await?;
    Ok(repo::list_vms(store, ns, mci_id)
        .await?
        .into_iter()
        .filter(|vm| field.matches(vm, value))
        .map(|vm| vm.id)
        .collect())
}
