//! Lifecycle actions (suspend, resume, reboot, terminate) fanned out over the
//! VMs of an MCI.

use futures_util::future::join_all;
use nimbus_common::{Action, ControlError, ControlResult, Status, Vm};
use nimbus_providers::VmControl;
use tokio::sync::mpsc;

use crate::store::StateStore;
use crate::transition::{self, GuardOutcome, Scope};
use crate::{bastion, catalog, provisioning, repo, status, ControlPlane};

fn provider_control(action: Action) -> Option<VmControl> {
    match action {
        Action::Suspend => Some(VmControl::Suspend),
        Action::Resume => Some(VmControl::Resume),
        Action::Reboot => Some(VmControl::Reboot),
        _ => None,
    }
}

fn busy_error(scope: Scope<'_>, action: Action) -> ControlError {
    ControlError::TransitionDenied(format!(
        "{} is still processing {}; retry later or use force",
        scope, action
    ))
}

/// Apply `action` to every eligible VM of an MCI and wait for all of them.
///
/// Eligible VMs are marked first, then the MCI is marked busy with a
/// version-checked write. Nothing reaches the provider before both. Per-VM
/// failures are written to the VM and returned together as one
/// `PartialFailure`.
pub async fn control_mci(
    cp: &ControlPlane,
    ns: &str,
    mci_id: &str,
    action: Action,
    force: bool,
) -> ControlResult<()> {
    let store = cp.store.as_ref();
    let scope = Scope::Mci(mci_id);

    let mci = repo::load_mci(store, ns, mci_id).await?;
    if mci.is_busy() && !force {
        return Err(busy_error(scope, mci.target_action));
    }
    let (Some(target), Some(interim)) = (action.target_status(), action.interim_status()) else {
        return Err(ControlError::Validation(format!(
            "action '{}' is not a lifecycle action",
            action
        )));
    };

    let current = status::get_mci_status(cp, ns, mci_id).await?;
    let outcome = transition::guard(current.dominant_status, action, scope, force)?;

    let vm_ids = repo::list_vm_ids(store, ns, mci_id).await?;
    if vm_ids.is_empty() {
        return Err(ControlError::Validation(format!(
            "MCI '{}' has no VM, nothing to control",
            mci_id
        )));
    }

    let mut eligible = Vec::with_capacity(vm_ids.len());
    for vm_id in &vm_ids {
        let vm = repo::load_vm(store, ns, mci_id, vm_id).await?;
        let go = match outcome {
            GuardOutcome::Forced => vm.status != target,
            GuardOutcome::Checked => {
                match transition::check_allowed_transition(vm.status, action, Scope::Vm(vm_id)) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::info!("[control] skipping VM {}: {}", vm_id, e);
                        false
                    }
                }
            }
        };
        if go {
            eligible.push(vm);
        }
    }

    // Every dispatched VM carries the action before the MCI turns busy, so a
    // roll-up never sees a busy MCI whose VMs all look idle.
    let mut previous = Vec::with_capacity(eligible.len());
    for vm in &mut eligible {
        previous.push((vm.target_action, vm.target_status, vm.status));
        mark_vm(vm, action, target, interim);
        repo::save_vm(store, ns, vm).await?;
    }
    if let Err(e) = mark_mci_busy(store, ns, mci_id, action, (target, interim), force).await {
        for (vm, (target_action, target_status, status)) in eligible.iter_mut().zip(previous) {
            vm.target_action = target_action;
            vm.target_status = target_status;
            vm.status = status;
            if let Err(undo) = repo::save_vm(store, ns, vm).await {
                tracing::warn!("⚠️ [control] could not unmark VM {}: {}", vm.id, undo);
            }
        }
        return Err(e);
    }
    let eligible: Vec<String> = eligible.into_iter().map(|vm| vm.id).collect();

    tracing::info!(
        "🚀 [control] {} MCI {}/{}: dispatching {} of {} VM(s)",
        action,
        ns,
        mci_id,
        eligible.len(),
        vm_ids.len()
    );

    let (tx, mut rx) = mpsc::channel::<(String, ControlResult<()>)>(eligible.len().max(1));
    let mut handles = Vec::with_capacity(eligible.len());
    for (i, vm_id) in eligible.into_iter().enumerate() {
        if i > 0 && !cp.tuning.control_stagger.is_zero() {
            tokio::time::sleep(cp.tuning.control_stagger).await;
        }
        let cp = cp.clone();
        let tx = tx.clone();
        let ns = ns.to_string();
        let mci_id = mci_id.to_string();
        handles.push(tokio::spawn(async move {
            let res = execute_vm_action(&cp, &ns, &mci_id, &vm_id, action).await;
            let _ = tx.send((vm_id, res)).await;
        }));
    }
    drop(tx);

    for joined in join_all(handles).await {
        if let Err(e) = joined {
            tracing::error!("❌ [control] VM task aborted: {}", e);
        }
    }

    let mut failures = Vec::new();
    while let Some((vm_id, res)) = rx.recv().await {
        if let Err(e) = res {
            failures.push((vm_id, failure_message(e)));
        }
    }
    if failures.is_empty() {
        tracing::info!("✅ [control] {} MCI {}/{} dispatched", action, ns, mci_id);
        return Ok(());
    }
    failures.sort();
    tracing::warn!(
        "⚠️ [control] {} MCI {}/{}: {} VM(s) failed",
        action,
        ns,
        mci_id,
        failures.len()
    );
    Err(ControlError::PartialFailure { failures })
}

fn mark_vm(vm: &mut Vm, action: Action, target: Status, interim: Status) {
    vm.target_action = action;
    vm.target_status = target;
    vm.status = interim;
    vm.system_message.clear();
}

const BUSY_WRITE_ATTEMPTS: usize = 3;

/// Version-checked busy write of the MCI. Concurrent roll-ups only touch the
/// observed status, so a conflict is retried against the fresh record.
async fn mark_mci_busy(
    store: &dyn StateStore,
    ns: &str,
    mci_id: &str,
    action: Action,
    (target, interim): (Status, Status),
    force: bool,
) -> ControlResult<()> {
    for _ in 0..BUSY_WRITE_ATTEMPTS {
        let (mut mci, raw) = repo::load_mci_raw(store, ns, mci_id).await?;
        if mci.is_busy() && !force {
            return Err(busy_error(Scope::Mci(mci_id), mci.target_action));
        }
        mci.target_action = action;
        mci.target_status = target;
        mci.status = interim;
        match repo::save_mci_checked(store, ns, &mut mci, &raw).await {
            Ok(()) => return Ok(()),
            Err(ControlError::Conflict(_)) => {
                tracing::debug!("[control] MCI {} changed before the busy write, retrying", mci_id);
            }
            Err(e) => return Err(e),
        }
    }
    Err(ControlError::Conflict(format!(
        "MCI '{}' kept changing during {}; retry later",
        mci_id, action
    )))
}

/// Apply `action` to one VM; used both by the MCI fan-out and directly.
async fn execute_vm_action(
    cp: &ControlPlane,
    ns: &str,
    mci_id: &str,
    vm_id: &str,
    action: Action,
) -> ControlResult<()> {
    let store = cp.store.as_ref();
    let (Some(target), Some(interim)) = (action.target_status(), action.interim_status()) else {
        return Err(ControlError::Validation(format!(
            "action '{}' is not a lifecycle action",
            action
        )));
    };

    let mut vm = repo::load_vm(store, ns, mci_id, vm_id).await?;
    mark_vm(&mut vm, action, target, interim);
    repo::save_vm(store, ns, &mut vm).await?;

    if vm.csp_id.is_empty() {
        if action == Action::Terminate {
            // Never created on the provider: nothing to delete remotely.
            vm.status = Status::Terminated;
            repo::save_vm(store, ns, &mut vm).await?;
            release_vm(cp, ns, &vm).await;
            return Ok(());
        }
        let msg = format!("VM '{}' has no provider id", vm.id);
        return fail_vm(cp, ns, &mut vm, ControlError::InconsistentRecord(msg)).await;
    }

    let call = match provider_control(action) {
        Some(ctl) => cp.cloud.control_vm(&vm.connection_name, &vm.csp_id, ctl).await,
        None => cp.cloud.terminate_vm(&vm.connection_name, &vm.csp_id).await,
    };
    if let Err(e) = call {
        return fail_vm(cp, ns, &mut vm, ControlError::Transport(e.to_string())).await;
    }

    if action == Action::Terminate {
        release_vm(cp, ns, &vm).await;
    } else {
        status::refresh_access(cp, &mut vm).await;
        repo::save_vm(store, ns, &mut vm).await?;
    }
    tracing::debug!("[control] {} accepted for VM {}", action, vm.id);
    Ok(())
}

/// Provider messages are reported as-is; other errors with their prefix.
fn failure_message(err: ControlError) -> String {
    match err {
        ControlError::Transport(m) => m,
        other => other.to_string(),
    }
}

async fn fail_vm(cp: &ControlPlane, ns: &str, vm: &mut Vm, err: ControlError) -> ControlResult<()> {
    let msg = failure_message(err);
    tracing::warn!("⚠️ [control] {} failed for VM {}: {}", vm.target_action, vm.id, msg);
    vm.status = Status::Failed;
    vm.system_message = msg.clone();
    repo::save_vm(cp.store.as_ref(), ns, vm).await?;
    Err(ControlError::Transport(msg))
}

/// Catalog associations and bastion roles of a terminated VM.
pub(crate) async fn release_vm(cp: &ControlPlane, ns: &str, vm: &Vm) {
    catalog::unregister_vm(cp, ns, vm).await;
    if let Err(e) = bastion::release_roles(cp, ns, &vm.mci_id, &vm.id).await {
        tracing::warn!("⚠️ [control] bastion cleanup for VM {} failed: {}", vm.id, e);
    }
}

/// Apply `action` to a single VM. Refused while the owning MCI or the VM
/// itself is mid-action, unless forced.
pub async fn control_vm(
    cp: &ControlPlane,
    ns: &str,
    mci_id: &str,
    vm_id: &str,
    action: Action,
    force: bool,
) -> ControlResult<String> {
    let store = cp.store.as_ref();
    let mci = repo::load_mci(store, ns, mci_id).await?;
    if mci.is_busy() && !force {
        return Err(busy_error(Scope::Mci(mci_id), mci.target_action));
    }
    let vm = repo::load_vm(store, ns, mci_id, vm_id).await?;
    if vm.is_busy() && !force {
        return Err(busy_error(Scope::Vm(vm_id), vm.target_action));
    }

    let (current, _) = status::fetch_vm_status(cp, ns, mci_id, vm_id).await?;
    transition::guard(current, action, Scope::Vm(vm_id), force)?;

    execute_vm_action(cp, ns, mci_id, vm_id, action).await?;
    let interim = action.interim_status().unwrap_or(Status::Undefined);
    Ok(format!("{} the VM '{}'", interim, vm_id))
}

/// Request-level dispatch of an action name on an MCI.
pub async fn handle_mci_action(
    cp: &ControlPlane,
    ns: &str,
    mci_id: &str,
    action_name: &str,
    force: bool,
) -> ControlResult<String> {
    let action = Action::parse(action_name)
        .filter(|a| *a != Action::Create && *a != Action::Complete)
        .ok_or_else(|| {
            ControlError::Validation(format!(
                "unknown action '{}' (expected suspend, resume, reboot, terminate, refine, continue or withdraw)",
                action_name
            ))
        })?;

    match action {
        Action::Suspend | Action::Resume | Action::Reboot | Action::Terminate => {
            control_mci(cp, ns, mci_id, action, force).await?;
            let interim = action.interim_status().unwrap_or(Status::Undefined);
            Ok(format!("{} the MCI '{}'", interim, mci_id))
        }
        Action::Refine => {
            let removed = provisioning::refine_mci(cp, ns, mci_id).await?;
            Ok(format!(
                "Refined the MCI '{}': removed [{}]",
                mci_id,
                removed.join(", ")
            ))
        }
        Action::Continue | Action::Withdraw => {
            provisioning::resolve_hold(cp, ns, mci_id, action).await?;
            Ok(format!("{} requested for the MCI '{}'", action, mci_id))
        }
        Action::Create | Action::Complete => Err(ControlError::Validation(format!(
            "unknown action '{}'",
            action_name
        ))),
    }
}

/// Request-level dispatch of an action name on a single VM.
pub async fn handle_vm_action(
    cp: &ControlPlane,
    ns: &str,
    mci_id: &str,
    vm_id: &str,
    action_name: &str,
    force: bool,
) -> ControlResult<String> {
    match Action::parse(action_name) {
        Some(action @ (Action::Suspend | Action::Resume | Action::Reboot | Action::Terminate)) => {
            control_vm(cp, ns, mci_id, vm_id, action, force).await
        }
        _ => Err(ControlError::Validation(format!(
            "unknown VM action '{}' (expected suspend, resume, reboot or terminate)",
            action_name
        ))),
    }
}
