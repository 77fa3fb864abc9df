//! Live status: per-VM reconciliation against the provider and the MCI roll-up.

use futures_util::future::join_all;
use nimbus_common::{
    Action, ControlError, ControlResult, Mci, MciStatusInfo, Status, StatusCount, Vm,
    VmStatusInfo,
};
use nimbus_providers::VmAccessInfo;

use crate::{repo, ControlPlane};

/// Copy addresses reported by the provider onto the record.
pub(crate) fn apply_access(vm: &mut Vm, access: &VmAccessInfo) {
    vm.public_ip = access.public_ip.clone();
    vm.public_dns = access.public_dns.clone();
    vm.private_ip = access.private_ip.clone();
    vm.private_dns = access.private_dns.clone();
    vm.ssh_port = access.ssh_port();
}

/// Refresh addresses from the provider; failures are logged only.
pub(crate) async fn refresh_access(cp: &ControlPlane, vm: &mut Vm) {
    match cp.cloud.vm_access_info(&vm.connection_name, &vm.csp_id).await {
        Ok(access) => apply_access(vm, &access),
        Err(e) => tracing::warn!(
            "⚠️ [status] could not refresh access info of VM {} ({}): {}",
            vm.id,
            vm.csp_id,
            e
        ),
    }
}

/// Raw provider status, retried once after a short pause. Gives up with
/// `Undefined`.
async fn poll_native_status(cp: &ControlPlane, vm: &Vm) -> String {
    match cp.cloud.vm_status(&vm.connection_name, &vm.csp_id).await {
        Ok(raw) => return raw,
        Err(e) => tracing::debug!(
            "[status] status poll of VM {} failed, retrying: {}",
            vm.id,
            e
        ),
    }
    tokio::time::sleep(cp.tuning.status_retry_delay).await;
    match cp.cloud.vm_status(&vm.connection_name, &vm.csp_id).await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(
                "⚠️ [status] status poll of VM {} failed twice, reporting Undefined: {}",
                vm.id,
                e
            );
            Status::Undefined.as_str().to_string()
        }
    }
}

/// Correct a native status using what the VM was asked to do. Providers report
/// a VM that is gone, or one that does not exist yet, the same way.
pub fn disambiguate(vm: &Vm, native: Status) -> Status {
    if vm.status == Status::Terminated {
        return Status::Terminated;
    }
    match (vm.target_action, native) {
        (Action::Create, Status::Undefined) if vm.status == Status::Failed => Status::Failed,
        (Action::Create, Status::Undefined) => Status::Creating,
        (Action::Terminate, Status::Undefined) => Status::Terminated,
        (Action::Terminate, Status::Suspending) => Status::Terminating,
        (Action::Resume, Status::Undefined | Status::Creating) => Status::Resuming,
        (
            Action::Reboot,
            Status::Undefined
            | Status::Suspending
            | Status::Suspended
            | Status::Creating
            | Status::Resuming,
        ) => Status::Rebooting,
        (_, native) => native,
    }
}

/// Reconcile one VM with its provider and persist the outcome.
pub async fn fetch_vm_status(
    cp: &ControlPlane,
    ns: &str,
    mci_id: &str,
    vm_id: &str,
) -> ControlResult<(Status, VmStatusInfo)> {
    let store = cp.store.as_ref();
    let mut vm = repo::load_vm(store, ns, mci_id, vm_id).await?;

    let no_native_id = vm.csp_id.is_empty();
    if no_native_id && !matches!(vm.target_action, Action::Create | Action::Terminate) {
        return Err(ControlError::InconsistentRecord(format!(
            "VM '{}' has no provider id but target action is {}",
            vm.id, vm.target_action
        )));
    }

    let raw = if vm.status == Status::Terminated || no_native_id {
        Status::Undefined.as_str().to_string()
    } else {
        poll_native_status(cp, &vm).await
    };
    let corrected = disambiguate(&vm, Status::from_native(&raw));

    if corrected == vm.target_status {
        if corrected == Status::Terminated {
            tracing::debug!("[status] VM {} is terminated", vm.id);
        } else {
            vm.target_action = Action::Complete;
            vm.target_status = Status::Complete;
            refresh_access(cp, &mut vm).await;
        }
    }
    vm.status = corrected;

    if !no_native_id {
        repo::save_vm(store, ns, &mut vm).await?;
    }
    Ok((corrected, vm.status_info()))
}

/// Plurality status, whether it is partial, and the display label.
///
/// Any failed VM makes the label report `Failed` with the failed count.
pub fn summarize(count: &StatusCount) -> (Status, bool, String) {
    let total = count.count_total;
    let running = count.count_running;

    let (dominant, n) = if count.count_failed > 0 {
        (Status::Failed, count.count_failed)
    } else {
        let mut best = (Status::Undefined, 0usize);
        for st in Status::OBSERVED {
            if count.get(st) > best.1 {
                best = (st, count.get(st));
            }
        }
        best
    };

    let partial = n < total;
    let label = format!(
        "{}{}:{} (R:{}/{})",
        if partial { "Partial-" } else { "" },
        dominant,
        n,
        running,
        total
    );
    (dominant, partial, label)
}

/// Whether the MCI's pending action is over. Every VM must be idle and, while
/// the MCI itself is busy, at least one VM must have reached the MCI target
/// (or none is left that could).
fn settles(mci: &Mci, vms: &[VmStatusInfo]) -> bool {
    let idle = vms
        .iter()
        .all(|vm| vm.target_action == Action::Complete || vm.status == Status::Terminated);
    if !idle || !mci.is_busy() {
        return idle;
    }
    vms.iter().any(|vm| vm.status == mci.target_status)
        || vms
            .iter()
            .all(|vm| matches!(vm.status, Status::Terminated | Status::Failed))
}

/// Reconcile every VM concurrently and roll the results up.
pub async fn get_mci_status(cp: &ControlPlane, ns: &str, mci_id: &str) -> ControlResult<MciStatusInfo> {
    let store = cp.store.as_ref();
    let (mut mci, raw) = repo::load_mci_raw(store, ns, mci_id).await?;
    let vm_ids = repo::list_vm_ids(store, ns, mci_id).await?;

    let handles = vm_ids.iter().map(|vm_id| {
        let cp = cp.clone();
        let (ns, mci_id, vm_id) = (ns.to_string(), mci_id.to_string(), vm_id.clone());
        tokio::spawn(async move {
            match fetch_vm_status(&cp, &ns, &mci_id, &vm_id).await {
                Ok((_, info)) => info,
                Err(e) => degraded(&cp, &ns, &mci_id, &vm_id, &e).await,
            }
        })
    });
    let mut vms: Vec<VmStatusInfo> = Vec::with_capacity(vm_ids.len());
    for (vm_id, joined) in vm_ids.iter().zip(join_all(handles).await) {
        match joined {
            Ok(info) => vms.push(info),
            Err(e) => {
                let err = ControlError::Store(format!("status task aborted: {}", e));
                vms.push(degraded(cp, ns, mci_id, vm_id, &err).await);
            }
        }
    }
    vms.sort_by(|a, b| a.id.cmp(&b.id));

    let mut count = StatusCount::default();
    for vm in &vms {
        count.add(vm.status);
    }
    let (dominant, partial, label) = summarize(&count);

    let master = vms.iter().find(|vm| vm.status == Status::Running);

    if settles(&mci, &vms) {
        mci.target_action = Action::Complete;
        mci.target_status = Status::Complete;
    }
    mci.status = dominant;
    // Losing this race only delays the roll-up to the next query.
    match repo::save_mci_checked(store, ns, &mut mci, &raw).await {
        Ok(()) => {}
        Err(ControlError::Conflict(_)) => {
            tracing::debug!("[status] MCI {} changed during roll-up, not persisted", mci_id);
            mci = repo::load_mci(store, ns, mci_id).await?;
        }
        Err(e) => return Err(e),
    }

    Ok(MciStatusInfo {
        id: mci.id.clone(),
        name: mci.name.clone(),
        status: label,
        dominant_status: dominant,
        partial,
        status_count: count,
        target_status: mci.target_status,
        target_action: mci.target_action,
        master_vm_id: master.map(|vm| vm.id.clone()).unwrap_or_default(),
        master_ip: master.map(|vm| vm.public_ip.clone()).unwrap_or_default(),
        master_ssh_port: master.map(|vm| vm.ssh_port.clone()).unwrap_or_default(),
        vm: vms,
    })
}

/// Status entry for a VM whose reconciliation failed.
async fn degraded(
    cp: &ControlPlane,
    ns: &str,
    mci_id: &str,
    vm_id: &str,
    err: &ControlError,
) -> VmStatusInfo {
    tracing::warn!("⚠️ [status] VM {} reported as Failed: {}", vm_id, err);
    match repo::load_vm(cp.store.as_ref(), ns, mci_id, vm_id).await {
        Ok(vm) => VmStatusInfo {
            status: Status::Failed,
            system_message: err.to_string(),
            ..vm.status_info()
        },
        Err(_) => VmStatusInfo {
            id: vm_id.to_string(),
            name: vm_id.to_string(),
            sub_group_id: String::new(),
            connection_name: String::new(),
            csp_id: String::new(),
            status: Status::Failed,
            target_status: Status::Complete,
            target_action: Action::Complete,
            public_ip: String::new(),
            private_ip: String::new(),
            ssh_port: String::new(),
            system_message: err.to_string(),
            created_at: chrono::Utc::now(),
        },
    }
}
