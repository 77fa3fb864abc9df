//! Typed load/save helpers over the raw key-value store.
//!
//! Every save bumps the record's `version`. `save_mci_checked` is the only
//! conditional write: it succeeds only if the stored JSON is still the one the
//! caller read.

use nimbus_common::policy::AutoPolicy;
use nimbus_common::{keys, BastionAssignment, ControlError, ControlResult, Mci, SubGroup, Vm};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::StateStore;

pub fn store_err(e: anyhow::Error) -> ControlError {
    ControlError::Store(e.to_string())
}

async fn get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> ControlResult<Option<(T, String)>> {
    let Some(raw) = store.get(key).await.map_err(store_err)? else {
        return Ok(None);
    };
    let value = serde_json::from_str(&raw)?;
    Ok(Some((value, raw)))
}

async fn put_json<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) -> ControlResult<()> {
    let raw = serde_json::to_string(value)?;
    store.put(key, &raw).await.map_err(store_err)
}

async fn list_children<T: DeserializeOwned>(
    store: &dyn StateStore,
    prefix: &str,
) -> ControlResult<Vec<T>> {
    let rows = store.list_by_prefix(prefix).await.map_err(store_err)?;
    let mut out = Vec::new();
    for (key, raw) in rows {
        if keys::is_direct_child(prefix, &key) {
            out.push(serde_json::from_str(&raw)?);
        }
    }
    Ok(out)
}

// --- MCI ---

pub async fn find_mci(store: &dyn StateStore, ns: &str, mci_id: &str) -> ControlResult<Option<Mci>> {
    Ok(get_json(store, &keys::mci(ns, mci_id)).await?.map(|(m, _)| m))
}

pub async fn load_mci(store: &dyn StateStore, ns: &str, mci_id: &str) -> ControlResult<Mci> {
    find_mci(store, ns, mci_id)
        .await?
        .ok_or_else(|| ControlError::not_found("MCI", mci_id))
}

/// The MCI together with the exact JSON it was decoded from (CAS token).
pub async fn load_mci_raw(
    store: &dyn StateStore,
    ns: &str,
    mci_id: &str,
) -> ControlResult<(Mci, String)> {
    get_json(store, &keys::mci(ns, mci_id))
        .await?
        .ok_or_else(|| ControlError::not_found("MCI", mci_id))
}

pub async fn save_mci(store: &dyn StateStore, ns: &str, mci: &mut Mci) -> ControlResult<()> {
    mci.version += 1;
    put_json(store, &keys::mci(ns, &mci.id), mci).await
}

/// Version-checked write: fails with `Conflict` if the record changed since
/// `expected_raw` was read.
pub async fn save_mci_checked(
    store: &dyn StateStore,
    ns: &str,
    mci: &mut Mci,
    expected_raw: &str,
) -> ControlResult<()> {
    mci.version += 1;
    let raw = serde_json::to_string(mci)?;
    let swapped = store
        .compare_and_swap(&keys::mci(ns, &mci.id), Some(expected_raw), &raw)
        .await
        .map_err(store_err)?;
    if swapped {
        Ok(())
    } else {
        mci.version -= 1;
        Err(ControlError::Conflict(format!("MCI '{}'", mci.id)))
    }
}

pub async fn list_mcis(store: &dyn StateStore, ns: &str) -> ControlResult<Vec<Mci>> {
    list_children(store, &keys::mci_prefix(ns)).await
}

pub async fn delete_mci_record(store: &dyn StateStore, ns: &str, mci_id: &str) -> ControlResult<()> {
    store.delete(&keys::mci(ns, mci_id)).await.map_err(store_err)
}

// --- VM ---

pub async fn load_vm(
    store: &dyn StateStore,
    ns: &str,
    mci_id: &str,
    vm_id: &str,
) -> ControlResult<Vm> {
    get_json(store, &keys::vm(ns, mci_id, vm_id))
        .await?
        .map(|(vm, _)| vm)
        .ok_or_else(|| ControlError::not_found("VM", vm_id))
}

pub async fn save_vm(store: &dyn StateStore, ns: &str, vm: &mut Vm) -> ControlResult<()> {
    vm.version += 1;
    put_json(store, &keys::vm(ns, &vm.mci_id, &vm.id), vm).await
}

pub async fn delete_vm_record(
    store: &dyn StateStore,
    ns: &str,
    mci_id: &str,
    vm_id: &str,
) -> ControlResult<()> {
    store
        .delete(&keys::vm(ns, mci_id, vm_id))
        .await
        .map_err(store_err)
}

/// VMs of an MCI, ordered by id.
pub async fn list_vms(store: &dyn StateStore, ns: &str, mci_id: &str) -> ControlResult<Vec<Vm>> {
    list_children(store, &keys::vm_prefix(ns, mci_id)).await
}

pub async fn list_vm_ids(
    store: &dyn StateStore,
    ns: &str,
    mci_id: &str,
) -> ControlResult<Vec<String>> {
    let prefix = keys::vm_prefix(ns, mci_id);
    let rows = store.list_by_prefix(&prefix).await.map_err(store_err)?;
    Ok(rows
        .into_iter()
        .filter(|(key, _)| keys::is_direct_child(&prefix, key))
        .map(|(key, _)| keys::leaf(&key).to_string())
        .collect())
}

// --- Sub-groups ---

pub async fn find_sub_group(
    store: &dyn StateStore,
    ns: &str,
    mci_id: &str,
    sg_id: &str,
) -> ControlResult<Option<SubGroup>> {
    Ok(get_json(store, &keys::sub_group(ns, mci_id, sg_id))
        .await?
        .map(|(sg, _)| sg))
}

pub async fn save_sub_group(store: &dyn StateStore, ns: &str, sg: &SubGroup) -> ControlResult<()> {
    put_json(store, &keys::sub_group(ns, &sg.mci_id, &sg.id), sg).await
}

pub async fn list_sub_groups(
    store: &dyn StateStore,
    ns: &str,
    mci_id: &str,
) -> ControlResult<Vec<SubGroup>> {
    list_children(store, &keys::sub_group_prefix(ns, mci_id)).await
}

pub async fn delete_sub_group(
    store: &dyn StateStore,
    ns: &str,
    mci_id: &str,
    sg_id: &str,
) -> ControlResult<()> {
    store
        .delete(&keys::sub_group(ns, mci_id, sg_id))
        .await
        .map_err(store_err)
}

// --- Bastion assignments ---

pub async fn list_bastions(
    store: &dyn StateStore,
    ns: &str,
    mci_id: &str,
) -> ControlResult<Vec<BastionAssignment>> {
    list_children(store, &keys::bastion_prefix(ns, mci_id)).await
}

pub async fn save_bastion(
    store: &dyn StateStore,
    ns: &str,
    mci_id: &str,
    assignment: &BastionAssignment,
) -> ControlResult<()> {
    put_json(
        store,
        &keys::bastion(ns, mci_id, &assignment.bastion_vm_id),
        assignment,
    )
    .await
}

pub async fn delete_bastion(
    store: &dyn StateStore,
    ns: &str,
    mci_id: &str,
    bastion_vm_id: &str,
) -> ControlResult<()> {
    store
        .delete(&keys::bastion(ns, mci_id, bastion_vm_id))
        .await
        .map_err(store_err)
}

// --- Policies ---

pub async fn find_policy(
    store: &dyn StateStore,
    ns: &str,
    mci_id: &str,
) -> ControlResult<Option<AutoPolicy>> {
    Ok(get_json(store, &keys::policy(ns, mci_id))
        .await?
        .map(|(p, _)| p))
}

pub async fn save_policy(store: &dyn StateStore, policy: &AutoPolicy) -> ControlResult<()> {
    put_json(store, &keys::policy(&policy.namespace, &policy.mci_id), policy).await
}

/// The policy together with the exact JSON it was decoded from (CAS token).
pub async fn load_policy_raw(
    store: &dyn StateStore,
    ns: &str,
    mci_id: &str,
) -> ControlResult<Option<(AutoPolicy, String)>> {
    get_json(store, &keys::policy(ns, mci_id)).await
}

/// Version-checked write of a policy read through `load_policy_raw`. A policy
/// replaced or deleted in between yields `Conflict`. Returns the new token.
pub async fn save_policy_checked(
    store: &dyn StateStore,
    policy: &AutoPolicy,
    expected_raw: &str,
) -> ControlResult<String> {
    let raw = serde_json::to_string(policy)?;
    let swapped = store
        .compare_and_swap(
            &keys::policy(&policy.namespace, &policy.mci_id),
            Some(expected_raw),
            &raw,
        )
        .await
        .map_err(store_err)?;
    if swapped {
        Ok(raw)
    } else {
        Err(ControlError::Conflict(format!("policy of MCI '{}'", policy.mci_id)))
    }
}

pub async fn list_policies(store: &dyn StateStore, ns: &str) -> ControlResult<Vec<AutoPolicy>> {
    list_children(store, &keys::policy_prefix(ns)).await
}

pub async fn delete_policy(store: &dyn StateStore, ns: &str, mci_id: &str) -> ControlResult<()> {
    store
        .delete(&keys::policy(ns, mci_id))
        .await
        .map_err(store_err)
}

/// Namespaces that currently hold at least one AutoPolicy.
pub async fn policy_namespaces(store: &dyn StateStore) -> ControlResult<Vec<String>> {
    let rows = store.list_by_prefix("/ns/").await.map_err(store_err)?;
    let mut out: Vec<String> = rows
        .iter()
        .filter_map(|(key, _)| keys::namespace_of_policy_key(key))
        .map(str::to_string)
        .collect();
    out.dedup();
    Ok(out)
}
