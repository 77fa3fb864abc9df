//! Back-references from catalog resources (images, specs, keys, networks,
//! security groups, disks) to the VMs using them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nimbus_common::resource::{references_of, AssociationOp, ResourceKind};
use nimbus_common::{keys, ControlError, ControlResult, Vm};
use serde_json::Value;

use crate::repo::store_err;
use crate::ControlPlane;

const ASSOCIATED_OBJECT_LIST: &str = "associatedObjectList";

/// One async mutex per catalog key; updates of the same resource never
/// interleave within this process.
#[derive(Clone, Default)]
pub struct ResourceLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ResourceLocks {
    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string()).or_default().clone()
    }

    /// Drop the entry once no other caller holds or waits on it. `lock` is the
    /// caller's own handle, so the map plus that handle make two references.
    fn release(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&lock) == 2 {
            map.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Add or remove `vm_key` in the resource's association list, leaving every
/// other field of the stored record as it was. A missing resource is skipped.
pub async fn update_associated_objects(
    cp: &ControlPlane,
    ns: &str,
    kind: ResourceKind,
    resource_id: &str,
    op: AssociationOp,
    vm_key: &str,
) -> ControlResult<()> {
    let key = keys::resource(ns, kind.as_str(), resource_id);
    let lock = cp.resource_locks.lock_for(&key);
    let result = {
        let _guard = lock.lock().await;
        update_locked(cp, &key, op, vm_key).await
    };
    cp.resource_locks.release(&key, lock);
    result
}

async fn update_locked(
    cp: &ControlPlane,
    key: &str,
    op: AssociationOp,
    vm_key: &str,
) -> ControlResult<()> {
    let Some(raw) = cp.store.get(key).await.map_err(store_err)? else {
        tracing::debug!("[catalog] {} not registered, association skipped", key);
        return Ok(());
    };
    let mut doc: Value = serde_json::from_str(&raw)?;
    let Some(obj) = doc.as_object_mut() else {
        return Err(ControlError::InconsistentRecord(format!(
            "{} is not a JSON object",
            key
        )));
    };

    let mut list: Vec<String> = obj
        .get(ASSOCIATED_OBJECT_LIST)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    match op {
        AssociationOp::Add => {
            if list.iter().any(|k| k == vm_key) {
                return Ok(());
            }
            list.push(vm_key.to_string());
        }
        AssociationOp::Remove => {
            let before = list.len();
            list.retain(|k| k != vm_key);
            if list.len() == before {
                return Ok(());
            }
        }
    }
    obj.insert(ASSOCIATED_OBJECT_LIST.to_string(), Value::from(list));

    cp.store
        .put(key, &doc.to_string())
        .await
        .map_err(store_err)
}

async fn update_all(cp: &ControlPlane, ns: &str, vm: &Vm, op: AssociationOp) {
    let vm_key = keys::vm(ns, &vm.mci_id, &vm.id);
    for (kind, id) in references_of(vm) {
        if let Err(e) = update_associated_objects(cp, ns, kind, &id, op, &vm_key).await {
            tracing::warn!(
                "⚠️ [catalog] could not update {} '{}' for VM {}: {}",
                kind.as_str(),
                id,
                vm.id,
                e
            );
        }
    }
}

/// Record `vm` against every catalog resource it references.
pub async fn register_vm(cp: &ControlPlane, ns: &str, vm: &Vm) {
    update_all(cp, ns, vm, AssociationOp::Add).await;
}

/// Drop `vm` from every catalog resource it references.
pub async fn unregister_vm(cp: &ControlPlane, ns: &str, vm: &Vm) {
    update_all(cp, ns, vm, AssociationOp::Remove).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{harness, vm_request};
    use serde_json::json;

    #[tokio::test]
    async fn add_and_remove_preserve_other_fields() {
        let h = harness();
        let key = keys::resource("ns", "image", "ubuntu22");
        h.cp
            .store
            .put(&key, &json!({"id": "ubuntu22", "guestOS": "Ubuntu"}).to_string())
            .await
            .unwrap();

        let vm_key = "/ns/ns/mci/m1/vm/web-1";
        for _ in 0..2 {
            update_associated_objects(&h.cp, "ns", ResourceKind::Image, "ubuntu22", AssociationOp::Add, vm_key)
                .await
                .unwrap();
        }
        let doc: Value = serde_json::from_str(&h.cp.store.get(&key).await.unwrap().unwrap()).unwrap();
        assert_eq!(doc["guestOS"], "Ubuntu");
        assert_eq!(doc["associatedObjectList"], json!([vm_key]));

        update_associated_objects(&h.cp, "ns", ResourceKind::Image, "ubuntu22", AssociationOp::Remove, vm_key)
            .await
            .unwrap();
        let doc: Value = serde_json::from_str(&h.cp.store.get(&key).await.unwrap().unwrap()).unwrap();
        assert_eq!(doc["associatedObjectList"], json!([]));
        assert_eq!(doc["id"], "ubuntu22");
    }

    #[tokio::test]
    async fn missing_resource_is_skipped() {
        let h = harness();
        update_associated_objects(&h.cp, "ns", ResourceKind::Spec, "nope", AssociationOp::Add, "/k")
            .await
            .unwrap();
        assert!(h.cp.store.get(&keys::resource("ns", "spec", "nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_registrations_are_not_lost() {
        let h = harness();
        let key = keys::resource("ns", "spec", "t3-small");
        h.cp.store.put(&key, "{}").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let cp = h.cp.clone();
            handles.push(tokio::spawn(async move {
                let vm = Vm::from_request("m1", &format!("vm-{}", i), "vm", &vm_request("vm", 1));
                register_vm(&cp, "ns", &vm).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let doc: Value = serde_json::from_str(&h.cp.store.get(&key).await.unwrap().unwrap()).unwrap();
        assert_eq!(doc["associatedObjectList"].as_array().unwrap().len(), 16);
        assert_eq!(h.cp.resource_locks.len(), 0);
    }

    #[tokio::test]
    async fn lock_entries_do_not_outlive_their_updates() {
        let h = harness();
        for id in ["a", "b", "c"] {
            let key = keys::resource("ns", "image", id);
            h.cp.store.put(&key, "{}").await.unwrap();
            update_associated_objects(&h.cp, "ns", ResourceKind::Image, id, AssociationOp::Add, "/k")
                .await
                .unwrap();
        }
        update_associated_objects(&h.cp, "ns", ResourceKind::DataDisk, "gone", AssociationOp::Remove, "/k")
            .await
            .unwrap();
        assert_eq!(h.cp.resource_locks.len(), 0);

        // A waiter keeps the entry alive until it is done too.
        let key = keys::resource("ns", "image", "a");
        let held = h.cp.resource_locks.lock_for(&key);
        let guard = held.lock().await;
        let cp = h.cp.clone();
        let waiter = tokio::spawn(async move {
            update_associated_objects(&cp, "ns", ResourceKind::Image, "a", AssociationOp::Remove, "/k").await
        });
        tokio::task::yield_now().await;
        assert_eq!(h.cp.resource_locks.len(), 1);
        drop(guard);
        h.cp.resource_locks.release(&key, held);
        waiter.await.unwrap().unwrap();
        assert_eq!(h.cp.resource_locks.len(), 0);
    }
}
