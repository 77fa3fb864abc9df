use nimbus_common::{keys, BastionAssignment, ControlError, ControlResult};

use crate::{repo, ControlPlane};

/// Make `bastion_vm_id` the jump host of `target_vm_ids` (replaces any
/// previous assignment of that bastion).
pub async fn set_bastion(
    cp: &ControlPlane,
    ns: &str,
    mci_id: &str,
    bastion_vm_id: &str,
    target_vm_ids: Vec<String>,
) -> ControlResult<BastionAssignment> {
    let store = cp.store.as_ref();
    repo::load_vm(store, ns, mci_id, bastion_vm_id).await?;
    for target in &target_vm_ids {
        if target == bastion_vm_id {
            return Err(ControlError::Validation(format!(
                "VM '{}' cannot be its own bastion",
                target
            )));
        }
        repo::load_vm(store, ns, mci_id, target).await?;
    }

    let mut targets = target_vm_ids;
    targets.sort();
    targets.dedup();
    let assignment = BastionAssignment {
        bastion_vm_id: bastion_vm_id.to_string(),
        target_vm_ids: targets,
    };
    repo::save_bastion(store, ns, mci_id, &assignment).await?;
    tracing::info!(
        "🛡️ [bastion] {} now fronts {} VM(s) in MCI {}",
        bastion_vm_id,
        assignment.target_vm_ids.len(),
        mci_id
    );
    Ok(assignment)
}

pub async fn list_bastions(cp: &ControlPlane, ns: &str, mci_id: &str) -> ControlResult<Vec<BastionAssignment>> {
    repo::load_mci(cp.store.as_ref(), ns, mci_id).await?;
    repo::list_bastions(cp.store.as_ref(), ns, mci_id).await
}

/// Forget every bastion role of a VM that is going away: its own assignment
/// and its place in other bastions' target lists.
pub async fn release_roles(cp: &ControlPlane, ns: &str, mci_id: &str, vm_id: &str) -> ControlResult<()> {
    let store = cp.store.as_ref();
    if store
        .get(&keys::bastion(ns, mci_id, vm_id))
        .await
        .map_err(repo::store_err)?
        .is_some()
    {
        repo::delete_bastion(store, ns, mci_id, vm_id).await?;
    }
    for mut assignment in repo::list_bastions(store, ns, mci_id).await? {
        let before = assignment.target_vm_ids.len();
        assignment.target_vm_ids.retain(|id| id != vm_id);
        if assignment.target_vm_ids.len() != before {
            repo::save_bastion(store, ns, mci_id, &assignment).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{harness, seed_mci};
    use nimbus_common::Status;

    #[tokio::test]
    async fn releasing_a_vm_clears_both_roles() {
        let h = harness();
        seed_mci(&h, "ns", "m1", &[Status::Running; 3]).await;
        set_bastion(&h.cp, "ns", "m1", "vm-1", vec!["vm-2".into(), "vm-3".into()])
            .await
            .unwrap();
        set_bastion(&h.cp, "ns", "m1", "vm-2", vec!["vm-3".into()])
            .await
            .unwrap();

        release_roles(&h.cp, "ns", "m1", "vm-2").await.unwrap();

        let left = list_bastions(&h.cp, "ns", "m1").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].bastion_vm_id, "vm-1");
        assert_eq!(left[0].target_vm_ids, vec!["vm-3"]);
    }

    #[tokio::test]
    async fn unknown_target_is_rejected() {
        let h = harness();
        seed_mci(&h, "ns", "m1", &[Status::Running]).await;
        let err = set_bastion(&h.cp, "ns", "m1", "vm-1", vec!["ghost".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound { .. }));
    }
}
