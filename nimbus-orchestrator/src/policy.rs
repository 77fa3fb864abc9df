use nimbus_common::policy::{AutoPolicy, AutoPolicyRequest};
use nimbus_common::{ControlError, ControlResult};

use crate::{repo, ControlPlane};

/// Create or replace the AutoPolicy of an MCI. Every entry starts `Ready`
/// with an empty history.
pub async fn create_policy(
    cp: &ControlPlane,
    ns: &str,
    mci_id: &str,
    req: AutoPolicyRequest,
) -> ControlResult<AutoPolicy> {
    let store = cp.store.as_ref();
    repo::load_mci(store, ns, mci_id).await?;
    if req.policy.is_empty() {
        return Err(ControlError::Validation(
            "an AutoPolicy needs at least one policy entry".to_string(),
        ));
    }
    for entry in &req.policy {
        entry.validate()?;
    }

    let policy = AutoPolicy {
        id: mci_id.to_string(),
        namespace: ns.to_string(),
        mci_id: mci_id.to_string(),
        description: req.description,
        policy: req.policy.into_iter().map(|p| p.into_policy()).collect(),
    };
    repo::save_policy(store, &policy).await?;
    tracing::info!(
        "📋 [policy] AutoPolicy for MCI {}/{} stored ({} entr{})",
        ns,
        mci_id,
        policy.policy.len(),
        if policy.policy.len() == 1 { "y" } else { "ies" }
    );
    Ok(policy)
}

pub async fn get_policy(cp: &ControlPlane, ns: &str, mci_id: &str) -> ControlResult<AutoPolicy> {
    repo::find_policy(cp.store.as_ref(), ns, mci_id)
        .await?
        .ok_or_else(|| ControlError::not_found("AutoPolicy", mci_id))
}

pub async fn list_policies(cp: &ControlPlane, ns: &str) -> ControlResult<Vec<AutoPolicy>> {
    repo::list_policies(cp.store.as_ref(), ns).await
}

pub async fn delete_policy(cp: &ControlPlane, ns: &str, mci_id: &str) -> ControlResult<()> {
    get_policy(cp, ns, mci_id).await?;
    repo::delete_policy(cp.store.as_ref(), ns, mci_id).await
}

/// Returns how many policies were removed.
pub async fn delete_all_policies(cp: &ControlPlane, ns: &str) -> ControlResult<usize> {
    let policies = list_policies(cp, ns).await?;
    for p in &policies {
        repo::delete_policy(cp.store.as_ref(), ns, &p.mci_id).await?;
    }
    Ok(policies.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{harness, seed_mci, vm_request};
    use nimbus_common::policy::{
        AutoAction, AutoConditionRequest, PlacementAlgo, PolicyRequest, PolicyStatus,
        ScaleActionType,
    };
    use nimbus_common::Status;

    fn request(operator: &str) -> AutoPolicyRequest {
        AutoPolicyRequest {
            description: "cpu".into(),
            policy: vec![PolicyRequest {
                auto_condition: AutoConditionRequest {
                    metric: "cpu".into(),
                    operator: operator.into(),
                    operand: 80.0,
                    evaluation_period: 2,
                },
                auto_action: AutoAction {
                    action_type: ScaleActionType::ScaleOut,
                    vm: vm_request("auto", 1),
                    placement_algo: PlacementAlgo::Fixed,
                    placement_candidates: vec![],
                    post_command: None,
                },
            }],
        }
    }

    #[tokio::test]
    async fn crud_round() {
        let h = harness();
        seed_mci(&h, "ns", "m1", &[Status::Running]).await;
        seed_mci(&h, "ns", "m2", &[Status::Running]).await;

        let p = create_policy(&h.cp, "ns", "m1", request(">=")).await.unwrap();
        assert_eq!(p.policy[0].status, PolicyStatus::Ready);
        create_policy(&h.cp, "ns", "m2", request("<")).await.unwrap();

        assert_eq!(get_policy(&h.cp, "ns", "m1").await.unwrap(), p);
        assert_eq!(list_policies(&h.cp, "ns").await.unwrap().len(), 2);

        delete_policy(&h.cp, "ns", "m1").await.unwrap();
        assert!(matches!(
            get_policy(&h.cp, "ns", "m1").await,
            Err(ControlError::NotFound { .. })
        ));
        assert_eq!(delete_all_policies(&h.cp, "ns").await.unwrap(), 1);
        assert!(list_policies(&h.cp, "ns").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_unknown_mci_and_bad_operator() {
        let h = harness();
        assert!(matches!(
            create_policy(&h.cp, "ns", "ghost", request(">=")).await,
            Err(ControlError::NotFound { .. })
        ));
        seed_mci(&h, "ns", "m1", &[Status::Running]).await;
        assert!(matches!(
            create_policy(&h.cp, "ns", "m1", request("~")).await,
            Err(ControlError::Validation(_))
        ));
    }
}
