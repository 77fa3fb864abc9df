use std::time::Duration;

use nimbus_common::policy::{
    AutoAction, AutoPolicy, Comparator, PlacementAlgo, PolicyStatus, PostCommand, ScaleActionType,
};
use nimbus_common::{Action, ControlError, ControlResult, Status};
use nimbus_providers::CommandTarget;
use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::{control, provisioning, repo, ControlPlane};

/// Label put on VMs created by a scale-out; scale-in only removes these.
pub const AUTO_GEN_LABEL: &str = "autoGen";

/// job-autoscaler: advances every AutoPolicy entry one step per tick.
pub async fn run(cp: ControlPlane, every: Duration) {
    let mut interval = tokio::time::interval(every);
    tracing::info!("📈 job-autoscaler started (every {}s)", every.as_secs());

    loop {
        interval.tick().await;

        match sweep(&cp).await {
            Ok(n) if n > 0 => tracing::debug!("[job-autoscaler] {} policy step(s)", n),
            Ok(_) => {}
            Err(e) => tracing::error!("❌ job-autoscaler error: {}", e),
        }
    }
}

/// One pass over all namespaces. Returns the number of entries visited.
pub async fn sweep(cp: &ControlPlane) -> ControlResult<usize> {
    let store = cp.store.as_ref();
    let mut visited = 0;
    for ns in repo::policy_namespaces(store).await? {
        for policy in repo::list_policies(store, &ns).await? {
            for idx in 0..policy.policy.len() {
                visited += 1;
                match step(cp, &ns, &policy.mci_id, idx).await {
                    Ok(()) => {}
                    Err(ControlError::Conflict(_)) => tracing::info!(
                        "[job-autoscaler] policy {}/{}#{} changed or was deleted mid-step, step dropped",
                        ns,
                        policy.mci_id,
                        idx
                    ),
                    Err(e) => tracing::warn!(
                        "⚠️ [job-autoscaler] policy {}/{}#{} step failed: {}",
                        ns,
                        policy.mci_id,
                        idx,
                        e
                    ),
                }
            }
        }
    }
    Ok(visited)
}

fn set(policy: &mut AutoPolicy, idx: usize, status: PolicyStatus, message: impl Into<String>) {
    let entry = &mut policy.policy[idx];
    if entry.status != status {
        tracing::info!(
            "[job-autoscaler] {}/{}#{}: {} -> {}",
            policy.namespace,
            policy.mci_id,
            idx,
            entry.status.as_str(),
            status.as_str()
        );
    }
    entry.status = status;
    entry.system_message = message.into();
}

/// Advance one entry by one state. The entry is re-read first and every write
/// is checked against that read, so a policy deleted or replaced meanwhile is
/// never written back.
async fn step(cp: &ControlPlane, ns: &str, mci_id: &str, idx: usize) -> ControlResult<()> {
    let store = cp.store.as_ref();
    let Some((mut policy, mut raw)) = repo::load_policy_raw(store, ns, mci_id).await? else {
        return Ok(());
    };
    if idx >= policy.policy.len() {
        return Ok(());
    }

    match policy.policy[idx].status {
        PolicyStatus::Ready => evaluate(cp, &mut policy, idx).await?,
        PolicyStatus::Detected => {
            set(&mut policy, idx, PolicyStatus::Operating, "scaling in progress");
            raw = repo::save_policy_checked(store, &policy, &raw).await?;

            let action = policy.policy[idx].auto_action.clone();
            match execute(cp, ns, mci_id, &action).await {
                Ok(msg) => set(&mut policy, idx, PolicyStatus::Stabilizing, msg),
                Err(e) => set(&mut policy, idx, PolicyStatus::Error, e.to_string()),
            }
        }
        PolicyStatus::Stabilizing => {
            policy.policy[idx].auto_condition.evaluation_value.clear();
            set(&mut policy, idx, PolicyStatus::Ready, "");
        }
        PolicyStatus::Error => set(&mut policy, idx, PolicyStatus::Ready, ""),
        PolicyStatus::Checking
        | PolicyStatus::Operating
        | PolicyStatus::Timeout
        | PolicyStatus::Suspended
        | PolicyStatus::Failed => return Ok(()),
    }
    repo::save_policy_checked(store, &policy, &raw).await?;
    Ok(())
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

async fn evaluate(cp: &ControlPlane, policy: &mut AutoPolicy, idx: usize) -> ControlResult<()> {
    let (ns, mci_id) = (policy.namespace.clone(), policy.mci_id.clone());
    if repo::find_mci(cp.store.as_ref(), &ns, &mci_id).await?.is_none() {
        set(policy, idx, PolicyStatus::Failed, format!("MCI '{}' not found", mci_id));
        return Ok(());
    }

    let cond = policy.policy[idx].auto_condition.clone();
    let cmp = match Comparator::parse(&cond.operator) {
        Ok(cmp) => cmp,
        Err(e) => {
            set(policy, idx, PolicyStatus::Error, e.to_string());
            return Ok(());
        }
    };
    let samples = match cp.metrics.fetch_metric(&ns, &mci_id, &cond.metric).await {
        Ok(samples) if !samples.is_empty() => samples,
        Ok(_) => {
            set(policy, idx, PolicyStatus::Error, format!("no samples for {}", cond.metric));
            return Ok(());
        }
        Err(e) => {
            set(policy, idx, PolicyStatus::Error, format!("metric {}: {}", cond.metric, e));
            return Ok(());
        }
    };

    let period = cond.evaluation_period.max(1);
    let history = &mut policy.policy[idx].auto_condition.evaluation_value;
    history.insert(0, mean(&samples));
    history.truncate(period);
    if history.len() < period {
        let msg = format!("collecting samples {}/{}", history.len(), period);
        set(policy, idx, PolicyStatus::Ready, msg);
        return Ok(());
    }

    let value = mean(history);
    let msg = format!("{} avg {:.2} {} {}", cond.metric, value, cond.operator, cond.operand);
    if cmp.evaluate(value, cond.operand) {
        set(policy, idx, PolicyStatus::Detected, msg);
    } else {
        set(policy, idx, PolicyStatus::Ready, "");
    }
    Ok(())
}

async fn execute(cp: &ControlPlane, ns: &str, mci_id: &str, action: &AutoAction) -> ControlResult<String> {
    match action.action_type {
        ScaleActionType::ScaleOut => scale_out(cp, ns, mci_id, action).await,
        ScaleActionType::ScaleIn => scale_in(cp, ns, mci_id).await,
    }
}

async fn scale_out(cp: &ControlPlane, ns: &str, mci_id: &str, action: &AutoAction) -> ControlResult<String> {
    let mut req = action.vm.clone();
    let token = Uuid::new_v4().simple().to_string();
    req.name = format!("{}-{}", req.name, &token[..6]);
    req.label.insert(AUTO_GEN_LABEL.to_string(), "true".to_string());

    if action.placement_algo == PlacementAlgo::Random {
        let picked = action
            .placement_candidates
            .choose(&mut rand::thread_rng())
            .cloned();
        if let Some(candidate) = picked {
            req.connection_name = candidate.connection_name;
            req.spec_id = candidate.spec_id;
            if let Some(image_id) = candidate.image_id {
                req.image_id = image_id;
            }
        }
    }

    tracing::info!(
        "📈 [job-autoscaler] scaling out MCI {}/{} on {} ({})",
        ns,
        mci_id,
        req.connection_name,
        req.spec_id
    );
    let vm_ids = provisioning::add_vms(cp, ns, mci_id, req).await?;

    let mut msg = format!("scaled out: added {}", vm_ids.join(", "));
    if let Some(post) = &action.post_command {
        let failed = run_post_command(cp, ns, mci_id, &vm_ids, post).await;
        if failed > 0 {
            msg.push_str(&format!(" (post command failed on {} VM(s))", failed));
        }
    }
    Ok(msg)
}

/// Returns the number of VMs on which a command failed.
async fn run_post_command(
    cp: &ControlPlane,
    ns: &str,
    mci_id: &str,
    vm_ids: &[String],
    post: &PostCommand,
) -> usize {
    let user_name = if post.user_name.is_empty() {
        cp.tuning.ssh_user.clone()
    } else {
        post.user_name.clone()
    };
    let mut failed = 0;
    for vm_id in vm_ids {
        let vm = match repo::load_vm(cp.store.as_ref(), ns, mci_id, vm_id).await {
            Ok(vm) => vm,
            Err(e) => {
                tracing::warn!("⚠️ [job-autoscaler] post command skipped on {}: {}", vm_id, e);
                failed += 1;
                continue;
            }
        };
        let target = CommandTarget {
            vm_id: vm.id.clone(),
            host: vm.public_ip.clone(),
            port: if vm.ssh_port.is_empty() {
                "22".to_string()
            } else {
                vm.ssh_port.clone()
            },
            user_name: user_name.clone(),
        };
        for command in &post.command {
            if let Err(e) = cp.commands.run_command(&target, command).await {
                tracing::warn!("⚠️ [job-autoscaler] post command on {} failed: {}", vm_id, e);
                failed += 1;
                break;
            }
        }
    }
    failed
}

async fn scale_in(cp: &ControlPlane, ns: &str, mci_id: &str) -> ControlResult<String> {
    let victim = repo::list_vms(cp.store.as_ref(), ns, mci_id)
        .await?
        .into_iter()
        .filter(|vm| vm.label.get(AUTO_GEN_LABEL).map(|v| v == "true").unwrap_or(false))
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let Some(vm) = victim else {
        tracing::warn!(
            "⚠️ [job-autoscaler] scale-in on MCI {}/{}: no auto-generated VM to remove",
            ns,
            mci_id
        );
        return Ok("no auto-generated VM to remove".to_string());
    };

    if !vm.csp_id.is_empty() && vm.status != Status::Terminated {
        control::control_vm(cp, ns, mci_id, &vm.id, Action::Terminate, true).await?;
    }
    let vm = repo::load_vm(cp.store.as_ref(), ns, mci_id, &vm.id).await?;
    provisioning::purge_vm(cp, ns, &vm).await?;
    tracing::info!("📉 [job-autoscaler] scaled in MCI {}/{}: removed {}", ns, mci_id, vm.id);
    Ok(format!("scaled in: removed {}", vm.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{harness, seed_mci, vm_request, Harness};
    use nimbus_common::policy::{AutoConditionRequest, AutoPolicyRequest, PolicyRequest, SpecCandidate};
    use nimbus_common::Vm;

    fn action(kind: ScaleActionType) -> AutoAction {
        AutoAction {
            action_type: kind,
            vm: vm_request("auto", 1),
            placement_algo: PlacementAlgo::Fixed,
            placement_candidates: vec![],
            post_command: None,
        }
    }

    async fn install(h: &Harness, operator: &str, operand: f64, period: usize, action: AutoAction) {
        crate::policy::create_policy(
            &h.cp,
            "ns",
            "m1",
            AutoPolicyRequest {
                description: String::new(),
                policy: vec![PolicyRequest {
                    auto_condition: AutoConditionRequest {
                        metric: "cpu".into(),
                        operator: operator.into(),
                        operand,
                        evaluation_period: period,
                    },
                    auto_action: action,
                }],
            },
        )
        .await
        .unwrap();
    }

    async fn entry(h: &Harness) -> nimbus_common::policy::Policy {
        crate::policy::get_policy(&h.cp, "ns", "m1")
            .await
            .unwrap()
            .policy
            .remove(0)
    }

    async fn auto_vms(h: &Harness) -> Vec<Vm> {
        repo::list_vms(h.cp.store.as_ref(), "ns", "m1")
            .await
            .unwrap()
            .into_iter()
            .filter(|vm| vm.label.contains_key(AUTO_GEN_LABEL))
            .collect()
    }

    #[tokio::test]
    async fn threshold_breach_scales_out_then_restabilizes() {
        let h = harness();
        seed_mci(&h, "ns", "m1", &[Status::Running]).await;
        install(&h, ">=", 80.0, 1, action(ScaleActionType::ScaleOut)).await;
        h.metrics.push("cpu", vec![80.0, 90.0]);

        assert_eq!(sweep(&h.cp).await.unwrap(), 1);
        let e = entry(&h).await;
        assert_eq!(e.status, PolicyStatus::Detected);
        assert_eq!(e.auto_condition.evaluation_value, vec![85.0]);

        sweep(&h.cp).await.unwrap();
        let e = entry(&h).await;
        assert_eq!(e.status, PolicyStatus::Stabilizing);
        assert!(e.system_message.starts_with("scaled out"));
        let added = auto_vms(&h).await;
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].status, Status::Running);
        assert!(added[0].sub_group_id.starts_with("auto-"));
        assert_eq!(h.cloud.created().len(), 1);

        sweep(&h.cp).await.unwrap();
        let e = entry(&h).await;
        assert_eq!(e.status, PolicyStatus::Ready);
        assert!(e.auto_condition.evaluation_value.is_empty());
    }

    #[tokio::test]
    async fn history_is_bounded_and_below_threshold_stays_ready() {
        let h = harness();
        seed_mci(&h, "ns", "m1", &[Status::Running]).await;
        install(&h, ">=", 80.0, 2, action(ScaleActionType::ScaleOut)).await;
        h.metrics.push("cpu", vec![10.0]);
        h.metrics.push("cpu", vec![20.0]);

        sweep(&h.cp).await.unwrap();
        let e = entry(&h).await;
        assert_eq!(e.status, PolicyStatus::Ready);
        assert_eq!(e.auto_condition.evaluation_value, vec![10.0]);

        for _ in 0..3 {
            sweep(&h.cp).await.unwrap();
        }
        let e = entry(&h).await;
        assert_eq!(e.status, PolicyStatus::Ready);
        assert_eq!(e.auto_condition.evaluation_value, vec![20.0, 20.0]);
        assert!(h.cloud.created().is_empty());
    }

    /// Deletes the MCI's policy while its samples are being fetched.
    struct DeletesPolicy {
        store: std::sync::Arc<dyn crate::store::StateStore>,
    }

    #[async_trait::async_trait]
    impl nimbus_providers::MetricSource for DeletesPolicy {
        async fn fetch_metric(&self, ns: &str, mci_id: &str, _metric: &str) -> anyhow::Result<Vec<f64>> {
            self.store
                .delete(&nimbus_common::keys::policy(ns, mci_id))
                .await?;
            Ok(vec![95.0])
        }
    }

    #[tokio::test]
    async fn policy_deleted_during_a_step_stays_deleted() {
        let mut h = harness();
        seed_mci(&h, "ns", "m1", &[Status::Running]).await;
        install(&h, ">=", 80.0, 1, action(ScaleActionType::ScaleOut)).await;
        h.cp.metrics = std::sync::Arc::new(DeletesPolicy {
            store: h.cp.store.clone(),
        });

        assert_eq!(sweep(&h.cp).await.unwrap(), 1);
        assert!(repo::find_policy(h.cp.store.as_ref(), "ns", "m1")
            .await
            .unwrap()
            .is_none());

        // Nothing left to step on the next pass.
        assert_eq!(sweep(&h.cp).await.unwrap(), 0);
        assert!(h.cloud.created().is_empty());
    }

    #[tokio::test]
    async fn vanished_mci_fails_the_policy() {
        let h = harness();
        seed_mci(&h, "ns", "m1", &[Status::Running]).await;
        install(&h, ">=", 80.0, 1, action(ScaleActionType::ScaleOut)).await;
        repo::delete_mci_record(h.cp.store.as_ref(), "ns", "m1")
            .await
            .unwrap();

        sweep(&h.cp).await.unwrap();
        assert_eq!(entry(&h).await.status, PolicyStatus::Failed);
        sweep(&h.cp).await.unwrap();
        assert_eq!(entry(&h).await.status, PolicyStatus::Failed);
    }

    #[tokio::test]
    async fn metric_error_recovers_through_error_state() {
        let h = harness();
        seed_mci(&h, "ns", "m1", &[Status::Running]).await;
        install(&h, ">=", 80.0, 1, action(ScaleActionType::ScaleOut)).await;
        h.metrics.push_error("cpu", "monitoring unavailable");
        h.metrics.push("cpu", vec![5.0]);

        sweep(&h.cp).await.unwrap();
        let e = entry(&h).await;
        assert_eq!(e.status, PolicyStatus::Error);
        assert!(e.system_message.contains("monitoring unavailable"));

        sweep(&h.cp).await.unwrap();
        assert_eq!(entry(&h).await.status, PolicyStatus::Ready);
        sweep(&h.cp).await.unwrap();
        assert_eq!(entry(&h).await.status, PolicyStatus::Ready);
    }

    #[tokio::test]
    async fn random_placement_and_post_command() {
        let h = harness();
        seed_mci(&h, "ns", "m1", &[Status::Running]).await;
        let mut act = action(ScaleActionType::ScaleOut);
        act.placement_algo = PlacementAlgo::Random;
        act.placement_candidates = vec![SpecCandidate {
            connection_name: "gcp-asia-east1".into(),
            spec_id: "e2-medium".into(),
            image_id: None,
        }];
        act.post_command = Some(PostCommand {
            command: vec!["sudo systemctl start app".into()],
            user_name: String::new(),
        });
        install(&h, ">", 50.0, 1, act).await;
        h.metrics.push("cpu", vec![99.0]);

        sweep(&h.cp).await.unwrap();
        sweep(&h.cp).await.unwrap();
        assert_eq!(entry(&h).await.status, PolicyStatus::Stabilizing);

        let added = auto_vms(&h).await;
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].connection_name, "gcp-asia-east1");
        assert_eq!(added[0].spec_id, "e2-medium");

        let calls = h.commands.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.user_name, "tester");
        assert_eq!(calls[0].0.host, added[0].public_ip);
        assert_eq!(calls[0].1, "sudo systemctl start app");
    }

    #[tokio::test]
    async fn scale_in_removes_newest_auto_generated_vm() {
        let h = harness();
        seed_mci(&h, "ns", "m1", &[Status::Running]).await;
        let mut older = vm_request("old", 1);
        older.label.insert(AUTO_GEN_LABEL.into(), "true".into());
        let mut newer = vm_request("new", 1);
        newer.label.insert(AUTO_GEN_LABEL.into(), "true".into());
        provisioning::add_vms(&h.cp, "ns", "m1", older).await.unwrap();
        provisioning::add_vms(&h.cp, "ns", "m1", newer).await.unwrap();

        let mut old = repo::load_vm(h.cp.store.as_ref(), "ns", "m1", "old-1").await.unwrap();
        old.created_at -= chrono::Duration::hours(1);
        repo::save_vm(h.cp.store.as_ref(), "ns", &mut old).await.unwrap();
        let new_csp = repo::load_vm(h.cp.store.as_ref(), "ns", "m1", "new-1")
            .await
            .unwrap()
            .csp_id;

        install(&h, "<", 30.0, 1, action(ScaleActionType::ScaleIn)).await;
        h.metrics.push("cpu", vec![5.0]);
        sweep(&h.cp).await.unwrap();
        sweep(&h.cp).await.unwrap();
        assert_eq!(entry(&h).await.status, PolicyStatus::Stabilizing);

        let ids = repo::list_vm_ids(h.cp.store.as_ref(), "ns", "m1").await.unwrap();
        assert_eq!(ids, vec!["old-1", "vm-1"]);
        assert_eq!(
            h.cloud.control_calls(),
            vec![(new_csp, "terminate".to_string())]
        );
    }

    #[tokio::test]
    async fn scale_in_without_candidates_still_stabilizes() {
        let h = harness();
        seed_mci(&h, "ns", "m1", &[Status::Running]).await;
        install(&h, "<", 30.0, 1, action(ScaleActionType::ScaleIn)).await;
        h.metrics.push("cpu", vec![5.0]);

        sweep(&h.cp).await.unwrap();
        sweep(&h.cp).await.unwrap();
        let e = entry(&h).await;
        assert_eq!(e.status, PolicyStatus::Stabilizing);
        assert_eq!(e.system_message, "no auto-generated VM to remove");
        assert_eq!(
            repo::list_vm_ids(h.cp.store.as_ref(), "ns", "m1").await.unwrap().len(),
            1
        );
    }
}
