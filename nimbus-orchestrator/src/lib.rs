use std::sync::Arc;
use std::time::Duration;

use nimbus_providers::{CloudAdapter, CommandRunner, MetricSource};

pub mod autoscaler_job;
pub mod bastion;
pub mod catalog;
pub mod config;
pub mod control;
pub mod policy;
pub mod provisioning;
pub mod repo;
pub mod routes;
pub mod status;
pub mod store;
pub mod transition;

use store::StateStore;

/// Timing knobs of the fan-out and polling paths.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Pause between two per-VM task spawns.
    pub control_stagger: Duration,
    /// Wait before the single retry of a failed status poll.
    pub status_retry_delay: Duration,
    /// How often a held MCI checks for `continue` / `withdraw`.
    pub hold_poll: Duration,
    /// Fallback SSH user for post-creation commands.
    pub ssh_user: String,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            control_stagger: Duration::from_millis(100),
            status_retry_delay: Duration::from_secs(2),
            hold_poll: Duration::from_secs(5),
            ssh_user: "cb-user".to_string(),
        }
    }
}

/// Everything an operation needs: the store, the external collaborators and
/// the process-wide lock map. Cheap to clone; spawned tasks take a clone.
#[derive(Clone)]
pub struct ControlPlane {
    pub store: Arc<dyn StateStore>,
    pub cloud: Arc<dyn CloudAdapter>,
    pub metrics: Arc<dyn MetricSource>,
    pub commands: Arc<dyn CommandRunner>,
    pub tuning: Tuning,
    pub(crate) resource_locks: catalog::ResourceLocks,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn StateStore>,
        cloud: Arc<dyn CloudAdapter>,
        metrics: Arc<dyn MetricSource>,
        commands: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            store,
            cloud,
            metrics,
            commands,
            tuning: Tuning::default(),
            resource_locks: catalog::ResourceLocks::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }
}
