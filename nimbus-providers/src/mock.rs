//! In-memory cloud adapter, metric source and command runner.
//!
//! Used for local runs (`PROVIDER=mock`) and by the orchestrator tests. VMs
//! behave like an obedient provider: control calls flip the status directly,
//! terminated VMs disappear (status queries then fail, as with most real
//! providers once a VM is gone).

use crate::{
    CloudAdapter, CommandRunner, CommandTarget, CreatedVm, MetricSource, VmAccessInfo, VmControl,
    VmCreateSpec,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct MockVm {
    connection_name: String,
    status: String,
    public_ip: String,
    private_ip: String,
}

#[derive(Default)]
struct MockState {
    vms: HashMap<String, MockVm>,
    next_id: usize,
    create_failures: HashMap<String, String>,
    control_failures: HashMap<String, String>,
    status_failures: HashSet<String>,
    status_calls: Vec<String>,
    control_calls: Vec<(String, String)>,
    created: Vec<String>,
}

#[derive(Default)]
pub struct MockCloudAdapter {
    state: Mutex<MockState>,
    delay: Option<Duration>,
}

impl MockCloudAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` first (exercises concurrent fan-out).
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            delay: Some(delay),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn pause(&self) {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
    }

    /// Register an existing VM.
    pub fn insert_vm(&self, csp_id: &str, connection_name: &str, status: &str, public_ip: &str) {
        self.lock().vms.insert(
            csp_id.to_string(),
            MockVm {
                connection_name: connection_name.to_string(),
                status: status.to_string(),
                public_ip: public_ip.to_string(),
                private_ip: format!("10.0.0.{}", public_ip.rsplit('.').next().unwrap_or("1")),
            },
        );
    }

    pub fn set_status(&self, csp_id: &str, status: &str) {
        if let Some(vm) = self.lock().vms.get_mut(csp_id) {
            vm.status = status.to_string();
        }
    }

    pub fn set_public_ip(&self, csp_id: &str, public_ip: &str) {
        if let Some(vm) = self.lock().vms.get_mut(csp_id) {
            vm.public_ip = public_ip.to_string();
        }
    }

    pub fn status_of(&self, csp_id: &str) -> Option<String> {
        self.lock().vms.get(csp_id).map(|vm| vm.status.clone())
    }

    /// Creating a VM with this name fails with `message`.
    pub fn fail_create(&self, vm_name: &str, message: &str) {
        self.lock()
            .create_failures
            .insert(vm_name.to_string(), message.to_string());
    }

    /// Control and terminate calls on this VM fail with `message`.
    pub fn fail_control(&self, csp_id: &str, message: &str) {
        self.lock()
            .control_failures
            .insert(csp_id.to_string(), message.to_string());
    }

    pub fn fail_status(&self, csp_id: &str) {
        self.lock().status_failures.insert(csp_id.to_string());
    }

    pub fn status_calls(&self) -> Vec<String> {
        self.lock().status_calls.clone()
    }

    /// `(csp_id, action)` for every control or terminate call, in call order.
    pub fn control_calls(&self) -> Vec<(String, String)> {
        self.lock().control_calls.clone()
    }

    /// Names of VMs created through `create_vm`, in call order.
    pub fn created(&self) -> Vec<String> {
        self.lock().created.clone()
    }
}

#[async_trait]
impl CloudAdapter for MockCloudAdapter {
    async fn create_vm(&self, spec: &VmCreateSpec) -> Result<CreatedVm> {
        self.pause().await;
        let mut st = self.lock();
        st.created.push(spec.name.clone());
        if let Some(msg) = st.create_failures.get(&spec.name) {
            return Err(anyhow::anyhow!("{}", msg));
        }
        st.next_id += 1;
        let n = st.next_id;
        let csp_id = format!("mock-{}", n);
        let vm = MockVm {
            connection_name: spec.connection_name.clone(),
            status: "Running".to_string(),
            public_ip: format!("203.0.113.{}", n),
            private_ip: format!("10.0.0.{}", n),
        };
        let access = VmAccessInfo {
            status: vm.status.clone(),
            public_ip: vm.public_ip.clone(),
            public_dns: String::new(),
            private_ip: vm.private_ip.clone(),
            private_dns: String::new(),
            ssh_access_point: format!("{}:22", vm.public_ip),
        };
        st.vms.insert(csp_id.clone(), vm);
        Ok(CreatedVm { csp_id, access })
    }

    async fn vm_status(&self, connection_name: &str, csp_id: &str) -> Result<String> {
        self.pause().await;
        let mut st = self.lock();
        st.status_calls.push(csp_id.to_string());
        if st.status_failures.contains(csp_id) {
            return Err(anyhow::anyhow!("connection to {} timed out", connection_name));
        }
        match st.vms.get(csp_id) {
            Some(vm) if vm.connection_name == connection_name => Ok(vm.status.clone()),
            Some(vm) => Err(anyhow::anyhow!(
                "vm {} belongs to connection {}, not {}",
                csp_id,
                vm.connection_name,
                connection_name
            )),
            None => Err(anyhow::anyhow!("vm {} not found", csp_id)),
        }
    }

    async fn control_vm(
        &self,
        _connection_name: &str,
        csp_id: &str,
        action: VmControl,
    ) -> Result<()> {
        self.pause().await;
        let mut st = self.lock();
        st.control_calls
            .push((csp_id.to_string(), action.as_query().to_string()));
        if let Some(msg) = st.control_failures.get(csp_id) {
            return Err(anyhow::anyhow!("{}", msg));
        }
        let vm = st
            .vms
            .get_mut(csp_id)
            .ok_or_else(|| anyhow::anyhow!("vm {} not found", csp_id))?;
        vm.status = match action {
            VmControl::Suspend => "Suspended",
            VmControl::Resume | VmControl::Reboot => "Running",
        }
        .to_string();
        Ok(())
    }

    async fn terminate_vm(&self, _connection_name: &str, csp_id: &str) -> Result<()> {
        self.pause().await;
        let mut st = self.lock();
        st.control_calls
            .push((csp_id.to_string(), "terminate".to_string()));
        if let Some(msg) = st.control_failures.get(csp_id) {
            return Err(anyhow::anyhow!("{}", msg));
        }
        st.vms
            .remove(csp_id)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("vm {} not found", csp_id))
    }

    async fn vm_access_info(&self, _connection_name: &str, csp_id: &str) -> Result<VmAccessInfo> {
        self.pause().await;
        let st = self.lock();
        let vm = st
            .vms
            .get(csp_id)
            .ok_or_else(|| anyhow::anyhow!("vm {} not found", csp_id))?;
        Ok(VmAccessInfo {
            status: vm.status.clone(),
            public_ip: vm.public_ip.clone(),
            public_dns: String::new(),
            private_ip: vm.private_ip.clone(),
            private_dns: String::new(),
            ssh_access_point: format!("{}:22", vm.public_ip),
        })
    }
}

/// Metric source fed from a queue of prepared responses per metric name.
#[derive(Default)]
pub struct MockMetricSource {
    series: Mutex<HashMap<String, VecDeque<Result<Vec<f64>, String>>>>,
}

impl MockMetricSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next response for `metric`. When the queue holds a single
    /// entry it is repeated forever.
    pub fn push(&self, metric: &str, samples: Vec<f64>) {
        self.series
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(metric.to_string())
            .or_default()
            .push_back(Ok(samples));
    }

    pub fn push_error(&self, metric: &str, message: &str) {
        self.series
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(metric.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
    }
}

#[async_trait]
impl MetricSource for MockMetricSource {
    async fn fetch_metric(&self, _ns: &str, _mci_id: &str, metric: &str) -> Result<Vec<f64>> {
        let mut series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        let queue = series
            .get_mut(metric)
            .ok_or_else(|| anyhow::anyhow!("no series for metric {}", metric))?;
        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match next {
            Some(Ok(v)) => Ok(v),
            Some(Err(msg)) => Err(anyhow::anyhow!("{}", msg)),
            None => Err(anyhow::anyhow!("no series for metric {}", metric)),
        }
    }
}

/// Records commands instead of running them.
#[derive(Default)]
pub struct RecordingCommandRunner {
    calls: Mutex<Vec<(CommandTarget, String)>>,
    fail_with: Option<String>,
}

impl RecordingCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_with: Some(message.to_string()),
        }
    }

    pub fn calls(&self) -> Vec<(CommandTarget, String)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingCommandRunner {
    async fn run_command(&self, target: &CommandTarget, command: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((target.clone(), command.to_string()));
        match &self.fail_with {
            Some(msg) => Err(anyhow::anyhow!("{}", msg)),
            None => Ok(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_flips_status_and_terminate_removes() {
        let mock = MockCloudAdapter::new();
        mock.insert_vm("i-1", "aws", "Running", "1.1.1.1");

        mock.control_vm("aws", "i-1", VmControl::Suspend).await.unwrap();
        assert_eq!(mock.vm_status("aws", "i-1").await.unwrap(), "Suspended");

        mock.terminate_vm("aws", "i-1").await.unwrap();
        assert!(mock.vm_status("aws", "i-1").await.is_err());
        assert_eq!(mock.control_calls().len(), 2);
    }

    #[tokio::test]
    async fn metric_queue_repeats_last_entry() {
        let src = MockMetricSource::new();
        src.push("cpu", vec![10.0]);
        src.push("cpu", vec![90.0]);
        assert_eq!(src.fetch_metric("ns", "m", "cpu").await.unwrap(), vec![10.0]);
        assert_eq!(src.fetch_metric("ns", "m", "cpu").await.unwrap(), vec![90.0]);
        assert_eq!(src.fetch_metric("ns", "m", "cpu").await.unwrap(), vec![90.0]);
        assert!(src.fetch_metric("ns", "m", "mem").await.is_err());
    }
}
