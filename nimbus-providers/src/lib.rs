use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod monitoring;
pub mod spider;
pub mod ssh;

#[cfg(feature = "mock")]
pub mod mock;

/// Client side of the cloud-abstraction service. Every VM lives behind one
/// named connection (provider + region credentials) and is addressed by its
/// provider-native id.
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    /// Create one VM. Long-running: bounded by the create timeout.
    async fn create_vm(&self, spec: &VmCreateSpec) -> Result<CreatedVm>;

    /// Raw provider status string (e.g. "Running", "Suspending").
    async fn vm_status(&self, connection_name: &str, csp_id: &str) -> Result<String>;

    async fn control_vm(&self, connection_name: &str, csp_id: &str, action: VmControl)
        -> Result<()>;

    async fn terminate_vm(&self, connection_name: &str, csp_id: &str) -> Result<()>;

    /// Current addresses and access point of a VM.
    async fn vm_access_info(&self, connection_name: &str, csp_id: &str) -> Result<VmAccessInfo>;
}

/// Non-destructive control actions (terminate is a DELETE of its own).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmControl {
    Suspend,
    Resume,
    Reboot,
}

impl VmControl {
    pub fn as_query(&self) -> &'static str {
        match self {
            VmControl::Suspend => "suspend",
            VmControl::Resume => "resume",
            VmControl::Reboot => "reboot",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmAccessInfo {
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "PublicIP", default)]
    pub public_ip: String,
    #[serde(rename = "PublicDNS", default)]
    pub public_dns: String,
    #[serde(rename = "PrivateIP", default)]
    pub private_ip: String,
    #[serde(rename = "PrivateDNS", default)]
    pub private_dns: String,
    /// `host:port`, port optional.
    #[serde(rename = "SSHAccessPoint", default)]
    pub ssh_access_point: String,
}

impl VmAccessInfo {
    /// SSH port from the access point, defaulting to 22.
    pub fn ssh_port(&self) -> String {
        self.ssh_access_point
            .rsplit_once(':')
            .map(|(_, port)| port.trim())
            .filter(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or("22")
            .to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmCreateSpec {
    pub connection_name: String,
    pub name: String,
    pub image_name: String,
    pub spec_name: String,
    pub vpc_name: String,
    pub subnet_name: String,
    pub security_group_names: Vec<String>,
    pub key_pair_name: String,
    pub data_disk_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreatedVm {
    pub csp_id: String,
    pub access: VmAccessInfo,
}

/// Source of monitoring time series for autoscaling conditions.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Recent samples of `metric` across the MCI, oldest first.
    async fn fetch_metric(&self, ns: &str, mci_id: &str, metric: &str) -> Result<Vec<f64>>;
}

/// Where a remote command is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTarget {
    pub vm_id: String,
    pub host: String,
    pub port: String,
    pub user_name: String,
}

/// Runs a shell command on a VM (post-creation hooks).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_command(&self, target: &CommandTarget, command: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_port_parsing() {
        let mut info = VmAccessInfo {
            ssh_access_point: "3.38.1.2:2222".into(),
            ..Default::default()
        };
        assert_eq!(info.ssh_port(), "2222");
        info.ssh_access_point = "3.38.1.2".into();
        assert_eq!(info.ssh_port(), "22");
        info.ssh_access_point = String::new();
        assert_eq!(info.ssh_port(), "22");
    }

    #[test]
    fn access_info_wire_names() {
        let raw = r#"{"Status":"Running","PublicIP":"1.2.3.4","PrivateIP":"10.0.0.4","SSHAccessPoint":"1.2.3.4:22"}"#;
        let info: VmAccessInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.public_ip, "1.2.3.4");
        assert_eq!(info.private_ip, "10.0.0.4");
        assert_eq!(info.public_dns, "");
    }
}
