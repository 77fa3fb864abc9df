use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod error;
pub mod filter;
pub mod keys;
pub mod policy;
pub mod resource;

pub use error::{ControlError, ControlResult};

// --- Enums ---

/// Lifecycle status shared by MCIs and VMs.
///
/// `Complete` is never observed on a live resource; it only appears as a
/// `target_status` meaning "no transition intended".
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Status {
    Creating,
    Running,
    Suspending,
    Suspended,
    Resuming,
    Rebooting,
    Terminating,
    Terminated,
    Failed,
    Undefined,
    Complete,
}

impl Status {
    /// Statuses a VM can actually be in, in declaration order (used for
    /// histograms and plurality tie-breaks).
    pub const OBSERVED: [Status; 10] = [
        Status::Creating,
        Status::Running,
        Status::Suspending,
        Status::Suspended,
        Status::Resuming,
        Status::Rebooting,
        Status::Terminating,
        Status::Terminated,
        Status::Failed,
        Status::Undefined,
    ];

    /// The values a cloud adapter may legitimately report.
    pub const NATIVE: [Status; 8] = [
        Status::Creating,
        Status::Running,
        Status::Suspending,
        Status::Suspended,
        Status::Resuming,
        Status::Rebooting,
        Status::Terminating,
        Status::Terminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Creating => "Creating",
            Status::Running => "Running",
            Status::Suspending => "Suspending",
            Status::Suspended => "Suspended",
            Status::Resuming => "Resuming",
            Status::Rebooting => "Rebooting",
            Status::Terminating => "Terminating",
            Status::Terminated => "Terminated",
            Status::Failed => "Failed",
            Status::Undefined => "Undefined",
            Status::Complete => "Complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Status::OBSERVED
            .iter()
            .chain(std::iter::once(&Status::Complete))
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .copied()
    }

    /// Classify a raw provider status. Anything outside the native set is `Undefined`.
    pub fn from_native(raw: &str) -> Self {
        let raw = raw.trim();
        Status::NATIVE
            .iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(raw))
            .copied()
            .unwrap_or(Status::Undefined)
    }

    /// Mid-transition statuses; nothing may be issued against them.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Status::Creating
                | Status::Suspending
                | Status::Resuming
                | Status::Rebooting
                | Status::Terminating
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Suspend,
    Resume,
    Reboot,
    Terminate,
    Refine,
    Continue,
    Withdraw,
    Complete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "Create",
            Action::Suspend => "Suspend",
            Action::Resume => "Resume",
            Action::Reboot => "Reboot",
            Action::Terminate => "Terminate",
            Action::Refine => "Refine",
            Action::Continue => "Continue",
            Action::Withdraw => "Withdraw",
            Action::Complete => "Complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Some(Action::Create),
            "suspend" => Some(Action::Suspend),
            "resume" => Some(Action::Resume),
            "reboot" => Some(Action::Reboot),
            "terminate" => Some(Action::Terminate),
            "refine" => Some(Action::Refine),
            "continue" => Some(Action::Continue),
            "withdraw" => Some(Action::Withdraw),
            "complete" => Some(Action::Complete),
            _ => None,
        }
    }

    /// Status a resource settles in once this action has finished.
    pub fn target_status(&self) -> Option<Status> {
        match self {
            Action::Create => Some(Status::Running),
            Action::Suspend => Some(Status::Suspended),
            Action::Resume => Some(Status::Running),
            Action::Reboot => Some(Status::Running),
            Action::Terminate => Some(Status::Terminated),
            _ => None,
        }
    }

    /// Status recorded while the action is being carried out.
    pub fn interim_status(&self) -> Option<Status> {
        match self {
            Action::Create => Some(Status::Creating),
            Action::Suspend => Some(Status::Suspending),
            Action::Resume => Some(Status::Resuming),
            Action::Reboot => Some(Status::Rebooting),
            Action::Terminate => Some(Status::Terminating),
            _ => None,
        }
    }

    /// True for lifecycle actions that leave the resource busy until reconciled.
    pub fn is_in_flight(&self) -> bool {
        self.target_status().is_some()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted replacement for an in-process "hold" registry: a held MCI waits
/// for `Continue` or `Withdraw` before its VMs are provisioned.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum HoldState {
    #[default]
    Released,
    Held,
    Continue,
    Withdraw,
}

// --- Entities (persisted as JSON in the state store) ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mci {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub label: BTreeMap<String, String>,
    pub status: Status,
    pub target_status: Status,
    pub target_action: Action,
    #[serde(default)]
    pub hold: HoldState,
    #[serde(default)]
    pub system_message: String,
    pub created_at: DateTime<Utc>,
    /// Bumped on every save; lets writers detect a concurrent update.
    #[serde(default)]
    pub version: u64,
}

impl Mci {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            label: BTreeMap::new(),
            status: Status::Undefined,
            target_status: Status::Complete,
            target_action: Action::Complete,
            hold: HoldState::Released,
            system_message: String::new(),
            created_at: Utc::now(),
            version: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.target_action.is_in_flight()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    pub id: String,
    pub mci_id: String,
    #[serde(default)]
    pub sub_group_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub label: BTreeMap<String, String>,
    pub connection_name: String,
    /// Provider-native id; empty until creation succeeds.
    #[serde(default)]
    pub csp_id: String,

    #[serde(default)]
    pub spec_id: String,
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub vnet_id: String,
    #[serde(default)]
    pub subnet_id: String,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub ssh_key_id: String,
    #[serde(default)]
    pub data_disk_ids: Vec<String>,

    pub status: Status,
    pub target_status: Status,
    pub target_action: Action,
    #[serde(default)]
    pub system_message: String,

    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub public_dns: String,
    #[serde(default)]
    pub private_ip: String,
    #[serde(default)]
    pub private_dns: String,
    #[serde(default)]
    pub ssh_port: String,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Vm {
    /// A fresh record for a VM about to be created from `req`.
    pub fn from_request(mci_id: &str, vm_id: &str, sub_group_id: &str, req: &VmRequest) -> Self {
        Self {
            id: vm_id.to_string(),
            mci_id: mci_id.to_string(),
            sub_group_id: sub_group_id.to_string(),
            name: vm_id.to_string(),
            description: req.description.clone(),
            label: req.label.clone(),
            connection_name: req.connection_name.clone(),
            csp_id: String::new(),
            spec_id: req.spec_id.clone(),
            image_id: req.image_id.clone(),
            vnet_id: req.vnet_id.clone(),
            subnet_id: req.subnet_id.clone(),
            security_group_ids: req.security_group_ids.clone(),
            ssh_key_id: req.ssh_key_id.clone(),
            data_disk_ids: req.data_disk_ids.clone(),
            status: Status::Creating,
            target_status: Status::Running,
            target_action: Action::Create,
            system_message: String::new(),
            public_ip: String::new(),
            public_dns: String::new(),
            private_ip: String::new(),
            private_dns: String::new(),
            ssh_port: String::new(),
            created_at: Utc::now(),
            version: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.target_action.is_in_flight()
    }

    pub fn status_info(&self) -> VmStatusInfo {
        VmStatusInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            sub_group_id: self.sub_group_id.clone(),
            connection_name: self.connection_name.clone(),
            csp_id: self.csp_id.clone(),
            status: self.status,
            target_status: self.target_status,
            target_action: self.target_action,
            public_ip: self.public_ip.clone(),
            private_ip: self.private_ip.clone(),
            ssh_port: self.ssh_port.clone(),
            system_message: self.system_message.clone(),
            created_at: self.created_at,
        }
    }
}

/// Named partition of an MCI's VMs, remembered with the request that created it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubGroup {
    pub id: String,
    pub mci_id: String,
    pub vm_ids: Vec<String>,
    pub request: VmRequest,
}

/// VMs reached through a bastion VM.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BastionAssignment {
    pub bastion_vm_id: String,
    pub target_vm_ids: Vec<String>,
}

// --- Requests ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VmRequest {
    /// Sub-group name; VMs are named `{name}-{n}`.
    pub name: String,
    #[serde(default = "default_sub_group_size")]
    pub sub_group_size: usize,
    pub connection_name: String,
    pub spec_id: String,
    pub image_id: String,
    #[serde(default)]
    pub vnet_id: String,
    #[serde(default)]
    pub subnet_id: String,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub ssh_key_id: String,
    #[serde(default)]
    pub data_disk_ids: Vec<String>,
    #[serde(default)]
    pub label: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
}

fn default_sub_group_size() -> usize {
    1
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MciRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub label: BTreeMap<String, String>,
    /// Persist records but wait for `continue` before provisioning.
    #[serde(default)]
    pub hold: bool,
    pub vm: Vec<VmRequest>,
}

// --- Status projections ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmStatusInfo {
    pub id: String,
    pub name: String,
    pub sub_group_id: String,
    pub connection_name: String,
    pub csp_id: String,
    pub status: Status,
    pub target_status: Status,
    pub target_action: Action,
    pub public_ip: String,
    pub private_ip: String,
    pub ssh_port: String,
    pub system_message: String,
    pub created_at: DateTime<Utc>,
}

/// Per-status VM counts for one MCI.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatusCount {
    pub count_total: usize,
    pub count_creating: usize,
    pub count_running: usize,
    pub count_suspending: usize,
    pub count_suspended: usize,
    pub count_resuming: usize,
    pub count_rebooting: usize,
    pub count_terminating: usize,
    pub count_terminated: usize,
    pub count_failed: usize,
    pub count_undefined: usize,
}

impl StatusCount {
    pub fn add(&mut self, status: Status) {
        self.count_total += 1;
        match status {
            Status::Creating => self.count_creating += 1,
            Status::Running => self.count_running += 1,
            Status::Suspending => self.count_suspending += 1,
            Status::Suspended => self.count_suspended += 1,
            Status::Resuming => self.count_resuming += 1,
            Status::Rebooting => self.count_rebooting += 1,
            Status::Terminating => self.count_terminating += 1,
            Status::Terminated => self.count_terminated += 1,
            Status::Failed => self.count_failed += 1,
            Status::Undefined | Status::Complete => self.count_undefined += 1,
        }
    }

    pub fn get(&self, status: Status) -> usize {
        match status {
            Status::Creating => self.count_creating,
            Status::Running => self.count_running,
            Status::Suspending => self.count_suspending,
            Status::Suspended => self.count_suspended,
            Status::Resuming => self.count_resuming,
            Status::Rebooting => self.count_rebooting,
            Status::Terminating => self.count_terminating,
            Status::Terminated => self.count_terminated,
            Status::Failed => self.count_failed,
            Status::Undefined | Status::Complete => self.count_undefined,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MciStatusInfo {
    pub id: String,
    pub name: String,
    /// Derived label such as `Partial-Running:2 (R:2/3)`; never persisted.
    pub status: String,
    /// Status the label reports (plurality, or `Failed` when any VM failed).
    pub dominant_status: Status,
    pub partial: bool,
    pub status_count: StatusCount,
    pub target_status: Status,
    pub target_action: Action,
    pub master_vm_id: String,
    pub master_ip: String,
    pub master_ssh_port: String,
    pub vm: Vec<VmStatusInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_roundtrip() {
        for st in Status::OBSERVED {
            assert_eq!(Status::parse(st.as_str()), Some(st));
            assert_eq!(Status::parse(&st.as_str().to_lowercase()), Some(st));
        }
        assert_eq!(Status::parse("complete"), Some(Status::Complete));
        assert_eq!(Status::parse("bogus"), None);
    }

    #[test]
    fn native_status_outside_vocabulary_is_undefined() {
        assert_eq!(Status::from_native("running"), Status::Running);
        assert_eq!(Status::from_native(" Suspended "), Status::Suspended);
        assert_eq!(Status::from_native("Failed"), Status::Undefined);
        assert_eq!(Status::from_native("stopping"), Status::Undefined);
        assert_eq!(Status::from_native(""), Status::Undefined);
    }

    #[test]
    fn action_targets() {
        assert_eq!(Action::Terminate.target_status(), Some(Status::Terminated));
        assert_eq!(Action::Reboot.target_status(), Some(Status::Running));
        assert_eq!(Action::Suspend.target_status(), Some(Status::Suspended));
        assert_eq!(Action::Resume.target_status(), Some(Status::Running));
        assert_eq!(Action::Refine.target_status(), None);
        assert!(!Action::Complete.is_in_flight());
        assert!(Action::Terminate.is_in_flight());
        assert_eq!(Action::parse("SUSPEND"), Some(Action::Suspend));
        assert_eq!(Action::parse("explode"), None);
    }

    #[test]
    fn status_count_tracks_totals() {
        let mut c = StatusCount::default();
        for st in [Status::Running, Status::Running, Status::Failed] {
            c.add(st);
        }
        assert_eq!(c.count_total, 3);
        assert_eq!(c.get(Status::Running), 2);
        assert_eq!(c.get(Status::Failed), 1);
        assert_eq!(c.get(Status::Suspended), 0);
    }

    #[test]
    fn vm_record_json_roundtrip() {
        let req = VmRequest {
            name: "web".into(),
            sub_group_size: 1,
            connection_name: "aws-ap-northeast-2".into(),
            spec_id: "t3-small".into(),
            image_id: "ubuntu22".into(),
            ..Default::default()
        };
        let vm = Vm::from_request("mci01", "web-1", "web", &req);
        let raw = serde_json::to_string(&vm).unwrap();
        assert!(raw.contains("\"targetAction\":\"Create\""));
        let back: Vm = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, vm);
    }
}
