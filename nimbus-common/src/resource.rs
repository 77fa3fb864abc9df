use serde::{Deserialize, Serialize};

use crate::Vm;

/// Catalog resources that keep a back-reference list of the VMs using them.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Image,
    Spec,
    SshKey,
    VNet,
    SecurityGroup,
    DataDisk,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Image => "image",
            ResourceKind::Spec => "spec",
            ResourceKind::SshKey => "sshKey",
            ResourceKind::VNet => "vNet",
            ResourceKind::SecurityGroup => "securityGroup",
            ResourceKind::DataDisk => "dataDisk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationOp {
    Add,
    Remove,
}

/// The part of a catalog record this control plane touches. Other fields of
/// the stored JSON are preserved untouched.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AssociatedObjects {
    #[serde(default)]
    pub associated_object_list: Vec<String>,
}

/// Every (kind, id) catalog reference held by a VM.
pub fn references_of(vm: &Vm) -> Vec<(ResourceKind, String)> {
    let mut refs = Vec::new();
    let mut push = |kind: ResourceKind, id: &str| {
        if !id.is_empty() {
            refs.push((kind, id.to_string()));
        }
    };
    push(ResourceKind::Image, &vm.image_id);
    push(ResourceKind::Spec, &vm.spec_id);
    push(ResourceKind::SshKey, &vm.ssh_key_id);
    push(ResourceKind::VNet, &vm.vnet_id);
    for sg in &vm.security_group_ids {
        push(ResourceKind::SecurityGroup, sg);
    }
    for disk in &vm.data_disk_ids {
        push(ResourceKind::DataDisk, disk);
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VmRequest;

    #[test]
    fn collects_non_empty_references() {
        let req = VmRequest {
            name: "db".into(),
            image_id: "ubuntu".into(),
            spec_id: "m5".into(),
            security_group_ids: vec!["sg1".into(), "sg2".into()],
            ..Default::default()
        };
        let vm = Vm::from_request("m1", "db-1", "db", &req);
        let refs = references_of(&vm);
        assert_eq!(refs.len(), 4);
        assert!(refs.contains(&(ResourceKind::SecurityGroup, "sg2".to_string())));
        assert!(!refs.iter().any(|(k, _)| *k == ResourceKind::SshKey));
    }
}
