use crate::{ControlError, ControlResult, Vm};

/// VM fields that can be used to filter an MCI's VMs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmField {
    Id,
    Name,
    SubGroupId,
    ConnectionName,
    Status,
    /// `label:<key>` matches the value of one label.
    Label(String),
}

impl VmField {
    pub fn parse(s: &str) -> ControlResult<Self> {
        let s = s.trim();
        if let Some(key) = s.strip_prefix("label:") {
            if key.is_empty() {
                return Err(ControlError::Validation(
                    "label filter needs a key (label:<key>)".to_string(),
                ));
            }
            return Ok(VmField::Label(key.to_string()));
        }
        match s.to_ascii_lowercase().as_str() {
            "id" => Ok(VmField::Id),
            "name" => Ok(VmField::Name),
            "subgroupid" | "sub_group_id" => Ok(VmField::SubGroupId),
            "connectionname" | "connection_name" => Ok(VmField::ConnectionName),
            "status" => Ok(VmField::Status),
            other => Err(ControlError::Validation(format!(
                "unknown filter field '{}' (expected id, name, subGroupId, connectionName, status or label:<key>)",
                other
            ))),
        }
    }

    pub fn value_of<'a>(&self, vm: &'a Vm) -> Option<&'a str> {
        match self {
            VmField::Id => Some(&vm.id),
            VmField::Name => Some(&vm.name),
            VmField::SubGroupId => Some(&vm.sub_group_id),
            VmField::ConnectionName => Some(&vm.connection_name),
            VmField::Status => Some(vm.status.as_str()),
            VmField::Label(key) => vm.label.get(key).map(|s| s.as_str()),
        }
    }

    pub fn matches(&self, vm: &Vm, value: &str) -> bool {
        match self {
            VmField::Status => self
                .value_of(vm)
                .map(|v| v.eq_ignore_ascii_case(value.trim()))
                .unwrap_or(false),
            _ => self.value_of(vm) == Some(value),
        }
    }
}
