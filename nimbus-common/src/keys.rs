//! Hierarchical state-store keys.
//!
//! ```text
//! /ns/{ns}/mci/{mci}
//! /ns/{ns}/mci/{mci}/vm/{vm}
//! /ns/{ns}/mci/{mci}/subgroup/{sg}
//! /ns/{ns}/mci/{mci}/bastion/{vm}
//! /ns/{ns}/policy/mci/{mci}
//! /ns/{ns}/resources/{kind}/{id}
//! ```

use crate::{ControlError, ControlResult};

pub fn mci(ns: &str, mci_id: &str) -> String {
    format!("/ns/{}/mci/{}", ns, mci_id)
}

pub fn mci_prefix(ns: &str) -> String {
    format!("/ns/{}/mci/", ns)
}

pub fn vm(ns: &str, mci_id: &str, vm_id: &str) -> String {
    format!("/ns/{}/mci/{}/vm/{}", ns, mci_id, vm_id)
}

pub fn vm_prefix(ns: &str, mci_id: &str) -> String {
    format!("/ns/{}/mci/{}/vm/", ns, mci_id)
}

pub fn sub_group(ns: &str, mci_id: &str, sg_id: &str) -> String {
    format!("/ns/{}/mci/{}/subgroup/{}", ns, mci_id, sg_id)
}

pub fn sub_group_prefix(ns: &str, mci_id: &str) -> String {
    format!("/ns/{}/mci/{}/subgroup/", ns, mci_id)
}

pub fn bastion(ns: &str, mci_id: &str, vm_id: &str) -> String {
    format!("/ns/{}/mci/{}/bastion/{}", ns, mci_id, vm_id)
}

pub fn bastion_prefix(ns: &str, mci_id: &str) -> String {
    format!("/ns/{}/mci/{}/bastion/", ns, mci_id)
}

pub fn policy(ns: &str, mci_id: &str) -> String {
    format!("/ns/{}/policy/mci/{}", ns, mci_id)
}

pub fn policy_prefix(ns: &str) -> String {
    format!("/ns/{}/policy/mci/", ns)
}

pub fn resource(ns: &str, kind: &str, id: &str) -> String {
    format!("/ns/{}/resources/{}/{}", ns, kind, id)
}

/// Last path segment of a key (the entity id).
pub fn leaf(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Direct children of `prefix`, i.e. keys with no further `/` after it.
///
/// `/ns/a/mci/` lists MCIs but must not pick up `/ns/a/mci/x/vm/y`.
pub fn is_direct_child(prefix: &str, key: &str) -> bool {
    key.strip_prefix(prefix)
        .map(|rest| !rest.is_empty() && !rest.contains('/'))
        .unwrap_or(false)
}

/// Namespace of a policy key (`/ns/{ns}/policy/mci/{mci}`).
pub fn namespace_of_policy_key(key: &str) -> Option<&str> {
    let mut parts = key.trim_start_matches('/').split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("ns"), Some(ns), Some("policy"), Some("mci")) if !ns.is_empty() => Some(ns),
        _ => None,
    }
}

/// Ids become key segments, so they are restricted to a conservative alphabet.
pub fn validate_id(kind: &str, id: &str) -> ControlResult<()> {
    if id.is_empty() {
        return Err(ControlError::Validation(format!("{} id is empty", kind)));
    }
    if id.len() > 64 {
        return Err(ControlError::Validation(format!(
            "{} id '{}' is longer than 64 characters",
            kind, id
        )));
    }
    let first = id.chars().next().unwrap_or('-');
    if !first.is_ascii_alphanumeric() {
        return Err(ControlError::Validation(format!(
            "{} id '{}' must start with a letter or digit",
            kind, id
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ControlError::Validation(format!(
            "{} id '{}' may only contain letters, digits, '-', '_' and '.'",
            kind, id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(mci("default", "m1"), "/ns/default/mci/m1");
        assert_eq!(vm("default", "m1", "v1"), "/ns/default/mci/m1/vm/v1");
        assert_eq!(policy("default", "m1"), "/ns/default/policy/mci/m1");
        assert_eq!(leaf("/ns/default/mci/m1/vm/v1"), "v1");
    }

    #[test]
    fn direct_children_only() {
        let p = mci_prefix("ns1");
        assert!(is_direct_child(&p, "/ns/ns1/mci/m1"));
        assert!(!is_direct_child(&p, "/ns/ns1/mci/m1/vm/v1"));
        assert!(!is_direct_child(&p, "/ns/ns1/mci/"));
        assert!(!is_direct_child(&p, "/ns/ns2/mci/m1"));
    }

    #[test]
    fn policy_namespace_extraction() {
        assert_eq!(
            namespace_of_policy_key("/ns/team-a/policy/mci/m1"),
            Some("team-a")
        );
        assert_eq!(namespace_of_policy_key("/ns/team-a/mci/m1"), None);
    }

    #[test]
    fn id_validation() {
        assert!(validate_id("mci", "web-01").is_ok());
        assert!(validate_id("mci", "").is_err());
        assert!(validate_id("mci", "-x").is_err());
        assert!(validate_id("mci", "a/b").is_err());
    }
}
