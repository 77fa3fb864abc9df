use std::fmt;

use nimbus_common::{Action, ControlError, ControlResult, Status};

/// What a guarded action is aimed at; only used to phrase errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    Mci(&'a str),
    Vm(&'a str),
}

impl fmt::Display for Scope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Mci(id) => write!(f, "MCI '{}'", id),
            Scope::Vm(id) => write!(f, "VM '{}'", id),
        }
    }
}

/// Whether the guard actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    Checked,
    /// `force` skipped the check; downstream steps must not assume the
    /// transition is legal.
    Forced,
}

/// Decide whether `action` may be issued against an entity in `current`.
///
/// Pure and deterministic. Rules are applied in order:
/// unsupported action, duplicate target, terminated, mid-transition, and
/// finally the suspended state which only accepts resume and terminate.
pub fn check_allowed_transition(current: Status, action: Action, scope: Scope<'_>) -> ControlResult<()> {
    let Some(target) = action.target_status() else {
        return Err(ControlError::TransitionDenied(format!(
            "action '{}' is not supported for {}",
            action, scope
        )));
    };

    if target == current {
        return Err(ControlError::TransitionDenied(format!(
            "duplicated action: {} is already {}, cannot {}",
            scope, current, action
        )));
    }

    if current == Status::Terminated {
        return Err(ControlError::TransitionDenied(format!(
            "{} is Terminated, cannot {}",
            scope, action
        )));
    }

    if current.is_transitional() {
        return Err(ControlError::TransitionDenied(format!(
            "{} is {}, cannot {} during a transition",
            scope, current, action
        )));
    }

    if current == Status::Suspended && !matches!(action, Action::Resume | Action::Terminate) {
        return Err(ControlError::TransitionDenied(format!(
            "{} is Suspended, only Resume or Terminate are allowed (requested {})",
            scope, action
        )));
    }

    Ok(())
}

/// `check_allowed_transition`, unless `force` is set.
pub fn guard(current: Status, action: Action, scope: Scope<'_>, force: bool) -> ControlResult<GuardOutcome> {
    if force {
        tracing::warn!(
            "⚠️ [guard] forced {} on {} (current status {}), transition check skipped",
            action,
            scope,
            current
        );
        return Ok(GuardOutcome::Forced);
    }
    check_allowed_transition(current, action, scope)?;
    Ok(GuardOutcome::Checked)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIFECYCLE: [Action; 5] = [
        Action::Create,
        Action::Suspend,
        Action::Resume,
        Action::Reboot,
        Action::Terminate,
    ];

    fn allowed(current: Status, action: Action) -> bool {
        check_allowed_transition(current, action, Scope::Mci("m1")).is_ok()
    }

    #[test]
    fn guard_rules_over_every_pair() {
        for current in Status::OBSERVED {
            for action in LIFECYCLE {
                let target = action.target_status().unwrap();
                let expected = target != current
                    && current != Status::Terminated
                    && !current.is_transitional()
                    && (current != Status::Suspended
                        || matches!(action, Action::Resume | Action::Terminate));
                assert_eq!(
                    allowed(current, action),
                    expected,
                    "current={} action={}",
                    current,
                    action
                );
                // Deterministic.
                assert_eq!(allowed(current, action), allowed(current, action));
            }
        }
    }

    #[test]
    fn non_lifecycle_actions_are_unsupported() {
        for action in [Action::Refine, Action::Continue, Action::Withdraw, Action::Complete] {
            for current in Status::OBSERVED {
                assert!(!allowed(current, action));
            }
        }
    }

    #[test]
    fn representative_decisions() {
        assert!(allowed(Status::Running, Action::Suspend));
        assert!(allowed(Status::Running, Action::Terminate));
        assert!(allowed(Status::Suspended, Action::Resume));
        assert!(allowed(Status::Failed, Action::Terminate));
        assert!(allowed(Status::Undefined, Action::Reboot));

        assert!(!allowed(Status::Running, Action::Resume));
        assert!(!allowed(Status::Suspended, Action::Suspend));
        assert!(!allowed(Status::Suspended, Action::Reboot));
        assert!(!allowed(Status::Terminated, Action::Resume));
        assert!(!allowed(Status::Creating, Action::Terminate));
        assert!(!allowed(Status::Rebooting, Action::Suspend));
    }

    #[test]
    fn force_skips_the_check() {
        assert_eq!(
            guard(Status::Terminating, Action::Terminate, Scope::Vm("v1"), true).unwrap(),
            GuardOutcome::Forced
        );
        assert_eq!(
            guard(Status::Running, Action::Suspend, Scope::Vm("v1"), false).unwrap(),
            GuardOutcome::Checked
        );
        let err = guard(Status::Terminating, Action::Suspend, Scope::Vm("v1"), false).unwrap_err();
        assert!(err.to_string().contains("VM 'v1'"));
    }
}
