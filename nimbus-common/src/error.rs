use thiserror::Error;

pub type ControlResult<T> = Result<T, ControlError>;

/// Errors surfaced by the lifecycle control plane.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Malformed ids, unknown action or field names, bad policy definitions.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The transition guard refused the action; retry with `force` to override.
    #[error("{0}")]
    TransitionDenied(String),

    /// A version-checked write lost against a concurrent writer.
    #[error("conflict: {0} was modified concurrently, retry the request")]
    Conflict(String),

    #[error("cloud adapter error: {0}")]
    Transport(String),

    /// Some VMs in a fan-out failed; successful VMs keep their new state.
    #[error("{}", format_failures(.failures))]
    PartialFailure { failures: Vec<(String, String)> },

    /// A VM record has no provider-native id although the request needs one.
    #[error("inconsistent record: {0}")]
    InconsistentRecord(String),

    #[error("state store error: {0}")]
    Store(String),
}

impl ControlError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ControlError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Errors a caller may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControlError::Conflict(_) | ControlError::Transport(_))
    }
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(id, err)| format!("[{}: {}]", id, err))
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        ControlError::Store(format!("malformed record: {}", e))
    }
}
