use serde::{Deserialize, Serialize};

use crate::{ControlError, ControlResult, VmRequest};

/// Autoscaling rules attached to one MCI. Stored at `/ns/{ns}/policy/mci/{mci}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoPolicy {
    /// Same as the owning MCI id.
    pub id: String,
    pub namespace: String,
    pub mci_id: String,
    #[serde(default)]
    pub description: String,
    pub policy: Vec<Policy>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub auto_condition: AutoCondition,
    pub auto_action: AutoAction,
    pub status: PolicyStatus,
    #[serde(default)]
    pub system_message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoCondition {
    pub metric: String,
    /// One of `>=`, `>`, `<=`, `<`, `==`.
    pub operator: String,
    pub operand: f64,
    /// Number of most recent samples averaged before comparing.
    pub evaluation_period: usize,
    /// Most recent averaged metric values, newest first.
    #[serde(default)]
    pub evaluation_value: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ScaleActionType {
    ScaleOut,
    ScaleIn,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlacementAlgo {
    /// Use the template's connection/spec as given.
    #[default]
    Fixed,
    /// Pick one of `placement_candidates` at random for every scale-out.
    Random,
}

/// A (connection, spec) pair random placement may choose.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpecCandidate {
    pub connection_name: String,
    pub spec_id: String,
    #[serde(default)]
    pub image_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostCommand {
    pub command: Vec<String>,
    #[serde(default)]
    pub user_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoAction {
    pub action_type: ScaleActionType,
    /// Template for the VM added on scale-out.
    pub vm: VmRequest,
    #[serde(default)]
    pub placement_algo: PlacementAlgo,
    #[serde(default)]
    pub placement_candidates: Vec<SpecCandidate>,
    #[serde(default)]
    pub post_command: Option<PostCommand>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum PolicyStatus {
    Ready,
    Checking,
    Detected,
    Operating,
    Stabilizing,
    Timeout,
    Failed,
    Suspended,
    Error,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyStatus::Ready => "Ready",
            PolicyStatus::Checking => "Checking",
            PolicyStatus::Detected => "Detected",
            PolicyStatus::Operating => "Operating",
            PolicyStatus::Stabilizing => "Stabilizing",
            PolicyStatus::Timeout => "Timeout",
            PolicyStatus::Failed => "Failed",
            PolicyStatus::Suspended => "Suspended",
            PolicyStatus::Error => "Error",
        }
    }
}

/// Comparison operator of an `AutoCondition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Ge,
    Gt,
    Le,
    Lt,
    Eq,
}

impl Comparator {
    pub fn parse(s: &str) -> ControlResult<Self> {
        match s.trim() {
            ">=" => Ok(Comparator::Ge),
            ">" => Ok(Comparator::Gt),
            "<=" => Ok(Comparator::Le),
            "<" => Ok(Comparator::Lt),
            "==" | "=" => Ok(Comparator::Eq),
            other => Err(ControlError::Validation(format!(
                "unsupported operator '{}'",
                other
            ))),
        }
    }

    pub fn evaluate(&self, value: f64, operand: f64) -> bool {
        match self {
            Comparator::Ge => value >= operand,
            Comparator::Gt => value > operand,
            Comparator::Le => value <= operand,
            Comparator::Lt => value < operand,
            Comparator::Eq => (value - operand).abs() < f64::EPSILON,
        }
    }
}

/// Request body for creating (or replacing) an MCI's AutoPolicy.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoPolicyRequest {
    #[serde(default)]
    pub description: String,
    pub policy: Vec<PolicyRequest>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRequest {
    pub auto_condition: AutoConditionRequest,
    pub auto_action: AutoAction,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoConditionRequest {
    pub metric: String,
    pub operator: String,
    pub operand: f64,
    pub evaluation_period: usize,
}

impl PolicyRequest {
    pub fn validate(&self) -> ControlResult<()> {
        Comparator::parse(&self.auto_condition.operator)?;
        if self.auto_condition.metric.trim().is_empty() {
            return Err(ControlError::Validation("metric is empty".to_string()));
        }
        if self.auto_condition.evaluation_period == 0 {
            return Err(ControlError::Validation(
                "evaluationPeriod must be at least 1".to_string(),
            ));
        }
        if self.auto_action.action_type == ScaleActionType::ScaleOut {
            if self.auto_action.vm.name.trim().is_empty() {
                return Err(ControlError::Validation(
                    "scale-out template needs a sub-group name".to_string(),
                ));
            }
            if self.auto_action.placement_algo == PlacementAlgo::Random
                && self.auto_action.placement_candidates.is_empty()
            {
                return Err(ControlError::Validation(
                    "random placement needs at least one placement candidate".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn into_policy(self) -> Policy {
        Policy {
            auto_condition: AutoCondition {
                metric: self.auto_condition.metric,
                operator: self.auto_condition.operator,
                operand: self.auto_condition.operand,
                evaluation_period: self.auto_condition.evaluation_period,
                evaluation_value: Vec::new(),
            },
            auto_action: self.auto_action,
            status: PolicyStatus::Ready,
            system_message: String::new(),
        }
    }
}
