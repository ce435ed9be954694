//! Supporting types for the ServiceCatalogAPIServer CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reporting whether the operand is serving
pub const CONDITION_AVAILABLE: &str = "Available";
/// Condition type reporting whether a rollout is in flight
pub const CONDITION_PROGRESSING: &str = "Progressing";
/// Condition type reporting sync failures
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Who is responsible for the operand.
///
/// Set by the cluster administrator; the operator only reads it. Values
/// outside the known set are preserved in [`ManagementState::Unknown`] so
/// they can be reported back verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum ManagementState {
    /// Operator actively converges the operand
    Managed,
    /// Operator leaves the operand alone
    Unmanaged,
    /// Operator tears the operand down
    Removed,
    /// Any other non-empty value
    Unknown(String),
    /// Field not set
    #[default]
    Unset,
}

impl ManagementState {
    /// Raw value as it appears in the resource
    pub fn as_str(&self) -> &str {
        match self {
            Self::Managed => "Managed",
            Self::Unmanaged => "Unmanaged",
            Self::Removed => "Removed",
            Self::Unknown(raw) => raw,
            Self::Unset => "",
        }
    }
}

impl From<String> for ManagementState {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "Managed" => Self::Managed,
            "Unmanaged" => Self::Unmanaged,
            "Removed" => Self::Removed,
            "" => Self::Unset,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<ManagementState> for String {
    fn from(state: ManagementState) -> Self {
        state.as_str().to_string()
    }
}

impl std::fmt::Display for ManagementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operand log verbosity
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum LogLevel {
    /// `-v=3`; also used for unrecognized values
    #[default]
    Normal,
    /// `-v=4`
    Debug,
    /// `-v=6`
    Trace,
    /// `-v=8`
    TraceAll,
}

impl LogLevel {
    /// Verbosity flag value passed to the operand
    pub fn verbosity(&self) -> u8 {
        match self {
            Self::Normal => 3,
            Self::Debug => 4,
            Self::Trace => 6,
            Self::TraceAll => 8,
        }
    }
}

impl From<String> for LogLevel {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "Debug" => Self::Debug,
            "Trace" => Self::Trace,
            "TraceAll" => Self::TraceAll,
            _ => Self::Normal,
        }
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Normal => "Normal",
            LogLevel::Debug => "Debug",
            LogLevel::Trace => "Trace",
            LogLevel::TraceAll => "TraceAll",
        }
        .to_string()
    }
}

/// Condition status values
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Operator status condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCondition {
    /// Type of condition (Available, Progressing, Degraded)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time `status` changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl OperatorCondition {
    /// Create a condition without a transition time
    ///
    /// The time is stamped by [`set_operator_condition`].
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
        }
    }
}

/// Generation of a managed object the last time the operator applied it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    /// API group of the object
    #[serde(default)]
    pub group: String,
    /// Plural resource name
    pub resource: String,
    /// Namespace of the object
    #[serde(default)]
    pub namespace: String,
    /// Name of the object
    pub name: String,
    /// Generation observed after the last apply
    pub last_generation: i64,
}

/// Insert or update a condition, keyed by type.
///
/// The transition time only moves when the status changes; reason and
/// message are always overwritten.
pub fn set_operator_condition(conditions: &mut Vec<OperatorCondition>, new: OperatorCondition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status != new.status {
                existing.status = new.status;
                existing.last_transition_time = Some(Utc::now());
            }
            existing.reason = new.reason;
            existing.message = new.message;
        }
        None => {
            let mut new = new;
            new.last_transition_time = Some(Utc::now());
            conditions.push(new);
        }
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(
    conditions: &'a [OperatorCondition],
    type_: &str,
) -> Option<&'a OperatorCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True when the condition exists and is `True`
pub fn is_condition_true(conditions: &[OperatorCondition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// True when the condition exists and is `False`
pub fn is_condition_false(conditions: &[OperatorCondition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::False)
}

/// Generation last recorded for the given object, or `-1` when unknown
pub fn expected_generation(
    generations: &[GenerationStatus],
    group: &str,
    resource: &str,
    namespace: &str,
    name: &str,
) -> i64 {
    generations
        .iter()
        .find(|g| {
            g.group == group && g.resource == resource && g.namespace == namespace && g.name == name
        })
        .map(|g| g.last_generation)
        .unwrap_or(-1)
}

/// Record (or replace) a generation snapshot
pub fn set_generation(generations: &mut Vec<GenerationStatus>, new: GenerationStatus) {
    match generations.iter_mut().find(|g| {
        g.group == new.group
            && g.resource == new.resource
            && g.namespace == new.namespace
            && g.name == new.name
    }) {
        Some(existing) => existing.last_generation = new.last_generation,
        None => generations.push(new),
    }
}
