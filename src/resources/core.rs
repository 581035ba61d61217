use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";
pub const CONDITION_PROGRESSING: &str = "Progressing";

/// Reason set on freshly initialized conditions
pub const CONDITION_INITIALIZED: &str = "ConditionInitialized";

pub const SEED_SYSTEM_COMPONENTS_HEALTHY: &str = "SeedSystemComponentsHealthy";
pub const OBSERVABILITY_COMPONENTS_HEALTHY: &str = "ObservabilityComponentsHealthy";

pub const LAST_OPERATION_STATE_SUCCEEDED: &str = "Succeeded";

/// Condition holds the information about the state of a resource.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of the condition.
    pub r#type: String,
    /// Status of the condition, one of True, False, Unknown, Progressing.
    pub status: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<Time>,
    /// Last time the condition was updated.
    pub last_update_time: Option<Time>,
    /// The reason for the condition's last transition.
    pub reason: Option<String>,
    /// A human readable message indicating details about the transition.
    pub message: Option<String>,
    /// Well-defined error codes in case the condition reports a problem.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<String>,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={} ({}: {})",
            self.r#type,
            self.status,
            self.reason.as_deref().unwrap_or_default(),
            self.message.as_deref().unwrap_or_default()
        )
    }
}

/// LastOperation indicates the type and the state of the last operation, along with a description
/// message and a progress indicator.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    pub r#type: String,
    pub state: String,
    pub last_update_time: Option<Time>,
    pub progress: Option<i32>,
    pub description: Option<String>,
}
