//! Object references shared by the binding CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to the workload a binding is projected into.
///
/// Either `name` or `selector` identifies the workload(s).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationReference {
    /// API version of the workload (e.g. "apps/v1")
    pub api_version: String,

    /// Kind of the workload (e.g. "Deployment")
    pub kind: String,

    /// Name of the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Label selector matching workloads, used when `name` is not set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Names of containers to project into; all containers when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<String>,
}

/// Equality-based label selector
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Labels the workload must carry
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub match_labels: std::collections::BTreeMap<String, String>,
}

/// Reference to the provisioned service backing a binding
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    /// API version of the service resource
    pub api_version: String,

    /// Kind of the service resource
    pub kind: String,

    /// Name of the service resource
    pub name: String,
}

/// Reference to an object in the same namespace
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// Object name
    pub name: String,
}

/// Exposes one binding secret entry as an environment variable
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvMapping {
    /// Environment variable name
    pub name: String,

    /// Key in the binding secret
    pub key: String,
}

/// Status condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "Ready")
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False" or "Unknown"
    pub status: String,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the status last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl Condition {
    /// Build a condition stamped with the current time
    pub fn new(type_: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: Some(chrono::Utc::now()),
        }
    }

    /// Whether the condition status is "True"
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Replace the condition of the same type, keeping the transition time when
/// the status did not change
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.status == condition.status => {
            existing.reason = condition.reason;
            existing.message = condition.message;
        }
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_keeps_transition_time_on_same_status() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, Condition::new("Ready", false, "Pending", "waiting"));
        let first = conditions[0].last_transition_time;

        set_condition(&mut conditions, Condition::new("Ready", false, "Pending", "still waiting"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].message.as_deref(), Some("still waiting"));

        set_condition(&mut conditions, Condition::new("Ready", true, "Projected", "done"));
        assert!(conditions[0].is_true());
        assert_eq!(conditions[0].reason.as_deref(), Some("Projected"));
    }

    #[test]
    fn test_condition_type_field_name() {
        let json = serde_json::to_value(Condition::new("Ready", true, "Projected", "ok")).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
    }
}
