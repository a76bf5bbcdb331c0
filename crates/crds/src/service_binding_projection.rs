//! ServiceBindingProjection CRD
//!
//! Internal resource describing how a resolved binding secret is projected
//! into a workload. Owned by the ServiceBinding it was derived from.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::references::{ApplicationReference, Condition, EnvMapping, LocalObjectReference};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "internal.service.binding",
    version = "v1alpha2",
    kind = "ServiceBindingProjection",
    namespaced,
    status = "ServiceBindingProjectionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingProjectionSpec {
    /// Binding name visible to the application
    pub name: String,

    /// Secret holding the binding
    pub binding: LocalObjectReference,

    /// Workload to project into
    pub application: ApplicationReference,

    /// Binding type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,

    /// Binding provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Secret entries exposed as environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingProjectionStatus {
    /// Generation most recently acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
