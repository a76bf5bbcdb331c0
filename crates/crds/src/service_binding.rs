//! ServiceBinding CRD
//!
//! Binds a provisioned service to an application workload.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::references::{
    ApplicationReference, Condition, EnvMapping, LocalObjectReference, ServiceReference,
};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "service.binding",
    version = "v1alpha2",
    kind = "ServiceBinding",
    namespaced,
    status = "ServiceBindingStatus",
    shortname = "sb"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Name of the binding as seen by the application; defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Binding type (e.g. "mysql")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,

    /// Binding provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Workload to bind
    pub application: ApplicationReference,

    /// Service to bind
    pub service: ServiceReference,

    /// Secret entries exposed as environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    /// Generation most recently acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Secret holding the projected binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<LocalObjectReference>,
}

impl ServiceBinding {
    /// Binding name visible to the application
    pub fn binding_name(&self) -> String {
        self.spec
            .name
            .clone()
            .or_else(|| self.metadata.name.clone())
            .unwrap_or_default()
    }
}
