//! ServiceBinding reconciliation.
//!
//! Resolves the binding secret of the referenced service, keeps an owned
//! `ServiceBindingProjection` in step with the binding and reports progress
//! through the `Ready` condition.

use std::time::Duration;

use async_trait::async_trait;
use controller_runtime::{ReconcileError, ReconcileRequest, ReconcileResult, Reconciler};
use crds::{
    set_condition, Condition, LocalObjectReference, ServiceBinding, ServiceBindingProjection,
    ServiceBindingProjectionSpec, ServiceBindingStatus, ServiceReference,
};
use kube::api::{ApiResource, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "service-binding-controller";

/// How long to wait before looking at an unresolved service again
const UNRESOLVED_REQUEUE: Duration = Duration::from_secs(30);

const READY: &str = "Ready";

/// Why a binding secret could not be determined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unresolved {
    /// The referenced service does not exist
    ServiceMissing(String),
    /// The service exists but does not publish a binding secret yet
    NotProvisioned(String),
}

impl Unresolved {
    fn reason(&self) -> &'static str {
        match self {
            Unresolved::ServiceMissing(_) => "ServiceMissing",
            Unresolved::NotProvisioned(_) => "ServiceNotProvisioned",
        }
    }

    fn message(&self) -> String {
        match self {
            Unresolved::ServiceMissing(name) => format!("service {name} not found"),
            Unresolved::NotProvisioned(name) => {
                format!("service {name} does not expose status.binding.name")
            }
        }
    }
}

/// Reconciles `ServiceBinding` resources.
pub struct BindingReconciler {
    client: Client,
}

impl BindingReconciler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Look up the binding secret name published by the referenced service.
    async fn resolve_secret(
        &self,
        namespace: &str,
        service: &ServiceReference,
    ) -> Result<Result<String, Unresolved>, kube::Error> {
        if is_direct_secret(service) {
            return Ok(Ok(service.name.clone()));
        }
        let resource = ApiResource::from_gvk(&service_gvk(service));
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let object = api.get_opt(&service.name).await?;
        Ok(secret_from_service(&service.name, object.as_ref()))
    }

    async fn apply_projection(
        &self,
        binding: &ServiceBinding,
        secret: &str,
    ) -> Result<(), ReconcileError> {
        let namespace = binding.namespace().unwrap_or_default();
        let projection = projection_for(binding, secret)?;
        let api: Api<ServiceBindingProjection> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &binding.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&projection),
        )
        .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        binding: &ServiceBinding,
        status: &ServiceBindingStatus,
    ) -> Result<(), kube::Error> {
        let namespace = binding.namespace().unwrap_or_default();
        let api: Api<ServiceBinding> = Api::namespaced(self.client.clone(), &namespace);
        api.patch_status(
            &binding.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for BindingReconciler {
    async fn reconcile(
        &self,
        request: ReconcileRequest,
    ) -> Result<ReconcileResult, ReconcileError> {
        let key = request.key;
        let namespace = key.namespace.clone().unwrap_or_default();
        let api: Api<ServiceBinding> = Api::namespaced(self.client.clone(), &namespace);

        let Some(binding) = api.get_opt(&key.name).await? else {
            debug!(key = %key, "ServiceBinding gone, nothing to do");
            return Ok(ReconcileResult::done());
        };
        if binding.meta().deletion_timestamp.is_some() {
            return Ok(ReconcileResult::done());
        }

        let resolved = self.resolve_secret(&namespace, &binding.spec.service).await?;
        let mut status = binding.status.clone().unwrap_or_default();
        status.observed_generation = binding.meta().generation;

        let result = match resolved {
            Ok(secret) => {
                self.apply_projection(&binding, &secret).await?;
                status.binding = Some(LocalObjectReference { name: secret.clone() });
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        READY,
                        true,
                        "Projected",
                        format!("binding secret {secret} projected"),
                    ),
                );
                info!(key = %key, secret = %secret, "ServiceBinding projected");
                ReconcileResult::done()
            }
            Err(unresolved) => {
                warn!(key = %key, reason = unresolved.reason(), "{}", unresolved.message());
                status.binding = None;
                set_condition(
                    &mut status.conditions,
                    Condition::new(READY, false, unresolved.reason(), unresolved.message()),
                );
                ReconcileResult::requeue_after(UNRESOLVED_REQUEUE)
            }
        };

        if binding.status.as_ref() != Some(&status) {
            self.patch_status(&binding, &status).await?;
        }
        Ok(result)
    }
}

/// A service reference that points straight at a core `Secret`
fn is_direct_secret(service: &ServiceReference) -> bool {
    service.api_version == "v1" && service.kind == "Secret"
}

fn service_gvk(service: &ServiceReference) -> GroupVersionKind {
    match service.api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, &service.kind),
        None => GroupVersionKind::gvk("", &service.api_version, &service.kind),
    }
}

/// Read `status.binding.name` from a provisioned service.
fn secret_from_service(name: &str, service: Option<&DynamicObject>) -> Result<String, Unresolved> {
    let service = service.ok_or_else(|| Unresolved::ServiceMissing(name.to_string()))?;
    service
        .data
        .pointer("/status/binding/name")
        .and_then(|value| value.as_str())
        .filter(|secret| !secret.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Unresolved::NotProvisioned(name.to_string()))
}

/// Desired projection for a binding, owned by it.
fn projection_for(
    binding: &ServiceBinding,
    secret: &str,
) -> Result<ServiceBindingProjection, ReconcileError> {
    let owner = binding
        .controller_owner_ref(&())
        .ok_or_else(|| anyhow::anyhow!("ServiceBinding {} has no uid", binding.name_any()))?;

    let mut projection = ServiceBindingProjection::new(
        &binding.name_any(),
        ServiceBindingProjectionSpec {
            name: binding.binding_name(),
            binding: LocalObjectReference { name: secret.to_string() },
            application: binding.spec.application.clone(),
            r#type: binding.spec.r#type.clone(),
            provider: binding.spec.provider.clone(),
            env: binding.spec.env.clone(),
        },
    );
    projection.metadata.namespace = binding.namespace();
    projection.metadata.owner_references = Some(vec![owner]);
    Ok(projection)
}
