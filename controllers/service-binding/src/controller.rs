//! Controller wiring.
//!
//! Watches `ServiceBinding` resources and the projections they own, feeding
//! both into one work queue keyed by binding.

use controller_runtime::{owners_of_kind, Controller, KubeSource, RuntimeError};
use crds::{ServiceBinding, ServiceBindingProjection};
use kube::{Api, Client};
use tracing::info;

use crate::reconciler::BindingReconciler;

/// Controller name, also used for metrics labels and log fields
pub const CONTROLLER_NAME: &str = "servicebinding";

/// Build the ServiceBinding controller.
pub fn build(
    client: Client,
    namespace: Option<&str>,
    concurrency: usize,
) -> Result<Controller, RuntimeError> {
    info!(
        namespace = namespace.unwrap_or("all namespaces"),
        concurrency, "Initializing ServiceBinding controller"
    );

    let bindings: Api<ServiceBinding> = api(&client, namespace);
    let projections: Api<ServiceBindingProjection> = api(&client, namespace);

    Controller::builder(CONTROLLER_NAME, BindingReconciler::new(client))
        .watches(KubeSource::new(bindings))
        .watches(KubeSource::mapped(projections, |projection: &ServiceBindingProjection| {
            owners_of_kind(projection, "ServiceBinding")
        }))
        .concurrency(concurrency)
        .build()
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}
