//! Service binding CRD definitions
//!
//! Custom resources reconciled by the service binding controller.

pub mod references;
pub mod service_binding;
pub mod service_binding_projection;

pub use references::*;
pub use service_binding::*;
pub use service_binding_projection::*;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::{CustomResourceExt, Resource};
    use serde_json::json;

    #[test]
    fn test_type_identifiers() {
        assert_eq!(ServiceBinding::api_version(&()), "service.binding/v1alpha2");
        assert_eq!(ServiceBinding::plural(&()), "servicebindings");
        assert_eq!(
            ServiceBindingProjection::api_version(&()),
            "internal.service.binding/v1alpha2"
        );
        assert_eq!(ServiceBinding::crd_name(), "servicebindings.service.binding");
    }

    #[test]
    fn test_service_binding_from_manifest() {
        let binding: ServiceBinding = serde_json::from_value(json!({
            "apiVersion": "service.binding/v1alpha2",
            "kind": "ServiceBinding",
            "metadata": { "name": "account-db", "namespace": "apps" },
            "spec": {
                "type": "mysql",
                "application": {
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "name": "accounts"
                },
                "service": {
                    "apiVersion": "v1",
                    "kind": "Secret",
                    "name": "account-db-credentials"
                },
                "env": [{ "name": "DB_USER", "key": "username" }]
            }
        }))
        .unwrap();

        assert_eq!(binding.binding_name(), "account-db");
        assert_eq!(binding.spec.r#type.as_deref(), Some("mysql"));
        assert_eq!(binding.spec.application.name.as_deref(), Some("accounts"));
        assert_eq!(binding.spec.env[0].key, "username");
        assert!(binding.status.is_none());
    }
}
