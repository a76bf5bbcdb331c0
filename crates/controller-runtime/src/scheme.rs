//! Scheme registry.
//!
//! Maps a (group, version, kind) identifier to the typed shape of an API object
//! and the codec used to move between raw bytes and a uniform
//! [`DynamicObject`]. Generic machinery decodes any registered kind through
//! [`SchemeRegistry::decode`] without knowing the concrete Rust type.
//!
//! The registry is populated during initialization and shared read-only once
//! the [`Manager`](crate::Manager) starts. Read-only access is enforced by
//! ownership: the manager keeps it in an `Arc` and only hands out `&mut` while
//! it is the sole owner and has not started.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RuntimeError;

/// Converts between raw bytes and a [`DynamicObject`] for one registered kind.
pub trait Codec: Send + Sync {
    /// Decode a serialized object, validating it against the typed shape.
    fn decode(&self, data: &[u8]) -> Result<DynamicObject, RuntimeError>;

    /// Encode an object, validating it against the typed shape.
    fn encode(&self, object: &DynamicObject) -> Result<Vec<u8>, RuntimeError>;
}

/// JSON codec backed by a concrete `serde` type.
///
/// Every conversion round-trips through `K`, so payloads that do not match the
/// typed shape are rejected.
pub struct JsonCodec<K> {
    kind: String,
    _marker: PhantomData<fn() -> K>,
}

impl<K> JsonCodec<K>
where
    K: Resource<DynamicType = ()>,
{
    /// Create a codec for `K`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kind: format!("{}/{}", K::api_version(&()), K::kind(&())),
            _marker: PhantomData,
        }
    }
}

impl<K> Default for JsonCodec<K>
where
    K: Resource<DynamicType = ()>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for JsonCodec<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCodec").field("kind", &self.kind).finish()
    }
}

impl<K> Codec for JsonCodec<K>
where
    K: Serialize + DeserializeOwned,
{
    fn decode(&self, data: &[u8]) -> Result<DynamicObject, RuntimeError> {
        let typed: K =
            serde_json::from_slice(data).map_err(|e| RuntimeError::codec(&self.kind, e))?;
        let value = serde_json::to_value(&typed).map_err(|e| RuntimeError::codec(&self.kind, e))?;
        serde_json::from_value(value).map_err(|e| RuntimeError::codec(&self.kind, e))
    }

    fn encode(&self, object: &DynamicObject) -> Result<Vec<u8>, RuntimeError> {
        let value = serde_json::to_value(object).map_err(|e| RuntimeError::codec(&self.kind, e))?;
        let typed: K =
            serde_json::from_value(value).map_err(|e| RuntimeError::codec(&self.kind, e))?;
        serde_json::to_vec(&typed).map_err(|e| RuntimeError::codec(&self.kind, e))
    }
}

/// A registered kind: its identifier, shape and codec.
#[derive(Clone)]
pub struct TypeRegistration {
    gvk: GroupVersionKind,
    resource: ApiResource,
    codec: Arc<dyn Codec>,
}

impl TypeRegistration {
    /// Identifier of the kind
    #[must_use]
    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    /// Shape descriptor (group, version, kind, plural)
    #[must_use]
    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    /// Codec for this kind
    #[must_use]
    pub fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }
}

impl fmt::Debug for TypeRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistration")
            .field("gvk", &describe(&self.gvk))
            .field("plural", &self.resource.plural)
            .finish_non_exhaustive()
    }
}

/// Registry of API object kinds known to this process.
#[derive(Default, Clone)]
pub struct SchemeRegistry {
    types: HashMap<GroupVersionKind, TypeRegistration>,
}

impl SchemeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind with an explicit shape and codec.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::DuplicateType`] if the identifier is already present.
    pub fn register(
        &mut self,
        gvk: GroupVersionKind,
        resource: ApiResource,
        codec: Arc<dyn Codec>,
    ) -> Result<(), RuntimeError> {
        if self.types.contains_key(&gvk) {
            return Err(RuntimeError::DuplicateType(describe(&gvk)));
        }
        self.types.insert(
            gvk.clone(),
            TypeRegistration {
                gvk,
                resource,
                codec,
            },
        );
        Ok(())
    }

    /// Register a typed kind, deriving its identifier, shape and JSON codec.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::DuplicateType`] if the kind is already present.
    pub fn register_type<K>(&mut self) -> Result<(), RuntimeError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + 'static,
    {
        let resource = ApiResource::erase::<K>(&());
        let gvk = GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind);
        self.register(gvk, resource, Arc::new(JsonCodec::<K>::new()))
    }

    /// Look up a registered kind.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::UnknownType`] if the identifier is not registered.
    pub fn lookup(&self, gvk: &GroupVersionKind) -> Result<&TypeRegistration, RuntimeError> {
        self.types
            .get(gvk)
            .ok_or_else(|| RuntimeError::UnknownType(describe(gvk)))
    }

    /// Whether the identifier is registered
    #[must_use]
    pub fn contains(&self, gvk: &GroupVersionKind) -> bool {
        self.types.contains_key(gvk)
    }

    /// Number of registered kinds
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no kinds are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Iterate over registered identifiers
    pub fn kinds(&self) -> impl Iterator<Item = &GroupVersionKind> {
        self.types.keys()
    }

    /// Decode any registered object from its serialized form.
    ///
    /// The kind is read from the payload's `apiVersion` and `kind` fields.
    ///
    /// # Errors
    ///
    /// Fails if the payload carries no type meta, the kind is not registered,
    /// or the payload does not match the registered shape.
    pub fn decode(&self, data: &[u8]) -> Result<DynamicObject, RuntimeError> {
        let types: TypeMeta =
            serde_json::from_slice(data).map_err(|e| RuntimeError::codec("<unknown>", e))?;
        let gvk = gvk_from_type_meta(&types);
        self.lookup(&gvk)?.codec.decode(data)
    }

    /// Encode a registered object.
    ///
    /// # Errors
    ///
    /// Fails if the object carries no type meta, the kind is not registered,
    /// or the object does not match the registered shape.
    pub fn encode(&self, object: &DynamicObject) -> Result<Vec<u8>, RuntimeError> {
        let types = object
            .types
            .as_ref()
            .ok_or_else(|| RuntimeError::codec("<unknown>", "object has no apiVersion/kind"))?;
        let gvk = gvk_from_type_meta(types);
        self.lookup(&gvk)?.codec.encode(object)
    }
}

impl fmt::Debug for SchemeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.types.keys().map(describe).collect();
        kinds.sort();
        f.debug_struct("SchemeRegistry").field("kinds", &kinds).finish()
    }
}

/// Register the built-in kinds the runtime itself works with.
///
/// # Errors
///
/// Returns [`RuntimeError::DuplicateType`] if any of them is already registered.
pub fn register_core_types(scheme: &mut SchemeRegistry) -> Result<(), RuntimeError> {
    scheme.register_type::<Lease>()?;
    scheme.register_type::<Pod>()?;
    scheme.register_type::<Service>()?;
    scheme.register_type::<Secret>()?;
    scheme.register_type::<ConfigMap>()?;
    scheme.register_type::<Deployment>()?;
    Ok(())
}

/// Split `apiVersion` into group and version; the core group has no prefix.
fn gvk_from_type_meta(types: &TypeMeta) -> GroupVersionKind {
    let (group, version) = types
        .api_version
        .split_once('/')
        .unwrap_or(("", types.api_version.as_str()));
    GroupVersionKind::gvk(group, version, &types.kind)
}

/// Render an identifier as `group/version, Kind=kind`.
pub(crate) fn describe(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}, Kind={}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind)
    }
}
