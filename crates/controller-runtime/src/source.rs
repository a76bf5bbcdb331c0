//! Watch sources.
//!
//! A source turns a stream of cluster events into keys on a controller's work
//! queue. The queue deduplicates, so sources enqueue on every event and never
//! track what is already pending.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::ObjectKey;
use crate::workqueue::WorkQueue;

/// Feeds keys into a controller's queue until stopped
#[async_trait]
pub trait Source: Send + Sync {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Enqueue keys until `stop` is cancelled
    async fn run(&self, queue: WorkQueue<ObjectKey>, stop: CancellationToken);
}

type KeyMapper<K> = Arc<dyn Fn(&K) -> Vec<ObjectKey> + Send + Sync>;

/// Watches one resource type and enqueues keys for every applied or deleted object
pub struct KubeSource<K> {
    api: Api<K>,
    config: watcher::Config,
    mapper: KeyMapper<K>,
}

impl<K> KubeSource<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Enqueue the key of each watched object
    #[must_use]
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            config: watcher::Config::default(),
            mapper: Arc::new(|obj: &K| vec![ObjectKey::from_resource(obj)]),
        }
    }

    /// Enqueue the keys `mapper` derives from each watched object, e.g. its owners
    #[must_use]
    pub fn mapped<F>(api: Api<K>, mapper: F) -> Self
    where
        F: Fn(&K) -> Vec<ObjectKey> + Send + Sync + 'static,
    {
        Self {
            api,
            config: watcher::Config::default(),
            mapper: Arc::new(mapper),
        }
    }

    /// Override the watcher configuration (label/field selectors, timeouts)
    #[must_use]
    pub fn with_config(mut self, config: watcher::Config) -> Self {
        self.config = config;
        self
    }

    fn enqueue(&self, obj: &K, queue: &WorkQueue<ObjectKey>) {
        for key in (self.mapper)(obj) {
            if key.name.is_empty() {
                continue;
            }
            queue.add(key);
        }
    }
}

#[async_trait]
impl<K> Source for KubeSource<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn describe(&self) -> String {
        format!("watch {}", K::kind(&()))
    }

    async fn run(&self, queue: WorkQueue<ObjectKey>, stop: CancellationToken) {
        let kind = K::kind(&());
        info!(queue = %queue.name(), kind = %kind, "Starting watch");

        let stream = watcher(self.api.clone(), self.config.clone()).default_backoff();
        futures::pin_mut!(stream);

        loop {
            let next = tokio::select! {
                () = stop.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj))) => {
                    debug!(kind = %kind, name = %obj.name_any(), "Object applied");
                    self.enqueue(&obj, &queue);
                }
                Some(Ok(watcher::Event::Delete(obj))) => {
                    debug!(kind = %kind, name = %obj.name_any(), "Object deleted");
                    self.enqueue(&obj, &queue);
                }
                Some(Ok(watcher::Event::Init)) => {
                    debug!(kind = %kind, "Watch initializing");
                }
                Some(Ok(watcher::Event::InitDone)) => {
                    info!(kind = %kind, "Watch initialization complete");
                }
                Some(Err(e)) => {
                    warn!(kind = %kind, error = %e, "Watch stream error, backing off");
                }
                None => break,
            }
        }

        info!(queue = %queue.name(), kind = %kind, "Watch stopped");
    }
}

/// Keys of the owners of `obj` whose kind is `kind`, in `obj`'s namespace
pub fn owners_of_kind<K: Resource>(obj: &K, kind: &str) -> Vec<ObjectKey> {
    let namespace = obj.meta().namespace.clone();
    obj.meta()
        .owner_references
        .iter()
        .flatten()
        .filter(|owner| owner.kind == kind)
        .map(|owner| ObjectKey::new(namespace.clone(), owner.name.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn owner(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "service.binding/v1alpha2".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            ..Default::default()
        }
    }

    #[test]
    fn test_owners_of_kind_filters_and_keeps_namespace() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("projected".to_string()),
                namespace: Some("apps".to_string()),
                owner_references: Some(vec![
                    owner("ServiceBinding", "db"),
                    owner("Deployment", "web"),
                    owner("ServiceBinding", "cache"),
                ]),
                ..Default::default()
            },
            ..Default::default()
        };

        let keys = owners_of_kind(&secret, "ServiceBinding");
        assert_eq!(
            keys,
            vec![
                ObjectKey::new(Some("apps".to_string()), "db"),
                ObjectKey::new(Some("apps".to_string()), "cache"),
            ]
        );
    }

    #[test]
    fn test_owners_of_kind_without_owners() {
        let secret = Secret::default();
        assert!(owners_of_kind(&secret, "ServiceBinding").is_empty());
    }
}
