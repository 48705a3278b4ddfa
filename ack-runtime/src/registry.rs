use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use futures::{FutureExt, future::BoxFuture};
use kube::{Api, Client};

use crate::{
    adoption::Adopter,
    config::Config,
    reconciler::{Reconciler, RuntimeContext},
    store::KubeObjectStore,
    types::{AwsResource, AwsResourceManagerFactory, GroupKind, KubeObject},
};

/// `Api` for all namespaces, or only the watched one if configured.
pub(crate) fn watched_api<K: KubeObject>(client: &Client, config: &Config) -> Api<K> {
    match &config.watch_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns.as_str()),
        None => Api::all(client.clone()),
    }
}

/// A controller ready to be driven, plus the adopter of its kind.
pub struct BoundKind {
    pub controller: BoxFuture<'static, ()>,
    pub adopter: Arc<dyn Adopter>,
}

/// A registered kind with its resource type erased.
pub trait ResourceKind: Send + Sync {
    fn group_kind(&self) -> GroupKind;

    /// Build the reconciler of this kind.
    fn bind(&self, client: &Client, runtime: &RuntimeContext) -> BoundKind;
}

struct KindRegistration<R: AwsResource> {
    factory: Arc<dyn AwsResourceManagerFactory<R>>,
}

impl<R: AwsResource> ResourceKind for KindRegistration<R> {
    fn group_kind(&self) -> GroupKind {
        self.factory.resource_descriptor().group_kind()
    }

    fn bind(&self, client: &Client, runtime: &RuntimeContext) -> BoundKind {
        let store = Arc::new(KubeObjectStore::<R>::new(client.clone()));
        let reconciler = Arc::new(Reconciler::<R>::new(self.factory.clone(), store, runtime.clone()));
        let api = watched_api::<R>(client, &runtime.config);
        BoundKind {
            controller: reconciler.clone().start(api).boxed(),
            adopter: reconciler,
        }
    }
}

/// Resource manager factories of a service, keyed by `Kind.group`.
#[derive(Default)]
pub struct Registry {
    kinds: RwLock<BTreeMap<String, Arc<dyn ResourceKind>>>,
}

impl Registry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register the factory of kind `R`, replacing an earlier registration.
    pub fn register_resource_manager_factory<R: AwsResource>(
        &self,
        factory: Arc<dyn AwsResourceManagerFactory<R>>,
    ) {
        let kind: Arc<dyn ResourceKind> = Arc::new(KindRegistration { factory });
        let key = kind.group_kind().to_string();
        let mut kinds = self.kinds.write().unwrap_or_else(|e| e.into_inner());
        if kinds.insert(key.clone(), kind).is_some() {
            warn!("replaced resource manager factory of {}", key);
        }
    }

    /// All registered kinds, ordered by `Kind.group`.
    pub fn get_resource_manager_factories(&self) -> Vec<Arc<dyn ResourceKind>> {
        let kinds = self.kinds.read().unwrap_or_else(|e| e.into_inner());
        kinds.values().cloned().collect()
    }

    pub fn get(&self, group_kind: &str) -> Option<Arc<dyn ResourceKind>> {
        let kinds = self.kinds.read().unwrap_or_else(|e| e.into_inner());
        kinds.get(group_kind).cloned()
    }
}
