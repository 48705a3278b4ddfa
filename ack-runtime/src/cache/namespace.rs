use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use ack_runtime_apis::{ANNOTATION_DEFAULT_REGION, ANNOTATION_OWNER_ACCOUNT_ID};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, ResourceExt};
use kube_runtime::{
    WatchStreamExt,
    reflector::{ObjectRef, Store, reflector, store::Writer},
    watcher,
};
use tokio::sync::watch;

/// Cluster namespaces which never hold custom resources.
const SYSTEM_NAMESPACES: [&str; 2] = ["kube-system", "kube-public"];

/// Namespace name to its ACK annotations, read from a reflector store.
pub struct NamespaceCache {
    ignored: HashSet<String>,
    store: Store<Namespace>,
    /// Handed to the reflector by [`NamespaceCache::run`].
    writer: Mutex<Option<Writer<Namespace>>>,
}

impl NamespaceCache {
    /// `controller_namespace` is ignored together with the system namespaces.
    pub fn new(controller_namespace: &str) -> Self {
        let mut ignored: HashSet<String> = SYSTEM_NAMESPACES.iter().map(|s| s.to_string()).collect();
        ignored.insert(controller_namespace.to_string());
        let writer: Writer<Namespace> = Default::default();
        Self {
            ignored,
            store: writer.as_reader(),
            writer: Mutex::new(Some(writer)),
        }
    }

    fn annotation(&self, namespace: &str, key: &str) -> Option<String> {
        if self.ignored.contains(namespace) {
            return None;
        }
        let ns = self.store.get(&ObjectRef::new(namespace))?;
        ns.annotations().get(key).filter(|v| !v.is_empty()).cloned()
    }

    pub fn get_default_region(&self, namespace: &str) -> Option<String> {
        self.annotation(namespace, ANNOTATION_DEFAULT_REGION)
    }

    pub fn get_owner_account_id(&self, namespace: &str) -> Option<String> {
        self.annotation(namespace, ANNOTATION_OWNER_ACCOUNT_ID)
    }

    /// Apply `event` directly, for caches which are not running.
    #[cfg(test)]
    pub(crate) fn apply(&self, event: watcher::Event<Namespace>) {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(writer) = writer.as_mut() {
            writer.apply_watcher_event(&event);
        }
    }

    /// Feed the cache from a watch on `api` until `stop` fires.
    pub async fn run(self: Arc<Self>, api: Api<Namespace>, mut stop: watch::Receiver<bool>) {
        let Some(writer) = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            warn!("namespace cache is already running");
            return;
        };
        let stream = reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = stream.try_next() => match event {
                    Ok(Some(_)) => (),
                    Ok(None) => break,
                    Err(e) => warn!("namespace cache watch failed: {}", e),
                },
            }
        }
        debug!("namespace cache stopped");
    }
}
