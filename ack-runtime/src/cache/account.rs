use std::sync::{Arc, Mutex};

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use kube_runtime::{
    WatchStreamExt,
    reflector::{ObjectRef, Store, reflector, store::Writer},
    watcher,
};
use tokio::sync::watch;

/// Name of the ConfigMap mapping account IDs to role ARNs.
pub const ACK_ROLE_ACCOUNT_MAP: &str = "ack-role-account-map";

/// Account ID to role ARN, read from the `ack-role-account-map` ConfigMap
/// in the controller namespace.
pub struct AccountCache {
    key: ObjectRef<ConfigMap>,
    store: Store<ConfigMap>,
    writer: Mutex<Option<Writer<ConfigMap>>>,
}

impl AccountCache {
    pub fn new(controller_namespace: &str) -> Self {
        let writer: Writer<ConfigMap> = Default::default();
        Self {
            key: ObjectRef::new(ACK_ROLE_ACCOUNT_MAP).within(controller_namespace),
            store: writer.as_reader(),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Role ARN to assume for `account_id`, if one is mapped.
    pub fn get_account_role_arn(&self, account_id: &str) -> Option<String> {
        let cm = self.store.get(&self.key)?;
        cm.data
            .as_ref()?
            .get(account_id)
            .filter(|v| !v.is_empty())
            .cloned()
    }

    #[cfg(test)]
    pub(crate) fn apply(&self, event: watcher::Event<ConfigMap>) {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(writer) = writer.as_mut() {
            writer.apply_watcher_event(&event);
        }
    }

    /// Feed the cache from a watch on `api` until `stop` fires.
    pub async fn run(self: Arc<Self>, api: Api<ConfigMap>, mut stop: watch::Receiver<bool>) {
        let Some(writer) = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            warn!("account cache is already running");
            return;
        };
        let config = watcher::Config::default().fields(&format!("metadata.name={}", ACK_ROLE_ACCOUNT_MAP));
        let stream = reflector(writer, watcher(api, config).default_backoff());
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = stream.try_next() => match event {
                    Ok(Some(watcher::Event::Apply(_))) => debug!("{} changed", ACK_ROLE_ACCOUNT_MAP),
                    Ok(Some(watcher::Event::Delete(_))) => debug!("{} deleted", ACK_ROLE_ACCOUNT_MAP),
                    Ok(Some(_)) => (),
                    Ok(None) => break,
                    Err(e) => warn!("account cache watch failed: {}", e),
                },
            }
        }
        debug!("account cache stopped");
    }
}
