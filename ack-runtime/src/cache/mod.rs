//! Reflector stores of the account role map and namespace annotations.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::{Api, Client};
use tokio::sync::watch;

mod account;
mod namespace;

pub use account::{ACK_ROLE_ACCOUNT_MAP, AccountCache};
pub use namespace::NamespaceCache;

/// Starts and stops the account and namespace caches together.
pub struct Caches {
    pub accounts: Arc<AccountCache>,
    pub namespaces: Arc<NamespaceCache>,
    controller_namespace: String,
    stop: watch::Sender<bool>,
}

impl Caches {
    pub fn new(controller_namespace: &str) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            accounts: Arc::new(AccountCache::new(controller_namespace)),
            namespaces: Arc::new(NamespaceCache::new(controller_namespace)),
            controller_namespace: controller_namespace.to_string(),
            stop,
        }
    }

    /// Spawn the reflectors feeding both caches.
    pub fn run(&self, client: Client) {
        let config_maps: Api<ConfigMap> =
            Api::namespaced(client.clone(), self.controller_namespace.as_str());
        tokio::spawn(self.accounts.clone().run(config_maps, self.stop.subscribe()));
        let namespaces: Api<Namespace> = Api::all(client);
        tokio::spawn(self.namespaces.clone().run(namespaces, self.stop.subscribe()));
        info!(
            "started caches for {}/{} and namespaces",
            self.controller_namespace, ACK_ROLE_ACCOUNT_MAP
        );
    }

    pub fn stop(&self) {
        // No receivers just means the caches were never started.
        let _ = self.stop.send(true);
    }
}
