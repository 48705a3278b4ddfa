use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use ack_runtime_apis::AdoptedResource;
use futures::{FutureExt, future::join_all};
use kube::Client;

use crate::{
    adoption::AdoptionReconciler,
    errors::ControllerError,
    reconciler::RuntimeContext,
    registry::{Registry, watched_api},
    store::KubeObjectStore,
};

/// All controllers of one backend service.
pub struct ServiceController {
    service_alias: String,
    service_api_group: String,
    registry: Arc<Registry>,
    bound: AtomicBool,
}

impl ServiceController {
    pub fn new(service_alias: &str, service_api_group: &str, registry: Arc<Registry>) -> Self {
        Self {
            service_alias: service_alias.to_string(),
            service_api_group: service_api_group.to_string(),
            registry,
            bound: AtomicBool::new(false),
        }
    }

    pub fn service_alias(&self) -> &str {
        &self.service_alias
    }

    pub fn service_api_group(&self) -> &str {
        &self.service_api_group
    }

    /// Build one controller per registered kind plus the adoption controller.
    ///
    /// The returned future drives all of them, it can only be obtained once.
    pub fn bind_controller_manager(
        &self,
        client: Client,
        runtime: RuntimeContext,
    ) -> Result<impl Future<Output = ()> + Send + 'static, ControllerError> {
        if self.bound.swap(true, Ordering::SeqCst) {
            return Err(ControllerError::AlreadyBound);
        }
        let kinds = self.registry.get_resource_manager_factories();
        if kinds.is_empty() {
            warn!("no resource manager factories registered for {}", self.service_alias);
        }
        let mut controllers = Vec::with_capacity(kinds.len() + 1);
        let mut adopters = Vec::with_capacity(kinds.len());
        for kind in kinds {
            info!("binding controller for {}", kind.group_kind());
            let bound = kind.bind(&client, &runtime);
            controllers.push(bound.controller);
            adopters.push(bound.adopter);
        }
        let store = Arc::new(KubeObjectStore::<AdoptedResource>::new(client.clone()));
        let api = watched_api::<AdoptedResource>(&client, &runtime.config);
        let adoption = Arc::new(AdoptionReconciler::new(store, adopters, runtime));
        controllers.push(adoption.start(api).boxed());
        info!(
            "bound {} controllers of {} ({})",
            controllers.len(),
            self.service_alias,
            self.service_api_group
        );
        Ok(join_all(controllers).map(|_| ()))
    }
}
