//! Access to custom resources in the cluster.

use std::marker::PhantomData;

use async_trait::async_trait;
use json_patch::diff;
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams, PostParams},
};
use serde_json::Value;

use crate::{MANAGER, errors::ControllerError, types::KubeObject};

/// The cluster operations the reconcilers need.
///
/// Patches are computed from the difference between `original` and
/// `modified`, so only fields changed by the controller are sent.
#[async_trait]
pub trait ObjectStore<K: KubeObject>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ControllerError>;

    async fn create(&self, obj: &K) -> Result<K, ControllerError>;

    /// Patch metadata and spec.
    async fn patch(&self, original: &K, modified: &K) -> Result<K, ControllerError>;

    /// Patch the status sub-resource.
    async fn patch_status(&self, original: &K, modified: &K) -> Result<K, ControllerError>;
}

/// Split `obj` into the part without status and its status.
pub(crate) fn split_status<K: KubeObject>(obj: &K) -> Result<(Value, Value), ControllerError> {
    let mut value = serde_json::to_value(obj)?;
    let status = value
        .as_object_mut()
        .and_then(|m| m.remove("status"))
        .unwrap_or(Value::Null);
    Ok((value, status))
}

/// [`ObjectStore`] backed by the Kubernetes API.
pub struct KubeObjectStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K: KubeObject> KubeObjectStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn namespace_of(obj: &K) -> Result<String, ControllerError> {
        obj.namespace()
            .ok_or_else(|| ControllerError::invariant(format!("{} has no namespace", obj.name_any())))
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl<K: KubeObject> ObjectStore<K> for KubeObjectStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ControllerError> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn create(&self, obj: &K) -> Result<K, ControllerError> {
        let namespace = Self::namespace_of(obj)?;
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        Ok(self.api(&namespace).create(&pp, obj).await?)
    }

    async fn patch(&self, original: &K, modified: &K) -> Result<K, ControllerError> {
        let (original_value, _) = split_status(original)?;
        let (modified_value, _) = split_status(modified)?;
        // Use JSON Patch as server-side apply would not remove finalizers owned by other managers.
        let patch = diff(&original_value, &modified_value);
        if patch.0.is_empty() {
            return Ok(modified.clone());
        }
        let namespace = Self::namespace_of(modified)?;
        let patched = self
            .api(&namespace)
            .patch(
                modified.name_any().as_str(),
                &Self::patch_params(),
                &Patch::<K>::Json(patch),
            )
            .await?;
        Ok(patched)
    }

    async fn patch_status(&self, original: &K, modified: &K) -> Result<K, ControllerError> {
        let (_, original_status) = split_status(original)?;
        let (_, modified_status) = split_status(modified)?;
        if original_status == modified_status {
            return Ok(modified.clone());
        }
        let namespace = Self::namespace_of(modified)?;
        let api = self.api(&namespace);
        let name = modified.name_any();
        let patched = if original_status.is_null() {
            // JSON Patch cannot replace a status the server does not have yet.
            let status = serde_json::json!({ "status": modified_status });
            api.patch_status(&name, &Self::patch_params(), &Patch::Merge(status))
                .await?
        } else {
            let patch = diff(
                &serde_json::json!({ "status": original_status }),
                &serde_json::json!({ "status": modified_status }),
            );
            api.patch_status(&name, &Self::patch_params(), &Patch::<K>::Json(patch))
                .await?
        };
        Ok(patched)
    }
}
