//! Fakes shared by the unit tests.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use ack_runtime_apis::{
    AckStatus, AwsAccountId, AwsRegion,
    bookstore::{Book, BookSpec},
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Client, Resource, api::ObjectMeta};
use serde_json::Value;

use crate::{
    cache::Caches,
    compare::Reporter,
    config::{Config, test_config},
    descriptor::ResourceDescriptor,
    errors::ControllerError,
    metrics::Metrics,
    reconciler::RuntimeContext,
    session::Session,
    store::{ObjectStore, split_status},
    types::{AwsResource, AwsResourceDescriptor, AwsResourceManager, AwsResourceManagerFactory, KubeObject},
};

pub(crate) fn book(name: &str, title: &str, author: &str) -> Book {
    let mut b = Book::new(
        name,
        BookSpec {
            title: Some(title.to_string()),
            author: Some(author.to_string()),
            ..Default::default()
        },
    );
    b.metadata.namespace = Some("default".to_string());
    b.metadata.generation = Some(1);
    b
}

pub(crate) fn namespace(name: &str, annotations: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn runtime_with(config: Config) -> RuntimeContext {
    RuntimeContext {
        caches: Arc::new(Caches::new(config.controller_namespace.as_str())),
        config: Arc::new(config),
        metrics: Arc::new(Metrics::new()),
    }
}

pub(crate) fn runtime() -> RuntimeContext {
    runtime_with(test_config())
}

/// Client for a cluster which is never contacted. Needs a tokio runtime.
pub(crate) fn offline_client() -> Client {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let config = kube::Config::new("http://127.0.0.1:6443".parse().unwrap());
    Client::try_from(config).unwrap()
}

/// Factory handing out [`NoopManager`]s.
pub(crate) struct NoopFactory;

impl<R: AwsResource> AwsResourceManagerFactory<R> for NoopFactory {
    fn resource_descriptor(&self) -> Arc<dyn AwsResourceDescriptor<R>> {
        Arc::new(ResourceDescriptor::<R>::new())
    }

    fn manager_for(
        &self,
        _session: &Session,
        _account_id: &AwsAccountId,
        _region: &AwsRegion,
    ) -> Result<Arc<dyn AwsResourceManager<R>>, ControllerError> {
        Ok(Arc::new(NoopManager))
    }
}

/// In-memory [`ObjectStore`] recording every write.
pub(crate) struct MemoryStore<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    writes: Mutex<Vec<&'static str>>,
}

impl<K: KubeObject> MemoryStore<K> {
    pub fn new() -> Self {
        Self {
            objects: Default::default(),
            writes: Default::default(),
        }
    }

    fn key(obj: &K) -> (String, String) {
        let meta = obj.meta();
        (
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    pub fn insert(&self, mut obj: K) {
        if obj.meta().resource_version.is_none() {
            obj.meta_mut().resource_version = Some("1".to_string());
        }
        self.objects.lock().unwrap().insert(Self::key(&obj), obj);
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Replace the spec of the stored object and bump its generation.
    pub fn edit<F: FnOnce(&mut K)>(&self, namespace: &str, name: &str, f: F) {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .unwrap();
        f(obj);
        let generation = obj.meta().generation.unwrap_or(1);
        obj.meta_mut().generation = Some(generation + 1);
    }

    pub fn writes(&self) -> Vec<&'static str> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    fn bump(obj: &mut K) {
        let rv: u64 = obj
            .meta()
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        obj.meta_mut().resource_version = Some((rv + 1).to_string());
    }
}

fn with_status<K: KubeObject>(mut value: Value, status: Value) -> Result<K, ControllerError> {
    if let Some(map) = value.as_object_mut() {
        if !status.is_null() {
            map.insert("status".to_string(), status);
        }
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl<K: KubeObject> ObjectStore<K> for MemoryStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ControllerError> {
        Ok(self.object(namespace, name))
    }

    async fn create(&self, obj: &K) -> Result<K, ControllerError> {
        self.writes.lock().unwrap().push("create");
        let key = Self::key(obj);
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(ControllerError::Any(anyhow::anyhow!("{}/{} already exists", key.0, key.1)));
        }
        // Status is a sub-resource and dropped on create.
        let (value, _) = split_status(obj)?;
        let mut created: K = with_status(value, Value::Null)?;
        created.meta_mut().resource_version = Some("1".to_string());
        created.meta_mut().generation = Some(1);
        objects.insert(key, created.clone());
        Ok(created)
    }

    async fn patch(&self, _original: &K, modified: &K) -> Result<K, ControllerError> {
        self.writes.lock().unwrap().push("patch");
        let key = Self::key(modified);
        let mut objects = self.objects.lock().unwrap();
        let stored = objects.get(&key).ok_or(ControllerError::NotFound)?;
        let (_, status) = split_status(stored)?;
        let (value, _) = split_status(modified)?;
        let mut patched: K = with_status(value, status)?;
        patched.meta_mut().generation = stored.meta().generation;
        Self::bump(&mut patched);
        objects.insert(key, patched.clone());
        Ok(patched)
    }

    async fn patch_status(&self, _original: &K, modified: &K) -> Result<K, ControllerError> {
        self.writes.lock().unwrap().push("patch_status");
        let key = Self::key(modified);
        let mut objects = self.objects.lock().unwrap();
        let stored = objects.get(&key).ok_or(ControllerError::NotFound)?;
        let (value, _) = split_status(stored)?;
        let (_, status) = split_status(modified)?;
        let mut patched: K = with_status(value, status)?;
        Self::bump(&mut patched);
        objects.insert(key, patched.clone());
        Ok(patched)
    }
}

/// Resource manager for which every backend resource is missing.
pub(crate) struct NoopManager;

#[async_trait]
impl<R: AwsResource> AwsResourceManager<R> for NoopManager {
    async fn read_one(&self, _res: &R) -> Result<R, ControllerError> {
        Err(ControllerError::NotFound)
    }

    async fn create(&self, res: &R) -> Result<R, ControllerError> {
        Ok(res.clone())
    }

    async fn update(&self, desired: &R, _latest: &R, _diff: &Reporter) -> Result<R, ControllerError> {
        Ok(desired.clone())
    }

    async fn delete(&self, _res: &R) -> Result<(), ControllerError> {
        Ok(())
    }

    fn arn_from_name(&self, name: &str) -> String {
        name.to_string()
    }
}

/// Status conditions of `res` as `(type, status)` pairs.
pub(crate) fn condition_states<R: AwsResource>(res: &R) -> Vec<(String, String)> {
    res.status()
        .map(|s| {
            s.conditions()
                .iter()
                .map(|c| (c.type_.clone(), format!("{:?}", c.status)))
                .collect()
        })
        .unwrap_or_default()
}
