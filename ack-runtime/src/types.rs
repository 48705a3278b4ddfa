//! The contract between the generic reconciler and the per-kind
//! implementations.

use std::{
    collections::HashMap,
    fmt::{self, Debug},
    sync::{Arc, RwLock},
};

use ack_runtime_apis::{
    AckStatus, AwsAccountId, AwsIdentifiers, AwsRegion, Condition, ResourceMetadata,
};
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, api::DynamicObject};
use serde::{Serialize, de::DeserializeOwned};

use crate::{compare::Reporter, errors::ControllerError, session::Session};

/// Namespaced Kubernetes object with a static type.
pub trait KubeObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> KubeObject for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Kubernetes `GroupKind`, its string form `Kind.group` is the registry key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self {
            group: K::group(&()).to_string(),
            kind: K::kind(&()).to_string(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// A custom resource managed by a controller.
///
/// The custom resource type itself is the runtime object, the
/// [`kube::Resource`] super trait provides access to its metadata.
pub trait AwsResource: KubeObject {
    type Spec: Clone + Debug + Default + Serialize + Send + Sync;
    type Status: AckStatus + Clone + Debug + Serialize + Send + Sync;

    fn spec(&self) -> &Self::Spec;

    fn spec_mut(&mut self) -> &mut Self::Spec;

    fn status(&self) -> Option<&Self::Status>;

    /// Mutable status, initialized with its default if absent.
    fn status_mut(&mut self) -> &mut Self::Status;

    /// Populate the spec fields which identify the backend resource.
    fn set_identifiers(&mut self, identifiers: &AwsIdentifiers) -> Result<(), ControllerError>;

    /// Owner account recorded in the status, if any.
    fn account_id(&self) -> Option<AwsAccountId> {
        self.status()
            .and_then(|s| s.ack_resource_metadata())
            .and_then(|m| m.owner_account_id.clone())
            .filter(|a| !a.as_str().is_empty())
    }

    fn arn(&self) -> Option<&str> {
        self.status()
            .and_then(|s| s.ack_resource_metadata())
            .and_then(|m| m.arn.as_deref())
    }

    fn is_being_deleted(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn conditions(&self) -> &[Condition] {
        self.status().map(|s| s.conditions()).unwrap_or(&[])
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        self.status_mut().conditions_mut()
    }

    fn resource_metadata_mut(&mut self) -> &mut ResourceMetadata {
        self.status_mut().ack_resource_metadata_mut()
    }
}

/// Kind level operations which do not need a backend.
pub trait AwsResourceDescriptor<R: AwsResource>: Send + Sync {
    fn group_kind(&self) -> GroupKind;

    /// Zero value prototype used to deserialize objects of this kind.
    fn empty_object(&self) -> DynamicObject;

    /// Convert an untyped object of this kind.
    fn resource_from_object(&self, obj: DynamicObject) -> Result<R, ControllerError>;

    /// Whether the specs of `a` and `b` are equal, absent and empty values
    /// are considered equal.
    fn equal(&self, a: &R, b: &R) -> Result<bool, ControllerError>;

    /// Differences between the specs of `a` and `b`.
    fn diff(&self, a: &R, b: &R) -> Result<Reporter, ControllerError>;

    /// Mark `res` as materialized from an existing backend resource.
    fn mark_adopted(&self, res: &mut R);

    fn is_managed(&self, res: &R) -> bool;

    /// Add the finalizer of this kind.
    fn mark_managed(&self, res: &mut R);

    /// Remove the finalizer of this kind.
    fn mark_unmanaged(&self, res: &mut R);

    /// Normalize the status of `res`, returns whether anything changed.
    fn update_cr_status(&self, res: &mut R) -> Result<bool, ControllerError>;
}

/// CRUD operations against the backend, bound to one account and region.
#[async_trait]
pub trait AwsResourceManager<R: AwsResource>: Send + Sync {
    /// Observe the backend resource matching `res`.
    ///
    /// Returns [`ControllerError::NotFound`] if there is none.
    async fn read_one(&self, res: &R) -> Result<R, ControllerError>;

    async fn create(&self, res: &R) -> Result<R, ControllerError>;

    /// Update the backend resource. `diff` holds the differences between
    /// `desired` and `latest`.
    async fn update(&self, desired: &R, latest: &R, diff: &Reporter) -> Result<R, ControllerError>;

    async fn delete(&self, res: &R) -> Result<(), ControllerError>;

    /// ARN of the backend resource with the given name.
    fn arn_from_name(&self, name: &str) -> String;
}

/// Creates resource managers for one kind.
pub trait AwsResourceManagerFactory<R: AwsResource>: Send + Sync {
    fn resource_descriptor(&self) -> Arc<dyn AwsResourceDescriptor<R>>;

    /// Resource manager for the account and region, constructed once per pair.
    fn manager_for(
        &self,
        session: &Session,
        account_id: &AwsAccountId,
        region: &AwsRegion,
    ) -> Result<Arc<dyn AwsResourceManager<R>>, ControllerError>;
}

type ManagerKey = (AwsAccountId, AwsRegion);

/// Per account and region memo of resource managers.
pub struct ManagerCache<R> {
    managers: RwLock<HashMap<ManagerKey, Arc<dyn AwsResourceManager<R>>>>,
}

impl<R> Default for ManagerCache<R> {
    fn default() -> Self {
        Self {
            managers: Default::default(),
        }
    }
}

impl<R: AwsResource> ManagerCache<R> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Return the cached manager or insert the one built by `build`.
    pub fn get_or_try_insert<F>(
        &self,
        account_id: &AwsAccountId,
        region: &AwsRegion,
        build: F,
    ) -> Result<Arc<dyn AwsResourceManager<R>>, ControllerError>
    where
        F: FnOnce() -> Result<Arc<dyn AwsResourceManager<R>>, ControllerError>,
    {
        let key = (account_id.clone(), region.clone());
        {
            let managers = self
                .managers
                .read()
                .map_err(|_| ControllerError::invariant("resource manager cache lock poisoned"))?;
            if let Some(rm) = managers.get(&key) {
                return Ok(rm.clone());
            }
        }
        let mut managers = self
            .managers
            .write()
            .map_err(|_| ControllerError::invariant("resource manager cache lock poisoned"))?;
        // Another task may have won the race for the write lock.
        if let Some(rm) = managers.get(&key) {
            return Ok(rm.clone());
        }
        let rm = build()?;
        debug!("constructed resource manager for account {} in {}", key.0, key.1);
        managers.insert(key, rm.clone());
        Ok(rm)
    }

    pub fn len(&self) -> usize {
        self.managers.read().map(|m| m.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NoopManager;
    use ack_runtime_apis::bookstore::Book;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn group_kind_string() {
        assert_eq!(
            "Book.bookstore.services.k8s.aws",
            GroupKind::of::<Book>().to_string()
        );
        let core = GroupKind {
            group: "".to_string(),
            kind: "ConfigMap".to_string(),
        };
        assert_eq!("ConfigMap", core.to_string());
    }

    #[test]
    fn manager_cache_builds_once_per_account_region() {
        let cache: ManagerCache<Book> = ManagerCache::new();
        let built = AtomicUsize::new(0);
        let build = || -> Result<Arc<dyn AwsResourceManager<Book>>, ControllerError> {
            built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopManager))
        };
        let account: AwsAccountId = "012345678912".into();
        let west: AwsRegion = "us-west-2".into();
        let east: AwsRegion = "us-east-1".into();
        let a = cache.get_or_try_insert(&account, &west, build).unwrap();
        let b = cache.get_or_try_insert(&account, &west, build).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        cache.get_or_try_insert(&account, &east, build).unwrap();
        assert_eq!(2, built.load(Ordering::SeqCst));
        assert_eq!(2, cache.len());
    }

    #[test]
    fn manager_cache_does_not_store_failures() {
        let cache: ManagerCache<Book> = ManagerCache::new();
        let account: AwsAccountId = "012345678912".into();
        let region: AwsRegion = "us-west-2".into();
        let r = cache.get_or_try_insert(&account, &region, || {
            Err(ControllerError::Config("no credentials".to_string()))
        });
        assert!(r.is_err());
        assert_eq!(0, cache.len());
    }
}
