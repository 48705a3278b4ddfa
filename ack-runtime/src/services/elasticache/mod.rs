//! ElastiCache cache parameter groups and replication groups.

use std::sync::Arc;

use ack_runtime_apis::{
    AwsAccountId, AwsIdentifiers, AwsRegion,
    elasticache::{
        CacheParameterGroup, CacheParameterGroupSpec, CacheParameterGroupStatus, ReplicationGroup,
        ReplicationGroupSpec, ReplicationGroupStatus,
    },
};

use crate::{
    descriptor::ResourceDescriptor,
    errors::{BackendError, ControllerError},
    metrics::Metrics,
    registry::Registry,
    session::Session,
    types::{AwsResource, AwsResourceDescriptor, AwsResourceManager, AwsResourceManagerFactory, ManagerCache},
};

mod parameter_group;
mod replication_group;
pub mod sdk;

pub use parameter_group::CacheParameterGroupManager;
pub use replication_group::ReplicationGroupManager;
use sdk::ElastiCacheApi;

pub const SERVICE_ALIAS: &str = "elasticache";
pub const API_GROUP: &str = "elasticache.services.k8s.aws";

/// Builds an ElastiCache client for a session and owner account.
pub type Connect =
    Arc<dyn Fn(&Session, &AwsAccountId) -> Result<Arc<dyn ElastiCacheApi>, ControllerError> + Send + Sync>;

fn identifier(identifiers: &AwsIdentifiers, kind: &str) -> Result<String, ControllerError> {
    identifiers
        .name_or_id
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ControllerError::terminal(format!("nameOrID is required to adopt a {}", kind)))
}

impl AwsResource for CacheParameterGroup {
    type Spec = CacheParameterGroupSpec;
    type Status = CacheParameterGroupStatus;

    fn spec(&self) -> &CacheParameterGroupSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut CacheParameterGroupSpec {
        &mut self.spec
    }

    fn status(&self) -> Option<&CacheParameterGroupStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut CacheParameterGroupStatus {
        self.status.get_or_insert_with(Default::default)
    }

    fn set_identifiers(&mut self, identifiers: &AwsIdentifiers) -> Result<(), ControllerError> {
        self.spec.cache_parameter_group_name = identifier(identifiers, "CacheParameterGroup")?;
        Ok(())
    }
}

impl AwsResource for ReplicationGroup {
    type Spec = ReplicationGroupSpec;
    type Status = ReplicationGroupStatus;

    fn spec(&self) -> &ReplicationGroupSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut ReplicationGroupSpec {
        &mut self.spec
    }

    fn status(&self) -> Option<&ReplicationGroupStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut ReplicationGroupStatus {
        self.status.get_or_insert_with(Default::default)
    }

    fn set_identifiers(&mut self, identifiers: &AwsIdentifiers) -> Result<(), ControllerError> {
        self.spec.replication_group_id = identifier(identifiers, "ReplicationGroup")?;
        Ok(())
    }
}

/// ElastiCache API bound to one account and region.
#[derive(Clone)]
pub struct ElastiCache {
    api: Arc<dyn ElastiCacheApi>,
    account_id: AwsAccountId,
    region: AwsRegion,
    metrics: Arc<Metrics>,
}

impl ElastiCache {
    pub fn new(api: Arc<dyn ElastiCacheApi>, account_id: AwsAccountId, region: AwsRegion, metrics: Arc<Metrics>) -> Self {
        Self {
            api,
            account_id,
            region,
            metrics,
        }
    }

    /// Map `not_found` to [`ControllerError::NotFound`] and count the call.
    fn record<T>(
        &self,
        op_type: &'static str,
        op_id: &'static str,
        not_found: &str,
        result: Result<T, BackendError>,
    ) -> Result<T, ControllerError> {
        let result = result.map_err(|e| {
            if e.code == not_found {
                ControllerError::NotFound
            } else {
                ControllerError::Backend(e)
            }
        });
        self.metrics.record_api_call(op_type, op_id, &result);
        result
    }

    fn arn(&self, kind: &str, name: &str) -> String {
        format!("arn:aws:elasticache:{}:{}:{}:{}", self.region, self.account_id, kind, name)
    }
}

type Build<R> = fn(ElastiCache) -> Arc<dyn AwsResourceManager<R>>;

/// Hands out one manager of kind `R` per account and region.
pub struct ElastiCacheManagerFactory<R> {
    connect: Connect,
    metrics: Arc<Metrics>,
    descriptor: Arc<ResourceDescriptor<R>>,
    managers: ManagerCache<R>,
    build: Build<R>,
}

impl<R: AwsResource> ElastiCacheManagerFactory<R> {
    fn new(connect: Connect, metrics: Arc<Metrics>, build: Build<R>) -> Self {
        Self {
            connect,
            metrics,
            descriptor: Arc::new(ResourceDescriptor::new()),
            managers: ManagerCache::new(),
            build,
        }
    }
}

fn parameter_group_manager(ec: ElastiCache) -> Arc<dyn AwsResourceManager<CacheParameterGroup>> {
    Arc::new(CacheParameterGroupManager::new(ec))
}

fn replication_group_manager(ec: ElastiCache) -> Arc<dyn AwsResourceManager<ReplicationGroup>> {
    Arc::new(ReplicationGroupManager::new(ec))
}

impl ElastiCacheManagerFactory<CacheParameterGroup> {
    pub fn cache_parameter_groups(connect: Connect, metrics: Arc<Metrics>) -> Self {
        Self::new(connect, metrics, parameter_group_manager)
    }
}

impl ElastiCacheManagerFactory<ReplicationGroup> {
    pub fn replication_groups(connect: Connect, metrics: Arc<Metrics>) -> Self {
        Self::new(connect, metrics, replication_group_manager)
    }
}

impl<R: AwsResource> AwsResourceManagerFactory<R> for ElastiCacheManagerFactory<R> {
    fn resource_descriptor(&self) -> Arc<dyn AwsResourceDescriptor<R>> {
        self.descriptor.clone()
    }

    fn manager_for(
        &self,
        session: &Session,
        account_id: &AwsAccountId,
        region: &AwsRegion,
    ) -> Result<Arc<dyn AwsResourceManager<R>>, ControllerError> {
        self.managers.get_or_try_insert(account_id, region, || {
            let api = (self.connect)(session, account_id)?;
            Ok((self.build)(ElastiCache::new(
                api,
                account_id.clone(),
                region.clone(),
                self.metrics.clone(),
            )))
        })
    }
}

/// Register both ElastiCache kinds, sharing `connect`.
pub fn register(registry: &Registry, connect: Connect, metrics: Arc<Metrics>) {
    registry.register_resource_manager_factory::<CacheParameterGroup>(Arc::new(
        ElastiCacheManagerFactory::cache_parameter_groups(connect.clone(), metrics.clone()),
    ));
    registry.register_resource_manager_factory::<ReplicationGroup>(Arc::new(
        ElastiCacheManagerFactory::replication_groups(connect, metrics),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_name_the_backend_resource() {
        let mut rg = ReplicationGroup::new("rg", Default::default());
        rg.set_identifiers(&AwsIdentifiers {
            name_or_id: Some("prod-cache".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!("prod-cache", rg.spec.replication_group_id);

        let mut pg = CacheParameterGroup::new("pg", Default::default());
        let e = pg.set_identifiers(&AwsIdentifiers::default()).unwrap_err();
        assert_eq!("nameOrID is required to adopt a CacheParameterGroup", e.to_string());
    }

    #[test]
    fn adoption_prototype_converts() {
        let d = ResourceDescriptor::<ReplicationGroup>::new();
        let mut obj = d.empty_object().within("default");
        obj.metadata.name = Some("rg".to_string());
        let rg = d.resource_from_object(obj).unwrap();
        assert_eq!("", rg.spec.replication_group_id);
        assert_eq!(Some("rg".to_string()), rg.metadata.name);
    }

    #[test]
    fn registers_both_kinds() {
        let registry = Registry::new();
        let connect: Connect = Arc::new(
            |session: &Session, account_id: &AwsAccountId| -> Result<Arc<dyn ElastiCacheApi>, ControllerError> {
                let api: Arc<dyn ElastiCacheApi> =
                    Arc::new(sdk::MemoryElastiCache::new(session.region.clone(), account_id.clone()));
                Ok(api)
            },
        );
        register(&registry, connect, Arc::new(Metrics::new()));
        let kinds: Vec<String> = registry
            .get_resource_manager_factories()
            .iter()
            .map(|k| k.group_kind().to_string())
            .collect();
        assert_eq!(
            vec![
                "CacheParameterGroup.elasticache.services.k8s.aws",
                "ReplicationGroup.elasticache.services.k8s.aws"
            ],
            kinds
        );
    }
}
