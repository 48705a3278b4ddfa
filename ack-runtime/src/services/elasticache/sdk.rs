//! ElastiCache service API.

use std::{collections::BTreeMap, sync::Mutex};

use ack_runtime_apis::{
    AwsAccountId, AwsRegion,
    elasticache::{NodeGroup, NodeGroupMember, Parameter, ParameterNameValue},
};
use async_trait::async_trait;

use crate::{errors::BackendError, hooks::Page};

pub const CACHE_PARAMETER_GROUP_NOT_FOUND: &str = "CacheParameterGroupNotFound";
pub const REPLICATION_GROUP_NOT_FOUND: &str = "ReplicationGroupNotFoundFault";
const INVALID_PARAMETER_VALUE: &str = "InvalidParameterValue";
const INVALID_STATE: &str = "InvalidReplicationGroupState";
const ALREADY_EXISTS: &str = "AlreadyExists";

/// Most parameters a single modify or reset call accepts.
pub const MAX_PARAMETERS_PER_CALL: usize = 20;

/// Page size of `DescribeCacheParameters`.
const PARAMETERS_PAGE_SIZE: usize = 20;

pub const STATUS_AVAILABLE: &str = "available";
const STATUS_CREATING: &str = "creating";
const STATUS_MODIFYING: &str = "modifying";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheParameterGroupData {
    pub name: String,
    pub family: String,
    pub description: Option<String>,
    pub arn: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplicationGroupData {
    pub id: String,
    pub arn: String,
    pub description: Option<String>,
    pub status: String,
    /// `enabled`, `disabled`, `enabling` or `disabling`.
    pub automatic_failover: String,
    pub node_groups: Vec<NodeGroup>,
}

/// Shape of a new replication group.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateReplicationGroup {
    pub id: String,
    pub description: Option<String>,
    pub num_node_groups: i64,
    pub replicas_per_node_group: i64,
    pub automatic_failover_enabled: bool,
}

#[async_trait]
pub trait ElastiCacheApi: Send + Sync {
    async fn describe_cache_parameter_group(&self, name: &str) -> Result<CacheParameterGroupData, BackendError>;

    /// One page of the parameters of a group, `marker` continues a listing.
    async fn describe_cache_parameters(
        &self,
        name: &str,
        marker: Option<String>,
    ) -> Result<Page<Parameter>, BackendError>;

    async fn create_cache_parameter_group(
        &self,
        name: &str,
        family: &str,
        description: Option<&str>,
    ) -> Result<CacheParameterGroupData, BackendError>;

    async fn modify_cache_parameter_group(
        &self,
        name: &str,
        parameters: &[ParameterNameValue],
    ) -> Result<(), BackendError>;

    /// Reset the named parameters, or all of them with `reset_all`.
    async fn reset_cache_parameter_group(
        &self,
        name: &str,
        reset_all: bool,
        parameters: &[ParameterNameValue],
    ) -> Result<(), BackendError>;

    async fn delete_cache_parameter_group(&self, name: &str) -> Result<(), BackendError>;

    async fn describe_replication_group(&self, id: &str) -> Result<ReplicationGroupData, BackendError>;

    async fn create_replication_group(
        &self,
        input: &CreateReplicationGroup,
    ) -> Result<ReplicationGroupData, BackendError>;

    async fn modify_replication_group(
        &self,
        id: &str,
        description: Option<&str>,
        automatic_failover_enabled: Option<bool>,
    ) -> Result<ReplicationGroupData, BackendError>;

    async fn increase_replica_count(&self, id: &str, new_replica_count: i64) -> Result<ReplicationGroupData, BackendError>;

    async fn decrease_replica_count(&self, id: &str, new_replica_count: i64) -> Result<ReplicationGroupData, BackendError>;

    /// Change the shard count. Shrinking keeps `node_groups_to_retain`.
    async fn modify_replication_group_shard_configuration(
        &self,
        id: &str,
        node_group_count: i64,
        node_groups_to_retain: &[String],
    ) -> Result<ReplicationGroupData, BackendError>;

    async fn delete_replication_group(&self, id: &str) -> Result<(), BackendError>;
}

struct StoredParameterGroup {
    data: CacheParameterGroupData,
    parameters: Vec<Parameter>,
}

/// ElastiCache kept in memory, recording the operations it serves.
///
/// Every parameter group family has `family_size` modifiable parameters named
/// `param-NN` with value `default`. Replication groups change into
/// `modifying` with every change and stay there until [`settle`] is called.
///
/// [`settle`]: MemoryElastiCache::settle
pub struct MemoryElastiCache {
    region: AwsRegion,
    account_id: AwsAccountId,
    family_size: usize,
    parameter_groups: Mutex<BTreeMap<String, StoredParameterGroup>>,
    replication_groups: Mutex<BTreeMap<String, ReplicationGroupData>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryElastiCache {
    pub fn new(region: AwsRegion, account_id: AwsAccountId) -> Self {
        Self::with_family_size(region, account_id, 45)
    }

    pub fn with_family_size(region: AwsRegion, account_id: AwsAccountId, family_size: usize) -> Self {
        Self {
            region,
            account_id,
            family_size,
            parameter_groups: Default::default(),
            replication_groups: Default::default(),
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Finish all pending replication group changes.
    pub fn settle(&self) {
        let mut groups = self.replication_groups.lock().unwrap_or_else(|e| e.into_inner());
        for g in groups.values_mut() {
            g.status = STATUS_AVAILABLE.to_string();
            g.automatic_failover = match g.automatic_failover.as_str() {
                "enabling" => "enabled".to_string(),
                "disabling" => "disabled".to_string(),
                other => other.to_string(),
            };
            for ng in g.node_groups.iter_mut() {
                ng.status = Some(STATUS_AVAILABLE.to_string());
            }
        }
    }

    /// Current value of a parameter.
    pub fn parameter(&self, group: &str, name: &str) -> Option<String> {
        let groups = self.parameter_groups.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .get(group)?
            .parameters
            .iter()
            .find(|p| p.parameter_name == name)
            .and_then(|p| p.parameter_value.clone())
    }

    pub fn replication_group(&self, id: &str) -> Option<ReplicationGroupData> {
        self.replication_groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn call(&self, operation: &str) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(operation.to_string());
    }

    fn arn(&self, kind: &str, name: &str) -> String {
        format!("arn:aws:elasticache:{}:{}:{}:{}", self.region, self.account_id, kind, name)
    }

    fn default_parameter(i: usize) -> Parameter {
        Parameter {
            parameter_name: format!("param-{:02}", i),
            parameter_value: Some("default".to_string()),
            source: Some("system".to_string()),
            is_modifiable: Some(true),
        }
    }

    fn parameter_group_not_found(name: &str) -> BackendError {
        BackendError::new(
            CACHE_PARAMETER_GROUP_NOT_FOUND,
            format!("cache parameter group {} not found", name),
            Some(404),
        )
    }

    fn replication_group_not_found(id: &str) -> BackendError {
        BackendError::new(
            REPLICATION_GROUP_NOT_FOUND,
            format!("replication group {} not found", id),
            Some(404),
        )
    }

    fn with_parameter_group<T, F>(&self, name: &str, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&mut StoredParameterGroup) -> Result<T, BackendError>,
    {
        let mut groups = self.parameter_groups.lock().unwrap_or_else(|e| e.into_inner());
        let group = groups
            .get_mut(name)
            .ok_or_else(|| Self::parameter_group_not_found(name))?;
        f(group)
    }

    /// Apply `f` to an available replication group, which starts modifying.
    fn modify<F>(&self, id: &str, f: F) -> Result<ReplicationGroupData, BackendError>
    where
        F: FnOnce(&mut ReplicationGroupData) -> Result<(), BackendError>,
    {
        let mut groups = self.replication_groups.lock().unwrap_or_else(|e| e.into_inner());
        let group = groups
            .get_mut(id)
            .ok_or_else(|| Self::replication_group_not_found(id))?;
        if group.status != STATUS_AVAILABLE {
            return Err(BackendError::new(
                INVALID_STATE,
                format!("replication group {} is {}", id, group.status),
                Some(400),
            ));
        }
        f(group)?;
        group.status = STATUS_MODIFYING.to_string();
        Ok(group.clone())
    }

    fn node_group(id: &str, index: usize, replicas: i64, status: &str) -> NodeGroup {
        let node_group_id = format!("{:04}", index + 1);
        NodeGroup {
            node_group_members: (0..=replicas)
                .map(|m| NodeGroupMember {
                    cache_cluster_id: format!("{}-{}-{:03}", id, node_group_id, m + 1),
                    current_role: Some(if m == 0 { "primary" } else { "replica" }.to_string()),
                })
                .collect(),
            node_group_id,
            status: Some(status.to_string()),
        }
    }
}

fn check_batch(parameters: &[ParameterNameValue]) -> Result<(), BackendError> {
    if parameters.len() > MAX_PARAMETERS_PER_CALL {
        return Err(BackendError::new(
            INVALID_PARAMETER_VALUE,
            format!(
                "at most {} parameters per call, got {}",
                MAX_PARAMETERS_PER_CALL,
                parameters.len()
            ),
            Some(400),
        ));
    }
    Ok(())
}

#[async_trait]
impl ElastiCacheApi for MemoryElastiCache {
    async fn describe_cache_parameter_group(&self, name: &str) -> Result<CacheParameterGroupData, BackendError> {
        self.call("DescribeCacheParameterGroups");
        self.with_parameter_group(name, |g| Ok(g.data.clone()))
    }

    async fn describe_cache_parameters(
        &self,
        name: &str,
        marker: Option<String>,
    ) -> Result<Page<Parameter>, BackendError> {
        self.call("DescribeCacheParameters");
        let start: usize = match marker {
            Some(m) => m.parse().map_err(|_| {
                BackendError::new(INVALID_PARAMETER_VALUE, format!("invalid marker {}", m), Some(400))
            })?,
            None => 0,
        };
        self.with_parameter_group(name, |g| {
            let end = (start + PARAMETERS_PAGE_SIZE).min(g.parameters.len());
            let items = g.parameters.get(start..end).unwrap_or_default().to_vec();
            let marker = if end < g.parameters.len() {
                Some(end.to_string())
            } else {
                None
            };
            Ok(Page { items, marker })
        })
    }

    async fn create_cache_parameter_group(
        &self,
        name: &str,
        family: &str,
        description: Option<&str>,
    ) -> Result<CacheParameterGroupData, BackendError> {
        self.call("CreateCacheParameterGroup");
        let mut groups = self.parameter_groups.lock().unwrap_or_else(|e| e.into_inner());
        if groups.contains_key(name) {
            return Err(BackendError::new(
                ALREADY_EXISTS,
                format!("cache parameter group {} already exists", name),
                Some(400),
            ));
        }
        let data = CacheParameterGroupData {
            name: name.to_string(),
            family: family.to_string(),
            description: description.map(str::to_string),
            arn: self.arn("parametergroup", name),
        };
        let parameters = (0..self.family_size).map(Self::default_parameter).collect();
        groups.insert(
            name.to_string(),
            StoredParameterGroup {
                data: data.clone(),
                parameters,
            },
        );
        Ok(data)
    }

    async fn modify_cache_parameter_group(
        &self,
        name: &str,
        parameters: &[ParameterNameValue],
    ) -> Result<(), BackendError> {
        self.call("ModifyCacheParameterGroup");
        check_batch(parameters)?;
        self.with_parameter_group(name, |g| {
            for p in parameters {
                let stored = g
                    .parameters
                    .iter_mut()
                    .find(|s| s.parameter_name == p.parameter_name)
                    .ok_or_else(|| {
                        BackendError::new(
                            INVALID_PARAMETER_VALUE,
                            format!("unknown parameter {}", p.parameter_name),
                            Some(400),
                        )
                    })?;
                stored.parameter_value = p.parameter_value.clone();
                stored.source = Some("user".to_string());
            }
            Ok(())
        })
    }

    async fn reset_cache_parameter_group(
        &self,
        name: &str,
        reset_all: bool,
        parameters: &[ParameterNameValue],
    ) -> Result<(), BackendError> {
        self.call("ResetCacheParameterGroup");
        check_batch(parameters)?;
        self.with_parameter_group(name, |g| {
            for (i, stored) in g.parameters.iter_mut().enumerate() {
                if reset_all || parameters.iter().any(|p| p.parameter_name == stored.parameter_name) {
                    *stored = Self::default_parameter(i);
                }
            }
            Ok(())
        })
    }

    async fn delete_cache_parameter_group(&self, name: &str) -> Result<(), BackendError> {
        self.call("DeleteCacheParameterGroup");
        let mut groups = self.parameter_groups.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::parameter_group_not_found(name))
    }

    async fn describe_replication_group(&self, id: &str) -> Result<ReplicationGroupData, BackendError> {
        self.call("DescribeReplicationGroups");
        self.replication_group(id)
            .ok_or_else(|| Self::replication_group_not_found(id))
    }

    async fn create_replication_group(
        &self,
        input: &CreateReplicationGroup,
    ) -> Result<ReplicationGroupData, BackendError> {
        self.call("CreateReplicationGroup");
        let mut groups = self.replication_groups.lock().unwrap_or_else(|e| e.into_inner());
        if groups.contains_key(&input.id) {
            return Err(BackendError::new(
                "ReplicationGroupAlreadyExists",
                format!("replication group {} already exists", input.id),
                Some(400),
            ));
        }
        let group = ReplicationGroupData {
            id: input.id.clone(),
            arn: self.arn("replicationgroup", &input.id),
            description: input.description.clone(),
            status: STATUS_CREATING.to_string(),
            automatic_failover: if input.automatic_failover_enabled {
                "enabled"
            } else {
                "disabled"
            }
            .to_string(),
            node_groups: (0..input.num_node_groups.max(1) as usize)
                .map(|i| Self::node_group(&input.id, i, input.replicas_per_node_group, STATUS_CREATING))
                .collect(),
        };
        groups.insert(input.id.clone(), group.clone());
        Ok(group)
    }

    async fn modify_replication_group(
        &self,
        id: &str,
        description: Option<&str>,
        automatic_failover_enabled: Option<bool>,
    ) -> Result<ReplicationGroupData, BackendError> {
        self.call("ModifyReplicationGroup");
        self.modify(id, |g| {
            if let Some(description) = description {
                g.description = Some(description.to_string());
            }
            match automatic_failover_enabled {
                Some(true) => g.automatic_failover = "enabling".to_string(),
                Some(false) => g.automatic_failover = "disabling".to_string(),
                None => (),
            }
            Ok(())
        })
    }

    async fn increase_replica_count(&self, id: &str, new_replica_count: i64) -> Result<ReplicationGroupData, BackendError> {
        self.call("IncreaseReplicaCount");
        let group_id = id.to_string();
        self.modify(id, |g| {
            g.node_groups = (0..g.node_groups.len())
                .map(|i| Self::node_group(&group_id, i, new_replica_count, STATUS_MODIFYING))
                .collect();
            Ok(())
        })
    }

    async fn decrease_replica_count(&self, id: &str, new_replica_count: i64) -> Result<ReplicationGroupData, BackendError> {
        self.call("DecreaseReplicaCount");
        let group_id = id.to_string();
        self.modify(id, |g| {
            if g.automatic_failover == "enabled" && new_replica_count < 1 {
                return Err(BackendError::new(
                    INVALID_PARAMETER_VALUE,
                    "automatic failover needs at least one replica",
                    Some(400),
                ));
            }
            g.node_groups = (0..g.node_groups.len())
                .map(|i| Self::node_group(&group_id, i, new_replica_count, STATUS_MODIFYING))
                .collect();
            Ok(())
        })
    }

    async fn modify_replication_group_shard_configuration(
        &self,
        id: &str,
        node_group_count: i64,
        node_groups_to_retain: &[String],
    ) -> Result<ReplicationGroupData, BackendError> {
        self.call("ModifyReplicationGroupShardConfiguration");
        let group_id = id.to_string();
        self.modify(id, |g| {
            let count = node_group_count.max(1) as usize;
            let replicas = g
                .node_groups
                .first()
                .map_or(0, |ng| ng.node_group_members.len() as i64 - 1);
            if count < g.node_groups.len() {
                if node_groups_to_retain.len() != count {
                    return Err(BackendError::new(
                        INVALID_PARAMETER_VALUE,
                        "node groups to retain must match the new node group count",
                        Some(400),
                    ));
                }
                g.node_groups
                    .retain(|ng| node_groups_to_retain.contains(&ng.node_group_id));
            } else {
                for i in g.node_groups.len()..count {
                    g.node_groups
                        .push(Self::node_group(&group_id, i, replicas, STATUS_MODIFYING));
                }
            }
            Ok(())
        })
    }

    async fn delete_replication_group(&self, id: &str) -> Result<(), BackendError> {
        self.call("DeleteReplicationGroup");
        let mut groups = self.replication_groups.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::replication_group_not_found(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elasticache() -> MemoryElastiCache {
        MemoryElastiCache::new("us-west-2".into(), "012345678912".into())
    }

    #[tokio::test]
    async fn parameters_are_paged() {
        let ec = elasticache();
        ec.create_cache_parameter_group("pg", "redis7", None).await.unwrap();
        let first = ec.describe_cache_parameters("pg", None).await.unwrap();
        assert_eq!(20, first.items.len());
        assert_eq!(Some("20".to_string()), first.marker);
        let last = ec.describe_cache_parameters("pg", Some("40".to_string())).await.unwrap();
        assert_eq!(5, last.items.len());
        assert_eq!(None, last.marker);
    }

    #[tokio::test]
    async fn batches_are_limited() {
        let ec = elasticache();
        ec.create_cache_parameter_group("pg", "redis7", None).await.unwrap();
        let batch: Vec<ParameterNameValue> = (0..21)
            .map(|i| ParameterNameValue {
                parameter_name: format!("param-{:02}", i),
                parameter_value: Some("1".to_string()),
            })
            .collect();
        let e = ec.modify_cache_parameter_group("pg", &batch).await.unwrap_err();
        assert_eq!(INVALID_PARAMETER_VALUE, e.code);
        ec.modify_cache_parameter_group("pg", &batch[..20]).await.unwrap();
        assert_eq!(Some("1".to_string()), ec.parameter("pg", "param-19"));
        ec.reset_cache_parameter_group("pg", true, &[]).await.unwrap();
        assert_eq!(Some("default".to_string()), ec.parameter("pg", "param-19"));
    }

    #[tokio::test]
    async fn replication_group_modifies_until_settled() {
        let ec = elasticache();
        let rg = ec
            .create_replication_group(&CreateReplicationGroup {
                id: "rg".to_string(),
                num_node_groups: 2,
                replicas_per_node_group: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!("creating", rg.status);
        assert_eq!(2, rg.node_groups[1].node_group_members.len());
        let e = ec.increase_replica_count("rg", 2).await.unwrap_err();
        assert_eq!(INVALID_STATE, e.code);
        ec.settle();
        let rg = ec.increase_replica_count("rg", 2).await.unwrap();
        assert_eq!("modifying", rg.status);
        assert_eq!(3, rg.node_groups[0].node_group_members.len());
    }

    #[tokio::test]
    async fn shrinking_shards_needs_groups_to_retain() {
        let ec = elasticache();
        ec.create_replication_group(&CreateReplicationGroup {
            id: "rg".to_string(),
            num_node_groups: 3,
            ..Default::default()
        })
        .await
        .unwrap();
        ec.settle();
        assert!(ec.modify_replication_group_shard_configuration("rg", 2, &[]).await.is_err());
        let rg = ec
            .modify_replication_group_shard_configuration("rg", 2, &["0001".to_string(), "0003".to_string()])
            .await
            .unwrap();
        let ids: Vec<&str> = rg.node_groups.iter().map(|ng| ng.node_group_id.as_str()).collect();
        assert_eq!(vec!["0001", "0003"], ids);
    }
}
