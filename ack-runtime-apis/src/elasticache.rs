use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ack_status, Condition, ResourceMetadata};

/// A named parameter value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParameterNameValue {
    pub parameter_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_value: Option<String>,
}

/// A parameter as reported by the backend.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub parameter_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_value: Option<String>,
    /// `system` for engine defaults, `user` for values set through the API.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_modifiable: Option<bool>,
}

/// A cache parameter group and the user defined parameters in it.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "elasticache.services.k8s.aws",
    version = "v1alpha1",
    kind = "CacheParameterGroup",
    derive = "PartialEq",
    status = "CacheParameterGroupStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CacheParameterGroupSpec {
    pub cache_parameter_group_name: String,
    pub cache_parameter_group_family: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_name_values: Option<Vec<ParameterNameValue>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheParameterGroupStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_resource_metadata: Option<ResourceMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<Parameter>>,
}

ack_status!(CacheParameterGroupStatus);

/// Desired layout of one shard.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupConfiguration {
    #[serde(rename = "nodeGroupID", skip_serializing_if = "Option::is_none")]
    pub node_group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_availability_zone: Option<String>,
}

/// A cache node within a shard.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupMember {
    #[serde(rename = "cacheClusterID")]
    pub cache_cluster_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_role: Option<String>,
}

/// Observed shard.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    #[serde(rename = "nodeGroupID")]
    pub node_group_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_group_members: Vec<NodeGroupMember>,
}

/// A sharded, replicated cache.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "elasticache.services.k8s.aws",
    version = "v1alpha1",
    kind = "ReplicationGroup",
    derive = "PartialEq",
    status = "ReplicationGroupStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Status",
        "type": "string",
        "jsonPath": ".status.status",
        "description": "Backend status of the replication group."
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationGroupSpec {
    #[serde(rename = "replicationGroupID")]
    pub replication_group_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_node_groups: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas_per_node_group: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_group_configuration: Option<Vec<NodeGroupConfiguration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automatic_failover_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationGroupStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_resource_metadata: Option<ResourceMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Backend status, e.g. `creating`, `available` or `modifying`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// `enabled`, `disabled`, `enabling` or `disabling`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automatic_failover: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_groups: Vec<NodeGroup>,
}

ack_status!(ReplicationGroupStatus);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_group_spec_json() {
        let spec: CacheParameterGroupSpec = serde_json::from_str(
            r#"{
                "cacheParameterGroupName": "cpg",
                "cacheParameterGroupFamily": "redis6.x",
                "parameterNameValues": [{"parameterName": "maxmemory-policy", "parameterValue": "allkeys-lru"}]
            }"#,
        )
        .unwrap();
        let params = spec.parameter_name_values.unwrap();
        assert_eq!("maxmemory-policy", params[0].parameter_name);
        assert_eq!(Some("allkeys-lru"), params[0].parameter_value.as_deref());
    }

    #[test]
    fn replication_group_spec_json() {
        let spec = ReplicationGroupSpec {
            replication_group_id: "rg".to_string(),
            num_node_groups: Some(2),
            node_group_configuration: Some(vec![NodeGroupConfiguration {
                node_group_id: Some("0001".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(
            r#"{"replicationGroupID":"rg","numNodeGroups":2,"nodeGroupConfiguration":[{"nodeGroupID":"0001"}]}"#,
            serde_json::to_string(&spec).unwrap()
        );
    }
}
