use ack_runtime_apis::{
    CONDITION_TYPE_RESOURCE_SYNCED, Condition, ConditionStatus, set_condition,
    elasticache::ReplicationGroup,
};
use async_trait::async_trait;

use super::{
    ElastiCache,
    sdk::{CreateReplicationGroup, REPLICATION_GROUP_NOT_FOUND, ReplicationGroupData, STATUS_AVAILABLE},
};
use crate::{
    compare::Reporter,
    errors::{BackendError, ControllerError},
    hooks::{PlanMode, UpdatePlan, require_ready},
    types::{AwsResource, AwsResourceManager},
};

/// Modifications of a replication group. Each of them moves the group into
/// `modifying`, so only the first pending one runs per reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReplicationGroupUpdate {
    DisableFailover,
    ReplicaCount,
    ShardConfiguration,
    EnableFailover,
    Description,
}

// Fields left unset in the desired spec are not managed.

fn replicas_differ(desired: &ReplicationGroup, diff: &Reporter) -> bool {
    desired.spec.replicas_per_node_group.is_some() && diff.has_changed(".replicasPerNodeGroup")
}

fn shards_differ(desired: &ReplicationGroup, diff: &Reporter) -> bool {
    desired.spec.num_node_groups.is_some() && diff.has_changed(".numNodeGroups")
}

fn scaling(desired: &ReplicationGroup, diff: &Reporter) -> bool {
    replicas_differ(desired, diff) || shards_differ(desired, diff)
}

fn failover_enabled(rg: &ReplicationGroup) -> bool {
    rg.spec.automatic_failover_enabled.unwrap_or(false)
}

fn update_plan() -> UpdatePlan<ReplicationGroup, ReplicationGroupUpdate> {
    UpdatePlan::new(PlanMode::FirstOnly)
        .step(ReplicationGroupUpdate::DisableFailover, |desired, latest, diff| {
            failover_enabled(latest)
                && match desired.spec.automatic_failover_enabled {
                    Some(false) => true,
                    Some(true) => scaling(desired, diff),
                    None => false,
                }
        })
        .step(ReplicationGroupUpdate::ReplicaCount, |desired, _, diff| replicas_differ(desired, diff))
        .step(ReplicationGroupUpdate::ShardConfiguration, |desired, _, diff| shards_differ(desired, diff))
        .step(ReplicationGroupUpdate::EnableFailover, |desired, latest, diff| {
            desired.spec.automatic_failover_enabled == Some(true)
                && !failover_enabled(latest)
                && !scaling(desired, diff)
        })
        .step(ReplicationGroupUpdate::Description, |desired, _, diff| {
            desired.spec.description.is_some() && diff.has_changed(".description")
        })
}

/// Whether the group and all of its node groups are `available`.
fn is_available(rg: &ReplicationGroup) -> bool {
    rg.status.as_ref().map_or(false, |s| {
        s.status.as_deref() == Some(STATUS_AVAILABLE)
            && s.node_groups
                .iter()
                .all(|ng| ng.status.as_deref() == Some(STATUS_AVAILABLE))
    })
}

/// Node groups to keep when shrinking `latest` to the size of `desired`.
fn node_groups_to_retain(desired: &ReplicationGroup, latest: &ReplicationGroup) -> Result<Vec<String>, ControllerError> {
    let (Some(target), Some(current)) = (desired.spec.num_node_groups, latest.spec.num_node_groups) else {
        return Ok(vec![]);
    };
    if target >= current {
        return Ok(vec![]);
    }
    let retain: Vec<String> = desired
        .spec
        .node_group_configuration
        .iter()
        .flatten()
        .filter_map(|c| c.node_group_id.clone())
        .collect();
    if retain.len() as i64 != target {
        return Err(ControllerError::terminal(format!(
            "decreasing numNodeGroups from {} to {} requires the {} node groups to retain in nodeGroupConfiguration",
            current, target, target
        )));
    }
    Ok(retain)
}

pub struct ReplicationGroupManager {
    ec: ElastiCache,
    plan: UpdatePlan<ReplicationGroup, ReplicationGroupUpdate>,
}

impl ReplicationGroupManager {
    pub fn new(ec: ElastiCache) -> Self {
        Self { ec, plan: update_plan() }
    }

    fn record<T>(
        &self,
        op_type: &'static str,
        op_id: &'static str,
        result: Result<T, BackendError>,
    ) -> Result<T, ControllerError> {
        self.ec.record(op_type, op_id, REPLICATION_GROUP_NOT_FOUND, result)
    }

    fn set_output(&self, res: &ReplicationGroup, data: ReplicationGroupData) -> ReplicationGroup {
        let mut latest = res.clone();
        latest.spec.description = data.description;
        latest.spec.num_node_groups = Some(data.node_groups.len() as i64);
        latest.spec.replicas_per_node_group = data
            .node_groups
            .first()
            .map(|ng| ng.node_group_members.len() as i64 - 1);
        latest.spec.automatic_failover_enabled =
            Some(matches!(data.automatic_failover.as_str(), "enabled" | "enabling"));
        latest.resource_metadata_mut().arn = Some(data.arn);
        let status = latest.status_mut();
        status.status = Some(data.status.clone());
        status.automatic_failover = Some(data.automatic_failover);
        status.node_groups = data.node_groups;
        if !is_available(&latest) {
            set_condition(
                latest.conditions_mut(),
                Condition::new(CONDITION_TYPE_RESOURCE_SYNCED, ConditionStatus::False)
                    .with_message(format!("replication group {} is {}", data.id, data.status)),
            );
        }
        latest
    }

    async fn apply(
        &self,
        step: ReplicationGroupUpdate,
        desired: &ReplicationGroup,
        current: ReplicationGroup,
    ) -> Result<ReplicationGroup, ControllerError> {
        let id = desired.spec.replication_group_id.as_str();
        let api = &self.ec.api;
        let data = match step {
            ReplicationGroupUpdate::DisableFailover => self.record(
                "UPDATE",
                "ModifyReplicationGroup",
                api.modify_replication_group(id, None, Some(false)).await,
            )?,
            ReplicationGroupUpdate::EnableFailover => self.record(
                "UPDATE",
                "ModifyReplicationGroup",
                api.modify_replication_group(id, None, Some(true)).await,
            )?,
            ReplicationGroupUpdate::Description => self.record(
                "UPDATE",
                "ModifyReplicationGroup",
                api.modify_replication_group(id, desired.spec.description.as_deref(), None)
                    .await,
            )?,
            ReplicationGroupUpdate::ReplicaCount => {
                let target = desired.spec.replicas_per_node_group.unwrap_or_default();
                if target > current.spec.replicas_per_node_group.unwrap_or_default() {
                    self.record("UPDATE", "IncreaseReplicaCount", api.increase_replica_count(id, target).await)?
                } else {
                    self.record("UPDATE", "DecreaseReplicaCount", api.decrease_replica_count(id, target).await)?
                }
            }
            ReplicationGroupUpdate::ShardConfiguration => {
                let target = desired.spec.num_node_groups.unwrap_or(1);
                let retain = node_groups_to_retain(desired, &current)?;
                self.record(
                    "UPDATE",
                    "ModifyReplicationGroupShardConfiguration",
                    api.modify_replication_group_shard_configuration(id, target, &retain)
                        .await,
                )?
            }
        };
        info!("replication group {}: applied {:?}", id, step);
        Ok(self.set_output(&current, data))
    }
}

#[async_trait]
impl AwsResourceManager<ReplicationGroup> for ReplicationGroupManager {
    async fn read_one(&self, res: &ReplicationGroup) -> Result<ReplicationGroup, ControllerError> {
        let data = self.record(
            "READ_ONE",
            "DescribeReplicationGroups",
            self.ec
                .api
                .describe_replication_group(&res.spec.replication_group_id)
                .await,
        )?;
        Ok(self.set_output(res, data))
    }

    async fn create(&self, res: &ReplicationGroup) -> Result<ReplicationGroup, ControllerError> {
        let spec = &res.spec;
        let input = CreateReplicationGroup {
            id: spec.replication_group_id.clone(),
            description: spec.description.clone(),
            num_node_groups: spec.num_node_groups.unwrap_or(1),
            replicas_per_node_group: spec.replicas_per_node_group.unwrap_or_default(),
            automatic_failover_enabled: spec.automatic_failover_enabled.unwrap_or(false),
        };
        let data = self.record(
            "CREATE",
            "CreateReplicationGroup",
            self.ec.api.create_replication_group(&input).await,
        )?;
        Ok(self.set_output(res, data))
    }

    async fn update(
        &self,
        desired: &ReplicationGroup,
        latest: &ReplicationGroup,
        diff: &Reporter,
    ) -> Result<ReplicationGroup, ControllerError> {
        let id = desired.spec.replication_group_id.as_str();
        node_groups_to_retain(desired, latest)?;
        require_ready(is_available(latest), &format!("replication group {}", id))?;
        debug!(
            "updating replication group {}, changed: {}, pending: {:?}",
            id,
            diff.len(),
            self.plan.pending(desired, latest, diff)
        );
        self.plan
            .run(desired, latest.clone(), diff, |step, current| self.apply(step, desired, current))
            .await
    }

    async fn delete(&self, res: &ReplicationGroup) -> Result<(), ControllerError> {
        match self.record(
            "DELETE",
            "DeleteReplicationGroup",
            self.ec
                .api
                .delete_replication_group(&res.spec.replication_group_id)
                .await,
        ) {
            Err(ControllerError::NotFound) => Ok(()),
            other => other,
        }
    }

    fn arn_from_name(&self, name: &str) -> String {
        self.ec.arn("replicationgroup", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::test_config,
        metrics::Metrics,
        reconciler::{ReconcileOutcome, Reconciler},
        requeue::DEFAULT_REQUEUE_AFTER,
        services::elasticache::{Connect, ElastiCacheManagerFactory, sdk::{ElastiCacheApi, MemoryElastiCache}},
        session::Session,
        testing::{MemoryStore, condition_states, runtime_with},
    };
    use crate::adoption::{Adopter, AdoptionReconciler};
    use ack_runtime_apis::{
        AdoptedResource, AdoptedResourceSpec, AwsAccountId, AwsIdentifiers, TargetKubernetesResource,
        elasticache::{NodeGroupConfiguration, ReplicationGroupSpec},
    };
    use std::sync::Arc;

    fn manager() -> (Arc<MemoryElastiCache>, ReplicationGroupManager) {
        let api = Arc::new(MemoryElastiCache::new("us-west-2".into(), "012345678912".into()));
        let rm = ReplicationGroupManager::new(ElastiCache::new(
            api.clone(),
            "012345678912".into(),
            "us-west-2".into(),
            Arc::new(Metrics::new()),
        ));
        (api, rm)
    }

    fn group(shards: i64, replicas: i64, failover: bool) -> ReplicationGroup {
        let mut rg = ReplicationGroup::new(
            "rg",
            ReplicationGroupSpec {
                replication_group_id: "rg".to_string(),
                description: Some("sessions".to_string()),
                num_node_groups: Some(shards),
                replicas_per_node_group: Some(replicas),
                node_group_configuration: None,
                automatic_failover_enabled: Some(failover),
            },
        );
        rg.metadata.namespace = Some("default".to_string());
        rg.metadata.generation = Some(1);
        rg
    }

    async fn created(api: &MemoryElastiCache, rm: &ReplicationGroupManager, rg: &ReplicationGroup) {
        rm.create(rg).await.unwrap();
        api.settle();
    }

    /// Run one update against the settled backend, returns the calls made.
    async fn pass(api: &MemoryElastiCache, rm: &ReplicationGroupManager, desired: &ReplicationGroup) -> Vec<String> {
        let latest = rm.read_one(desired).await.unwrap();
        let diff = crate::compare::diff(&desired.spec, &latest.spec, Default::default()).unwrap();
        api.clear_calls();
        rm.update(desired, &latest, &diff).await.unwrap();
        api.settle();
        api.calls()
    }

    #[tokio::test]
    async fn read_reports_observed_shape() {
        let (api, rm) = manager();
        let rg = group(2, 1, true);
        let creating = rm.create(&rg).await.unwrap();
        assert_eq!(
            vec![(CONDITION_TYPE_RESOURCE_SYNCED.to_string(), "False".to_string())],
            condition_states(&creating)
        );
        api.settle();
        let latest = rm.read_one(&rg).await.unwrap();
        assert_eq!(rg.spec, latest.spec);
        assert!(condition_states(&latest).is_empty());
        let status = latest.status.unwrap();
        assert_eq!(2, status.node_groups.len());
        assert_eq!(Some("enabled"), status.automatic_failover.as_deref());
    }

    #[tokio::test]
    async fn update_waits_until_available() {
        let (api, rm) = manager();
        let rg = group(1, 1, false);
        rm.create(&rg).await.unwrap();
        let latest = rm.read_one(&rg).await.unwrap();
        api.clear_calls();
        let e = rm.update(&group(1, 2, false), &latest, &Reporter::new()).await.unwrap_err();
        assert_eq!(Some(DEFAULT_REQUEUE_AFTER), e.requeue_after());
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn scaling_runs_one_step_per_pass() {
        let (api, rm) = manager();
        created(&api, &rm, &group(2, 1, true)).await;
        let desired = group(3, 2, true);
        assert_eq!(vec!["ModifyReplicationGroup"], pass(&api, &rm, &desired).await);
        assert_eq!("disabled", api.replication_group("rg").unwrap().automatic_failover);
        assert_eq!(vec!["IncreaseReplicaCount"], pass(&api, &rm, &desired).await);
        assert_eq!(
            vec!["ModifyReplicationGroupShardConfiguration"],
            pass(&api, &rm, &desired).await
        );
        assert_eq!(vec!["ModifyReplicationGroup"], pass(&api, &rm, &desired).await);
        assert!(pass(&api, &rm, &desired).await.is_empty());

        let latest = rm.read_one(&desired).await.unwrap();
        assert_eq!(desired.spec, latest.spec);
        let stored = api.replication_group("rg").unwrap();
        assert_eq!("enabled", stored.automatic_failover);
        assert_eq!(3, stored.node_groups.len());
        assert_eq!(3, stored.node_groups[2].node_group_members.len());
    }

    #[tokio::test]
    async fn shrinking_requires_node_groups_to_retain() {
        let (api, rm) = manager();
        created(&api, &rm, &group(3, 0, false)).await;
        let mut desired = group(2, 0, false);
        let latest = rm.read_one(&desired).await.unwrap();
        api.clear_calls();
        let e = rm.update(&desired, &latest, &Reporter::new()).await.unwrap_err();
        assert!(e.is_terminal());
        assert!(api.calls().is_empty());

        desired.spec.node_group_configuration = Some(
            ["0001", "0003"]
                .iter()
                .map(|id| NodeGroupConfiguration {
                    node_group_id: Some(id.to_string()),
                    ..Default::default()
                })
                .collect(),
        );
        assert_eq!(
            vec!["ModifyReplicationGroupShardConfiguration"],
            pass(&api, &rm, &desired).await
        );
        let ids: Vec<String> = api
            .replication_group("rg")
            .unwrap()
            .node_groups
            .into_iter()
            .map(|ng| ng.node_group_id)
            .collect();
        assert_eq!(vec!["0001", "0003"], ids);
    }

    #[tokio::test]
    async fn fewer_replicas() {
        let (api, rm) = manager();
        created(&api, &rm, &group(1, 2, false)).await;
        assert_eq!(vec!["DecreaseReplicaCount"], pass(&api, &rm, &group(1, 0, false)).await);
        let mut desired = group(1, 0, false);
        desired.spec.description = Some("cache".to_string());
        assert_eq!(vec!["ModifyReplicationGroup"], pass(&api, &rm, &desired).await);
        assert_eq!(Some("cache".to_string()), api.replication_group("rg").unwrap().description);
    }

    #[tokio::test]
    async fn missing_group() {
        let (_, rm) = manager();
        let rg = group(1, 0, false);
        assert!(matches!(rm.read_one(&rg).await, Err(ControllerError::NotFound)));
        rm.delete(&rg).await.unwrap();
    }

    #[tokio::test]
    async fn synced_once_available() {
        let config = test_config();
        let backend = Arc::new(MemoryElastiCache::new(config.region.clone(), config.account_id.clone()));
        let shared = backend.clone();
        let connect: Connect = Arc::new(
            move |_: &Session, _: &AwsAccountId| -> Result<Arc<dyn ElastiCacheApi>, ControllerError> {
                Ok(shared.clone())
            },
        );
        let factory = Arc::new(ElastiCacheManagerFactory::replication_groups(
            connect,
            Arc::new(Metrics::new()),
        ));
        let store = Arc::new(MemoryStore::<ReplicationGroup>::new());
        let reconciler = Reconciler::<ReplicationGroup>::new(factory, store.clone(), runtime_with(config));

        store.insert(group(1, 1, false));
        let outcome = reconciler.reconcile("default", "rg").await.unwrap();
        assert_eq!(ReconcileOutcome::RequeueAfter(DEFAULT_REQUEUE_AFTER), outcome);
        let outcome = reconciler.reconcile("default", "rg").await.unwrap();
        assert_eq!(ReconcileOutcome::RequeueAfter(DEFAULT_REQUEUE_AFTER), outcome);

        backend.settle();
        let outcome = reconciler.reconcile("default", "rg").await.unwrap();
        assert_eq!(ReconcileOutcome::Synced, outcome);
        let rg = store.object("default", "rg").unwrap();
        assert_eq!(Some("available"), rg.status.unwrap().status.as_deref());
    }

    #[tokio::test]
    async fn adopted_group_is_in_sync() {
        let config = test_config();
        let backend = Arc::new(MemoryElastiCache::new(config.region.clone(), config.account_id.clone()));
        backend
            .create_replication_group(&CreateReplicationGroup {
                id: "legacy".to_string(),
                num_node_groups: 2,
                replicas_per_node_group: 1,
                automatic_failover_enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        backend.settle();
        let shared = backend.clone();
        let connect: Connect = Arc::new(
            move |_: &Session, _: &AwsAccountId| -> Result<Arc<dyn ElastiCacheApi>, ControllerError> {
                Ok(shared.clone())
            },
        );
        let factory = Arc::new(ElastiCacheManagerFactory::replication_groups(
            connect,
            Arc::new(Metrics::new()),
        ));
        let store = Arc::new(MemoryStore::<ReplicationGroup>::new());
        let rt = runtime_with(config);
        let reconciler = Arc::new(Reconciler::<ReplicationGroup>::new(factory, store.clone(), rt.clone()));
        let adopter: Arc<dyn Adopter> = reconciler.clone();
        let requests = Arc::new(MemoryStore::<AdoptedResource>::new());
        let adoption = AdoptionReconciler::new(requests.clone(), vec![adopter], rt);

        let mut request = AdoptedResource::new(
            "adopt-legacy",
            AdoptedResourceSpec {
                kubernetes: TargetKubernetesResource {
                    group: "elasticache.services.k8s.aws".to_string(),
                    kind: "ReplicationGroup".to_string(),
                    metadata: None,
                },
                aws: AwsIdentifiers {
                    name_or_id: Some("legacy".to_string()),
                    ..Default::default()
                },
            },
        );
        request.metadata.namespace = Some("default".to_string());
        requests.insert(request);
        adoption.reconcile("default", "adopt-legacy").await.unwrap();

        let rg = store.object("default", "adopt-legacy").unwrap();
        assert_eq!("legacy", rg.spec.replication_group_id);
        assert_eq!(Some(2), rg.spec.num_node_groups);
        assert_eq!(Some(true), rg.spec.automatic_failover_enabled);

        backend.clear_calls();
        let outcome = reconciler.reconcile("default", "adopt-legacy").await.unwrap();
        assert_eq!(ReconcileOutcome::Synced, outcome);
        assert_eq!(vec!["DescribeReplicationGroups"], backend.calls());
    }
}
