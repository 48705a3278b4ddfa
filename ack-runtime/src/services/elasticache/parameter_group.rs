use std::collections::BTreeMap;

use ack_runtime_apis::{
    CONDITION_TYPE_RESOURCE_SYNCED, Condition, ConditionStatus, set_condition,
    elasticache::{CacheParameterGroup, Parameter, ParameterNameValue},
};
use async_trait::async_trait;

use super::{
    ElastiCache,
    sdk::{CACHE_PARAMETER_GROUP_NOT_FOUND, MAX_PARAMETERS_PER_CALL},
};
use crate::{
    compare::Reporter,
    errors::ControllerError,
    hooks::{Page, paginate, three_way_delta},
    types::{AwsResource, AwsResourceManager},
};

const USER_SOURCE: &str = "user";

fn name_values(group: &CacheParameterGroup) -> BTreeMap<String, String> {
    group
        .spec
        .parameter_name_values
        .iter()
        .flatten()
        .map(|p| (p.parameter_name.clone(), p.parameter_value.clone().unwrap_or_default()))
        .collect()
}

/// The user defined parameters of `parameters`, listed in the order of
/// `desired` first so an unchanged list does not show up as drift.
fn user_parameters(parameters: &[Parameter], desired: Option<&Vec<ParameterNameValue>>) -> Option<Vec<ParameterNameValue>> {
    let mut user: BTreeMap<&str, &Parameter> = parameters
        .iter()
        .filter(|p| p.source.as_deref() == Some(USER_SOURCE))
        .map(|p| (p.parameter_name.as_str(), p))
        .collect();
    let mut values = Vec::with_capacity(user.len());
    for d in desired.into_iter().flatten() {
        if let Some(p) = user.remove(d.parameter_name.as_str()) {
            values.push(ParameterNameValue {
                parameter_name: p.parameter_name.clone(),
                parameter_value: p.parameter_value.clone(),
            });
        }
    }
    values.extend(user.into_values().map(|p| ParameterNameValue {
        parameter_name: p.parameter_name.clone(),
        parameter_value: p.parameter_value.clone(),
    }));
    if values.is_empty() { None } else { Some(values) }
}

pub struct CacheParameterGroupManager {
    ec: ElastiCache,
}

impl CacheParameterGroupManager {
    pub fn new(ec: ElastiCache) -> Self {
        Self { ec }
    }

    async fn describe_parameters(&self, name: &str) -> Result<Vec<Parameter>, ControllerError> {
        paginate(|marker| async move {
            let page: Page<Parameter> = self.ec.record(
                "READ_MANY",
                "DescribeCacheParameters",
                CACHE_PARAMETER_GROUP_NOT_FOUND,
                self.ec.api.describe_cache_parameters(name, marker).await,
            )?;
            Ok(page)
        })
        .await
    }

    async fn modify_parameters(&self, name: &str, parameters: &[ParameterNameValue]) -> Result<(), ControllerError> {
        for batch in parameters.chunks(MAX_PARAMETERS_PER_CALL) {
            self.ec.record(
                "UPDATE",
                "ModifyCacheParameterGroup",
                CACHE_PARAMETER_GROUP_NOT_FOUND,
                self.ec.api.modify_cache_parameter_group(name, batch).await,
            )?;
        }
        Ok(())
    }

    async fn reset_parameters(&self, name: &str, parameters: &[ParameterNameValue]) -> Result<(), ControllerError> {
        for batch in parameters.chunks(MAX_PARAMETERS_PER_CALL) {
            self.ec.record(
                "UPDATE",
                "ResetCacheParameterGroup",
                CACHE_PARAMETER_GROUP_NOT_FOUND,
                self.ec.api.reset_cache_parameter_group(name, false, batch).await,
            )?;
        }
        Ok(())
    }
}

fn with_values(values: BTreeMap<String, String>) -> Vec<ParameterNameValue> {
    values
        .into_iter()
        .map(|(parameter_name, value)| ParameterNameValue {
            parameter_name,
            parameter_value: Some(value),
        })
        .collect()
}

#[async_trait]
impl AwsResourceManager<CacheParameterGroup> for CacheParameterGroupManager {
    async fn read_one(&self, res: &CacheParameterGroup) -> Result<CacheParameterGroup, ControllerError> {
        let name = res.spec.cache_parameter_group_name.as_str();
        let data = self.ec.record(
            "READ_ONE",
            "DescribeCacheParameterGroups",
            CACHE_PARAMETER_GROUP_NOT_FOUND,
            self.ec.api.describe_cache_parameter_group(name).await,
        )?;
        let parameters = self.describe_parameters(name).await?;
        let mut latest = res.clone();
        latest.spec.cache_parameter_group_family = data.family;
        latest.spec.description = data.description;
        latest.spec.parameter_name_values = user_parameters(&parameters, res.spec.parameter_name_values.as_ref());
        latest.resource_metadata_mut().arn = Some(data.arn);
        latest.status_mut().parameters = Some(parameters);
        Ok(latest)
    }

    async fn create(&self, res: &CacheParameterGroup) -> Result<CacheParameterGroup, ControllerError> {
        let spec = &res.spec;
        let data = self.ec.record(
            "CREATE",
            "CreateCacheParameterGroup",
            CACHE_PARAMETER_GROUP_NOT_FOUND,
            self.ec
                .api
                .create_cache_parameter_group(
                    &spec.cache_parameter_group_name,
                    &spec.cache_parameter_group_family,
                    spec.description.as_deref(),
                )
                .await,
        )?;
        let mut created = res.clone();
        created.resource_metadata_mut().arn = Some(data.arn);
        // Parameters can only be set on an existing group, the next
        // reconciliation applies them as an update.
        if !name_values(res).is_empty() {
            set_condition(
                created.conditions_mut(),
                Condition::new(CONDITION_TYPE_RESOURCE_SYNCED, ConditionStatus::False)
                    .with_message("parameters are not yet applied"),
            );
        }
        Ok(created)
    }

    async fn update(
        &self,
        desired: &CacheParameterGroup,
        latest: &CacheParameterGroup,
        diff: &Reporter,
    ) -> Result<CacheParameterGroup, ControllerError> {
        let name = desired.spec.cache_parameter_group_name.as_str();
        if desired.spec.cache_parameter_group_family != latest.spec.cache_parameter_group_family {
            return Err(ControllerError::terminal(format!(
                "cacheParameterGroupFamily of {} cannot be changed from {}",
                name, latest.spec.cache_parameter_group_family
            )));
        }
        debug!("updating cache parameter group {}, changed: {}", name, diff.len());
        let desired_values = name_values(desired);
        let latest_values = name_values(latest);
        if desired_values.is_empty() {
            if !latest_values.is_empty() {
                self.ec.record(
                    "UPDATE",
                    "ResetCacheParameterGroup",
                    CACHE_PARAMETER_GROUP_NOT_FOUND,
                    self.ec.api.reset_cache_parameter_group(name, true, &[]).await,
                )?;
            }
        } else {
            let delta = three_way_delta(&desired_values, &latest_values);
            let resets: Vec<ParameterNameValue> = delta
                .removed
                .into_iter()
                .map(|parameter_name| ParameterNameValue {
                    parameter_name,
                    parameter_value: None,
                })
                .collect();
            self.reset_parameters(name, &resets).await?;
            self.modify_parameters(name, &with_values(delta.modified)).await?;
            self.modify_parameters(name, &with_values(delta.added)).await?;
        }
        let mut updated = latest.clone();
        updated.spec.parameter_name_values = desired.spec.parameter_name_values.clone();
        Ok(updated)
    }

    async fn delete(&self, res: &CacheParameterGroup) -> Result<(), ControllerError> {
        match self.ec.record(
            "DELETE",
            "DeleteCacheParameterGroup",
            CACHE_PARAMETER_GROUP_NOT_FOUND,
            self.ec
                .api
                .delete_cache_parameter_group(&res.spec.cache_parameter_group_name)
                .await,
        ) {
            Err(ControllerError::NotFound) => Ok(()),
            other => other,
        }
    }

    fn arn_from_name(&self, name: &str) -> String {
        self.ec.arn("parametergroup", name)
    }
}
