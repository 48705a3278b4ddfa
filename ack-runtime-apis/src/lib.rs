use std::{collections::BTreeMap, fmt};

use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::CustomResource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod bookstore;
pub mod elasticache;

/// The API group shared by all controllers, hosting the `AdoptedResource` kind.
pub const API_GROUP: &str = "services.k8s.aws";

/// Prefix of every annotation key read or written by the controllers.
pub const ANNOTATION_PREFIX: &str = "services.k8s.aws/";

/// Set to `true` on a custom resource that was materialized from an existing
/// backend resource. Such resources are never created on the backend.
pub const ANNOTATION_ADOPTED: &str = "services.k8s.aws/adopted";

/// Owner account of a resource (custom resource or namespace level).
pub const ANNOTATION_OWNER_ACCOUNT_ID: &str = "services.k8s.aws/owner-account-id";

/// Region of a single custom resource.
pub const ANNOTATION_REGION: &str = "services.k8s.aws/region";

/// Default region for all custom resources of a namespace.
pub const ANNOTATION_DEFAULT_REGION: &str = "services.k8s.aws/default-region";

/// Backend resource and custom resource agree.
pub const CONDITION_TYPE_RESOURCE_SYNCED: &str = "ACK.ResourceSynced";

/// The spec cannot be reconciled until a user edits it.
pub const CONDITION_TYPE_TERMINAL: &str = "ACK.Terminal";

/// Set on an `AdoptedResource` once its target was materialized.
pub const CONDITION_TYPE_ADOPTED: &str = "ACK.Adopted";

/// AWS account ID (12 digits).
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct AwsAccountId(pub String);

impl AwsAccountId {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for AwsAccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AwsAccountId {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

/// AWS region name, e.g. `us-west-2`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct AwsRegion(pub String);

impl AwsRegion {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for AwsRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AwsRegion {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

/// Amazon Resource Name.
pub type AwsResourceName = String;

/// Status of a [`Condition`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(v: bool) -> Self {
        if v {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// Type of the condition, e.g. `ACK.ResourceSynced`.
    #[serde(rename = "type")]
    pub type_: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: ConditionStatus,

    /// lastTransitionTime is the last time the condition transitioned from one status to another.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Programmatic identifier of the reason for the condition's last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human readable message with details about the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// The `.metadata.generation` the condition was set based upon.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(tpe: &str, status: ConditionStatus) -> Self {
        Self {
            type_: tpe.to_string(),
            status,
            last_transition_time: None,
            reason: None,
            message: None,
            observed_generation: None,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Find the condition of the given type.
pub fn find_condition<'a>(conditions: &'a [Condition], tpe: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == tpe)
}

/// Insert or replace the condition with the same type as `condition`.
///
/// The transition time is only bumped if the status actually changed, so
/// setting the same condition twice leaves the collection unchanged.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let unchanged = existing.status == condition.status;
            condition.last_transition_time = match existing.last_transition_time.take() {
                Some(t) if unchanged => Some(t),
                _ => now(),
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = now();
            conditions.push(condition);
        }
    }
}

/// Remove the condition of the given type, returns `true` if it was present.
pub fn remove_condition(conditions: &mut Vec<Condition>, tpe: &str) -> bool {
    let len = conditions.len();
    conditions.retain(|c| c.type_ != tpe);
    conditions.len() != len
}

fn now() -> Option<String> {
    Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Backend identity of a resource, populated by the controller.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    /// ARN of the backend resource, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arn: Option<AwsResourceName>,
    /// The account owning the backend resource.
    #[serde(rename = "ownerAccountID", skip_serializing_if = "Option::is_none")]
    pub owner_account_id: Option<AwsAccountId>,
}

/// Common shape of the status sub-resource of every managed kind.
pub trait AckStatus: Default {
    fn ack_resource_metadata(&self) -> Option<&ResourceMetadata>;
    fn ack_resource_metadata_mut(&mut self) -> &mut ResourceMetadata;
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

/// Implements [`AckStatus`] for a status struct with `ack_resource_metadata`
/// and `conditions` fields.
#[macro_export]
macro_rules! ack_status {
    ($status:ty) => {
        impl $crate::AckStatus for $status {
            fn ack_resource_metadata(&self) -> Option<&$crate::ResourceMetadata> {
                self.ack_resource_metadata.as_ref()
            }

            fn ack_resource_metadata_mut(&mut self) -> &mut $crate::ResourceMetadata {
                self.ack_resource_metadata.get_or_insert_with(Default::default)
            }

            fn conditions(&self) -> &[$crate::Condition] {
                self.conditions.as_slice()
            }

            fn conditions_mut(&mut self) -> &mut Vec<$crate::Condition> {
                &mut self.conditions
            }
        }
    };
}

/// Identifiers of an existing backend resource.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsIdentifiers {
    #[serde(rename = "nameOrID", skip_serializing_if = "Option::is_none")]
    pub name_or_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arn: Option<AwsResourceName>,
    /// Kind specific identifiers, e.g. a parent resource name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_keys: Option<BTreeMap<String, String>>,
}

/// Metadata of the custom resource to materialize during adoption.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct PartialObjectMeta {
    /// Defaults to the name of the `AdoptedResource`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Defaults to the namespace of the `AdoptedResource`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// The custom resource kind to materialize.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct TargetKubernetesResource {
    pub group: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PartialObjectMeta>,
}

impl TargetKubernetesResource {
    /// The `Kind.group` key used to look up the responsible controller.
    pub fn group_kind(&self) -> String {
        if self.group.is_empty() {
            self.kind.clone()
        } else {
            format!("{}.{}", self.kind, self.group)
        }
    }
}

/// Request to bring an existing backend resource under management.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "services.k8s.aws",
    version = "v1alpha1",
    kind = "AdoptedResource",
    derive = "PartialEq",
    status = "AdoptedResourceStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Adopted",
        "type": "string",
        "jsonPath": ".status.adoptionStatus",
        "description": "Whether the backend resource was materialized as a custom resource."
    }"#
)]
pub struct AdoptedResourceSpec {
    pub kubernetes: TargetKubernetesResource,
    pub aws: AwsIdentifiers,
}

/// Progress of an adoption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum AdoptionStatus {
    Adopted,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdoptedResourceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adoption_status: Option<AdoptionStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl AdoptedResource {
    pub fn is_adopted(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.adoption_status)
            .map_or(false, |s| s == AdoptionStatus::Adopted)
    }
}
