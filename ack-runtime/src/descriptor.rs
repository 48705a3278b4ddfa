use std::marker::PhantomData;

use ack_runtime_apis::ANNOTATION_ADOPTED;
use kube::{
    Resource, ResourceExt,
    api::{ApiResource, DynamicObject},
};
use serde_json::Value;

use crate::{
    compare::{self, CompareOptions, Reporter},
    errors::ControllerError,
    types::{AwsResource, AwsResourceDescriptor, GroupKind},
};

/// The finalizer marking a resource of the given kind as managed.
pub fn finalizer_for(group_kind: &GroupKind) -> String {
    format!("finalizers.{}/{}", group_kind.group, group_kind.kind)
}

/// Whether `res` was materialized from an existing backend resource.
pub fn is_adopted<K: Resource>(res: &K) -> bool {
    res.annotations()
        .get(ANNOTATION_ADOPTED)
        .map_or(false, |v| v.eq_ignore_ascii_case("true"))
}

/// [`AwsResourceDescriptor`] which compares specs structurally.
pub struct ResourceDescriptor<R> {
    group_kind: GroupKind,
    finalizer: String,
    options: CompareOptions,
    _resource: PhantomData<fn() -> R>,
}

impl<R: AwsResource> ResourceDescriptor<R> {
    pub fn new() -> Self {
        Self::with_options(Default::default())
    }

    pub fn with_options(options: CompareOptions) -> Self {
        let group_kind = GroupKind::of::<R>();
        Self {
            finalizer: finalizer_for(&group_kind),
            group_kind,
            options,
            _resource: PhantomData,
        }
    }

    pub fn finalizer(&self) -> &str {
        self.finalizer.as_str()
    }
}

impl<R: AwsResource> Default for ResourceDescriptor<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: AwsResource> AwsResourceDescriptor<R> for ResourceDescriptor<R> {
    fn group_kind(&self) -> GroupKind {
        self.group_kind.clone()
    }

    fn empty_object(&self) -> DynamicObject {
        DynamicObject::new("", &ApiResource::erase::<R>(&()))
            .data(serde_json::json!({ "spec": {} }))
    }

    fn resource_from_object(&self, obj: DynamicObject) -> Result<R, ControllerError> {
        let mut value = serde_json::to_value(obj)?;
        let map = value
            .as_object_mut()
            .ok_or_else(|| ControllerError::invariant("object did not serialize to a map"))?;
        // Spec fields missing from the object take their default values.
        let mut spec = serde_json::to_value(R::Spec::default())?;
        if let (Some(defaults), Some(Value::Object(given))) = (spec.as_object_mut(), map.remove("spec")) {
            defaults.extend(given);
        }
        map.insert("spec".to_string(), spec);
        Ok(serde_json::from_value(value)?)
    }

    fn equal(&self, a: &R, b: &R) -> Result<bool, ControllerError> {
        Ok(compare::equal(a.spec(), b.spec(), self.options)?)
    }

    fn diff(&self, a: &R, b: &R) -> Result<Reporter, ControllerError> {
        Ok(compare::diff(a.spec(), b.spec(), self.options)?)
    }

    fn mark_adopted(&self, res: &mut R) {
        res.annotations_mut()
            .insert(ANNOTATION_ADOPTED.to_string(), "true".to_string());
    }

    fn is_managed(&self, res: &R) -> bool {
        res.finalizers().iter().any(|f| f == &self.finalizer)
    }

    fn mark_managed(&self, res: &mut R) {
        if !self.is_managed(res) {
            res.finalizers_mut().push(self.finalizer.clone());
        }
    }

    fn mark_unmanaged(&self, res: &mut R) {
        let finalizer = self.finalizer.as_str();
        res.finalizers_mut().retain(|f| f != finalizer);
    }

    fn update_cr_status(&self, res: &mut R) -> Result<bool, ControllerError> {
        // Later entries win, as they were set last.
        let conditions = res.conditions_mut();
        let len = conditions.len();
        let mut seen = std::collections::HashSet::new();
        let mut deduped: Vec<_> = conditions
            .drain(..)
            .rev()
            .filter(|c| seen.insert(c.type_.clone()))
            .collect();
        deduped.reverse();
        *conditions = deduped;
        Ok(conditions.len() != len)
    }
}
