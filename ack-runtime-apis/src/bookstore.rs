use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ack_status, Condition, ResourceMetadata};

/// A book in the bookstore service.
///
/// A book is either created from `title` and `author`, or imported from an
/// `importDocument`, but never both.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "bookstore.services.k8s.aws",
    version = "v1alpha1",
    kind = "Book",
    derive = "PartialEq",
    status = "BookStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Synced",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"ACK.ResourceSynced\")].status",
        "description": "Whether the backend book matches the spec."
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct BookSpec {
    /// Backend name of the book, defaults to `metadata.name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// JSON document `{"title": .., "author": ..}` to import the book from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_document: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_resource_metadata: Option<ResourceMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
}

ack_status!(BookStatus);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_json() {
        let spec: BookSpec = serde_json::from_str(
            r#"{"title": "Dune", "author": "Frank Herbert", "tags": {"env": "dev"}}"#,
        )
        .unwrap();
        assert_eq!(Some("Dune"), spec.title.as_deref());
        assert!(spec.import_document.is_none());
        assert_eq!(
            r#"{"title":"Dune","author":"Frank Herbert","tags":{"env":"dev"}}"#,
            serde_json::to_string(&spec).unwrap()
        );
    }

    #[test]
    fn status_json() {
        let status = BookStatus {
            ack_resource_metadata: Some(ResourceMetadata {
                arn: Some("arn".to_string()),
                owner_account_id: None,
            }),
            conditions: vec![],
            create_time: None,
        };
        assert_eq!(
            r#"{"ackResourceMetadata":{"arn":"arn"}}"#,
            serde_json::to_string(&status).unwrap()
        );
    }
}
