use std::collections::BTreeMap;

use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::{Resource, ResourceExt};

/// Placeholder replaced with the current UTC time.
pub const UTC_NOW: &str = "%UTCNOW%";

/// Placeholder replaced with the namespace of the tagged custom resource.
pub const KUBERNETES_NAMESPACE: &str = "%KUBERNETES_NAMESPACE%";

/// Parse `key=value` default tags and expand their placeholders for `obj`.
///
/// Malformed entries (no `=` or an empty key) are skipped.
pub fn get_default_tags<K: Resource>(resource_tags: &[String], obj: &K) -> BTreeMap<String, String> {
    let namespace = obj.namespace().unwrap_or_default();
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    resource_tags
        .iter()
        .filter_map(|t| t.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| {
            let v = v
                .replace(UTC_NOW, now.as_str())
                .replace(KUBERNETES_NAMESPACE, namespace.as_str());
            (k.to_string(), v)
        })
        .collect()
}

/// Default tag keys, without expanding values.
pub fn default_tag_keys(resource_tags: &[String]) -> Vec<String> {
    resource_tags
        .iter()
        .filter_map(|t| t.split_once('='))
        .map(|(k, _)| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

/// Merge defaults and user tags, user tags win.
pub fn merge_tags(
    defaults: BTreeMap<String, String>,
    user: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut tags = defaults;
    if let Some(user) = user {
        tags.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    tags
}

/// Hide observed tags which were added as defaults and are not part of the
/// desired tags, so they do not show up as drift.
pub fn strip_default_tags(
    observed: BTreeMap<String, String>,
    desired: Option<&BTreeMap<String, String>>,
    resource_tags: &[String],
) -> BTreeMap<String, String> {
    let defaults = default_tag_keys(resource_tags);
    observed
        .into_iter()
        .filter(|(k, _)| {
            !defaults.contains(k) || desired.map_or(false, |d| d.contains_key(k))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::book;

    fn tags(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn expands_placeholders() {
        let b = book("dune", "Dune", "Frank Herbert");
        let t = get_default_tags(
            &tags(&["services.k8s.aws/namespace=%KUBERNETES_NAMESPACE%", "created=%UTCNOW%"]),
            &b,
        );
        assert_eq!("default", t["services.k8s.aws/namespace"]);
        assert!(t["created"].ends_with('Z'));
        assert!(!t["created"].contains('%'));
    }

    #[test]
    fn skips_malformed_entries() {
        let b = book("dune", "Dune", "Frank Herbert");
        let t = get_default_tags(&tags(&["novalue", "=orphan", " team = books "]), &b);
        assert_eq!(1, t.len());
        assert_eq!("books", t["team"]);
    }

    #[test]
    fn user_tags_win() {
        let defaults = BTreeMap::from([("team".to_string(), "ack".to_string())]);
        let user = BTreeMap::from([("team".to_string(), "books".to_string())]);
        assert_eq!("books", merge_tags(defaults, Some(&user))["team"]);
    }

    #[test]
    fn strips_defaults_not_desired() {
        let observed = BTreeMap::from([
            ("team".to_string(), "ack".to_string()),
            ("env".to_string(), "dev".to_string()),
        ]);
        let stripped = strip_default_tags(observed.clone(), None, &tags(&["team=ack"]));
        assert_eq!(vec!["env"], stripped.keys().collect::<Vec<_>>());
        let desired = BTreeMap::from([("team".to_string(), "ack".to_string())]);
        let kept = strip_default_tags(observed, Some(&desired), &tags(&["team=ack"]));
        assert_eq!(2, kept.len());
    }
}
