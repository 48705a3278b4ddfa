use std::{net::SocketAddr, time::Duration};

use ack_runtime_apis::{AwsAccountId, AwsRegion};

use crate::errors::ControllerError;

/// Namespace of the controller if `K8S_NAMESPACE` is not set.
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "ack-system";

/// Controller configuration, read from environment variables.
#[derive(Clone, Debug)]
pub struct Config {
    /// Account used for resources without any owner account annotation.
    pub account_id: AwsAccountId,
    /// Region used for resources without any region annotation.
    pub region: AwsRegion,
    pub endpoint_url: Option<String>,
    /// Only watch custom resources in this namespace.
    pub watch_namespace: Option<String>,
    /// Namespace hosting the role account map, never reconciled itself.
    pub controller_namespace: String,
    /// `key=value` tags added to every created backend resource.
    pub resource_tags: Vec<String>,
    pub reconcile_timeout: Duration,
    pub resync_period: Duration,
    pub metrics_addr: SocketAddr,
    pub enable_development_logging: bool,
    pub enable_leader_election: bool,
}

pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(env_var)
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let seconds = |name: &str, default: u64| -> Result<Duration, ControllerError> {
            match lookup(name) {
                Some(v) => v
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| ControllerError::Config(format!("{}: {}", name, e))),
                None => Ok(Duration::from_secs(default)),
            }
        };
        let flag = |name: &str| {
            lookup(name).map_or(false, |v| v.eq_ignore_ascii_case("true") || v == "1")
        };
        let metrics_addr = lookup("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = lookup("METRICS_LISTEN_PORT").unwrap_or_else(|| "8080".to_string());
        let metrics_addr = format!("{}:{}", metrics_addr, metrics_port)
            .parse()
            .map_err(|e| ControllerError::Config(format!("metrics address: {}", e)))?;
        Ok(Config {
            account_id: AwsAccountId(lookup("AWS_ACCOUNT_ID").unwrap_or_default()),
            region: AwsRegion(lookup("AWS_REGION").unwrap_or_default()),
            endpoint_url: lookup("AWS_ENDPOINT_URL"),
            watch_namespace: lookup("ACK_WATCH_NAMESPACE"),
            controller_namespace: lookup("K8S_NAMESPACE")
                .unwrap_or_else(|| DEFAULT_CONTROLLER_NAMESPACE.to_string()),
            resource_tags: lookup("ACK_RESOURCE_TAGS")
                .map(|v| {
                    v.split(',')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            reconcile_timeout: seconds("ACK_RECONCILE_TIMEOUT_SECONDS", 120)?,
            resync_period: seconds("ACK_RESYNC_PERIOD_SECONDS", 36000)?,
            metrics_addr,
            enable_development_logging: flag("ACK_ENABLE_DEVELOPMENT_LOGGING"),
            enable_leader_election: flag("ACK_ENABLE_LEADER_ELECTION"),
        })
    }

    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.account_id.as_str().is_empty() {
            return Err(ControllerError::Config(
                "unable to find account ID, set AWS_ACCOUNT_ID".to_string(),
            ));
        }
        if self.region.as_str().is_empty() {
            return Err(ControllerError::Config(
                "unable to find region, set AWS_REGION".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config::from_lookup(|name| match name {
        "AWS_ACCOUNT_ID" => Some("012345678912".to_string()),
        "AWS_REGION" => Some("us-west-2".to_string()),
        _ => None,
    })
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> Result<Config, ControllerError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let c = from_map(&[("AWS_ACCOUNT_ID", "012345678912"), ("AWS_REGION", "us-west-2")]).unwrap();
        c.validate().unwrap();
        assert_eq!("ack-system", c.controller_namespace);
        assert_eq!(Duration::from_secs(120), c.reconcile_timeout);
        assert_eq!("0.0.0.0:8080".parse::<SocketAddr>().unwrap(), c.metrics_addr);
        assert!(c.resource_tags.is_empty());
        assert!(c.watch_namespace.is_none());
        assert!(!c.enable_leader_election);
    }

    #[test]
    fn account_and_region_are_required() {
        let c = from_map(&[("AWS_REGION", "us-west-2")]).unwrap();
        assert!(matches!(c.validate(), Err(ControllerError::Config(_))));
        let c = from_map(&[("AWS_ACCOUNT_ID", "012345678912"), ("AWS_REGION", "  ")]).unwrap();
        assert!(matches!(c.validate(), Err(ControllerError::Config(_))));
    }

    #[test]
    fn parses_lists_and_numbers() {
        let c = from_map(&[
            ("ACK_RESOURCE_TAGS", "team=books, env=%KUBERNETES_NAMESPACE%,,"),
            ("ACK_RECONCILE_TIMEOUT_SECONDS", "5"),
            ("ACK_ENABLE_DEVELOPMENT_LOGGING", "TRUE"),
            ("K8S_NAMESPACE", "controllers"),
        ])
        .unwrap();
        assert_eq!(vec!["team=books", "env=%KUBERNETES_NAMESPACE%"], c.resource_tags);
        assert_eq!(Duration::from_secs(5), c.reconcile_timeout);
        assert!(c.enable_development_logging);
        assert_eq!("controllers", c.controller_namespace);
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(from_map(&[("ACK_RESYNC_PERIOD_SECONDS", "soon")]).is_err());
    }
}
