use std::fmt;

use ack_runtime_apis::{AwsRegion, AwsResourceName};

use crate::{config::Config, errors::ControllerError, types::GroupKind};

/// Credentials used for backend calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    /// The controller's own credentials.
    Default,
    /// Assume a role in the owner account.
    AssumeRole {
        role_arn: AwsResourceName,
        session_name: String,
    },
}

/// Everything a backend client needs to talk to one account in one region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub region: AwsRegion,
    pub credentials: CredentialSource,
    pub endpoint_url: Option<String>,
}

impl Session {
    pub fn new(
        config: &Config,
        region: &AwsRegion,
        role_arn: Option<&str>,
        group_kind: &GroupKind,
    ) -> Result<Self, ControllerError> {
        if region.as_str().is_empty() {
            return Err(ControllerError::Config(format!(
                "no region resolved for {}",
                group_kind
            )));
        }
        let credentials = match role_arn.filter(|r| !r.is_empty()) {
            Some(role_arn) => CredentialSource::AssumeRole {
                role_arn: role_arn.to_string(),
                session_name: session_name(group_kind),
            },
            None => CredentialSource::Default,
        };
        Ok(Self {
            region: region.clone(),
            credentials,
            endpoint_url: config.endpoint_url.clone(),
        })
    }

    pub fn role_arn(&self) -> Option<&str> {
        match &self.credentials {
            CredentialSource::AssumeRole { role_arn, .. } => Some(role_arn.as_str()),
            CredentialSource::Default => None,
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.credentials {
            CredentialSource::Default => write!(f, "{} (default credentials)", self.region),
            CredentialSource::AssumeRole { role_arn, .. } => {
                write!(f, "{} (role {})", self.region, role_arn)
            }
        }
    }
}

fn session_name(group_kind: &GroupKind) -> String {
    let kind = group_kind.kind.to_lowercase();
    let service = group_kind.group.split('.').next().unwrap_or_default();
    // The backend limits session names to 64 characters.
    let mut name = format!("ack-{}-{}", service, kind);
    name.truncate(64);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use ack_runtime_apis::bookstore::Book;

    #[test]
    fn default_credentials_without_role() {
        let s = Session::new(&test_config(), &"us-west-2".into(), None, &GroupKind::of::<Book>())
            .unwrap();
        assert_eq!(CredentialSource::Default, s.credentials);
        assert!(s.role_arn().is_none());
        let s = Session::new(&test_config(), &"us-west-2".into(), Some(""), &GroupKind::of::<Book>())
            .unwrap();
        assert_eq!(CredentialSource::Default, s.credentials);
    }

    #[test]
    fn assume_role_with_session_name() {
        let s = Session::new(
            &test_config(),
            &"eu-central-1".into(),
            Some("arn:aws:iam::219876543210:role/ack"),
            &GroupKind::of::<Book>(),
        )
        .unwrap();
        assert_eq!(
            CredentialSource::AssumeRole {
                role_arn: "arn:aws:iam::219876543210:role/ack".to_string(),
                session_name: "ack-bookstore-book".to_string(),
            },
            s.credentials
        );
        assert_eq!("eu-central-1", s.region.as_str());
    }

    #[test]
    fn empty_region_is_rejected() {
        let r = Session::new(&test_config(), &"".into(), None, &GroupKind::of::<Book>());
        assert!(matches!(r, Err(ControllerError::Config(_))));
    }
}
