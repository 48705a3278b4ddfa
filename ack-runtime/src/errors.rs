use std::{fmt, time::Duration};

use crate::requeue::{RequeueNeeded, RequeueNeededAfter};

/// Extension methods for Kubernetes API errors.
pub trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }
}

/// Error returned by a backend API call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendError {
    /// Machine readable error code, e.g. `NotFoundException`.
    pub code: String,
    pub message: String,
    /// HTTP status code of the failed call, if the transport reported one.
    pub status_code: Option<u16>,
}

impl BackendError {
    pub fn new(code: &str, message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            status_code,
        }
    }

    /// Status class used to bucket API call metrics.
    pub fn status_class(&self) -> &'static str {
        match self.status_code {
            Some(c) if (400..500).contains(&c) => "4xx",
            Some(c) if c >= 500 => "5xx",
            _ => "error",
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} ({}): {}", self.code, code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for BackendError {}

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    /// The backend has no resource matching the given identifiers.
    #[error("resource not found")]
    NotFound,
    /// The operation is not supported by the resource manager.
    #[error("not implemented")]
    NotImplemented,
    /// The backend resource referenced by an adopted custom resource is gone.
    #[error("adopted resource not found")]
    AdoptedResourceNotFound,
    /// No resource manager factory is registered for the group kind.
    #[error("no resource manager factory registered for {0}")]
    ResourceManagerFactoryNotFound(String),
    /// The spec is invalid and must be edited by a user.
    #[error("{0}")]
    Terminal(String),
    #[error(transparent)]
    Requeue(#[from] RequeueNeeded),
    #[error(transparent)]
    RequeueAfter(#[from] RequeueNeededAfter),
    /// Backend API error
    #[error("{0}")]
    Backend(#[from] BackendError),
    /// Invalid controller configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A programming error, aborts the current reconcile pass.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("reconcile did not finish within {0:?}")]
    Timeout(Duration),
    #[error("service controller is already bound")]
    AlreadyBound,
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub fn terminal(message: impl Into<String>) -> Self {
        ControllerError::Terminal(message.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        ControllerError::InvariantViolation(message.into())
    }

    pub fn is_temporary(&self) -> bool {
        !matches!(
            self,
            ControllerError::Terminal(_)
                | ControllerError::AdoptedResourceNotFound
                | ControllerError::ResourceManagerFactoryNotFound(_)
                | ControllerError::NotImplemented
                | ControllerError::Config(_)
                | ControllerError::InvariantViolation(_)
        )
    }

    /// Errors which must be fixed by a user edit and are reported through a
    /// condition instead of being retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControllerError::Terminal(_)
                | ControllerError::AdoptedResourceNotFound
                | ControllerError::ResourceManagerFactoryNotFound(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ControllerError::NotFound => true,
            ControllerError::KubeApi(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Requeue delay requested by a requeue sentinel anywhere in the error
    /// chain. `Some(Duration::ZERO)` means requeue immediately.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            ControllerError::Requeue(_) => Some(Duration::ZERO),
            ControllerError::RequeueAfter(r) => Some(r.duration()),
            other => crate::requeue::find_in_chain(other),
        }
    }

    /// Status class used to bucket API call metrics.
    pub fn status_class(&self) -> &'static str {
        match self {
            ControllerError::NotFound => "4xx",
            ControllerError::Backend(e) => e.status_class(),
            _ => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requeue;

    #[test]
    fn backend_status_class() {
        assert_eq!(
            "4xx",
            BackendError::new("NotFoundException", "no", Some(404)).status_class()
        );
        assert_eq!(
            "5xx",
            BackendError::new("InternalFailure", "boom", Some(503)).status_class()
        );
        assert_eq!("error", BackendError::new("Timeout", "slow", None).status_class());
    }

    #[test]
    fn terminal_errors_are_not_temporary() {
        assert!(!ControllerError::terminal("bad").is_temporary());
        assert!(ControllerError::terminal("bad").is_terminal());
        assert!(ControllerError::NotFound.is_temporary());
        assert!(!ControllerError::NotFound.is_terminal());
    }

    #[test]
    fn requeue_after_direct() {
        let e: ControllerError =
            requeue::needed_after(anyhow::anyhow!("not ready"), Duration::from_secs(5)).into();
        assert_eq!(Some(Duration::from_secs(5)), e.requeue_after());
        let e: ControllerError = requeue::needed(anyhow::anyhow!("again")).into();
        assert_eq!(Some(Duration::ZERO), e.requeue_after());
    }

    #[test]
    fn requeue_after_wrapped_in_anyhow() {
        let inner = requeue::needed_after(anyhow::anyhow!("busy"), Duration::from_secs(7));
        let e = ControllerError::Any(anyhow::Error::new(inner).context("while updating"));
        assert_eq!(Some(Duration::from_secs(7)), e.requeue_after());
    }

    #[test]
    fn no_requeue_for_plain_errors() {
        assert_eq!(None, ControllerError::NotFound.requeue_after());
        let e = ControllerError::Any(anyhow::anyhow!("boom"));
        assert_eq!(None, e.requeue_after());
    }
}
