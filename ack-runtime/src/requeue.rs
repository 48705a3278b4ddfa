//! Typed errors carrying requeue intent.
//!
//! A resource manager returns one of these when it hits an expected wait
//! condition, e.g. a backend resource which is not yet in a mutable state. The
//! reconciler translates them into a requeue without logging an error.

use std::time::Duration;

/// Default delay of [`RequeueNeededAfter`].
pub const DEFAULT_REQUEUE_AFTER: Duration = Duration::from_secs(30);

/// Retry as soon as possible.
#[derive(thiserror::Error, Debug)]
#[error("requeue needed: {err}")]
pub struct RequeueNeeded {
    #[source]
    err: anyhow::Error,
}

/// Retry after an explicit delay.
#[derive(thiserror::Error, Debug)]
#[error("requeue needed after {duration:?}: {err}")]
pub struct RequeueNeededAfter {
    #[source]
    err: anyhow::Error,
    duration: Duration,
}

impl RequeueNeededAfter {
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

pub fn needed(err: impl Into<anyhow::Error>) -> RequeueNeeded {
    RequeueNeeded { err: err.into() }
}

pub fn needed_after(err: impl Into<anyhow::Error>, duration: Duration) -> RequeueNeededAfter {
    RequeueNeededAfter {
        err: err.into(),
        duration,
    }
}

/// Shorthand for [`needed_after`] with [`DEFAULT_REQUEUE_AFTER`].
pub fn needed_after_default(err: impl Into<anyhow::Error>) -> RequeueNeededAfter {
    needed_after(err, DEFAULT_REQUEUE_AFTER)
}

/// Walks the `source` chain of `err` looking for a requeue sentinel.
pub(crate) fn find_in_chain(err: &(dyn std::error::Error + 'static)) -> Option<Duration> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(r) = e.downcast_ref::<RequeueNeededAfter>() {
            return Some(r.duration());
        }
        if e.downcast_ref::<RequeueNeeded>().is_some() {
            return Some(Duration::ZERO);
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(thiserror::Error, Debug)]
    #[error("outer")]
    struct Outer(#[source] RequeueNeededAfter);

    #[test]
    fn default_delay() {
        let r = needed_after_default(anyhow::anyhow!("not available"));
        assert_eq!(Duration::from_secs(30), r.duration());
        let cause = std::error::Error::source(&r).map(|e| e.to_string());
        assert_eq!(Some("not available".to_string()), cause);
    }

    #[test]
    fn found_behind_other_errors() {
        let e = Outer(needed_after(anyhow::anyhow!("x"), Duration::from_secs(3)));
        assert_eq!(Some(Duration::from_secs(3)), find_in_chain(&e));
    }

    #[test]
    fn plain_error_has_no_requeue() {
        let e = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(None, find_in_chain(&e));
    }
}
