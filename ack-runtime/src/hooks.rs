//! Building blocks for resource managers whose backend lifecycle does not map
//! onto a single create, read, update and delete call each.

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
};

use crate::{compare::Reporter, errors::ControllerError, requeue};

/// How an [`UpdatePlan`] runs its pending steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanMode {
    /// Run every pending step in order, the first failure aborts the rest.
    All,
    /// Run only the first pending step. Used when a step leaves the backend
    /// resource in a state where the next step cannot run yet.
    FirstOnly,
}

type Predicate<R> = Box<dyn Fn(&R, &R, &Reporter) -> bool + Send + Sync>;

/// Ordered `(predicate, step)` pairs of an update.
///
/// A step is pending if its predicate returns `true` for `(desired, latest)`
/// and the differences reported between them.
pub struct UpdatePlan<R, S> {
    mode: PlanMode,
    steps: Vec<(S, Predicate<R>)>,
}

impl<R, S: Copy> UpdatePlan<R, S> {
    pub fn new(mode: PlanMode) -> Self {
        Self {
            mode,
            steps: Vec::new(),
        }
    }

    pub fn step<F>(mut self, step: S, predicate: F) -> Self
    where
        F: Fn(&R, &R, &Reporter) -> bool + Send + Sync + 'static,
    {
        self.steps.push((step, Box::new(predicate)));
        self
    }

    /// The steps to run for `desired` and `latest`, in plan order.
    pub fn pending(&self, desired: &R, latest: &R, diff: &Reporter) -> Vec<S> {
        let pending = self
            .steps
            .iter()
            .filter(|(_, needed)| needed(desired, latest, diff))
            .map(|(step, _)| *step);
        match self.mode {
            PlanMode::All => pending.collect(),
            PlanMode::FirstOnly => pending.take(1).collect(),
        }
    }

    /// Run the pending steps, threading the result of each step into the
    /// next one.
    pub async fn run<F, Fut>(&self, desired: &R, latest: R, diff: &Reporter, mut apply: F) -> Result<R, ControllerError>
    where
        F: FnMut(S, R) -> Fut,
        Fut: Future<Output = Result<R, ControllerError>>,
    {
        let mut current = latest;
        for step in self.pending(desired, &current, diff) {
            current = apply(step, current).await?;
        }
        Ok(current)
    }
}

/// A page of a paginated listing.
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor of the next page, `None` or empty if this is the last one.
    pub marker: Option<String>,
}

/// Collect all items of a marker based listing.
pub async fn paginate<T, F, Fut>(mut fetch: F) -> Result<Vec<T>, ControllerError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, ControllerError>>,
{
    let mut items = Vec::new();
    let mut marker = None;
    loop {
        let page = fetch(marker).await?;
        items.extend(page.items);
        match page.marker.filter(|m| !m.is_empty()) {
            Some(next) => marker = Some(next),
            None => return Ok(items),
        }
    }
}

/// Changes needed to turn `latest` into `desired`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delta {
    pub removed: BTreeSet<String>,
    pub modified: BTreeMap<String, String>,
    pub added: BTreeMap<String, String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.modified.is_empty() && self.added.is_empty()
    }
}

/// Three-way delta of two key/value sets. An empty desired value counts as
/// unset.
pub fn three_way_delta(desired: &BTreeMap<String, String>, latest: &BTreeMap<String, String>) -> Delta {
    let mut delta = Delta::default();
    for (k, v) in latest {
        match desired.get(k) {
            None => {
                delta.removed.insert(k.clone());
            }
            Some(d) if d.is_empty() => {
                delta.removed.insert(k.clone());
            }
            Some(d) if d != v => {
                delta.modified.insert(k.clone(), d.clone());
            }
            Some(_) => (),
        }
    }
    for (k, v) in desired {
        if !v.is_empty() && !latest.contains_key(k) {
            delta.added.insert(k.clone(), v.clone());
        }
    }
    delta
}

/// Fail with a requeue after the default delay unless `ready`.
pub fn require_ready(ready: bool, what: &str) -> Result<(), ControllerError> {
    if ready {
        Ok(())
    } else {
        Err(requeue::needed_after_default(anyhow::anyhow!("{} is not available for modification", what)).into())
    }
}

/// Fail terminally if any of `forbidden` is set alongside `field`.
pub fn forbid_with(field: &str, forbidden: &[(&str, bool)]) -> Result<(), ControllerError> {
    let offending: Vec<String> = forbidden
        .iter()
        .filter(|(_, set)| *set)
        .map(|(name, _)| format!("'{}'", name))
        .collect();
    if offending.is_empty() {
        Ok(())
    } else {
        Err(ControllerError::terminal(format!(
            "{} field(s) cannot be used together with '{}'",
            offending.join(" and "),
            field
        )))
    }
}

/// Fail terminally unless all of `required` are set.
pub fn require_fields(required: &[(&str, bool)], context: &str) -> Result<(), ControllerError> {
    let missing: Vec<String> = required
        .iter()
        .filter(|(_, set)| !*set)
        .map(|(name, _)| format!("'{}'", name))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ControllerError::terminal(format!(
            "{} required {}",
            missing.join(" and "),
            context
        )))
    }
}
