//! The reconciliation state machine shared by all kinds.

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use ack_runtime_apis::{
    ANNOTATION_OWNER_ACCOUNT_ID, AckStatus, ANNOTATION_REGION, AwsAccountId, AwsRegion, Condition,
    ConditionStatus, CONDITION_TYPE_RESOURCE_SYNCED, CONDITION_TYPE_TERMINAL, find_condition,
    remove_condition, set_condition,
};
use futures::StreamExt;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::{
    controller::{Action, Controller},
    watcher::Config as WatcherConfig,
};
use tokio::time::sleep;

use crate::{
    cache::Caches,
    config::Config,
    descriptor::is_adopted,
    errors::ControllerError,
    metrics::Metrics,
    requeue,
    session::Session,
    store::ObjectStore,
    types::{AwsResource, AwsResourceDescriptor, AwsResourceManager, AwsResourceManagerFactory, GroupKind},
};

/// Shared state every reconciler reads.
#[derive(Clone)]
pub struct RuntimeContext {
    pub config: Arc<Config>,
    pub caches: Arc<Caches>,
    pub metrics: Arc<Metrics>,
}

/// What the caller should do after a reconcile pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Backend and custom resource agree, check again after the resync period.
    Synced,
    /// Nothing to do until the object changes.
    AwaitChange,
    /// Reconcile again right away.
    Requeue,
    /// Reconcile again after the delay.
    RequeueAfter(Duration),
}

impl ReconcileOutcome {
    pub fn into_action(self, resync_period: Duration) -> Action {
        match self {
            ReconcileOutcome::Synced => Action::requeue(resync_period),
            ReconcileOutcome::AwaitChange => Action::await_change(),
            ReconcileOutcome::Requeue => Action::requeue(Duration::ZERO),
            ReconcileOutcome::RequeueAfter(d) => Action::requeue(d),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Synced => "synced",
            ReconcileOutcome::AwaitChange => "await_change",
            ReconcileOutcome::Requeue => "requeue",
            ReconcileOutcome::RequeueAfter(_) => "requeue_after",
        }
    }
}

/// Turn requeue sentinels anywhere in the error chain into an outcome, all
/// other errors are passed through.
pub fn handle_reconcile_error(
    result: Result<ReconcileOutcome, ControllerError>,
) -> Result<ReconcileOutcome, ControllerError> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) => match e.requeue_after() {
            Some(d) if d.is_zero() => {
                debug!("requeue needed: {}", e);
                Ok(ReconcileOutcome::Requeue)
            }
            Some(d) => {
                debug!("requeue needed after {:?}: {}", d, e);
                Ok(ReconcileOutcome::RequeueAfter(d))
            }
            None => Err(e),
        },
    }
}

/// Run `pass` bounded by the configured reconcile timeout.
pub(crate) async fn with_timeout<F>(config: &Config, pass: F) -> Result<ReconcileOutcome, ControllerError>
where
    F: Future<Output = Result<ReconcileOutcome, ControllerError>>,
{
    match tokio::time::timeout(config.reconcile_timeout, pass).await {
        Ok(result) => result,
        Err(_) => Err(ControllerError::Timeout(config.reconcile_timeout)),
    }
}

/// Region of `obj`: its region annotation, then the default region of its
/// namespace, then the controller region.
pub(crate) fn resolve_region<K: Resource>(runtime: &RuntimeContext, obj: &K) -> AwsRegion {
    if let Some(region) = obj.annotations().get(ANNOTATION_REGION).filter(|r| !r.is_empty()) {
        return AwsRegion(region.clone());
    }
    namespace_region(runtime, &obj.namespace().unwrap_or_default())
}

/// Default region of the namespace, falling back to the controller region.
pub(crate) fn namespace_region(runtime: &RuntimeContext, namespace: &str) -> AwsRegion {
    match runtime.caches.namespaces.get_default_region(namespace) {
        Some(region) => AwsRegion(region),
        None => runtime.config.region.clone(),
    }
}

/// Owner account of the namespace, falling back to the controller account.
pub(crate) fn namespace_account_id(runtime: &RuntimeContext, namespace: &str) -> AwsAccountId {
    match runtime.caches.namespaces.get_owner_account_id(namespace) {
        Some(account_id) => AwsAccountId(account_id),
        None => runtime.config.account_id.clone(),
    }
}

fn is_synced<R: AwsResource>(res: &R) -> bool {
    find_condition(res.conditions(), CONDITION_TYPE_RESOURCE_SYNCED).map_or(false, |c| c.is_true())
}

/// A Terminal condition for the current generation means nothing can be done
/// until a user edits the spec.
fn is_terminal_settled<R: AwsResource>(res: &R) -> bool {
    find_condition(res.conditions(), CONDITION_TYPE_TERMINAL)
        .map_or(false, |c| c.is_true() && c.observed_generation == res.meta().generation)
}

/// Reconciles custom resources of kind `R` with their backend resources.
pub struct Reconciler<R: AwsResource> {
    pub(crate) group_kind: GroupKind,
    pub(crate) factory: Arc<dyn AwsResourceManagerFactory<R>>,
    pub(crate) descriptor: Arc<dyn AwsResourceDescriptor<R>>,
    pub(crate) store: Arc<dyn ObjectStore<R>>,
    pub(crate) runtime: RuntimeContext,
}

impl<R: AwsResource> Reconciler<R> {
    pub fn new(
        factory: Arc<dyn AwsResourceManagerFactory<R>>,
        store: Arc<dyn ObjectStore<R>>,
        runtime: RuntimeContext,
    ) -> Self {
        let descriptor = factory.resource_descriptor();
        Self {
            group_kind: descriptor.group_kind(),
            factory,
            descriptor,
            store,
            runtime,
        }
    }

    pub fn group_kind(&self) -> &GroupKind {
        &self.group_kind
    }

    fn id(&self, res: &R) -> String {
        format!(
            "{} {}/{}",
            self.group_kind.kind,
            res.namespace().unwrap_or_default(),
            res.name_any()
        )
    }

    /// Reconcile the custom resource `namespace/name`.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome, ControllerError> {
        handle_reconcile_error(with_timeout(&self.runtime.config, self.reconcile_pass(namespace, name)).await)
    }

    async fn reconcile_pass(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome, ControllerError> {
        let Some(mut res) = self.store.get(namespace, name).await? else {
            debug!("{} {}/{} no longer exists", self.group_kind.kind, namespace, name);
            return Ok(ReconcileOutcome::AwaitChange);
        };
        // Deletion always proceeds to cleanup, terminal or not.
        if !res.is_being_deleted() {
            if is_terminal_settled(&res) {
                debug!("{} is terminal until its spec changes", self.id(&res));
                return Ok(ReconcileOutcome::AwaitChange);
            }
            res = self.clear_stale_terminal(res).await?;
        }
        let account_id = self.owner_account_id(&res);
        let region = resolve_region(&self.runtime, &res);
        let role_arn = self
            .runtime
            .caches
            .accounts
            .get_account_role_arn(account_id.as_str());
        debug!(
            "reconciling {} account={} region={} role={}",
            self.id(&res),
            account_id,
            region,
            role_arn.as_deref().unwrap_or("<none>")
        );
        let session = Session::new(&self.runtime.config, &region, role_arn.as_deref(), &self.group_kind)?;
        let rm = self.factory.manager_for(&session, &account_id, &region)?;
        if res.is_being_deleted() {
            self.cleanup(rm.as_ref(), &res).await?;
            return Ok(ReconcileOutcome::AwaitChange);
        }
        match self.sync(rm.as_ref(), &res, &account_id).await {
            Err(e) if e.is_terminal() => {
                self.set_terminal(&res, &e).await?;
                Ok(ReconcileOutcome::AwaitChange)
            }
            other => other,
        }
    }

    /// Owner account: recorded in the status, then the resource annotation,
    /// then the namespace annotation, then the controller account.
    fn owner_account_id(&self, res: &R) -> AwsAccountId {
        if let Some(account_id) = res.account_id() {
            return account_id;
        }
        if let Some(account_id) = res
            .annotations()
            .get(ANNOTATION_OWNER_ACCOUNT_ID)
            .filter(|a| !a.is_empty())
        {
            return AwsAccountId(account_id.clone());
        }
        namespace_account_id(&self.runtime, &res.namespace().unwrap_or_default())
    }

    async fn sync(
        &self,
        rm: &dyn AwsResourceManager<R>,
        current: &R,
        account_id: &AwsAccountId,
    ) -> Result<ReconcileOutcome, ControllerError> {
        // Both conditions are recomputed by this pass.
        let mut desired = current.clone();
        remove_condition(desired.conditions_mut(), CONDITION_TYPE_RESOURCE_SYNCED);
        remove_condition(desired.conditions_mut(), CONDITION_TYPE_TERMINAL);

        let (persisted, latest) = match rm.read_one(&desired).await {
            Ok(latest) => {
                let mut persisted = self.set_resource_managed(current).await?;
                if self.descriptor.equal(&desired, &latest)? {
                    debug!("{} has no differences", self.id(current));
                    (persisted, latest)
                } else {
                    let diff = self.descriptor.diff(&desired, &latest)?;
                    info!("{} differs from backend:\n{}", self.id(current), diff);
                    // Record the backend identity before mutating the backend.
                    let mut observed = persisted.clone();
                    *observed.resource_metadata_mut() = latest
                        .status()
                        .and_then(|s| s.ack_resource_metadata())
                        .cloned()
                        .unwrap_or_default();
                    observed.resource_metadata_mut().owner_account_id = Some(account_id.clone());
                    persisted = self.write_status(&persisted, &observed).await?;
                    let updated = rm.update(&desired, &latest, &diff).await?;
                    info!("updated {}", self.id(current));
                    (persisted, updated)
                }
            }
            Err(ControllerError::NotFound) => {
                if is_adopted(current) {
                    return Err(ControllerError::AdoptedResourceNotFound);
                }
                let created = rm.create(&desired).await?;
                info!(
                    "created {} arn={}",
                    self.id(current),
                    created.arn().unwrap_or("<unknown>")
                );
                let persisted = self.set_resource_managed(current).await?;
                (persisted, created)
            }
            Err(e) => return Err(e),
        };

        let mut latest = latest;
        self.merge_conditions(&persisted, &mut latest, account_id)?;
        self.write_status(&persisted, &latest).await?;
        if !is_synced(&latest) {
            return Err(requeue::needed_after_default(anyhow::anyhow!("{} is not yet synced", self.id(current))).into());
        }
        Ok(ReconcileOutcome::Synced)
    }

    /// Merge the conditions of `latest` into the persisted ones, keeping
    /// transition times of unchanged conditions. `ResourceSynced` is `True`
    /// unless the manager reported otherwise.
    fn merge_conditions(&self, persisted: &R, latest: &mut R, account_id: &AwsAccountId) -> Result<(), ControllerError> {
        let mut conditions: Vec<Condition> = persisted
            .conditions()
            .iter()
            .filter(|c| c.type_ != CONDITION_TYPE_TERMINAL)
            .cloned()
            .collect();
        let mut synced = None;
        for c in latest.conditions() {
            if c.type_ == CONDITION_TYPE_RESOURCE_SYNCED {
                synced = Some(c.clone());
            } else if c.type_ != CONDITION_TYPE_TERMINAL {
                set_condition(&mut conditions, c.clone());
            }
        }
        let synced =
            synced.unwrap_or_else(|| Condition::new(CONDITION_TYPE_RESOURCE_SYNCED, ConditionStatus::True));
        set_condition(&mut conditions, synced);
        *latest.conditions_mut() = conditions;
        let metadata = latest.resource_metadata_mut();
        if metadata.owner_account_id.is_none() {
            metadata.owner_account_id = Some(account_id.clone());
        }
        self.descriptor.update_cr_status(latest)?;
        Ok(())
    }

    /// Persist the status of `modified` if it differs from `original`.
    async fn write_status(&self, original: &R, modified: &R) -> Result<R, ControllerError> {
        let original_status = serde_json::to_value(original.status())?;
        let modified_status = serde_json::to_value(modified.status())?;
        if original_status == modified_status {
            return Ok(original.clone());
        }
        let patched = self.store.patch_status(original, modified).await?;
        debug!("patched status of {}", self.id(modified));
        Ok(patched)
    }

    /// Drop a Terminal condition recorded for an earlier generation.
    async fn clear_stale_terminal(&self, current: R) -> Result<R, ControllerError> {
        if find_condition(current.conditions(), CONDITION_TYPE_TERMINAL).is_none() {
            return Ok(current);
        }
        let mut modified = current.clone();
        remove_condition(modified.conditions_mut(), CONDITION_TYPE_TERMINAL);
        debug!("{} changed, retrying after a terminal error", self.id(&current));
        self.write_status(&current, &modified).await
    }

    async fn set_terminal(&self, current: &R, error: &ControllerError) -> Result<(), ControllerError> {
        info!("{} cannot be reconciled until its spec changes: {}", self.id(current), error);
        let message = error.to_string();
        let mut modified = current.clone();
        let generation = current.meta().generation;
        let conditions = modified.conditions_mut();
        set_condition(
            conditions,
            Condition::new(CONDITION_TYPE_TERMINAL, ConditionStatus::True)
                .with_message(message.clone())
                .with_observed_generation(generation),
        );
        set_condition(
            conditions,
            Condition::new(CONDITION_TYPE_RESOURCE_SYNCED, ConditionStatus::False).with_message(message),
        );
        self.write_status(current, &modified).await?;
        Ok(())
    }

    async fn set_resource_managed(&self, current: &R) -> Result<R, ControllerError> {
        if self.descriptor.is_managed(current) {
            return Ok(current.clone());
        }
        let mut modified = current.clone();
        self.descriptor.mark_managed(&mut modified);
        let patched = self.store.patch(current, &modified).await?;
        debug!("added finalizer to {}", self.id(current));
        Ok(patched)
    }

    async fn set_resource_unmanaged(&self, current: &R) -> Result<(), ControllerError> {
        let mut modified = current.clone();
        self.descriptor.mark_unmanaged(&mut modified);
        match self.store.patch(current, &modified).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete the backend resource and release the finalizer. Calling it for
    /// an already cleaned up resource does nothing.
    async fn cleanup(&self, rm: &dyn AwsResourceManager<R>, current: &R) -> Result<(), ControllerError> {
        if !self.descriptor.is_managed(current) {
            debug!("{} is not managed, nothing to clean up", self.id(current));
            return Ok(());
        }
        match rm.read_one(current).await {
            Ok(latest) => {
                rm.delete(&latest).await?;
                info!(
                    "deleted {} arn={}",
                    self.id(current),
                    latest.arn().unwrap_or("<unknown>")
                );
            }
            Err(ControllerError::NotFound) => {
                debug!("backend resource of {} is already gone", self.id(current));
            }
            Err(e) => return Err(e),
        }
        self.set_resource_unmanaged(current).await
    }

    /// Controller triggers this whenever our main object changed
    async fn reconcile_object(object: Arc<R>, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        let start = Instant::now();
        let namespace = object.namespace().unwrap_or_default();
        let result = ctx.reconcile(&namespace, &object.name_any()).await;
        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        ctx.runtime
            .metrics
            .record_reconcile(&ctx.group_kind, label, start.elapsed());
        result.map(|o| o.into_action(ctx.runtime.config.resync_period))
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(_object: Arc<R>, error: &ControllerError, ctx: Arc<Self>) -> Action {
        ctx.runtime.metrics.record_reconcile_error(&ctx.group_kind);
        if error.is_temporary() {
            Action::requeue(Duration::from_secs(30))
        } else {
            Action::requeue(Duration::from_secs(300))
        }
    }

    /// Run a controller for all objects visible through `api`.
    pub fn start(self: Arc<Self>, api: Api<R>) -> impl Future<Output = ()> + Send + 'static {
        let kind = self.group_kind.to_string();
        info!("starting controller for {}", kind);
        Controller::new(api, WatcherConfig::default())
            .run(Self::reconcile_object, Self::error_policy, self)
            .for_each(move |res| {
                let kind = kind.clone();
                async move {
                    match res {
                        Ok(o) => debug!("reconciled {:?}", o),
                        Err(e) => match e {
                            a @ kube_runtime::controller::Error::QueueError { .. } => {
                                debug!("{} reconcile failed: {:?}", kind, a);
                                // Slow down on errors caused by missing CRDs or permissions.
                                sleep(Duration::from_secs(30)).await;
                            }
                            a @ kube_runtime::controller::Error::ObjectNotFound { .. } => {
                                debug!("{} reconcile failed: {:?}", kind, a);
                            }
                            e => warn!("{} reconcile failed: {:?}", kind, e),
                        },
                    }
                }
            })
    }
}
