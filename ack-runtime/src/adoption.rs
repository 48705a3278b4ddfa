//! Materializes custom resources for existing backend resources.

use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use ack_runtime_apis::{
    ANNOTATION_REGION, AdoptedResource, AdoptionStatus, AwsRegion, Condition, ConditionStatus,
    CONDITION_TYPE_ADOPTED, set_condition,
};
use async_trait::async_trait;
use futures::StreamExt;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::{
    controller::{Action, Controller},
    watcher::Config as WatcherConfig,
};
use tokio::time::sleep;

use crate::{
    descriptor::is_adopted,
    errors::ControllerError,
    reconciler::{
        ReconcileOutcome, Reconciler, RuntimeContext, handle_reconcile_error, namespace_account_id,
        namespace_region, with_timeout,
    },
    session::Session,
    store::ObjectStore,
    types::{AwsResource, GroupKind},
};

/// Adopts backend resources of one kind.
#[async_trait]
pub trait Adopter: Send + Sync {
    fn group_kind(&self) -> GroupKind;

    /// Create the target custom resource of `adopted` from the backend
    /// resource it identifies.
    async fn adopt(&self, adopted: &AdoptedResource) -> Result<(), ControllerError>;
}

#[async_trait]
impl<R: AwsResource> Adopter for Reconciler<R> {
    fn group_kind(&self) -> GroupKind {
        self.group_kind.clone()
    }

    async fn adopt(&self, adopted: &AdoptedResource) -> Result<(), ControllerError> {
        let target = adopted.spec.kubernetes.metadata.clone().unwrap_or_default();
        let namespace = target
            .namespace
            .clone()
            .or_else(|| adopted.namespace())
            .unwrap_or_default();
        let name = target.name.clone().unwrap_or_else(|| adopted.name_any());

        if let Some(existing) = self.store.get(&namespace, &name).await? {
            if is_adopted(&existing) {
                debug!("{} {}/{} is already adopted", self.group_kind.kind, namespace, name);
                return Ok(());
            }
            return Err(ControllerError::terminal(format!(
                "{} {}/{} already exists and is not adopted",
                self.group_kind.kind, namespace, name
            )));
        }

        let account_id = namespace_account_id(&self.runtime, &namespace);
        let region = match adopted.annotations().get(ANNOTATION_REGION).filter(|r| !r.is_empty()) {
            Some(region) => AwsRegion(region.clone()),
            None => namespace_region(&self.runtime, &namespace),
        };
        let role_arn = self
            .runtime
            .caches
            .accounts
            .get_account_role_arn(account_id.as_str());
        let session = Session::new(&self.runtime.config, &region, role_arn.as_deref(), &self.group_kind)?;
        let rm = self.factory.manager_for(&session, &account_id, &region)?;

        let mut obj = self.descriptor.empty_object().within(&namespace);
        obj.metadata.name = Some(name.clone());
        obj.metadata.labels = target.labels;
        obj.metadata.annotations = target.annotations;
        let mut desired = self.descriptor.resource_from_object(obj)?;
        desired.set_identifiers(&adopted.spec.aws)?;

        let mut res = match rm.read_one(&desired).await {
            Ok(latest) => latest,
            Err(ControllerError::NotFound) => return Err(ControllerError::AdoptedResourceNotFound),
            Err(e) => return Err(e),
        };
        // Only metadata we set ourselves goes into the new object.
        *res.meta_mut() = desired.meta().clone();
        self.descriptor.mark_adopted(&mut res);
        self.descriptor.mark_managed(&mut res);
        res.resource_metadata_mut().owner_account_id = Some(account_id);

        let created = self.store.create(&res).await?;
        let mut with_status = res;
        *with_status.meta_mut() = created.meta().clone();
        self.store.patch_status(&created, &with_status).await?;
        info!(
            "adopted {} as {} {}/{}",
            with_status.arn().unwrap_or("<unknown>"),
            self.group_kind.kind,
            namespace,
            name
        );
        Ok(())
    }
}

/// Reconciles `AdoptedResource` objects, each is acted upon once.
pub struct AdoptionReconciler {
    store: Arc<dyn ObjectStore<AdoptedResource>>,
    adopters: HashMap<String, Arc<dyn Adopter>>,
    runtime: RuntimeContext,
}

impl AdoptionReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore<AdoptedResource>>,
        adopters: Vec<Arc<dyn Adopter>>,
        runtime: RuntimeContext,
    ) -> Self {
        let adopters = adopters
            .into_iter()
            .map(|a| (a.group_kind().to_string(), a))
            .collect();
        Self {
            store,
            adopters,
            runtime,
        }
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome, ControllerError> {
        handle_reconcile_error(with_timeout(&self.runtime.config, self.reconcile_pass(namespace, name)).await)
    }

    async fn reconcile_pass(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome, ControllerError> {
        let Some(adopted) = self.store.get(namespace, name).await? else {
            return Ok(ReconcileOutcome::AwaitChange);
        };
        // Deleting the request leaves the target and the backend untouched.
        if adopted.meta().deletion_timestamp.is_some() || adopted.is_adopted() {
            return Ok(ReconcileOutcome::AwaitChange);
        }
        let group_kind = adopted.spec.kubernetes.group_kind();
        let result = match self.adopters.get(&group_kind) {
            Some(adopter) => adopter.adopt(&adopted).await,
            None => Err(ControllerError::ResourceManagerFactoryNotFound(group_kind)),
        };
        match result {
            Ok(()) => {
                self.set_adoption_status(&adopted, AdoptionStatus::Adopted, None)
                    .await?;
                Ok(ReconcileOutcome::AwaitChange)
            }
            Err(e) if e.is_terminal() => {
                info!("adoption {}/{} failed: {}", namespace, name, e);
                self.set_adoption_status(&adopted, AdoptionStatus::Failed, Some(e.to_string()))
                    .await?;
                Ok(ReconcileOutcome::AwaitChange)
            }
            Err(e) => Err(e),
        }
    }

    async fn set_adoption_status(
        &self,
        adopted: &AdoptedResource,
        status: AdoptionStatus,
        message: Option<String>,
    ) -> Result<(), ControllerError> {
        let mut modified = adopted.clone();
        let s = modified.status.get_or_insert_with(Default::default);
        s.adoption_status = Some(status);
        let condition = match message {
            Some(message) => Condition::new(CONDITION_TYPE_ADOPTED, ConditionStatus::False)
                .with_reason("AdoptionFailed")
                .with_message(message),
            None => Condition::new(CONDITION_TYPE_ADOPTED, ConditionStatus::True),
        };
        set_condition(&mut s.conditions, condition);
        self.store.patch_status(adopted, &modified).await?;
        Ok(())
    }

    async fn reconcile_object(object: Arc<AdoptedResource>, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        let start = Instant::now();
        let namespace = object.namespace().unwrap_or_default();
        let result = ctx.reconcile(&namespace, &object.name_any()).await;
        let group_kind = GroupKind::of::<AdoptedResource>();
        let label = match &result {
            Ok(_) => "adopted",
            Err(_) => "error",
        };
        ctx.runtime.metrics.record_reconcile(&group_kind, label, start.elapsed());
        result.map(|o| o.into_action(ctx.runtime.config.resync_period))
    }

    fn error_policy(_object: Arc<AdoptedResource>, error: &ControllerError, ctx: Arc<Self>) -> Action {
        ctx.runtime
            .metrics
            .record_reconcile_error(&GroupKind::of::<AdoptedResource>());
        if error.is_temporary() {
            Action::requeue(Duration::from_secs(30))
        } else {
            Action::requeue(Duration::from_secs(300))
        }
    }

    pub fn start(self: Arc<Self>, api: Api<AdoptedResource>) -> impl Future<Output = ()> + Send + 'static {
        info!("starting adoption controller");
        Controller::new(api, WatcherConfig::default())
            .run(Self::reconcile_object, Self::error_policy, self)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("reconciled {:?}", o),
                    Err(e) => match e {
                        a @ kube_runtime::controller::Error::QueueError { .. } => {
                            debug!("adoption reconcile failed: {:?}", a);
                            sleep(Duration::from_secs(30)).await;
                        }
                        a @ kube_runtime::controller::Error::ObjectNotFound { .. } => {
                            debug!("adoption reconcile failed: {:?}", a);
                        }
                        e => warn!("adoption reconcile failed: {:?}", e),
                    },
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compare::Reporter,
        descriptor::ResourceDescriptor,
        testing::{MemoryStore, book, runtime},
        types::{AwsResourceDescriptor, AwsResourceManager, AwsResourceManagerFactory},
    };
    use ack_runtime_apis::{
        AdoptedResourceSpec, AwsAccountId, AwsIdentifiers, PartialObjectMeta, TargetKubernetesResource,
        bookstore::Book, find_condition,
    };

    /// Backend knowing a single book named `dune`.
    struct DuneManager;

    #[async_trait]
    impl AwsResourceManager<Book> for DuneManager {
        async fn read_one(&self, res: &Book) -> Result<Book, ControllerError> {
            if res.spec.name.as_deref() != Some("dune") {
                return Err(ControllerError::NotFound);
            }
            let mut latest = res.clone();
            latest.spec.title = Some("Dune".to_string());
            latest.spec.author = Some("Frank Herbert".to_string());
            latest.resource_metadata_mut().arn = Some(self.arn_from_name("dune"));
            Ok(latest)
        }

        async fn create(&self, _res: &Book) -> Result<Book, ControllerError> {
            Err(ControllerError::NotImplemented)
        }

        async fn update(&self, _desired: &Book, _latest: &Book, _diff: &Reporter) -> Result<Book, ControllerError> {
            Err(ControllerError::NotImplemented)
        }

        async fn delete(&self, _res: &Book) -> Result<(), ControllerError> {
            Err(ControllerError::NotImplemented)
        }

        fn arn_from_name(&self, name: &str) -> String {
            format!("arn:aws:bookstore:us-west-2:012345678912:book/{}", name)
        }
    }

    struct DuneFactory;

    impl AwsResourceManagerFactory<Book> for DuneFactory {
        fn resource_descriptor(&self) -> Arc<dyn AwsResourceDescriptor<Book>> {
            Arc::new(ResourceDescriptor::<Book>::new())
        }

        fn manager_for(
            &self,
            _session: &Session,
            _account_id: &AwsAccountId,
            _region: &AwsRegion,
        ) -> Result<Arc<dyn AwsResourceManager<Book>>, ControllerError> {
            Ok(Arc::new(DuneManager))
        }
    }

    struct Fixture {
        books: Arc<MemoryStore<Book>>,
        requests: Arc<MemoryStore<AdoptedResource>>,
        reconciler: AdoptionReconciler,
    }

    fn fixture() -> Fixture {
        let books = Arc::new(MemoryStore::<Book>::new());
        let requests = Arc::new(MemoryStore::<AdoptedResource>::new());
        let rt = runtime();
        let book_reconciler: Arc<dyn Adopter> =
            Arc::new(Reconciler::<Book>::new(Arc::new(DuneFactory), books.clone(), rt.clone()));
        let reconciler = AdoptionReconciler::new(requests.clone(), vec![book_reconciler], rt);
        Fixture {
            books,
            requests,
            reconciler,
        }
    }

    fn request(name: &str, kind: &str, backend_name: &str) -> AdoptedResource {
        let mut r = AdoptedResource::new(
            name,
            AdoptedResourceSpec {
                kubernetes: TargetKubernetesResource {
                    group: "bookstore.services.k8s.aws".to_string(),
                    kind: kind.to_string(),
                    metadata: Some(PartialObjectMeta {
                        name: Some("dune".to_string()),
                        labels: Some([("team".to_string(), "books".to_string())].into()),
                        ..Default::default()
                    }),
                },
                aws: AwsIdentifiers {
                    name_or_id: Some(backend_name.to_string()),
                    ..Default::default()
                },
            },
        );
        r.metadata.namespace = Some("default".to_string());
        r
    }

    fn adoption_state(f: &Fixture, name: &str) -> (Option<AdoptionStatus>, Option<Condition>) {
        let r = f.requests.object("default", name).unwrap();
        let status = r.status.unwrap_or_default();
        (
            status.adoption_status,
            find_condition(&status.conditions, CONDITION_TYPE_ADOPTED).cloned(),
        )
    }

    #[tokio::test]
    async fn adopts_existing_backend_resource() {
        let f = fixture();
        f.requests.insert(request("adopt-dune", "Book", "dune"));
        let outcome = f.reconciler.reconcile("default", "adopt-dune").await.unwrap();
        assert_eq!(ReconcileOutcome::AwaitChange, outcome);

        let b = f.books.object("default", "dune").unwrap();
        assert!(is_adopted(&b));
        assert_eq!(
            vec!["finalizers.bookstore.services.k8s.aws/Book".to_string()],
            b.finalizers().to_vec()
        );
        assert_eq!(Some("books"), b.labels().get("team").map(String::as_str));
        assert_eq!(Some("Dune".to_string()), b.spec.title);
        assert_eq!(
            Some("arn:aws:bookstore:us-west-2:012345678912:book/dune"),
            b.arn()
        );
        assert_eq!(Some(AwsAccountId::from("012345678912")), b.account_id());

        let (status, condition) = adoption_state(&f, "adopt-dune");
        assert_eq!(Some(AdoptionStatus::Adopted), status);
        assert!(condition.unwrap().is_true());

        // Acted upon once.
        f.books.clear_writes();
        f.requests.clear_writes();
        f.reconciler.reconcile("default", "adopt-dune").await.unwrap();
        assert!(f.books.writes().is_empty());
        assert!(f.requests.writes().is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_fails() {
        let f = fixture();
        f.requests.insert(request("adopt-shelf", "Shelf", "dune"));
        f.reconciler.reconcile("default", "adopt-shelf").await.unwrap();
        let (status, condition) = adoption_state(&f, "adopt-shelf");
        assert_eq!(Some(AdoptionStatus::Failed), status);
        assert_eq!(
            Some("no resource manager factory registered for Shelf.bookstore.services.k8s.aws"),
            condition.unwrap().message.as_deref()
        );
    }

    #[tokio::test]
    async fn missing_backend_resource_fails() {
        let f = fixture();
        f.requests.insert(request("adopt-emma", "Book", "emma"));
        f.reconciler.reconcile("default", "adopt-emma").await.unwrap();
        assert!(f.books.object("default", "dune").is_none());
        let (status, condition) = adoption_state(&f, "adopt-emma");
        assert_eq!(Some(AdoptionStatus::Failed), status);
        assert_eq!(
            Some("adopted resource not found"),
            condition.unwrap().message.as_deref()
        );
    }

    #[tokio::test]
    async fn existing_target() {
        let f = fixture();
        f.books.insert(book("dune", "Dune", "Frank Herbert"));
        f.requests.insert(request("adopt-dune", "Book", "dune"));
        f.reconciler.reconcile("default", "adopt-dune").await.unwrap();
        assert_eq!(Some(AdoptionStatus::Failed), adoption_state(&f, "adopt-dune").0);

        let f = fixture();
        let mut b = book("dune", "Dune", "Frank Herbert");
        ResourceDescriptor::<Book>::new().mark_adopted(&mut b);
        f.books.insert(b);
        f.requests.insert(request("adopt-dune", "Book", "dune"));
        f.reconciler.reconcile("default", "adopt-dune").await.unwrap();
        assert_eq!(Some(AdoptionStatus::Adopted), adoption_state(&f, "adopt-dune").0);
        assert!(f.books.writes().is_empty());
    }

    #[tokio::test]
    async fn deleted_request_is_ignored() {
        let f = fixture();
        let mut r = request("adopt-dune", "Book", "dune");
        r.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            k8s_openapi::chrono::Utc::now(),
        ));
        f.requests.insert(r);
        f.reconciler.reconcile("default", "adopt-dune").await.unwrap();
        assert!(f.books.object("default", "dune").is_none());
        assert!(f.requests.writes().is_empty());
    }
}
