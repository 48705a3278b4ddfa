use std::{collections::BTreeMap, sync::Arc};

use ack_runtime_apis::{AwsAccountId, AwsRegion, bookstore::Book};
use async_trait::async_trait;

use super::{
    book_name,
    sdk::{BookData, BookstoreApi, NOT_FOUND},
};
use crate::{
    compare::Reporter,
    descriptor::ResourceDescriptor,
    errors::{BackendError, ControllerError},
    hooks::{PlanMode, UpdatePlan, forbid_with, require_fields, three_way_delta},
    metrics::Metrics,
    session::Session,
    tags::{get_default_tags, merge_tags, strip_default_tags},
    types::{AwsResource, AwsResourceDescriptor, AwsResourceManager, AwsResourceManagerFactory, ManagerCache},
};

/// Builds a bookstore client for a session and owner account.
pub type Connect =
    Box<dyn Fn(&Session, &AwsAccountId) -> Result<Arc<dyn BookstoreApi>, ControllerError> + Send + Sync>;

fn into_controller_error(e: BackendError) -> ControllerError {
    if e.code == NOT_FOUND {
        ControllerError::NotFound
    } else {
        ControllerError::Backend(e)
    }
}

/// Groups of fields updated by separate calls, in call order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BookUpdate {
    Details,
    Tags,
}

fn tags_of(book: &Book) -> BTreeMap<String, String> {
    book.spec.tags.clone().unwrap_or_default()
}

fn update_plan() -> UpdatePlan<Book, BookUpdate> {
    UpdatePlan::new(PlanMode::All)
        .step(BookUpdate::Details, |desired: &Book, _: &Book, diff: &Reporter| {
            desired.spec.import_document.is_none() && (diff.has_changed(".title") || diff.has_changed(".author"))
        })
        .step(BookUpdate::Tags, |_: &Book, _: &Book, diff: &Reporter| diff.has_changed(".tags"))
}

pub struct BookManager {
    api: Arc<dyn BookstoreApi>,
    account_id: AwsAccountId,
    region: AwsRegion,
    resource_tags: Vec<String>,
    metrics: Arc<Metrics>,
    plan: UpdatePlan<Book, BookUpdate>,
}

impl BookManager {
    pub fn new(
        api: Arc<dyn BookstoreApi>,
        account_id: AwsAccountId,
        region: AwsRegion,
        resource_tags: Vec<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            api,
            account_id,
            region,
            resource_tags,
            metrics,
            plan: update_plan(),
        }
    }

    fn record<T>(
        &self,
        op_type: &'static str,
        op_id: &'static str,
        result: Result<T, BackendError>,
    ) -> Result<T, ControllerError> {
        let result = result.map_err(into_controller_error);
        self.metrics.record_api_call(op_type, op_id, &result);
        result
    }

    /// Copy what the backend reports onto `res`. Imported books keep their
    /// spec, their title and author come from the import document.
    fn set_output(&self, res: &Book, data: BookData) -> Book {
        let mut latest = res.clone();
        if latest.spec.import_document.is_none() {
            latest.spec.title = Some(data.title);
            latest.spec.author = Some(data.author);
        }
        let tags = strip_default_tags(data.tags, res.spec.tags.as_ref(), &self.resource_tags);
        latest.spec.tags = if tags.is_empty() { None } else { Some(tags) };
        latest.resource_metadata_mut().arn = Some(data.arn);
        latest.status_mut().create_time = Some(data.create_time);
        latest
    }

    async fn apply(&self, step: BookUpdate, desired: &Book, mut current: Book) -> Result<Book, ControllerError> {
        let name = book_name(desired);
        match step {
            BookUpdate::Details => {
                let title = desired.spec.title.clone().unwrap_or_default();
                let author = desired.spec.author.clone().unwrap_or_default();
                let data = self.record(
                    "UPDATE",
                    "UpdateBook",
                    self.api.update_book(&name, &title, &author).await,
                )?;
                current.spec.title = Some(data.title);
                current.spec.author = Some(data.author);
            }
            BookUpdate::Tags => {
                let arn = current
                    .arn()
                    .map(str::to_string)
                    .unwrap_or_else(|| self.arn_from_name(&name));
                let delta = three_way_delta(&tags_of(desired), &tags_of(&current));
                if !delta.removed.is_empty() {
                    let keys: Vec<String> = delta.removed.into_iter().collect();
                    self.record("UPDATE", "UntagResource", self.api.untag_resource(&arn, &keys).await)?;
                }
                let mut tags = delta.added;
                tags.extend(delta.modified);
                if !tags.is_empty() {
                    self.record("UPDATE", "TagResource", self.api.tag_resource(&arn, &tags).await)?;
                }
                current.spec.tags = desired.spec.tags.clone();
            }
        }
        debug!("applied {:?} update to book {}", step, name);
        Ok(current)
    }
}

#[async_trait]
impl AwsResourceManager<Book> for BookManager {
    async fn read_one(&self, res: &Book) -> Result<Book, ControllerError> {
        let name = book_name(res);
        let data = self.record("READ_ONE", "DescribeBook", self.api.describe_book(&name).await)?;
        Ok(self.set_output(res, data))
    }

    async fn create(&self, res: &Book) -> Result<Book, ControllerError> {
        let name = book_name(res);
        let tags = merge_tags(get_default_tags(&self.resource_tags, res), res.spec.tags.as_ref());
        let spec = &res.spec;
        let data = match spec.import_document.as_deref().filter(|d| !d.is_empty()) {
            Some(document) => {
                forbid_with(
                    "importDocument",
                    &[("title", spec.title.is_some()), ("author", spec.author.is_some())],
                )?;
                self.record("CREATE", "ImportBook", self.api.import_book(&name, document, &tags).await)?
            }
            None => {
                require_fields(
                    &[("title", spec.title.is_some()), ("author", spec.author.is_some())],
                    "without 'importDocument'",
                )?;
                let title = spec.title.as_deref().unwrap_or_default();
                let author = spec.author.as_deref().unwrap_or_default();
                self.record(
                    "CREATE",
                    "CreateBook",
                    self.api.create_book(&name, title, author, &tags).await,
                )?
            }
        };
        Ok(self.set_output(res, data))
    }

    async fn update(&self, desired: &Book, latest: &Book, diff: &Reporter) -> Result<Book, ControllerError> {
        debug!("updating book {}, changed: {}", book_name(desired), diff.len());
        let updated = self
            .plan
            .run(desired, latest.clone(), diff, |step, current| self.apply(step, desired, current))
            .await?;
        Ok(updated)
    }

    async fn delete(&self, res: &Book) -> Result<(), ControllerError> {
        let name = book_name(res);
        match self.record("DELETE", "DeleteBook", self.api.delete_book(&name).await) {
            Err(ControllerError::NotFound) => Ok(()),
            other => other,
        }
    }

    fn arn_from_name(&self, name: &str) -> String {
        format!("arn:aws:bookstore:{}:{}:book/{}", self.region, self.account_id, name)
    }
}

/// Hands out one [`BookManager`] per account and region.
pub struct BookManagerFactory {
    connect: Connect,
    resource_tags: Vec<String>,
    metrics: Arc<Metrics>,
    descriptor: Arc<ResourceDescriptor<Book>>,
    managers: ManagerCache<Book>,
}

impl BookManagerFactory {
    pub fn new(connect: Connect, resource_tags: Vec<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            connect,
            resource_tags,
            metrics,
            descriptor: Arc::new(ResourceDescriptor::new()),
            managers: ManagerCache::new(),
        }
    }
}

impl AwsResourceManagerFactory<Book> for BookManagerFactory {
    fn resource_descriptor(&self) -> Arc<dyn AwsResourceDescriptor<Book>> {
        self.descriptor.clone()
    }

    fn manager_for(
        &self,
        session: &Session,
        account_id: &AwsAccountId,
        region: &AwsRegion,
    ) -> Result<Arc<dyn AwsResourceManager<Book>>, ControllerError> {
        self.managers.get_or_try_insert(account_id, region, || {
            let api = (self.connect)(session, account_id)?;
            Ok(Arc::new(BookManager::new(
                api,
                account_id.clone(),
                region.clone(),
                self.resource_tags.clone(),
                self.metrics.clone(),
            )))
        })
    }
}
