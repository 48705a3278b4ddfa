//! Bookstore service API.

use std::{collections::BTreeMap, sync::Mutex};

use ack_runtime_apis::{AwsAccountId, AwsRegion};
use async_trait::async_trait;
use k8s_openapi::chrono::{SecondsFormat, Utc};
use serde::Deserialize;

use crate::errors::BackendError;

pub const NOT_FOUND: &str = "NotFoundException";
const CONFLICT: &str = "ConflictException";
const VALIDATION: &str = "ValidationException";

/// A book as returned by the bookstore service.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BookData {
    pub name: String,
    pub arn: String,
    pub title: String,
    pub author: String,
    pub create_time: String,
    pub tags: BTreeMap<String, String>,
}

#[async_trait]
pub trait BookstoreApi: Send + Sync {
    async fn describe_book(&self, name: &str) -> Result<BookData, BackendError>;

    async fn create_book(
        &self,
        name: &str,
        title: &str,
        author: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<BookData, BackendError>;

    /// Create a book from a JSON document `{"title": .., "author": ..}`.
    async fn import_book(
        &self,
        name: &str,
        document: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<BookData, BackendError>;

    async fn update_book(&self, name: &str, title: &str, author: &str) -> Result<BookData, BackendError>;

    async fn tag_resource(&self, arn: &str, tags: &BTreeMap<String, String>) -> Result<(), BackendError>;

    async fn untag_resource(&self, arn: &str, keys: &[String]) -> Result<(), BackendError>;

    async fn delete_book(&self, name: &str) -> Result<(), BackendError>;
}

#[derive(Deserialize)]
struct ImportDocument {
    title: String,
    author: String,
}

/// Bookstore kept in memory, recording the operations it serves.
pub struct MemoryBookstore {
    region: AwsRegion,
    account_id: AwsAccountId,
    books: Mutex<BTreeMap<String, BookData>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<BTreeMap<String, BackendError>>,
}

impl MemoryBookstore {
    pub fn new(region: AwsRegion, account_id: AwsAccountId) -> Self {
        Self {
            region,
            account_id,
            books: Default::default(),
            calls: Default::default(),
            failures: Default::default(),
        }
    }

    /// Operations served so far, e.g. `CreateBook`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Fail the next call of `operation` with `error`.
    pub fn fail_next(&self, operation: &str, error: BackendError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operation.to_string(), error);
    }

    pub fn book(&self, name: &str) -> Option<BookData> {
        self.books
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn call(&self, operation: &str) -> Result<(), BackendError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(operation.to_string());
        match self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(operation)
        {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn arn(&self, name: &str) -> String {
        format!("arn:aws:bookstore:{}:{}:book/{}", self.region, self.account_id, name)
    }

    fn not_found(name: &str) -> BackendError {
        BackendError::new(NOT_FOUND, format!("book {} does not exist", name), Some(404))
    }

    fn insert(&self, name: &str, title: &str, author: &str, tags: &BTreeMap<String, String>) -> Result<BookData, BackendError> {
        let mut books = self.books.lock().unwrap_or_else(|e| e.into_inner());
        if books.contains_key(name) {
            return Err(BackendError::new(CONFLICT, format!("book {} already exists", name), Some(409)));
        }
        let book = BookData {
            name: name.to_string(),
            arn: self.arn(name),
            title: title.to_string(),
            author: author.to_string(),
            create_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            tags: tags.clone(),
        };
        books.insert(name.to_string(), book.clone());
        Ok(book)
    }

    fn with_book<T, F>(&self, arn_or_name: &str, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&mut BookData) -> T,
    {
        let mut books = self.books.lock().unwrap_or_else(|e| e.into_inner());
        books
            .values_mut()
            .find(|b| b.name == arn_or_name || b.arn == arn_or_name)
            .map(f)
            .ok_or_else(|| Self::not_found(arn_or_name))
    }
}

#[async_trait]
impl BookstoreApi for MemoryBookstore {
    async fn describe_book(&self, name: &str) -> Result<BookData, BackendError> {
        self.call("DescribeBook")?;
        self.with_book(name, |b| b.clone())
    }

    async fn create_book(
        &self,
        name: &str,
        title: &str,
        author: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<BookData, BackendError> {
        self.call("CreateBook")?;
        self.insert(name, title, author, tags)
    }

    async fn import_book(
        &self,
        name: &str,
        document: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<BookData, BackendError> {
        self.call("ImportBook")?;
        let doc: ImportDocument = serde_json::from_str(document).map_err(|e| {
            BackendError::new(VALIDATION, format!("invalid import document: {}", e), Some(400))
        })?;
        self.insert(name, &doc.title, &doc.author, tags)
    }

    async fn update_book(&self, name: &str, title: &str, author: &str) -> Result<BookData, BackendError> {
        self.call("UpdateBook")?;
        self.with_book(name, |b| {
            b.title = title.to_string();
            b.author = author.to_string();
            b.clone()
        })
    }

    async fn tag_resource(&self, arn: &str, tags: &BTreeMap<String, String>) -> Result<(), BackendError> {
        self.call("TagResource")?;
        self.with_book(arn, |b| b.tags.extend(tags.clone()))
    }

    async fn untag_resource(&self, arn: &str, keys: &[String]) -> Result<(), BackendError> {
        self.call("UntagResource")?;
        self.with_book(arn, |b| b.tags.retain(|k, _| !keys.contains(k)))
    }

    async fn delete_book(&self, name: &str) -> Result<(), BackendError> {
        self.call("DeleteBook")?;
        let mut books = self.books.lock().unwrap_or_else(|e| e.into_inner());
        books.remove(name).map(|_| ()).ok_or_else(|| Self::not_found(name))
    }
}
